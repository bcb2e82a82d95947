//! In-memory diagnostic log for protocol and ordering anomalies.
//!
//! Every record is also emitted through `tracing`, so anomalies show up in
//! logs for operators and can be asserted on directly in tests.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Records kept before the oldest are discarded.
const MAX_RECORDS: usize = 256;

/// Category of an anomaly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticKind {
    /// `update_entry` ran against a thread with no cache entry.
    UpdateWithoutEntry,
    /// A content event arrived for a thread that is missing, not streaming,
    /// or already errored.
    StaleEvent,
    /// An `ai_tool_chunk` continuation arrived with no tool call to extend.
    OrphanToolArgs,
    /// An event carried no thread id and none could be inferred.
    MissingThreadId,
    /// The server resolved a different thread id than the one requested.
    ThreadIdMismatch,
    /// A frame could not be decoded.
    MalformedFrame,
    /// A frame carried an event type this client does not know.
    UnknownEvent,
    /// A cache updater failed and the cache was left unchanged.
    UpdateRejected,
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::UpdateWithoutEntry => "update-without-entry",
            Self::StaleEvent => "stale-event",
            Self::OrphanToolArgs => "orphan-tool-args",
            Self::MissingThreadId => "missing-thread-id",
            Self::ThreadIdMismatch => "thread-id-mismatch",
            Self::MalformedFrame => "malformed-frame",
            Self::UnknownEvent => "unknown-event",
            Self::UpdateRejected => "update-rejected",
        };
        f.write_str(label)
    }
}

/// One recorded anomaly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub thread_id: Option<String>,
    pub detail: String,
}

/// Shared, cloneable diagnostic sink.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    records: Arc<Mutex<VecDeque<Diagnostic>>>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an anomaly and emit it as a `warn` event.
    pub fn record(&self, kind: DiagnosticKind, thread_id: Option<&str>, detail: impl Into<String>) {
        let detail = detail.into();
        tracing::warn!(kind = %kind, thread_id = thread_id.unwrap_or("-"), "{detail}");
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        if records.len() == MAX_RECORDS {
            records.pop_front();
        }
        records.push_back(Diagnostic {
            kind,
            thread_id: thread_id.map(str::to_string),
            detail,
        });
    }

    /// Copy of all retained records, oldest first.
    pub fn snapshot(&self) -> Vec<Diagnostic> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn count(&self, kind: DiagnosticKind) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|record| record.kind == kind)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    pub fn clear(&self) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
