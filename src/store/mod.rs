//! Shared client state driven by the stream engine and read by frontends.
//!
//! - `thread_cache`: per-thread messages and run status
//! - `session_registry`: sessions, their thread lists, backend-confirmed threads
//! - `error_slot`: the single user-facing error value
//!
//! All three are cheap-to-clone handles publishing snapshots over
//! `tokio::sync::watch`, so frontends react to changes instead of polling.

mod error_slot;
mod session_registry;
mod thread_cache;

pub use error_slot::ErrorSlot;
pub use session_registry::{SessionRegistry, SessionState, UiSession};
pub use thread_cache::{ThreadCache, ThreadMap, ThreadPatch};

use crate::diagnostics::Diagnostics;

/// Application context: every shared store, constructed once and handed to
/// whatever drives runs and renders state.
#[derive(Debug, Clone)]
pub struct Stores {
    pub threads: ThreadCache,
    pub sessions: SessionRegistry,
    pub errors: ErrorSlot,
    pub diagnostics: Diagnostics,
}

impl Stores {
    /// Empty stores sharing one diagnostic log.
    pub fn new() -> Self {
        Self::with_sessions(SessionRegistry::new())
    }

    /// Empty thread cache and error slot around an existing registry
    /// (e.g. one restored from disk).
    pub fn with_sessions(sessions: SessionRegistry) -> Self {
        let diagnostics = Diagnostics::new();
        Self {
            threads: ThreadCache::new(diagnostics.clone()),
            sessions,
            errors: ErrorSlot::new(),
            diagnostics,
        }
    }

    /// Reset everything to the freshly constructed state.
    pub fn clear_all(&self) {
        self.threads.clear_all();
        self.sessions.clear_all();
        self.errors.clear();
        self.diagnostics.clear();
    }
}

impl Default for Stores {
    fn default() -> Self {
        Self::new()
    }
}
