//! Per-thread conversation state.
//!
//! The cache is a single `BTreeMap<thread_id, Thread>` held behind an `Arc`
//! and published on a `watch` channel. Every mutation builds a new map and
//! swaps it in whole, so subscribers never observe a half-applied update and
//! see exactly one notification per logical change.

use crate::diagnostics::{DiagnosticKind, Diagnostics};
use crate::error::StoreError;
use crate::types::{Thread, ThreadHistory, ThreadStatus};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;

/// Immutable snapshot of every cached thread.
pub type ThreadMap = Arc<BTreeMap<String, Thread>>;

/// Shallow patch applied by [`ThreadCache::update_entry`].
///
/// `None` leaves a field alone; `Some(..)` overwrites it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThreadPatch {
    pub history: Option<Option<ThreadHistory>>,
    pub status: Option<ThreadStatus>,
    pub error: Option<Option<String>>,
}

impl ThreadPatch {
    pub fn status(status: ThreadStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn history(history: ThreadHistory) -> Self {
        Self {
            history: Some(Some(history)),
            ..Self::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Some(ThreadStatus::Error),
            error: Some(Some(message.into())),
            ..Self::default()
        }
    }

    fn apply(self, thread: &mut Thread) {
        if let Some(history) = self.history {
            thread.history = history;
        }
        if let Some(status) = self.status {
            thread.status = status;
        }
        if let Some(error) = self.error {
            thread.error = error;
        }
    }
}

/// Shared thread cache. Clones are handles onto the same state.
#[derive(Debug, Clone)]
pub struct ThreadCache {
    entries: Arc<watch::Sender<ThreadMap>>,
    loading: Arc<Mutex<BTreeSet<String>>>,
    diagnostics: Diagnostics,
}

impl ThreadCache {
    pub fn new(diagnostics: Diagnostics) -> Self {
        let (entries, _) = watch::channel(ThreadMap::default());
        Self {
            entries: Arc::new(entries),
            loading: Arc::new(Mutex::new(BTreeSet::new())),
            diagnostics,
        }
    }

    pub fn get(&self, thread_id: &str) -> Option<Thread> {
        self.entries.borrow().get(thread_id).cloned()
    }

    pub fn has(&self, thread_id: &str) -> bool {
        self.entries.borrow().contains_key(thread_id)
    }

    pub fn snapshot(&self) -> ThreadMap {
        Arc::clone(&*self.entries.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<ThreadMap> {
        self.entries.subscribe()
    }

    /// Replace a thread's entry wholesale.
    pub fn set_entry(&self, thread_id: &str, thread: Thread) -> Result<(), StoreError> {
        validate(&thread)?;
        tracing::debug!(thread_id, status = ?thread.status, "thread entry replaced");
        self.transact(|entries| {
            entries.insert(thread_id.to_string(), thread);
            Ok(((), true))
        })
    }

    /// Merge `patch` into a thread's entry.
    ///
    /// A missing entry is synthesized from `Thread::default()`; that means an
    /// event beat `run_start` upstream, so it is recorded as a diagnostic.
    pub fn update_entry(&self, thread_id: &str, patch: ThreadPatch) -> Result<Thread, StoreError> {
        let (thread, created) = self.transact(|entries| {
            let created = !entries.contains_key(thread_id);
            let mut thread = entries.get(thread_id).cloned().unwrap_or_default();
            patch.apply(&mut thread);
            validate(&thread)?;
            entries.insert(thread_id.to_string(), thread.clone());
            Ok(((thread, created), true))
        })?;
        if created {
            self.diagnostics.record(
                DiagnosticKind::UpdateWithoutEntry,
                Some(thread_id),
                "thread updated before it had a cache entry",
            );
        }
        Ok(thread)
    }

    /// Run `updater` against an existing entry.
    ///
    /// Returns `Ok(None)` without touching the cache when no entry exists.
    /// If `updater` fails, the cache is left exactly as it was.
    pub fn modify_existing<F>(&self, thread_id: &str, updater: F) -> Result<Option<Thread>, StoreError>
    where
        F: FnOnce(&mut Thread) -> Result<(), StoreError>,
    {
        self.transact(|entries| {
            let Some(current) = entries.get(thread_id) else {
                return Ok((None, false));
            };
            let mut thread = current.clone();
            updater(&mut thread)?;
            validate(&thread)?;
            entries.insert(thread_id.to_string(), thread.clone());
            Ok((Some(thread), true))
        })
    }

    pub fn set_error(&self, thread_id: &str, message: impl Into<String>) -> Result<Thread, StoreError> {
        self.update_entry(thread_id, ThreadPatch::error(message))
    }

    /// Drop the error message; an `error` status falls back to `idle`.
    pub fn clear_error(&self, thread_id: &str) -> Result<Thread, StoreError> {
        let status = match self.get(thread_id).map(|thread| thread.status) {
            Some(ThreadStatus::Error) | None => Some(ThreadStatus::Idle),
            Some(_) => None,
        };
        self.update_entry(
            thread_id,
            ThreadPatch {
                status,
                error: Some(None),
                ..ThreadPatch::default()
            },
        )
    }

    /// Evict one thread. Returns whether an entry existed.
    pub fn remove(&self, thread_id: &str) -> bool {
        self.set_loading(thread_id, false);
        self.transact(|entries| {
            let removed = entries.remove(thread_id).is_some();
            Ok((removed, removed))
        })
        .unwrap_or(false)
    }

    /// Evict everything (logout / full reset).
    pub fn clear_all(&self) {
        self.loading
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.entries.send_if_modified(|entries| {
            if entries.is_empty() {
                return false;
            }
            *entries = ThreadMap::default();
            true
        });
    }

    /// Whether a full-history fetch is already in flight for this thread.
    pub fn is_loading(&self, thread_id: &str) -> bool {
        self.loading
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(thread_id)
    }

    /// Set or clear the loading flag. Returns the previous value.
    pub fn set_loading(&self, thread_id: &str, loading: bool) -> bool {
        let mut flags = self.loading.lock().unwrap_or_else(PoisonError::into_inner);
        if loading {
            !flags.insert(thread_id.to_string())
        } else {
            flags.remove(thread_id)
        }
    }

    /// Apply `f` to a private copy of the map and publish it only on success.
    fn transact<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut BTreeMap<String, Thread>) -> Result<(T, bool), StoreError>,
    {
        let mut outcome = None;
        self.entries.send_if_modified(|current| {
            let mut next = (**current).clone();
            match f(&mut next) {
                Ok((value, modified)) => {
                    if modified {
                        *current = Arc::new(next);
                    }
                    outcome = Some(Ok(value));
                    modified
                }
                Err(err) => {
                    outcome = Some(Err(err));
                    false
                }
            }
        });
        outcome.unwrap_or_else(|| Err(StoreError::InvalidPatch("cache update did not run".into())))
    }
}

fn validate(thread: &Thread) -> Result<(), StoreError> {
    match (thread.status, thread.error.as_deref()) {
        (ThreadStatus::Error, None) => Err(StoreError::InvalidPatch(
            "status `error` requires an error message".to_string(),
        )),
        (ThreadStatus::Error, Some(message)) if message.trim().is_empty() => Err(
            StoreError::InvalidPatch("error message cannot be empty".to_string()),
        ),
        (status @ (ThreadStatus::Idle | ThreadStatus::Streaming), Some(_)) => {
            Err(StoreError::InvalidPatch(format!(
                "error message set while status is `{status:?}`"
            )))
        }
        _ => Ok(()),
    }
}
