//! Logical chat sessions and the threads that belong to them.
//!
//! A session is what one frontend instance (a browser tab, a CLI profile)
//! shows: an ordered list of thread ids plus an active-thread pointer. The
//! registry also remembers which threads the server has confirmed it
//! persisted, as opposed to threads that only exist locally so far.

use crate::error::SessionError;
use crate::session::generate_session_id;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::watch;

/// Per-session UI state.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UiSession {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub thread_ids: Vec<String>,
    #[serde(default)]
    pub active_thread_id: Option<String>,
    #[serde(default)]
    pub created_at_millis: u64,
}

/// Everything the registry tracks. Published whole on every change.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionState {
    pub active_session_id: Option<String>,
    #[serde(default)]
    pub ui_sessions: BTreeMap<String, UiSession>,
    #[serde(default)]
    pub threads_with_backend_history: BTreeSet<String>,
}

impl SessionState {
    /// Session whose thread list contains `thread_id`, if any.
    pub fn owner_of(&self, thread_id: &str) -> Option<&UiSession> {
        self.ui_sessions
            .values()
            .find(|session| session.thread_ids.iter().any(|id| id == thread_id))
    }

    /// The active session, when one is selected and still exists.
    pub fn active_session(&self) -> Option<&UiSession> {
        self.active_session_id
            .as_deref()
            .and_then(|id| self.ui_sessions.get(id))
    }
}

/// Shared session registry. Clones are handles onto the same state.
#[derive(Debug, Clone)]
pub struct SessionRegistry {
    state: Arc<watch::Sender<Arc<SessionState>>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::from_state(SessionState::default())
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rehydrate from a persisted snapshot.
    pub fn from_state(state: SessionState) -> Self {
        let (state, _) = watch::channel(Arc::new(state));
        Self {
            state: Arc::new(state),
        }
    }

    pub fn snapshot(&self) -> Arc<SessionState> {
        Arc::clone(&*self.state.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<SessionState>> {
        self.state.subscribe()
    }

    pub fn active_session_id(&self) -> Option<String> {
        self.state.borrow().active_session_id.clone()
    }

    pub fn ui_session(&self, session_id: &str) -> Option<UiSession> {
        self.state.borrow().ui_sessions.get(session_id).cloned()
    }

    /// Select the active session. The id is not required to exist yet.
    pub fn set_active_session_id(&self, session_id: Option<String>) {
        self.mutate(|state| {
            if state.active_session_id == session_id {
                return false;
            }
            state.active_session_id = session_id;
            true
        });
    }

    /// Allocate a fresh, empty session and make it active.
    pub fn create_new_session(&self) -> String {
        let mut allocated = String::new();
        self.mutate(|state| {
            let mut id = generate_session_id();
            while state.ui_sessions.contains_key(&id) {
                id = generate_session_id();
            }
            let name = format!("Session {}", state.ui_sessions.len() + 1);
            state.ui_sessions.insert(
                id.clone(),
                UiSession {
                    id: id.clone(),
                    name,
                    thread_ids: Vec::new(),
                    active_thread_id: None,
                    created_at_millis: now_unix_millis(),
                },
            );
            state.active_session_id = Some(id.clone());
            allocated = id;
            true
        });
        tracing::debug!(session_id = %allocated, "session created");
        allocated
    }

    /// Append a thread to a session's list.
    ///
    /// Returns `Ok(false)` when the thread is already listed there. A thread
    /// listed under a different session is rejected.
    pub fn add_thread_to_session(&self, session_id: &str, thread_id: &str) -> Result<bool, SessionError> {
        self.try_mutate(|state| {
            if let Some(owner) = state.owner_of(thread_id) {
                if owner.id == session_id {
                    return Ok(false);
                }
                return Err(SessionError::ThreadOwnedElsewhere {
                    thread_id: thread_id.to_string(),
                    session_id: owner.id.clone(),
                });
            }
            let session = state
                .ui_sessions
                .get_mut(session_id)
                .ok_or_else(|| SessionError::UnknownSession(session_id.to_string()))?;
            session.thread_ids.push(thread_id.to_string());
            Ok(true)
        })
    }

    /// Point a session at one of its threads.
    pub fn set_active_thread(&self, session_id: &str, thread_id: Option<&str>) -> Result<(), SessionError> {
        self.try_mutate(|state| {
            let session = state
                .ui_sessions
                .get_mut(session_id)
                .ok_or_else(|| SessionError::UnknownSession(session_id.to_string()))?;
            let next = thread_id.map(str::to_string);
            if session.active_thread_id == next {
                return Ok(false);
            }
            session.active_thread_id = next;
            Ok(true)
        })
        .map(|_| ())
    }

    pub fn rename_session(&self, session_id: &str, name: &str) -> Result<(), SessionError> {
        self.try_mutate(|state| {
            let session = state
                .ui_sessions
                .get_mut(session_id)
                .ok_or_else(|| SessionError::UnknownSession(session_id.to_string()))?;
            if session.name == name {
                return Ok(false);
            }
            session.name = name.to_string();
            Ok(true)
        })
        .map(|_| ())
    }

    /// Drop a session. Clears the active pointer if it pointed there.
    pub fn remove_session(&self, session_id: &str) -> Option<UiSession> {
        let mut removed = None;
        self.mutate(|state| {
            removed = state.ui_sessions.remove(session_id);
            if removed.is_none() {
                return false;
            }
            if state.active_session_id.as_deref() == Some(session_id) {
                state.active_session_id = None;
            }
            true
        });
        removed
    }

    /// Record that the server has persisted history for this thread.
    ///
    /// Returns `false` when it was already recorded.
    pub fn add_thread_id_with_backend_history(&self, thread_id: &str) -> bool {
        let mut inserted = false;
        self.mutate(|state| {
            inserted = state
                .threads_with_backend_history
                .insert(thread_id.to_string());
            inserted
        });
        inserted
    }

    pub fn has_backend_history(&self, thread_id: &str) -> bool {
        self.state
            .borrow()
            .threads_with_backend_history
            .contains(thread_id)
    }

    /// Forget every session and thread (logout / full reset).
    pub fn clear_all(&self) {
        self.mutate(|state| {
            if *state == SessionState::default() {
                return false;
            }
            *state = SessionState::default();
            true
        });
    }

    fn mutate<F>(&self, f: F)
    where
        F: FnOnce(&mut SessionState) -> bool,
    {
        self.state.send_if_modified(|current| {
            let mut next = (**current).clone();
            if !f(&mut next) {
                return false;
            }
            *current = Arc::new(next);
            true
        });
    }

    fn try_mutate<F>(&self, f: F) -> Result<bool, SessionError>
    where
        F: FnOnce(&mut SessionState) -> Result<bool, SessionError>,
    {
        let mut outcome = Ok(false);
        self.mutate(|state| {
            outcome = f(state);
            matches!(outcome, Ok(true))
        });
        outcome
    }
}

fn now_unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
