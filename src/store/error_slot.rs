//! Process-wide error value surfaced to the user.

use std::sync::Arc;
use tokio::sync::watch;

/// Single-value error slot with change notification.
///
/// Network-facing code clears it when it starts a call and writes a message
/// when the call fails; frontends subscribe and render the latest value.
#[derive(Debug, Clone)]
pub struct ErrorSlot {
    value: Arc<watch::Sender<Option<String>>>,
}

impl Default for ErrorSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorSlot {
    pub fn new() -> Self {
        let (value, _) = watch::channel(None);
        Self {
            value: Arc::new(value),
        }
    }

    pub fn set(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!("{message}");
        self.value.send_replace(Some(message));
    }

    pub fn clear(&self) {
        self.value.send_if_modified(|current| current.take().is_some());
    }

    pub fn get(&self) -> Option<String> {
        self.value.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.value.subscribe()
    }
}
