//! Caller-side handle for one in-flight run.

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Returned by [`super::StreamRunEngine::stream_run`] before any network
/// activity. Cancelling aborts the connection and any pending finalize
/// fetch; no cache mutation from that run happens afterwards.
///
/// Dropping the handle does not cancel the run.
#[derive(Debug)]
pub struct CancellationHandle {
    cancel_tx: watch::Sender<bool>,
    thread_id: watch::Receiver<Option<String>>,
    task: Option<JoinHandle<()>>,
}

impl CancellationHandle {
    pub(super) fn new(
        cancel_tx: watch::Sender<bool>,
        thread_id: watch::Receiver<Option<String>>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            cancel_tx,
            thread_id,
            task: Some(task),
        }
    }

    /// A handle for a run that never started.
    pub(super) fn cancelled() -> Self {
        let (cancel_tx, _) = watch::channel(true);
        let (_, thread_id) = watch::channel(None);
        Self {
            cancel_tx,
            thread_id,
            task: None,
        }
    }

    /// Abort the run. Idempotent.
    pub fn cancel(&self) {
        if !self.cancel_tx.send_replace(true) {
            tracing::debug!(thread_id = ?self.thread_id(), "run cancelled");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    /// Thread the run is writing to: the requested one, or the id the server
    /// assigned in `run_start`.
    pub fn thread_id(&self) -> Option<String> {
        self.thread_id.borrow().clone()
    }

    /// Follow thread id resolution.
    pub fn watch_thread_id(&self) -> watch::Receiver<Option<String>> {
        self.thread_id.clone()
    }

    /// Wait until the stream and any finalize fetch have completed.
    ///
    /// Cancel-safe, so it can sit in a `select!` loop.
    pub async fn finished(&mut self) {
        if let Some(task) = self.task.as_mut() {
            let joined = task.await;
            self.task = None;
            if let Err(err) = joined {
                tracing::error!(error = %err, "run task failed");
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

/// Resolve once cancellation is requested. Never resolves if the handle was
/// dropped without cancelling.
pub(crate) async fn wait_for_cancellation(cancel_rx: &mut watch::Receiver<bool>) {
    if cancel_rx.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn pre_cancelled_handle_reports_cancelled_and_finished() {
        let mut handle = CancellationHandle::cancelled();
        assert!(handle.is_cancelled());
        assert!(handle.is_finished());
        assert_eq!(handle.thread_id(), None);
        handle.finished().await;
    }

    #[tokio::test]
    async fn cancel_wakes_waiters() {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let (_thread_tx, thread_rx) = watch::channel(Some("T1".to_string()));
        let task = tokio::spawn(async move {
            wait_for_cancellation(&mut cancel_rx).await;
        });
        let mut handle = CancellationHandle::new(cancel_tx, thread_rx, task);
        assert_eq!(handle.thread_id().as_deref(), Some("T1"));
        handle.cancel();
        handle.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle.finished())
            .await
            .expect("waiter woke");
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn finished_survives_being_dropped_mid_wait() {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let (_thread_tx, thread_rx) = watch::channel(None);
        let task = tokio::spawn(async move {
            wait_for_cancellation(&mut cancel_rx).await;
        });
        let mut handle = CancellationHandle::new(cancel_tx, thread_rx, task);

        tokio::select! {
            _ = handle.finished() => panic!("task should still be running"),
            _ = tokio::time::sleep(Duration::from_millis(10)) => {}
        }
        assert!(!handle.is_finished());

        handle.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle.finished())
            .await
            .expect("second wait completes");
        assert!(handle.is_finished());
    }

    #[tokio::test]
    async fn dropped_sender_is_not_cancellation() {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        drop(cancel_tx);
        let waited =
            tokio::time::timeout(Duration::from_millis(20), wait_for_cancellation(&mut cancel_rx))
                .await;
        assert!(waited.is_err());
    }
}
