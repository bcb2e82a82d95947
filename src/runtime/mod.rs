//! Stream run engine.
//!
//! Wire types live in `schema`, message folding in `fold`, and the post-`end`
//! reconciliation in `finalize`. This module hosts the per-run task that
//! turns frames into Thread Cache and Session Registry mutations.
//!
//! Per thread, a run moves `(no entry) --run_start--> streaming
//! --chunk/ai_tool_chunk/tool_result--> streaming --end--> idle`, and any
//! `error` frame moves it to `error`, after which content events are dropped.

use crate::api::RunBackend;
use crate::diagnostics::DiagnosticKind;
use crate::error::{ApiError, StoreError};
use crate::store::{Stores, ThreadPatch};
use crate::types::{Message, RunConfig, Thread, ThreadHistory, ThreadStatus};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;

mod finalize;
mod fold;
mod handle;
pub mod schema;

pub use finalize::FinalizePolicy;
pub use handle::CancellationHandle;

use finalize::FinalizeError;
use handle::wait_for_cancellation;
use schema::{
    AiToolChunk, BackendError, Chunk, End, FrameDecodeError, RunRequest, RunStart, StreamEvent,
    StreamFrame, ToolResult,
};

/// Cache key used by test-mode runs when the server does not name a thread.
pub const TEST_THREAD_ID: &str = "test-thread";

/// Starts runs against a backend and applies their events to the stores.
#[derive(Clone)]
pub struct StreamRunEngine {
    backend: Arc<dyn RunBackend>,
    stores: Stores,
    finalize: FinalizePolicy,
}

impl StreamRunEngine {
    pub fn new(backend: Arc<dyn RunBackend>, stores: Stores) -> Self {
        Self {
            backend,
            stores,
            finalize: FinalizePolicy::default(),
        }
    }

    pub fn with_finalize_policy(mut self, policy: FinalizePolicy) -> Self {
        self.finalize = policy;
        self
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// Start one streaming run and return immediately.
    ///
    /// `thread_id = None` asks the server for a new thread. Outside test
    /// mode an active session must exist; otherwise the Global Error Slot is
    /// set and an already-cancelled handle is returned without any network
    /// call.
    pub fn stream_run(
        &self,
        input: impl Into<String>,
        run_config: RunConfig,
        thread_id: Option<String>,
        test_mode: bool,
    ) -> CancellationHandle {
        let input = input.into();
        self.stores.errors.clear();

        let session_id = if test_mode {
            None
        } else {
            match self.stores.sessions.active_session_id() {
                Some(id) if self.stores.sessions.ui_session(&id).is_some() => Some(id),
                _ => {
                    self.stores
                        .errors
                        .set("No active session. Create or select a session before starting a run.");
                    return CancellationHandle::cancelled();
                }
            }
        };

        if let Some(id) = thread_id.as_deref() {
            self.append_optimistic_turn(id, &input);
        }

        let request = RunRequest::human(input, thread_id.clone(), run_config, test_mode);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (thread_tx, thread_rx) = watch::channel(thread_id.clone());
        tracing::info!(thread_id = ?thread_id, session_id = ?session_id, test_mode, "starting run");

        let run = RunTask {
            backend: Arc::clone(&self.backend),
            stores: self.stores.clone(),
            finalize: self.finalize,
            request,
            session_id,
            test_mode,
            resolved: thread_id,
            saw_terminal: false,
            cancel_rx,
            thread_tx,
            finalizers: JoinSet::new(),
        };
        let task = tokio::spawn(run.run());
        CancellationHandle::new(cancel_tx, thread_rx, task)
    }

    /// Load a thread's latest server state into the cache as `idle`.
    ///
    /// Returns `Ok(None)` when a load for the same thread is already in
    /// flight. A thread that is currently streaming keeps its live state.
    pub async fn load_history(&self, thread_id: &str) -> Result<Option<Thread>, ApiError> {
        let threads = &self.stores.threads;
        if threads.set_loading(thread_id, true) {
            tracing::debug!(thread_id, "history load already in flight");
            return Ok(None);
        }
        self.stores.errors.clear();
        let result = self.backend.fetch_latest_history(thread_id).await;
        threads.set_loading(thread_id, false);

        let history = match result {
            Ok(history) => history,
            Err(err) => {
                if !err.is_cancelled() {
                    self.stores
                        .errors
                        .set(format!("Failed to load thread {thread_id}: {err}"));
                }
                return Err(err);
            }
        };
        self.stores
            .sessions
            .add_thread_id_with_backend_history(thread_id);

        if let Some(live) = threads
            .get(thread_id)
            .filter(|thread| thread.status == ThreadStatus::Streaming)
        {
            tracing::debug!(thread_id, "thread is streaming; keeping live state");
            return Ok(Some(live));
        }
        let thread = Thread {
            history: Some(history),
            status: ThreadStatus::Idle,
            error: None,
        };
        if let Err(err) = threads.set_entry(thread_id, thread.clone()) {
            self.stores.diagnostics.record(
                DiagnosticKind::UpdateRejected,
                Some(thread_id),
                err.to_string(),
            );
        }
        Ok(Some(thread))
    }

    /// Show the user's turn before the server echoes it in `run_start`.
    fn append_optimistic_turn(&self, thread_id: &str, input: &str) {
        let result = self.stores.threads.modify_existing(thread_id, |thread| {
            thread
                .history
                .get_or_insert_with(|| ThreadHistory::empty(thread_id))
                .messages
                .push(Message::human(input));
            Ok(())
        });
        if let Err(err) = result {
            self.stores.diagnostics.record(
                DiagnosticKind::UpdateRejected,
                Some(thread_id),
                err.to_string(),
            );
        }
    }
}

/// State owned by one spawned run.
struct RunTask {
    backend: Arc<dyn RunBackend>,
    stores: Stores,
    finalize: FinalizePolicy,
    request: RunRequest,
    /// Session captured when the run started; new threads are filed here.
    session_id: Option<String>,
    test_mode: bool,
    /// Requested thread, replaced by the server's choice at `run_start`.
    resolved: Option<String>,
    /// Set once an `end` or `error` frame has been handled.
    saw_terminal: bool,
    cancel_rx: watch::Receiver<bool>,
    thread_tx: watch::Sender<Option<String>>,
    finalizers: JoinSet<()>,
}

impl RunTask {
    async fn run(mut self) {
        let opened = tokio::select! {
            biased;
            _ = wait_for_cancellation(&mut self.cancel_rx) => Err(ApiError::Cancelled),
            opened = self.backend.open_run(&self.request) => opened,
        };
        let mut source = match opened {
            Ok(source) => source,
            Err(err) => {
                self.report_stream_failure(err);
                return;
            }
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = wait_for_cancellation(&mut self.cancel_rx) => None,
                next = source.next_frame() => next,
            };
            if self.is_cancelled() {
                tracing::debug!(thread_id = ?self.resolved, "run aborted; dropping remaining frames");
                break;
            }
            let Some(next) = next else {
                if !self.saw_terminal {
                    tracing::warn!(thread_id = ?self.resolved, "stream closed before the run finished");
                    self.stores
                        .errors
                        .set("Stream closed before the run finished.");
                }
                break;
            };
            match next {
                Ok(frame) => self.handle_frame(frame),
                Err(ApiError::InvalidResponse(detail)) => {
                    self.stores.diagnostics.record(
                        DiagnosticKind::MalformedFrame,
                        self.resolved.as_deref(),
                        detail.clone(),
                    );
                    self.stores
                        .errors
                        .set(format!("Malformed event from server: {detail}"));
                }
                Err(err) => {
                    self.report_stream_failure(err);
                    break;
                }
            }
        }
        drop(source);

        while let Some(joined) = self.finalizers.join_next().await {
            if let Err(err) = joined {
                tracing::error!(error = %err, "finalize task failed");
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    fn report_stream_failure(&self, err: ApiError) {
        if err.is_cancelled() || self.is_cancelled() {
            tracing::debug!(thread_id = ?self.resolved, "run cancelled");
            return;
        }
        self.stores.errors.set(format!("Stream error: {err}"));
    }

    fn handle_frame(&mut self, frame: StreamFrame) {
        let event = match StreamEvent::decode(&frame) {
            Ok(event) => event,
            Err(FrameDecodeError::UnknownType(kind)) => {
                self.stores.diagnostics.record(
                    DiagnosticKind::UnknownEvent,
                    frame.thread_id.as_deref(),
                    format!("ignored `{kind}` event"),
                );
                return;
            }
            Err(err) => {
                self.stores.diagnostics.record(
                    DiagnosticKind::MalformedFrame,
                    frame.thread_id.as_deref(),
                    err.to_string(),
                );
                self.stores
                    .errors
                    .set(format!("Malformed event from server: {err}"));
                return;
            }
        };
        let frame_thread = frame.thread_id.filter(|id| !id.trim().is_empty());
        tracing::debug!(event = event.name(), thread_id = ?frame_thread, "stream event");

        match event {
            StreamEvent::RunStart(start) => self.on_run_start(frame_thread, start),
            StreamEvent::Chunk(chunk) => self.on_chunk(frame_thread, chunk),
            StreamEvent::AiToolChunk(chunk) => self.on_tool_chunk(frame_thread, chunk),
            StreamEvent::ToolResult(result) => self.on_tool_result(frame_thread, result),
            StreamEvent::Error(error) => self.on_error(frame_thread, error),
            StreamEvent::End(end) => self.on_end(frame_thread, end),
        }
    }

    /// Frame id, then the run's resolved id, then the test-mode fallback.
    fn resolve_thread(&self, explicit: Option<String>) -> Option<String> {
        explicit
            .filter(|id| !id.trim().is_empty())
            .or_else(|| self.resolved.clone())
            .or_else(|| self.test_mode.then(|| TEST_THREAD_ID.to_string()))
    }

    fn missing_thread(&self, event: &str) {
        self.stores.diagnostics.record(
            DiagnosticKind::MissingThreadId,
            None,
            format!("`{event}` event without a thread id"),
        );
        self.stores
            .errors
            .set(format!("Protocol error: `{event}` event without a thread id."));
    }

    fn on_run_start(&mut self, frame_thread: Option<String>, start: RunStart) {
        let requested = self.request.configurable.thread_id.clone();
        let server_id = start
            .thread_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .or(frame_thread);
        let Some(thread_id) = server_id
            .clone()
            .or_else(|| requested.clone())
            .or_else(|| self.test_mode.then(|| TEST_THREAD_ID.to_string()))
        else {
            self.missing_thread("run_start");
            return;
        };
        if let (Some(requested), Some(server)) = (&requested, &server_id) {
            if requested != server {
                self.stores.diagnostics.record(
                    DiagnosticKind::ThreadIdMismatch,
                    Some(server.as_str()),
                    format!("requested thread `{requested}` but server resolved `{server}`"),
                );
            }
        }

        let cached = self.stores.threads.get(&thread_id);
        let cached_history = cached.as_ref().and_then(|thread| thread.history.as_ref());
        let cached_messages = cached_history
            .map(|history| history.messages.as_slice())
            .unwrap_or_default();
        let history = ThreadHistory {
            checkpoint_id: start
                .checkpoint_id
                .or_else(|| cached_history.and_then(|history| history.checkpoint_id.clone())),
            thread_id: thread_id.clone(),
            messages: fold::merge_initial_messages(cached_messages, &start.initial_messages),
            run_config: start
                .run_config
                .or_else(|| cached_history.and_then(|history| history.run_config.clone())),
        };
        let thread = Thread {
            history: Some(history),
            status: ThreadStatus::Streaming,
            error: None,
        };
        if let Err(err) = self.stores.threads.set_entry(&thread_id, thread) {
            self.reject(&thread_id, err);
            return;
        }

        self.resolved = Some(thread_id.clone());
        self.thread_tx.send_replace(Some(thread_id.clone()));
        tracing::info!(thread_id = %thread_id, "run started");

        if self.test_mode {
            return;
        }
        let sessions = &self.stores.sessions;
        sessions.add_thread_id_with_backend_history(&thread_id);
        if requested.is_none() {
            if let Some(session_id) = self.session_id.as_deref() {
                match sessions.add_thread_to_session(session_id, &thread_id) {
                    Ok(_) => {
                        if let Err(err) = sessions.set_active_thread(session_id, Some(thread_id.as_str())) {
                            tracing::warn!(error = %err, "could not select new thread");
                        }
                    }
                    Err(err) => tracing::warn!(error = %err, "could not file new thread under session"),
                }
            }
        }
    }

    fn on_chunk(&mut self, frame_thread: Option<String>, chunk: Chunk) {
        self.fold_into_thread("chunk", frame_thread, |messages| {
            fold::apply_chunk(messages, &chunk);
            Ok(())
        });
    }

    fn on_tool_chunk(&mut self, frame_thread: Option<String>, chunk: AiToolChunk) {
        self.fold_into_thread("ai_tool_chunk", frame_thread, |messages| {
            fold::apply_tool_chunk(messages, &chunk)
        });
    }

    fn on_tool_result(&mut self, frame_thread: Option<String>, result: ToolResult) {
        self.fold_into_thread("tool_result", frame_thread, |messages| {
            fold::apply_tool_result(messages, &result);
            Ok(())
        });
    }

    /// Apply a content event to a thread that is streaming and error-free.
    /// Anything else is dropped with a diagnostic; the cache is untouched.
    fn fold_into_thread<F>(&mut self, event: &str, frame_thread: Option<String>, apply: F)
    where
        F: FnOnce(&mut Vec<Message>) -> Result<(), StoreError>,
    {
        let Some(thread_id) = self.resolve_thread(frame_thread) else {
            self.missing_thread(event);
            return;
        };
        let mut stale = false;
        let outcome = self.stores.threads.modify_existing(&thread_id, |thread| {
            if !thread.accepts_stream_events() {
                stale = true;
                return Err(StoreError::InvalidPatch(format!(
                    "thread is {:?}",
                    thread.status
                )));
            }
            let history = thread
                .history
                .get_or_insert_with(|| ThreadHistory::empty(&thread_id));
            apply(&mut history.messages)
        });
        match outcome {
            Ok(Some(_)) => {}
            Ok(None) => self.stores.diagnostics.record(
                DiagnosticKind::StaleEvent,
                Some(thread_id.as_str()),
                format!("`{event}` for a thread with no cache entry"),
            ),
            Err(err) if stale => self.stores.diagnostics.record(
                DiagnosticKind::StaleEvent,
                Some(thread_id.as_str()),
                format!("`{event}` dropped: {err}"),
            ),
            Err(StoreError::Protocol(detail)) => {
                self.stores.diagnostics.record(
                    DiagnosticKind::OrphanToolArgs,
                    Some(thread_id.as_str()),
                    detail.clone(),
                );
                self.stores
                    .errors
                    .set(format!("Protocol error: {detail}"));
            }
            Err(err) => self.reject(&thread_id, err),
        }
    }

    fn on_error(&mut self, frame_thread: Option<String>, error: BackendError) {
        self.saw_terminal = true;
        let message = error.message();
        self.stores.errors.set(message.clone());
        let Some(thread_id) = self.resolve_thread(frame_thread) else {
            return;
        };
        let threads = &self.stores.threads;
        let result = if threads.has(&thread_id) {
            threads.set_error(&thread_id, message).map(|_| ())
        } else {
            threads.set_entry(
                &thread_id,
                Thread {
                    history: None,
                    status: ThreadStatus::Error,
                    error: Some(message),
                },
            )
        };
        if let Err(err) = result {
            self.reject(&thread_id, err);
        }
    }

    fn on_end(&mut self, frame_thread: Option<String>, end: End) {
        let Some(thread_id) = self.resolve_thread(frame_thread.or(end.thread_id)) else {
            self.missing_thread("end");
            return;
        };
        self.saw_terminal = true;

        match self.stores.threads.get(&thread_id) {
            Some(thread) if thread.status == ThreadStatus::Error => {
                tracing::debug!(thread_id = %thread_id, "run ended after an error; keeping error state");
            }
            Some(_) => {
                if let Err(err) = self
                    .stores
                    .threads
                    .update_entry(&thread_id, ThreadPatch::status(ThreadStatus::Idle))
                {
                    self.reject(&thread_id, err);
                }
            }
            None => self.stores.diagnostics.record(
                DiagnosticKind::StaleEvent,
                Some(thread_id.as_str()),
                "`end` for a thread with no cache entry",
            ),
        }

        self.finalizers.spawn(finalize_thread(
            Arc::clone(&self.backend),
            self.stores.clone(),
            thread_id,
            self.finalize,
            self.cancel_rx.clone(),
            self.test_mode,
        ));
    }

    fn reject(&self, thread_id: &str, err: StoreError) {
        self.stores
            .diagnostics
            .record(DiagnosticKind::UpdateRejected, Some(thread_id), err.to_string());
    }
}

/// Replace the thread's history with the server's after `end`.
async fn finalize_thread(
    backend: Arc<dyn RunBackend>,
    stores: Stores,
    thread_id: String,
    policy: FinalizePolicy,
    mut cancel_rx: watch::Receiver<bool>,
    test_mode: bool,
) {
    let fetched = finalize::fetch_with_retry(backend.as_ref(), &thread_id, policy, &mut cancel_rx).await;
    let history = match fetched {
        Ok(history) => history,
        Err(FinalizeError::Cancelled) => {
            tracing::debug!(thread_id = %thread_id, "finalize cancelled");
            return;
        }
        Err(FinalizeError::Exhausted { attempts, last }) => {
            stores.errors.set(format!(
                "Failed to refresh thread {thread_id} after {attempts} attempts: {last}"
            ));
            return;
        }
    };
    if *cancel_rx.borrow() {
        return;
    }

    let threads = &stores.threads;
    let replacement = history.clone();
    let result = match threads.modify_existing(&thread_id, move |thread| {
        thread.history = Some(replacement);
        Ok(())
    }) {
        Ok(Some(_)) => Ok(()),
        Ok(None) => threads.set_entry(
            &thread_id,
            Thread {
                history: Some(history),
                ..Thread::default()
            },
        ),
        Err(err) => Err(err),
    };
    if let Err(err) = result {
        stores
            .diagnostics
            .record(DiagnosticKind::UpdateRejected, Some(thread_id.as_str()), err.to_string());
        return;
    }
    if !test_mode {
        stores
            .sessions
            .add_thread_id_with_backend_history(&thread_id);
    }
    tracing::info!(thread_id = %thread_id, "thread finalized");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testsupport::{frame, wait_until, ScriptedBackend, ScriptedRun};
    use crate::types::{MessageKind, ToolCall};
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        backend: Arc<ScriptedBackend>,
        engine: StreamRunEngine,
        stores: Stores,
    }

    impl Harness {
        fn new() -> Self {
            let backend = Arc::new(ScriptedBackend::new());
            let stores = Stores::new();
            let engine = StreamRunEngine::new(backend.clone(), stores.clone())
                .with_finalize_policy(FinalizePolicy {
                    attempts: 3,
                    backoff: Duration::from_millis(1),
                });
            Self {
                backend,
                engine,
                stores,
            }
        }

        /// Harness with one active, empty session.
        fn with_session() -> (Self, String) {
            let harness = Self::new();
            let session = harness.stores.sessions.create_new_session();
            (harness, session)
        }

        fn seed_thread(&self, thread_id: &str, session: &str, messages: Vec<Message>) {
            self.stores
                .threads
                .set_entry(
                    thread_id,
                    Thread {
                        history: Some(ThreadHistory {
                            thread_id: thread_id.to_string(),
                            messages,
                            ..ThreadHistory::default()
                        }),
                        ..Thread::default()
                    },
                )
                .expect("seed");
            self.stores
                .sessions
                .add_thread_to_session(session, thread_id)
                .expect("file thread");
        }

        fn status(&self, thread_id: &str) -> Option<ThreadStatus> {
            self.stores.threads.get(thread_id).map(|thread| thread.status)
        }

        fn messages(&self, thread_id: &str) -> Vec<Message> {
            self.stores
                .threads
                .get(thread_id)
                .map(|thread| thread.messages().to_vec())
                .unwrap_or_default()
        }
    }

    fn run_start(run: &ScriptedRun, thread_id: &str, initial: Vec<Message>) {
        run.send(frame(
            "run_start",
            json!({"thread_id": thread_id, "initialMessages": initial, "runConfig": {"m": 1}}),
            Some(thread_id),
        ));
    }

    fn chunk(run: &ScriptedRun, thread_id: &str, node: &str, content: &str) {
        run.send(frame(
            "chunk",
            json!({"node": node, "content": content}),
            Some(thread_id),
        ));
    }

    fn tool_call(run: &ScriptedRun, thread_id: &str, call_id: &str) {
        run.send(frame(
            "ai_tool_chunk",
            json!({"node": "agent", "id": call_id, "name": "lookup", "args": "{}"}),
            Some(thread_id),
        ));
    }

    fn tool_result(run: &ScriptedRun, thread_id: &str) {
        run.send(frame(
            "tool_result",
            json!({"node": "tools", "tool_name": "lookup", "content": "x"}),
            Some(thread_id),
        ));
    }

    fn end(run: &ScriptedRun, thread_id: &str) {
        run.send(frame("end", json!({"thread_id": thread_id}), Some(thread_id)));
    }

    fn history(thread_id: &str, messages: Vec<Message>) -> ThreadHistory {
        ThreadHistory {
            checkpoint_id: Some("cp".into()),
            thread_id: thread_id.to_string(),
            messages,
            run_config: None,
        }
    }

    #[tokio::test]
    async fn new_thread_is_filed_under_active_session_once() {
        let (h, session) = Harness::with_session();
        let run = h.backend.push_run();
        let handle = h.engine.stream_run("hi", RunConfig::default(), None, false);

        run_start(&run, "T9", vec![Message::human("hi")]);
        wait_until(|| h.status("T9").is_some()).await;

        assert_eq!(h.status("T9"), Some(ThreadStatus::Streaming));
        let ui = h.stores.sessions.ui_session(&session).expect("session");
        assert_eq!(ui.thread_ids, vec!["T9".to_string()]);
        assert_eq!(ui.active_thread_id.as_deref(), Some("T9"));
        assert!(h.stores.sessions.has_backend_history("T9"));
        assert_eq!(handle.thread_id().as_deref(), Some("T9"));
        assert_eq!(h.backend.requests()[0].configurable.thread_id, None);
    }

    #[tokio::test]
    async fn continuing_thread_streams_reply_and_finalizes() {
        let (h, session) = Harness::with_session();
        let prior = vec![Message::human("q1"), Message::ai_for_node("agent")];
        h.seed_thread("T1", &session, prior.clone());
        let mut run = h.backend.push_run();
        let mut final_messages = prior.clone();
        final_messages.push(Message::human("hello"));
        final_messages.push(Message::Ai(crate::types::AiMessage {
            content: "Hi there".into(),
            node_id: Some("agent".into()),
            tool_calls: Vec::new(),
        }));
        h.backend.push_history(Ok(history("T1", final_messages.clone())));

        let mut handle = h
            .engine
            .stream_run("hello", RunConfig::default(), Some("T1".into()), false);
        assert_eq!(h.messages("T1").len(), 3, "optimistic human turn");

        let mut initial = prior.clone();
        initial.push(Message::human("hello"));
        run_start(&run, "T1", initial);
        chunk(&run, "T1", "agent", "Hi ");
        chunk(&run, "T1", "agent", "there");
        end(&run, "T1");
        run.close();
        handle.finished().await;

        let thread = h.stores.threads.get("T1").expect("thread");
        assert_eq!(thread.status, ThreadStatus::Idle);
        assert_eq!(thread.error, None);
        assert_eq!(thread.messages(), final_messages.as_slice());
        let ui = h.stores.sessions.ui_session(&session).expect("session");
        assert_eq!(ui.thread_ids, vec!["T1".to_string()]);
        assert_eq!(h.stores.errors.get(), None);
    }

    #[tokio::test]
    async fn run_start_merge_does_not_duplicate_cached_messages() {
        let (h, session) = Harness::with_session();
        h.seed_thread("T1", &session, vec![Message::human("a")]);
        let run = h.backend.push_run();
        let _handle = h.engine.stream_run("b", RunConfig::default(), Some("T1".into()), false);

        run_start(
            &run,
            "T1",
            vec![Message::human("a"), Message::human("b"), Message::system("rules")],
        );
        wait_until(|| h.status("T1") == Some(ThreadStatus::Streaming)).await;

        assert_eq!(
            h.messages("T1"),
            vec![Message::human("a"), Message::human("b"), Message::system("rules")]
        );
    }

    #[tokio::test]
    async fn chunk_text_concatenates_into_one_ai_message() {
        let (h, _session) = Harness::with_session();
        let run = h.backend.push_run();
        let _handle = h.engine.stream_run("q", RunConfig::default(), None, false);

        run_start(&run, "T2", vec![Message::human("q")]);
        for part in ["a", "b", "c", "d"] {
            chunk(&run, "T2", "writer", part);
        }
        wait_until(|| h.messages("T2").len() == 2 && h.messages("T2")[1].content() == "abcd").await;

        let messages = h.messages("T2");
        assert_eq!(messages[1].kind(), MessageKind::Ai);
        assert_eq!(messages[1].node_id(), Some("writer"));
    }

    #[tokio::test]
    async fn tool_events_build_calls_and_results() {
        let (h, _session) = Harness::with_session();
        let run = h.backend.push_run();
        let _handle = h.engine.stream_run("calc", RunConfig::default(), None, false);

        run_start(&run, "T3", vec![Message::human("calc")]);
        run.send(frame(
            "ai_tool_chunk",
            json!({"node": "agent", "id": "c1", "name": "add", "args": "{\"a\":"}),
            Some("T3"),
        ));
        run.send(frame("ai_tool_chunk", json!({"node": "agent", "args": "1}"}), Some("T3")));
        run.send(frame(
            "tool_result",
            json!({"node": "tools", "tool_name": "add", "content": "1", "is_error": false, "tool_call_id": "c1"}),
            Some("T3"),
        ));
        wait_until(|| h.messages("T3").len() == 3).await;

        let messages = h.messages("T3");
        let Message::Ai(ai) = &messages[1] else {
            panic!("expected ai message");
        };
        assert_eq!(
            ai.tool_calls,
            vec![ToolCall {
                id: "c1".into(),
                name: "add".into(),
                args: "{\"a\":1}".into(),
            }]
        );
        let Message::Tool(tool) = &messages[2] else {
            panic!("expected tool message");
        };
        assert_eq!(tool.name, "add");
        assert_eq!(tool.node_id.as_deref(), Some("tools"));
        assert_eq!(tool.tool_call_id.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn orphan_tool_args_are_reported_not_applied() {
        let (h, _session) = Harness::with_session();
        let run = h.backend.push_run();
        let _handle = h.engine.stream_run("q", RunConfig::default(), None, false);

        run_start(&run, "T4", vec![Message::human("q")]);
        run.send(frame("ai_tool_chunk", json!({"node": "agent", "args": "zzz"}), Some("T4")));
        wait_until(|| h.stores.diagnostics.count(DiagnosticKind::OrphanToolArgs) == 1).await;

        assert_eq!(h.messages("T4"), vec![Message::human("q")]);
        assert!(h.stores.errors.get().is_some());
        assert_eq!(h.status("T4"), Some(ThreadStatus::Streaming));
    }

    #[tokio::test]
    async fn content_for_uncached_thread_is_a_noop() {
        let (h, _session) = Harness::with_session();
        let run = h.backend.push_run();
        let _handle = h.engine.stream_run("q", RunConfig::default(), Some("ghost".into()), false);

        chunk(&run, "ghost", "agent", "boo");
        tool_call(&run, "ghost", "c1");
        tool_result(&run, "ghost");
        wait_until(|| h.stores.diagnostics.count(DiagnosticKind::StaleEvent) == 3).await;

        assert!(h.stores.threads.snapshot().is_empty());
        assert_eq!(h.stores.errors.get(), None);
    }

    #[tokio::test]
    async fn content_for_idle_thread_is_dropped() {
        let (h, session) = Harness::with_session();
        h.seed_thread("T5", &session, vec![Message::human("old")]);
        let run = h.backend.push_run();
        let _handle = h.engine.stream_run("new", RunConfig::default(), Some("T5".into()), false);
        wait_until(|| h.messages("T5").len() == 2).await;
        let before = h.stores.threads.get("T5");

        chunk(&run, "T5", "agent", "late");
        tool_call(&run, "T5", "c1");
        tool_result(&run, "T5");
        wait_until(|| h.stores.diagnostics.count(DiagnosticKind::StaleEvent) == 3).await;

        assert_eq!(h.stores.threads.get("T5"), before);
        assert_eq!(h.stores.errors.get(), None);
    }

    #[tokio::test]
    async fn tool_events_for_errored_thread_are_dropped() {
        let (h, _session) = Harness::with_session();
        let run = h.backend.push_run();
        let _handle = h.engine.stream_run("q", RunConfig::default(), None, false);

        run_start(&run, "T15", vec![Message::human("q")]);
        run.send(frame("error", json!({"node": "n1", "error": "boom"}), Some("T15")));
        wait_until(|| h.status("T15") == Some(ThreadStatus::Error)).await;
        let before = h.stores.threads.snapshot();

        tool_call(&run, "T15", "c1");
        tool_result(&run, "T15");
        wait_until(|| h.stores.diagnostics.count(DiagnosticKind::StaleEvent) == 2).await;

        assert_eq!(h.stores.threads.snapshot(), before);
        assert_eq!(h.messages("T15"), vec![Message::human("q")]);
    }

    #[tokio::test]
    async fn backend_error_marks_thread_and_blocks_later_chunks() {
        let (h, _session) = Harness::with_session();
        let mut run = h.backend.push_run();
        h.backend.push_history(Ok(history("T6", vec![Message::human("q")])));
        let mut handle = h.engine.stream_run("q", RunConfig::default(), None, false);

        run_start(&run, "T6", vec![Message::human("q")]);
        run.send(frame("error", json!({"node": "n1", "error": "boom"}), Some("T6")));
        chunk(&run, "T6", "agent", "ignored");
        end(&run, "T6");
        run.close();
        handle.finished().await;

        let thread = h.stores.threads.get("T6").expect("thread");
        assert_eq!(thread.status, ThreadStatus::Error);
        assert_eq!(thread.error.as_deref(), Some("Backend Error (n1): boom"));
        assert_eq!(thread.messages(), [Message::human("q")].as_slice());
        assert_eq!(h.stores.errors.get().as_deref(), Some("Backend Error (n1): boom"));
        assert_eq!(h.stores.diagnostics.count(DiagnosticKind::StaleEvent), 1);
    }

    #[tokio::test]
    async fn error_before_run_start_creates_errored_entry() {
        let (h, _session) = Harness::with_session();
        let mut run = h.backend.push_run();
        let mut handle = h.engine.stream_run("q", RunConfig::default(), Some("T7".into()), false);

        run.send(frame("error", json!({"node": "router", "error": "no model"}), None));
        run.close();
        handle.finished().await;

        let thread = h.stores.threads.get("T7").expect("thread");
        assert_eq!(thread.status, ThreadStatus::Error);
        assert!(h.stores.diagnostics.count(DiagnosticKind::UpdateWithoutEntry) == 0);
    }

    #[tokio::test]
    async fn end_sets_idle_before_finalize_resolves() {
        let (h, _session) = Harness::with_session();
        let mut run = h.backend.push_run();
        let gate = h.backend.gate_history();
        h.backend
            .push_history(Ok(history("T8", vec![Message::human("server")])));
        let mut handle = h.engine.stream_run("q", RunConfig::default(), None, false);

        run_start(&run, "T8", vec![Message::human("q")]);
        end(&run, "T8");
        run.close();
        wait_until(|| h.backend.history_calls() == 1).await;

        assert_eq!(h.status("T8"), Some(ThreadStatus::Idle));
        assert_eq!(h.messages("T8"), vec![Message::human("q")]);
        assert!(!handle.is_finished());

        let _ = gate.send(());
        handle.finished().await;
        assert_eq!(h.messages("T8"), vec![Message::human("server")]);
        assert_eq!(h.status("T8"), Some(ThreadStatus::Idle));
    }

    #[tokio::test]
    async fn finalize_retries_then_applies_history() {
        let (h, _session) = Harness::with_session();
        let mut run = h.backend.push_run();
        h.backend.push_history(Err(ApiError::status(502, "")));
        h.backend.push_history(Err(ApiError::status(503, "")));
        h.backend
            .push_history(Ok(history("T10", vec![Message::human("final")])));
        let mut handle = h.engine.stream_run("q", RunConfig::default(), None, false);

        run_start(&run, "T10", vec![Message::human("q")]);
        end(&run, "T10");
        run.close();
        handle.finished().await;

        assert_eq!(h.backend.history_calls(), 3);
        assert_eq!(h.messages("T10"), vec![Message::human("final")]);
        assert_eq!(h.status("T10"), Some(ThreadStatus::Idle));
        assert_eq!(h.stores.errors.get(), None);
    }

    #[tokio::test]
    async fn finalize_exhaustion_reports_but_keeps_idle() {
        let (h, _session) = Harness::with_session();
        let mut run = h.backend.push_run();
        for _ in 0..3 {
            h.backend.push_history(Err(ApiError::status(500, "down")));
        }
        let mut handle = h.engine.stream_run("q", RunConfig::default(), None, false);

        run_start(&run, "T11", vec![Message::human("q")]);
        chunk(&run, "T11", "agent", "partial");
        end(&run, "T11");
        run.close();
        handle.finished().await;

        assert_eq!(h.backend.history_calls(), 3);
        assert_eq!(h.status("T11"), Some(ThreadStatus::Idle));
        assert_eq!(h.messages("T11").len(), 2);
        let message = h.stores.errors.get().expect("global error");
        assert!(message.contains("T11"), "{message}");
    }

    #[tokio::test]
    async fn abort_suppresses_buffered_frames() {
        let (h, _session) = Harness::with_session();
        let run = h.backend.push_run();
        let mut handle = h.engine.stream_run("q", RunConfig::default(), None, false);

        run_start(&run, "T12", vec![Message::human("q")]);
        wait_until(|| h.status("T12") == Some(ThreadStatus::Streaming)).await;
        let before = h.stores.threads.snapshot();

        chunk(&run, "T12", "agent", "never");
        end(&run, "T12");
        handle.cancel();
        handle.finished().await;

        assert_eq!(h.stores.threads.snapshot(), before);
        assert_eq!(h.backend.history_calls(), 0);
        assert_eq!(h.stores.errors.get(), None);
    }

    #[tokio::test]
    async fn abort_during_finalize_stops_retries_silently() {
        let (h, _session) = Harness::with_session();
        let mut run = h.backend.push_run();
        h.backend.push_history(Err(ApiError::status(500, "down")));
        let engine = h.engine.clone().with_finalize_policy(FinalizePolicy {
            attempts: 3,
            backoff: Duration::from_secs(30),
        });
        let mut handle = engine.stream_run("q", RunConfig::default(), None, false);

        run_start(&run, "T13", vec![Message::human("q")]);
        end(&run, "T13");
        run.close();
        wait_until(|| h.backend.history_calls() == 1).await;
        handle.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle.finished())
            .await
            .expect("finalize stopped");

        assert_eq!(h.backend.history_calls(), 1);
        assert_eq!(h.status("T13"), Some(ThreadStatus::Idle));
        assert_eq!(h.stores.errors.get(), None);
    }

    #[tokio::test]
    async fn missing_session_fails_fast_without_network() {
        let h = Harness::new();
        let mut handle = h.engine.stream_run("q", RunConfig::default(), None, false);

        assert!(handle.is_cancelled());
        handle.finished().await;
        assert!(h.backend.requests().is_empty());
        assert!(h.stores.errors.get().is_some());
    }

    #[tokio::test]
    async fn stream_run_clears_previous_global_error() {
        let (h, _session) = Harness::with_session();
        h.stores.errors.set("old");
        let _run = h.backend.push_run();
        let _handle = h.engine.stream_run("q", RunConfig::default(), None, false);
        assert_eq!(h.stores.errors.get(), None);
    }

    #[tokio::test]
    async fn open_failure_is_reported() {
        let (h, _session) = Harness::with_session();
        h.backend.push_open_error(ApiError::status(500, "kaput"));
        let mut handle = h.engine.stream_run("q", RunConfig::default(), None, false);
        handle.finished().await;

        let message = h.stores.errors.get().expect("global error");
        assert!(message.contains("500"), "{message}");
        assert!(h.stores.threads.snapshot().is_empty());
    }

    #[tokio::test]
    async fn events_without_thread_id_are_protocol_errors() {
        let (h, _session) = Harness::with_session();
        let run = h.backend.push_run();
        let _handle = h.engine.stream_run("q", RunConfig::default(), None, false);

        run.send(frame("chunk", json!({"node": "agent", "content": "x"}), None));
        wait_until(|| h.stores.diagnostics.count(DiagnosticKind::MissingThreadId) == 1).await;

        assert!(h.stores.errors.get().is_some());
        assert!(h.stores.threads.snapshot().is_empty());
    }

    #[tokio::test]
    async fn thread_id_mismatch_is_logged_but_run_continues() {
        let (h, session) = Harness::with_session();
        h.seed_thread("T1", &session, vec![Message::human("a")]);
        let run = h.backend.push_run();
        let handle = h.engine.stream_run("b", RunConfig::default(), Some("T1".into()), false);

        run_start(&run, "T1-fork", vec![Message::human("b")]);
        chunk(&run, "T1-fork", "agent", "ok");
        wait_until(|| h.messages("T1-fork").len() == 2).await;

        assert_eq!(h.stores.diagnostics.count(DiagnosticKind::ThreadIdMismatch), 1);
        assert_eq!(handle.thread_id().as_deref(), Some("T1-fork"));
        assert_eq!(h.status("T1-fork"), Some(ThreadStatus::Streaming));
    }

    #[tokio::test]
    async fn test_mode_uses_ephemeral_thread_and_skips_registry() {
        let h = Harness::new();
        let mut run = h.backend.push_run();
        h.backend
            .push_history(Ok(history(TEST_THREAD_ID, vec![Message::human("t")])));
        let mut handle = h.engine.stream_run("t", RunConfig::default(), None, true);

        run.send(frame("run_start", json!({"initialMessages": [{"type": "human", "content": "t"}]}), None));
        chunk(&run, TEST_THREAD_ID, "agent", "reply");
        end(&run, TEST_THREAD_ID);
        run.close();
        handle.finished().await;

        assert!(h.backend.requests()[0].is_test_mode);
        assert_eq!(h.status(TEST_THREAD_ID), Some(ThreadStatus::Idle));
        let sessions = h.stores.sessions.snapshot();
        assert!(sessions.ui_sessions.is_empty());
        assert!(sessions.threads_with_backend_history.is_empty());
    }

    #[tokio::test]
    async fn test_mode_follows_server_echoed_thread_id() {
        let h = Harness::new();
        let mut run = h.backend.push_run();
        h.backend
            .push_history(Ok(history("sandbox-7", vec![Message::human("t")])));
        let mut handle = h.engine.stream_run("t", RunConfig::default(), None, true);

        run.send(frame(
            "run_start",
            json!({"thread_id": "sandbox-7", "initialMessages": [{"type": "human", "content": "t"}]}),
            Some("sandbox-7"),
        ));
        run.send(frame("chunk", json!({"node": "agent", "content": "reply"}), None));
        end(&run, "sandbox-7");
        run.close();
        handle.finished().await;

        assert_eq!(handle.thread_id().as_deref(), Some("sandbox-7"));
        assert_eq!(h.status("sandbox-7"), Some(ThreadStatus::Idle));
        assert_eq!(h.status(TEST_THREAD_ID), None);
        let sessions = h.stores.sessions.snapshot();
        assert!(sessions.ui_sessions.is_empty());
        assert!(sessions.active_session_id.is_none());
        assert!(sessions.threads_with_backend_history.is_empty());
    }

    #[tokio::test]
    async fn unknown_and_malformed_frames_do_not_end_the_stream() {
        let (h, _session) = Harness::with_session();
        let run = h.backend.push_run();
        let _handle = h.engine.stream_run("q", RunConfig::default(), None, false);

        run_start(&run, "T14", vec![Message::human("q")]);
        run.send(frame("heartbeat", json!({}), Some("T14")));
        run.fail(ApiError::InvalidResponse("invalid stream frame".into()));
        chunk(&run, "T14", "agent", "still here");
        wait_until(|| h.messages("T14").len() == 2).await;

        assert_eq!(h.stores.diagnostics.count(DiagnosticKind::UnknownEvent), 1);
        assert_eq!(h.stores.diagnostics.count(DiagnosticKind::MalformedFrame), 1);
    }

    #[tokio::test]
    async fn transport_failure_mid_stream_is_reported() {
        let (h, _session) = Harness::with_session();
        let run = h.backend.push_run();
        let mut handle = h.engine.stream_run("q", RunConfig::default(), None, false);

        run_start(&run, "T15", vec![Message::human("q")]);
        run.fail(ApiError::status(502, "proxy"));
        handle.finished().await;

        let message = h.stores.errors.get().expect("global error");
        assert!(message.starts_with("Stream error"), "{message}");
    }

    #[tokio::test]
    async fn load_history_deduplicates_concurrent_loads() {
        let h = Harness::new();
        let gate = h.backend.gate_history();
        h.backend.push_history(Ok(history("T16", vec![Message::human("x")])));

        let first = h.engine.load_history("T16");
        let second = async {
            wait_until(|| h.stores.threads.is_loading("T16")).await;
            let second = h.engine.load_history("T16").await;
            let _ = gate.send(());
            second
        };
        let (first, second) = tokio::join!(first, second);

        assert_eq!(second.expect("second"), None);
        let thread = first.expect("first").expect("loaded");
        assert_eq!(thread.status, ThreadStatus::Idle);
        assert_eq!(h.backend.history_calls(), 1);
        assert!(!h.stores.threads.is_loading("T16"));
        assert!(h.stores.sessions.has_backend_history("T16"));
    }

    #[tokio::test]
    async fn load_history_failure_sets_global_error() {
        let h = Harness::new();
        let err = h.engine.load_history("nope").await.expect_err("404");
        assert_eq!(err.status_code(), Some(404));
        assert!(h.stores.errors.get().is_some());
        assert!(!h.stores.threads.is_loading("nope"));
    }
}
