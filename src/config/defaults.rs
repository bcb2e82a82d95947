//! Default configuration constants.

/// Embedded `creeds.toml` written by `creeds init`.
pub(super) const DEFAULT_CONFIG_TEMPLATE: &str = include_str!("../templates/creeds.toml");
/// Server the client talks to when nothing is configured.
pub(super) const DEFAULT_BASE_URL: &str = "http://localhost:8000";
/// Streaming run endpoint, relative to the base URL.
pub(super) const DEFAULT_STREAM_PATH: &str = "/api/runs/stream";
/// Latest-history endpoint; `{thread_id}` is substituted per request.
pub(super) const DEFAULT_HISTORY_PATH: &str = "/api/threads/{thread_id}/latest";
/// Timeout for non-streaming requests.
pub(super) const DEFAULT_TIMEOUT_SECS: u64 = 30;
/// Connect timeout for the streaming request (the body itself is unbounded).
pub(super) const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
/// Total finalize-fetch attempts after `end` (initial try plus two retries).
pub(super) const DEFAULT_FINALIZE_ATTEMPTS: u32 = 3;
/// Fixed delay between finalize-fetch attempts.
pub(super) const DEFAULT_FINALIZE_BACKOFF_MS: u64 = 1000;
/// Root directory for persisted session registry snapshots.
pub(super) const DEFAULT_SESSION_DIR: &str = crate::session::DEFAULT_SESSION_ROOT;
