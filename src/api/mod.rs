//! HTTP access to the constitutions server.
//!
//! The API layer is split into cohesive modules:
//! - `sse`: incremental decoding of run streams
//! - `client`: shared HTTP plumbing, run streaming and history fetches
//! - `rest`: the remaining JSON endpoints (constitutions, marketplace, reviews)

use crate::error::ApiError;
use crate::runtime::schema::{RunRequest, StreamFrame};
use crate::types::ThreadHistory;
use async_trait::async_trait;

mod client;
pub mod rest;
pub mod sse;

pub use client::{ApiClient, HttpFrameSource};
pub use rest::RestClient;

/// Server operations the run engine depends on.
///
/// Tests provide a scripted implementation; production uses [`ApiClient`].
#[async_trait]
pub trait RunBackend: Send + Sync {
    /// Open a streaming run. Resolves once response headers arrive.
    async fn open_run(&self, request: &RunRequest) -> Result<Box<dyn FrameSource>, ApiError>;

    /// Fetch the authoritative latest state of a thread. Makes a single
    /// request; callers decide whether to retry.
    async fn fetch_latest_history(&self, thread_id: &str) -> Result<ThreadHistory, ApiError>;
}

/// Pull-based sequence of frames from one open run.
#[async_trait]
pub trait FrameSource: Send {
    /// `None` once the stream is exhausted.
    async fn next_frame(&mut self) -> Option<Result<StreamFrame, ApiError>>;
}
