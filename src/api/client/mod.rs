//! API client orchestration for the constitutions server.
//!
//! The client facade here stays small:
//! - transport details (client builders, status mapping) live in `transport`.
//! - retry policy logic is delegated to `retry`.

mod retry;
mod transport;

use super::sse::{parse_frame, SseDecoder};
use super::{FrameSource, RunBackend};
use crate::config::{Config, THREAD_ID_PLACEHOLDER};
use crate::error::ApiError;
use crate::runtime::schema::{RunRequest, StreamFrame};
use crate::types::{HistoryResponse, ThreadHistory};
use async_trait::async_trait;
use retry::{Idempotency, RetryPolicy};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::sleep;

pub(crate) use transport::encode_path_segment;

/// HTTP client for the constitutions server.
#[derive(Clone)]
pub struct ApiClient {
    rest: reqwest::Client,
    stream: reqwest::Client,
    base_url: String,
    bearer: Option<String>,
    stream_path: String,
    history_path: String,
    retry_policy: RetryPolicy,
}

impl ApiClient {
    /// Build a client from resolved configuration.
    pub fn new(config: &Config) -> Self {
        Self::new_with_retry_policy(config, RetryPolicy::default())
    }

    fn new_with_retry_policy(config: &Config, retry_policy: RetryPolicy) -> Self {
        let connect_timeout = config.stream.connect_timeout();
        Self {
            rest: transport::build_rest_client(config.server.timeout(), connect_timeout),
            stream: transport::build_stream_client(connect_timeout),
            base_url: config.server.base_url.trim_end_matches('/').to_string(),
            bearer: config.server.api_token.clone(),
            stream_path: config.server.stream_path.clone(),
            history_path: config.server.history_path.clone(),
            retry_policy,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// `GET` a JSON document, retrying transient failures.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let url = self.url(path);
        let response = self
            .send_with_retries(Idempotency::Idempotent, || {
                transport::authorize(self.rest.get(&url), self.bearer.as_deref())
            })
            .await?;
        transport::read_json(response).await
    }

    /// `GET` a plain-text document, retrying transient failures.
    pub async fn get_text(&self, path: &str) -> Result<String, ApiError> {
        let url = self.url(path);
        let response = self
            .send_with_retries(Idempotency::Idempotent, || {
                transport::authorize(self.rest.get(&url), self.bearer.as_deref())
            })
            .await?;
        Ok(response.text().await?)
    }

    /// `POST` a JSON body and decode the JSON reply.
    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.url(path);
        let response = self
            .send_with_retries(Idempotency::NonIdempotent, || {
                transport::authorize(self.rest.post(&url).json(body), self.bearer.as_deref())
            })
            .await?;
        transport::read_json(response).await
    }

    async fn send_with_retries<F>(
        &self,
        kind: Idempotency,
        build: F,
    ) -> Result<reqwest::Response, ApiError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut attempt: u32 = 0;
        loop {
            match transport::send_checked(build()).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    if !self.retry_policy.should_retry(&err, attempt, kind) {
                        return Err(err);
                    }
                    let delay = self.retry_policy.retry_delay_for(attempt);
                    tracing::debug!(attempt, ?delay, error = %err, "retrying request");
                    attempt = attempt.saturating_add(1);
                    sleep(delay).await;
                }
            }
        }
    }

    fn history_url_path(&self, thread_id: &str) -> String {
        self.history_path
            .replace(THREAD_ID_PLACEHOLDER, &encode_path_segment(thread_id))
    }
}

#[async_trait]
impl RunBackend for ApiClient {
    async fn open_run(&self, request: &RunRequest) -> Result<Box<dyn FrameSource>, ApiError> {
        let url = self.url(&self.stream_path);
        let req = self
            .stream
            .post(&url)
            .header("Accept", "text/event-stream")
            .json(request);
        // Opening a run is never replayed: the server may already be executing it.
        let response = transport::send_checked(transport::authorize(req, self.bearer.as_deref())).await?;
        tracing::debug!(url = %url, "run stream opened");
        Ok(Box::new(HttpFrameSource::new(response)))
    }

    async fn fetch_latest_history(&self, thread_id: &str) -> Result<ThreadHistory, ApiError> {
        let url = self.url(&self.history_url_path(thread_id));
        let req = transport::authorize(self.rest.get(&url), self.bearer.as_deref());
        // One request per call; the finalize loop owns history retries.
        let response = transport::send_checked(req).await?;
        let response: HistoryResponse = transport::read_json(response).await?;
        Ok(response.into())
    }
}

/// Frames decoded from a live SSE response body.
pub struct HttpFrameSource {
    response: reqwest::Response,
    decoder: SseDecoder,
    done: bool,
}

impl HttpFrameSource {
    fn new(response: reqwest::Response) -> Self {
        Self {
            response,
            decoder: SseDecoder::new(),
            done: false,
        }
    }
}

#[async_trait]
impl FrameSource for HttpFrameSource {
    async fn next_frame(&mut self) -> Option<Result<StreamFrame, ApiError>> {
        loop {
            if let Some(payload) = self.decoder.next_payload() {
                return Some(parse_frame(&payload));
            }
            if self.done {
                return None;
            }
            match self.response.chunk().await {
                Ok(Some(bytes)) => self.decoder.push(&bytes),
                Ok(None) => {
                    self.decoder.finish();
                    self.done = true;
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(err.into()));
                }
            }
        }
    }
}
