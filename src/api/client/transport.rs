//! HTTP transport helpers shared by the API client.

use crate::error::ApiError;
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Build the client used for bounded JSON requests.
pub(super) fn build_rest_client(timeout: Duration, connect_timeout: Duration) -> reqwest::Client {
    // Fall back to reqwest defaults if builder creation fails for any reason.
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(connect_timeout)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Build the client used for run streams. Only connecting is bounded; the
/// body stays open for as long as the run produces events.
pub(super) fn build_stream_client(connect_timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Attach the bearer token when one is configured.
pub(super) fn authorize(
    req: reqwest::RequestBuilder,
    bearer: Option<&str>,
) -> reqwest::RequestBuilder {
    match bearer.filter(|value| !value.trim().is_empty()) {
        Some(token) => req.header("Authorization", format!("Bearer {token}")),
        None => req,
    }
}

/// Send a request and turn non-2xx statuses into [`ApiError::Status`].
pub(super) async fn send_checked(req: reqwest::RequestBuilder) -> Result<reqwest::Response, ApiError> {
    let response = req.send().await?;
    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        return Err(ApiError::status(status, body));
    }
    Ok(response)
}

/// Decode a successful response body as JSON.
pub(super) async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
    let text = response.text().await?;
    serde_json::from_str(&text)
        .map_err(|err| ApiError::InvalidResponse(format!("invalid JSON response: {err}")))
}

/// Percent-encode one URL path segment.
pub(crate) fn encode_path_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_segments_are_percent_encoded() {
        assert_eq!(encode_path_segment("abc-123"), "abc-123");
        assert_eq!(encode_path_segment("a b/c"), "a%20b%2Fc");
    }
}
