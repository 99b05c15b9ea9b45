//! Failures of remote calls (OpenAI, Chroma, Pinecone) and the shared HTTP
//! plumbing used to make them.

use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Errors that can occur when calling a remote provider or backend.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Network-level failure (DNS, timeout, connection reset, etc.)
    #[error("network error: {0}")]
    Network(String),
    /// Authentication failure (invalid or expired API key)
    #[error("auth error: {0}")]
    Auth(String),
    /// Rate limit exceeded
    #[error("rate limited: {0}")]
    RateLimit(String),
    /// Any other non-success status
    #[error("HTTP {status}: {message}")]
    Api { status: u16, message: String },
    /// Response could not be parsed
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

/// Pull a human-readable message out of an error body.
///
/// OpenAI and Pinecone nest it as `{"error":{"message":..}}`, Chroma uses
/// `{"error":"..","message":".."}`. Anything else is returned verbatim.
fn error_message(body: &str) -> String {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        return body.to_string();
    };

    let nested = value
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str());
    let flat = value.get("message").and_then(|m| m.as_str());
    let bare = value.get("error").and_then(|e| e.as_str());

    nested
        .or(flat)
        .or(bare)
        .map(str::to_string)
        .unwrap_or_else(|| body.to_string())
}

/// Map an HTTP error status code and body to an `UpstreamError`.
pub fn map_error_status(status: u16, body: &str) -> UpstreamError {
    let message = error_message(body);

    match status {
        401 | 403 => UpstreamError::Auth(message),
        429 => UpstreamError::RateLimit(message),
        _ => UpstreamError::Api { status, message },
    }
}

/// Send a request and fail on any non-success status.
pub(crate) async fn send_checked(request: RequestBuilder) -> Result<Response, UpstreamError> {
    let response = request
        .send()
        .await
        .map_err(|e| UpstreamError::Network(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body_text = response.text().await.unwrap_or_default();
        return Err(map_error_status(status.as_u16(), &body_text));
    }

    Ok(response)
}

/// Send a request and decode its JSON body.
pub(crate) async fn send_json<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, UpstreamError> {
    let response = send_checked(request).await?;
    let bytes = response
        .bytes()
        .await
        .map_err(|e| UpstreamError::Network(e.to_string()))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| UpstreamError::MalformedResponse(format!("invalid JSON body: {e}")))
}
