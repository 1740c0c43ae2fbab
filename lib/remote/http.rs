//! HTTP client abstraction for pluggable backends.

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use std::future::Future;

use thiserror::Error;

/// Errors surfaced by an [`HttpClient`] implementation.
#[derive(Debug, Error)]
pub enum HttpClientError {
    /// The request exceeded the client's timeout.
    #[error("request timed out")]
    Timeout,

    /// DNS resolution or TCP/TLS connection failure.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Any other transport-level failure.
    #[error("transport error: {0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

/// An HTTP request to be sent by an [`HttpClient`] implementation.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// The HTTP method.
    pub method: Method,
    /// The fully-qualified URL.
    pub url: String,
    /// Request headers.
    pub headers: HeaderMap,
}

impl HttpRequest {
    /// A GET request for `url` with no extra headers.
    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers: HeaderMap::new(),
        }
    }
}

/// An HTTP response returned by an [`HttpClient`] implementation.
#[derive(Debug)]
pub struct HttpResponse {
    /// The HTTP status code.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
    /// Response body bytes.
    pub body: Bytes,
}

/// Trait for pluggable HTTP client backends.
///
/// Uses Rust edition 2024's native `impl Future` in traits (RPITIT) —
/// no `async-trait` macro required. Implementations must not follow
/// redirects themselves; redirect handling belongs to the resolver.
pub trait HttpClient: Send + Sync {
    /// Send an HTTP request and return the response.
    fn send(
        &self,
        request: HttpRequest,
    ) -> impl Future<Output = Result<HttpResponse, HttpClientError>> + Send;
}
