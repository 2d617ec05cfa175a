//! Error taxonomy for the relay.
//!
//! Every error is local to one client request. Nothing here is retried; the
//! variant only decides which status the client sees, or whether the client
//! connection is aborted once the response head is already out.

use std::io;

use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::resilience::timeouts::Stage;
use crate::upstream::resolver::BackendAddress;

/// Violations of HTTP/1.x framing by the backend.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("upstream sent invalid header: {0}")]
    InvalidHeader(&'static str),

    #[error("upstream sent invalid status code {0}")]
    InvalidStatus(u16),

    #[error("upstream sent too big header (limit {limit} bytes)")]
    HeaderTooLarge { limit: usize },

    #[error("upstream prematurely closed connection while reading response header")]
    HeaderTruncated,

    #[error("upstream sent invalid Content-Length")]
    InvalidContentLength,

    #[error("upstream sent invalid chunked body: {0}")]
    InvalidChunk(&'static str),

    #[error("upstream prematurely closed connection after {received} of {expected} body bytes")]
    BodyTruncated { expected: u64, received: u64 },

    #[error("upstream prematurely closed connection inside a chunked body")]
    ChunkedTruncated,
}

/// Errors that can terminate a proxied request.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Only GET and HEAD enter the proxy path.
    #[error("method {0} not allowed")]
    MethodNotAllowed(Method),

    /// No configured location covers the request path.
    #[error("no location configured for {0}")]
    NoLocation(String),

    /// Location names an engine that is not configured.
    #[error("unknown search engine {0:?}")]
    UnknownEngine(String),

    #[error("failed to resolve {host}: {reason}")]
    Resolution { host: String, reason: String },

    #[error("failed to connect to {addr}: {source}")]
    UpstreamConnect {
        addr: BackendAddress,
        #[source]
        source: io::Error,
    },

    #[error("upstream timed out while {0}")]
    UpstreamTimeout(Stage),

    #[error("upstream I/O error: {0}")]
    UpstreamIo(#[source] io::Error),

    #[error(transparent)]
    UpstreamProtocol(#[from] ProtocolError),

    #[error("failed to allocate {0} byte buffer")]
    Allocation(usize),
}

impl ProxyError {
    /// Status the client receives when the error happens before the response
    /// head is sent.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            ProxyError::NoLocation(_) => StatusCode::NOT_FOUND,
            ProxyError::UnknownEngine(_) | ProxyError::Allocation(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ProxyError::Resolution { .. }
            | ProxyError::UpstreamConnect { .. }
            | ProxyError::UpstreamIo(_)
            | ProxyError::UpstreamProtocol(_) => StatusCode::BAD_GATEWAY,
            ProxyError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::MethodNotAllowed(_) => "method_not_allowed",
            ProxyError::NoLocation(_) => "no_location",
            ProxyError::UnknownEngine(_) => "unknown_engine",
            ProxyError::Resolution { .. } => "resolution",
            ProxyError::UpstreamConnect { .. } => "upstream_connect",
            ProxyError::UpstreamTimeout(_) => "upstream_timeout",
            ProxyError::UpstreamIo(_) => "upstream_io",
            ProxyError::UpstreamProtocol(_) => "upstream_protocol",
            ProxyError::Allocation(_) => "allocation",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut response = (status, status.canonical_reason().unwrap_or("Error")).into_response();
        if let ProxyError::MethodNotAllowed(_) = self {
            response
                .headers_mut()
                .insert(header::ALLOW, HeaderValue::from_static("GET, HEAD"));
        }
        response
    }
}
