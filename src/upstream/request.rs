//! Outbound request serialization.
//!
//! # Responsibilities
//! - Render the fixed backend request for an engine
//! - Substitute the client's query string at the single `{query}` point
//! - Size the buffer exactly before writing into it
//!
//! # Design Decisions
//! - Always `HTTP/1.1` with `Connection: close`; backend connections are
//!   never reused
//! - The query is inserted verbatim, never decoded or re-encoded
//! - The rendered request is frozen into `Bytes`, so nothing can change it
//!   after it has been handed to the connection

use bytes::Bytes;
use thiserror::Error;

use crate::error::ProxyError;

/// Substitution point for the client's query string in a request target.
pub const QUERY_PLACEHOLDER: &str = "{query}";

const METHOD: &[u8] = b"GET ";
const VERSION_AND_HOST: &[u8] = b" HTTP/1.1\r\nHost: ";
const TRAILER: &[u8] = b"\r\nConnection: close\r\n\r\n";

/// Reasons a configured template cannot be used.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("request target must start with '/'")]
    RelativeTarget,

    #[error("request target contains whitespace or control characters")]
    InvalidTarget,

    #[error("request target has {0} substitution points, at most one is allowed")]
    TooManyPlaceholders(usize),

    #[error("backend host is empty or contains invalid characters")]
    InvalidHost,
}

/// A backend request with at most one substitution point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTemplate {
    /// Target text before the placeholder (or the whole target).
    prefix: String,
    /// Target text after the placeholder; `None` when there is no placeholder.
    suffix: Option<String>,
    /// Value of the `Host` header.
    host: String,
}

impl RequestTemplate {
    /// Parse `target` (e.g. `/search?q={query}`) for a backend reached as
    /// `host:port`.
    pub fn new(target: &str, host: &str, port: u16) -> Result<Self, TemplateError> {
        if !target.starts_with('/') {
            return Err(TemplateError::RelativeTarget);
        }
        if target.bytes().any(|b| b.is_ascii_whitespace() || b.is_ascii_control()) {
            return Err(TemplateError::InvalidTarget);
        }
        if host.is_empty()
            || !host
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_'))
        {
            return Err(TemplateError::InvalidHost);
        }

        let points = target.matches(QUERY_PLACEHOLDER).count();
        if points > 1 {
            return Err(TemplateError::TooManyPlaceholders(points));
        }

        let (prefix, suffix) = match target.split_once(QUERY_PLACEHOLDER) {
            Some((before, after)) => (before.to_string(), Some(after.to_string())),
            None => (target.to_string(), None),
        };

        let host = if port == 80 {
            host.to_string()
        } else {
            format!("{}:{}", host, port)
        };

        Ok(Self { prefix, suffix, host })
    }

    /// Exact number of bytes `build` writes for `query`.
    pub fn encoded_len(&self, query: &str) -> usize {
        let target = match &self.suffix {
            Some(suffix) => self.prefix.len() + query.len() + suffix.len(),
            None => self.prefix.len(),
        };
        METHOD.len() + target + VERSION_AND_HOST.len() + self.host.len() + TRAILER.len()
    }

    /// Render the request into one contiguous buffer.
    pub fn build(&self, query: &str) -> Result<Bytes, ProxyError> {
        let len = self.encoded_len(query);
        let mut buf: Vec<u8> = Vec::new();
        buf.try_reserve_exact(len)
            .map_err(|_| ProxyError::Allocation(len))?;

        buf.extend_from_slice(METHOD);
        buf.extend_from_slice(self.prefix.as_bytes());
        if let Some(suffix) = &self.suffix {
            buf.extend_from_slice(query.as_bytes());
            buf.extend_from_slice(suffix.as_bytes());
        }
        buf.extend_from_slice(VERSION_AND_HOST);
        buf.extend_from_slice(self.host.as_bytes());
        buf.extend_from_slice(TRAILER);

        debug_assert_eq!(buf.len(), len);
        Ok(Bytes::from(buf))
    }
}
