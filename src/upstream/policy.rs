//! Response header forwarding policy.
//!
//! # Responsibilities
//! - Decide per backend header: forward, hide, or keep the synthesized default
//! - Enforce the fixed deny-list of accel-control headers
//! - Strip hop-by-hop transport headers; the client connection is framed
//!   independently of the backend connection
//!
//! # Design Decisions
//! - Names are compared on the lowercased copy; forwarding keeps original casing
//! - The deny-list cannot be overridden by configuration, only extended

use std::collections::HashSet;

use crate::upstream::parser::{HeaderField, HeaderTag};

/// Headers that are only meaningful between a proxy and its own internals.
pub const DENY_LIST: [&str; 6] = [
    "x-pad",
    "x-accel-expires",
    "x-accel-redirect",
    "x-accel-limit-rate",
    "x-accel-buffering",
    "x-accel-charset",
];

/// Connection-scoped headers (RFC 9110 §7.6.1).
pub const HOP_BY_HOP: [&str; 7] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Header filter applied once per response, before the head is sent.
#[derive(Debug, Clone, Default)]
pub struct HeaderPolicy {
    extra_hide: HashSet<String>,
}

impl HeaderPolicy {
    /// Build a policy hiding `extra_hide` on top of the fixed lists.
    pub fn new<I, S>(extra_hide: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            extra_hide: extra_hide
                .into_iter()
                .map(|name| name.as_ref().trim().to_ascii_lowercase())
                .collect(),
        }
    }

    /// Tag every field. Any `Transfer-Encoding` overrides `Content-Length`
    /// (RFC 9112 §6.3), so the length is hidden alongside it.
    pub fn apply(&self, headers: &mut [HeaderField]) {
        let nominated = connection_tokens(headers);
        let transfer_encoded = headers
            .iter()
            .any(|field| field.lowercase_name == "transfer-encoding");

        for field in headers.iter_mut() {
            let name = field.lowercase_name.as_str();
            let hidden = DENY_LIST.contains(&name)
                || HOP_BY_HOP.contains(&name)
                || nominated.contains(name)
                || self.extra_hide.contains(name)
                || (transfer_encoded && name == "content-length");

            if hidden {
                tracing::trace!(header = %field.name, "Hiding upstream header");
                field.tag = HeaderTag::Hide;
            }
        }
    }

    /// Tag the fields and return the ones that reach the client, in order.
    pub fn filter(&self, mut headers: Vec<HeaderField>) -> Vec<HeaderField> {
        self.apply(&mut headers);
        headers.retain(|field| field.tag != HeaderTag::Hide);
        headers
    }
}

/// Names listed in `Connection` header values, lowercased.
fn connection_tokens(headers: &[HeaderField]) -> HashSet<String> {
    headers
        .iter()
        .filter(|field| field.lowercase_name == "connection")
        .filter_map(|field| field.value_str())
        .flat_map(|value| value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(headers: &[HeaderField]) -> Vec<&str> {
        headers.iter().map(|h| h.name.as_str()).collect()
    }

    #[test]
    fn deny_list_never_forwarded() {
        let policy = HeaderPolicy::default();
        let headers = vec![
            HeaderField::new("Content-Type", "text/html"),
            HeaderField::new("X-Accel-Redirect", "/internal"),
            HeaderField::new("x-pad", "avoid browser bug"),
            HeaderField::new("X-ACCEL-BUFFERING", "no"),
            HeaderField::new("X-Custom", "kept"),
        ];
        let forwarded = policy.filter(headers);
        assert_eq!(names(&forwarded), ["Content-Type", "X-Custom"]);
    }

    #[test]
    fn hop_by_hop_and_nominated_headers_hidden() {
        let policy = HeaderPolicy::default();
        let headers = vec![
            HeaderField::new("Connection", "close, X-Session-Hint"),
            HeaderField::new("Keep-Alive", "timeout=5"),
            HeaderField::new("X-Session-Hint", "abc"),
            HeaderField::new("Cache-Control", "no-cache"),
        ];
        let forwarded = policy.filter(headers);
        assert_eq!(names(&forwarded), ["Cache-Control"]);
    }

    #[test]
    fn content_length_dropped_under_any_transfer_encoding() {
        let policy = HeaderPolicy::default();
        let chunked = vec![
            HeaderField::new("Transfer-Encoding", "chunked"),
            HeaderField::new("Content-Length", "10"),
        ];
        assert!(policy.filter(chunked).is_empty());

        let gzip = vec![
            HeaderField::new("Content-Length", "2"),
            HeaderField::new("Transfer-Encoding", "gzip"),
            HeaderField::new("Content-Type", "text/plain"),
        ];
        assert_eq!(names(&policy.filter(gzip)), ["Content-Type"]);

        let forwarded = policy.filter(vec![HeaderField::new("Content-Length", "10")]);
        assert_eq!(names(&forwarded), ["Content-Length"]);
    }

    #[test]
    fn configured_hides_extend_the_lists() {
        let policy = HeaderPolicy::new(["Set-Cookie", " X-Powered-By "]);
        let mut headers = vec![
            HeaderField::new("set-cookie", "a=b"),
            HeaderField::new("X-Powered-By", "php"),
            HeaderField::new("Vary", "Accept"),
        ];
        policy.apply(&mut headers);
        let tags: Vec<_> = headers.iter().map(|h| h.tag).collect();
        assert_eq!(tags, [HeaderTag::Hide, HeaderTag::Hide, HeaderTag::Forward]);
    }

    #[test]
    fn synthesized_defaults_survive() {
        let policy = HeaderPolicy::default();
        let mut server = HeaderField::new("Server", "");
        server.tag = HeaderTag::Default;
        let forwarded = policy.filter(vec![server]);
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].tag, HeaderTag::Default);
    }
}
