//! Per-request session control.
//!
//! # Responsibilities
//! - Decide eligibility (GET and HEAD only) before any backend work
//! - Own the request context: backend address, outbound buffer, parser
//! - Drive resolve → connect → send → read head → filter → respond
//! - Finalize every context exactly once, whichever branch ends it
//!
//! # Design Decisions
//! - Phases are an explicit enum with a checked transition table
//! - The response body stream owns the context, so the context lives exactly
//!   as long as the exchange; dropping it early finalizes as aborted
//! - Nothing is retried; every error is local to this request

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, Method, StatusCode};
use axum::response::Response;
use bytes::{Bytes, BytesMut};

use crate::error::{ProtocolError, ProxyError};
use crate::lifecycle::{ContextGuard, ContextTracker};
use crate::observability::metrics;
use crate::resilience::timeouts::{with_timeout, Stage, Timeouts};
use crate::routing::Engine;
use crate::upstream::body::{BodyFraming, BodyStreamer};
use crate::upstream::driver::{
    exchange_head, BodyRelay, HeadRead, HeaderProgress, Outcome, UpstreamConnection, UpstreamHandler,
};
use crate::upstream::parser::{HeaderField, ParseOutcome, ParsedHead, ResponseParser};
use crate::upstream::policy::HeaderPolicy;
use crate::upstream::resolver::{BackendAddress, Resolve};

/// Where a request context is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Created,
    Resolving,
    Connecting,
    Sending,
    ReadingHeader,
    StreamingBody,
    Finalized,
}

impl SessionPhase {
    /// Whether `self → next` is a legal transition.
    pub fn can_advance_to(self, next: SessionPhase) -> bool {
        use SessionPhase::*;
        match (self, next) {
            (Finalized, _) => false,
            (_, Finalized) => true,
            (Created, Resolving)
            | (Resolving, Connecting)
            | (Connecting, Sending)
            | (Sending, ReadingHeader)
            | (ReadingHeader, StreamingBody) => true,
            _ => false,
        }
    }

    pub fn is_final(self) -> bool {
        self == SessionPhase::Finalized
    }
}

/// Only GET and HEAD are relayed. Returns whether the request is HEAD.
pub fn check_method(method: &Method) -> Result<bool, ProxyError> {
    if method == Method::GET {
        Ok(false)
    } else if method == Method::HEAD {
        Ok(true)
    } else {
        Err(ProxyError::MethodNotAllowed(method.clone()))
    }
}

/// State of one client request.
#[derive(Debug)]
pub struct RequestContext {
    request_id: String,
    engine: Arc<Engine>,
    query: String,
    backend: Option<BackendAddress>,
    outbound: Option<Bytes>,
    parser: ResponseParser,
    max_head_bytes: usize,
    phase: SessionPhase,
    /// Status sent to the client, once known.
    status: Option<u16>,
    start: Instant,
    _guard: ContextGuard,
}

impl RequestContext {
    pub fn new(
        request_id: impl Into<String>,
        engine: Arc<Engine>,
        query: impl Into<String>,
        max_head_bytes: usize,
        guard: ContextGuard,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            engine,
            query: query.into(),
            backend: None,
            outbound: None,
            parser: ResponseParser::new(max_head_bytes),
            max_head_bytes,
            phase: SessionPhase::Created,
            status: None,
            start: Instant::now(),
            _guard: guard,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// The request handed to the backend, once built.
    pub fn outbound(&self) -> Option<&Bytes> {
        self.outbound.as_ref()
    }

    fn advance(&mut self, next: SessionPhase) {
        if self.phase == next {
            return;
        }
        debug_assert!(
            self.phase.can_advance_to(next),
            "illegal phase transition {:?} -> {:?}",
            self.phase,
            next
        );
        tracing::trace!(request_id = %self.request_id, from = ?self.phase, to = ?next, "Phase change");
        self.phase = next;
    }

    fn take_head(&mut self) -> Result<ParsedHead, ProxyError> {
        self.parser
            .take_head()
            .ok_or_else(|| ProtocolError::HeaderTruncated.into())
    }
}

impl UpstreamHandler for RequestContext {
    fn create_request(&mut self) -> Result<Bytes, ProxyError> {
        self.advance(SessionPhase::Sending);
        let request = self.engine.template.build(&self.query)?;
        self.outbound = Some(request.clone());
        Ok(request)
    }

    fn process_header(&mut self, buf: &mut BytesMut, eof: bool) -> Result<HeaderProgress, ProxyError> {
        self.advance(SessionPhase::ReadingHeader);
        loop {
            let mut outcome = self.parser.parse(buf)?;
            if eof && outcome == ParseOutcome::Incomplete {
                outcome = self.parser.finish(buf)?;
            }
            match outcome {
                ParseOutcome::Incomplete => return Ok(HeaderProgress::Again),
                ParseOutcome::Legacy => return Ok(HeaderProgress::Done),
                ParseOutcome::Headers => {}
            }

            let code = self.parser.status().map_or(0, |status| status.code);
            match code {
                101 => return Err(ProtocolError::InvalidStatus(code).into()),
                100..=199 => {
                    // Interim head; the final one follows on the same connection.
                    tracing::debug!(request_id = %self.request_id, status = code, "Skipping interim response");
                    self.parser = ResponseParser::new(self.max_head_bytes);
                    if buf.is_empty() {
                        if eof {
                            return Err(ProtocolError::HeaderTruncated.into());
                        }
                        return Ok(HeaderProgress::Again);
                    }
                }
                _ => return Ok(HeaderProgress::Done),
            }
        }
    }

    fn finalize(&mut self, outcome: Outcome) {
        if self.phase.is_final() {
            return;
        }
        self.advance(SessionPhase::Finalized);

        let elapsed_ms = self.start.elapsed().as_millis() as u64;
        let backend = self.backend.map(|b| b.to_string()).unwrap_or_default();
        let (status, label) = match &outcome {
            Outcome::Completed { body_bytes } => {
                let status = self.status.unwrap_or(200);
                tracing::info!(
                    request_id = %self.request_id,
                    engine = %self.engine.name,
                    backend = %backend,
                    status,
                    body_bytes,
                    elapsed_ms,
                    "Request finalized"
                );
                (status, "completed")
            }
            Outcome::Failed { kind, status } => {
                // Mid-body failures keep the status the client already saw.
                let status = self.status.unwrap_or(*status);
                tracing::warn!(
                    request_id = %self.request_id,
                    engine = %self.engine.name,
                    backend = %backend,
                    status,
                    error_kind = *kind,
                    elapsed_ms,
                    "Request failed"
                );
                (status, "failed")
            }
            Outcome::Aborted => {
                let status = self.status.unwrap_or(499);
                tracing::info!(
                    request_id = %self.request_id,
                    engine = %self.engine.name,
                    backend = %backend,
                    status,
                    elapsed_ms,
                    "Client went away, request aborted"
                );
                (status, "aborted")
            }
        };
        metrics::record_request(&self.engine.name, status, label, self.start);
    }
}

impl Drop for RequestContext {
    fn drop(&mut self) {
        if !self.phase.is_final() {
            self.finalize(Outcome::Aborted);
        }
    }
}

/// Shared per-server settings for running sessions.
#[derive(Debug, Clone)]
pub struct Session {
    resolver: Arc<dyn Resolve>,
    timeouts: Timeouts,
    policy: Arc<HeaderPolicy>,
    buffer_size: usize,
    tracker: ContextTracker,
}

impl Session {
    pub fn new(
        resolver: Arc<dyn Resolve>,
        timeouts: Timeouts,
        policy: HeaderPolicy,
        buffer_size: usize,
        tracker: ContextTracker,
    ) -> Self {
        Self {
            resolver,
            timeouts,
            policy: Arc::new(policy),
            buffer_size,
            tracker,
        }
    }

    /// Relay one eligible request to `engine`. Errors are returned before the
    /// response head exists; later failures abort the body stream instead.
    pub async fn run(
        &self,
        request_id: &str,
        engine: Arc<Engine>,
        query: &str,
        head_request: bool,
    ) -> Result<Response, ProxyError> {
        let mut ctx = RequestContext::new(
            request_id,
            engine,
            query,
            self.buffer_size,
            self.tracker.track(),
        );

        let (conn, head_read, head, framing) = match self.exchange(&mut ctx, head_request).await {
            Ok(exchanged) => exchanged,
            Err(e) => {
                tracing::error!(
                    request_id = %request_id,
                    engine = %ctx.engine.name,
                    error = %e,
                    "Upstream exchange failed"
                );
                ctx.finalize(Outcome::failed(&e));
                return Err(e);
            }
        };

        let response = match self.response_head(&head) {
            Ok(builder) => builder,
            Err(e) => {
                ctx.finalize(Outcome::failed(&e));
                return Err(e);
            }
        };
        ctx.status = Some(head.status.code);
        ctx.advance(SessionPhase::StreamingBody);
        tracing::debug!(
            request_id = %request_id,
            status = head.status.code,
            legacy = head.legacy,
            framing = ?framing,
            "Relaying upstream response"
        );

        if framing == BodyFraming::Empty {
            ctx.finalize(Outcome::Completed { body_bytes: 0 });
            return Ok(response.map(|()| Body::empty()));
        }

        let relay = BodyRelay::new(ctx, conn, BodyStreamer::new(framing), head_read);
        Ok(response.map(|()| Body::from_stream(relay.into_stream())))
    }

    async fn exchange(
        &self,
        ctx: &mut RequestContext,
        head_request: bool,
    ) -> Result<(UpstreamConnection, HeadRead, ParsedHead, BodyFraming), ProxyError> {
        ctx.advance(SessionPhase::Resolving);
        let engine = Arc::clone(&ctx.engine);
        let backend = with_timeout(
            &self.timeouts,
            Stage::Resolve,
            self.resolver.resolve(&engine.host, engine.port),
        )
        .await?;
        ctx.backend = Some(backend);
        tracing::debug!(request_id = %ctx.request_id, host = %engine.host, backend = %backend, "Backend resolved");

        ctx.advance(SessionPhase::Connecting);
        let mut conn = UpstreamConnection::connect(backend, self.timeouts, self.buffer_size).await?;

        let head_read = exchange_head(ctx, &mut conn).await?;
        let head = ctx.take_head()?;
        let framing = BodyFraming::for_response(&head, head_request)?;
        Ok((conn, head_read, head, framing))
    }

    /// Build the client response head from the filtered backend head.
    fn response_head(&self, head: &ParsedHead) -> Result<Response<()>, ProxyError> {
        let code = head.status.code;
        let status = StatusCode::from_u16(code).map_err(|_| ProtocolError::InvalidStatus(code))?;

        let mut response = axum::http::Response::new(());
        *response.status_mut() = status;

        let forwarded = self.policy.filter(head.headers.clone());
        let headers = response.headers_mut();
        for field in forwarded {
            let (name, value) = header_pair(field)?;
            headers.append(name, value);
        }
        Ok(response)
    }
}

fn header_pair(field: HeaderField) -> Result<(HeaderName, HeaderValue), ProxyError> {
    let name = HeaderName::from_bytes(field.name.as_bytes())
        .map_err(|_| ProtocolError::InvalidHeader("header name"))?;
    let value = HeaderValue::from_maybe_shared(field.value)
        .map_err(|_| ProtocolError::InvalidHeader("header value"))?;
    Ok((name, value))
}
