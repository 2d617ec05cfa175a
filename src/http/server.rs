//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with the relay handler
//! - Wire up middleware (tracing, request ID)
//! - Bind server to listener with graceful shutdown
//! - Dispatch requests to a location and its engine
//! - Hand eligible requests to the session controller

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::State,
    http::Request,
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower::ServiceBuilder;
use tower_http::{
    request_id::{PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::http::request::{request_id, MakeRequestUuid};
use crate::lifecycle::ContextTracker;
use crate::observability::metrics;
use crate::resilience::timeouts::Timeouts;
use crate::routing::Router as LocationRouter;
use crate::upstream::policy::HeaderPolicy;
use crate::upstream::resolver::{DnsResolver, Resolve};
use crate::upstream::session::{check_method, Session};

/// How long shutdown waits for in-flight contexts after the listener stops.
const DRAIN_DEADLINE: Duration = Duration::from_secs(5);

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<LocationRouter>,
    pub session: Session,
    pub max_discard_body: usize,
}

/// HTTP server for the relay.
pub struct HttpServer {
    router: Router,
    tracker: ContextTracker,
}

impl HttpServer {
    /// Create a server resolving backends through the system resolver.
    pub fn new(config: ProxyConfig) -> Self {
        Self::with_resolver(config, Arc::new(DnsResolver))
    }

    /// Create a server with a custom backend resolver.
    pub fn with_resolver(config: ProxyConfig, resolver: Arc<dyn Resolve>) -> Self {
        let tracker = ContextTracker::new();
        let session = Session::new(
            resolver,
            Timeouts::from(&config.timeouts),
            HeaderPolicy::new(&config.headers.hide),
            config.buffers.buffer_size,
            tracker.clone(),
        );
        let state = AppState {
            router: Arc::new(LocationRouter::from_config(&config)),
            session,
            max_discard_body: config.buffers.max_discard_body,
        };

        let router = Self::build_router(state);
        Self {
            router,
            tracker,
        }
    }

    /// Build the Axum router with all middleware layers.
    fn build_router(state: AppState) -> Router {
        Router::new()
            .route("/{*path}", any(relay_handler))
            .route("/", any(relay_handler))
            .with_state(state)
            .layer(
                ServiceBuilder::new()
                    .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                    .layer(TraceLayer::new_for_http())
                    .layer(PropagateRequestIdLayer::x_request_id()),
            )
    }

    /// Serve on `listener` until `shutdown_rx` fires, then drain.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        axum::serve(listener, self.router)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                tracing::info!("Shutdown signal received");
            })
            .await?;

        if !self.tracker.drain(DRAIN_DEADLINE).await {
            tracing::warn!(
                active = self.tracker.active_count(),
                "Request contexts still alive after drain deadline"
            );
        }
        tracing::info!("HTTP server stopped");
        Ok(())
    }

    /// Live request context counter.
    pub fn tracker(&self) -> ContextTracker {
        self.tracker.clone()
    }
}

/// Relay handler: eligibility, location lookup, then the backend exchange.
async fn relay_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let start = Instant::now();
    let request_id = request_id(request.headers());
    let (parts, body) = request.into_parts();
    let path = parts.uri.path().to_string();

    tracing::debug!(
        request_id = %request_id,
        method = %parts.method,
        path = %path,
        "Relaying request"
    );

    let head_request = match check_method(&parts.method) {
        Ok(head_request) => head_request,
        Err(e) => return reject(&request_id, e, start),
    };

    let location = match state.router.match_path(&path) {
        Some(location) => location,
        None => return reject(&request_id, ProxyError::NoLocation(path), start),
    };
    let engine = match &location.engine {
        Some(engine) => Arc::clone(engine),
        None => {
            let e = ProxyError::UnknownEngine(location.engine_name.clone());
            return reject(&request_id, e, start);
        }
    };

    // The request body is never forwarded; read and drop it.
    if let Err(e) = axum::body::to_bytes(body, state.max_discard_body).await {
        tracing::debug!(request_id = %request_id, error = %e, "Request body not fully drained");
    }

    let query = parts.uri.query().unwrap_or("");
    match state
        .session
        .run(&request_id, engine, query, head_request)
        .await
    {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

/// Answer a request that never reaches the session controller.
fn reject(request_id: &str, e: ProxyError, start: Instant) -> Response {
    let status = e.status();
    tracing::warn!(request_id = %request_id, status = status.as_u16(), error = %e, "Request rejected");
    metrics::record_request("none", status.as_u16(), "rejected", start);
    e.into_response()
}
