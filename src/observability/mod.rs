//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Every request context produces:
//!     → logging.rs (structured log events, pretty or JSON)
//!     → metrics.rs (request counter, latency histogram, live-context gauge)
//!
//! Consumers:
//!     → Log aggregation (stdout)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Request ID is attached to every event emitted for a context
//! - Metric updates are fire-and-forget; with no recorder installed they
//!   cost a branch

pub mod logging;
pub mod metrics;
