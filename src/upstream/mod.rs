//! Upstream relay subsystem.
//!
//! # Data Flow
//! ```text
//! Eligible client request (GET/HEAD) + Engine
//!     → resolver.rs (host → one IPv4 BackendAddress, per request)
//!     → driver.rs (connect, send, read with deadlines)
//!         → request.rs (one contiguous request buffer)
//!         → parser.rs (status line + headers, incremental, HTTP/0.9 fallback)
//!     → policy.rs (hide deny-listed and hop-by-hop headers)
//!     → body.rs (length / chunked / until-close framing, truncation checks)
//!     → session.rs (phases, finalization, axum Response)
//! ```
//!
//! # Design Decisions
//! - One backend connection per request, never pooled or reused
//! - Parsing works on whatever chunk sizes the socket delivers
//! - All state is owned by the request; nothing here takes a lock

pub mod body;
pub mod driver;
pub mod parser;
pub mod policy;
pub mod request;
pub mod resolver;
pub mod session;

pub use resolver::{BackendAddress, DnsResolver, Resolve, StaticResolver};
pub use session::{RequestContext, Session, SessionPhase};
