//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Per request (context.rs):
//!     Handler entry → ContextGuard → ... → guard dropped with the context
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Stop accepting → Drain in-flight contexts → Exit
//! ```
//!
//! # Design Decisions
//! - A request context owns its guard, so the live count can never leak
//!   past the context, whichever way it ends
//! - Shutdown is a broadcast; the server and the binary subscribe

pub mod context;
pub mod shutdown;

pub use context::{ContextGuard, ContextId, ContextTracker};
pub use shutdown::Shutdown;
