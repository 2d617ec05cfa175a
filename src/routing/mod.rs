//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request path
//!     → router.rs (location lookup)
//!     → matcher.rs (path prefix test)
//!     → Return: matched Location (with its engine) or NoMatch
//!
//! Compilation (at startup):
//!     LocationConfig[] + EngineConfig[]
//!     → Compile request templates
//!     → Sort locations by prefix length
//!     → Freeze as immutable Router
//! ```
//!
//! # Design Decisions
//! - Locations compiled at startup, immutable at runtime
//! - Longest prefix wins, like nginx prefix locations
//! - Deterministic: same path always matches same location

pub mod matcher;
pub mod router;

pub use router::{Engine, Location, Router};
