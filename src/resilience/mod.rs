//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Request to backend:
//!     → timeouts.rs (deadline per resolve/connect/send/read)
//!     → On expiry: UpstreamTimeout, mapped to 504 or a body abort
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every backend operation has a deadline
//! - No retries: every request gets exactly one backend connection

pub mod timeouts;
