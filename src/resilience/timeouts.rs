//! Timeout enforcement.
//!
//! # Responsibilities
//! - Wrap backend calls with timeout
//! - Enforce connect, send and read timeouts per backend connection
//! - Cancel operations cleanly on timeout
//!
//! # Design Decisions
//! - Uses Tokio's timeout facilities
//! - Timeout errors are distinct from other errors
//! - Timed-out requests return 504 Gateway Timeout
//! - The read timeout bounds the gap between two reads, not the whole body

use std::fmt;
use std::future::Future;
use std::time::Duration;

use crate::config::TimeoutConfig;
use crate::error::ProxyError;

/// Which part of the upstream exchange ran out of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Resolve,
    Connect,
    Send,
    Read,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Stage::Resolve => "resolving backend",
            Stage::Connect => "connecting",
            Stage::Send => "sending request",
            Stage::Read => "reading response",
        };
        f.write_str(text)
    }
}

/// Per-connection deadlines derived from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub send: Duration,
    pub read: Duration,
}

impl Timeouts {
    pub fn for_stage(&self, stage: Stage) -> Duration {
        match stage {
            // Resolution shares the connect budget.
            Stage::Resolve | Stage::Connect => self.connect,
            Stage::Send => self.send,
            Stage::Read => self.read,
        }
    }
}

impl From<&TimeoutConfig> for Timeouts {
    fn from(config: &TimeoutConfig) -> Self {
        Self {
            connect: Duration::from_millis(config.connect_ms),
            send: Duration::from_millis(config.send_ms),
            read: Duration::from_millis(config.read_ms),
        }
    }
}

/// Run `fut` under the deadline for `stage`.
pub async fn with_timeout<F, T>(timeouts: &Timeouts, stage: Stage, fut: F) -> Result<T, ProxyError>
where
    F: Future<Output = Result<T, ProxyError>>,
{
    match tokio::time::timeout(timeouts.for_stage(stage), fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(stage = %stage, "Upstream timed out");
            Err(ProxyError::UpstreamTimeout(stage))
        }
    }
}
