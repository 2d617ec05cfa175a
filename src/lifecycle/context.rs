//! Request context lifetime tracking.
//!
//! # Responsibilities
//! - Generate unique context IDs for tracing
//! - Count live request contexts (between handler entry and finalize)
//! - Let shutdown wait for in-flight contexts to drain

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::observability::metrics;

/// Relaxed ordering is enough, IDs only need to be unique.
static CONTEXT_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a request context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

impl ContextId {
    pub fn new() -> Self {
        Self(CONTEXT_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Counts live request contexts.
#[derive(Debug, Clone, Default)]
pub struct ContextTracker {
    active_count: Arc<AtomicU64>,
}

impl ContextTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new context. The count drops again when the guard does.
    pub fn track(&self) -> ContextGuard {
        let count = self.active_count.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::record_active_contexts(count);
        ContextGuard {
            active_count: Arc::clone(&self.active_count),
            id: ContextId::new(),
        }
    }

    pub fn active_count(&self) -> u64 {
        self.active_count.load(Ordering::SeqCst)
    }

    /// Wait until every context is gone, or `deadline` passes. Returns
    /// whether the tracker drained.
    pub async fn drain(&self, deadline: Duration) -> bool {
        let wait = async {
            while self.active_count() > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };
        tokio::time::timeout(deadline, wait).await.is_ok()
    }
}

/// Held by a request context for its whole life.
#[derive(Debug)]
pub struct ContextGuard {
    active_count: Arc<AtomicU64>,
    id: ContextId,
}

impl ContextGuard {
    pub fn id(&self) -> ContextId {
        self.id
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let count = self.active_count.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        metrics::record_active_contexts(count);
        tracing::trace!(context_id = %self.id, "Context released");
    }
}
