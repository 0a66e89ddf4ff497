//! Process-wide counters and the read-only dashboard seam.
//!
//! The dashboard is an external consumer; it gets a [`StatsProvider`] and a
//! [`ReadOnlyStore`] capability, never a handle back into the gateway.

use crate::queue::QueueStats;
use crate::store::conversation::{ConversationStore, MessageRecord, StoreResult, UserSummary};
use crate::supervisor::RelayState;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct GatewayStats {
    pub events_received: AtomicU64,
    pub invalid_dropped: AtomicU64,
    pub duplicates_dropped: AtomicU64,
    pub self_dropped: AtomicU64,
    pub ignored_kinds: AtomicU64,
    pub rate_limited: AtomicU64,
    pub queue_dropped: AtomicU64,
    pub fingerprint_dropped: AtomicU64,
    pub insufficient_funds: AtomicU64,
    pub responses_sent: AtomicU64,
    pub oracle_fallbacks: AtomicU64,
    pub receipts_applied: AtomicU64,
    pub balance_queries: AtomicU64,
}

impl GatewayStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            events_received: self.events_received.load(Ordering::Relaxed),
            invalid_dropped: self.invalid_dropped.load(Ordering::Relaxed),
            duplicates_dropped: self.duplicates_dropped.load(Ordering::Relaxed),
            self_dropped: self.self_dropped.load(Ordering::Relaxed),
            ignored_kinds: self.ignored_kinds.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            queue_dropped: self.queue_dropped.load(Ordering::Relaxed),
            fingerprint_dropped: self.fingerprint_dropped.load(Ordering::Relaxed),
            insufficient_funds: self.insufficient_funds.load(Ordering::Relaxed),
            responses_sent: self.responses_sent.load(Ordering::Relaxed),
            oracle_fallbacks: self.oracle_fallbacks.load(Ordering::Relaxed),
            receipts_applied: self.receipts_applied.load(Ordering::Relaxed),
            balance_queries: self.balance_queries.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub events_received: u64,
    pub invalid_dropped: u64,
    pub duplicates_dropped: u64,
    pub self_dropped: u64,
    pub ignored_kinds: u64,
    pub rate_limited: u64,
    pub queue_dropped: u64,
    pub fingerprint_dropped: u64,
    pub insufficient_funds: u64,
    pub responses_sent: u64,
    pub oracle_fallbacks: u64,
    pub receipts_applied: u64,
    pub balance_queries: u64,
}

/// One full dashboard frame.
#[derive(Debug, Clone, Serialize)]
pub struct GatewaySnapshot {
    pub stats: StatsSnapshot,
    pub queue: QueueStats,
    pub relays: Vec<RelayState>,
    pub breaker_state: &'static str,
    pub rate_buckets: usize,
}

/// Narrow capability handed to the dashboard.
pub trait StatsProvider: Send + Sync {
    fn snapshot(&self) -> GatewaySnapshot;
}

/// The gateway's [`StatsProvider`] implementation: cloneable handles to
/// every observable subsystem, no back-pointer to the pipeline.
pub struct StatsHub {
    stats: std::sync::Arc<GatewayStats>,
    queue: crate::queue::WorkQueue<crate::dispatcher::ProcessJob>,
    registry: std::sync::Arc<crate::supervisor::RelayRegistry>,
    breaker: std::sync::Arc<crate::breaker::CircuitBreaker>,
    rate: std::sync::Arc<crate::rate_limit::RateLimiter>,
}

impl StatsHub {
    pub fn new(
        stats: std::sync::Arc<GatewayStats>,
        queue: crate::queue::WorkQueue<crate::dispatcher::ProcessJob>,
        registry: std::sync::Arc<crate::supervisor::RelayRegistry>,
        breaker: std::sync::Arc<crate::breaker::CircuitBreaker>,
        rate: std::sync::Arc<crate::rate_limit::RateLimiter>,
    ) -> Self {
        Self {
            stats,
            queue,
            registry,
            breaker,
            rate,
        }
    }
}

impl StatsProvider for StatsHub {
    fn snapshot(&self) -> GatewaySnapshot {
        GatewaySnapshot {
            stats: self.stats.snapshot(),
            queue: self.queue.stats(),
            relays: self.registry.snapshot(),
            breaker_state: self.breaker.state_name(),
            rate_buckets: self.rate.tracked_users(),
        }
    }
}

/// Read-only view over conversation data for the dashboard.
#[derive(Clone)]
pub struct ReadOnlyStore {
    store: ConversationStore,
}

impl ReadOnlyStore {
    pub fn new(store: ConversationStore) -> Self {
        Self { store }
    }

    pub async fn recent(&self, limit: usize) -> StoreResult<Vec<MessageRecord>> {
        self.store.recent_all(limit).await
    }

    pub async fn summaries(&self) -> StoreResult<Vec<UserSummary>> {
        self.store.summary_all().await
    }
}
