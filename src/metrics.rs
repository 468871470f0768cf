//! Counters for the fulfillment pipeline.
//!
//! All counters are backed by atomics for lock-free concurrent access.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::Outcome;

/// Aggregated metrics across every lane.
///
/// Thread-safe via atomics; shared as `Arc<Metrics>`.
#[derive(Default)]
pub struct Metrics {
    /// Request logs accepted by a lane listener.
    pub requests_received: AtomicU64,
    /// Replayed or already-attempted logs ignored by a listener.
    pub duplicates_skipped: AtomicU64,
    pub requests_fulfilled: AtomicU64,
    pub consumer_reverted: AtomicU64,
    pub requests_unfulfillable: AtomicU64,
    pub requests_failed: AtomicU64,
    /// Transactions handed to a broadcaster, rebroadcasts included.
    pub transactions_sent: AtomicU64,
    pub gas_bumps: AtomicU64,
    /// Confirmed transactions that later disappeared from the chain.
    pub reorgs_observed: AtomicU64,
    /// Sum of request-to-confirmation latencies in blocks.
    pub fulfillment_latency_blocks_sum: AtomicU64,
    /// Number of confirmations contributing to the latency sum.
    pub fulfillment_count: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.requests_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sent(&self) {
        self.transactions_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bump(&self) {
        self.gas_bumps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reorg(&self) {
        self.reorgs_observed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a confirmation `latency_blocks` after the request block.
    pub fn record_confirmation(&self, latency_blocks: u64) {
        self.fulfillment_latency_blocks_sum
            .fetch_add(latency_blocks, Ordering::Relaxed);
        self.fulfillment_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_outcome(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::Fulfilled => &self.requests_fulfilled,
            Outcome::ConsumerReverted => &self.consumer_reverted,
            Outcome::Unfulfillable => &self.requests_unfulfillable,
            Outcome::Failed => &self.requests_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Average confirmation latency in blocks, or 0 if none.
    pub fn avg_latency_blocks(&self) -> u64 {
        let count = self.fulfillment_count.load(Ordering::Relaxed);
        if count == 0 {
            return 0;
        }
        self.fulfillment_latency_blocks_sum.load(Ordering::Relaxed) / count
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "requests_received": self.requests_received.load(Ordering::Relaxed),
            "duplicates_skipped": self.duplicates_skipped.load(Ordering::Relaxed),
            "requests_fulfilled": self.requests_fulfilled.load(Ordering::Relaxed),
            "consumer_reverted": self.consumer_reverted.load(Ordering::Relaxed),
            "requests_unfulfillable": self.requests_unfulfillable.load(Ordering::Relaxed),
            "requests_failed": self.requests_failed.load(Ordering::Relaxed),
            "transactions_sent": self.transactions_sent.load(Ordering::Relaxed),
            "gas_bumps": self.gas_bumps.load(Ordering::Relaxed),
            "reorgs_observed": self.reorgs_observed.load(Ordering::Relaxed),
            "avg_fulfillment_latency_blocks": self.avg_latency_blocks(),
            "fulfillment_count": self.fulfillment_count.load(Ordering::Relaxed),
        })
    }
}
