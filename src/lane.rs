//! State shared by a lane's listener and its pipeline.
//!
//! The response counts, the dedup set and the funding reservations sit behind
//! one mutex. Critical sections are short and never span an await.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::StoreError;
use crate::metrics::Metrics;
use crate::reconciler::RecoveredLane;
use crate::store::{AttemptState, AttemptStore, FulfillmentAttempt, RequestOutcome, Reservation};
use crate::types::{BlockNumber, KeyHash, Outcome, OutcomeEvent, RandomnessRequest, RequestId};

/// Listener verdict for an incoming request log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    /// Already queued in this process (log replay).
    Duplicate,
    /// An attempt already exists, confirmed or in flight.
    AlreadyAttempted,
}

#[derive(Debug, Clone, Copy)]
struct ResponseCount {
    attempts: u64,
    /// Newest block the entry is known to relate to; used for pruning.
    block: BlockNumber,
}

#[derive(Default)]
struct LaneBook {
    response_counts: HashMap<RequestId, ResponseCount>,
    /// Accepted by the listener, no attempt yet.
    queued: HashSet<RequestId>,
    reserved: HashMap<u64, u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LaneStatus {
    pub name: String,
    pub signer: String,
    pub key_hash: String,
    pub queued: u64,
    pub in_flight: u64,
}

/// Identity and shared bookkeeping of one gas lane.
pub struct LaneState {
    name: String,
    signer: String,
    key_hash: KeyHash,
    book: Mutex<LaneBook>,
    next_attempt_id: AtomicU64,
    queued_gauge: AtomicU64,
    in_flight_gauge: AtomicU64,
    store: Arc<dyn AttemptStore>,
    outcomes: broadcast::Sender<OutcomeEvent>,
    metrics: Arc<Metrics>,
}

impl LaneState {
    /// Seed a lane from its recovered counts. `head` stands in as the block
    /// of recovered entries for pruning purposes.
    pub fn new(
        name: impl Into<String>,
        signer: impl Into<String>,
        key_hash: KeyHash,
        recovered: &RecoveredLane,
        head: BlockNumber,
        store: Arc<dyn AttemptStore>,
        outcomes: broadcast::Sender<OutcomeEvent>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let response_counts = recovered
            .response_counts
            .iter()
            .map(|(id, &attempts)| (*id, ResponseCount { attempts, block: head }))
            .collect();

        Self {
            name: name.into(),
            signer: signer.into(),
            key_hash,
            book: Mutex::new(LaneBook {
                response_counts,
                ..LaneBook::default()
            }),
            next_attempt_id: AtomicU64::new(recovered.next_attempt_id),
            queued_gauge: AtomicU64::new(0),
            in_flight_gauge: AtomicU64::new(0),
            store,
            outcomes,
            metrics,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signer(&self) -> &str {
        &self.signer
    }

    pub fn key_hash(&self) -> KeyHash {
        self.key_hash
    }

    pub fn store(&self) -> &dyn AttemptStore {
        self.store.as_ref()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Dedup check; marks the request queued when accepted.
    pub fn admit(&self, request: &RandomnessRequest) -> Admission {
        let mut book = self.book.lock();
        if book
            .response_counts
            .get(&request.request_id)
            .is_some_and(|c| c.attempts > 0)
        {
            return Admission::AlreadyAttempted;
        }
        if !book.queued.insert(request.request_id) {
            return Admission::Duplicate;
        }
        Admission::Accepted
    }

    pub fn response_count(&self, id: &RequestId) -> u64 {
        self.book
            .lock()
            .response_counts
            .get(id)
            .map_or(0, |c| c.attempts)
    }

    /// Count a new attempt for each request.
    pub fn mark_attempted(&self, requests: &[RandomnessRequest]) {
        let mut book = self.book.lock();
        for request in requests {
            book.queued.remove(&request.request_id);
            let entry = book
                .response_counts
                .entry(request.request_id)
                .or_insert(ResponseCount {
                    attempts: 0,
                    block: request.block_number,
                });
            entry.attempts += 1;
            entry.block = entry.block.max(request.block_number);
        }
    }

    /// Withdraw an attempt that the chain reported as not fulfilled, making
    /// the request eligible again.
    pub fn requeue(&self, request: &RandomnessRequest) {
        let mut book = self.book.lock();
        if let Some(count) = book.response_counts.get_mut(&request.request_id) {
            count.attempts = count.attempts.saturating_sub(1);
            if count.attempts == 0 {
                book.response_counts.remove(&request.request_id);
            }
        }
        book.queued.insert(request.request_id);
    }

    pub fn reserved(&self, subscription_id: u64) -> u64 {
        self.book
            .lock()
            .reserved
            .get(&subscription_id)
            .copied()
            .unwrap_or(0)
    }

    /// Set aside `amount` if `balance` still covers it; returns the amount
    /// that was available otherwise.
    pub fn try_reserve(&self, subscription_id: u64, balance: u64, amount: u64) -> Result<(), u64> {
        let mut book = self.book.lock();
        let reserved = book.reserved.entry(subscription_id).or_default();
        let available = balance.saturating_sub(*reserved);
        if amount > available {
            return Err(available);
        }
        *reserved += amount;
        Ok(())
    }

    /// Re-apply reservations of an attempt that is in flight again.
    pub fn hold(&self, reservations: &[Reservation]) {
        let mut book = self.book.lock();
        for r in reservations {
            *book.reserved.entry(r.subscription_id).or_default() += r.amount;
        }
    }

    pub fn release(&self, reservations: &[Reservation]) {
        let mut book = self.book.lock();
        for r in reservations {
            if let Some(reserved) = book.reserved.get_mut(&r.subscription_id) {
                *reserved = reserved.saturating_sub(r.amount);
                if *reserved == 0 {
                    book.reserved.remove(&r.subscription_id);
                }
            }
        }
    }

    /// Forget counts older than `horizon` blocks. Callers pass at least the
    /// retention window, so a pruned request is one the listener rejects.
    pub fn prune(&self, head: BlockNumber, horizon: u64) {
        let mut book = self.book.lock();
        let before = book.response_counts.len();
        book.response_counts
            .retain(|_, c| c.block.saturating_add(horizon) >= head);
        let pruned = before - book.response_counts.len();
        if pruned > 0 {
            debug!(lane = %self.name, pruned, "Pruned expired response counts");
        }
    }

    pub fn allocate_attempt_id(&self) -> u64 {
        self.next_attempt_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn emit(&self, event: OutcomeEvent) {
        self.metrics.record_outcome(event.outcome);
        // No subscribers is fine; the record in the store is authoritative.
        let _ = self.outcomes.send(event);
    }

    /// Record a terminal outcome for a request that never got a transaction.
    pub fn record_terminal(
        &self,
        request: &RandomnessRequest,
        outcome: Outcome,
        reason: String,
        head: BlockNumber,
    ) -> Result<(), StoreError> {
        let attempt = FulfillmentAttempt {
            id: self.allocate_attempt_id(),
            lane: self.signer.clone(),
            key_hash: self.key_hash,
            requests: vec![request.clone()],
            state: AttemptState::Failed,
            nonce: None,
            lease: None,
            tx_hashes: Vec::new(),
            gas_limit: 0,
            gas_price: 0,
            bumps: 0,
            created_block: head,
            last_sent_block: None,
            confirmed_block: None,
            confirmed_tx: None,
            reservations: Vec::new(),
            results: Vec::new(),
            error: Some(reason.clone()),
            outcomes: vec![RequestOutcome {
                request_id: request.request_id,
                outcome,
            }],
        };
        self.store.append(&attempt)?;
        self.mark_attempted(std::slice::from_ref(request));
        self.emit(OutcomeEvent {
            request_id: request.request_id,
            outcome,
            tx_hash: None,
            reason: Some(reason),
        });
        Ok(())
    }

    pub fn set_depths(&self, queued: usize, in_flight: usize) {
        self.queued_gauge.store(queued as u64, Ordering::Relaxed);
        self.in_flight_gauge.store(in_flight as u64, Ordering::Relaxed);
    }

    pub fn status(&self) -> LaneStatus {
        LaneStatus {
            name: self.name.clone(),
            signer: self.signer.clone(),
            key_hash: self.key_hash.to_string(),
            queued: self.queued_gauge.load(Ordering::Relaxed),
            in_flight: self.in_flight_gauge.load(Ordering::Relaxed),
        }
    }
}
