//! Batch aggregation of fulfillment-ready requests.
//!
//! Ready requests are bucketed by `(key hash, min confirmations)` and kept in
//! arrival order. A bucket is flushed when it holds a full batch or when its
//! oldest member has waited `max_wait`; chunks are cut greedily from the
//! front so older requests never wait behind newer ones.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use crate::gas::FeeQuote;
use crate::ledger::FulfillmentPayload;
use crate::proof::FulfillmentCall;
use crate::store::Reservation;
use crate::types::{KeyHash, RandomnessRequest};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    pub max_size: usize,
    /// Upper bound of the summed effective gas limits of one batch.
    pub max_gas: u64,
    pub max_wait: Duration,
}

/// A priced, proven and funded request waiting for submission.
#[derive(Debug, Clone)]
pub struct ReadyFulfillment {
    pub call: FulfillmentCall,
    pub quote: FeeQuote,
    pub reservation: Reservation,
    pub queued_at: Instant,
}

/// Unit of work handed to the tracker.
#[derive(Debug, Clone)]
pub enum Submission {
    Single(ReadyFulfillment),
    Batch(Vec<ReadyFulfillment>),
}

impl Submission {
    pub fn items(&self) -> &[ReadyFulfillment] {
        match self {
            Submission::Single(item) => std::slice::from_ref(item),
            Submission::Batch(items) => items,
        }
    }

    pub fn requests(&self) -> Vec<RandomnessRequest> {
        self.items().iter().map(|i| i.call.request.clone()).collect()
    }

    pub fn reservations(&self) -> Vec<Reservation> {
        self.items().iter().map(|i| i.reservation).collect()
    }

    pub fn gas_limit(&self) -> u64 {
        self.items().iter().map(|i| i.quote.gas_limit).sum()
    }

    /// Highest quoted price among the members; all quotes are within the lane max.
    pub fn gas_price(&self) -> u64 {
        self.items()
            .iter()
            .map(|i| i.quote.gas_price)
            .max()
            .unwrap_or(0)
    }

    pub fn payload(&self) -> FulfillmentPayload {
        match self {
            Submission::Single(item) => FulfillmentPayload::Single(item.call.clone()),
            Submission::Batch(items) => {
                FulfillmentPayload::Batch(items.iter().map(|i| i.call.clone()).collect())
            }
        }
    }
}

type BucketKey = (KeyHash, u16);

pub struct BatchAggregator {
    config: BatchConfig,
    buckets: BTreeMap<BucketKey, VecDeque<ReadyFulfillment>>,
}

impl BatchAggregator {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            buckets: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn pending(&self) -> usize {
        self.buckets.values().map(VecDeque::len).sum()
    }

    /// Queue a ready request. A request too large to share a batch comes
    /// straight back as a single submission.
    pub fn push(&mut self, item: ReadyFulfillment) -> Option<Submission> {
        if item.quote.gas_limit > self.config.max_gas {
            return Some(Submission::Single(item));
        }
        let request = &item.call.request;
        self.buckets
            .entry((request.key_hash, request.min_confirmations))
            .or_default()
            .push_back(item);
        None
    }

    /// Cut every batch that is due at `now`.
    pub fn drain(&mut self, now: Instant) -> Vec<Submission> {
        let mut out = Vec::new();
        for bucket in self.buckets.values_mut() {
            while self.config.is_due(bucket, now) {
                out.push(self.config.cut(bucket));
            }
        }
        self.buckets.retain(|_, bucket| !bucket.is_empty());
        out
    }
}

impl BatchConfig {
    fn is_due(&self, bucket: &VecDeque<ReadyFulfillment>, now: Instant) -> bool {
        let Some(oldest) = bucket.front() else {
            return false;
        };
        let total_gas: u64 = bucket.iter().map(|i| i.quote.gas_limit).sum();
        bucket.len() >= self.max_size
            || total_gas > self.max_gas
            || now.saturating_duration_since(oldest.queued_at) >= self.max_wait
    }

    /// Take the longest arrival-order prefix within both bounds.
    fn cut(&self, bucket: &mut VecDeque<ReadyFulfillment>) -> Submission {
        let mut chunk = Vec::new();
        let mut gas = 0u64;
        while let Some(next) = bucket.front() {
            let fits = chunk.len() < self.max_size.max(1)
                && gas.saturating_add(next.quote.gas_limit) <= self.max_gas;
            if !fits && !chunk.is_empty() {
                break;
            }
            if let Some(item) = bucket.pop_front() {
                gas = gas.saturating_add(item.quote.gas_limit);
                chunk.push(item);
            }
        }

        if chunk.len() == 1 {
            Submission::Single(chunk.remove(0))
        } else {
            Submission::Batch(chunk)
        }
    }
}
