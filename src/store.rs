//! Persisted `FulfillmentAttempt` records.
//!
//! The store is append-only: every state change appends a full snapshot of
//! the attempt, and readers see the latest snapshot per `(lane, id)`. Records
//! are never deleted, so the in-memory pipeline state can always be rebuilt
//! from it after a restart.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::StoreError;
use crate::ledger::CallbackResult;
use crate::types::{BlockNumber, KeyHash, Outcome, RandomnessRequest, RequestId, TxHash};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    /// Created, not (or no longer) known to be on the network.
    Unconfirmed,
    Broadcast,
    Confirmed,
    /// Terminal without a successful fulfillment.
    Failed,
}

impl AttemptState {
    pub fn is_in_flight(self) -> bool {
        matches!(self, AttemptState::Unconfirmed | AttemptState::Broadcast)
    }
}

/// Funds set aside on a subscription while an attempt is outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub subscription_id: u64,
    pub amount: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestResult {
    pub request_id: RequestId,
    pub result: CallbackResult,
}

/// Terminal outcome reported for one request of an attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestOutcome {
    pub request_id: RequestId,
    pub outcome: Outcome,
}

/// One fulfillment attempt for a request or a batch of requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FulfillmentAttempt {
    /// Lane-local sequence number.
    pub id: u64,
    /// Signing key of the lane that owns the attempt.
    pub lane: String,
    pub key_hash: KeyHash,
    pub requests: Vec<RandomnessRequest>,
    pub state: AttemptState,
    pub nonce: Option<u64>,
    /// Binding of `nonce` returned by the broadcaster.
    #[serde(default)]
    pub lease: Option<String>,
    /// Every transaction sent for this attempt, oldest first.
    pub tx_hashes: Vec<TxHash>,
    pub gas_limit: u64,
    pub gas_price: u64,
    pub bumps: u32,
    pub created_block: BlockNumber,
    pub last_sent_block: Option<BlockNumber>,
    pub confirmed_block: Option<BlockNumber>,
    #[serde(default)]
    pub confirmed_tx: Option<TxHash>,
    #[serde(default)]
    pub reservations: Vec<Reservation>,
    #[serde(default)]
    pub results: Vec<RequestResult>,
    #[serde(default)]
    pub error: Option<String>,
    /// Set once the attempt is final; one entry per reported request.
    #[serde(default)]
    pub outcomes: Vec<RequestOutcome>,
}

impl FulfillmentAttempt {
    pub fn request_ids(&self) -> impl Iterator<Item = RequestId> + '_ {
        self.requests.iter().map(|r| r.request_id)
    }

    pub fn result_for(&self, id: &RequestId) -> Option<CallbackResult> {
        self.results
            .iter()
            .find(|r| r.request_id == *id)
            .map(|r| r.result)
    }

    pub fn outcome_for(&self, id: &RequestId) -> Option<Outcome> {
        self.outcomes
            .iter()
            .find(|o| o.request_id == *id)
            .map(|o| o.outcome)
    }

    /// Whether the coordinator verified and paid for `id` in this attempt.
    pub fn executed(&self, id: &RequestId) -> bool {
        self.result_for(id).is_some_and(CallbackResult::executed)
    }

    /// Most recent block this attempt was touched at.
    pub fn last_block(&self) -> BlockNumber {
        self.confirmed_block
            .or(self.last_sent_block)
            .unwrap_or(self.created_block)
    }
}

/// Append-only attempt log, queryable by request and by state.
pub trait AttemptStore: Send + Sync {
    fn append(&self, attempt: &FulfillmentAttempt) -> Result<(), StoreError>;

    /// Latest snapshot of every attempt.
    fn attempts(&self) -> Result<Vec<FulfillmentAttempt>, StoreError>;

    fn by_request(&self, id: &RequestId) -> Result<Vec<FulfillmentAttempt>, StoreError> {
        Ok(self
            .attempts()?
            .into_iter()
            .filter(|a| a.request_ids().any(|r| r == *id))
            .collect())
    }

    fn by_state(&self, state: AttemptState) -> Result<Vec<FulfillmentAttempt>, StoreError> {
        Ok(self
            .attempts()?
            .into_iter()
            .filter(|a| a.state == state)
            .collect())
    }
}

type AttemptKey = (String, u64);

fn key_of(attempt: &FulfillmentAttempt) -> AttemptKey {
    (attempt.lane.clone(), attempt.id)
}

#[derive(Default)]
pub struct MemoryAttemptStore {
    latest: Mutex<BTreeMap<AttemptKey, FulfillmentAttempt>>,
}

impl MemoryAttemptStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AttemptStore for MemoryAttemptStore {
    fn append(&self, attempt: &FulfillmentAttempt) -> Result<(), StoreError> {
        self.latest.lock().insert(key_of(attempt), attempt.clone());
        Ok(())
    }

    fn attempts(&self) -> Result<Vec<FulfillmentAttempt>, StoreError> {
        Ok(self.latest.lock().values().cloned().collect())
    }
}

/// JSON-lines file: one snapshot per line, replayed on open.
pub struct JsonlAttemptStore {
    path: PathBuf,
    latest: Mutex<BTreeMap<AttemptKey, FulfillmentAttempt>>,
}

impl JsonlAttemptStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut latest = BTreeMap::new();
        if path.exists() {
            let reader = BufReader::new(std::fs::File::open(&path)?);
            let mut loaded = 0u64;
            for (line_no, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<FulfillmentAttempt>(&line) {
                    Ok(attempt) => {
                        latest.insert(key_of(&attempt), attempt);
                        loaded += 1;
                    }
                    // A torn final line from a crash mid-write is skipped.
                    Err(e) => warn!(line = line_no + 1, error = %e, "Skipping unreadable attempt record"),
                }
            }
            info!(path = %path.display(), records = loaded, attempts = latest.len(), "Loaded attempt store");
        }

        Ok(Self {
            path,
            latest: Mutex::new(latest),
        })
    }
}

impl AttemptStore for JsonlAttemptStore {
    fn append(&self, attempt: &FulfillmentAttempt) -> Result<(), StoreError> {
        let json = serde_json::to_string(attempt)?;
        let mut latest = self.latest.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{json}")?;
        file.sync_data()?;
        latest.insert(key_of(attempt), attempt.clone());
        Ok(())
    }

    fn attempts(&self) -> Result<Vec<FulfillmentAttempt>, StoreError> {
        Ok(self.latest.lock().values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_attempt, sample_request};

    #[test]
    fn latest_snapshot_wins() {
        let store = MemoryAttemptStore::new();
        let req = sample_request(KeyHash([1; 32]), 1, 100_000, 5);
        let mut attempt = sample_attempt("lane-a", 0, vec![req.clone()], AttemptState::Unconfirmed, 5);
        store.append(&attempt).unwrap();
        attempt.state = AttemptState::Broadcast;
        store.append(&attempt).unwrap();

        let all = store.attempts().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].state, AttemptState::Broadcast);
        assert_eq!(store.by_request(&req.request_id).unwrap().len(), 1);
        assert!(store.by_state(AttemptState::Unconfirmed).unwrap().is_empty());
    }

    #[test]
    fn lanes_do_not_collide() {
        let store = MemoryAttemptStore::new();
        let req = sample_request(KeyHash([1; 32]), 1, 100_000, 5);
        store
            .append(&sample_attempt("lane-a", 0, vec![req.clone()], AttemptState::Broadcast, 5))
            .unwrap();
        store
            .append(&sample_attempt("lane-b", 0, vec![req], AttemptState::Broadcast, 5))
            .unwrap();
        assert_eq!(store.attempts().unwrap().len(), 2);
    }

    #[test]
    fn file_store_replays_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("attempts.jsonl");
        let req = sample_request(KeyHash([2; 32]), 7, 100_000, 5);

        {
            let store = JsonlAttemptStore::open(&path).unwrap();
            let mut attempt = sample_attempt("lane-a", 3, vec![req.clone()], AttemptState::Unconfirmed, 5);
            store.append(&attempt).unwrap();
            attempt.state = AttemptState::Confirmed;
            attempt.lease = Some("blockhash".into());
            attempt.confirmed_block = Some(9);
            attempt.results = vec![RequestResult {
                request_id: req.request_id,
                result: CallbackResult::Reverted,
            }];
            attempt.outcomes = vec![RequestOutcome {
                request_id: req.request_id,
                outcome: Outcome::ConsumerReverted,
            }];
            store.append(&attempt).unwrap();
        }

        let reopened = JsonlAttemptStore::open(&path).unwrap();
        let all = reopened.attempts().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].state, AttemptState::Confirmed);
        assert_eq!(all[0].requests[0], req);
        assert_eq!(all[0].result_for(&req.request_id), Some(CallbackResult::Reverted));
        assert!(all[0].executed(&req.request_id));
        assert_eq!(all[0].lease.as_deref(), Some("blockhash"));
        assert_eq!(all[0].outcome_for(&req.request_id), Some(Outcome::ConsumerReverted));
    }

    #[test]
    fn torn_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attempts.jsonl");
        let req = sample_request(KeyHash([2; 32]), 7, 100_000, 5);
        {
            let store = JsonlAttemptStore::open(&path).unwrap();
            store
                .append(&sample_attempt("lane-a", 0, vec![req], AttemptState::Broadcast, 5))
                .unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        write!(file, "{{\"id\":1,\"lane\":").unwrap();

        let reopened = JsonlAttemptStore::open(&path).unwrap();
        assert_eq!(reopened.attempts().unwrap().len(), 1);
    }
}
