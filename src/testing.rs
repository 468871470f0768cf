//! In-memory ledger doubles and fixtures for unit tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use solana_sdk::pubkey::Pubkey;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::error::{LedgerError, StoreError};
use crate::ledger::{
    BlockSource, Broadcaster, CallbackResult, GasEstimator, SentTx, SubscriptionReader, TxRequest,
    TxStatus,
};
use crate::store::{AttemptState, AttemptStore, FulfillmentAttempt, MemoryAttemptStore};
use crate::types::{BlockNumber, KeyHash, RandomnessRequest, RequestId, Subscription, TxHash};

pub const MIN_CONFIRMATIONS: u16 = 3;

static SEED_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Consumer every [`sample_request`] is sent from.
pub fn consumer() -> Pubkey {
    Pubkey::new_from_array([42; 32])
}

/// A well-formed request with a unique pre-seed.
pub fn sample_request(
    key_hash: KeyHash,
    subscription_id: u64,
    callback_gas_limit: u32,
    block_number: BlockNumber,
) -> RandomnessRequest {
    let mut pre_seed = [0u8; 32];
    pre_seed[..8].copy_from_slice(&SEED_COUNTER.fetch_add(1, Ordering::Relaxed).to_le_bytes());
    RandomnessRequest {
        request_id: RequestId::derive(&key_hash, &pre_seed),
        subscription_id,
        key_hash,
        num_words: 1,
        callback_gas_limit,
        min_confirmations: MIN_CONFIRMATIONS,
        block_number,
        pre_seed,
        sender: consumer(),
    }
}

pub fn sample_attempt(
    lane: &str,
    id: u64,
    requests: Vec<RandomnessRequest>,
    state: AttemptState,
    created_block: BlockNumber,
) -> FulfillmentAttempt {
    FulfillmentAttempt {
        id,
        lane: lane.to_string(),
        key_hash: requests[0].key_hash,
        requests,
        state,
        nonce: None,
        lease: None,
        tx_hashes: Vec::new(),
        gas_limit: 200_000,
        gas_price: 1,
        bumps: 0,
        created_block,
        last_sent_block: None,
        confirmed_block: None,
        confirmed_tx: None,
        reservations: Vec::new(),
        results: Vec::new(),
        error: None,
        outcomes: Vec::new(),
    }
}

struct ChainState {
    head: BlockNumber,
    evicted: HashSet<BlockNumber>,
    subscriptions: HashMap<u64, Subscription>,
    gas_price: u64,
}

/// Block hashes, subscriptions and a gas estimate.
pub struct MockChain {
    state: Mutex<ChainState>,
}

impl MockChain {
    pub fn new(head: BlockNumber) -> Self {
        Self {
            state: Mutex::new(ChainState {
                head,
                evicted: HashSet::new(),
                subscriptions: HashMap::new(),
                gas_price: 1,
            }),
        }
    }

    /// Deterministic hash of `block`.
    pub fn hash_of(&self, block: BlockNumber) -> [u8; 32] {
        Sha256::digest(block.to_le_bytes()).into()
    }

    pub fn evict_blockhash(&self, block: BlockNumber) {
        self.state.lock().evicted.insert(block);
    }

    pub fn set_gas_price(&self, price: u64) {
        self.state.lock().gas_price = price;
    }

    /// Create a subscription with [`consumer`] registered.
    pub fn add_subscription(&self, id: u64, balance: u64, req_count: u64) {
        self.state.lock().subscriptions.insert(
            id,
            Subscription {
                id,
                balance,
                owner: Pubkey::new_from_array([7; 32]),
                consumers: vec![consumer()],
                req_count,
            },
        );
    }

    pub fn update_subscription(&self, id: u64, f: impl FnOnce(&mut Subscription)) {
        if let Some(sub) = self.state.lock().subscriptions.get_mut(&id) {
            f(sub);
        }
    }

    pub fn cancel_subscription(&self, id: u64) {
        self.state.lock().subscriptions.remove(&id);
    }
}

#[async_trait]
impl BlockSource for MockChain {
    async fn latest_block(&self) -> Result<BlockNumber, LedgerError> {
        Ok(self.state.lock().head)
    }

    async fn blockhash(&self, block: BlockNumber) -> Result<[u8; 32], LedgerError> {
        let state = self.state.lock();
        if block > state.head || state.evicted.contains(&block) {
            return Err(LedgerError::NotAvailable);
        }
        Ok(self.hash_of(block))
    }
}

#[async_trait]
impl SubscriptionReader for MockChain {
    async fn subscription(&self, id: u64) -> Result<Option<Subscription>, LedgerError> {
        Ok(self.state.lock().subscriptions.get(&id).cloned())
    }
}

#[async_trait]
impl GasEstimator for MockChain {
    async fn gas_price(&self) -> Result<u64, LedgerError> {
        Ok(self.state.lock().gas_price)
    }
}

/// In-memory attempt store whose appends can be made to fail.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryAttemptStore,
    failing: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }
}

impl AttemptStore for FlakyStore {
    fn append(&self, attempt: &FulfillmentAttempt) -> Result<(), StoreError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(StoreError::Io(std::io::Error::other("disk full")));
        }
        self.inner.append(attempt)
    }

    fn attempts(&self) -> Result<Vec<FulfillmentAttempt>, StoreError> {
        self.inner.attempts()
    }
}

/// One transaction accepted by a [`MockBroadcaster`].
#[derive(Debug, Clone)]
pub struct SentRecord {
    pub hash: TxHash,
    pub nonce: u64,
    pub lease: Option<String>,
    pub gas_limit: u64,
    pub gas_price: u64,
    pub requests: Vec<(RequestId, Pubkey)>,
}

#[derive(Debug, Clone)]
enum Landing {
    Pending,
    /// On chain; requests absent from `results` were not fulfilled.
    Landed {
        block: BlockNumber,
        results: HashMap<RequestId, CallbackResult>,
    },
    Dropped,
}

/// Chain-side view shared by every incarnation of a broadcaster.
#[derive(Default)]
struct Ledger {
    sent: Vec<SentRecord>,
    landings: HashMap<TxHash, Landing>,
    /// Requests the coordinator has already fulfilled, across all txs.
    fulfilled: HashSet<RequestId>,
    reverting: HashSet<Pubkey>,
    rejected: HashSet<RequestId>,
    closed_nonces: HashSet<u64>,
    failing_sends: u32,
}

impl Ledger {
    fn is_pending(&self, hash: &TxHash) -> bool {
        matches!(self.landings.get(hash), Some(Landing::Pending))
    }

    /// Execute `record` at `block` under the coordinator's rules: a request
    /// is fulfilled at most once, reverting consumers still count as fulfilled.
    fn execute(&mut self, record: &SentRecord, block: BlockNumber) {
        let mut results = HashMap::new();
        for (id, sender) in &record.requests {
            if self.fulfilled.contains(id) || self.rejected.contains(id) {
                continue;
            }
            let result = if self.reverting.contains(sender) {
                CallbackResult::Reverted
            } else {
                CallbackResult::Success
            };
            self.fulfilled.insert(*id);
            results.insert(*id, result);
        }
        self.landings
            .insert(record.hash.clone(), Landing::Landed { block, results });
        self.closed_nonces.insert(record.nonce);
    }

    fn record(&self, hash: &TxHash) -> Option<SentRecord> {
        self.sent.iter().find(|r| r.hash == *hash).cloned()
    }
}

/// Lane-local signer with a scripted chain behind it.
///
/// Sent transactions stay pending until [`MockBroadcaster::mine`] lands the
/// newest transaction of each nonce, or [`MockBroadcaster::land`] lands a
/// specific one. The broadcaster itself only remembers its nonce counter;
/// [`MockBroadcaster::restart`] gives a fresh one over the same chain.
pub struct MockBroadcaster {
    label: String,
    next_nonce: AtomicU64,
    ledger: Arc<Mutex<Ledger>>,
}

impl MockBroadcaster {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            next_nonce: AtomicU64::new(0),
            ledger: Arc::new(Mutex::new(Ledger::default())),
        }
    }

    /// A new process for the same signer, starting at `first_nonce`.
    pub fn restart(&self, first_nonce: u64) -> Self {
        Self {
            label: self.label.clone(),
            next_nonce: AtomicU64::new(first_nonce),
            ledger: self.ledger.clone(),
        }
    }

    pub fn sent(&self) -> Vec<SentRecord> {
        self.ledger.lock().sent.clone()
    }

    pub fn send_count(&self) -> usize {
        self.ledger.lock().sent.len()
    }

    pub fn revert_for(&self, consumer: Pubkey) {
        self.ledger.lock().reverting.insert(consumer);
    }

    pub fn reject(&self, id: RequestId) {
        self.ledger.lock().rejected.insert(id);
    }

    pub fn fail_next_sends(&self, n: u32) {
        self.ledger.lock().failing_sends = n;
    }

    /// Remove a transaction from the chain, as a reorg or eviction would. Its
    /// nonce slot opens again.
    pub fn drop_tx(&self, hash: &TxHash) {
        let mut ledger = self.ledger.lock();
        if let Some(record) = ledger.record(hash) {
            ledger.closed_nonces.remove(&record.nonce);
        }
        if let Some(Landing::Landed { results, .. }) = ledger.landings.get(hash).cloned() {
            for id in results.keys() {
                ledger.fulfilled.remove(id);
            }
        }
        ledger.landings.insert(hash.clone(), Landing::Dropped);
    }

    /// Mark a nonce as consumed by some other transaction.
    pub fn close_nonce(&self, nonce: u64) {
        self.ledger.lock().closed_nonces.insert(nonce);
    }

    /// Land the newest pending transaction of every nonce at `block`.
    /// Replaced versions of a landed nonce never land.
    pub fn mine(&self, block: BlockNumber) {
        let mut ledger = self.ledger.lock();
        let mut newest: HashMap<u64, SentRecord> = HashMap::new();
        for record in &ledger.sent {
            if ledger.is_pending(&record.hash) {
                newest.insert(record.nonce, record.clone());
            }
        }

        let mut nonces: Vec<u64> = newest.keys().copied().collect();
        nonces.sort_unstable();
        for nonce in nonces {
            ledger.execute(&newest[&nonce], block);
        }

        let replaced: Vec<TxHash> = ledger
            .sent
            .iter()
            .filter(|r| ledger.closed_nonces.contains(&r.nonce) && ledger.is_pending(&r.hash))
            .map(|r| r.hash.clone())
            .collect();
        for hash in replaced {
            ledger.landings.insert(hash, Landing::Dropped);
        }
    }

    /// Land one specific transaction at `block`, leaving other versions of
    /// its nonce pending. Two versions signed over different blockhashes can
    /// both land this way.
    pub fn land(&self, hash: &TxHash, block: BlockNumber) {
        let mut ledger = self.ledger.lock();
        if let Some(record) = ledger.record(hash) {
            ledger.execute(&record, block);
        }
    }

    /// Land a transaction that failed as a whole: no request is fulfilled.
    pub fn land_failed(&self, hash: &TxHash, block: BlockNumber) {
        let mut ledger = self.ledger.lock();
        if let Some(record) = ledger.record(hash) {
            ledger.closed_nonces.insert(record.nonce);
            ledger.landings.insert(
                hash.clone(),
                Landing::Landed {
                    block,
                    results: HashMap::new(),
                },
            );
        }
    }
}

#[async_trait]
impl Broadcaster for MockBroadcaster {
    async fn send(&self, tx: &TxRequest) -> Result<SentTx, LedgerError> {
        let mut ledger = self.ledger.lock();
        if ledger.failing_sends > 0 {
            ledger.failing_sends -= 1;
            return Err(LedgerError::Rpc("node unavailable".into()));
        }
        let nonce = tx
            .nonce
            .unwrap_or_else(|| self.next_nonce.fetch_add(1, Ordering::Relaxed));
        let lease = tx
            .lease
            .clone()
            .unwrap_or_else(|| format!("{}-lease-{}", self.label, ledger.sent.len()));
        let hash = TxHash(format!("{}-{}", self.label, ledger.sent.len()));
        ledger.sent.push(SentRecord {
            hash: hash.clone(),
            nonce,
            lease: Some(lease.clone()),
            gas_limit: tx.gas_limit,
            gas_price: tx.gas_price,
            requests: tx
                .payload
                .calls()
                .iter()
                .map(|c| (c.request.request_id, c.request.sender))
                .collect(),
        });
        ledger.landings.insert(hash.clone(), Landing::Pending);
        Ok(SentTx {
            hash,
            nonce,
            lease: Some(lease),
        })
    }

    async fn status(
        &self,
        hash: &TxHash,
        requests: &[RequestId],
        _lease: Option<&str>,
    ) -> Result<TxStatus, LedgerError> {
        Ok(match self.ledger.lock().landings.get(hash) {
            Some(Landing::Pending) => TxStatus::Pending,
            Some(Landing::Landed { block, results }) => TxStatus::Confirmed {
                block: *block,
                results: requests
                    .iter()
                    .map(|id| {
                        let result = results.get(id).copied().unwrap_or(CallbackResult::NotFulfilled);
                        (*id, result)
                    })
                    .collect(),
            },
            Some(Landing::Dropped) | None => TxStatus::Dropped,
        })
    }

    async fn can_rebroadcast(&self, nonce: u64, _lease: Option<&str>) -> Result<bool, LedgerError> {
        Ok(!self.ledger.lock().closed_nonces.contains(&nonce))
    }
}
