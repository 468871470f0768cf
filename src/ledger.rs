//! Contracts of the ledger collaborators the pipeline consumes.
//!
//! Concrete Solana implementations live in [`crate::logs`] and [`crate::rpc`];
//! tests use the in-memory doubles from `crate::testing`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;
use crate::proof::FulfillmentCall;
use crate::types::{BlockNumber, RandomnessRequest, RequestId, Subscription, TxHash};

/// Item produced by a [`LogSource`].
#[derive(Debug, Clone)]
pub enum LogEvent {
    Request(RandomnessRequest),
    /// The source finished replaying history and is now streaming live logs.
    CaughtUp,
}

/// Ordered, possibly replayed sequence of decoded request logs.
#[async_trait]
pub trait LogSource: Send {
    /// Next event, or `None` once the source is exhausted.
    async fn next_event(&mut self) -> Result<Option<LogEvent>, LedgerError>;
}

#[async_trait]
pub trait BlockSource: Send + Sync {
    async fn latest_block(&self) -> Result<BlockNumber, LedgerError>;

    /// Hash of `block`, or [`LedgerError::NotAvailable`] once evicted.
    async fn blockhash(&self, block: BlockNumber) -> Result<[u8; 32], LedgerError>;
}

#[async_trait]
pub trait SubscriptionReader: Send + Sync {
    /// Current state of the subscription; `None` when it no longer exists.
    async fn subscription(&self, id: u64) -> Result<Option<Subscription>, LedgerError>;
}

#[async_trait]
pub trait GasEstimator: Send + Sync {
    async fn gas_price(&self) -> Result<u64, LedgerError>;
}

/// Call carried by a fulfillment transaction.
#[derive(Debug, Clone)]
pub enum FulfillmentPayload {
    Single(FulfillmentCall),
    Batch(Vec<FulfillmentCall>),
}

impl FulfillmentPayload {
    pub fn calls(&self) -> &[FulfillmentCall] {
        match self {
            FulfillmentPayload::Single(call) => std::slice::from_ref(call),
            FulfillmentPayload::Batch(calls) => calls,
        }
    }

    pub fn request_ids(&self) -> Vec<RequestId> {
        self.calls().iter().map(|c| c.request.request_id).collect()
    }
}

/// Transaction handed to a lane's broadcaster.
#[derive(Debug, Clone)]
pub struct TxRequest {
    /// `None` asks the broadcaster to allocate the lane's next nonce.
    pub nonce: Option<u64>,
    /// Lease the nonce was first sent under, handed back on re-sends.
    pub lease: Option<String>,
    pub gas_limit: u64,
    pub gas_price: u64,
    pub payload: FulfillmentPayload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentTx {
    pub hash: TxHash,
    pub nonce: u64,
    /// Opaque binding of the nonce slot (a recent blockhash on Solana).
    /// Persisted with the attempt so the slot can be checked after a restart.
    pub lease: Option<String>,
}

/// Per-request result of a confirmed fulfillment transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackResult {
    /// Proof verified, payment taken, consumer callback succeeded.
    Success,
    /// Proof verified and payment taken, but the consumer callback reverted.
    Reverted,
    /// The coordinator did not fulfill this request (batch member rejected,
    /// or the transaction failed as a whole).
    NotFulfilled,
}

impl CallbackResult {
    /// Proof verified and payment taken, whatever the callback did.
    pub fn executed(self) -> bool {
        matches!(self, CallbackResult::Success | CallbackResult::Reverted)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxStatus {
    Pending,
    Confirmed {
        block: BlockNumber,
        results: Vec<(RequestId, CallbackResult)>,
    },
    /// Not on chain anymore: evicted, replaced, or reorged out.
    Dropped,
}

/// Signing and submission for one gas lane. Each lane owns its own instance,
/// so nonce sequences never cross lanes.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn send(&self, tx: &TxRequest) -> Result<SentTx, LedgerError>;

    /// Status of `hash`. A confirmed status carries one result per id in
    /// `requests`, in order; `lease` is the nonce binding it was sent under.
    async fn status(
        &self,
        hash: &TxHash,
        requests: &[RequestId],
        lease: Option<&str>,
    ) -> Result<TxStatus, LedgerError>;

    /// Whether the slot of `nonce`, bound by `lease`, is still open so a
    /// dropped transaction can be rebroadcast in place.
    async fn can_rebroadcast(&self, nonce: u64, lease: Option<&str>) -> Result<bool, LedgerError>;
}
