//! Error taxonomy for the fulfillment pipeline.
//!
//! Conditions are split by what the pipeline does with them: transient ones
//! leave the request queued for the next head, terminal ones are recorded and
//! surfaced once on the outcome stream.

use thiserror::Error;

use crate::batch::Submission;
use crate::types::{BlockNumber, Outcome};

/// Failure reported by a ledger collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    /// The requested datum (block hash, account, ...) is not served by the node.
    #[error("not available")]
    NotAvailable,
    #[error("rpc error: {0}")]
    Rpc(String),
}

/// Per-request condition raised while preparing a fulfillment.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FulfillmentError {
    #[error("block hash for block {block} is not available")]
    MissingBlockhash { block: BlockNumber },

    #[error("effective gas limit {effective} exceeds block ceiling {ceiling}")]
    GasLimitAboveCeiling { effective: u64, ceiling: u64 },

    #[error("subscription {0} is canceled")]
    SubscriptionCanceled(u64),

    #[error("sender is not a registered consumer of subscription {0}")]
    ConsumerNotRegistered(u64),

    #[error("request block {block} is past the retention window at head {head}")]
    Expired { block: BlockNumber, head: BlockNumber },

    #[error("network gas price {estimate} is above lane max {max}")]
    PriceAboveLaneMax { estimate: u64, max: u64 },

    #[error("subscription {subscription_id} has {available} available, needs {needed}")]
    InsufficientFunds {
        subscription_id: u64,
        needed: u64,
        available: u64,
    },

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// What the pipeline does with a [`FulfillmentError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Keep the request queued and re-evaluate on a later head.
    Defer,
    /// Record the outcome; the request is never attempted again.
    Terminal(Outcome),
}

impl FulfillmentError {
    pub fn disposition(&self) -> Disposition {
        match self {
            FulfillmentError::MissingBlockhash { .. } => Disposition::Terminal(Outcome::Failed),
            FulfillmentError::GasLimitAboveCeiling { .. }
            | FulfillmentError::SubscriptionCanceled(_)
            | FulfillmentError::ConsumerNotRegistered(_)
            | FulfillmentError::Expired { .. } => Disposition::Terminal(Outcome::Unfulfillable),
            FulfillmentError::PriceAboveLaneMax { .. }
            | FulfillmentError::InsufficientFunds { .. }
            | FulfillmentError::Ledger(_) => Disposition::Defer,
        }
    }
}

/// Failure of the persisted attempt store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("attempt store io: {0}")]
    Io(#[from] std::io::Error),
    #[error("attempt store encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Failure to hand a submission to the tracker.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// The attempt was never persisted; the submission is handed back so its
    /// requests can be queued again.
    #[error("attempt not recorded: {source}")]
    NotRecorded {
        submission: Submission,
        source: StoreError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_blockhash_is_terminal_failure() {
        let err = FulfillmentError::MissingBlockhash { block: 7 };
        assert_eq!(err.disposition(), Disposition::Terminal(Outcome::Failed));
    }

    #[test]
    fn price_and_funding_are_deferred() {
        let price = FulfillmentError::PriceAboveLaneMax { estimate: 20, max: 10 };
        let funds = FulfillmentError::InsufficientFunds {
            subscription_id: 1,
            needed: 5,
            available: 4,
        };
        assert_eq!(price.disposition(), Disposition::Defer);
        assert_eq!(funds.disposition(), Disposition::Defer);
        assert_eq!(
            FulfillmentError::from(LedgerError::Rpc("timeout".into())).disposition(),
            Disposition::Defer
        );
    }

    #[test]
    fn ceiling_and_cancellation_are_unfulfillable() {
        let gas = FulfillmentError::GasLimitAboveCeiling {
            effective: 31_000_000,
            ceiling: 30_000_000,
        };
        assert_eq!(gas.disposition(), Disposition::Terminal(Outcome::Unfulfillable));
        assert_eq!(
            FulfillmentError::SubscriptionCanceled(3).disposition(),
            Disposition::Terminal(Outcome::Unfulfillable)
        );
    }
}
