//! Startup reconciliation of a lane from the persisted attempt store.
//!
//! Rebuilds the response count per request (how many attempts were already
//! made) and collects the attempts that still need tracking. Runs once per
//! lane before the lane's listener is allowed to forward requests.

use std::collections::HashMap;
use tracing::info;

use crate::error::StoreError;
use crate::ledger::CallbackResult;
use crate::store::{AttemptState, AttemptStore, FulfillmentAttempt};
use crate::types::{BlockNumber, KeyHash, RequestId};

#[derive(Debug, Default)]
pub struct RecoveredLane {
    pub response_counts: HashMap<RequestId, u64>,
    /// Attempts the tracker must resume: in flight, or confirmed but not final.
    pub tracked: Vec<FulfillmentAttempt>,
    pub next_attempt_id: u64,
}

/// Count prior attempts per request for the lane serving `key_hash`.
///
/// Unconfirmed and broadcast attempts always count. Confirmed and failed
/// attempts count while their last block is inside the finality window.
/// Batch members the chain reported as not fulfilled do not count.
pub fn recover_lane(
    store: &dyn AttemptStore,
    lane: &str,
    key_hash: KeyHash,
    head: BlockNumber,
    finality_depth: u64,
) -> Result<RecoveredLane, StoreError> {
    let window_start = head.saturating_sub(finality_depth);
    let mut recovered = RecoveredLane::default();

    for attempt in store.attempts()? {
        if attempt.lane == lane {
            recovered.next_attempt_id = recovered.next_attempt_id.max(attempt.id + 1);
        }
        if attempt.key_hash != key_hash {
            continue;
        }

        let counts = match attempt.state {
            AttemptState::Unconfirmed | AttemptState::Broadcast => true,
            AttemptState::Confirmed | AttemptState::Failed => attempt.last_block() >= window_start,
        };
        if counts {
            for id in attempt.request_ids() {
                if attempt.result_for(&id) == Some(CallbackResult::NotFulfilled) {
                    continue;
                }
                *recovered.response_counts.entry(id).or_default() += 1;
            }
        }

        let still_tracked = match attempt.state {
            AttemptState::Unconfirmed | AttemptState::Broadcast => true,
            AttemptState::Confirmed => {
                attempt.outcomes.is_empty()
                    && attempt
                        .confirmed_block
                        .is_some_and(|b| head < b.saturating_add(finality_depth))
            }
            AttemptState::Failed => false,
        };
        if still_tracked {
            recovered.tracked.push(attempt);
        }
    }

    recovered.tracked.sort_by_key(|a| a.id);

    info!(
        lane,
        head,
        requests = recovered.response_counts.len(),
        tracked = recovered.tracked.len(),
        next_attempt_id = recovered.next_attempt_id,
        "Recovered starting response counts"
    );

    Ok(recovered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryAttemptStore, RequestOutcome, RequestResult};
    use crate::types::Outcome;
    use crate::testing::{sample_attempt, sample_request};

    const KEY: KeyHash = KeyHash([7; 32]);

    #[test]
    fn empty_store_has_no_counts() {
        let store = MemoryAttemptStore::new();
        let recovered = recover_lane(&store, "lane", KEY, 4, 3).unwrap();
        assert!(recovered.response_counts.is_empty());
        assert_eq!(recovered.next_attempt_id, 0);
    }

    #[test]
    fn counts_confirmed_and_in_flight_attempts() {
        let store = MemoryAttemptStore::new();
        let r10 = sample_request(KEY, 1, 100_000, 1);
        let r11 = sample_request(KEY, 1, 100_000, 1);
        let r12 = sample_request(KEY, 1, 100_000, 1);

        let confirmed = |id: u64, req: &crate::types::RandomnessRequest| {
            let mut a = sample_attempt("lane", id, vec![req.clone()], AttemptState::Confirmed, 1);
            a.confirmed_block = Some(1);
            store.append(&a).unwrap();
        };
        confirmed(0, &r10);
        confirmed(1, &r11);
        confirmed(2, &r11);
        for id in 3..5 {
            store
                .append(&sample_attempt("lane", id, vec![r12.clone()], AttemptState::Broadcast, 1))
                .unwrap();
        }

        let recovered = recover_lane(&store, "lane", KEY, 4, 3).unwrap();
        assert_eq!(recovered.response_counts.len(), 3);
        assert_eq!(recovered.response_counts[&r10.request_id], 1);
        assert_eq!(recovered.response_counts[&r11.request_id], 2);
        assert_eq!(recovered.response_counts[&r12.request_id], 2);
        assert_eq!(recovered.next_attempt_id, 5);
    }

    #[test]
    fn old_confirmed_attempts_fall_out_of_window() {
        let store = MemoryAttemptStore::new();
        let old = sample_request(KEY, 1, 100_000, 1);
        let pending = sample_request(KEY, 1, 100_000, 1);

        let mut a = sample_attempt("lane", 0, vec![old.clone()], AttemptState::Confirmed, 1);
        a.confirmed_block = Some(2);
        store.append(&a).unwrap();
        store
            .append(&sample_attempt("lane", 1, vec![pending.clone()], AttemptState::Unconfirmed, 2))
            .unwrap();

        let recovered = recover_lane(&store, "lane", KEY, 100, 10).unwrap();
        assert!(!recovered.response_counts.contains_key(&old.request_id));
        assert_eq!(recovered.response_counts[&pending.request_id], 1);
        assert_eq!(recovered.tracked.len(), 1);
        assert_eq!(recovered.next_attempt_id, 2);
    }

    #[test]
    fn rejected_batch_members_are_not_counted() {
        let store = MemoryAttemptStore::new();
        let ok = sample_request(KEY, 1, 100_000, 1);
        let rejected = sample_request(KEY, 1, 100_000, 1);
        let mut a = sample_attempt(
            "lane",
            0,
            vec![ok.clone(), rejected.clone()],
            AttemptState::Confirmed,
            1,
        );
        a.confirmed_block = Some(3);
        a.results = vec![
            RequestResult {
                request_id: ok.request_id,
                result: CallbackResult::Success,
            },
            RequestResult {
                request_id: rejected.request_id,
                result: CallbackResult::NotFulfilled,
            },
        ];
        store.append(&a).unwrap();

        let recovered = recover_lane(&store, "lane", KEY, 4, 10).unwrap();
        assert_eq!(recovered.response_counts.get(&ok.request_id), Some(&1));
        assert_eq!(recovered.response_counts.get(&rejected.request_id), None);
        // Confirmed at 3, final at 13: still tracked for its outcome.
        assert_eq!(recovered.tracked.len(), 1);
    }

    #[test]
    fn finalized_attempts_are_counted_but_not_tracked() {
        let store = MemoryAttemptStore::new();
        let req = sample_request(KEY, 1, 100_000, 1);
        let mut a = sample_attempt("lane", 0, vec![req.clone()], AttemptState::Confirmed, 1);
        a.confirmed_block = Some(3);
        a.results = vec![RequestResult {
            request_id: req.request_id,
            result: CallbackResult::Success,
        }];
        a.outcomes = vec![RequestOutcome {
            request_id: req.request_id,
            outcome: Outcome::Fulfilled,
        }];
        store.append(&a).unwrap();

        let recovered = recover_lane(&store, "lane", KEY, 5, 10).unwrap();
        assert_eq!(recovered.response_counts.get(&req.request_id), Some(&1));
        assert!(recovered.tracked.is_empty());
    }

    #[test]
    fn other_keys_are_ignored_but_ids_advance() {
        let store = MemoryAttemptStore::new();
        let foreign = sample_request(KeyHash([9; 32]), 1, 100_000, 1);
        let mut a = sample_attempt("lane", 4, vec![foreign.clone()], AttemptState::Broadcast, 1);
        a.key_hash = KeyHash([9; 32]);
        store.append(&a).unwrap();

        let recovered = recover_lane(&store, "lane", KEY, 4, 3).unwrap();
        assert!(recovered.response_counts.is_empty());
        assert!(recovered.tracked.is_empty());
        assert_eq!(recovered.next_attempt_id, 5);
    }
}
