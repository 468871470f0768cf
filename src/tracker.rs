//! Submission and confirmation tracking for one lane.
//!
//! Every attempt moves through `Unconfirmed -> Broadcast -> Confirmed` and is
//! dropped from tracking once its confirmation is final. Along the way the
//! tracker re-prices stuck transactions under the same nonce, rebroadcasts or
//! re-queues attempts that a reorg knocked out, and re-queues batch members
//! the coordinator did not fulfill. A reverted consumer callback is a
//! confirmed fulfillment and is never retried.
//!
//! Each state change is appended to the attempt store before the tracker acts
//! on it, so a restart resumes from the last persisted snapshot.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use crate::batch::Submission;
use crate::error::{Disposition, FulfillmentError, StoreError, SubmitError};
use crate::ledger::{
    BlockSource, Broadcaster, CallbackResult, FulfillmentPayload, TxRequest, TxStatus,
};
use crate::lane::LaneState;
use crate::proof::ProofBuilder;
use crate::store::{AttemptState, FulfillmentAttempt, RequestOutcome, RequestResult};
use crate::types::{BlockNumber, Outcome, OutcomeEvent, RandomnessRequest, RequestId, TxHash};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerConfig {
    /// Blocks without confirmation before a broadcast attempt is re-priced.
    pub stuck_after_blocks: u64,
    /// Re-prices (and failed sends) allowed before an attempt is `Failed`.
    pub max_bumps: u32,
    pub bump_percent: u64,
    pub min_bump: u64,
    pub finality_depth: u64,
    pub lane_max_price: u64,
}

impl TrackerConfig {
    /// `min(max(price * (100 + pct) / 100, price + min_bump), lane max)`.
    pub fn bumped_price(&self, price: u64) -> u64 {
        let scaled = u128::from(price) * u128::from(100 + self.bump_percent) / 100;
        let scaled = u64::try_from(scaled).unwrap_or(u64::MAX);
        scaled
            .max(price.saturating_add(self.min_bump))
            .min(self.lane_max_price)
    }
}

struct Tracked {
    attempt: FulfillmentAttempt,
    /// Signed calls; rebuilt from the persisted requests after a restart.
    payload: Option<FulfillmentPayload>,
    send_failures: u32,
}

enum Step {
    Keep,
    Done,
}

pub struct Tracker {
    lane: Arc<LaneState>,
    broadcaster: Arc<dyn Broadcaster>,
    blocks: Arc<dyn BlockSource>,
    proofs: ProofBuilder,
    config: TrackerConfig,
    attempts: BTreeMap<u64, Tracked>,
}

impl Tracker {
    pub fn new(
        lane: Arc<LaneState>,
        broadcaster: Arc<dyn Broadcaster>,
        blocks: Arc<dyn BlockSource>,
        proofs: ProofBuilder,
        config: TrackerConfig,
    ) -> Self {
        Self {
            lane,
            broadcaster,
            blocks,
            proofs,
            config,
            attempts: BTreeMap::new(),
        }
    }

    /// Resume attempts recovered from the store.
    pub fn adopt(&mut self, recovered: Vec<FulfillmentAttempt>) {
        for attempt in recovered {
            if attempt.state.is_in_flight() {
                self.lane.hold(&attempt.reservations);
            }
            debug!(lane = %self.lane.name(), attempt = attempt.id, state = ?attempt.state, "Adopted attempt");
            self.attempts.insert(
                attempt.id,
                Tracked {
                    attempt,
                    payload: None,
                    send_failures: 0,
                },
            );
        }
    }

    /// Attempts not yet confirmed.
    pub fn in_flight(&self) -> usize {
        self.attempts
            .values()
            .filter(|t| t.attempt.state.is_in_flight())
            .count()
    }

    pub fn tracked(&self) -> usize {
        self.attempts.len()
    }

    /// Persist a new attempt for `submission` and broadcast it.
    ///
    /// If the attempt cannot be recorded nothing is marked attempted and the
    /// submission comes back inside [`SubmitError::NotRecorded`].
    #[instrument(skip_all, fields(lane = %self.lane.name(), requests = submission.items().len()))]
    pub async fn submit(&mut self, submission: Submission, head: BlockNumber) -> Result<(), SubmitError> {
        let attempt = FulfillmentAttempt {
            id: self.lane.allocate_attempt_id(),
            lane: self.lane.signer().to_string(),
            key_hash: self.lane.key_hash(),
            requests: submission.requests(),
            state: AttemptState::Unconfirmed,
            nonce: None,
            lease: None,
            tx_hashes: Vec::new(),
            gas_limit: submission.gas_limit(),
            gas_price: submission.gas_price(),
            bumps: 0,
            created_block: head,
            last_sent_block: None,
            confirmed_block: None,
            confirmed_tx: None,
            reservations: submission.reservations(),
            results: Vec::new(),
            error: None,
            outcomes: Vec::new(),
        };
        if let Err(source) = self.lane.store().append(&attempt) {
            return Err(SubmitError::NotRecorded { submission, source });
        }
        self.lane.mark_attempted(&attempt.requests);

        let id = attempt.id;
        let mut entry = Tracked {
            attempt,
            payload: Some(submission.payload()),
            send_failures: 0,
        };
        let step = self.send(&mut entry, head).await;
        Ok(self.settle(id, entry, step)?)
    }

    /// Advance every tracked attempt to `head`. Returns batch members the
    /// coordinator did not fulfill, to be queued again.
    pub async fn on_head(&mut self, head: BlockNumber) -> Result<Vec<RandomnessRequest>, StoreError> {
        let mut requeued = Vec::new();
        let ids: Vec<u64> = self.attempts.keys().copied().collect();
        for id in ids {
            let Some(mut entry) = self.attempts.remove(&id) else {
                continue;
            };
            let step = self.advance(&mut entry, head, &mut requeued).await;
            self.settle(id, entry, step)?;
        }
        Ok(requeued)
    }

    fn settle(&mut self, id: u64, entry: Tracked, step: Result<Step, StoreError>) -> Result<(), StoreError> {
        match step {
            Ok(Step::Done) => Ok(()),
            Ok(Step::Keep) => {
                self.attempts.insert(id, entry);
                Ok(())
            }
            Err(e) => {
                self.attempts.insert(id, entry);
                Err(e)
            }
        }
    }

    async fn advance(
        &self,
        entry: &mut Tracked,
        head: BlockNumber,
        requeued: &mut Vec<RandomnessRequest>,
    ) -> Result<Step, StoreError> {
        match entry.attempt.state {
            AttemptState::Unconfirmed => self.send(entry, head).await,
            AttemptState::Broadcast => self.poll_broadcast(entry, head, requeued).await,
            AttemptState::Confirmed => self.poll_confirmed(entry, head).await,
            AttemptState::Failed => Ok(Step::Done),
        }
    }

    /// Broadcast under the attempt's nonce, or a fresh one if it has none.
    #[instrument(skip_all, fields(attempt = entry.attempt.id, nonce = ?entry.attempt.nonce))]
    async fn send(&self, entry: &mut Tracked, head: BlockNumber) -> Result<Step, StoreError> {
        if entry.payload.is_none() {
            match self.rebuild_payload(&entry.attempt).await {
                Ok(payload) => entry.payload = Some(payload),
                Err(e) => {
                    return match e.disposition() {
                        Disposition::Terminal(outcome) => self.fail(entry, outcome, e.to_string()),
                        Disposition::Defer => self.send_failed(entry, e.to_string()),
                    };
                }
            }
        }
        let Some(payload) = entry.payload.clone() else {
            return Ok(Step::Keep);
        };

        let tx = TxRequest {
            nonce: entry.attempt.nonce,
            lease: entry.attempt.lease.clone(),
            gas_limit: entry.attempt.gas_limit,
            gas_price: entry.attempt.gas_price,
            payload,
        };
        match self.broadcaster.send(&tx).await {
            Ok(sent) => {
                let attempt = &mut entry.attempt;
                attempt.nonce = Some(sent.nonce);
                attempt.lease = sent.lease;
                attempt.tx_hashes.push(sent.hash.clone());
                attempt.state = AttemptState::Broadcast;
                attempt.last_sent_block = Some(head);
                self.lane.store().append(attempt)?;
                self.lane.metrics().record_sent();
                entry.send_failures = 0;
                info!(
                    lane = %self.lane.name(),
                    tx = %sent.hash,
                    nonce = sent.nonce,
                    gas_price = attempt.gas_price,
                    "Fulfillment broadcast"
                );
                Ok(Step::Keep)
            }
            Err(e) => self.send_failed(entry, e.to_string()),
        }
    }

    fn send_failed(&self, entry: &mut Tracked, reason: String) -> Result<Step, StoreError> {
        entry.send_failures += 1;
        warn!(
            lane = %self.lane.name(),
            attempt = entry.attempt.id,
            failures = entry.send_failures,
            %reason,
            "Broadcast failed"
        );
        if entry.send_failures > self.config.max_bumps {
            return self.fail(entry, Outcome::Failed, format!("broadcast failed: {reason}"));
        }
        Ok(Step::Keep)
    }

    async fn rebuild_payload(&self, attempt: &FulfillmentAttempt) -> Result<FulfillmentPayload, FulfillmentError> {
        let mut calls = Vec::with_capacity(attempt.requests.len());
        for request in &attempt.requests {
            calls.push(self.proofs.build(request, self.blocks.as_ref()).await?);
        }
        Ok(if calls.len() == 1 {
            FulfillmentPayload::Single(calls.remove(0))
        } else {
            FulfillmentPayload::Batch(calls)
        })
    }

    /// Poll every version of the attempt. Versions share a nonce slot but more
    /// than one of them can land, so results are merged across all of them.
    async fn poll_broadcast(
        &self,
        entry: &mut Tracked,
        head: BlockNumber,
        requeued: &mut Vec<RandomnessRequest>,
    ) -> Result<Step, StoreError> {
        let ids: Vec<RequestId> = entry.attempt.request_ids().collect();
        let lease = entry.attempt.lease.as_deref();
        let mut any_pending = false;
        let mut landed = Vec::new();
        for hash in entry.attempt.tx_hashes.iter().rev() {
            match self.broadcaster.status(hash, &ids, lease).await {
                Ok(TxStatus::Confirmed { block, results }) => landed.push(Landed {
                    hash: hash.clone(),
                    block,
                    results,
                }),
                Ok(TxStatus::Pending) => any_pending = true,
                Ok(TxStatus::Dropped) => {}
                Err(e) => {
                    debug!(tx = %hash, error = %e, "Status unavailable, retrying next head");
                    return Ok(Step::Keep);
                }
            }
        }

        let Some(merged) = merge_versions(&ids, &landed) else {
            if !any_pending {
                return self.on_dropped(entry, head).await;
            }
            let sent_at = entry.attempt.last_sent_block.unwrap_or(entry.attempt.created_block);
            if head >= sent_at.saturating_add(self.config.stuck_after_blocks) {
                return self.bump(entry, head).await;
            }
            return Ok(Step::Keep);
        };
        if any_pending && !merged.results.iter().all(|(_, r)| r.executed()) {
            debug!(attempt = entry.attempt.id, "Version landed without every member, waiting on the rest");
            return Ok(Step::Keep);
        }
        self.on_confirmed(entry, merged, head, requeued)
    }

    async fn bump(&self, entry: &mut Tracked, head: BlockNumber) -> Result<Step, StoreError> {
        if entry.attempt.bumps >= self.config.max_bumps {
            let reason = format!("not confirmed after {} re-prices", entry.attempt.bumps);
            return self.fail(entry, Outcome::Failed, reason);
        }
        let old = entry.attempt.gas_price;
        entry.attempt.gas_price = self.config.bumped_price(old);
        entry.attempt.bumps += 1;
        self.lane.metrics().record_bump();
        info!(
            lane = %self.lane.name(),
            attempt = entry.attempt.id,
            nonce = ?entry.attempt.nonce,
            old_price = old,
            new_price = entry.attempt.gas_price,
            bumps = entry.attempt.bumps,
            "Re-pricing stuck fulfillment"
        );
        self.send(entry, head).await
    }

    /// No transaction of the attempt is on chain: rebroadcast in place while the
    /// nonce slot is open, otherwise start over under a fresh nonce.
    async fn on_dropped(&self, entry: &mut Tracked, head: BlockNumber) -> Result<Step, StoreError> {
        let reusable = match entry.attempt.nonce {
            Some(nonce) => {
                let lease = entry.attempt.lease.as_deref();
                match self.broadcaster.can_rebroadcast(nonce, lease).await {
                    Ok(open) => open,
                    Err(e) => {
                        debug!(error = %e, "Nonce check unavailable, retrying next head");
                        return Ok(Step::Keep);
                    }
                }
            }
            None => false,
        };

        if reusable {
            info!(lane = %self.lane.name(), attempt = entry.attempt.id, "Rebroadcasting dropped fulfillment");
        } else {
            info!(lane = %self.lane.name(), attempt = entry.attempt.id, "Dropped fulfillment re-queued under a fresh nonce");
            entry.attempt.nonce = None;
            entry.attempt.lease = None;
            entry.attempt.state = AttemptState::Unconfirmed;
            self.lane.store().append(&entry.attempt)?;
        }
        self.send(entry, head).await
    }

    fn on_confirmed(
        &self,
        entry: &mut Tracked,
        landed: Landed,
        head: BlockNumber,
        requeued: &mut Vec<RandomnessRequest>,
    ) -> Result<Step, StoreError> {
        let Landed { hash, block, results } = landed;
        let attempt = &mut entry.attempt;
        attempt.state = AttemptState::Confirmed;
        attempt.confirmed_block = Some(block);
        attempt.confirmed_tx = Some(hash.clone());
        attempt.results = results
            .into_iter()
            .map(|(request_id, result)| RequestResult { request_id, result })
            .collect();
        self.lane.store().append(attempt)?;
        self.lane.release(&attempt.reservations);
        info!(lane = %self.lane.name(), tx = %hash, block, requests = attempt.requests.len(), "Fulfillment confirmed");

        for request in &attempt.requests {
            if attempt.executed(&request.request_id) {
                self.lane
                    .metrics()
                    .record_confirmation(block.saturating_sub(request.block_number));
            } else if let Some(request) = self.requeue_rejected(request, head)? {
                requeued.push(request);
            }
        }

        self.finalize_if_due(entry, head)
    }

    /// Queue a batch member again, unless it was already rejected too often.
    fn requeue_rejected(
        &self,
        request: &RandomnessRequest,
        head: BlockNumber,
    ) -> Result<Option<RandomnessRequest>, StoreError> {
        let rejections = self
            .lane
            .store()
            .by_request(&request.request_id)?
            .iter()
            .filter(|a| a.state == AttemptState::Confirmed && !a.executed(&request.request_id))
            .count() as u32;
        if rejections > self.config.max_bumps {
            let reason = format!("not fulfilled by the coordinator in {rejections} attempts");
            error!(request_id = %request.request_id, %reason, "Giving up on request");
            self.lane.record_terminal(request, Outcome::Failed, reason, head)?;
            return Ok(None);
        }
        warn!(request_id = %request.request_id, rejections, "Batch member not fulfilled, re-queueing");
        self.lane.requeue(request);
        Ok(Some(request.clone()))
    }

    async fn poll_confirmed(&self, entry: &mut Tracked, head: BlockNumber) -> Result<Step, StoreError> {
        let Some(hash) = entry.attempt.confirmed_tx.clone() else {
            return self.finalize_if_due(entry, head);
        };
        let ids: Vec<RequestId> = entry.attempt.request_ids().collect();
        let status = match self
            .broadcaster
            .status(&hash, &ids, entry.attempt.lease.as_deref())
            .await
        {
            Ok(status) => status,
            Err(e) => {
                debug!(tx = %hash, error = %e, "Status unavailable, retrying next head");
                return Ok(Step::Keep);
            }
        };

        match status {
            TxStatus::Confirmed { block, .. } => {
                if entry.attempt.confirmed_block != Some(block) {
                    info!(tx = %hash, block, "Fulfillment re-included after reorg");
                    entry.attempt.confirmed_block = Some(block);
                    self.lane.store().append(&entry.attempt)?;
                }
                self.finalize_if_due(entry, head)
            }
            TxStatus::Pending | TxStatus::Dropped => {
                warn!(lane = %self.lane.name(), tx = %hash, "Confirmed fulfillment reorged out");
                self.lane.metrics().record_reorg();
                let attempt = &mut entry.attempt;
                attempt.state = AttemptState::Broadcast;
                attempt.confirmed_block = None;
                attempt.confirmed_tx = None;
                attempt.results.clear();
                attempt.last_sent_block = Some(head);
                self.lane.store().append(attempt)?;
                self.lane.hold(&attempt.reservations);
                if status == TxStatus::Dropped {
                    self.on_dropped(entry, head).await
                } else {
                    Ok(Step::Keep)
                }
            }
        }
    }

    /// Record and emit the outcome of every executed member once the
    /// confirmation is final. The record is written before anything is emitted.
    fn finalize_if_due(&self, entry: &mut Tracked, head: BlockNumber) -> Result<Step, StoreError> {
        let attempt = &mut entry.attempt;
        let Some(block) = attempt.confirmed_block else {
            return Ok(Step::Keep);
        };
        if head < block.saturating_add(self.config.finality_depth) {
            return Ok(Step::Keep);
        }

        let outcomes: Vec<RequestOutcome> = attempt
            .requests
            .iter()
            .filter_map(|request| {
                let outcome = match attempt.result_for(&request.request_id)? {
                    CallbackResult::Success => Outcome::Fulfilled,
                    CallbackResult::Reverted => Outcome::ConsumerReverted,
                    // Re-queued when it was confirmed.
                    CallbackResult::NotFulfilled => return None,
                };
                Some(RequestOutcome {
                    request_id: request.request_id,
                    outcome,
                })
            })
            .collect();
        attempt.outcomes = outcomes;
        self.lane.store().append(attempt)?;

        for recorded in &attempt.outcomes {
            self.lane.emit(OutcomeEvent {
                request_id: recorded.request_id,
                outcome: recorded.outcome,
                tx_hash: attempt.confirmed_tx.clone(),
                reason: None,
            });
        }
        debug!(lane = %self.lane.name(), attempt = attempt.id, "Fulfillment final");
        Ok(Step::Done)
    }

    fn fail(&self, entry: &mut Tracked, outcome: Outcome, reason: String) -> Result<Step, StoreError> {
        let attempt = &mut entry.attempt;
        attempt.state = AttemptState::Failed;
        attempt.error = Some(reason.clone());
        attempt.outcomes = attempt
            .requests
            .iter()
            .map(|request| RequestOutcome {
                request_id: request.request_id,
                outcome,
            })
            .collect();
        self.lane.store().append(attempt)?;
        self.lane.release(&attempt.reservations);
        error!(lane = %self.lane.name(), attempt = attempt.id, %reason, "Fulfillment attempt failed");
        for request in &attempt.requests {
            self.lane.emit(OutcomeEvent {
                request_id: request.request_id,
                outcome,
                tx_hash: attempt.tx_hashes.last().cloned(),
                reason: Some(reason.clone()),
            });
        }
        Ok(Step::Done)
    }
}

/// A version of an attempt found on chain.
struct Landed {
    hash: TxHash,
    block: BlockNumber,
    results: Vec<(RequestId, CallbackResult)>,
}

impl Landed {
    fn result(&self, id: &RequestId) -> Option<CallbackResult> {
        self.results.iter().find(|(r, _)| r == id).map(|(_, c)| *c)
    }
}

/// Fold the landed versions (newest first) into one confirmation. A member
/// counts as executed if any version executed it; the confirming transaction
/// is the one that executed the first executed member, else the newest.
fn merge_versions(ids: &[RequestId], landed: &[Landed]) -> Option<Landed> {
    let mut confirming: Option<&Landed> = None;
    let mut results = Vec::with_capacity(ids.len());
    for id in ids {
        let executed = landed
            .iter()
            .find_map(|l| l.result(id).filter(|r| r.executed()).map(|r| (l, r)));
        match executed {
            Some((version, result)) => {
                confirming.get_or_insert(version);
                results.push((*id, result));
            }
            None => results.push((*id, CallbackResult::NotFulfilled)),
        }
    }
    let confirming = confirming.or(landed.first())?;
    Some(Landed {
        hash: confirming.hash.clone(),
        block: confirming.block,
        results,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TrackerConfig {
        TrackerConfig {
            stuck_after_blocks: 3,
            max_bumps: 2,
            bump_percent: 20,
            min_bump: 5,
            finality_depth: 4,
            lane_max_price: 200,
        }
    }

    #[test]
    fn bump_is_percent_or_minimum_capped_at_lane_max() {
        let c = config();
        assert_eq!(c.bumped_price(100), 120);
        assert_eq!(c.bumped_price(10), 15);
        assert_eq!(c.bumped_price(190), 200);
        assert_eq!(c.bumped_price(200), 200);
    }

    fn landed(hash: &str, block: BlockNumber, results: &[(RequestId, CallbackResult)]) -> Landed {
        Landed {
            hash: TxHash(hash.into()),
            block,
            results: results.to_vec(),
        }
    }

    #[test]
    fn older_version_that_executed_wins_over_newer_skip() {
        let (a, b) = (RequestId([1; 32]), RequestId([2; 32]));
        let versions = [
            landed("v1", 12, &[(a, CallbackResult::NotFulfilled), (b, CallbackResult::NotFulfilled)]),
            landed("v0", 11, &[(a, CallbackResult::Success), (b, CallbackResult::Reverted)]),
        ];
        let merged = merge_versions(&[a, b], &versions).unwrap();
        assert_eq!(merged.hash, TxHash("v0".into()));
        assert_eq!(merged.block, 11);
        assert_eq!(
            merged.results,
            vec![(a, CallbackResult::Success), (b, CallbackResult::Reverted)]
        );
    }

    #[test]
    fn missing_results_count_as_not_fulfilled() {
        let (a, b) = (RequestId([1; 32]), RequestId([2; 32]));
        let versions = [landed("v0", 11, &[(a, CallbackResult::Success)])];
        let merged = merge_versions(&[a, b], &versions).unwrap();
        assert_eq!(merged.results[1], (b, CallbackResult::NotFulfilled));

        let failed = [landed("v0", 11, &[])];
        let merged = merge_versions(&[a], &failed).unwrap();
        assert_eq!(merged.hash, TxHash("v0".into()));
        assert_eq!(merged.results, vec![(a, CallbackResult::NotFulfilled)]);

        assert!(merge_versions(&[a], &[]).is_none());
    }
}
