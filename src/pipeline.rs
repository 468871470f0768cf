//! Per-lane fulfillment driver.
//!
//! Requests accepted by the lane's listener wait here until they have enough
//! confirmations. On every new head the pipeline advances the tracker, then
//! walks the waiting queue oldest first: each request is validated against
//! its subscription, priced, funded, proven and handed to the batcher or
//! straight to the tracker. Transient conditions leave a request in place for
//! the next head without blocking the ones behind it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::batch::{BatchAggregator, BatchConfig, ReadyFulfillment, Submission};
use crate::error::{Disposition, FulfillmentError, StoreError, SubmitError};
use crate::gas::GasCalculator;
use crate::lane::LaneState;
use crate::ledger::{BlockSource, GasEstimator, SubscriptionReader};
use crate::proof::ProofBuilder;
use crate::store::Reservation;
use crate::tracker::Tracker;
use crate::types::{BlockNumber, RandomnessRequest};

const IDLE_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub max_gas_price: u64,
    pub retention_blocks: u64,
    /// Counts are kept this many blocks past a request before pruning.
    pub prune_horizon: u64,
    pub batch: Option<BatchConfig>,
}

/// Ledger reads the pipeline depends on.
#[derive(Clone)]
pub struct ChainReaders {
    pub blocks: Arc<dyn BlockSource>,
    pub subscriptions: Arc<dyn SubscriptionReader>,
    pub gas: Arc<dyn GasEstimator>,
}

pub struct LanePipeline {
    lane: Arc<LaneState>,
    chain: ChainReaders,
    proofs: ProofBuilder,
    calculator: GasCalculator,
    tracker: Tracker,
    batcher: Option<BatchAggregator>,
    config: PipelineConfig,
    waiting: VecDeque<RandomnessRequest>,
}

impl LanePipeline {
    pub fn new(
        lane: Arc<LaneState>,
        chain: ChainReaders,
        proofs: ProofBuilder,
        calculator: GasCalculator,
        tracker: Tracker,
        config: PipelineConfig,
    ) -> Self {
        let batcher = config.batch.clone().map(BatchAggregator::new);
        Self {
            lane,
            chain,
            proofs,
            calculator,
            tracker,
            batcher,
            config,
            waiting: VecDeque::new(),
        }
    }

    pub fn enqueue(&mut self, request: RandomnessRequest) {
        debug!(lane = %self.lane.name(), request_id = %request.request_id, "Request queued");
        self.waiting.push_back(request);
        self.publish_depths();
    }

    pub fn queued(&self) -> usize {
        self.waiting.len() + self.batcher.as_ref().map_or(0, BatchAggregator::pending)
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    pub async fn on_head(&mut self, head: BlockNumber) -> Result<(), StoreError> {
        let requeued = self.tracker.on_head(head).await?;
        for request in requeued.into_iter().rev() {
            self.waiting.push_front(request);
        }

        let result = self.process_waiting(head).await;
        if result.is_ok() {
            self.flush(Instant::now(), head).await?;
        }
        self.lane.prune(head, self.config.prune_horizon);
        self.publish_depths();
        result
    }

    /// Submit batches that are due at `now`.
    pub async fn flush(&mut self, now: Instant, head: BlockNumber) -> Result<(), StoreError> {
        let due = match self.batcher.as_mut() {
            Some(batcher) => batcher.drain(now),
            None => return Ok(()),
        };
        let submitted = self.submit_all(due, head).await;
        self.publish_depths();
        submitted
    }

    /// Hand submissions to the tracker in order. On a store failure the
    /// failed submission and everything after it go back to the front of the
    /// queue with their reservations released.
    async fn submit_all(&mut self, submissions: Vec<Submission>, head: BlockNumber) -> Result<(), StoreError> {
        let mut pending = submissions.into_iter();
        while let Some(submission) = pending.next() {
            match self.tracker.submit(submission, head).await {
                Ok(()) => {}
                Err(SubmitError::NotRecorded { submission, source }) => {
                    self.unsubmit(std::iter::once(submission).chain(pending));
                    return Err(source);
                }
                Err(SubmitError::Store(e)) => {
                    self.unsubmit(pending);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn unsubmit(&mut self, submissions: impl IntoIterator<Item = Submission>) {
        let mut requests = Vec::new();
        for submission in submissions {
            self.lane.release(&submission.reservations());
            requests.extend(submission.requests());
        }
        if !requests.is_empty() {
            warn!(lane = %self.lane.name(), requests = requests.len(), "Submission not recorded, re-queueing");
        }
        for request in requests.into_iter().rev() {
            self.waiting.push_front(request);
        }
    }

    async fn process_waiting(&mut self, head: BlockNumber) -> Result<(), StoreError> {
        let mut estimate = None;
        let mut deferred = VecDeque::new();

        while let Some(request) = self.waiting.pop_front() {
            if head < request.ready_at() {
                deferred.push_back(request);
                continue;
            }
            let prepared = self.prepare(&request, head, &mut estimate).await;
            let step = match prepared {
                Ok(ready) => self.dispatch(ready, head).await,
                Err(e) => match e.disposition() {
                    Disposition::Defer => {
                        debug!(request_id = %request.request_id, reason = %e, "Request deferred");
                        deferred.push_back(request.clone());
                        Ok(())
                    }
                    Disposition::Terminal(outcome) => {
                        warn!(request_id = %request.request_id, %outcome, reason = %e, "Request is terminal");
                        let recorded = self.lane.record_terminal(&request, outcome, e.to_string(), head);
                        if recorded.is_err() {
                            deferred.push_back(request.clone());
                        }
                        recorded
                    }
                },
            };
            if let Err(e) = step {
                // Keep everything not yet handled queued for the next head.
                deferred.extend(self.waiting.drain(..));
                self.waiting = deferred;
                return Err(e);
            }
        }

        self.waiting = deferred;
        Ok(())
    }

    /// Validate, price, fund and prove one request.
    async fn prepare(
        &self,
        request: &RandomnessRequest,
        head: BlockNumber,
        estimate: &mut Option<u64>,
    ) -> Result<ReadyFulfillment, FulfillmentError> {
        if head > request.block_number.saturating_add(self.config.retention_blocks) {
            return Err(FulfillmentError::Expired {
                block: request.block_number,
                head,
            });
        }

        let subscription = self
            .chain
            .subscriptions
            .subscription(request.subscription_id)
            .await?
            .ok_or(FulfillmentError::SubscriptionCanceled(request.subscription_id))?;
        if !subscription.has_consumer(&request.sender) {
            return Err(FulfillmentError::ConsumerNotRegistered(subscription.id));
        }

        let network_price = match *estimate {
            Some(price) => price,
            None => {
                let price = self.chain.gas.gas_price().await?;
                *estimate = Some(price);
                price
            }
        };
        let quote = self.calculator.quote(
            request,
            subscription.req_count,
            network_price,
            self.config.max_gas_price,
        )?;

        self.lane
            .try_reserve(subscription.id, subscription.balance, quote.max_payment)
            .map_err(|available| FulfillmentError::InsufficientFunds {
                subscription_id: subscription.id,
                needed: quote.max_payment,
                available,
            })?;
        let reservation = Reservation {
            subscription_id: subscription.id,
            amount: quote.max_payment,
        };

        let call = match self.proofs.build(request, self.chain.blocks.as_ref()).await {
            Ok(call) => call,
            Err(e) => {
                self.lane.release(&[reservation]);
                return Err(e);
            }
        };

        Ok(ReadyFulfillment {
            call,
            quote,
            reservation,
            queued_at: Instant::now(),
        })
    }

    async fn dispatch(&mut self, ready: ReadyFulfillment, head: BlockNumber) -> Result<(), StoreError> {
        let submission = match self.batcher.as_mut() {
            Some(batcher) => match batcher.push(ready) {
                Some(single) => single,
                None => return Ok(()),
            },
            None => Submission::Single(ready),
        };
        self.submit_all(vec![submission], head).await
    }

    fn publish_depths(&self) {
        self.lane.set_depths(self.queued(), self.tracker.in_flight());
    }

    /// Drive the lane until its request channel or the head feed closes.
    pub async fn run(
        mut self,
        mut requests: mpsc::Receiver<RandomnessRequest>,
        mut heads: watch::Receiver<BlockNumber>,
    ) {
        let period = self
            .config
            .batch
            .as_ref()
            .map_or(IDLE_FLUSH_INTERVAL, |b| b.max_wait.max(Duration::from_millis(10)));
        let mut flush_tick = tokio::time::interval(period);
        flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            lane = %self.lane.name(),
            key_hash = %self.lane.key_hash(),
            batching = self.batcher.is_some(),
            "Lane pipeline started"
        );

        loop {
            tokio::select! {
                maybe = requests.recv() => match maybe {
                    Some(request) => self.enqueue(request),
                    None => {
                        info!(lane = %self.lane.name(), "Request channel closed");
                        break;
                    }
                },
                changed = heads.changed() => {
                    if changed.is_err() {
                        info!(lane = %self.lane.name(), "Head feed closed");
                        break;
                    }
                    let head = *heads.borrow_and_update();
                    if let Err(e) = self.on_head(head).await {
                        error!(lane = %self.lane.name(), head, error = %e, "Failed to advance lane");
                    }
                }
                _ = flush_tick.tick(), if self.batcher.is_some() => {
                    let head = *heads.borrow();
                    if let Err(e) = self.flush(Instant::now(), head).await {
                        error!(lane = %self.lane.name(), error = %e, "Failed to flush batches");
                    }
                }
            }
        }
    }
}
