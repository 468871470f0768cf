//! Request listener.
//!
//! [`route_logs`] reads the shared log source and hands each request to the
//! lane registered for its key hash. Each lane's [`LaneListener`] then drops
//! forged or replayed logs and records expired requests, so the pipeline only
//! ever sees a request once per process lifetime.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::error::{FulfillmentError, StoreError};
use crate::lane::{Admission, LaneState};
use crate::ledger::{LogEvent, LogSource};
use crate::types::{BlockNumber, KeyHash, Outcome, RandomnessRequest, RequestId};

const SOURCE_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Fan requests out to lanes by key hash; publish readiness once the source
/// reports it has caught up.
pub async fn route_logs(
    mut source: Box<dyn LogSource>,
    lanes: HashMap<KeyHash, mpsc::Sender<RandomnessRequest>>,
    ready: watch::Sender<bool>,
) {
    info!(lanes = lanes.len(), "Log router started");
    loop {
        match source.next_event().await {
            Ok(Some(LogEvent::Request(request))) => match lanes.get(&request.key_hash) {
                Some(lane) => {
                    if lane.send(request).await.is_err() {
                        warn!("Lane listener stopped, dropping request");
                    }
                }
                None => debug!(key_hash = %request.key_hash, "No lane for key hash"),
            },
            Ok(Some(LogEvent::CaughtUp)) => {
                if !ready.send_replace(true) {
                    info!("Log source caught up, listeners ready");
                }
            }
            Ok(None) => {
                info!("Log source ended");
                break;
            }
            Err(e) => {
                warn!(error = %e, delay = ?SOURCE_RETRY_DELAY, "Log source error");
                tokio::time::sleep(SOURCE_RETRY_DELAY).await;
            }
        }
    }
}

/// Replay-tolerant admission of one lane's requests.
pub struct LaneListener {
    lane: Arc<LaneState>,
    retention_blocks: u64,
}

impl LaneListener {
    pub fn new(lane: Arc<LaneState>, retention_blocks: u64) -> Self {
        Self {
            lane,
            retention_blocks,
        }
    }

    /// Returns the request when it should be forwarded to the pipeline.
    pub fn accept(
        &self,
        request: RandomnessRequest,
        head: BlockNumber,
    ) -> Result<Option<RandomnessRequest>, StoreError> {
        let expected = RequestId::derive(&request.key_hash, &request.pre_seed);
        if request.request_id != expected || request.key_hash != self.lane.key_hash() {
            warn!(request_id = %request.request_id, "Request id does not match its pre-seed, ignoring");
            return Ok(None);
        }

        match self.lane.admit(&request) {
            Admission::Accepted => {}
            Admission::Duplicate | Admission::AlreadyAttempted => {
                self.lane.metrics().record_duplicate();
                debug!(request_id = %request.request_id, "Skipping replayed request");
                return Ok(None);
            }
        }

        if head > request.block_number.saturating_add(self.retention_blocks) {
            let reason = FulfillmentError::Expired {
                block: request.block_number,
                head,
            };
            warn!(request_id = %request.request_id, %reason, "Dropping unserviceable request");
            self.lane
                .record_terminal(&request, Outcome::Unfulfillable, reason.to_string(), head)?;
            return Ok(None);
        }

        self.lane.metrics().record_request();
        Ok(Some(request))
    }

    pub async fn run(
        self,
        mut incoming: mpsc::Receiver<RandomnessRequest>,
        heads: watch::Receiver<BlockNumber>,
        pipeline: mpsc::Sender<RandomnessRequest>,
    ) {
        while let Some(request) = incoming.recv().await {
            let head = *heads.borrow();
            match self.accept(request, head) {
                Ok(Some(request)) => {
                    if pipeline.send(request).await.is_err() {
                        warn!(lane = %self.lane.name(), "Pipeline stopped, listener exiting");
                        return;
                    }
                }
                Ok(None) => {}
                Err(e) => error!(lane = %self.lane.name(), error = %e, "Failed to record request"),
            }
        }
        info!(lane = %self.lane.name(), "Lane listener stopped");
    }
}
