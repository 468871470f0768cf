//! Coordinator log source over Solana RPC.
//!
//! A background task feeds a channel that backs [`LogSource`]. On every
//! (re)connect it:
//!
//! 1. **Subscribes** to program logs over WebSocket, so nothing emitted
//!    during the scan is missed.
//! 2. **Catches up** by scanning `getProgramAccounts` for pending request
//!    accounts, then emits [`LogEvent::CaughtUp`].
//! 3. **Streams** `RandomWordsRequested` events decoded from the
//!    `Program data:` log lines until the socket drops.
//!
//! The scan and the stream overlap, so consumers see replays; the lane
//! listeners dedup them.

use async_trait::async_trait;
use base64::Engine;
use futures_util::StreamExt;
use solana_account_decoder::UiAccountEncoding;
use solana_client::nonblocking::pubsub_client::PubsubClient;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::{
    RpcAccountInfoConfig, RpcProgramAccountsConfig, RpcTransactionLogsConfig,
    RpcTransactionLogsFilter,
};
use solana_client::rpc_filter::{Memcmp, RpcFilterType};
use solana_commitment_config::CommitmentConfig;
use solana_sdk::pubkey::Pubkey;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::LedgerError;
use crate::ledger::{LogEvent, LogSource};
use crate::types::{KeyHash, RandomnessRequest, RequestId};

const WS_RECONNECT_DELAY: Duration = Duration::from_secs(5);

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// `request_id (32) + key_hash (32) + sub_id (8) + num_words (4) +
/// callback_gas_limit (4) + min_confirmations (2) + slot (8) + pre_seed (32) +
/// sender (32)`.
pub const REQUEST_BODY_LEN: usize = 154;

/// Status byte of a request account, after the 8-byte discriminator and body.
const STATUS_OFFSET: usize = 8 + REQUEST_BODY_LEN;

const STATUS_PENDING: u8 = 0;

/// `sha256("<namespace>:<name>")[..8]`.
pub fn discriminator(namespace: &str, name: &str) -> [u8; 8] {
    use sha2::{Digest, Sha256};
    let hash = Sha256::digest(format!("{namespace}:{name}"));
    let mut disc = [0u8; 8];
    disc.copy_from_slice(&hash[..8]);
    disc
}

/// Decode a request event or account body (discriminator stripped).
pub fn decode_request(data: &[u8]) -> Option<RandomnessRequest> {
    if data.len() < REQUEST_BODY_LEN {
        return None;
    }
    let bytes32 = |at: usize| -> Option<[u8; 32]> { data[at..at + 32].try_into().ok() };

    Some(RandomnessRequest {
        request_id: RequestId(bytes32(0)?),
        key_hash: KeyHash(bytes32(32)?),
        subscription_id: u64::from_le_bytes(data[64..72].try_into().ok()?),
        num_words: u32::from_le_bytes(data[72..76].try_into().ok()?),
        callback_gas_limit: u32::from_le_bytes(data[76..80].try_into().ok()?),
        min_confirmations: u16::from_le_bytes(data[80..82].try_into().ok()?),
        block_number: u64::from_le_bytes(data[82..90].try_into().ok()?),
        pre_seed: bytes32(90)?,
        sender: Pubkey::new_from_array(bytes32(122)?),
    })
}

/// Pull `RandomWordsRequested` events out of one transaction's log lines.
pub fn decode_log_lines(logs: &[String], event_disc: &[u8; 8]) -> Vec<RandomnessRequest> {
    let mut out = Vec::new();
    for line in logs {
        let Some(data) = line.strip_prefix("Program data: ") else {
            continue;
        };
        let decoded = match base64::engine::general_purpose::STANDARD.decode(data.trim()) {
            Ok(d) => d,
            Err(e) => {
                debug!(error = %e, "Failed to decode base64 log data");
                continue;
            }
        };
        if decoded.len() < 8 || decoded[..8] != *event_disc {
            continue;
        }
        match decode_request(&decoded[8..]) {
            Some(request) => out.push(request),
            None => warn!(len = decoded.len(), "Malformed RandomWordsRequested event"),
        }
    }
    out
}

#[derive(Debug, Clone)]
pub struct LogSourceSettings {
    pub rpc_url: String,
    pub ws_url: String,
    pub program_id: Pubkey,
}

/// [`LogSource`] backed by a websocket subscription plus catch-up scans.
pub struct PubsubLogSource {
    events: mpsc::Receiver<LogEvent>,
    task: JoinHandle<()>,
}

impl PubsubLogSource {
    pub fn spawn(settings: LogSourceSettings) -> Self {
        let (tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let task = tokio::spawn(run(settings, tx));
        Self { events, task }
    }
}

impl Drop for PubsubLogSource {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl LogSource for PubsubLogSource {
    async fn next_event(&mut self) -> Result<Option<LogEvent>, LedgerError> {
        Ok(self.events.recv().await)
    }
}

async fn run(settings: LogSourceSettings, tx: mpsc::Sender<LogEvent>) {
    let event_disc = discriminator("event", "RandomWordsRequested");

    loop {
        info!(url = %settings.ws_url, "Connecting to WebSocket");
        match PubsubClient::new(&settings.ws_url).await {
            Ok(pubsub) => {
                let filter =
                    RpcTransactionLogsFilter::Mentions(vec![settings.program_id.to_string()]);
                let logs_config = RpcTransactionLogsConfig {
                    commitment: Some(CommitmentConfig::confirmed()),
                };

                match pubsub.logs_subscribe(filter, logs_config).await {
                    Ok((mut stream, _unsub)) => {
                        info!("Subscribed to coordinator logs");
                        if !catch_up(&settings, &tx).await {
                            return;
                        }
                        while let Some(log) = stream.next().await {
                            for request in decode_log_lines(&log.value.logs, &event_disc) {
                                info!(
                                    request_id = %request.request_id,
                                    sub_id = request.subscription_id,
                                    slot = request.block_number,
                                    "Received RandomWordsRequested event"
                                );
                                if tx.send(LogEvent::Request(request)).await.is_err() {
                                    error!("Event channel closed, stopping log source");
                                    return;
                                }
                            }
                        }
                        warn!("WebSocket stream ended, reconnecting");
                    }
                    Err(e) => error!(error = %e, "Failed to subscribe to logs"),
                }
            }
            Err(e) => error!(error = %e, "Failed to connect to WebSocket"),
        }

        info!(delay = ?WS_RECONNECT_DELAY, "Reconnecting");
        tokio::time::sleep(WS_RECONNECT_DELAY).await;
    }
}

/// Replay every pending request account. Returns `false` once the consumer is gone.
async fn catch_up(settings: &LogSourceSettings, tx: &mpsc::Sender<LogEvent>) -> bool {
    info!("Scanning for pending requests");
    let client = RpcClient::new(settings.rpc_url.clone());

    let filters = vec![
        RpcFilterType::Memcmp(Memcmp::new_raw_bytes(
            0,
            discriminator("account", "RandomnessRequest").to_vec(),
        )),
        RpcFilterType::Memcmp(Memcmp::new_raw_bytes(STATUS_OFFSET, vec![STATUS_PENDING])),
    ];
    let config = RpcProgramAccountsConfig {
        filters: Some(filters),
        account_config: RpcAccountInfoConfig {
            encoding: Some(UiAccountEncoding::Base64),
            commitment: Some(CommitmentConfig::confirmed()),
            ..Default::default()
        },
        ..Default::default()
    };

    match client
        .get_program_ui_accounts_with_config(&settings.program_id, config)
        .await
    {
        Ok(accounts) => {
            info!(count = accounts.len(), "Found pending requests");
            for (pubkey, account) in accounts {
                let Some(data) = account.data.decode() else {
                    warn!(account = %pubkey, "Failed to decode account data, skipping");
                    continue;
                };
                let Some(request) = data.get(8..).and_then(decode_request) else {
                    warn!(account = %pubkey, len = data.len(), "Request account too short, skipping");
                    continue;
                };
                if tx.send(LogEvent::Request(request)).await.is_err() {
                    return false;
                }
            }
        }
        // Live events still flow; the next reconnect scans again.
        Err(e) => error!(error = %e, "Failed to fetch pending request accounts"),
    }

    tx.send(LogEvent::CaughtUp).await.is_ok()
}
