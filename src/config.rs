//! Application configuration loaded from environment variables plus a JSON
//! gas-lane file.
//!
//! Required: `PROGRAM_ID`, `HMAC_SECRET`
//! Optional: `RPC_URL`, `WS_URL`, `LANES_CONFIG`, `ATTEMPT_STORE_PATH`,
//!           `HTTP_PORT`, `HEAD_POLL_INTERVAL_MS`, `FINALITY_DEPTH`,
//!           `REQUEST_RETENTION_BLOCKS`, `STUCK_AFTER_BLOCKS`, `MAX_GAS_BUMPS`,
//!           `GAS_BUMP_PERCENT`, `GAS_BUMP_MIN`, `COORDINATOR_GAS_OVERHEAD`,
//!           `BLOCK_GAS_CEILING`, `NATIVE_PER_FEE_UNIT`, `FLAT_FEE_TIERS`,
//!           `REQS_FOR_TIERS`

use anyhow::{Context, Result, bail, ensure};
use serde::Deserialize;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signer, read_keypair_file};
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::batch::BatchConfig;
use crate::gas::{FEE_TIERS, FeeSchedule, GasConfig};
use crate::tracker::TrackerConfig;
use crate::types::KeyHash;

/// Process-wide settings.
#[derive(Clone)]
pub struct AppConfig {
    /// Solana JSON-RPC endpoint (HTTP).
    pub rpc_url: String,
    /// Solana PubSub endpoint (WebSocket) for log subscriptions.
    pub ws_url: String,
    /// The deployed VRF coordinator program ID.
    pub program_id: Pubkey,
    /// Secret key for HMAC-SHA256 randomness generation.
    pub hmac_secret: Vec<u8>,
    pub lanes_path: String,
    pub attempt_store_path: String,
    pub http_port: u16,
    pub head_poll_interval: Duration,
    pub finality_depth: u64,
    pub retention_blocks: u64,
    pub stuck_after_blocks: u64,
    pub max_gas_bumps: u32,
    pub gas_bump_percent: u64,
    pub gas_bump_min: u64,
    pub gas: GasConfig,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let parsed = |name: &str, default: u64| -> u64 {
            var(name).and_then(|v| v.parse().ok()).unwrap_or(default)
        };

        let rpc_url = var("RPC_URL").unwrap_or_else(|| "http://127.0.0.1:8899".into());
        let ws_url = var("WS_URL").unwrap_or_else(|| "ws://127.0.0.1:8900".into());

        let program_id_str = var("PROGRAM_ID").context("PROGRAM_ID env var must be set")?;
        let program_id = Pubkey::from_str(&program_id_str)
            .with_context(|| format!("invalid PROGRAM_ID: {program_id_str}"))?;

        let hmac_secret = var("HMAC_SECRET")
            .context("HMAC_SECRET env var must be set")?
            .into_bytes();

        let fees = parse_list::<FEE_TIERS>(
            &var("FLAT_FEE_TIERS").unwrap_or_else(|| "1000,1000,100,10,1".into()),
        )
        .context("invalid FLAT_FEE_TIERS")?;
        let reqs_for_tier = parse_list::<{ FEE_TIERS - 1 }>(
            &var("REQS_FOR_TIERS").unwrap_or_else(|| "10,20,30,40".into()),
        )
        .context("invalid REQS_FOR_TIERS")?;

        let config = Self {
            rpc_url,
            ws_url,
            program_id,
            hmac_secret,
            lanes_path: var("LANES_CONFIG").unwrap_or_else(|| "lanes.json".into()),
            attempt_store_path: var("ATTEMPT_STORE_PATH")
                .unwrap_or_else(|| "data/attempts.jsonl".into()),
            http_port: var("HTTP_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(8080),
            head_poll_interval: Duration::from_millis(parsed("HEAD_POLL_INTERVAL_MS", 1000)),
            finality_depth: parsed("FINALITY_DEPTH", 32),
            retention_blocks: parsed("REQUEST_RETENTION_BLOCKS", 32),
            stuck_after_blocks: parsed("STUCK_AFTER_BLOCKS", 8),
            max_gas_bumps: var("MAX_GAS_BUMPS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            gas_bump_percent: parsed("GAS_BUMP_PERCENT", 20),
            gas_bump_min: parsed("GAS_BUMP_MIN", 1),
            gas: GasConfig {
                coordinator_overhead: parsed("COORDINATOR_GAS_OVERHEAD", 90_000),
                block_gas_ceiling: parsed("BLOCK_GAS_CEILING", 30_000_000),
                native_per_fee_unit: parsed("NATIVE_PER_FEE_UNIT", 1),
                fee_schedule: FeeSchedule {
                    fees,
                    reqs_for_tier,
                },
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.retention_blocks <= self.finality_depth,
            "REQUEST_RETENTION_BLOCKS ({}) must not exceed FINALITY_DEPTH ({})",
            self.retention_blocks,
            self.finality_depth
        );
        ensure!(self.gas.native_per_fee_unit > 0, "NATIVE_PER_FEE_UNIT must be positive");
        self.gas
            .fee_schedule
            .validate()
            .map_err(anyhow::Error::msg)
            .context("invalid fee schedule")?;
        Ok(())
    }

    pub fn tracker_config(&self, lane_max_price: u64) -> TrackerConfig {
        TrackerConfig {
            stuck_after_blocks: self.stuck_after_blocks,
            max_bumps: self.max_gas_bumps,
            bump_percent: self.gas_bump_percent,
            min_bump: self.gas_bump_min,
            finality_depth: self.finality_depth,
            lane_max_price,
        }
    }
}

fn parse_list<const N: usize>(raw: &str) -> Result<[u64; N]> {
    let values = raw
        .split(',')
        .map(|v| v.trim().parse::<u64>())
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("not a list of integers: {raw}"))?;
    let count = values.len();
    values
        .try_into()
        .map_err(|_| anyhow::anyhow!("expected {N} values, got {count}"))
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct BatchSettings {
    pub max_size: usize,
    pub max_gas: u64,
    pub max_wait_ms: u64,
}

/// One entry of the lanes file.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct LaneConfig {
    pub name: String,
    pub verification_keypair_path: String,
    #[serde(default)]
    pub signing_keypair_path: Option<String>,
    pub max_gas_price: u64,
    #[serde(default)]
    pub batch: Option<BatchSettings>,
}

/// A lane whose keys loaded and whose settings are usable.
pub struct LoadedLane {
    pub name: String,
    pub verification: Arc<Keypair>,
    pub signer: Arc<Keypair>,
    pub key_hash: KeyHash,
    pub max_gas_price: u64,
    pub batch: Option<BatchConfig>,
}

pub fn read_lanes_file(path: impl AsRef<Path>) -> Result<Vec<LaneConfig>> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read lanes file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("malformed lanes file {}", path.display()))
}

fn read_keypair(path: &str) -> Result<Keypair> {
    let path = shellexpand::tilde(path).to_string();
    read_keypair_file(&path)
        .map_err(|e| anyhow::anyhow!("{e}"))
        .with_context(|| format!("failed to read keypair from {path}"))
}

impl LaneConfig {
    pub fn load(&self) -> Result<LoadedLane> {
        ensure!(self.max_gas_price > 0, "max_gas_price must be positive");
        let verification = read_keypair(&self.verification_keypair_path)
            .context("malformed verification key")?;
        let signing_path = match self.signing_keypair_path.as_deref() {
            Some(path) if !path.trim().is_empty() => path,
            _ => bail!("lane has no signing key"),
        };
        let signer = read_keypair(signing_path).context("unreadable signing key")?;

        let batch = match &self.batch {
            Some(b) => {
                ensure!(b.max_size > 0, "batch max_size must be positive");
                Some(BatchConfig {
                    max_size: b.max_size,
                    max_gas: b.max_gas,
                    max_wait: Duration::from_millis(b.max_wait_ms),
                })
            }
            None => None,
        };

        Ok(LoadedLane {
            name: self.name.clone(),
            key_hash: KeyHash::of(&verification.pubkey()),
            verification: Arc::new(verification),
            signer: Arc::new(signer),
            max_gas_price: self.max_gas_price,
            batch,
        })
    }
}

/// Load every lane, skipping (and logging) the ones that cannot start.
pub fn load_lanes(configs: &[LaneConfig]) -> Vec<LoadedLane> {
    let mut seen = HashSet::new();
    let mut lanes = Vec::new();
    for config in configs {
        let lane = match config.load() {
            Ok(lane) => lane,
            Err(e) => {
                error!(lane = %config.name, error = %format!("{e:#}"), "Lane not started");
                continue;
            }
        };
        if !seen.insert(lane.key_hash) {
            error!(lane = %config.name, key_hash = %lane.key_hash, "Duplicate verification key, lane not started");
            continue;
        }
        info!(
            lane = %lane.name,
            key_hash = %lane.key_hash,
            signer = %lane.signer.pubkey(),
            max_gas_price = lane.max_gas_price,
            batching = lane.batch.is_some(),
            "Lane configured"
        );
        lanes.push(lane);
    }
    lanes
}
