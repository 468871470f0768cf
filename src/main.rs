//! VRF Oracle
//!
//! Off-chain service that fulfills randomness requests made through the VRF
//! coordinator program. Runs these concurrent subsystems:
//!
//! - **Log source + router**: WebSocket log subscription with catch-up scans,
//!   fanned out to lanes by verification key hash.
//! - **Lanes**: one per gas lane, each a replay-tolerant listener and a pipeline that
//!   proves, prices, batches, submits and tracks fulfillments.
//! - **Head poller**: publishes the confirmed slot every lane advances on.
//! - **Outcome reporter**: logs every terminal request outcome.
//! - **HTTP server**: `/health`, `/status` and `/metrics` probes.

use actix_web::{App, HttpResponse, HttpServer, web};
use anyhow::{Context, bail};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_commitment_config::CommitmentConfig;
use solana_sdk::signature::Signer;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use vrf_oracle::config::{AppConfig, load_lanes, read_lanes_file};
use vrf_oracle::gas::GasCalculator;
use vrf_oracle::lane::LaneState;
use vrf_oracle::ledger::BlockSource;
use vrf_oracle::listener::{LaneListener, route_logs};
use vrf_oracle::logs::{LogSourceSettings, PubsubLogSource};
use vrf_oracle::metrics::Metrics;
use vrf_oracle::pipeline::{ChainReaders, LanePipeline, PipelineConfig};
use vrf_oracle::proof::ProofBuilder;
use vrf_oracle::reconciler::recover_lane;
use vrf_oracle::rpc::{RpcBroadcaster, RpcChain};
use vrf_oracle::store::{AttemptStore, JsonlAttemptStore};
use vrf_oracle::tracker::Tracker;
use vrf_oracle::types::{BlockNumber, Outcome, OutcomeEvent};

const LANE_CHANNEL_CAPACITY: usize = 256;

const OUTCOME_CHANNEL_CAPACITY: usize = 1024;

/// Shared application state accessible from HTTP handlers.
struct AppState {
    metrics: Arc<Metrics>,
    lanes: Vec<Arc<LaneState>>,
    ready: watch::Receiver<bool>,
    head: watch::Receiver<BlockNumber>,
}

/// Liveness probe: returns 200 if the process is running.
async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({"status": "ok"}))
}

/// Readiness of the log source plus per-lane queue depths.
async fn status(data: web::Data<AppState>) -> HttpResponse {
    let lanes: Vec<_> = data.lanes.iter().map(|l| l.status()).collect();
    HttpResponse::Ok().json(serde_json::json!({
        "status": "running",
        "ready": *data.ready.borrow(),
        "head": *data.head.borrow(),
        "lanes": lanes,
    }))
}

async fn metrics(data: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(data.metrics.to_json())
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();

    fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,solana_client=warn,solana_rpc_client=warn,hyper=warn")),
        )
        .with_target(true)
        .with_ansi(true)
        .init();

    let config = AppConfig::from_env().expect("invalid configuration");

    info!(program = %config.program_id, "Starting VRF oracle");
    info!(rpc = %config.rpc_url, ws = %config.ws_url, "Endpoints configured");

    let state = match start(&config).await {
        Ok(state) => web::Data::new(state),
        Err(e) => {
            error!(error = %format!("{e:#}"), "Startup failed");
            std::process::exit(1);
        }
    };

    let addr = format!("0.0.0.0:{}", config.http_port);
    info!(%addr, "Starting HTTP server");

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .route("/health", web::get().to(health))
            .route("/status", web::get().to(status))
            .route("/metrics", web::get().to(metrics))
    })
    .bind(addr)?
    .run()
    .await
}

/// Recover every lane from the attempt store and spawn the subsystems.
async fn start(config: &AppConfig) -> anyhow::Result<AppState> {
    let store: Arc<dyn AttemptStore> = Arc::new(
        JsonlAttemptStore::open(&config.attempt_store_path)
            .with_context(|| format!("failed to open attempt store {}", config.attempt_store_path))?,
    );

    let client = Arc::new(RpcClient::new_with_commitment(
        config.rpc_url.clone(),
        CommitmentConfig::confirmed(),
    ));
    let chain = Arc::new(RpcChain::new(client.clone(), config.program_id));
    let head = chain
        .latest_block()
        .await
        .context("failed to read the chain head")?;

    let lanes = load_lanes(&read_lanes_file(&config.lanes_path)?);
    if lanes.is_empty() {
        bail!("no usable gas lanes in {}", config.lanes_path);
    }

    let metrics = Arc::new(Metrics::new());
    let (outcomes, _) = broadcast::channel(OUTCOME_CHANNEL_CAPACITY);
    tokio::spawn(report_outcomes(outcomes.subscribe()));

    let (head_tx, head_rx) = watch::channel(head);
    let (ready_tx, ready_rx) = watch::channel(false);
    let readers = ChainReaders {
        blocks: chain.clone(),
        subscriptions: chain.clone(),
        gas: chain.clone(),
    };
    let hmac_secret = Arc::new(config.hmac_secret.clone());

    let mut routes = HashMap::new();
    let mut lane_states = Vec::with_capacity(lanes.len());
    for lane in lanes {
        let signer = lane.signer.pubkey().to_string();
        let recovered = recover_lane(
            store.as_ref(),
            &signer,
            lane.key_hash,
            head,
            config.finality_depth,
        )
        .with_context(|| format!("failed to recover lane {}", lane.name))?;
        let first_nonce = recovered
            .tracked
            .iter()
            .filter_map(|a| a.nonce)
            .max()
            .map_or(0, |n| n + 1);

        let state = Arc::new(LaneState::new(
            lane.name.clone(),
            signer,
            lane.key_hash,
            &recovered,
            head,
            store.clone(),
            outcomes.clone(),
            metrics.clone(),
        ));
        let proofs = ProofBuilder::new(lane.verification.clone(), hmac_secret.clone());
        let broadcaster = Arc::new(RpcBroadcaster::new(
            client.clone(),
            config.program_id,
            lane.signer.clone(),
            first_nonce,
        ));
        let mut tracker = Tracker::new(
            state.clone(),
            broadcaster,
            chain.clone(),
            proofs.clone(),
            config.tracker_config(lane.max_gas_price),
        );
        tracker.adopt(recovered.tracked);

        let pipeline = LanePipeline::new(
            state.clone(),
            readers.clone(),
            proofs,
            GasCalculator::new(config.gas.clone()),
            tracker,
            PipelineConfig {
                max_gas_price: lane.max_gas_price,
                retention_blocks: config.retention_blocks,
                prune_horizon: config.retention_blocks + config.finality_depth,
                batch: lane.batch,
            },
        );

        let (listen_tx, listen_rx) = mpsc::channel(LANE_CHANNEL_CAPACITY);
        let (pipeline_tx, pipeline_rx) = mpsc::channel(LANE_CHANNEL_CAPACITY);
        tokio::spawn(pipeline.run(pipeline_rx, head_rx.clone()));
        tokio::spawn(
            LaneListener::new(state.clone(), config.retention_blocks).run(
                listen_rx,
                head_rx.clone(),
                pipeline_tx,
            ),
        );

        routes.insert(lane.key_hash, listen_tx);
        lane_states.push(state);
    }

    tokio::spawn(poll_heads(chain, head_tx, config.head_poll_interval));

    let source = PubsubLogSource::spawn(LogSourceSettings {
        rpc_url: config.rpc_url.clone(),
        ws_url: config.ws_url.clone(),
        program_id: config.program_id,
    });
    tokio::spawn(route_logs(Box::new(source), routes, ready_tx));

    Ok(AppState {
        metrics,
        lanes: lane_states,
        ready: ready_rx,
        head: head_rx,
    })
}

/// Publish the confirmed slot whenever it advances.
async fn poll_heads(chain: Arc<RpcChain>, heads: watch::Sender<BlockNumber>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        match chain.latest_block().await {
            Ok(head) => {
                heads.send_if_modified(|current| {
                    if head > *current {
                        *current = head;
                        true
                    } else {
                        false
                    }
                });
            }
            Err(e) => warn!(error = %e, "Failed to poll chain head"),
        }
    }
}

async fn report_outcomes(mut outcomes: broadcast::Receiver<OutcomeEvent>) {
    loop {
        match outcomes.recv().await {
            Ok(event) => {
                let tx = event.tx_hash.as_ref().map(ToString::to_string).unwrap_or_default();
                let reason = event.reason.as_deref().unwrap_or_default();
                match event.outcome {
                    Outcome::Fulfilled | Outcome::ConsumerReverted => info!(
                        request_id = %event.request_id,
                        outcome = %event.outcome,
                        %tx,
                        "Request fulfilled"
                    ),
                    Outcome::Unfulfillable | Outcome::Failed => warn!(
                        request_id = %event.request_id,
                        outcome = %event.outcome,
                        %tx,
                        %reason,
                        "Request not fulfilled"
                    ),
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Outcome reporter lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
