//! Solana JSON-RPC implementations of the ledger collaborators.
//!
//! Fulfillment transactions contain, in order:
//! 1. `SetComputeUnitLimit` and `SetComputeUnitPrice` compute-budget
//!    instructions carrying the attempt's gas limit and price.
//! 2. Per fulfilled request, a native Ed25519 signature-verify instruction
//!    (the proof) followed by the coordinator's `fulfill_random_words`
//!    instruction, which checks the proof against the commitment, charges
//!    the subscription and invokes the consumer callback.
//!
//! Solana has no account nonces; a lane's "nonce" is a local sequence number
//! bound to the recent blockhash its first transaction was signed with.
//! Re-priced transactions reuse that blockhash, so every version of an
//! attempt expires together and the slot stays open until it does.

use async_trait::async_trait;
use base64::Engine;
use serde_json::{Value, json};
use solana_account_decoder::UiAccountEncoding;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::{
    RpcAccountInfoConfig, RpcProgramAccountsConfig, RpcSendTransactionConfig,
};
use solana_client::rpc_filter::{Memcmp, RpcFilterType};
use solana_client::rpc_request::RpcRequest;
use solana_commitment_config::CommitmentConfig;
use solana_sdk::hash::Hash;
use solana_sdk::instruction::{AccountMeta, Instruction};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signature, Signer};
use solana_sdk::sysvar;
use solana_sdk::transaction::Transaction;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, instrument, warn};

use crate::error::LedgerError;
use crate::ledger::{
    BlockSource, Broadcaster, CallbackResult, GasEstimator, SentTx, SubscriptionReader, TxRequest,
    TxStatus,
};
use crate::logs::discriminator;
use crate::proof::FulfillmentCall;
use crate::types::{BlockNumber, RequestId, Subscription, TxHash};

/// Hard per-transaction compute cap.
const MAX_COMPUTE_UNITS: u64 = 1_400_000;

const COMPUTE_BUDGET_ID: Pubkey =
    Pubkey::from_str_const("ComputeBudget111111111111111111111111111111");

/// `disc (8) + id (8) + owner (32) + balance (8) + req_count (8)`.
const SUBSCRIPTION_MIN_LEN: usize = 64;

/// `disc (8) + subscription_id (8) + consumer (32)`.
const CONSUMER_MIN_LEN: usize = 48;

/// `request_id (32) + success (1)`.
const FULFILLED_EVENT_LEN: usize = 33;

fn rpc_err(e: impl Display) -> LedgerError {
    LedgerError::Rpc(e.to_string())
}

/// Slot skipped, purged or not yet available.
fn is_unavailable(err: &str) -> bool {
    err.contains("-32004")
        || err.contains("-32007")
        || err.contains("-32009")
        || err.contains("not available")
        || err.contains("was skipped")
}

/// Heads, block hashes, subscriptions and fee estimates over JSON-RPC.
pub struct RpcChain {
    client: Arc<RpcClient>,
    program_id: Pubkey,
}

impl RpcChain {
    pub fn new(client: Arc<RpcClient>, program_id: Pubkey) -> Self {
        Self { client, program_id }
    }

    async fn consumers(&self, subscription_id: u64) -> Result<Vec<Pubkey>, LedgerError> {
        let filters = vec![
            RpcFilterType::Memcmp(Memcmp::new_raw_bytes(
                0,
                discriminator("account", "ConsumerRegistration").to_vec(),
            )),
            RpcFilterType::Memcmp(Memcmp::new_raw_bytes(8, subscription_id.to_le_bytes().to_vec())),
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
        let accounts = self
            .client
            .get_program_ui_accounts_with_config(&self.program_id, config)
            .await
            .map_err(rpc_err)?;

        let mut consumers = Vec::with_capacity(accounts.len());
        for (pubkey, account) in accounts {
            match account.data.decode() {
                Some(data) if data.len() >= CONSUMER_MIN_LEN => {
                    if let Ok(consumer) = Pubkey::try_from(&data[16..48]) {
                        consumers.push(consumer);
                    }
                }
                _ => warn!(account = %pubkey, "Malformed consumer registration, skipping"),
            }
        }
        Ok(consumers)
    }
}

#[async_trait]
impl BlockSource for RpcChain {
    async fn latest_block(&self) -> Result<BlockNumber, LedgerError> {
        self.client
            .get_slot_with_commitment(CommitmentConfig::confirmed())
            .await
            .map_err(rpc_err)
    }

    /// Hash of the first produced block at or after `block`; skipped slots
    /// resolve forward the same way the coordinator resolves them.
    async fn blockhash(&self, block: BlockNumber) -> Result<[u8; 32], LedgerError> {
        let produced = self
            .client
            .get_blocks_with_limit(block, 1)
            .await
            .map_err(|e| {
                let msg = e.to_string();
                if is_unavailable(&msg) { LedgerError::NotAvailable } else { rpc_err(msg) }
            })?;
        let Some(&slot) = produced.first() else {
            return Err(LedgerError::NotAvailable);
        };

        let params = json!([slot, {
            "commitment": "confirmed",
            "transactionDetails": "none",
            "rewards": false,
            "maxSupportedTransactionVersion": 0,
        }]);
        let block_info: Value = self
            .client
            .send(RpcRequest::GetBlock, params)
            .await
            .map_err(|e| {
                let msg = e.to_string();
                if is_unavailable(&msg) { LedgerError::NotAvailable } else { rpc_err(msg) }
            })?;

        let encoded = block_info["blockhash"]
            .as_str()
            .ok_or_else(|| rpc_err(format!("block {slot} has no blockhash")))?;
        let mut hash = [0u8; 32];
        let len = bs58::decode(encoded)
            .onto(&mut hash)
            .map_err(|e| rpc_err(format!("bad blockhash {encoded}: {e}")))?;
        if len != 32 {
            return Err(rpc_err(format!("bad blockhash length {len}")));
        }
        Ok(hash)
    }
}

#[async_trait]
impl SubscriptionReader for RpcChain {
    async fn subscription(&self, id: u64) -> Result<Option<Subscription>, LedgerError> {
        let (pda, _) =
            Pubkey::find_program_address(&[b"subscription", &id.to_le_bytes()], &self.program_id);
        let account = self
            .client
            .get_account_with_commitment(&pda, CommitmentConfig::confirmed())
            .await
            .map_err(rpc_err)?
            .value;
        let Some(account) = account else {
            return Ok(None);
        };
        if account.data.len() < SUBSCRIPTION_MIN_LEN {
            return Err(rpc_err(format!("subscription {id} account too short")));
        }

        let data = &account.data;
        let read_u64 = |at: usize| u64::from_le_bytes(data[at..at + 8].try_into().unwrap_or([0; 8]));
        let owner = Pubkey::try_from(&data[16..48]).map_err(rpc_err)?;
        Ok(Some(Subscription {
            id: read_u64(8),
            owner,
            balance: read_u64(48),
            req_count: read_u64(56),
            consumers: self.consumers(id).await?,
        }))
    }
}

#[async_trait]
impl GasEstimator for RpcChain {
    /// Highest recent prioritization fee paid against the coordinator, in
    /// micro-lamports per compute unit.
    async fn gas_price(&self) -> Result<u64, LedgerError> {
        let fees = self
            .client
            .get_recent_prioritization_fees(&[self.program_id])
            .await
            .map_err(rpc_err)?;
        Ok(fees.iter().map(|f| f.prioritization_fee).max().unwrap_or(0))
    }
}

/// Signs and submits one lane's fulfillments.
///
/// The broadcaster keeps only its nonce counter. The blockhash a nonce is
/// bound to travels as the attempt's lease, so a restarted process can still
/// re-sign within the same slot and tell whether it is still open.
pub struct RpcBroadcaster {
    client: Arc<RpcClient>,
    program_id: Pubkey,
    payer: Arc<Keypair>,
    next_nonce: AtomicU64,
}

impl RpcBroadcaster {
    /// `first_nonce` must be above every nonce recovered for this lane.
    pub fn new(client: Arc<RpcClient>, program_id: Pubkey, payer: Arc<Keypair>, first_nonce: u64) -> Self {
        Self {
            client,
            program_id,
            payer,
            next_nonce: AtomicU64::new(first_nonce),
        }
    }

    /// Whether the blockhash in `lease` can still land a transaction.
    async fn lease_valid(&self, lease: Option<&str>) -> Result<Option<Hash>, LedgerError> {
        let Some(hash) = lease.and_then(parse_lease) else {
            return Ok(None);
        };
        let valid = self
            .client
            .is_blockhash_valid(&hash, CommitmentConfig::processed())
            .await
            .map_err(rpc_err)?;
        Ok(valid.then_some(hash))
    }

    async fn blockhash_for(&self, lease: Option<&str>) -> Result<Hash, LedgerError> {
        if let Some(hash) = self.lease_valid(lease).await? {
            return Ok(hash);
        }
        self.client.get_latest_blockhash().await.map_err(rpc_err)
    }

    fn instructions(&self, tx: &TxRequest) -> Vec<Instruction> {
        let calls = tx.payload.calls();
        let mut instructions = Vec::with_capacity(2 + 2 * calls.len());
        let units = tx.gas_limit.min(MAX_COMPUTE_UNITS) as u32;
        instructions.push(build_set_compute_unit_limit_instruction(units));
        instructions.push(build_set_compute_unit_price_instruction(tx.gas_price));
        for call in calls {
            let verify_index = instructions.len() as u8;
            instructions.push(build_ed25519_instruction(call));
            instructions.push(build_fulfill_instruction(
                &self.program_id,
                &self.payer.pubkey(),
                call,
                verify_index,
            ));
        }
        instructions
    }

    async fn fulfilled_events(&self, signature: &Signature) -> Result<Option<Vec<(RequestId, bool)>>, LedgerError> {
        let params = json!([signature.to_string(), {
            "commitment": "confirmed",
            "encoding": "json",
            "maxSupportedTransactionVersion": 0,
        }]);
        let tx: Value = self
            .client
            .send(RpcRequest::GetTransaction, params)
            .await
            .map_err(rpc_err)?;
        if tx.is_null() {
            return Ok(None);
        }
        let logs: Vec<String> = tx["meta"]["logMessages"]
            .as_array()
            .map(|lines| {
                lines
                    .iter()
                    .filter_map(|l| l.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default();
        Ok(Some(decode_fulfilled_events(&logs)))
    }
}

fn parse_lease(lease: &str) -> Option<Hash> {
    Hash::from_str(lease).ok()
}

#[async_trait]
impl Broadcaster for RpcBroadcaster {
    #[instrument(skip_all, fields(nonce = ?tx.nonce, gas_price = tx.gas_price))]
    async fn send(&self, tx: &TxRequest) -> Result<SentTx, LedgerError> {
        let nonce = tx
            .nonce
            .unwrap_or_else(|| self.next_nonce.fetch_add(1, Ordering::Relaxed));
        let blockhash = self.blockhash_for(tx.lease.as_deref()).await?;

        let transaction = Transaction::new_signed_with_payer(
            &self.instructions(tx),
            Some(&self.payer.pubkey()),
            &[self.payer.as_ref()],
            blockhash,
        );
        let config = RpcSendTransactionConfig {
            skip_preflight: true,
            preflight_commitment: Some(CommitmentConfig::confirmed().commitment),
            ..Default::default()
        };
        let signature = self
            .client
            .send_transaction_with_config(&transaction, config)
            .await
            .map_err(rpc_err)?;

        let hash = TxHash(signature.to_string());
        debug!(tx = %hash, %blockhash, "Transaction submitted");
        Ok(SentTx {
            hash,
            nonce,
            lease: Some(blockhash.to_string()),
        })
    }

    async fn status(
        &self,
        hash: &TxHash,
        requests: &[RequestId],
        lease: Option<&str>,
    ) -> Result<TxStatus, LedgerError> {
        let signature = Signature::from_str(&hash.0).map_err(rpc_err)?;
        let statuses = self
            .client
            .get_signature_statuses(&[signature])
            .await
            .map_err(rpc_err)?
            .value;

        let Some(Some(status)) = statuses.into_iter().next() else {
            // Unknown: it can still land while its blockhash is valid.
            let alive = self.lease_valid(lease).await?.is_some();
            return Ok(if alive { TxStatus::Pending } else { TxStatus::Dropped });
        };
        if !status.satisfies_commitment(CommitmentConfig::confirmed()) {
            return Ok(TxStatus::Pending);
        }

        let events = if status.err.is_some() {
            warn!(tx = %hash, err = ?status.err, "Fulfillment transaction failed on chain");
            Vec::new()
        } else {
            match self.fulfilled_events(&signature).await? {
                Some(events) => events,
                // Not indexed yet; ask again next head.
                None => return Ok(TxStatus::Pending),
            }
        };

        Ok(TxStatus::Confirmed {
            block: status.slot,
            results: callback_results(requests, &events),
        })
    }

    async fn can_rebroadcast(&self, _nonce: u64, lease: Option<&str>) -> Result<bool, LedgerError> {
        Ok(self.lease_valid(lease).await?.is_some())
    }
}

/// `RandomWordsFulfilled` events from a transaction's log lines.
fn decode_fulfilled_events(logs: &[String]) -> Vec<(RequestId, bool)> {
    let disc = discriminator("event", "RandomWordsFulfilled");
    logs.iter()
        .filter_map(|line| line.strip_prefix("Program data: "))
        .filter_map(|data| base64::engine::general_purpose::STANDARD.decode(data.trim()).ok())
        .filter(|d| d.len() >= 8 + FULFILLED_EVENT_LEN && d[..8] == disc)
        .filter_map(|d| {
            let id: [u8; 32] = d[8..40].try_into().ok()?;
            Some((RequestId(id), d[40] != 0))
        })
        .collect()
}

/// Requests without a fulfillment event were skipped by the coordinator.
fn callback_results(
    request_ids: &[RequestId],
    events: &[(RequestId, bool)],
) -> Vec<(RequestId, CallbackResult)> {
    request_ids
        .iter()
        .map(|id| {
            let result = match events.iter().find(|(e, _)| e == id) {
                Some((_, true)) => CallbackResult::Success,
                Some((_, false)) => CallbackResult::Reverted,
                None => CallbackResult::NotFulfilled,
            };
            (*id, result)
        })
        .collect()
}

/// Native Ed25519 signature-verify instruction over the proof.
fn build_ed25519_instruction(call: &FulfillmentCall) -> Instruction {
    use solana_sdk::ed25519_program;

    let message = call.signed_message();

    const DATA_START: usize = 2 + 7 * 2; // 16
    let public_key_offset: u16 = DATA_START as u16;
    let signature_offset: u16 = (DATA_START + 32) as u16;
    let message_data_offset: u16 = (DATA_START + 32 + 64) as u16;
    let message_data_size: u16 = message.len() as u16;

    let mut data = Vec::with_capacity(DATA_START + 32 + 64 + message.len());
    data.push(1u8); // num_signatures
    data.push(0u8); // padding

    // Offsets into this instruction's own data (index u16::MAX).
    data.extend_from_slice(&signature_offset.to_le_bytes());
    data.extend_from_slice(&u16::MAX.to_le_bytes());
    data.extend_from_slice(&public_key_offset.to_le_bytes());
    data.extend_from_slice(&u16::MAX.to_le_bytes());
    data.extend_from_slice(&message_data_offset.to_le_bytes());
    data.extend_from_slice(&message_data_size.to_le_bytes());
    data.extend_from_slice(&u16::MAX.to_le_bytes());

    data.extend_from_slice(&call.proof.public_key.to_bytes());
    data.extend_from_slice(call.proof.signature.as_ref());
    data.extend_from_slice(&message);

    Instruction {
        program_id: ed25519_program::id(),
        accounts: vec![],
        data,
    }
}

fn build_set_compute_unit_limit_instruction(units: u32) -> Instruction {
    let mut data = Vec::with_capacity(5);
    data.push(2u8);
    data.extend_from_slice(&units.to_le_bytes());
    Instruction {
        program_id: COMPUTE_BUDGET_ID,
        accounts: vec![],
        data,
    }
}

fn build_set_compute_unit_price_instruction(micro_lamports: u64) -> Instruction {
    let mut data = Vec::with_capacity(9);
    data.push(3u8);
    data.extend_from_slice(&micro_lamports.to_le_bytes());
    Instruction {
        program_id: COMPUTE_BUDGET_ID,
        accounts: vec![],
        data,
    }
}

/// `fulfill_random_words(request_id, seed, output, verify_ix_index)`.
fn build_fulfill_instruction(
    program_id: &Pubkey,
    authority: &Pubkey,
    call: &FulfillmentCall,
    verify_index: u8,
) -> Instruction {
    let request = &call.request;
    let (config_pda, _) = Pubkey::find_program_address(&[b"coordinator-config"], program_id);
    let (request_pda, _) =
        Pubkey::find_program_address(&[b"request", &request.request_id.0], program_id);
    let (subscription_pda, _) = Pubkey::find_program_address(
        &[b"subscription", &request.subscription_id.to_le_bytes()],
        program_id,
    );

    let mut data = Vec::with_capacity(8 + 32 + 32 + 32 + 1);
    data.extend_from_slice(&discriminator("global", "fulfill_random_words"));
    data.extend_from_slice(&request.request_id.0);
    data.extend_from_slice(&call.proof.seed);
    data.extend_from_slice(&call.proof.output);
    data.push(verify_index);

    Instruction {
        program_id: *program_id,
        accounts: vec![
            AccountMeta::new(*authority, true),
            AccountMeta::new_readonly(config_pda, false),
            AccountMeta::new(request_pda, false),
            AccountMeta::new(subscription_pda, false),
            AccountMeta::new_readonly(request.sender, false),
            AccountMeta::new_readonly(sysvar::instructions::ID, false),
        ],
        data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proof::ProofBuilder;
    use crate::testing::sample_request;

    fn fulfilled_line(id: &RequestId, success: bool) -> String {
        let mut data = discriminator("event", "RandomWordsFulfilled").to_vec();
        data.extend_from_slice(&id.0);
        data.push(u8::from(success));
        format!(
            "Program data: {}",
            base64::engine::general_purpose::STANDARD.encode(data)
        )
    }

    #[test]
    fn batch_results_are_per_request() {
        let a = RequestId([1; 32]);
        let b = RequestId([2; 32]);
        let c = RequestId([3; 32]);
        let logs = vec![
            "Program log: Instruction: FulfillRandomWords".to_string(),
            fulfilled_line(&a, true),
            fulfilled_line(&b, false),
        ];

        let results = callback_results(&[a, b, c], &decode_fulfilled_events(&logs));
        assert_eq!(
            results,
            vec![
                (a, CallbackResult::Success),
                (b, CallbackResult::Reverted),
                (c, CallbackResult::NotFulfilled),
            ]
        );
    }

    #[test]
    fn ed25519_instruction_embeds_proof() {
        let builder = ProofBuilder::new(Arc::new(Keypair::new()), Arc::new(b"s".to_vec()));
        let request = sample_request(builder.key_hash(), 1, 100_000, 10);
        let call = builder.build_with_hash(&request, &[9; 32]);

        let ix = build_ed25519_instruction(&call);
        assert_eq!(ix.data[0], 1);
        assert_eq!(&ix.data[16..48], call.proof.public_key.as_ref());
        assert_eq!(&ix.data[48..112], call.proof.signature.as_ref());
        assert_eq!(&ix.data[112..], call.signed_message().as_slice());
    }

    #[test]
    fn compute_budget_instructions() {
        let limit = build_set_compute_unit_limit_instruction(250_000);
        assert_eq!(limit.data[0], 2);
        assert_eq!(u32::from_le_bytes(limit.data[1..5].try_into().unwrap()), 250_000);
        let price = build_set_compute_unit_price_instruction(7);
        assert_eq!(price.data, [3, 7, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(price.program_id, COMPUTE_BUDGET_ID);
    }

    #[test]
    fn leases_round_trip_blockhashes() {
        let hash = Hash::new_from_array([5; 32]);
        assert_eq!(parse_lease(&hash.to_string()), Some(hash));
        assert_eq!(parse_lease("lane-lease-0"), None);
    }

    #[test]
    fn failed_transaction_reports_every_request_unfulfilled() {
        let ids = [RequestId([1; 32]), RequestId([2; 32])];
        let results = callback_results(&ids, &[]);
        assert!(results.iter().all(|(_, r)| *r == CallbackResult::NotFulfilled));
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn unavailable_errors_are_recognised() {
        assert!(is_unavailable("RPC response error -32007: Slot 5 was skipped"));
        assert!(!is_unavailable("connection refused"));
    }
}
