//! Proof and response construction.
//!
//! The VRF output is an HMAC-SHA256 keyed by the oracle's secret over the
//! proof seed, where the seed mixes the request's pre-seed with the hash of
//! the block at which the request became confirmable:
//!
//! ```text
//! seed   = SHA-256(pre_seed || block_hash)
//! output = HMAC-SHA256(secret, seed)
//! ```
//!
//! The response commitment binds the subscription, callback gas limit, word
//! count and sender. The lane's verification key signs
//! `commitment_digest || seed || output` with Ed25519, so the coordinator
//! rejects a proof replayed against any other request parameters.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signature, Signer};
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::error::{FulfillmentError, LedgerError};
use crate::ledger::BlockSource;
use crate::types::{BlockNumber, KeyHash, RandomnessRequest, RequestId};

type HmacSha256 = Hmac<Sha256>;

/// `SHA-256(pre_seed || block_hash)`.
pub fn proof_seed(pre_seed: &[u8; 32], block_hash: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(pre_seed);
    hasher.update(block_hash);
    hasher.finalize().into()
}

/// Compute the 32-byte VRF output for a proof seed.
pub fn compute_randomness(hmac_secret: &[u8], seed: &[u8; 32]) -> [u8; 32] {
    let mut mac =
        HmacSha256::new_from_slice(hmac_secret).expect("HMAC accepts keys of any size");
    mac.update(seed);
    mac.finalize().into_bytes().into()
}

/// Request parameters the coordinator checks the fulfillment against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseCommitment {
    pub request_id: RequestId,
    pub subscription_id: u64,
    pub callback_gas_limit: u32,
    pub num_words: u32,
    pub sender: Pubkey,
    pub block_number: BlockNumber,
}

impl ResponseCommitment {
    pub fn from_request(request: &RandomnessRequest) -> Self {
        Self {
            request_id: request.request_id,
            subscription_id: request.subscription_id,
            callback_gas_limit: request.callback_gas_limit,
            num_words: request.num_words,
            sender: request.sender,
            block_number: request.block_number,
        }
    }

    /// Layout: `request_id (32) || sub_id (8 LE) || gas (4 LE) || words (4 LE) || sender (32) || block (8 LE)`.
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.request_id.0);
        hasher.update(self.subscription_id.to_le_bytes());
        hasher.update(self.callback_gas_limit.to_le_bytes());
        hasher.update(self.num_words.to_le_bytes());
        hasher.update(self.sender.to_bytes());
        hasher.update(self.block_number.to_le_bytes());
        hasher.finalize().into()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VrfProof {
    pub public_key: Pubkey,
    pub seed: [u8; 32],
    pub output: [u8; 32],
    pub signature: Signature,
}

/// Everything needed to fulfill one request on chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FulfillmentCall {
    pub request: RandomnessRequest,
    pub commitment: ResponseCommitment,
    pub proof: VrfProof,
}

impl FulfillmentCall {
    /// Bytes covered by the proof signature.
    pub fn signed_message(&self) -> Vec<u8> {
        signed_message(&self.commitment, &self.proof.seed, &self.proof.output)
    }

    /// Check the proof the way the coordinator does: right key, right
    /// commitment, valid signature.
    pub fn verify(&self, expected_key: &Pubkey) -> bool {
        self.proof.public_key == *expected_key
            && self.commitment == ResponseCommitment::from_request(&self.request)
            && self
                .proof
                .signature
                .verify(expected_key.as_ref(), &self.signed_message())
    }
}

fn signed_message(commitment: &ResponseCommitment, seed: &[u8; 32], output: &[u8; 32]) -> Vec<u8> {
    let mut message = Vec::with_capacity(96);
    message.extend_from_slice(&commitment.digest());
    message.extend_from_slice(seed);
    message.extend_from_slice(output);
    message
}

/// Builds proofs with one lane's verification key.
#[derive(Clone)]
pub struct ProofBuilder {
    keypair: Arc<Keypair>,
    key_hash: KeyHash,
    hmac_secret: Arc<Vec<u8>>,
}

impl ProofBuilder {
    pub fn new(keypair: Arc<Keypair>, hmac_secret: Arc<Vec<u8>>) -> Self {
        let key_hash = KeyHash::of(&keypair.pubkey());
        Self {
            keypair,
            key_hash,
            hmac_secret,
        }
    }

    pub fn key_hash(&self) -> KeyHash {
        self.key_hash
    }

    pub fn public_key(&self) -> Pubkey {
        self.keypair.pubkey()
    }

    /// Fetch the block hash at `ready_at()` and build the call.
    ///
    /// An evicted hash yields [`FulfillmentError::MissingBlockhash`]; retrying
    /// cannot succeed until the hash is stored by other means.
    #[instrument(skip_all, fields(request_id = %request.request_id))]
    pub async fn build(
        &self,
        request: &RandomnessRequest,
        blocks: &dyn BlockSource,
    ) -> Result<FulfillmentCall, FulfillmentError> {
        let block = request.ready_at();
        let block_hash = match blocks.blockhash(block).await {
            Ok(hash) => hash,
            Err(LedgerError::NotAvailable) => {
                return Err(FulfillmentError::MissingBlockhash { block });
            }
            Err(e) => return Err(e.into()),
        };
        debug!(block, "Building proof");
        Ok(self.build_with_hash(request, &block_hash))
    }

    pub fn build_with_hash(&self, request: &RandomnessRequest, block_hash: &[u8; 32]) -> FulfillmentCall {
        let seed = proof_seed(&request.pre_seed, block_hash);
        let output = compute_randomness(&self.hmac_secret, &seed);
        let commitment = ResponseCommitment::from_request(request);
        let signature = self
            .keypair
            .sign_message(&signed_message(&commitment, &seed, &output));

        FulfillmentCall {
            request: request.clone(),
            commitment,
            proof: VrfProof {
                public_key: self.keypair.pubkey(),
                seed,
                output,
                signature,
            },
        }
    }
}
