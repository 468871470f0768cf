//! Core data model shared by every pipeline stage.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use solana_sdk::pubkey::Pubkey;
use std::fmt;
use std::str::FromStr;

/// Ledger block height (a slot on Solana).
pub type BlockNumber = u64;

/// Fixed 32-byte identifier rendered as lowercase hex.
macro_rules! hex_id {
    ($name:ident) => {
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub [u8; 32]);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl FromStr for $name {
            type Err = hex::FromHexError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let mut out = [0u8; 32];
                hex::decode_to_slice(s.trim_start_matches("0x"), &mut out)?;
                Ok(Self(out))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

hex_id!(RequestId);
hex_id!(KeyHash);

impl RequestId {
    /// `requestID = SHA-256(keyHash || preSeed)`.
    pub fn derive(key_hash: &KeyHash, pre_seed: &[u8; 32]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(key_hash.0);
        hasher.update(pre_seed);
        Self(hasher.finalize().into())
    }
}

impl KeyHash {
    /// Hash of a verification public key; the identity a lane is registered under.
    pub fn of(public_key: &Pubkey) -> Self {
        Self(Sha256::digest(public_key.to_bytes()).into())
    }
}

/// A randomness request as observed on the ledger. Never mutated after decoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RandomnessRequest {
    pub request_id: RequestId,
    pub subscription_id: u64,
    pub key_hash: KeyHash,
    pub num_words: u32,
    pub callback_gas_limit: u32,
    pub min_confirmations: u16,
    pub block_number: BlockNumber,
    #[serde(with = "hex_bytes")]
    pub pre_seed: [u8; 32],
    #[serde(with = "pubkey_str")]
    pub sender: Pubkey,
}

impl RandomnessRequest {
    /// First block at which the request has enough confirmations to be served.
    pub fn ready_at(&self) -> BlockNumber {
        self.block_number
            .saturating_add(u64::from(self.min_confirmations))
    }
}

/// Point-in-time view of a subscription. Owned by the ledger, never cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: u64,
    /// Balance in the fee currency's smallest unit.
    pub balance: u64,
    pub owner: Pubkey,
    pub consumers: Vec<Pubkey>,
    /// Lifetime number of requests made through the subscription.
    pub req_count: u64,
}

impl Subscription {
    pub fn has_consumer(&self, consumer: &Pubkey) -> bool {
        self.consumers.iter().any(|c| c == consumer)
    }
}

/// Transaction identity as reported by the broadcaster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxHash(pub String);

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Terminal outcome of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Fulfilled,
    ConsumerReverted,
    Unfulfillable,
    Failed,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Outcome::Fulfilled => "fulfilled",
            Outcome::ConsumerReverted => "consumer_reverted",
            Outcome::Unfulfillable => "unfulfillable",
            Outcome::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Emitted once per request when it reaches a terminal outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutcomeEvent {
    pub request_id: RequestId,
    pub outcome: Outcome,
    pub tx_hash: Option<TxHash>,
    pub reason: Option<String>,
}

pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(deserializer)?;
        let mut out = [0u8; 32];
        hex::decode_to_slice(&s, &mut out).map_err(serde::de::Error::custom)?;
        Ok(out)
    }
}

pub(crate) mod pubkey_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use solana_sdk::pubkey::Pubkey;
    use std::str::FromStr;

    pub fn serialize<S: Serializer>(key: &Pubkey, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(key)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Pubkey, D::Error> {
        let s = String::deserialize(deserializer)?;
        Pubkey::from_str(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_binds_key_and_seed() {
        let key = KeyHash([1u8; 32]);
        let a = RequestId::derive(&key, &[2u8; 32]);
        let b = RequestId::derive(&key, &[3u8; 32]);
        let c = RequestId::derive(&KeyHash([9u8; 32]), &[2u8; 32]);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, RequestId::derive(&key, &[2u8; 32]));
    }

    #[test]
    fn ids_round_trip_through_hex() {
        let id = RequestId([0xab; 32]);
        let parsed: RequestId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(32)));
    }

    #[test]
    fn ready_at_adds_confirmations() {
        let req = RandomnessRequest {
            request_id: RequestId([0; 32]),
            subscription_id: 1,
            key_hash: KeyHash([0; 32]),
            num_words: 1,
            callback_gas_limit: 100_000,
            min_confirmations: 3,
            block_number: 10,
            pre_seed: [0; 32],
            sender: Pubkey::new_unique(),
        };
        assert_eq!(req.ready_at(), 13);
    }
}
