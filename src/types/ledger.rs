//! Ledger metadata as delivered by the ledger backend and persisted by the store.
//!
//! Everything here is borsh encoded. A ledger's transaction results carry their
//! contract events inside an opaque `result_meta` blob; decoding that blob is
//! the step that can reject malformed metadata.

use crate::utils::error::{Result, RpcCoreError};
use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// A 32-byte hash rendered as lowercase hex.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Default,
    BorshSerialize,
    BorshDeserialize,
    Serialize,
    Deserialize,
)]
pub struct Hash32(pub [u8; 32]);

impl fmt::Display for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for Hash32 {
    type Err = RpcCoreError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| RpcCoreError::Decode(format!("invalid hash '{s}': {e}")))?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| RpcCoreError::Decode(format!("hash '{s}' is not 32 bytes")))?;
        Ok(Self(array))
    }
}

/// Identifier of the contract that emitted an event.
pub type ContractId = Hash32;

/// Identifier of a transaction (see [`transaction_hash`]).
pub type TransactionHash = Hash32;

/// Kind of a contract event.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Contract,
    System,
    Diagnostic,
}

/// An event emitted while applying a transaction.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ContractEvent {
    pub event_type: EventType,
    /// `None` for host-level system events.
    pub contract_id: Option<ContractId>,
    pub topics: Vec<Vec<u8>>,
    pub data: Vec<u8>,
}

/// Decoded form of [`RawTransaction::result_meta`].
#[derive(Debug, Clone, PartialEq, Eq, Default, BorshSerialize, BorshDeserialize)]
pub struct TransactionMeta {
    pub successful: bool,
    pub events: Vec<ContractEvent>,
}

impl TransactionMeta {
    /// Encodes the meta into the blob stored in [`RawTransaction::result_meta`].
    pub fn encode(&self) -> Result<Vec<u8>> {
        borsh::to_vec(self).map_err(RpcCoreError::from)
    }

    /// Decodes a `result_meta` blob.
    ///
    /// # Errors
    ///
    /// Returns `RpcCoreError::Decode` when the blob is malformed or has
    /// trailing bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        borsh::from_slice(bytes).map_err(RpcCoreError::from)
    }
}

/// A transaction as applied in a ledger, with its opaque envelope and result.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct RawTransaction {
    pub envelope: Vec<u8>,
    pub result: Vec<u8>,
    pub result_meta: Vec<u8>,
}

impl RawTransaction {
    /// Builds a transaction whose `result_meta` is the encoding of `meta`.
    pub fn with_meta(envelope: Vec<u8>, result: Vec<u8>, meta: &TransactionMeta) -> Result<Self> {
        Ok(Self {
            envelope,
            result,
            result_meta: meta.encode()?,
        })
    }
}

/// A change to the ledger-entry state applied when the ledger closed.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum LedgerEntryChange {
    Upsert { key: Vec<u8>, value: Vec<u8> },
    Remove { key: Vec<u8> },
}

impl LedgerEntryChange {
    pub fn key(&self) -> &[u8] {
        match self {
            LedgerEntryChange::Upsert { key, .. } | LedgerEntryChange::Remove { key } => key,
        }
    }
}

/// Everything the backend reports about one closed ledger.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct LedgerCloseMeta {
    pub sequence: u32,
    pub hash: Hash32,
    pub previous_hash: Hash32,
    /// Unix timestamp, seconds.
    pub close_time: i64,
    pub protocol_version: u32,
    /// In application order.
    pub transactions: Vec<RawTransaction>,
    pub entry_changes: Vec<LedgerEntryChange>,
}

impl LedgerCloseMeta {
    pub fn encode(&self) -> Result<Vec<u8>> {
        borsh::to_vec(self).map_err(RpcCoreError::from)
    }

    /// Decodes a persisted ledger blob.
    ///
    /// # Errors
    ///
    /// Returns `RpcCoreError::Decode` when the blob is malformed.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        borsh::from_slice(bytes).map_err(RpcCoreError::from)
    }
}

/// Hash of the network passphrase, the prefix of every transaction hash.
#[must_use]
pub fn network_id(passphrase: &str) -> Hash32 {
    Hash32(Sha256::digest(passphrase.as_bytes()).into())
}

/// Hash identifying a transaction envelope on a given network.
#[must_use]
pub fn transaction_hash(network_id: &Hash32, envelope: &[u8]) -> TransactionHash {
    let mut hasher = Sha256::new();
    hasher.update(network_id.0);
    hasher.update(envelope);
    Hash32(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_hex_round_trip() -> Result<()> {
        let hash = transaction_hash(&network_id("testnet"), b"envelope");
        let parsed: Hash32 = hash.to_string().parse()?;
        assert_eq!(parsed, hash);
        Ok(())
    }

    #[test]
    fn test_hash_rejects_short_input() {
        assert!("abcd".parse::<Hash32>().is_err());
        assert!("not-hex".parse::<Hash32>().is_err());
    }

    #[test]
    fn test_transaction_hash_depends_on_network() {
        let a = transaction_hash(&network_id("public"), b"same");
        let b = transaction_hash(&network_id("testnet"), b"same");
        assert_ne!(a, b);
    }

    #[test]
    fn test_truncated_meta_is_decode_error() -> Result<()> {
        let meta = TransactionMeta {
            successful: true,
            events: vec![ContractEvent {
                event_type: EventType::Contract,
                contract_id: Some(Hash32([7; 32])),
                topics: vec![b"transfer".to_vec()],
                data: vec![1, 2, 3],
            }],
        };
        let bytes = meta.encode()?;
        let result = TransactionMeta::decode(&bytes[..bytes.len() - 2]);
        assert!(matches!(result, Err(RpcCoreError::Decode(_))));
        Ok(())
    }
}
