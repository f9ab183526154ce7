//! Durable ledger storage.
//!
//! The store is the system of record: every ingested ledger is written here
//! before either index sees it, and the indices are rebuilt from it on
//! startup. Ledger-entry state for simulation is read through
//! [`LedgerSnapshot`] handles pinned at one ledger sequence.

mod sqlite;

pub use sqlite::SqliteStore;

use crate::types::{Hash32, LedgerCloseMeta};
use crate::utils::error::Result;
use async_trait::async_trait;

/// Identity of the newest persisted ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatestLedger {
    pub sequence: u32,
    pub hash: Hash32,
    pub protocol_version: u32,
    /// Unix timestamp, seconds.
    pub close_time: i64,
}

impl From<&LedgerCloseMeta> for LatestLedger {
    fn from(meta: &LedgerCloseMeta) -> Self {
        Self {
            sequence: meta.sequence,
            hash: meta.hash,
            protocol_version: meta.protocol_version,
            close_time: meta.close_time,
        }
    }
}

/// Abstract interface for the durable store.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Opens a write transaction. Dropping it without `commit` rolls back.
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>>;

    /// Highest ledger sequence committed so far, `None` for an empty store.
    async fn highest_persisted_sequence(&self) -> Result<Option<u32>>;

    /// Persisted ledgers with `start <= sequence <= end`, oldest first.
    async fn ledgers_in_range(&self, start: u32, end: u32) -> Result<Vec<LedgerCloseMeta>>;

    async fn get_ledger(&self, sequence: u32) -> Result<Option<LedgerCloseMeta>>;

    /// Newest committed ledger, read consistently with the stored cursor.
    async fn latest_ledger(&self) -> Result<Option<LatestLedger>>;

    /// Read handle over ledger-entry state at the latest committed ledger.
    async fn open_snapshot(&self) -> Result<Box<dyn LedgerSnapshot>>;
}

/// One atomic group of ledger writes.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Stores the ledger and applies its ledger-entry changes.
    async fn write_ledger(&mut self, meta: &LedgerCloseMeta) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Point-in-time view of ledger-entry state.
///
/// Every read through one handle observes the state as of [`sequence`],
/// regardless of ledgers committed after the handle was opened.
///
/// [`sequence`]: LedgerSnapshot::sequence
#[async_trait]
pub trait LedgerSnapshot: Send {
    /// Ledger the snapshot is pinned at, `None` if nothing was ingested yet.
    fn sequence(&self) -> Option<u32>;

    async fn get_entry(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Entries for `keys`, in the same order.
    async fn get_entries(&mut self, keys: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>> {
        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            entries.push(self.get_entry(key).await?);
        }
        Ok(entries)
    }
}
