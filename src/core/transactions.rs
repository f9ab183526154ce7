//! Transaction index: applied transactions of the most recent ledgers.

use crate::config::{DEFAULT_TRANSACTION_RETENTION_WINDOW, RpcCoreConfig};
use crate::core::window::{LedgerBucket, RetentionWindow, WindowRange, window_capacity};
use crate::types::{Hash32, LedgerCloseMeta, TransactionHash, TransactionMeta, network_id, transaction_hash};
use crate::utils::error::{Result, RpcCoreError};

/// One applied transaction with its raw envelope, result and meta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecord {
    pub ledger_sequence: u32,
    pub hash: TransactionHash,
    pub envelope: Vec<u8>,
    pub result: Vec<u8>,
    pub result_meta: Vec<u8>,
    /// 1-based position in the ledger.
    pub application_order: u32,
    /// Unix timestamp, seconds.
    pub ledger_close_time: i64,
    pub successful: bool,
}

/// Result of [`TransactionIndex::get_transaction`].
///
/// The window bounds are reported whether or not the transaction was found,
/// so callers can tell "not yet ingested" from "already evicted".
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransactionLookup {
    pub record: Option<TransactionRecord>,
    pub latest_ledger: Option<u32>,
    pub latest_ledger_close_time: Option<i64>,
    pub oldest_ledger: Option<u32>,
    pub oldest_ledger_close_time: Option<i64>,
}

/// Windowed index of applied transactions.
pub struct TransactionIndex {
    network_id: Hash32,
    window: RetentionWindow<Vec<TransactionRecord>>,
}

impl TransactionIndex {
    /// Creates an index retaining `retention_window` ledgers (`0` selects
    /// the default window).
    pub fn new(network_passphrase: &str, retention_window: u32) -> Self {
        Self {
            network_id: network_id(network_passphrase),
            window: RetentionWindow::new(window_capacity(
                retention_window,
                DEFAULT_TRANSACTION_RETENTION_WINDOW,
            )),
        }
    }

    pub fn from_config(config: &RpcCoreConfig) -> Self {
        Self::new(&config.network_passphrase, config.transaction_retention_window)
    }

    /// Builds the bucket for `meta` without touching the window.
    ///
    /// # Errors
    ///
    /// Returns `RpcCoreError::Decode` if any result meta is malformed.
    pub fn prepare(&self, meta: &LedgerCloseMeta) -> Result<LedgerBucket<Vec<TransactionRecord>>> {
        let records = meta
            .transactions
            .iter()
            .enumerate()
            .map(|(index, tx)| {
                let decoded = TransactionMeta::decode(&tx.result_meta)?;
                let application_order = u32::try_from(index + 1).map_err(|_| {
                    RpcCoreError::Decode(format!("ledger {} has too many transactions", meta.sequence))
                })?;
                Ok(TransactionRecord {
                    ledger_sequence: meta.sequence,
                    hash: transaction_hash(&self.network_id, &tx.envelope),
                    envelope: tx.envelope.clone(),
                    result: tx.result.clone(),
                    result_meta: tx.result_meta.clone(),
                    application_order,
                    ledger_close_time: meta.close_time,
                    successful: decoded.successful,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(LedgerBucket::new(meta.sequence, meta.close_time, records))
    }

    /// Appends a bucket built by [`TransactionIndex::prepare`].
    pub fn append(&self, bucket: LedgerBucket<Vec<TransactionRecord>>) -> Result<()> {
        self.window.append(bucket)
    }

    /// Decodes and appends one ledger; nothing is appended if decoding fails.
    pub fn ingest_ledger(&self, meta: &LedgerCloseMeta) -> Result<()> {
        let bucket = self.prepare(meta)?;
        self.append(bucket)
    }

    /// Looks a transaction up by hash, newest ledger first.
    pub fn get_transaction(&self, hash: &TransactionHash) -> TransactionLookup {
        let snapshot = self.window.snapshot();
        let mut buckets = snapshot.iter();
        let oldest = buckets.next();
        let latest = buckets.next_back().or(oldest);

        let record = snapshot
            .iter()
            .rev()
            .find_map(|bucket| bucket.content.iter().find(|tx| &tx.hash == hash))
            .cloned();

        TransactionLookup {
            record,
            latest_ledger: latest.map(|b| b.sequence),
            latest_ledger_close_time: latest.map(|b| b.close_time),
            oldest_ledger: oldest.map(|b| b.sequence),
            oldest_ledger_close_time: oldest.map(|b| b.close_time),
        }
    }

    /// Sequence and close time of the newest retained ledger.
    pub fn latest_ledger(&self) -> Option<(u32, i64)> {
        self.window
            .snapshot()
            .iter()
            .next_back()
            .map(|b| (b.sequence, b.close_time))
    }

    pub fn range(&self, start: u32, end: u32) -> WindowRange<Vec<TransactionRecord>> {
        self.window.range(start, end)
    }

    pub fn snapshot(&self) -> WindowRange<Vec<TransactionRecord>> {
        self.window.snapshot()
    }

    pub fn first_sequence(&self) -> Option<u32> {
        self.window.first_sequence()
    }

    pub fn latest_sequence(&self) -> Option<u32> {
        self.window.last_sequence()
    }

    pub fn retention_window(&self) -> u32 {
        self.window.capacity()
    }
}
