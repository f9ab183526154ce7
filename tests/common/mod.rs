#![allow(dead_code)]

use async_trait::async_trait;
use ledger_rpc_core::{
    ContractEvent, DurableStore, EventType, Hash32, InMemoryBackend, LatestLedger, LedgerBackend,
    LedgerCloseMeta, LedgerEntryChange, LedgerFeed, LedgerSnapshot, RawTransaction, Result,
    RetryConfig, RpcCoreConfig, RpcCoreConfigBuilder, RpcCoreError, SqliteStore,
    StoreTransaction, TransactionMeta,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

pub const PASSPHRASE: &str = "Test SDF Network ; September 2015";

pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

pub fn contract_event(contract: u8, topic: &str) -> ContractEvent {
    ContractEvent {
        event_type: EventType::Contract,
        contract_id: Some(Hash32([contract; 32])),
        topics: vec![topic.as_bytes().to_vec()],
        data: vec![contract],
    }
}

/// One ledger with one successful transaction carrying `events`, and the
/// entries `k1` and `k2` both set to the ledger sequence.
pub fn ledger(sequence: u32, events: Vec<ContractEvent>) -> LedgerCloseMeta {
    let value = sequence.to_string().into_bytes();
    let tx = RawTransaction::with_meta(
        format!("envelope-{sequence}").into_bytes(),
        b"success".to_vec(),
        &TransactionMeta {
            successful: true,
            events,
        },
    )
    .expect("encode meta");
    LedgerCloseMeta {
        sequence,
        hash: Hash32([(sequence % 251) as u8; 32]),
        previous_hash: Hash32([(sequence.wrapping_sub(1) % 251) as u8; 32]),
        close_time: now(),
        protocol_version: 21,
        transactions: vec![tx],
        entry_changes: vec![
            LedgerEntryChange::Upsert {
                key: b"k1".to_vec(),
                value: value.clone(),
            },
            LedgerEntryChange::Upsert {
                key: b"k2".to_vec(),
                value,
            },
        ],
    }
}

pub fn test_config(
    dir: &tempfile::TempDir,
    event_window: u32,
    transaction_window: u32,
) -> RpcCoreConfigBuilder {
    let url = format!("sqlite://{}", dir.path().join("ledger.sqlite").display());
    RpcCoreConfigBuilder::new()
        .with_database(url)
        .with_network_passphrase(PASSPHRASE)
        .with_event_retention_window(event_window)
        .with_transaction_retention_window(transaction_window)
        .with_ingestion_timeout(Duration::from_secs(5))
        .with_retry(RetryConfig {
            initial_backoff_ms: 5,
            backoff_multiplier: 2.0,
            max_backoff_ms: 50,
            jitter: false,
        })
}

pub async fn open_store(config: &RpcCoreConfig) -> Arc<SqliteStore> {
    Arc::new(SqliteStore::open(config).await.expect("open store"))
}

/// Polls `condition` every few milliseconds for up to five seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached within 5s");
}

/// [`InMemoryBackend`] with injectable faults and fetch accounting.
#[derive(Clone, Default)]
pub struct ScriptedBackend {
    pub inner: InMemoryBackend,
    failing_gets: Arc<AtomicU32>,
    corrupt_once: Arc<Mutex<HashSet<u32>>>,
    slow_once: Arc<Mutex<HashMap<u32, Duration>>>,
    duplicate_next_live: Arc<AtomicBool>,
    misrouted_once: Arc<Mutex<HashMap<u32, u32>>>,
    subscribe_skew: Arc<AtomicU32>,
    fetches: Arc<Mutex<HashMap<u32, u32>>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, meta: LedgerCloseMeta) {
        self.inner.publish(meta);
    }

    /// The next `count` fetches by sequence fail with a backend error.
    pub fn fail_next_gets(&self, count: u32) {
        self.failing_gets.store(count, Ordering::SeqCst);
    }

    /// The first fetch of `sequence` returns a ledger with a malformed meta.
    pub fn corrupt_once(&self, sequence: u32) {
        self.corrupt_once.lock().insert(sequence);
    }

    /// The first fetch of `sequence` takes `delay`.
    pub fn slow_once(&self, sequence: u32, delay: Duration) {
        self.slow_once.lock().insert(sequence, delay);
    }

    /// The next live ledger is delivered twice.
    pub fn duplicate_next_live(&self) {
        self.duplicate_next_live.store(true, Ordering::SeqCst);
    }

    /// The first fetch of `sequence` returns ledger `sequence + offset`.
    pub fn misroute_once(&self, sequence: u32, offset: u32) {
        self.misrouted_once.lock().insert(sequence, offset);
    }

    /// The next live feed starts `offset` ledgers after the requested one.
    pub fn skew_next_subscribe(&self, offset: u32) {
        self.subscribe_skew.store(offset, Ordering::SeqCst);
    }

    /// How many times `sequence` was fetched by sequence.
    pub fn fetch_count(&self, sequence: u32) -> u32 {
        self.fetches.lock().get(&sequence).copied().unwrap_or(0)
    }
}

#[async_trait]
impl LedgerBackend for ScriptedBackend {
    async fn get_ledger(&self, sequence: u32) -> Result<Option<LedgerCloseMeta>> {
        *self.fetches.lock().entry(sequence).or_default() += 1;

        let delay = self.slow_once.lock().remove(&sequence);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .failing_gets
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(RpcCoreError::Backend("scripted fetch failure".to_string()));
        }

        let offset = self.misrouted_once.lock().remove(&sequence).unwrap_or(0);
        let mut meta = self.inner.get_ledger(sequence + offset).await?;
        if self.corrupt_once.lock().remove(&sequence) {
            if let Some(meta) = meta.as_mut() {
                meta.transactions[0].result_meta = vec![0xFF];
            }
        }
        Ok(meta)
    }

    async fn latest_sequence(&self) -> Result<u32> {
        self.inner.latest_sequence().await
    }

    async fn subscribe(&self, from: u32) -> Result<Box<dyn LedgerFeed>> {
        let skew = self.subscribe_skew.swap(0, Ordering::SeqCst);
        Ok(Box::new(ScriptedFeed {
            inner: self.inner.subscribe(from + skew).await?,
            duplicate: Arc::clone(&self.duplicate_next_live),
            last: None,
        }))
    }

    fn backend_name(&self) -> &str {
        "scripted"
    }
}

struct ScriptedFeed {
    inner: Box<dyn LedgerFeed>,
    duplicate: Arc<AtomicBool>,
    last: Option<LedgerCloseMeta>,
}

#[async_trait]
impl LedgerFeed for ScriptedFeed {
    async fn next_ledger(&mut self) -> Result<Option<LedgerCloseMeta>> {
        if let Some(last) = &self.last {
            if self.duplicate.swap(false, Ordering::SeqCst) {
                return Ok(Some(last.clone()));
            }
        }
        let next = self.inner.next_ledger().await?;
        self.last.clone_from(&next);
        Ok(next)
    }
}

/// [`SqliteStore`] whose writes fail once for a chosen ledger.
#[derive(Clone)]
pub struct FailingStore {
    pub inner: Arc<SqliteStore>,
    fail_on: Arc<Mutex<Option<u32>>>,
}

impl FailingStore {
    pub fn new(inner: Arc<SqliteStore>) -> Self {
        Self {
            inner,
            fail_on: Arc::new(Mutex::new(None)),
        }
    }

    /// The next write of `sequence` fails with a database error.
    pub fn fail_write_once(&self, sequence: u32) {
        *self.fail_on.lock() = Some(sequence);
    }
}

#[async_trait]
impl DurableStore for FailingStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        Ok(Box::new(FailingTransaction {
            inner: self.inner.begin().await?,
            fail_on: Arc::clone(&self.fail_on),
        }))
    }

    async fn highest_persisted_sequence(&self) -> Result<Option<u32>> {
        self.inner.highest_persisted_sequence().await
    }

    async fn ledgers_in_range(&self, start: u32, end: u32) -> Result<Vec<LedgerCloseMeta>> {
        self.inner.ledgers_in_range(start, end).await
    }

    async fn get_ledger(&self, sequence: u32) -> Result<Option<LedgerCloseMeta>> {
        self.inner.get_ledger(sequence).await
    }

    async fn latest_ledger(&self) -> Result<Option<LatestLedger>> {
        self.inner.latest_ledger().await
    }

    async fn open_snapshot(&self) -> Result<Box<dyn LedgerSnapshot>> {
        self.inner.open_snapshot().await
    }
}

struct FailingTransaction {
    inner: Box<dyn StoreTransaction>,
    fail_on: Arc<Mutex<Option<u32>>>,
}

#[async_trait]
impl StoreTransaction for FailingTransaction {
    async fn write_ledger(&mut self, meta: &LedgerCloseMeta) -> Result<()> {
        let fail = {
            let mut fail_on = self.fail_on.lock();
            if *fail_on == Some(meta.sequence) {
                *fail_on = None;
                true
            } else {
                false
            }
        };
        if fail {
            return Err(RpcCoreError::Database(sqlx::Error::Protocol(format!(
                "scripted write failure at ledger {}",
                meta.sequence
            ))));
        }
        self.inner.write_ledger(meta).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.inner.commit().await
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.inner.rollback().await
    }
}
