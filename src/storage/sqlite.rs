use super::{DurableStore, LatestLedger, LedgerSnapshot, StoreTransaction};
use crate::config::{
    DEFAULT_EVENT_RETENTION_WINDOW, DEFAULT_LEDGER_ENTRY_WRITE_BATCH, RpcCoreConfig,
};
use crate::types::{LedgerCloseMeta, LedgerEntryChange};
use crate::utils::error::{Result, RpcCoreError};
use async_trait::async_trait;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{QueryBuilder, Sqlite, Transaction};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

const LATEST_LEDGER_KEY: &str = "latest_ledger_sequence";

/// SQLite-backed [`DurableStore`].
///
/// The database runs in WAL mode so snapshot readers never block the
/// ingestion writer and always see whole committed batches.
///
/// # Example
///
/// ```no_run
/// use ledger_rpc_core::SqliteStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = SqliteStore::new("sqlite://ledger_rpc.sqlite").await?;
/// store.initialize().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    replay_depth: u32,
    entry_write_batch: usize,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `database_url`.
    ///
    /// # Errors
    ///
    /// Returns `RpcCoreError::Database` if the URL is invalid or the
    /// connection fails.
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::connect(database_url, 5).await
    }

    /// Opens the store described by `config` and creates its schema.
    ///
    /// The pool is sized so every queued and running simulation can hold a
    /// snapshot while ingestion keeps writing.
    pub async fn open(config: &RpcCoreConfig) -> Result<Self> {
        let connections = config.preflight_worker_count + config.preflight_queue_capacity + 2;
        let store = Self::connect(&config.database_url, connections)
            .await?
            .with_replay_depth(config.replay_depth())
            .with_entry_write_batch(config.max_ledger_entry_write_batch);
        store.initialize().await?;
        Ok(store)
    }

    async fn connect(database_url: &str, max_connections: usize) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(u32::try_from(max_connections).unwrap_or(u32::MAX))
            .acquire_timeout(Duration::from_secs(3))
            .connect_with(options)
            .await?;

        Ok(Self {
            pool,
            replay_depth: DEFAULT_EVENT_RETENTION_WINDOW,
            entry_write_batch: DEFAULT_LEDGER_ENTRY_WRITE_BATCH,
        })
    }

    /// Number of most recent ledgers kept for index rebuilds.
    #[must_use]
    pub fn with_replay_depth(mut self, ledgers: u32) -> Self {
        self.replay_depth = ledgers.max(1);
        self
    }

    /// Ledger entries written per statement.
    #[must_use]
    pub fn with_entry_write_batch(mut self, size: usize) -> Self {
        self.entry_write_batch = size.max(1);
        self
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Creates the schema if it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns `RpcCoreError::Database` if a statement fails.
    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS ledger_close_meta (
                sequence INTEGER PRIMARY KEY,
                meta BLOB NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS ledger_entries (
                key BLOB PRIMARY KEY,
                value BLOB NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        Ok(Box::new(SqliteWriteTransaction {
            tx: self.pool.begin().await?,
            replay_depth: self.replay_depth,
            entry_write_batch: self.entry_write_batch,
        }))
    }

    async fn highest_persisted_sequence(&self) -> Result<Option<u32>> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM metadata WHERE key = ?")
                .bind(LATEST_LEDGER_KEY)
                .fetch_optional(&self.pool)
                .await?;
        value.as_deref().map(parse_sequence).transpose()
    }

    async fn ledgers_in_range(&self, start: u32, end: u32) -> Result<Vec<LedgerCloseMeta>> {
        let blobs: Vec<Vec<u8>> = sqlx::query_scalar(
            "SELECT meta FROM ledger_close_meta WHERE sequence BETWEEN ? AND ? ORDER BY sequence ASC",
        )
        .bind(i64::from(start))
        .bind(i64::from(end))
        .fetch_all(&self.pool)
        .await?;
        blobs.iter().map(|blob| LedgerCloseMeta::decode(blob)).collect()
    }

    async fn get_ledger(&self, sequence: u32) -> Result<Option<LedgerCloseMeta>> {
        let blob: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT meta FROM ledger_close_meta WHERE sequence = ?")
                .bind(i64::from(sequence))
                .fetch_optional(&self.pool)
                .await?;
        blob.as_deref().map(LedgerCloseMeta::decode).transpose()
    }

    async fn latest_ledger(&self) -> Result<Option<LatestLedger>> {
        let mut tx = self.pool.begin().await?;
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM metadata WHERE key = ?")
                .bind(LATEST_LEDGER_KEY)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(sequence) = value.as_deref().map(parse_sequence).transpose()? else {
            return Ok(None);
        };
        let blob: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT meta FROM ledger_close_meta WHERE sequence = ?")
                .bind(i64::from(sequence))
                .fetch_optional(&mut *tx)
                .await?;
        tx.commit().await?;

        let blob = blob.ok_or_else(|| {
            RpcCoreError::Internal(format!("latest ledger {sequence} missing from store"))
        })?;
        let meta = LedgerCloseMeta::decode(&blob)?;
        Ok(Some(LatestLedger::from(&meta)))
    }

    async fn open_snapshot(&self) -> Result<Box<dyn LedgerSnapshot>> {
        let mut tx = self.pool.begin().await?;
        // The first read starts the WAL read transaction, so every later
        // read in `tx` sees the state as of this sequence.
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM metadata WHERE key = ?")
                .bind(LATEST_LEDGER_KEY)
                .fetch_optional(&mut *tx)
                .await?;
        let sequence = value.as_deref().map(parse_sequence).transpose()?;
        Ok(Box::new(SqliteSnapshot { tx, sequence }))
    }
}

struct SqliteWriteTransaction {
    tx: Transaction<'static, Sqlite>,
    replay_depth: u32,
    entry_write_batch: usize,
}

#[async_trait]
impl StoreTransaction for SqliteWriteTransaction {
    async fn write_ledger(&mut self, meta: &LedgerCloseMeta) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO ledger_close_meta (sequence, meta) VALUES (?, ?)
            ON CONFLICT(sequence) DO UPDATE SET meta = excluded.meta
            ",
        )
        .bind(i64::from(meta.sequence))
        .bind(meta.encode()?)
        .execute(&mut *self.tx)
        .await?;

        // Last change per key wins, so upserts and removals can be batched
        // independently.
        let mut latest: BTreeMap<&[u8], &LedgerEntryChange> = BTreeMap::new();
        for change in &meta.entry_changes {
            latest.insert(change.key(), change);
        }
        let mut upserts = Vec::new();
        let mut removals = Vec::new();
        for change in latest.into_values() {
            match change {
                LedgerEntryChange::Upsert { key, value } => upserts.push((key, value)),
                LedgerEntryChange::Remove { key } => removals.push(key),
            }
        }

        for chunk in upserts.chunks(self.entry_write_batch) {
            let mut builder = QueryBuilder::<Sqlite>::new("INSERT INTO ledger_entries (key, value) ");
            builder.push_values(chunk, |mut row, (key, value)| {
                row.push_bind(key.to_vec()).push_bind(value.to_vec());
            });
            builder.push(" ON CONFLICT(key) DO UPDATE SET value = excluded.value");
            builder.build().execute(&mut *self.tx).await?;
        }

        for chunk in removals.chunks(self.entry_write_batch) {
            let mut builder = QueryBuilder::<Sqlite>::new("DELETE FROM ledger_entries WHERE key IN (");
            let mut keys = builder.separated(", ");
            for key in chunk {
                keys.push_bind(key.to_vec());
            }
            keys.push_unseparated(")");
            builder.build().execute(&mut *self.tx).await?;
        }

        sqlx::query(
            r"
            INSERT INTO metadata (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            ",
        )
        .bind(LATEST_LEDGER_KEY)
        .bind(meta.sequence.to_string())
        .execute(&mut *self.tx)
        .await?;

        if let Some(cutoff) = meta.sequence.checked_sub(self.replay_depth) {
            sqlx::query("DELETE FROM ledger_close_meta WHERE sequence <= ?")
                .bind(i64::from(cutoff))
                .execute(&mut *self.tx)
                .await?;
        }

        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

struct SqliteSnapshot {
    tx: Transaction<'static, Sqlite>,
    sequence: Option<u32>,
}

#[async_trait]
impl LedgerSnapshot for SqliteSnapshot {
    fn sequence(&self) -> Option<u32> {
        self.sequence
    }

    async fn get_entry(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let value: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT value FROM ledger_entries WHERE key = ?")
                .bind(key)
                .fetch_optional(&mut *self.tx)
                .await?;
        Ok(value)
    }
}

fn parse_sequence(raw: &str) -> Result<u32> {
    raw.parse()
        .map_err(|_| RpcCoreError::Decode(format!("invalid stored ledger sequence '{raw}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Hash32;

    async fn store(dir: &tempfile::TempDir) -> Result<SqliteStore> {
        let url = format!("sqlite://{}", dir.path().join("store.sqlite").display());
        let store = SqliteStore::new(&url).await?.with_replay_depth(3).with_entry_write_batch(2);
        store.initialize().await?;
        Ok(store)
    }

    fn ledger(sequence: u32, entry_changes: Vec<LedgerEntryChange>) -> LedgerCloseMeta {
        LedgerCloseMeta {
            sequence,
            hash: Hash32([1; 32]),
            previous_hash: Hash32::default(),
            close_time: i64::from(sequence),
            protocol_version: 21,
            transactions: vec![],
            entry_changes,
        }
    }

    fn upsert(key: &str, value: &str) -> LedgerEntryChange {
        LedgerEntryChange::Upsert {
            key: key.as_bytes().to_vec(),
            value: value.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn test_write_commit_and_read_back() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir).await?;
        assert_eq!(store.highest_persisted_sequence().await?, None);

        let changes = vec![
            upsert("a", "1"),
            upsert("b", "1"),
            upsert("c", "1"),
            upsert("a", "2"),
            LedgerEntryChange::Remove { key: b"b".to_vec() },
        ];
        let mut tx = store.begin().await?;
        tx.write_ledger(&ledger(10, changes.clone())).await?;
        tx.commit().await?;

        assert_eq!(store.highest_persisted_sequence().await?, Some(10));
        assert_eq!(store.get_ledger(10).await?.map(|l| l.entry_changes), Some(changes));

        let mut snapshot = store.open_snapshot().await?;
        assert_eq!(snapshot.sequence(), Some(10));
        let entries = snapshot
            .get_entries(&[b"a".to_vec(), b"b".to_vec(), b"c".to_vec()])
            .await?;
        assert_eq!(entries, vec![Some(b"2".to_vec()), None, Some(b"1".to_vec())]);
        Ok(())
    }

    #[tokio::test]
    async fn test_latest_ledger() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir).await?;
        assert_eq!(store.latest_ledger().await?, None);

        let mut tx = store.begin().await?;
        tx.write_ledger(&ledger(4, vec![])).await?;
        let mut newest = ledger(5, vec![]);
        newest.hash = Hash32([5; 32]);
        newest.protocol_version = 22;
        tx.write_ledger(&newest).await?;
        tx.commit().await?;

        let latest = store.latest_ledger().await?.expect("latest ledger");
        assert_eq!(latest.sequence, 5);
        assert_eq!(latest.hash, Hash32([5; 32]));
        assert_eq!(latest.protocol_version, 22);
        assert_eq!(latest.close_time, 5);

        // An uncommitted write is not visible.
        let mut tx = store.begin().await?;
        tx.write_ledger(&ledger(6, vec![])).await?;
        assert_eq!(store.latest_ledger().await?.map(|l| l.sequence), Some(5));
        tx.rollback().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_rollback_discards_batch() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir).await?;

        let mut tx = store.begin().await?;
        tx.write_ledger(&ledger(1, vec![upsert("k", "v")])).await?;
        tx.write_ledger(&ledger(2, vec![])).await?;
        tx.rollback().await?;

        assert_eq!(store.highest_persisted_sequence().await?, None);
        assert!(store.ledgers_in_range(0, 10).await?.is_empty());
        let mut snapshot = store.open_snapshot().await?;
        assert_eq!(snapshot.get_entry(b"k").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_trims_beyond_replay_depth() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir).await?;

        for seq in 1..=6 {
            let mut tx = store.begin().await?;
            tx.write_ledger(&ledger(seq, vec![])).await?;
            tx.commit().await?;
        }

        let kept: Vec<u32> = store
            .ledgers_in_range(0, u32::MAX)
            .await?
            .iter()
            .map(|l| l.sequence)
            .collect();
        assert_eq!(kept, vec![4, 5, 6]);
        Ok(())
    }

    #[tokio::test]
    async fn test_snapshot_is_pinned() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir).await?;

        let mut tx = store.begin().await?;
        tx.write_ledger(&ledger(1, vec![upsert("k", "1")])).await?;
        tx.commit().await?;

        let mut pinned = store.open_snapshot().await?;

        let mut tx = store.begin().await?;
        tx.write_ledger(&ledger(2, vec![upsert("k", "2")])).await?;
        tx.commit().await?;

        assert_eq!(pinned.sequence(), Some(1));
        assert_eq!(pinned.get_entry(b"k").await?, Some(b"1".to_vec()));

        let mut fresh = store.open_snapshot().await?;
        assert_eq!(fresh.sequence(), Some(2));
        assert_eq!(fresh.get_entry(b"k").await?, Some(b"2".to_vec()));
        Ok(())
    }
}
