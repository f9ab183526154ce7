//! Ingestion pipeline.
//!
//! A single task pulls ledgers from the [`LedgerBackend`], commits each batch
//! to the [`DurableStore`] and then appends it to the event and transaction
//! indices. The pipeline starts in `CatchingUp`, fetching ledgers by sequence
//! until it reaches the backend's head, then follows the live feed. Any
//! failure moves it to `Retrying`; after a backoff it resumes catch-up from
//! the first ledger it has not committed. Ledgers are never skipped.
//!
//! The store is written before the indices. If an index append fails after
//! the commit, the next attempt replays the missing ledgers from the store
//! instead of fetching them again. The same replay rebuilds the indices on
//! startup.

use crate::config::{RetryConfig, RpcCoreConfig};
use crate::core::events::EventIndex;
use crate::core::transactions::TransactionIndex;
use crate::storage::DurableStore;
use crate::streams::{LedgerBackend, LedgerFeed};
use crate::types::LedgerCloseMeta;
use crate::utils::error::{Result, RpcCoreError};
use crate::utils::logging;
use crate::utils::retry::{Backoff, RetryObserver, is_retryable};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Ledgers loaded from the store per query while replaying into the indices.
const REPLAY_PAGE: u32 = 256;

/// Lifecycle of the ingestion pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    /// Fetching ledgers by sequence until the backend's head is reached.
    CatchingUp,
    /// Following the backend's live feed.
    Live,
    /// Waiting out a backoff after a failed attempt.
    Retrying,
    Stopped,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PipelineState::CatchingUp => "catching-up",
            PipelineState::Live => "live",
            PipelineState::Retrying => "retrying",
            PipelineState::Stopped => "stopped",
        })
    }
}

/// Position of the pipeline: the last ledger committed to the durable store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IngestionCursor {
    pub last_ingested_sequence: Option<u32>,
}

impl IngestionCursor {
    /// Sequence the pipeline will ingest next, if it has ingested anything.
    pub fn next_sequence(&self) -> Option<u32> {
        self.last_ingested_sequence.map(|s| s.saturating_add(1))
    }
}

/// Sequence and close time of a ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerInfo {
    pub sequence: u32,
    /// Unix timestamp, seconds.
    pub close_time: i64,
}

/// Health as reported to liveness checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestionHealth {
    Healthy,
    Degraded(String),
}

impl IngestionHealth {
    pub fn is_healthy(&self) -> bool {
        matches!(self, IngestionHealth::Healthy)
    }
}

/// Live feed together with the next sequence it must deliver.
struct LiveFeed {
    feed: Box<dyn LedgerFeed>,
    next: u32,
}

/// State shared between the pipeline task and its handle.
struct PipelineStatus {
    state: watch::Sender<PipelineState>,
    latest: watch::Sender<Option<LedgerInfo>>,
    consecutive_failures: AtomicU32,
}

impl PipelineStatus {
    fn new() -> Self {
        Self {
            state: watch::channel(PipelineState::CatchingUp).0,
            latest: watch::channel(None).0,
            consecutive_failures: AtomicU32::new(0),
        }
    }

    fn set_state(&self, state: PipelineState) {
        self.state.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }

    fn set_latest(&self, info: LedgerInfo) {
        self.latest.send_replace(Some(info));
    }
}

/// Keeps the durable store and both indices in step with the ledger backend.
///
/// # Example
///
/// ```no_run
/// use ledger_rpc_core::{
///     EventIndex, InMemoryBackend, IngestionPipeline, RpcCoreConfigBuilder, SqliteStore,
///     TransactionIndex,
/// };
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = RpcCoreConfigBuilder::new()
///     .with_network_passphrase("Test SDF Network ; September 2015")
///     .build()?;
/// let store = Arc::new(SqliteStore::open(&config).await?);
/// let events = Arc::new(EventIndex::from_config(&config));
/// let transactions = Arc::new(TransactionIndex::from_config(&config));
///
/// let handle = IngestionPipeline::new(
///     &config,
///     Arc::new(InMemoryBackend::new()),
///     store,
///     events,
///     transactions,
/// )
/// .spawn();
///
/// let cursor = handle.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct IngestionPipeline {
    backend: Arc<dyn LedgerBackend>,
    store: Arc<dyn DurableStore>,
    events: Arc<EventIndex>,
    transactions: Arc<TransactionIndex>,
    batch_size: u32,
    timeout: Duration,
    retry: RetryConfig,
    max_healthy_latency: Duration,
    start_sequence: Option<u32>,
    observer: Option<RetryObserver>,
    cursor: IngestionCursor,
    bootstrapped: bool,
    status: Arc<PipelineStatus>,
    shutdown: CancellationToken,
}

impl IngestionPipeline {
    pub fn new(
        config: &RpcCoreConfig,
        backend: Arc<dyn LedgerBackend>,
        store: Arc<dyn DurableStore>,
        events: Arc<EventIndex>,
        transactions: Arc<TransactionIndex>,
    ) -> Self {
        logging::log_startup(
            &config.database_url,
            events.retention_window(),
            transactions.retention_window(),
            config.ingestion_batch_size,
        );
        Self {
            backend,
            store,
            events,
            transactions,
            batch_size: u32::try_from(config.ingestion_batch_size.max(1)).unwrap_or(u32::MAX),
            timeout: config.ingestion_timeout,
            retry: config.retry.clone(),
            max_healthy_latency: config.max_healthy_ledger_latency,
            start_sequence: None,
            observer: None,
            cursor: IngestionCursor::default(),
            bootstrapped: false,
            status: Arc::new(PipelineStatus::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// First ledger to ingest when the store is empty.
    ///
    /// Without it an empty store starts at the oldest ledger the indices
    /// would still retain relative to the backend's head.
    #[must_use]
    pub fn with_start_sequence(mut self, sequence: u32) -> Self {
        self.start_sequence = Some(sequence);
        self
    }

    /// Callback invoked with each failure and the delay before the retry.
    #[must_use]
    pub fn with_retry_observer(mut self, observer: RetryObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Uses `token` (or a child of it) as the close signal.
    #[must_use]
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn cursor(&self) -> IngestionCursor {
        self.cursor
    }

    pub fn state(&self) -> PipelineState {
        *self.status.state.borrow()
    }

    /// Reads the cursor from the store and replays the retained ledgers into
    /// the indices, oldest first.
    ///
    /// Called by [`run`](Self::run) before the first fetch; calling it again
    /// is a no-op.
    ///
    /// # Errors
    ///
    /// Returns store and decode errors; the indices keep whatever was
    /// appended before the failure and a later call resumes from there.
    pub async fn bootstrap(&mut self) -> Result<IngestionCursor> {
        if !self.bootstrapped {
            self.cursor.last_ingested_sequence = self.store.highest_persisted_sequence().await?;
            self.bootstrapped = true;
            tracing::info!(
                last_ingested = ?self.cursor.last_ingested_sequence,
                "Read ingestion cursor from store"
            );
        }
        self.replay_from_store().await?;
        Ok(self.cursor)
    }

    /// Starts the pipeline on the current tokio runtime.
    pub fn spawn(mut self) -> IngestionHandle {
        let status = Arc::clone(&self.status);
        let shutdown = self.shutdown.clone();
        let max_healthy_latency = self.max_healthy_latency;
        let task = tokio::spawn(async move { self.run().await });
        IngestionHandle {
            status,
            shutdown,
            max_healthy_latency,
            task,
        }
    }

    /// Ingests until the close signal fires and returns the final cursor.
    ///
    /// Failures never end the loop; they are reported to the retry observer
    /// and retried with backoff.
    pub async fn run(&mut self) -> IngestionCursor {
        logging::log(
            logging::LogLevel::Info,
            &format!("Starting ingestion from {}", self.backend.backend_name()),
        );
        let mut backoff = Backoff::new(self.retry.clone());
        let mut feed: Option<LiveFeed> = None;

        while !self.shutdown.is_cancelled() {
            let attempt = tokio::time::timeout(self.timeout, self.step(&mut feed)).await;
            let result = attempt.unwrap_or(Err(RpcCoreError::Timeout(self.timeout)));

            match result {
                Ok(()) => {
                    backoff.reset();
                    self.status.consecutive_failures.store(0, Ordering::Relaxed);
                }
                Err(err) => {
                    feed = None;
                    self.status.set_state(PipelineState::Retrying);
                    self.status
                        .consecutive_failures
                        .fetch_add(1, Ordering::Relaxed);
                    let delay = backoff.next_delay();

                    if is_retryable(&err) {
                        tracing::warn!(
                            error = %err,
                            attempt = backoff.attempts(),
                            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            next = ?self.cursor.next_sequence(),
                            "Ingestion attempt failed, retrying"
                        );
                    } else {
                        logging::log_error("Unexpected ingestion failure", &err.to_string());
                    }
                    if let Some(observer) = &self.observer {
                        observer(&err, delay);
                    }

                    tokio::select! {
                        () = self.shutdown.cancelled() => break,
                        () = tokio::time::sleep(delay) => {}
                    }
                    self.status.set_state(PipelineState::CatchingUp);
                }
            }
        }

        self.status.set_state(PipelineState::Stopped);
        tracing::info!(last_ingested = ?self.cursor.last_ingested_sequence, "Ingestion stopped");
        self.cursor
    }

    /// One unit of progress: a catch-up batch, or one ledger from the live feed.
    async fn step(&mut self, feed: &mut Option<LiveFeed>) -> Result<()> {
        self.bootstrap().await?;

        if let Some(live) = feed.as_mut() {
            let next = tokio::select! {
                () = self.shutdown.cancelled() => return Ok(()),
                next = live.feed.next_ledger() => next?,
            };
            let meta = next.ok_or_else(|| RpcCoreError::Backend("live feed ended".to_string()))?;
            let expected = live.next;
            self.ingest_batch(expected, vec![meta]).await?;
            live.next = expected.saturating_add(1);
            return Ok(());
        }

        let latest = self.backend.latest_sequence().await?;
        let next = self.next_sequence(latest);
        if next > latest {
            tracing::info!(next, latest, "Caught up, switching to live feed");
            *feed = Some(LiveFeed {
                feed: self.backend.subscribe(next).await?,
                next,
            });
            self.status.set_state(PipelineState::Live);
            return Ok(());
        }

        self.status.set_state(PipelineState::CatchingUp);
        let last = latest.min(next.saturating_add(self.batch_size - 1));
        let mut ledgers = Vec::with_capacity((last - next + 1) as usize);
        for sequence in next..=last {
            let meta = self.backend.get_ledger(sequence).await?.ok_or_else(|| {
                RpcCoreError::Backend(format!("ledger {sequence} not available from backend"))
            })?;
            check_sequence(sequence, meta.sequence)?;
            ledgers.push(meta);
        }
        self.ingest_batch(next, ledgers).await
    }

    fn next_sequence(&self, latest: u32) -> u32 {
        self.cursor.next_sequence().unwrap_or_else(|| {
            self.start_sequence.unwrap_or_else(|| {
                latest
                    .saturating_sub(self.replay_depth().saturating_sub(1))
                    .max(1)
            })
        })
    }

    fn replay_depth(&self) -> u32 {
        self.events
            .retention_window()
            .max(self.transactions.retention_window())
    }

    /// Validates, persists and indexes one contiguous batch.
    ///
    /// The batch must start at the cursor's next sequence, or at
    /// `requested` while nothing has been ingested. Everything is decoded
    /// before the store transaction opens, so a malformed ledger never
    /// reaches the store.
    #[tracing::instrument(
        skip_all,
        fields(
            first = ledgers.first().map(|l| l.sequence),
            count = ledgers.len()
        )
    )]
    async fn ingest_batch(&mut self, requested: u32, ledgers: Vec<LedgerCloseMeta>) -> Result<()> {
        let started = Instant::now();
        let (Some(first), Some(last)) = (ledgers.first(), ledgers.last()) else {
            return Ok(());
        };
        let (first_sequence, last_sequence) = (first.sequence, last.sequence);

        let mut expected = self.cursor.next_sequence().unwrap_or(requested);
        for meta in &ledgers {
            check_sequence(expected, meta.sequence)?;
            expected = meta.sequence.saturating_add(1);
        }

        let mut prepared = Vec::with_capacity(ledgers.len());
        let mut transaction_count = 0;
        let mut event_count = 0;
        for meta in &ledgers {
            let events = self.events.prepare(meta)?;
            let transactions = self.transactions.prepare(meta)?;
            transaction_count += transactions.content.len();
            event_count += events.content.len();
            prepared.push((events, transactions));
        }

        let mut tx = self.store.begin().await?;
        for meta in &ledgers {
            if let Err(err) = tx.write_ledger(meta).await {
                if let Err(rollback) = tx.rollback().await {
                    logging::log(
                        logging::LogLevel::Warning,
                        &format!("Rollback of ledgers {first_sequence}-{last_sequence} failed: {rollback}"),
                    );
                }
                return Err(err);
            }
        }
        tx.commit().await?;
        self.cursor.last_ingested_sequence = Some(last_sequence);

        for (events, transactions) in prepared {
            let info = LedgerInfo {
                sequence: events.sequence,
                close_time: events.close_time,
            };
            if self.events.latest_sequence().is_none_or(|s| s < info.sequence) {
                self.events.append(events)?;
            }
            if self.transactions.latest_sequence().is_none_or(|s| s < info.sequence) {
                self.transactions.append(transactions)?;
            }
            self.status.set_latest(info);
        }

        logging::log_batch(
            first_sequence,
            last_sequence,
            transaction_count,
            event_count,
            u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        );
        Ok(())
    }

    /// Appends committed ledgers the indices are missing.
    async fn replay_from_store(&mut self) -> Result<()> {
        let Some(last) = self.cursor.last_ingested_sequence else {
            return Ok(());
        };
        let window_start = last.saturating_sub(self.replay_depth().saturating_sub(1));
        let from = [self.events.latest_sequence(), self.transactions.latest_sequence()]
            .into_iter()
            .map(|tail| tail.map_or(window_start, |s| s.saturating_add(1).max(window_start)))
            .min()
            .unwrap_or(window_start);
        if from > last {
            return Ok(());
        }

        let started = Instant::now();
        let mut replayed = 0usize;
        let mut start = from;
        loop {
            let end = last.min(start.saturating_add(REPLAY_PAGE - 1));
            for meta in self.store.ledgers_in_range(start, end).await? {
                if self.events.latest_sequence().is_none_or(|s| s < meta.sequence) {
                    self.events.ingest_ledger(&meta)?;
                }
                if self.transactions.latest_sequence().is_none_or(|s| s < meta.sequence) {
                    self.transactions.ingest_ledger(&meta)?;
                }
                self.status.set_latest(LedgerInfo {
                    sequence: meta.sequence,
                    close_time: meta.close_time,
                });
                replayed += 1;
            }
            if end >= last {
                break;
            }
            start = end + 1;
        }

        tracing::info!(
            from,
            to = last,
            replayed,
            duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Replayed ledgers from store into indices"
        );
        Ok(())
    }
}

fn check_sequence(expected: u32, got: u32) -> Result<()> {
    match got.cmp(&expected) {
        std::cmp::Ordering::Equal => Ok(()),
        std::cmp::Ordering::Less => Err(RpcCoreError::OutOfOrder { expected, got }),
        std::cmp::Ordering::Greater => Err(RpcCoreError::Gap { expected, got }),
    }
}

/// Control and health surface of a spawned [`IngestionPipeline`].
pub struct IngestionHandle {
    status: Arc<PipelineStatus>,
    shutdown: CancellationToken,
    max_healthy_latency: Duration,
    task: JoinHandle<IngestionCursor>,
}

impl IngestionHandle {
    pub fn state(&self) -> PipelineState {
        *self.status.state.borrow()
    }

    /// Receiver notified on every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<PipelineState> {
        self.status.state.subscribe()
    }

    pub fn last_ingested_sequence(&self) -> Option<u32> {
        self.status.latest.borrow().map(|info| info.sequence)
    }

    pub fn latest_ledger(&self) -> Option<LedgerInfo> {
        *self.status.latest.borrow()
    }

    /// Failed attempts since the last successful one.
    pub fn consecutive_failures(&self) -> u32 {
        self.status.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Waits until `sequence` has been committed and indexed.
    ///
    /// # Errors
    ///
    /// Returns `RpcCoreError::Internal` if the pipeline task is gone.
    pub async fn wait_for_sequence(&self, sequence: u32) -> Result<()> {
        let mut latest = self.status.latest.subscribe();
        latest
            .wait_for(|info| info.is_some_and(|i| i.sequence >= sequence))
            .await
            .map(|_| ())
            .map_err(|_| RpcCoreError::Internal("ingestion pipeline has exited".to_string()))
    }

    /// Health at `now` (unix seconds).
    pub fn health(&self, now: i64) -> IngestionHealth {
        if self.state() == PipelineState::Stopped {
            return IngestionHealth::Degraded("ingestion is stopped".to_string());
        }
        let Some(latest) = self.latest_ledger() else {
            return IngestionHealth::Degraded("no ledger has been ingested yet".to_string());
        };
        let max_secs = i64::try_from(self.max_healthy_latency.as_secs()).unwrap_or(i64::MAX);
        let age = now.saturating_sub(latest.close_time);
        if age > max_secs {
            return IngestionHealth::Degraded(format!(
                "latency ({age}s) since last known ledger closed is too high (>{max_secs}s)"
            ));
        }
        IngestionHealth::Healthy
    }

    /// [`health`](Self::health) at the current wall-clock time.
    pub fn health_now(&self) -> IngestionHealth {
        self.health(chrono::Utc::now().timestamp())
    }

    /// Signals the pipeline to stop and waits for it.
    ///
    /// An in-flight fetch or write finishes (or hits the ingestion timeout)
    /// before this returns.
    ///
    /// # Errors
    ///
    /// Returns `RpcCoreError::Internal` if the pipeline task panicked.
    pub async fn close(self) -> Result<IngestionCursor> {
        self.shutdown.cancel();
        Ok(self.task.await?)
    }
}
