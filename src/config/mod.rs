//! Configuration management for the ledger RPC core.
//!
//! This module provides a builder-based configuration system. Values are
//! validated once in [`RpcCoreConfigBuilder::build`] so that the indices, the
//! ingestion pipeline and the worker pool can assume positive sizes.

use crate::utils::error::{Result, RpcCoreError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of ledgers kept in the event index (one day at 5 s ledgers).
pub const DEFAULT_EVENT_RETENTION_WINDOW: u32 = 17_280;
/// Default number of ledgers kept in the transaction index.
pub const DEFAULT_TRANSACTION_RETENTION_WINDOW: u32 = 1_440;
/// Default upper bound for a single ingestion attempt.
pub const DEFAULT_INGESTION_TIMEOUT: Duration = Duration::from_secs(30 * 60);
/// Default number of ledger entries written per statement group.
pub const DEFAULT_LEDGER_ENTRY_WRITE_BATCH: usize = 150;

const DEFAULT_DATABASE_URL: &str = "sqlite://ledger_rpc.sqlite";
/// Events returned when a query gives no limit.
pub const DEFAULT_EVENTS_LIMIT: usize = 100;
/// Hard cap on events returned by one query.
pub const MAX_EVENTS_LIMIT: usize = 10_000;
const DEFAULT_MAX_HEALTHY_LEDGER_LATENCY: Duration = Duration::from_secs(30);

/// Configuration for the ingestion retry loop.
///
/// There is no attempt limit: ingestion retries until it succeeds or the
/// pipeline is closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Delay before the first retry, in milliseconds (default: 500).
    pub initial_backoff_ms: u64,
    /// Multiplier applied per consecutive failure (default: 2.0).
    pub backoff_multiplier: f64,
    /// Upper bound for a single delay, in milliseconds (default: 60 000).
    pub max_backoff_ms: u64,
    /// Apply ±25 % jitter to each delay (default: true).
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 500,
            backoff_multiplier: 2.0,
            max_backoff_ms: 60_000,
            jitter: true,
        }
    }
}

/// Configuration for the ledger RPC core.
///
/// Use [`RpcCoreConfigBuilder`] to construct instances of this struct.
#[derive(Debug, Clone)]
pub struct RpcCoreConfig {
    /// Durable store connection URL (e.g., <sqlite://ledger_rpc.sqlite>)
    pub database_url: String,

    /// Network passphrase, mixed into every transaction hash
    pub network_passphrase: String,

    /// Ledgers retained by the event index (default: 17280)
    pub event_retention_window: u32,

    /// Ledgers retained by the transaction index (default: 1440)
    pub transaction_retention_window: u32,

    /// Ledgers fetched and committed per store transaction (default: 1)
    pub ingestion_batch_size: usize,

    /// Upper bound for one fetch/persist attempt (default: 30 minutes)
    pub ingestion_timeout: Duration,

    /// Parallel preflight workers (default: number of CPUs)
    pub preflight_worker_count: usize,

    /// Preflight jobs that may wait for a worker (default: number of CPUs)
    pub preflight_queue_capacity: usize,

    /// Events returned when a query gives no limit (default: 100)
    pub default_events_limit: usize,

    /// Hard cap on events returned by one query (default: 10000)
    pub max_events_limit: usize,

    /// Ingestion is reported degraded once the newest ledger is older than this
    pub max_healthy_ledger_latency: Duration,

    /// Ledger entries written per statement group (default: 150)
    pub max_ledger_entry_write_batch: usize,

    /// Backoff policy for ingestion retries
    pub retry: RetryConfig,
}

impl RpcCoreConfig {
    /// Number of ledgers the durable store keeps so the indices can be rebuilt.
    ///
    /// The two windows stay independent; only replay depth uses the larger one.
    #[must_use]
    pub fn replay_depth(&self) -> u32 {
        self.event_retention_window
            .max(self.transaction_retention_window)
    }

    /// Builds a configuration from `LEDGER_RPC_*` environment variables.
    ///
    /// A `.env` file is loaded first when present. Unset variables fall back
    /// to the builder defaults.
    ///
    /// # Errors
    ///
    /// Returns `RpcCoreError::Config` for unparsable values or when
    /// validation fails.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut builder = RpcCoreConfigBuilder::new();
        if let Some(url) = env_string("LEDGER_RPC_DATABASE_URL") {
            builder = builder.with_database(url);
        }
        if let Some(passphrase) = env_string("LEDGER_RPC_NETWORK_PASSPHRASE") {
            builder = builder.with_network_passphrase(passphrase);
        }
        if let Some(window) = env_parse::<u32>("LEDGER_RPC_EVENT_RETENTION_WINDOW")? {
            builder = builder.with_event_retention_window(window);
        }
        if let Some(window) = env_parse::<u32>("LEDGER_RPC_TRANSACTION_RETENTION_WINDOW")? {
            builder = builder.with_transaction_retention_window(window);
        }
        if let Some(size) = env_parse::<usize>("LEDGER_RPC_INGESTION_BATCH_SIZE")? {
            builder = builder.with_batch_size(size);
        }
        if let Some(secs) = env_parse::<u64>("LEDGER_RPC_INGESTION_TIMEOUT_SECS")? {
            builder = builder.with_ingestion_timeout(Duration::from_secs(secs));
        }
        if let Some(count) = env_parse::<usize>("LEDGER_RPC_PREFLIGHT_WORKER_COUNT")? {
            builder = builder.with_preflight_workers(count);
        }
        if let Some(capacity) = env_parse::<usize>("LEDGER_RPC_PREFLIGHT_QUEUE_CAPACITY")? {
            builder = builder.with_preflight_queue_capacity(capacity);
        }
        if let Some(limit) = env_parse::<usize>("LEDGER_RPC_DEFAULT_EVENTS_LIMIT")? {
            builder = builder.with_default_events_limit(limit);
        }
        if let Some(limit) = env_parse::<usize>("LEDGER_RPC_MAX_EVENTS_LIMIT")? {
            builder = builder.with_max_events_limit(limit);
        }
        if let Some(secs) = env_parse::<u64>("LEDGER_RPC_MAX_HEALTHY_LEDGER_LATENCY_SECS")? {
            builder = builder.with_max_healthy_ledger_latency(Duration::from_secs(secs));
        }
        builder.build()
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    env_string(name)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| {
                RpcCoreError::Config(format!("Invalid value '{raw}' for {name}: {e}"))
            })
        })
        .transpose()
}

fn available_cpus() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}

/// Builder for `RpcCoreConfig`.
///
/// # Example
///
/// ```no_run
/// use ledger_rpc_core::RpcCoreConfigBuilder;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = RpcCoreConfigBuilder::new()
///     .with_database("sqlite://ledger_rpc.sqlite")
///     .with_network_passphrase("Test SDF Network ; September 2015")
///     .with_event_retention_window(17_280)
///     .with_preflight_workers(4)
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct RpcCoreConfigBuilder {
    database_url: Option<String>,
    network_passphrase: Option<String>,
    event_retention_window: Option<u32>,
    transaction_retention_window: Option<u32>,
    ingestion_batch_size: Option<usize>,
    ingestion_timeout: Option<Duration>,
    preflight_worker_count: Option<usize>,
    preflight_queue_capacity: Option<usize>,
    default_events_limit: Option<usize>,
    max_events_limit: Option<usize>,
    max_healthy_ledger_latency: Option<Duration>,
    max_ledger_entry_write_batch: Option<usize>,
    retry: Option<RetryConfig>,
}

impl RpcCoreConfigBuilder {
    /// Creates a new configuration builder with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the durable store connection URL.
    #[must_use]
    pub fn with_database(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    /// Sets the network passphrase used for transaction hashing.
    #[must_use]
    pub fn with_network_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.network_passphrase = Some(passphrase.into());
        self
    }

    /// Sets the event index retention window. `0` selects the default.
    #[must_use]
    pub fn with_event_retention_window(mut self, ledgers: u32) -> Self {
        self.event_retention_window = Some(ledgers);
        self
    }

    /// Sets the transaction index retention window. `0` selects the default.
    #[must_use]
    pub fn with_transaction_retention_window(mut self, ledgers: u32) -> Self {
        self.transaction_retention_window = Some(ledgers);
        self
    }

    /// Sets how many ledgers are committed per store transaction.
    #[must_use]
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.ingestion_batch_size = Some(size);
        self
    }

    /// Sets the upper bound for a single ingestion attempt.
    #[must_use]
    pub fn with_ingestion_timeout(mut self, timeout: Duration) -> Self {
        self.ingestion_timeout = Some(timeout);
        self
    }

    /// Sets the number of parallel preflight workers.
    #[must_use]
    pub fn with_preflight_workers(mut self, count: usize) -> Self {
        self.preflight_worker_count = Some(count);
        self
    }

    /// Sets the preflight queue depth.
    #[must_use]
    pub fn with_preflight_queue_capacity(mut self, capacity: usize) -> Self {
        self.preflight_queue_capacity = Some(capacity);
        self
    }

    /// Sets the event limit applied when a query does not specify one.
    #[must_use]
    pub fn with_default_events_limit(mut self, limit: usize) -> Self {
        self.default_events_limit = Some(limit);
        self
    }

    /// Sets the maximum number of events one query may return.
    #[must_use]
    pub fn with_max_events_limit(mut self, limit: usize) -> Self {
        self.max_events_limit = Some(limit);
        self
    }

    /// Sets the ledger age beyond which ingestion is reported degraded.
    #[must_use]
    pub fn with_max_healthy_ledger_latency(mut self, latency: Duration) -> Self {
        self.max_healthy_ledger_latency = Some(latency);
        self
    }

    /// Sets how many ledger entries are written per statement group.
    #[must_use]
    pub fn with_ledger_entry_write_batch(mut self, size: usize) -> Self {
        self.max_ledger_entry_write_batch = Some(size);
        self
    }

    /// Sets the ingestion retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Build the configuration.
    ///
    /// # Errors
    ///
    /// Returns `RpcCoreError::Config` if:
    /// - the network passphrase is missing or blank
    /// - batch size, ingestion timeout, worker count or queue capacity is zero
    /// - the default events limit exceeds the maximum
    pub fn build(self) -> Result<RpcCoreConfig> {
        let network_passphrase = self
            .network_passphrase
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| {
                RpcCoreError::Config("Network passphrase is required".to_string())
            })?;

        let ingestion_batch_size = self.ingestion_batch_size.unwrap_or(1);
        if ingestion_batch_size == 0 {
            return Err(RpcCoreError::Config(
                "Ingestion batch size must be positive".to_string(),
            ));
        }

        let ingestion_timeout = self.ingestion_timeout.unwrap_or(DEFAULT_INGESTION_TIMEOUT);
        if ingestion_timeout.is_zero() {
            return Err(RpcCoreError::Config(
                "Ingestion timeout must be positive".to_string(),
            ));
        }

        let preflight_worker_count = self.preflight_worker_count.unwrap_or_else(available_cpus);
        let preflight_queue_capacity = self.preflight_queue_capacity.unwrap_or_else(available_cpus);
        if preflight_worker_count == 0 || preflight_queue_capacity == 0 {
            return Err(RpcCoreError::Config(
                "Preflight worker count and queue capacity must be positive".to_string(),
            ));
        }

        let default_events_limit = self.default_events_limit.unwrap_or(DEFAULT_EVENTS_LIMIT);
        let max_events_limit = self.max_events_limit.unwrap_or(MAX_EVENTS_LIMIT);
        if default_events_limit > max_events_limit {
            return Err(RpcCoreError::Config(format!(
                "default-events-limit ({default_events_limit}) cannot exceed max-events-limit ({max_events_limit})"
            )));
        }

        let max_ledger_entry_write_batch = self
            .max_ledger_entry_write_batch
            .filter(|size| *size > 0)
            .unwrap_or(DEFAULT_LEDGER_ENTRY_WRITE_BATCH);

        Ok(RpcCoreConfig {
            database_url: self
                .database_url
                .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            network_passphrase,
            event_retention_window: self
                .event_retention_window
                .filter(|w| *w > 0)
                .unwrap_or(DEFAULT_EVENT_RETENTION_WINDOW),
            transaction_retention_window: self
                .transaction_retention_window
                .filter(|w| *w > 0)
                .unwrap_or(DEFAULT_TRANSACTION_RETENTION_WINDOW),
            ingestion_batch_size,
            ingestion_timeout,
            preflight_worker_count,
            preflight_queue_capacity,
            default_events_limit,
            max_events_limit,
            max_healthy_ledger_latency: self
                .max_healthy_ledger_latency
                .unwrap_or(DEFAULT_MAX_HEALTHY_LEDGER_LATENCY),
            max_ledger_entry_write_batch,
            retry: self.retry.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PASSPHRASE: &str = "Test SDF Network ; September 2015";

    #[test]
    fn test_builder_missing_passphrase() {
        let result = RpcCoreConfigBuilder::new().build();
        assert!(matches!(result, Err(RpcCoreError::Config(_))));

        let blank = RpcCoreConfigBuilder::new()
            .with_network_passphrase("   ")
            .build();
        assert!(blank.is_err());
    }

    #[test]
    fn test_builder_defaults() -> Result<()> {
        let config = RpcCoreConfigBuilder::new()
            .with_network_passphrase(PASSPHRASE)
            .build()?;

        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.event_retention_window, DEFAULT_EVENT_RETENTION_WINDOW);
        assert_eq!(
            config.transaction_retention_window,
            DEFAULT_TRANSACTION_RETENTION_WINDOW
        );
        assert_eq!(config.ingestion_batch_size, 1);
        assert_eq!(config.ingestion_timeout, DEFAULT_INGESTION_TIMEOUT);
        assert!(config.preflight_worker_count >= 1);
        assert!(config.preflight_queue_capacity >= 1);
        assert_eq!(config.default_events_limit, 100);
        assert_eq!(config.max_events_limit, 10_000);
        assert_eq!(config.max_ledger_entry_write_batch, 150);
        assert_eq!(config.retry, RetryConfig::default());
        Ok(())
    }

    #[test]
    fn test_zero_retention_window_falls_back_to_default() -> Result<()> {
        let config = RpcCoreConfigBuilder::new()
            .with_network_passphrase(PASSPHRASE)
            .with_event_retention_window(0)
            .with_transaction_retention_window(0)
            .build()?;

        assert_eq!(config.event_retention_window, DEFAULT_EVENT_RETENTION_WINDOW);
        assert_eq!(
            config.transaction_retention_window,
            DEFAULT_TRANSACTION_RETENTION_WINDOW
        );
        Ok(())
    }

    #[test]
    fn test_replay_depth_is_larger_window() -> Result<()> {
        let config = RpcCoreConfigBuilder::new()
            .with_network_passphrase(PASSPHRASE)
            .with_event_retention_window(10)
            .with_transaction_retention_window(25)
            .build()?;
        assert_eq!(config.replay_depth(), 25);
        assert_eq!(config.event_retention_window, 10);
        assert_eq!(config.transaction_retention_window, 25);
        Ok(())
    }

    #[test]
    fn test_rejects_zero_sizes() {
        let zero_batch = RpcCoreConfigBuilder::new()
            .with_network_passphrase(PASSPHRASE)
            .with_batch_size(0)
            .build();
        assert!(zero_batch.is_err());

        let zero_workers = RpcCoreConfigBuilder::new()
            .with_network_passphrase(PASSPHRASE)
            .with_preflight_workers(0)
            .build();
        assert!(zero_workers.is_err());

        let zero_queue = RpcCoreConfigBuilder::new()
            .with_network_passphrase(PASSPHRASE)
            .with_preflight_queue_capacity(0)
            .build();
        assert!(zero_queue.is_err());

        let zero_timeout = RpcCoreConfigBuilder::new()
            .with_network_passphrase(PASSPHRASE)
            .with_ingestion_timeout(Duration::ZERO)
            .build();
        assert!(zero_timeout.is_err());
    }

    #[test]
    fn test_default_events_limit_cannot_exceed_max() {
        let result = RpcCoreConfigBuilder::new()
            .with_network_passphrase(PASSPHRASE)
            .with_default_events_limit(500)
            .with_max_events_limit(100)
            .build();

        match result {
            Err(RpcCoreError::Config(msg)) => assert!(msg.contains("cannot exceed")),
            other => panic!("Expected config error, got {other:?}"),
        }
    }
}
