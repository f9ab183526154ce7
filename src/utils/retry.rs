//! Retry support for the ingestion pipeline.
//!
//! This module provides:
//! - [`compute_backoff`] - exponential-backoff delay calculator with optional jitter.
//! - [`is_retryable`] - classifies an [`RpcCoreError`] as an ingestion-retryable failure.
//! - [`RetryObserver`] - diagnostic callback invoked on every retried failure.
//! - [`Backoff`] - per-range attempt counter that resets on progress.

use crate::config::RetryConfig;
use crate::utils::error::RpcCoreError;
use std::sync::Arc;
use std::time::Duration;

/// Callback invoked with the failure and the delay before the next attempt.
///
/// Diagnostic only: the pipeline does its own recovery regardless of what the
/// observer does.
pub type RetryObserver = Arc<dyn Fn(&RpcCoreError, Duration) + Send + Sync>;

// ─────────────────────────────────────────────────────────────────────────────
// Backoff calculation
// ─────────────────────────────────────────────────────────────────────────────

/// Computes the delay before the next retry.
///
/// `attempt` is 1-indexed: `attempt = 1` is the delay before the first retry,
/// `attempt = 2` before the second, etc.
///
/// Formula: `delay = initial_backoff_ms * backoff_multiplier^(attempt - 1)`,
/// capped at `max_backoff_ms`, then ±25 % jitter if enabled.
#[must_use]
pub fn compute_backoff(cfg: &RetryConfig, attempt: u32) -> Duration {
    let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
    let base = cfg.initial_backoff_ms as f64 * cfg.backoff_multiplier.powi(exponent);
    let capped = base.min(cfg.max_backoff_ms as f64);

    let ms = if cfg.jitter {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos();
        // jitter factor in [0.75, 1.25]
        let factor = 0.75 + f64::from(nanos % 1_000_000) / 1_000_000.0 * 0.5;
        (capped * factor).min(cfg.max_backoff_ms as f64)
    } else {
        capped
    };

    Duration::from_millis(ms as u64)
}

// ─────────────────────────────────────────────────────────────────────────────
// Error classification
// ─────────────────────────────────────────────────────────────────────────────

/// Returns `true` if `err` is a failure the ingestion pipeline retries.
///
/// Ingestion never skips a ledger, so every failure on the fetch/persist/index
/// path is retried. Only caller-facing outcomes and configuration mistakes are
/// excluded.
///
/// | Error variant            | Retried | Reason                                      |
/// |--------------------------|---------|---------------------------------------------|
/// | `Backend`                | ✅      | Backend restart or transport failure        |
/// | `Database`               | ✅      | Lock contention, disk hiccup                |
/// | `Decode`                 | ✅      | Indistinguishable from a glitch until re-fetch |
/// | `OutOfOrder` / `Gap`     | ✅      | Backend delivered the wrong ledger          |
/// | `Timeout`                | ✅      | Attempt exceeded the ingestion timeout      |
/// | `Internal`               | ✅      | tokio task join noise                       |
/// | `Config` / `EnvVar`      | ❌      | Programmer error                            |
/// | pool / query outcomes    | ❌      | Returned to RPC callers, never retried here |
#[must_use]
pub fn is_retryable(err: &RpcCoreError) -> bool {
    matches!(
        err,
        RpcCoreError::Backend(_)
            | RpcCoreError::Database(_)
            | RpcCoreError::Decode(_)
            | RpcCoreError::OutOfOrder { .. }
            | RpcCoreError::Gap { .. }
            | RpcCoreError::Timeout(_)
            | RpcCoreError::Internal(_)
    )
}

/// Attempt counter for one ledger range.
///
/// There is no attempt limit; `reset` is called once the range commits.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: RetryConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Records a failure and returns how long to wait before trying again.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        compute_backoff(&self.config, self.attempt)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Failures recorded since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
