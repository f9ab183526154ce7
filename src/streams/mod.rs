//! Ledger sources for the ingestion pipeline.
//!
//! The external ledger producer is consumed two ways: by sequence during
//! catch-up, and through a live feed once the pipeline has reached the head.
//! [`LedgerBackend`] covers both.

use crate::types::LedgerCloseMeta;
use crate::utils::error::Result;
use async_trait::async_trait;

/// Interface to the process that produces canonical ledgers.
#[async_trait]
pub trait LedgerBackend: Send + Sync {
    /// Fetches one ledger by sequence; `None` if it does not exist yet.
    async fn get_ledger(&self, sequence: u32) -> Result<Option<LedgerCloseMeta>>;

    /// Newest ledger sequence the backend has closed.
    async fn latest_sequence(&self) -> Result<u32>;

    /// Opens a live feed whose first ledger should be `from`.
    async fn subscribe(&self, from: u32) -> Result<Box<dyn LedgerFeed>>;

    /// Human-readable name for logging.
    fn backend_name(&self) -> &str {
        "ledger-backend"
    }
}

/// Live, sequential ledger feed.
#[async_trait]
pub trait LedgerFeed: Send {
    /// Waits for the next ledger. `Ok(None)` means the feed ended.
    ///
    /// The caller validates ordering; a feed is not trusted to be contiguous.
    async fn next_ledger(&mut self) -> Result<Option<LedgerCloseMeta>>;
}

pub mod memory;

pub use memory::InMemoryBackend;
