//! `ledger-rpc-core` - the serving core of a ledger RPC node.
//!
//! The crate keeps a bounded, queryable in-memory view of recent ledger
//! activity and runs transaction simulations against consistent ledger-state
//! snapshots. Both are fed by a single ingestion task pulling canonical
//! ledgers from an external backend.
//!
//! # Quick Start
//!
//! ```no_run
//! use async_trait::async_trait;
//! use ledger_rpc_core::{
//!     EventIndex, EventQuery, InMemoryBackend, IngestionPipeline, LedgerSnapshot,
//!     RpcCoreConfig, SimulationResult, SimulationWorkerPool, Simulator, SqliteStore,
//!     TransactionIndex,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! struct NoopSimulator;
//!
//! #[async_trait]
//! impl Simulator for NoopSimulator {
//!     async fn simulate(
//!         &self,
//!         _envelope: &[u8],
//!         snapshot: &mut dyn LedgerSnapshot,
//!     ) -> ledger_rpc_core::Result<SimulationResult> {
//!         Ok(SimulationResult {
//!             ledger_sequence: snapshot.sequence(),
//!             ..SimulationResult::default()
//!         })
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // LEDGER_RPC_NETWORK_PASSPHRASE, LEDGER_RPC_DATABASE_URL, ...
//!     let config = RpcCoreConfig::from_env()?;
//!
//!     let store = Arc::new(SqliteStore::open(&config).await?);
//!     let events = Arc::new(EventIndex::from_config(&config));
//!     let transactions = Arc::new(TransactionIndex::from_config(&config));
//!
//!     let ingestion = IngestionPipeline::new(
//!         &config,
//!         Arc::new(InMemoryBackend::new()),
//!         store.clone(),
//!         events.clone(),
//!         transactions.clone(),
//!     )
//!     .spawn();
//!
//!     let pool = SimulationWorkerPool::from_config(&config, store, Arc::new(NoopSimulator))?;
//!     let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
//!     let result = pool.simulate(b"envelope".to_vec(), deadline).await?;
//!     println!("simulated against ledger {:?}", result.ledger_sequence);
//!
//!     let page = events.get_events(&EventQuery::new(1, 100))?;
//!     println!("{} events, latest ledger {:?}", page.events.len(), page.latest_ledger);
//!
//!     pool.close().await;
//!     ingestion.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! 1. **`LedgerBackend`** - external producer of sequential ledgers
//! 2. **`IngestionPipeline`** - catch-up, live feed, retry with backoff
//! 3. **`DurableStore`** - system of record, written before the indices
//! 4. **`EventIndex` / `TransactionIndex`** - `RetentionWindow`s of derived records
//! 5. **`SimulationWorkerPool`** - bounded preflight queue over store snapshots
//!

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

// Public API exports
pub use config::{RetryConfig, RpcCoreConfig, RpcCoreConfigBuilder};
pub use core::events::{
    EventCursor, EventFilter, EventIndex, EventPage, EventQuery, EventRecord, SegmentFilter,
    TopicFilter,
};
pub use core::ingest::{
    IngestionCursor, IngestionHandle, IngestionHealth, IngestionPipeline, LedgerInfo,
    PipelineState,
};
pub use core::preflight::{
    SimulationJob, SimulationResult, SimulationTicket, SimulationWorkerPool, Simulator,
    WorkerPoolState,
};
pub use core::transactions::{TransactionIndex, TransactionLookup, TransactionRecord};
pub use core::window::{LedgerBucket, RetentionWindow, WindowRange};
pub use storage::{DurableStore, LatestLedger, LedgerSnapshot, SqliteStore, StoreTransaction};
pub use streams::{InMemoryBackend, LedgerBackend, LedgerFeed};
pub use types::{
    ContractEvent, ContractId, EventType, Hash32, LedgerCloseMeta, LedgerEntryChange,
    RawTransaction, TransactionHash, TransactionMeta, network_id, transaction_hash,
};
pub use utils::error::{Result, RpcCoreError};
pub use utils::retry::RetryObserver;

// Module declarations
pub mod config;
pub mod core;
pub mod storage;
pub mod streams;
#[cfg(feature = "telemetry")]
pub mod telemetry;
pub mod types;
pub mod utils;
