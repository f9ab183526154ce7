//! In-process ledger backend.
//!
//! Ledgers are published with [`InMemoryBackend::publish`]; subscribers wake
//! up through a `watch` channel carrying the latest sequence. Useful for
//! replaying recorded ledgers and for driving the pipeline in tests.

use super::{LedgerBackend, LedgerFeed};
use crate::types::LedgerCloseMeta;
use crate::utils::error::{Result, RpcCoreError};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Clone)]
pub struct InMemoryBackend {
    ledgers: Arc<RwLock<BTreeMap<u32, LedgerCloseMeta>>>,
    latest: Arc<watch::Sender<u32>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        let (latest, _) = watch::channel(0);
        Self {
            ledgers: Arc::new(RwLock::new(BTreeMap::new())),
            latest: Arc::new(latest),
        }
    }

    /// Makes `meta` available and wakes live subscribers.
    pub fn publish(&self, meta: LedgerCloseMeta) {
        let sequence = meta.sequence;
        self.ledgers.write().insert(sequence, meta);
        self.latest.send_if_modified(|latest| {
            if sequence > *latest {
                *latest = sequence;
                true
            } else {
                false
            }
        });
    }

    fn ledger(&self, sequence: u32) -> Option<LedgerCloseMeta> {
        self.ledgers.read().get(&sequence).cloned()
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerBackend for InMemoryBackend {
    async fn get_ledger(&self, sequence: u32) -> Result<Option<LedgerCloseMeta>> {
        Ok(self.ledger(sequence))
    }

    async fn latest_sequence(&self) -> Result<u32> {
        Ok(*self.latest.borrow())
    }

    async fn subscribe(&self, from: u32) -> Result<Box<dyn LedgerFeed>> {
        Ok(Box::new(InMemoryFeed {
            backend: self.clone(),
            next: from,
            latest: self.latest.subscribe(),
        }))
    }

    fn backend_name(&self) -> &str {
        "in-memory"
    }
}

struct InMemoryFeed {
    backend: InMemoryBackend,
    next: u32,
    latest: watch::Receiver<u32>,
}

#[async_trait]
impl LedgerFeed for InMemoryFeed {
    async fn next_ledger(&mut self) -> Result<Option<LedgerCloseMeta>> {
        loop {
            if let Some(meta) = self.backend.ledger(self.next) {
                self.next = self
                    .next
                    .checked_add(1)
                    .ok_or_else(|| RpcCoreError::Backend("ledger sequence overflow".to_string()))?;
                return Ok(Some(meta));
            }
            if self.latest.changed().await.is_err() {
                return Ok(None);
            }
        }
    }
}
