//! Bounded worker pool for transaction simulation (preflight).
//!
//! Admission is non-blocking: `submit` reserves a queue slot with
//! `try_reserve` and fails with `PoolSaturated` when none is free. Each job
//! carries a [`LedgerSnapshot`] opened at submission time, so a simulation
//! sees the ledger-entry state of exactly one ledger no matter how far
//! ingestion has moved on while the job waited.

use crate::config::RpcCoreConfig;
use crate::storage::{DurableStore, LedgerSnapshot};
use crate::utils::error::{Result, RpcCoreError};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Outcome of simulating one transaction envelope.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SimulationResult {
    /// Ledger whose state the simulation ran against.
    pub ledger_sequence: Option<u32>,
    /// Encoded return value of the invocation.
    pub result: Vec<u8>,
    /// Encoded events the invocation would emit.
    pub events: Vec<Vec<u8>>,
    pub min_resource_fee: i64,
}

/// Deterministic transaction executor supplied by the embedding node.
#[async_trait]
pub trait Simulator: Send + Sync {
    async fn simulate(
        &self,
        envelope: &[u8],
        snapshot: &mut dyn LedgerSnapshot,
    ) -> Result<SimulationResult>;
}

/// A queued simulation request.
pub struct SimulationJob {
    pub envelope: Vec<u8>,
    pub submitted_at: Instant,
    /// The job is discarded if no worker has started it by then.
    pub deadline: Instant,
    snapshot: Box<dyn LedgerSnapshot>,
    reply: oneshot::Sender<Result<SimulationResult>>,
}

impl SimulationJob {
    fn finish(self, outcome: Result<SimulationResult>) {
        // The caller may have dropped its ticket.
        let _ = self.reply.send(outcome);
    }
}

/// Pending result of a submitted job.
#[derive(Debug)]
pub struct SimulationTicket {
    snapshot_sequence: Option<u32>,
    receiver: oneshot::Receiver<Result<SimulationResult>>,
}

impl SimulationTicket {
    /// Ledger the job's snapshot is pinned at.
    pub fn snapshot_sequence(&self) -> Option<u32> {
        self.snapshot_sequence
    }

    /// Waits for the job to finish, be discarded, or be drained by `close`.
    pub async fn wait(self) -> Result<SimulationResult> {
        self.receiver.await.map_err(|_| RpcCoreError::PoolClosed)?
    }
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPoolState {
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub in_flight_count: usize,
    pub queued_count: usize,
    pub closed: bool,
}

/// Decrements the in-flight counter even if the simulator panics.
struct InFlightGuard(Arc<AtomicUsize>);

impl InFlightGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Fixed set of workers sharing one bounded job queue.
pub struct SimulationWorkerPool {
    worker_count: usize,
    queue_capacity: usize,
    store: Arc<dyn DurableStore>,
    sender: RwLock<Option<mpsc::Sender<SimulationJob>>>,
    receiver: Arc<Mutex<mpsc::Receiver<SimulationJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    in_flight: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl SimulationWorkerPool {
    /// Spawns `worker_count` workers on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `RpcCoreError::Config` if either size is zero.
    pub fn new(
        worker_count: usize,
        queue_capacity: usize,
        store: Arc<dyn DurableStore>,
        simulator: Arc<dyn Simulator>,
    ) -> Result<Self> {
        if worker_count == 0 || queue_capacity == 0 {
            return Err(RpcCoreError::Config(
                "Preflight worker count and queue capacity must be positive".to_string(),
            ));
        }

        let (sender, receiver) = mpsc::channel(queue_capacity);
        let receiver = Arc::new(Mutex::new(receiver));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();

        let workers = (0..worker_count)
            .map(|id| {
                tokio::spawn(worker_loop(
                    id,
                    Arc::clone(&receiver),
                    Arc::clone(&simulator),
                    Arc::clone(&in_flight),
                    shutdown.clone(),
                ))
            })
            .collect();

        tracing::info!(worker_count, queue_capacity, "Preflight worker pool started");

        Ok(Self {
            worker_count,
            queue_capacity,
            store,
            sender: RwLock::new(Some(sender)),
            receiver,
            workers: Mutex::new(workers),
            in_flight,
            shutdown,
        })
    }

    pub fn from_config(
        config: &RpcCoreConfig,
        store: Arc<dyn DurableStore>,
        simulator: Arc<dyn Simulator>,
    ) -> Result<Self> {
        Self::new(
            config.preflight_worker_count,
            config.preflight_queue_capacity,
            store,
            simulator,
        )
    }

    /// Queues `envelope` for simulation against the current ledger state.
    ///
    /// Only opening the snapshot may wait; a full queue is reported
    /// immediately.
    ///
    /// # Errors
    ///
    /// - `RpcCoreError::PoolSaturated` if the queue is full
    /// - `RpcCoreError::PoolClosed` after [`close`](Self::close)
    /// - store errors from opening the snapshot
    pub async fn submit(&self, envelope: Vec<u8>, deadline: Instant) -> Result<SimulationTicket> {
        let sender = self.sender.read().clone().ok_or(RpcCoreError::PoolClosed)?;
        let permit = sender.try_reserve().map_err(|err| match err {
            TrySendError::Full(()) => RpcCoreError::PoolSaturated,
            TrySendError::Closed(()) => RpcCoreError::PoolClosed,
        })?;

        let snapshot = self.store.open_snapshot().await?;
        let snapshot_sequence = snapshot.sequence();
        let (reply, receiver) = oneshot::channel();
        permit.send(SimulationJob {
            envelope,
            submitted_at: Instant::now(),
            deadline,
            snapshot,
            reply,
        });

        Ok(SimulationTicket {
            snapshot_sequence,
            receiver,
        })
    }

    /// Submits and waits for the result.
    pub async fn simulate(&self, envelope: Vec<u8>, deadline: Instant) -> Result<SimulationResult> {
        self.submit(envelope, deadline).await?.wait().await
    }

    pub fn state(&self) -> WorkerPoolState {
        let sender = self.sender.read();
        let queued_count = sender
            .as_ref()
            .map_or(0, |s| self.queue_capacity.saturating_sub(s.capacity()));
        WorkerPoolState {
            worker_count: self.worker_count,
            queue_capacity: self.queue_capacity,
            in_flight_count: self.in_flight.load(Ordering::SeqCst),
            queued_count,
            closed: sender.is_none(),
        }
    }

    /// Stops accepting jobs, waits for running simulations and fails every
    /// queued job with `PoolClosed`. Calling it again is a no-op.
    pub async fn close(&self) {
        drop(self.sender.write().take());
        self.shutdown.cancel();

        let workers = std::mem::take(&mut *self.workers.lock().await);
        for worker in workers {
            if let Err(err) = worker.await {
                tracing::warn!(error = %err, "Preflight worker exited abnormally");
            }
        }

        let mut receiver = self.receiver.lock().await;
        receiver.close();
        let mut drained = 0usize;
        while let Some(job) = receiver.recv().await {
            job.finish(Err(RpcCoreError::PoolClosed));
            drained += 1;
        }
        tracing::info!(drained, "Preflight worker pool closed");
    }
}

async fn worker_loop(
    id: usize,
    receiver: Arc<Mutex<mpsc::Receiver<SimulationJob>>>,
    simulator: Arc<dyn Simulator>,
    in_flight: Arc<AtomicUsize>,
    shutdown: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            job = async { receiver.lock().await.recv().await } => job,
        };
        let Some(mut job) = next else {
            break;
        };

        if Instant::now() >= job.deadline {
            tracing::debug!(
                worker = id,
                waited_ms = u64::try_from(job.submitted_at.elapsed().as_millis()).unwrap_or(u64::MAX),
                "Discarding simulation past its deadline"
            );
            job.finish(Err(RpcCoreError::DeadlineExceeded));
            continue;
        }

        let _guard = InFlightGuard::enter(&in_flight);
        let started = Instant::now();
        let outcome = simulator.simulate(&job.envelope, job.snapshot.as_mut()).await;
        tracing::debug!(
            worker = id,
            ledger = ?job.snapshot.sequence(),
            ok = outcome.is_ok(),
            duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Simulation finished"
        );
        job.finish(outcome);
    }
}
