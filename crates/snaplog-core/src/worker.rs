//! Replication worker: one long-lived task per slave node
//!
//! Each iteration rotates the slave's log partitions, looks for the next
//! master snapshot and, if one exists, applies it. The worker then sleeps for
//! the configured available/unavailable interval. Shutdown is cooperative:
//! it is observed before an iteration starts and while sleeping, never while
//! a batch is being applied.

use crate::applier::{ApplyReport, ReplicationApplier};
use crate::config::ReplicationConfig;
use crate::log_switch::LogSwitcher;
use crate::resolver::NextSnapshotResolver;
use crate::snapshot::Snapshot;
use crate::source::{ClusterId, SnapshotSource, TransactionLogSource};
use crate::store::SlaveStore;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Lifecycle of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Polling and applying snapshots
    Running,
    /// Shutdown observed, releasing the slave store
    ShuttingDown,
    /// Slave store closed, loop finished
    Stopped,
}

/// Slave node a worker replicates to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    /// Node name used in logs
    pub name: String,
    /// Connection uri (credentials stripped)
    pub uri: String,
}

impl NodeInfo {
    /// Create node info
    pub fn new(name: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uri: uri.into(),
        }
    }
}

/// Worker statistics
#[derive(Debug, Clone, Default)]
pub struct ReplicationStats {
    /// Loop iterations started
    pub iterations: u64,
    /// Snapshots committed on the slave
    pub snapshots_applied: u64,
    /// Change rows staged across all committed batches
    pub changes_staged: u64,
    /// Staged rows dropped for non-replicated tables
    pub changes_discarded: u64,
    /// Change rows replayed on the slave
    pub changes_applied: u64,
    /// Batches rolled back
    pub apply_failures: u64,
    /// Iterations that found no new snapshot
    pub unavailable_polls: u64,
    /// Failed log partition rotations
    pub log_switch_failures: u64,
    /// Time of the last committed batch
    pub last_apply_time: Option<Instant>,
}

/// Result of a single loop iteration
#[derive(Debug)]
pub enum Iteration {
    /// A batch committed
    Applied(ApplyReport),
    /// No snapshot beyond the last applied one
    Unavailable,
    /// A snapshot was found but its batch rolled back
    Failed(Error),
}

impl Iteration {
    /// How long the worker pauses after this iteration
    pub fn pause(&self, config: &ReplicationConfig) -> Duration {
        match self {
            Self::Applied(_) | Self::Failed(_) => config.available_sleep,
            Self::Unavailable => config.unavailable_sleep,
        }
    }
}

struct WorkerShared {
    /// Shutdown requested flag
    shutdown_requested: AtomicBool,
    /// Shutdown signal sender
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    state: Mutex<WorkerState>,
    stats: Mutex<ReplicationStats>,
    last_applied: Mutex<Snapshot>,
}

/// Handle for observing and stopping a worker from another task
#[derive(Clone)]
pub struct WorkerHandle {
    shared: Arc<WorkerShared>,
}

impl WorkerHandle {
    /// Ask the worker to stop after its current iteration
    pub fn shutdown(&self) {
        self.shared.shutdown_requested.store(true, Ordering::SeqCst);
        if let Some(tx) = self.shared.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }
    }

    /// Whether shutdown was requested
    pub fn is_shutdown_requested(&self) -> bool {
        self.shared.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Current lifecycle state
    pub fn state(&self) -> WorkerState {
        *self.shared.state.lock()
    }

    /// Statistics so far
    pub fn stats(&self) -> ReplicationStats {
        self.shared.stats.lock().clone()
    }

    /// Last snapshot committed on the slave
    pub fn last_applied(&self) -> Snapshot {
        self.shared.last_applied.lock().clone()
    }

    fn set_state(&self, state: WorkerState) {
        *self.shared.state.lock() = state;
    }
}

/// Replicates one cluster from the master onto one slave node
pub struct ReplicationWorker<M: ?Sized, S> {
    cluster: ClusterId,
    node: NodeInfo,
    config: ReplicationConfig,
    slave: S,
    resolver: NextSnapshotResolver<M>,
    applier: ReplicationApplier<M>,
    switcher: Box<dyn LogSwitcher>,
    last_applied: Snapshot,
    handle: WorkerHandle,
    shutdown_rx: oneshot::Receiver<()>,
}

impl<M, S> ReplicationWorker<M, S>
where
    M: SnapshotSource + TransactionLogSource + ?Sized,
    S: SlaveStore,
{
    /// Create a worker, reading the last applied snapshot from the slave's
    /// status record.
    ///
    /// Fails with [`Error::Bootstrap`] when the slave was never initialized
    /// for `cluster`.
    pub async fn new(
        cluster: ClusterId,
        node: NodeInfo,
        master: Arc<M>,
        slave: S,
        switcher: Box<dyn LogSwitcher>,
        config: ReplicationConfig,
    ) -> Result<Self> {
        config.validate()?;

        let status = slave
            .load_status(cluster)
            .await?
            .ok_or_else(|| Error::Bootstrap {
                cluster,
                node: node.uri.clone(),
                reason: "no status record; ensure the slave has been properly initialized"
                    .into(),
            })?;
        let last_applied = status.snapshot;

        tracing::info!(
            cluster,
            node = %node.name,
            uri = %node.uri,
            last_applied = %last_applied,
            "Replicating node"
        );

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = WorkerHandle {
            shared: Arc::new(WorkerShared {
                shutdown_requested: AtomicBool::new(false),
                shutdown_tx: Mutex::new(Some(shutdown_tx)),
                state: Mutex::new(WorkerState::Running),
                stats: Mutex::new(ReplicationStats::default()),
                last_applied: Mutex::new(last_applied.clone()),
            }),
        };

        Ok(Self {
            cluster,
            node,
            resolver: NextSnapshotResolver::new(master.clone(), cluster),
            applier: ReplicationApplier::new(master, cluster).with_fetch_size(config.fetch_size),
            config,
            slave,
            switcher,
            last_applied,
            handle,
            shutdown_rx,
        })
    }

    /// Handle for stopping and observing this worker
    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    /// Last snapshot committed on the slave
    pub fn last_applied(&self) -> &Snapshot {
        &self.last_applied
    }

    /// Run one iteration without sleeping
    pub async fn run_once(&mut self) -> Iteration {
        self.handle.shared.stats.lock().iterations += 1;

        if let Err(e) = self.switcher.rotate().await {
            tracing::warn!(
                cluster = self.cluster,
                node = %self.node.name,
                error = %e,
                "Log switch failed, continuing"
            );
            self.handle.shared.stats.lock().log_switch_failures += 1;
        }

        let Some(next) = self.resolver.resolve(&self.last_applied).await else {
            tracing::trace!(cluster = self.cluster, node = %self.node.name, "No next snapshot");
            self.handle.shared.stats.lock().unavailable_polls += 1;
            return Iteration::Unavailable;
        };

        match self
            .applier
            .apply(&self.slave, &self.last_applied, &next)
            .await
        {
            Ok(report) => {
                tracing::debug!(
                    cluster = self.cluster,
                    node = %self.node.name,
                    snapshot = %next.current_xid(),
                    staged = report.staged,
                    discarded = report.discarded,
                    applied = report.applied,
                    "Snapshot applied"
                );
                {
                    let mut stats = self.handle.shared.stats.lock();
                    stats.snapshots_applied += 1;
                    stats.changes_staged += report.staged;
                    stats.changes_discarded += report.discarded;
                    stats.changes_applied += report.applied;
                    stats.last_apply_time = Some(Instant::now());
                }
                *self.handle.shared.last_applied.lock() = next.clone();
                self.last_applied = next;
                Iteration::Applied(report)
            }
            Err(e) => {
                tracing::error!(
                    cluster = self.cluster,
                    node = %self.node.name,
                    from = %self.last_applied.current_xid(),
                    to = %next.current_xid(),
                    error = %e,
                    "Cannot commit snapshot, will retry"
                );
                self.handle.shared.stats.lock().apply_failures += 1;
                Iteration::Failed(e)
            }
        }
    }

    /// Poll until shutdown is requested, then close the slave store
    pub async fn run(mut self) -> ReplicationStats {
        while !self.handle.is_shutdown_requested() {
            let pause = self.run_once().await.pause(&self.config);

            tokio::select! {
                _ = &mut self.shutdown_rx => {
                    tracing::info!(
                        cluster = self.cluster,
                        node = %self.node.name,
                        "Worker interrupted while waiting"
                    );
                    break;
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }

        self.handle.set_state(WorkerState::ShuttingDown);
        self.slave.close().await;
        self.handle.set_state(WorkerState::Stopped);
        tracing::info!(cluster = self.cluster, node = %self.node.name, "Shutdown complete");

        self.handle.stats()
    }
}

impl<M, S> ReplicationWorker<M, S>
where
    M: SnapshotSource + TransactionLogSource + ?Sized + 'static,
    S: SlaveStore + 'static,
{
    /// Run the worker on its own tokio task
    pub fn spawn(self) -> (WorkerHandle, JoinHandle<ReplicationStats>) {
        let handle = self.handle();
        (handle, tokio::spawn(self.run()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::{ChangeRecord, CommandKind};
    use crate::log_switch::NoopLogSwitcher;
    use crate::memory::{FailPoint, MemoryLogSwitcher, MemoryMaster, MemorySlave};
    use crate::xid::TransactionId;

    const CLUSTER: ClusterId = 1;

    fn snap(current: u32, min: u32, max: u32) -> Snapshot {
        Snapshot::new(
            TransactionId::new(current),
            TransactionId::new(min),
            TransactionId::new(max),
            "",
        )
        .unwrap()
    }

    fn node() -> NodeInfo {
        NodeInfo::new("slave1", "postgres://slave1/db")
    }

    async fn worker(
        master: Arc<MemoryMaster>,
        slave: MemorySlave,
        switcher: Box<dyn LogSwitcher>,
    ) -> ReplicationWorker<MemoryMaster, MemorySlave> {
        ReplicationWorker::new(
            CLUSTER,
            node(),
            master,
            slave,
            switcher,
            ReplicationConfig::default()
                .with_available_sleep(Duration::from_millis(10))
                .with_unavailable_sleep(Duration::from_millis(250)),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_missing_status_is_fatal() {
        let result = ReplicationWorker::new(
            CLUSTER,
            node(),
            Arc::new(MemoryMaster::new()),
            MemorySlave::new(),
            Box::new(NoopLogSwitcher),
            ReplicationConfig::default(),
        )
        .await;
        assert!(matches!(result, Err(Error::Bootstrap { cluster: CLUSTER, .. })));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let slave = MemorySlave::new();
        slave.bootstrap(CLUSTER, snap(100, 90, 99));
        let result = ReplicationWorker::new(
            CLUSTER,
            node(),
            Arc::new(MemoryMaster::new()),
            slave,
            Box::new(NoopLogSwitcher),
            ReplicationConfig::default().with_fetch_size(0),
        )
        .await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_unavailable_iteration_skips_applier() {
        let master = Arc::new(MemoryMaster::new());
        master.log_snapshot(CLUSTER, snap(100, 90, 99));
        let slave = MemorySlave::new();
        slave.bootstrap(CLUSTER, snap(100, 90, 99));

        let mut w = worker(master, slave.clone(), Box::new(NoopLogSwitcher)).await;
        let outcome = w.run_once().await;

        assert!(matches!(outcome, Iteration::Unavailable));
        assert_eq!(outcome.pause(&w.config), Duration::from_millis(250));
        assert_eq!(slave.transactions_started(), 0);
        assert_eq!(w.handle().stats().unavailable_polls, 1);
    }

    #[tokio::test]
    async fn test_failed_apply_keeps_last_applied() {
        let master = Arc::new(MemoryMaster::new());
        master.log_snapshot(CLUSTER, snap(150, 140, 149));
        let slave = MemorySlave::new();
        slave.bootstrap(CLUSTER, snap(100, 90, 99));
        slave.fail_at(Some(FailPoint::UpdateStatus));

        let mut w = worker(master, slave.clone(), Box::new(NoopLogSwitcher)).await;
        let outcome = w.run_once().await;
        assert!(matches!(outcome, Iteration::Failed(_)));
        assert_eq!(w.last_applied().current_xid(), TransactionId::new(100));

        slave.fail_at(None);
        let outcome = w.run_once().await;
        assert!(matches!(outcome, Iteration::Applied(_)));
        assert_eq!(w.last_applied().current_xid(), TransactionId::new(150));
        assert_eq!(w.handle().last_applied().current_xid(), TransactionId::new(150));

        let stats = w.handle().stats();
        assert_eq!(stats.apply_failures, 1);
        assert_eq!(stats.snapshots_applied, 1);
    }

    #[tokio::test]
    async fn test_log_switch_failure_is_not_fatal() {
        let master = Arc::new(MemoryMaster::new());
        master.log_snapshot(CLUSTER, snap(150, 140, 149));
        master.log_change(
            CLUSTER,
            ChangeRecord::new(1, TransactionId::new(120), CommandKind::Insert, "public.t", "x"),
        );
        let slave = MemorySlave::new();
        slave.bootstrap(CLUSTER, snap(100, 90, 99));
        slave.mark_replicated("public.t");
        let switcher = MemoryLogSwitcher::new();
        switcher.set_failing(true);

        let mut w = worker(master, slave.clone(), Box::new(switcher.clone())).await;
        assert!(matches!(w.run_once().await, Iteration::Applied(_)));
        assert_eq!(switcher.rotations(), 1);
        assert_eq!(w.handle().stats().log_switch_failures, 1);
        assert_eq!(slave.applied().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_sleep_and_closes_slave() {
        let master = Arc::new(MemoryMaster::new());
        let slave = MemorySlave::new();
        slave.bootstrap(CLUSTER, snap(100, 90, 99));

        let w = worker(master, slave.clone(), Box::new(NoopLogSwitcher)).await;
        let (handle, task) = w.spawn();
        assert_eq!(handle.state(), WorkerState::Running);

        tokio::time::sleep(Duration::from_millis(600)).await;
        handle.shutdown();
        let stats = task.await.unwrap();

        assert_eq!(handle.state(), WorkerState::Stopped);
        assert!(slave.is_closed());
        assert!(stats.iterations >= 2);
        assert_eq!(stats.unavailable_polls, stats.iterations);
    }

    #[tokio::test]
    async fn test_shutdown_before_run_skips_iterations() {
        let master = Arc::new(MemoryMaster::new());
        let slave = MemorySlave::new();
        slave.bootstrap(CLUSTER, snap(100, 90, 99));

        let w = worker(master.clone(), slave.clone(), Box::new(NoopLogSwitcher)).await;
        w.handle().shutdown();
        let stats = w.run().await;

        assert_eq!(stats.iterations, 0);
        assert_eq!(master.snapshot_queries(), 0);
        assert!(slave.is_closed());
    }
}
