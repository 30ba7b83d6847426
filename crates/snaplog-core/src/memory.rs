//! In-memory master and slave stores
//!
//! Used by the test suites and for embedding the engine without a database.
//! The slave copies its whole state when a transaction begins and swaps the
//! copy back in on commit, so a rolled-back batch leaves no trace. Failures
//! can be injected at every step of the apply protocol.

use crate::change::ChangeRecord;
use crate::log_switch::LogSwitcher;
use crate::snapshot::Snapshot;
use crate::source::{
    ChangeCursor, ClusterId, SnapshotSource, SnapshotWindow, TransactionLogSource, XidRange,
};
use crate::store::{SlaveStatus, SlaveStore, SlaveTransaction};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Debug, Default)]
struct ClusterLog {
    snapshots: Vec<Snapshot>,
    changes: Vec<ChangeRecord>,
}

/// Master snapshot and change logs held in memory
#[derive(Debug, Default)]
pub struct MemoryMaster {
    logs: RwLock<HashMap<ClusterId, ClusterLog>>,
    fail_snapshots: AtomicBool,
    fail_changes: AtomicBool,
    snapshot_queries: AtomicU64,
}

impl MemoryMaster {
    /// Create an empty master
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a snapshot to a cluster's snapshot log
    pub fn log_snapshot(&self, cluster: ClusterId, snapshot: Snapshot) {
        self.logs
            .write()
            .entry(cluster)
            .or_default()
            .snapshots
            .push(snapshot);
    }

    /// Append a change to a cluster's change log
    pub fn log_change(&self, cluster: ClusterId, change: ChangeRecord) {
        self.logs
            .write()
            .entry(cluster)
            .or_default()
            .changes
            .push(change);
    }

    /// Make snapshot lookups fail
    pub fn fail_snapshot_queries(&self, fail: bool) {
        self.fail_snapshots.store(fail, Ordering::SeqCst);
    }

    /// Make change cursors fail to open
    pub fn fail_change_queries(&self, fail: bool) {
        self.fail_changes.store(fail, Ordering::SeqCst);
    }

    /// Number of snapshot lookups served so far
    pub fn snapshot_queries(&self) -> u64 {
        self.snapshot_queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotSource for MemoryMaster {
    async fn latest_snapshot(
        &self,
        cluster: ClusterId,
        window: SnapshotWindow,
    ) -> Result<Option<Snapshot>> {
        self.snapshot_queries.fetch_add(1, Ordering::SeqCst);
        if self.fail_snapshots.load(Ordering::SeqCst) {
            return Err(Error::storage("master snapshot log unavailable"));
        }
        let logs = self.logs.read();
        Ok(logs
            .get(&cluster)
            .and_then(|log| window.most_advanced(&log.snapshots))
            .cloned())
    }
}

#[async_trait]
impl TransactionLogSource for MemoryMaster {
    async fn open_changes(
        &self,
        cluster: ClusterId,
        range: XidRange,
        fetch_size: usize,
    ) -> Result<Box<dyn ChangeCursor>> {
        if self.fail_changes.load(Ordering::SeqCst) {
            return Err(Error::storage("master change log unavailable"));
        }
        let rows: VecDeque<ChangeRecord> = self
            .logs
            .read()
            .get(&cluster)
            .map(|log| {
                log.changes
                    .iter()
                    .filter(|c| range.contains(c.xid))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(Box::new(MemoryChangeCursor {
            rows,
            fetch_size: fetch_size.max(1),
        }))
    }
}

struct MemoryChangeCursor {
    rows: VecDeque<ChangeRecord>,
    fetch_size: usize,
}

#[async_trait]
impl ChangeCursor for MemoryChangeCursor {
    async fn next_batch(&mut self) -> Result<Vec<ChangeRecord>> {
        let n = self.fetch_size.min(self.rows.len());
        Ok(self.rows.drain(..n).collect())
    }
}

/// Step of the apply protocol at which [`MemorySlave`] injects a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    /// Staging a change
    Stage,
    /// Appending to the snapshot history
    RecordSnapshot,
    /// Checking table eligibility
    Filter,
    /// Copying staged rows into the change-log history
    CopyHistory,
    /// Entering restricted-write mode
    EnterRestricted,
    /// Replaying staged rows
    Apply,
    /// Leaving restricted-write mode
    ExitRestricted,
    /// Updating the status record
    UpdateStatus,
    /// Committing
    Commit,
}

impl FailPoint {
    /// Every failure point, in protocol order
    pub const ALL: [FailPoint; 9] = [
        FailPoint::Stage,
        FailPoint::RecordSnapshot,
        FailPoint::Filter,
        FailPoint::CopyHistory,
        FailPoint::EnterRestricted,
        FailPoint::Apply,
        FailPoint::ExitRestricted,
        FailPoint::UpdateStatus,
        FailPoint::Commit,
    ];
}

/// Durable slave contents
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlaveState {
    /// Status record per cluster
    pub statuses: HashMap<ClusterId, SlaveStatus>,
    /// Current log partition per cluster
    pub current_logs: HashMap<ClusterId, i64>,
    /// Snapshot history per (cluster, partition)
    pub snapshot_history: BTreeMap<(ClusterId, i64), Vec<Snapshot>>,
    /// Change-log history per (cluster, partition)
    pub change_history: BTreeMap<(ClusterId, i64), Vec<ChangeRecord>>,
    /// Tables carrying the replication marker
    pub replicated_tables: HashSet<String>,
    /// Changes replayed against slave tables, in replay order
    pub applied: Vec<ChangeRecord>,
    /// Last slave-local transaction id handed out
    pub last_xid: i64,
}

#[derive(Debug, Default)]
struct MemorySlaveInner {
    state: Mutex<SlaveState>,
    fail_point: Mutex<Option<FailPoint>>,
    fail_rollback: AtomicBool,
    transactions: AtomicU64,
    closed: AtomicBool,
}

/// Slave store held in memory. Clones share the same store.
#[derive(Debug, Clone, Default)]
pub struct MemorySlave {
    inner: Arc<MemorySlaveInner>,
}

impl MemorySlave {
    /// Create an empty slave
    pub fn new() -> Self {
        Self::default()
    }

    /// Write the initial status record for a cluster
    pub fn bootstrap(&self, cluster: ClusterId, snapshot: Snapshot) {
        self.inner.state.lock().statuses.insert(
            cluster,
            SlaveStatus {
                cluster,
                slave_xid: 0,
                snapshot,
                updated_at: Utc::now(),
            },
        );
    }

    /// Set the current log partition for a cluster
    pub fn set_current_log(&self, cluster: ClusterId, log_id: i64) {
        self.inner.state.lock().current_logs.insert(cluster, log_id);
    }

    /// Attach the replication marker to a table
    pub fn mark_replicated(&self, table: impl Into<String>) {
        self.inner.state.lock().replicated_tables.insert(table.into());
    }

    /// Inject a failure into subsequent transactions
    pub fn fail_at(&self, point: Option<FailPoint>) {
        *self.inner.fail_point.lock() = point;
    }

    /// Make rollbacks report an error
    pub fn fail_rollback(&self, fail: bool) {
        self.inner.fail_rollback.store(fail, Ordering::SeqCst);
    }

    /// Snapshot of the committed state
    pub fn state(&self) -> SlaveState {
        self.inner.state.lock().clone()
    }

    /// Committed status record for a cluster
    pub fn status(&self, cluster: ClusterId) -> Option<SlaveStatus> {
        self.inner.state.lock().statuses.get(&cluster).cloned()
    }

    /// Committed replayed changes, in replay order
    pub fn applied(&self) -> Vec<ChangeRecord> {
        self.inner.state.lock().applied.clone()
    }

    /// Number of transactions begun
    pub fn transactions_started(&self) -> u64 {
        self.inner.transactions.load(Ordering::SeqCst)
    }

    /// Whether [`SlaveStore::close`] was called
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SlaveStore for MemorySlave {
    type Transaction = MemorySlaveTransaction;

    async fn load_status(&self, cluster: ClusterId) -> Result<Option<SlaveStatus>> {
        Ok(self.status(cluster))
    }

    async fn begin(&self) -> Result<MemorySlaveTransaction> {
        if self.is_closed() {
            return Err(Error::storage("slave store is closed"));
        }
        self.inner.transactions.fetch_add(1, Ordering::SeqCst);
        Ok(MemorySlaveTransaction {
            store: self.inner.clone(),
            working: self.state(),
            staged: Vec::new(),
            restricted: false,
            fail_point: *self.inner.fail_point.lock(),
        })
    }

    async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }
}

/// Copy-on-begin transaction over a [`MemorySlave`]
#[derive(Debug)]
pub struct MemorySlaveTransaction {
    store: Arc<MemorySlaveInner>,
    working: SlaveState,
    staged: Vec<ChangeRecord>,
    restricted: bool,
    fail_point: Option<FailPoint>,
}

impl MemorySlaveTransaction {
    fn check(&self, point: FailPoint) -> Result<()> {
        if self.fail_point == Some(point) {
            return Err(Error::storage(format!("injected failure at {:?}", point)));
        }
        Ok(())
    }
}

#[async_trait]
impl SlaveTransaction for MemorySlaveTransaction {
    async fn stage(&mut self, change: &ChangeRecord) -> Result<()> {
        self.check(FailPoint::Stage)?;
        self.staged.push(change.clone());
        Ok(())
    }

    async fn current_log_id(&mut self, cluster: ClusterId) -> Result<Option<i64>> {
        Ok(self.working.current_logs.get(&cluster).copied())
    }

    async fn record_snapshot(
        &mut self,
        cluster: ClusterId,
        log_id: i64,
        snapshot: &Snapshot,
    ) -> Result<()> {
        self.check(FailPoint::RecordSnapshot)?;
        self.working
            .snapshot_history
            .entry((cluster, log_id))
            .or_default()
            .push(snapshot.clone());
        Ok(())
    }

    async fn staged_tables(&mut self) -> Result<Vec<String>> {
        let mut tables: Vec<String> = self.staged.iter().map(|c| c.table.clone()).collect();
        tables.sort();
        tables.dedup();
        Ok(tables)
    }

    async fn is_table_replicated(&mut self, table: &str) -> Result<bool> {
        self.check(FailPoint::Filter)?;
        Ok(self.working.replicated_tables.contains(table))
    }

    async fn discard_staged(&mut self, table: &str) -> Result<u64> {
        let before = self.staged.len();
        self.staged.retain(|c| c.table != table);
        Ok((before - self.staged.len()) as u64)
    }

    async fn copy_staged_to_history(&mut self, cluster: ClusterId, log_id: i64) -> Result<u64> {
        self.check(FailPoint::CopyHistory)?;
        self.working
            .change_history
            .entry((cluster, log_id))
            .or_default()
            .extend(self.staged.iter().cloned());
        Ok(self.staged.len() as u64)
    }

    async fn enter_restricted_mode(&mut self) -> Result<()> {
        self.check(FailPoint::EnterRestricted)?;
        self.restricted = true;
        Ok(())
    }

    async fn apply_staged(&mut self) -> Result<u64> {
        self.check(FailPoint::Apply)?;
        if !self.restricted && !self.staged.is_empty() {
            return Err(Error::storage(
                "write to replicated table denied outside restricted mode",
            ));
        }
        self.staged.sort_by_key(|c| c.row_id);
        self.working.applied.extend(self.staged.iter().cloned());
        Ok(self.staged.len() as u64)
    }

    async fn exit_restricted_mode(&mut self) -> Result<()> {
        self.check(FailPoint::ExitRestricted)?;
        self.restricted = false;
        Ok(())
    }

    async fn drop_staging(&mut self) -> Result<()> {
        self.staged.clear();
        Ok(())
    }

    async fn local_transaction_id(&mut self) -> Result<i64> {
        self.working.last_xid += 1;
        Ok(self.working.last_xid)
    }

    async fn update_status(&mut self, status: &SlaveStatus) -> Result<()> {
        self.check(FailPoint::UpdateStatus)?;
        match self.working.statuses.get_mut(&status.cluster) {
            Some(existing) => {
                *existing = status.clone();
                Ok(())
            }
            None => Err(Error::storage(format!(
                "no status record for cluster {}",
                status.cluster
            ))),
        }
    }

    async fn commit(self) -> Result<()> {
        self.check(FailPoint::Commit)?;
        *self.store.state.lock() = self.working;
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        if self.store.fail_rollback.load(Ordering::SeqCst) {
            return Err(Error::storage("rollback failed"));
        }
        Ok(())
    }
}

/// Log switcher that counts rotations and can be told to fail
#[derive(Debug, Clone, Default)]
pub struct MemoryLogSwitcher {
    rotations: Arc<AtomicU64>,
    failing: Arc<AtomicBool>,
}

impl MemoryLogSwitcher {
    /// Create a switcher
    pub fn new() -> Self {
        Self::default()
    }

    /// Make rotations fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Rotation attempts so far
    pub fn rotations(&self) -> u64 {
        self.rotations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LogSwitcher for MemoryLogSwitcher {
    async fn rotate(&self) -> Result<()> {
        self.rotations.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::storage("log switch failed"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::CommandKind;
    use crate::xid::TransactionId;

    fn change(row_id: i64, xid: u32) -> ChangeRecord {
        ChangeRecord::new(row_id, TransactionId::new(xid), CommandKind::Delete, "public.t", "")
    }

    #[tokio::test]
    async fn test_cursor_respects_range_and_fetch_size() {
        let master = MemoryMaster::new();
        for (row, xid) in [(1, 95), (2, 100), (3, 120), (4, 150), (5, 130)] {
            master.log_change(1, change(row, xid));
        }
        let range = XidRange {
            low: TransactionId::new(100),
            high: TransactionId::new(150),
        };
        let mut cursor = master.open_changes(1, range, 2).await.unwrap();

        let first = cursor.next_batch().await.unwrap();
        assert_eq!(first.iter().map(|c| c.row_id).collect::<Vec<_>>(), vec![2, 3]);
        let second = cursor.next_batch().await.unwrap();
        assert_eq!(second.iter().map(|c| c.row_id).collect::<Vec<_>>(), vec![5]);
        assert!(cursor.next_batch().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rollback_discards_working_copy() {
        let slave = MemorySlave::new();
        slave.set_current_log(1, 3);
        let before = slave.state();

        let mut txn = slave.begin().await.unwrap();
        txn.stage(&change(1, 120)).await.unwrap();
        txn.copy_staged_to_history(1, 3).await.unwrap();
        txn.rollback().await.unwrap();

        assert_eq!(slave.state(), before);
        assert_eq!(slave.transactions_started(), 1);
    }

    #[tokio::test]
    async fn test_apply_requires_restricted_mode() {
        let slave = MemorySlave::new();
        let mut txn = slave.begin().await.unwrap();
        txn.stage(&change(1, 120)).await.unwrap();
        assert!(txn.apply_staged().await.is_err());

        txn.enter_restricted_mode().await.unwrap();
        assert_eq!(txn.apply_staged().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_closed_store_refuses_transactions() {
        let slave = MemorySlave::new();
        slave.close().await;
        assert!(slave.is_closed());
        assert!(slave.begin().await.is_err());
    }
}
