//! Moving one batch of changes from the master log onto the slave
//!
//! ```text
//! master change log ──cursor──► staging ──► history ──► replay ──► status
//!                                   └──────── one slave transaction ──────┘
//! ```
//!
//! The slave transaction is the unit of atomicity. Master reads are
//! read-only and can be reissued, so a failed batch is simply rolled back and
//! retried from the same boundary.

use crate::snapshot::Snapshot;
use crate::source::{ClusterId, TransactionLogSource, XidRange};
use crate::store::{SlaveStatus, SlaveStore, SlaveTransaction};
use crate::Result;
use chrono::Utc;
use std::sync::Arc;

/// Default number of change rows fetched per master round trip
pub const DEFAULT_FETCH_SIZE: usize = 50;

/// Outcome of a committed batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Rows copied into the staging buffer
    pub staged: u64,
    /// Staged rows dropped because their table is not replicated here
    pub discarded: u64,
    /// Rows replayed against slave tables
    pub applied: u64,
    /// Partition the batch was recorded in, if one existed
    pub log_id: Option<i64>,
    /// Slave transaction that committed the batch
    pub slave_xid: i64,
}

/// Stages, replays and records one snapshot's worth of changes atomically
pub struct ReplicationApplier<M: ?Sized> {
    master: Arc<M>,
    cluster: ClusterId,
    fetch_size: usize,
}

impl<M> ReplicationApplier<M>
where
    M: TransactionLogSource + ?Sized,
{
    /// Create an applier for one cluster
    pub fn new(master: Arc<M>, cluster: ClusterId) -> Self {
        Self {
            master,
            cluster,
            fetch_size: DEFAULT_FETCH_SIZE,
        }
    }

    /// Set the master fetch size
    pub fn with_fetch_size(mut self, fetch_size: usize) -> Self {
        self.fetch_size = fetch_size.max(1);
        self
    }

    /// Advance `slave` from `last_applied` to `target`.
    ///
    /// Either the whole batch commits or the slave is left untouched. On error
    /// the caller keeps `last_applied` and retries later.
    pub async fn apply<S>(
        &self,
        slave: &S,
        last_applied: &Snapshot,
        target: &Snapshot,
    ) -> Result<ApplyReport>
    where
        S: SlaveStore,
    {
        tracing::trace!(
            cluster = self.cluster,
            from = %last_applied,
            to = %target,
            "Processing next snapshot"
        );

        let mut txn = slave.begin().await?;
        match self.run(&mut txn, last_applied, target).await {
            Ok(report) => {
                txn.commit().await?;
                Ok(report)
            }
            Err(e) => {
                if let Err(rollback_err) = txn.rollback().await {
                    tracing::error!(
                        cluster = self.cluster,
                        target = %target.current_xid(),
                        error = %rollback_err,
                        "Unable to roll back snapshot transaction"
                    );
                }
                Err(e)
            }
        }
    }

    async fn run<T>(
        &self,
        txn: &mut T,
        last_applied: &Snapshot,
        target: &Snapshot,
    ) -> Result<ApplyReport>
    where
        T: SlaveTransaction,
    {
        let mut report = ApplyReport {
            staged: self.collect(txn, last_applied, target).await?,
            ..Default::default()
        };

        report.log_id = txn.current_log_id(self.cluster).await?;
        match report.log_id {
            Some(log_id) => txn.record_snapshot(self.cluster, log_id, target).await?,
            None => tracing::error!(
                cluster = self.cluster,
                target = %target.current_xid(),
                "Unable to determine current log partition, continuing without history"
            ),
        }

        for table in txn.staged_tables().await? {
            if !txn.is_table_replicated(&table).await? {
                let dropped = txn.discard_staged(&table).await?;
                tracing::trace!(cluster = self.cluster, table = %table, dropped, "Table not replicated here");
                report.discarded += dropped;
            }
        }

        if let Some(log_id) = report.log_id {
            txn.copy_staged_to_history(self.cluster, log_id).await?;
        }

        txn.enter_restricted_mode().await?;
        report.applied = txn.apply_staged().await?;
        txn.exit_restricted_mode().await?;
        txn.drop_staging().await?;

        report.slave_xid = txn.local_transaction_id().await?;
        txn.update_status(&SlaveStatus {
            cluster: self.cluster,
            slave_xid: report.slave_xid,
            snapshot: target.clone(),
            updated_at: Utc::now(),
        })
        .await?;

        Ok(report)
    }

    /// Stream the candidate rows from the master and stage the ones that
    /// committed between the two snapshots.
    async fn collect<T>(&self, txn: &mut T, last_applied: &Snapshot, target: &Snapshot) -> Result<u64>
    where
        T: SlaveTransaction,
    {
        let range = XidRange::between(last_applied, target);
        let mut cursor = self
            .master
            .open_changes(self.cluster, range, self.fetch_size)
            .await?;

        let mut staged = 0;
        loop {
            let batch = cursor.next_batch().await?;
            if batch.is_empty() {
                break;
            }
            for change in &batch {
                if last_applied.transaction_id_ge(change.xid) && target.transaction_id_lt(change.xid) {
                    txn.stage(change).await?;
                    staged += 1;
                } else {
                    tracing::trace!(
                        cluster = self.cluster,
                        row_id = change.row_id,
                        xid = %change.xid,
                        "Transaction not between snapshots"
                    );
                }
            }
        }

        tracing::debug!(cluster = self.cluster, staged, "Staged changes from master");
        Ok(staged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::{ChangeRecord, CommandKind};
    use crate::memory::{FailPoint, MemoryMaster, MemorySlave};
    use crate::xid::TransactionId;

    const CLUSTER: ClusterId = 1;

    fn snap(current: u32, min: u32, max: u32, in_flight: &str) -> Snapshot {
        Snapshot::new(
            TransactionId::new(current),
            TransactionId::new(min),
            TransactionId::new(max),
            in_flight,
        )
        .unwrap()
    }

    fn change(row_id: i64, xid: u32, table: &str) -> ChangeRecord {
        ChangeRecord::new(
            row_id,
            TransactionId::new(xid),
            CommandKind::Insert,
            table,
            format!("row{}", row_id),
        )
    }

    fn setup() -> (Arc<MemoryMaster>, MemorySlave, Snapshot) {
        let master = Arc::new(MemoryMaster::new());
        let slave = MemorySlave::new();
        let last = snap(100, 90, 99, "");
        slave.bootstrap(CLUSTER, last.clone());
        slave.set_current_log(CLUSTER, 1);
        slave.mark_replicated("public.accounts");
        (master, slave, last)
    }

    #[tokio::test]
    async fn test_replays_in_row_id_order() {
        let (master, slave, last) = setup();
        master.log_change(CLUSTER, change(5, 120, "public.accounts"));
        master.log_change(CLUSTER, change(1, 130, "public.accounts"));
        master.log_change(CLUSTER, change(3, 110, "public.accounts"));
        let target = snap(150, 140, 149, "");

        let applier = ReplicationApplier::new(master, CLUSTER);
        let report = applier.apply(&slave, &last, &target).await.unwrap();

        assert_eq!(report.applied, 3);
        let order: Vec<i64> = slave.applied().iter().map(|c| c.row_id).collect();
        assert_eq!(order, vec![1, 3, 5]);
    }

    #[tokio::test]
    async fn test_in_flight_rows_wait_for_next_batch() {
        let (master, slave, last) = setup();
        master.log_change(CLUSTER, change(1, 120, "public.accounts"));
        master.log_change(CLUSTER, change(2, 145, "public.accounts"));
        let target = snap(150, 145, 145, "145");

        let applier = ReplicationApplier::new(master.clone(), CLUSTER);
        let report = applier.apply(&slave, &last, &target).await.unwrap();
        assert_eq!(report.staged, 1);

        let next = snap(160, 158, 159, "");
        let report = applier.apply(&slave, &target, &next).await.unwrap();
        assert_eq!(report.staged, 1);
        let order: Vec<i64> = slave.applied().iter().map(|c| c.row_id).collect();
        assert_eq!(order, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_small_fetch_size_streams_everything() {
        let (master, slave, last) = setup();
        for row in 1..=7 {
            master.log_change(CLUSTER, change(row, 100 + row as u32, "public.accounts"));
        }
        let target = snap(150, 140, 149, "");

        let applier = ReplicationApplier::new(master, CLUSTER).with_fetch_size(2);
        let report = applier.apply(&slave, &last, &target).await.unwrap();
        assert_eq!(report.staged, 7);
        assert_eq!(report.applied, 7);
    }

    #[tokio::test]
    async fn test_missing_log_partition_still_applies() {
        let master = Arc::new(MemoryMaster::new());
        let slave = MemorySlave::new();
        let last = snap(100, 90, 99, "");
        slave.bootstrap(CLUSTER, last.clone());
        slave.mark_replicated("public.accounts");
        master.log_change(CLUSTER, change(1, 120, "public.accounts"));
        let target = snap(150, 140, 149, "");

        let applier = ReplicationApplier::new(master, CLUSTER);
        let report = applier.apply(&slave, &last, &target).await.unwrap();
        assert_eq!(report.log_id, None);
        assert_eq!(report.applied, 1);
        assert!(slave.state().change_history.is_empty());
        assert_eq!(slave.status(CLUSTER).unwrap().snapshot, target);
    }

    #[tokio::test]
    async fn test_every_failure_point_leaves_slave_untouched() {
        for point in FailPoint::ALL {
            let (master, slave, last) = setup();
            master.log_change(CLUSTER, change(1, 120, "public.accounts"));
            master.log_change(CLUSTER, change(2, 125, "public.audit"));
            let target = snap(150, 140, 149, "");
            let before = slave.state();

            slave.fail_at(Some(point));
            let applier = ReplicationApplier::new(master, CLUSTER);
            let result = applier.apply(&slave, &last, &target).await;

            assert!(result.is_err(), "{:?} should fail", point);
            assert_eq!(slave.state(), before, "{:?} leaked state", point);
        }
    }

    #[tokio::test]
    async fn test_rollback_failure_keeps_original_error() {
        let (master, slave, last) = setup();
        master.log_change(CLUSTER, change(1, 120, "public.accounts"));
        let before = slave.state();
        slave.fail_at(Some(FailPoint::Apply));
        slave.fail_rollback(true);

        let applier = ReplicationApplier::new(master, CLUSTER);
        let err = applier
            .apply(&slave, &last, &snap(150, 140, 149, ""))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Apply"));
        assert_eq!(slave.state(), before);
    }

    #[tokio::test]
    async fn test_master_failure_rolls_back() {
        let (master, slave, last) = setup();
        master.fail_change_queries(true);
        let before = slave.state();

        let applier = ReplicationApplier::new(master, CLUSTER);
        assert!(applier.apply(&slave, &last, &snap(150, 140, 149, "")).await.is_err());
        assert_eq!(slave.state(), before);
    }
}
