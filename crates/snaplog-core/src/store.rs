//! Slave-side status store and the transaction the applier runs in
//!
//! Everything a [`SlaveTransaction`] does is invisible until `commit`. A
//! dropped or rolled-back transaction leaves the slave exactly as it was.

use crate::Result;
use crate::change::ChangeRecord;
use crate::snapshot::Snapshot;
use crate::source::ClusterId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Per-cluster replication status record kept on the slave
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaveStatus {
    /// Cluster the record belongs to
    pub cluster: ClusterId,
    /// Slave-local transaction that last committed a batch
    pub slave_xid: i64,
    /// Last master snapshot fully applied
    pub snapshot: Snapshot,
    /// Commit time of the last batch
    pub updated_at: DateTime<Utc>,
}

/// Slave store owned by one replication worker
#[async_trait]
pub trait SlaveStore: Send + Sync {
    /// Transaction type returned by [`SlaveStore::begin`]
    type Transaction: SlaveTransaction;

    /// Read the cluster's status record, if one was bootstrapped
    async fn load_status(&self, cluster: ClusterId) -> Result<Option<SlaveStatus>>;

    /// Start the unit of work for one batch
    async fn begin(&self) -> Result<Self::Transaction>;

    /// Release the store's connections
    async fn close(&self);
}

/// One atomic batch on the slave
#[async_trait]
pub trait SlaveTransaction: Send {
    /// Add a change to the staging buffer
    async fn stage(&mut self, change: &ChangeRecord) -> Result<()>;

    /// Current log partition for the cluster, if any
    async fn current_log_id(&mut self, cluster: ClusterId) -> Result<Option<i64>>;

    /// Append a snapshot boundary to a partition's snapshot history
    async fn record_snapshot(
        &mut self,
        cluster: ClusterId,
        log_id: i64,
        snapshot: &Snapshot,
    ) -> Result<()>;

    /// Distinct tables referenced by staged changes
    async fn staged_tables(&mut self) -> Result<Vec<String>>;

    /// Whether the slave replicates `table`
    async fn is_table_replicated(&mut self, table: &str) -> Result<bool>;

    /// Drop staged changes targeting `table`; returns how many were dropped
    async fn discard_staged(&mut self, table: &str) -> Result<u64>;

    /// Copy staged changes into a partition's change-log history
    async fn copy_staged_to_history(&mut self, cluster: ClusterId, log_id: i64) -> Result<u64>;

    /// Suspend write protection on replicated tables
    async fn enter_restricted_mode(&mut self) -> Result<()>;

    /// Replay staged changes in row-id order; returns how many were applied
    async fn apply_staged(&mut self) -> Result<u64>;

    /// Restore write protection on replicated tables
    async fn exit_restricted_mode(&mut self) -> Result<()>;

    /// Discard the staging buffer
    async fn drop_staging(&mut self) -> Result<()>;

    /// Slave-local id of this transaction
    async fn local_transaction_id(&mut self) -> Result<i64>;

    /// Overwrite the cluster's status record
    async fn update_status(&mut self, status: &SlaveStatus) -> Result<()>;

    /// Make the batch visible
    async fn commit(self) -> Result<()>;

    /// Discard the batch
    async fn rollback(self) -> Result<()>;
}
