//! Slave-side status store and batch transaction

use crate::sql;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use snaplog_core::{
    ChangeRecord, ClusterId, Error, Result, SlaveStatus, SlaveStore, SlaveTransaction, Snapshot,
};
use sqlx::postgres::PgPool;
use sqlx::{Postgres, Row, Transaction};

/// Slave database holding the status record, history partitions and the
/// replicated tables
#[derive(Clone)]
pub struct PgSlaveStore {
    pool: PgPool,
    schema: String,
}

impl PgSlaveStore {
    /// Wrap an existing slave pool
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }
}

#[async_trait]
impl SlaveStore for PgSlaveStore {
    type Transaction = PgSlaveTransaction;

    async fn load_status(&self, cluster: ClusterId) -> Result<Option<SlaveStatus>> {
        let row = sqlx::query(&sql::select_status(&self.schema))
            .bind(cluster)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::backend)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let snapshot = Snapshot::from_columns(
            row.try_get("master_current_xaction").map_err(Error::backend)?,
            row.try_get("master_min_xaction").map_err(Error::backend)?,
            row.try_get("master_max_xaction").map_err(Error::backend)?,
            row.try_get("master_outstanding_xactions")
                .map_err(Error::backend)?,
        )?;
        let updated_at: Option<DateTime<Utc>> =
            row.try_get("update_time").map_err(Error::backend)?;

        Ok(Some(SlaveStatus {
            cluster,
            slave_xid: row
                .try_get::<Option<i64>, _>("slave_xaction")
                .map_err(Error::backend)?
                .unwrap_or_default(),
            snapshot,
            updated_at: updated_at.unwrap_or_else(Utc::now),
        }))
    }

    async fn begin(&self) -> Result<PgSlaveTransaction> {
        let mut tx = self.pool.begin().await.map_err(Error::backend)?;
        sqlx::query(&sql::create_staging())
            .execute(&mut *tx)
            .await
            .map_err(Error::backend)?;
        Ok(PgSlaveTransaction {
            tx,
            schema: self.schema.clone(),
        })
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// One batch on the slave, backed by a database transaction
pub struct PgSlaveTransaction {
    tx: Transaction<'static, Postgres>,
    schema: String,
}

impl PgSlaveTransaction {
    async fn execute(&mut self, statement: &str) -> Result<u64> {
        let done = sqlx::query(statement)
            .execute(&mut *self.tx)
            .await
            .map_err(Error::backend)?;
        Ok(done.rows_affected())
    }
}

#[async_trait]
impl SlaveTransaction for PgSlaveTransaction {
    async fn stage(&mut self, change: &ChangeRecord) -> Result<()> {
        sqlx::query(&sql::insert_staged())
            .bind(change.row_id)
            .bind(change.xid.as_i64())
            .bind(change.command.code())
            .bind(&change.table)
            .bind(&change.payload)
            .execute(&mut *self.tx)
            .await
            .map_err(Error::backend)?;
        Ok(())
    }

    async fn current_log_id(&mut self, cluster: ClusterId) -> Result<Option<i64>> {
        let row = sqlx::query(&sql::current_log(&self.schema, cluster))
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(Error::backend)?;
        match row {
            Some(row) => row.try_get("id").map_err(Error::backend),
            None => Ok(None),
        }
    }

    async fn record_snapshot(
        &mut self,
        cluster: ClusterId,
        log_id: i64,
        snapshot: &Snapshot,
    ) -> Result<()> {
        sqlx::query(&sql::insert_snapshot_history(&self.schema, cluster, log_id))
            .bind(snapshot.current_xid().as_i64())
            .bind(snapshot.min_xid().as_i64())
            .bind(snapshot.max_xid().as_i64())
            .bind(snapshot.in_flight())
            .execute(&mut *self.tx)
            .await
            .map_err(Error::backend)?;
        Ok(())
    }

    async fn staged_tables(&mut self) -> Result<Vec<String>> {
        let rows = sqlx::query(&sql::staged_tables())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(Error::backend)?;
        rows.iter()
            .map(|r| r.try_get("tabname").map_err(Error::backend))
            .collect()
    }

    async fn is_table_replicated(&mut self, table: &str) -> Result<bool> {
        let row = sqlx::query(sql::table_replicated())
            .bind(table)
            .bind(&self.schema)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(Error::backend)?;
        row.try_get("replicated").map_err(Error::backend)
    }

    async fn discard_staged(&mut self, table: &str) -> Result<u64> {
        let done = sqlx::query(&sql::discard_staged())
            .bind(table)
            .execute(&mut *self.tx)
            .await
            .map_err(Error::backend)?;
        Ok(done.rows_affected())
    }

    async fn copy_staged_to_history(&mut self, cluster: ClusterId, log_id: i64) -> Result<u64> {
        let statement = sql::copy_staged_to_history(&self.schema, cluster, log_id);
        self.execute(&statement).await
    }

    async fn enter_restricted_mode(&mut self) -> Result<()> {
        let statement = sql::daemon_mode(&self.schema);
        self.execute(&statement).await.map(|_| ())
    }

    async fn apply_staged(&mut self) -> Result<u64> {
        let rows = sqlx::query(&sql::apply_staged(&self.schema))
            .fetch_all(&mut *self.tx)
            .await
            .map_err(Error::backend)?;
        Ok(rows.len() as u64)
    }

    async fn exit_restricted_mode(&mut self) -> Result<()> {
        let statement = sql::normal_mode(&self.schema);
        self.execute(&statement).await.map(|_| ())
    }

    async fn drop_staging(&mut self) -> Result<()> {
        self.execute(&sql::drop_staging()).await.map(|_| ())
    }

    async fn local_transaction_id(&mut self) -> Result<i64> {
        let row = sqlx::query(sql::local_transaction_id())
            .fetch_one(&mut *self.tx)
            .await
            .map_err(Error::backend)?;
        row.try_get("xid").map_err(Error::backend)
    }

    async fn update_status(&mut self, status: &SlaveStatus) -> Result<()> {
        let done = sqlx::query(&sql::update_status(&self.schema))
            .bind(status.slave_xid)
            .bind(status.snapshot.current_xid().as_i64())
            .bind(status.snapshot.min_xid().as_i64())
            .bind(status.snapshot.max_xid().as_i64())
            .bind(status.snapshot.in_flight())
            .bind(status.updated_at)
            .bind(status.cluster)
            .execute(&mut *self.tx)
            .await
            .map_err(Error::backend)?;

        if done.rows_affected() == 0 {
            return Err(Error::storage(format!(
                "no slavesnapshotstatus row for cluster {}",
                status.cluster
            )));
        }
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        self.tx.commit().await.map_err(Error::backend)
    }

    async fn rollback(self) -> Result<()> {
        self.tx.rollback().await.map_err(Error::backend)
    }
}
