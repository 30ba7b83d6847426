//! Master-side log reader

use crate::sql;
use async_trait::async_trait;
use snaplog_core::{
    ChangeCursor, ChangeRecord, ClusterId, Error, Result, Snapshot, SnapshotSource,
    SnapshotWindow, TransactionLogSource, XidRange,
};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, Row, Transaction};

/// Reads the master's per-cluster snapshot and change logs
#[derive(Clone)]
pub struct PgMaster {
    pool: PgPool,
    schema: String,
}

impl PgMaster {
    /// Wrap an existing master pool
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }

    /// Close the pool
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl SnapshotSource for PgMaster {
    async fn latest_snapshot(
        &self,
        cluster: ClusterId,
        window: SnapshotWindow,
    ) -> Result<Option<Snapshot>> {
        let row = sqlx::query(&sql::next_snapshot(&self.schema, cluster, &window))
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::backend)?;

        row.map(|r| {
            Snapshot::from_columns(
                r.try_get("current_xaction").map_err(Error::backend)?,
                r.try_get("min_xaction").map_err(Error::backend)?,
                r.try_get("max_xaction").map_err(Error::backend)?,
                r.try_get("outstanding_xactions").map_err(Error::backend)?,
            )
        })
        .transpose()
    }
}

#[async_trait]
impl TransactionLogSource for PgMaster {
    async fn open_changes(
        &self,
        cluster: ClusterId,
        range: XidRange,
        fetch_size: usize,
    ) -> Result<Box<dyn ChangeCursor>> {
        // Cursors only live inside a transaction.
        let mut tx = self.pool.begin().await.map_err(Error::backend)?;
        sqlx::query(&sql::declare_change_cursor(&self.schema, cluster, &range))
            .execute(&mut *tx)
            .await
            .map_err(Error::backend)?;

        tracing::trace!(cluster, low = %range.low, high = %range.high, "Opened change cursor");

        Ok(Box::new(PgChangeCursor {
            tx: Some(tx),
            fetch: sql::fetch_changes(fetch_size.max(1)),
        }))
    }
}

/// Server-side cursor over master change rows
struct PgChangeCursor {
    tx: Option<Transaction<'static, Postgres>>,
    fetch: String,
}

#[async_trait]
impl ChangeCursor for PgChangeCursor {
    async fn next_batch(&mut self) -> Result<Vec<ChangeRecord>> {
        let Some(tx) = self.tx.as_mut() else {
            return Ok(Vec::new());
        };

        let rows = sqlx::query(&self.fetch)
            .fetch_all(&mut **tx)
            .await
            .map_err(Error::backend)?;

        if rows.is_empty() {
            // Read-only; release the connection.
            if let Some(mut tx) = self.tx.take() {
                sqlx::query(&sql::close_change_cursor())
                    .execute(&mut *tx)
                    .await
                    .map_err(Error::backend)?;
                tx.rollback().await.map_err(Error::backend)?;
            }
            return Ok(Vec::new());
        }

        rows.iter().map(decode_change).collect()
    }
}

fn decode_change(row: &PgRow) -> Result<ChangeRecord> {
    ChangeRecord::from_columns(
        row.try_get("rowid").map_err(Error::backend)?,
        row.try_get("xaction").map_err(Error::backend)?,
        row.try_get::<String, _>("cmdtype")
            .map_err(Error::backend)?
            .as_str(),
        row.try_get("tabname").map_err(Error::backend)?,
        row.try_get("info").map_err(Error::backend)?,
    )
}
