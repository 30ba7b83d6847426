//! Slave log partition rotation through the `rotate_logs` function

use crate::sql;
use async_trait::async_trait;
use snaplog_core::{ClusterId, Error, LogSwitcher, Result};
use sqlx::postgres::PgPool;

/// Calls `<schema>.rotate_logs(cluster)` on the slave
pub struct PgLogSwitcher {
    pool: PgPool,
    schema: String,
    cluster: ClusterId,
}

impl PgLogSwitcher {
    /// Create a switcher for one cluster
    pub fn new(pool: PgPool, schema: impl Into<String>, cluster: ClusterId) -> Self {
        Self {
            pool,
            schema: schema.into(),
            cluster,
        }
    }
}

#[async_trait]
impl LogSwitcher for PgLogSwitcher {
    async fn rotate(&self) -> Result<()> {
        sqlx::query(&sql::rotate_logs(&self.schema))
            .bind(self.cluster)
            .execute(&self.pool)
            .await
            .map_err(Error::backend)?;
        Ok(())
    }
}
