//! Snaplog PostgreSQL backend
//!
//! Master and slave implementations of the snaplog collaborator traits on
//! top of `sqlx`:
//! - [`PgMaster`] reads `<schema>.snapshotlog_<cluster>` and streams
//!   `<schema>.transactionlog_<cluster>` through a server-side cursor
//! - [`PgSlaveStore`] stages each batch in a temporary table and replays it
//!   with the slave's `applylogtransaction` function
//! - [`PgLogSwitcher`] rotates the slave's history partitions

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod log_switch;
pub mod master;
pub mod slave;
pub mod sql;

pub use config::PgConfig;
pub use log_switch::PgLogSwitcher;
pub use master::PgMaster;
pub use slave::PgSlaveStore;

use snaplog_core::{ClusterId, Error, NodeInfo, ReplicationConfig, ReplicationWorker, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::sync::Arc;

/// Worker replicating from a PostgreSQL master to a PostgreSQL slave
pub type PgReplicationWorker = ReplicationWorker<PgMaster, PgSlaveStore>;

async fn connect_pool(url: &str, max_connections: u32, config: &PgConfig) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(config.acquire_timeout())
        .connect(url)
        .await
        .map_err(Error::backend)
}

/// Connect both databases and build a worker for `cluster`.
///
/// Fails with [`Error::Bootstrap`] when the slave has no status record.
pub async fn connect_worker(
    pg: &PgConfig,
    replication: ReplicationConfig,
    cluster: ClusterId,
    node_name: impl Into<String>,
) -> Result<PgReplicationWorker> {
    pg.validate()?;

    let master_pool = connect_pool(&pg.master_url, pg.master_max_connections, pg).await?;
    let slave_pool = connect_pool(&pg.slave_url, pg.slave_max_connections, pg).await?;

    let node = NodeInfo::new(node_name, pg.slave_uri_redacted());
    tracing::info!(cluster, node = %node.name, schema = %pg.schema, "Connected master and slave");

    ReplicationWorker::new(
        cluster,
        node,
        Arc::new(PgMaster::new(master_pool, pg.schema.clone())),
        PgSlaveStore::new(slave_pool.clone(), pg.schema.clone()),
        Box::new(PgLogSwitcher::new(slave_pool, pg.schema.clone(), cluster)),
        replication,
    )
    .await
}
