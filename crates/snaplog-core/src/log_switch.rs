//! Slave log partition rotation hook

use crate::Result;
use async_trait::async_trait;

/// Rotates the slave's snapshot/change-log partitions.
///
/// Called once at the top of every worker iteration. Errors are logged by the
/// worker and never stop replication.
#[async_trait]
pub trait LogSwitcher: Send + Sync {
    /// Switch to a new partition if one is due
    async fn rotate(&self) -> Result<()>;
}

/// Switcher for slaves whose partitions are rotated elsewhere
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLogSwitcher;

#[async_trait]
impl LogSwitcher for NoopLogSwitcher {
    async fn rotate(&self) -> Result<()> {
        Ok(())
    }
}
