//! Locating the next snapshot to apply
//!
//! The search looks forward from the last applied boundary across at most
//! half the id circle and picks the furthest-advanced logged snapshot, so a
//! lagging slave catches up in as few batches as possible.

use crate::snapshot::Snapshot;
use crate::source::{ClusterId, SnapshotSource, SnapshotWindow};
use std::sync::Arc;

/// Finds the next unprocessed snapshot in the master's snapshot log
pub struct NextSnapshotResolver<M: ?Sized> {
    master: Arc<M>,
    cluster: ClusterId,
}

impl<M> NextSnapshotResolver<M>
where
    M: SnapshotSource + ?Sized,
{
    /// Create a resolver for one cluster
    pub fn new(master: Arc<M>, cluster: ClusterId) -> Self {
        Self { master, cluster }
    }

    /// Next snapshot after `last_applied`, or `None`.
    ///
    /// A failed lookup is logged and reported as `None`; the worker simply
    /// polls again on its next iteration.
    pub async fn resolve(&self, last_applied: &Snapshot) -> Option<Snapshot> {
        let window = SnapshotWindow::after(last_applied.current_xid());
        tracing::trace!(
            cluster = self.cluster,
            last_applied = %last_applied.current_xid(),
            low = %window.low(),
            high = %window.high(),
            wrapped = window.is_wrapped(),
            "Looking for next snapshot"
        );

        match self.master.latest_snapshot(self.cluster, window).await {
            Ok(next) => next,
            Err(e) => {
                tracing::warn!(
                    cluster = self.cluster,
                    last_applied = %last_applied.current_xid(),
                    error = %e,
                    "Can not obtain next snapshot, treating as unavailable"
                );
                None
            }
        }
    }
}
