//! Read access to the master's per-cluster snapshot and change logs

use crate::Result;
use crate::change::ChangeRecord;
use crate::snapshot::Snapshot;
use crate::xid::TransactionId;
use async_trait::async_trait;

/// Replication cluster identifier
pub type ClusterId = i64;

/// Range of snapshot boundaries the resolver may select from.
///
/// Both bounds are inclusive and normal. Reserved ids never match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotWindow {
    /// `[low, high]` with `low < high` in raw magnitude
    Contiguous {
        /// First boundary after the last applied one
        low: TransactionId,
        /// Far edge of the forward half-circle
        high: TransactionId,
    },
    /// `[low, MAX_NORMAL] ∪ [FIRST_NORMAL, high]`
    Wrapped {
        /// First boundary after the last applied one
        low: TransactionId,
        /// Far edge of the forward half-circle, past the wrap
        high: TransactionId,
    },
}

impl SnapshotWindow {
    /// Window of boundaries that follow `last_applied`
    pub fn after(last_applied: TransactionId) -> Self {
        let low = last_applied.next_normal();
        let high = last_applied.last_normal();
        if low.get() < high.get() {
            Self::Contiguous { low, high }
        } else {
            Self::Wrapped { low, high }
        }
    }

    /// Lower edge
    pub fn low(&self) -> TransactionId {
        match *self {
            Self::Contiguous { low, .. } | Self::Wrapped { low, .. } => low,
        }
    }

    /// Upper edge
    pub fn high(&self) -> TransactionId {
        match *self {
            Self::Contiguous { high, .. } | Self::Wrapped { high, .. } => high,
        }
    }

    /// Whether the window crosses the wrap point
    pub fn is_wrapped(&self) -> bool {
        matches!(self, Self::Wrapped { .. })
    }

    /// Whether `xid` is a selectable boundary
    pub fn contains(&self, xid: TransactionId) -> bool {
        if !xid.is_normal() {
            return false;
        }
        let v = xid.get();
        match *self {
            Self::Contiguous { low, high } => low.get() <= v && v <= high.get(),
            Self::Wrapped { low, high } => {
                (low.get() <= v && v <= TransactionId::MAX_NORMAL.get())
                    || (TransactionId::FIRST_NORMAL.get() <= v && v <= high.get())
            }
        }
    }

    /// Distance of `xid` from the low edge; larger is further advanced.
    ///
    /// Only meaningful for ids the window contains.
    pub fn advancement(&self, xid: TransactionId) -> u32 {
        xid.get().wrapping_sub(self.low().get())
    }

    /// The furthest-advanced snapshot inside the window
    pub fn most_advanced<'a>(
        &self,
        candidates: impl IntoIterator<Item = &'a Snapshot>,
    ) -> Option<&'a Snapshot> {
        candidates
            .into_iter()
            .filter(|s| self.contains(s.current_xid()))
            .max_by_key(|s| self.advancement(s.current_xid()))
    }
}

/// Half-open range `[low, high)` of change-log xids, possibly wrapped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XidRange {
    /// Inclusive lower bound
    pub low: TransactionId,
    /// Exclusive upper bound
    pub high: TransactionId,
}

impl XidRange {
    /// Range of xids that can belong to the batch between two snapshots
    pub fn between(last_applied: &Snapshot, target: &Snapshot) -> Self {
        Self {
            low: last_applied.min_xid(),
            high: target.current_xid(),
        }
    }

    /// Whether the raw range crosses the wrap point
    pub fn is_wrapped(&self) -> bool {
        self.low.get() > self.high.get()
    }

    /// Whether `xid` lies in the range
    pub fn contains(&self, xid: TransactionId) -> bool {
        let span = self.high.get().wrapping_sub(self.low.get());
        xid.get().wrapping_sub(self.low.get()) < span
    }
}

/// Master snapshot log
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Furthest-advanced logged snapshot whose boundary lies in `window`
    async fn latest_snapshot(
        &self,
        cluster: ClusterId,
        window: SnapshotWindow,
    ) -> Result<Option<Snapshot>>;
}

/// Streaming cursor over master change-log rows
#[async_trait]
pub trait ChangeCursor: Send {
    /// Next batch of at most `fetch_size` rows; empty once exhausted
    async fn next_batch(&mut self) -> Result<Vec<ChangeRecord>>;
}

/// Master change log
#[async_trait]
pub trait TransactionLogSource: Send + Sync {
    /// Open a cursor over the rows whose xid lies in `range`.
    ///
    /// The cursor owns its master connection and releases it on drop.
    async fn open_changes(
        &self,
        cluster: ClusterId,
        range: XidRange,
        fetch_size: usize,
    ) -> Result<Box<dyn ChangeCursor>>;
}
