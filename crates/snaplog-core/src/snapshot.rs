//! Master snapshots: a transaction boundary plus the transactions still in
//! flight when it was taken.
//!
//! A snapshot splits the transaction id circle in two. Ids that precede
//! `min_xid` had committed when the snapshot was taken. Ids at or after
//! `current_xid` had not. Ids in between committed unless they are listed in
//! the in-flight set. Two snapshots therefore bound a batch: every change
//! whose xid is at/after the older snapshot and before the newer one.

use crate::xid::TransactionId;
use crate::{Error, Result};
use std::collections::BTreeSet;
use std::fmt;

/// Immutable consistency boundary read from the master's snapshot log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    current_xid: TransactionId,
    min_xid: TransactionId,
    max_xid: TransactionId,
    /// Serialized in-flight set, as stored by the master
    in_flight: String,
    outstanding: BTreeSet<u32>,
}

impl Snapshot {
    /// Build a snapshot, parsing and validating the in-flight set.
    ///
    /// `in_flight` is a comma separated list of decimal transaction ids. Every
    /// listed id must lie within `[min_xid, max_xid]` on the circle.
    pub fn new(
        current_xid: TransactionId,
        min_xid: TransactionId,
        max_xid: TransactionId,
        in_flight: impl Into<String>,
    ) -> Result<Self> {
        let in_flight = in_flight.into();
        let outstanding = parse_in_flight(&in_flight)?;

        for &raw in &outstanding {
            let tid = TransactionId::new(raw);
            if tid.precedes(min_xid) || tid.follows(max_xid) {
                return Err(Error::invalid_snapshot(format!(
                    "in-flight xid {} outside [{}, {}]",
                    tid, min_xid, max_xid
                )));
            }
        }

        Ok(Self {
            current_xid,
            min_xid,
            max_xid,
            in_flight,
            outstanding,
        })
    }

    /// Build a snapshot from the signed 64-bit columns stores use
    pub fn from_columns(
        current_xid: i64,
        min_xid: i64,
        max_xid: i64,
        in_flight: Option<String>,
    ) -> Result<Self> {
        Self::new(
            TransactionId::try_from(current_xid)?,
            TransactionId::try_from(min_xid)?,
            TransactionId::try_from(max_xid)?,
            in_flight.unwrap_or_default(),
        )
    }

    /// Snapshot boundary
    pub fn current_xid(&self) -> TransactionId {
        self.current_xid
    }

    /// Oldest transaction in flight at the boundary
    pub fn min_xid(&self) -> TransactionId {
        self.min_xid
    }

    /// Newest transaction in flight at the boundary
    pub fn max_xid(&self) -> TransactionId {
        self.max_xid
    }

    /// Serialized in-flight set
    pub fn in_flight(&self) -> &str {
        &self.in_flight
    }

    /// Parsed in-flight set, ascending by raw value
    pub fn in_flight_ids(&self) -> Vec<TransactionId> {
        self.outstanding.iter().copied().map(TransactionId::new).collect()
    }

    /// `tid` committed before this snapshot was taken
    pub fn transaction_id_lt(&self, tid: TransactionId) -> bool {
        if tid.precedes(self.min_xid) {
            return true;
        }
        if tid.follows_or_equals(self.current_xid) {
            return false;
        }
        !self.outstanding.contains(&tid.get())
    }

    /// `tid` had not committed when this snapshot was taken
    pub fn transaction_id_ge(&self, tid: TransactionId) -> bool {
        !self.transaction_id_lt(tid)
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "current={} min={} max={} in_flight=[{}]",
            self.current_xid, self.min_xid, self.max_xid, self.in_flight
        )
    }
}

fn parse_in_flight(raw: &str) -> Result<BTreeSet<u32>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u32>()
                .map_err(|e| Error::invalid_snapshot(format!("bad in-flight xid {:?}: {}", s, e)))
        })
        .collect()
}
