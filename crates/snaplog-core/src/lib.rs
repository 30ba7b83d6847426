//! Snaplog Core - Snapshot/Transaction-Log Replication Engine
//!
//! Replays a master database's committed changes onto slave nodes in
//! snapshot-bounded batches:
//! - Circular 32-bit transaction ids with wraparound-aware ordering
//! - Snapshot visibility (which transactions committed before a boundary)
//! - Next-snapshot resolution across the wrap point
//! - Atomic batch apply inside one slave transaction
//! - A cancellable polling worker per slave node
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────── ReplicationWorker ────────────────────────┐
//! │  LogSwitcher::rotate ─► NextSnapshotResolver ─► ReplicationApplier │
//! └───────────────────────────────┬──────────────────────┬────────────┘
//!                                 │                      │
//!                    SnapshotSource +            SlaveStore /
//!                  TransactionLogSource         SlaveTransaction
//!                       (master)                    (slave)
//! ```
//!
//! Backends implement the traits in [`source`], [`store`] and
//! [`log_switch`]. [`memory`] provides in-process implementations.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod applier;
pub mod change;
pub mod config;
pub mod error;
pub mod log_switch;
pub mod memory;
pub mod resolver;
pub mod snapshot;
pub mod source;
pub mod store;
pub mod worker;
pub mod xid;

pub use applier::{ApplyReport, DEFAULT_FETCH_SIZE, ReplicationApplier};
pub use change::{ChangeRecord, CommandKind};
pub use config::ReplicationConfig;
pub use error::{Error, Result};
pub use log_switch::{LogSwitcher, NoopLogSwitcher};
pub use resolver::NextSnapshotResolver;
pub use snapshot::Snapshot;
pub use source::{
    ChangeCursor, ClusterId, SnapshotSource, SnapshotWindow, TransactionLogSource, XidRange,
};
pub use store::{SlaveStatus, SlaveStore, SlaveTransaction};
pub use worker::{
    Iteration, NodeInfo, ReplicationStats, ReplicationWorker, WorkerHandle, WorkerState,
};
pub use xid::TransactionId;
