//! SQL text for the master and slave log tables
//!
//! Per-cluster and per-partition tables are addressed by name, so cluster
//! and log ids are formatted into the statement. Both are integers; the
//! schema name is validated by [`crate::PgConfig::validate`].

use snaplog_core::{ClusterId, SnapshotWindow, XidRange};

/// Temporary table holding one batch on the slave
pub const STAGING_TABLE: &str = "snaplog_staging";

/// Server-side cursor streaming master change rows
pub const CHANGE_CURSOR: &str = "snaplog_changes";

const RESERVED_FILTER: &str = "current_xaction not in (0, 1, 2)";

/// Furthest-advanced master snapshot inside `window`.
///
/// A wrapped window ranks the post-wrap segment (`current_xaction < low`)
/// above the pre-wrap one.
pub fn next_snapshot(schema: &str, cluster: ClusterId, window: &SnapshotWindow) -> String {
    let low = window.low().get();
    let high = window.high().get();
    match window {
        SnapshotWindow::Contiguous { .. } => format!(
            "select current_xaction, min_xaction, max_xaction, outstanding_xactions \
             from {schema}.snapshotlog_{cluster} \
             where {RESERVED_FILTER} \
               and current_xaction >= {low} and current_xaction <= {high} \
             order by current_xaction desc limit 1"
        ),
        SnapshotWindow::Wrapped { .. } => format!(
            "select current_xaction, min_xaction, max_xaction, outstanding_xactions \
             from {schema}.snapshotlog_{cluster} \
             where {RESERVED_FILTER} \
               and ((current_xaction >= {low} and current_xaction <= {max}) \
                 or (current_xaction >= {first} and current_xaction <= {high})) \
             order by (current_xaction < {low}) desc, current_xaction desc limit 1",
            max = snaplog_core::TransactionId::MAX_NORMAL.get(),
            first = snaplog_core::TransactionId::FIRST_NORMAL.get(),
        ),
    }
}

/// Cursor over the master change rows whose xid lies in `range`
pub fn declare_change_cursor(schema: &str, cluster: ClusterId, range: &XidRange) -> String {
    let low = range.low.get();
    let high = range.high.get();
    let predicate = if range.is_wrapped() {
        format!("(xaction >= {low} or xaction < {high})")
    } else {
        format!("xaction >= {low} and xaction < {high}")
    };
    format!(
        "declare {CHANGE_CURSOR} no scroll cursor for \
         select rowid, xaction, cmdtype, tabname, info \
         from {schema}.transactionlog_{cluster} where {predicate}"
    )
}

/// Next `n` rows from the change cursor
pub fn fetch_changes(fetch_size: usize) -> String {
    format!("fetch forward {fetch_size} from {CHANGE_CURSOR}")
}

/// Close the change cursor
pub fn close_change_cursor() -> String {
    format!("close {CHANGE_CURSOR}")
}

/// Slave status record for a cluster
pub fn select_status(schema: &str) -> String {
    format!(
        "select clusterid, slave_xaction, master_current_xaction, master_min_xaction, \
                master_max_xaction, master_outstanding_xactions, update_time \
         from {schema}.slavesnapshotstatus where clusterid = $1"
    )
}

/// Overwrite the slave status record
pub fn update_status(schema: &str) -> String {
    format!(
        "update {schema}.slavesnapshotstatus \
         set slave_xaction = $1, master_current_xaction = $2, master_min_xaction = $3, \
             master_max_xaction = $4, master_outstanding_xactions = $5, update_time = $6 \
         where clusterid = $7"
    )
}

/// Staging table, dropped at the latest when the transaction ends
pub fn create_staging() -> String {
    format!(
        "create temporary table {STAGING_TABLE} \
         (rowid bigint, xaction bigint, cmdtype char(1), tabname text, info text) \
         on commit drop"
    )
}

/// Add one change to the staging table
pub fn insert_staged() -> String {
    format!(
        "insert into {STAGING_TABLE} (rowid, xaction, cmdtype, tabname, info) \
         values ($1, $2, $3, $4, $5)"
    )
}

/// Current log partition of a cluster
pub fn current_log(schema: &str, cluster: ClusterId) -> String {
    format!("select max(id) as id from {schema}.currentlog_{cluster}")
}

/// Append a snapshot to a partition's snapshot history
pub fn insert_snapshot_history(schema: &str, cluster: ClusterId, log_id: i64) -> String {
    format!(
        "insert into {schema}.snapshotlog_{cluster}_{log_id} \
         (current_xaction, min_xaction, max_xaction, outstanding_xactions) \
         values ($1, $2, $3, $4)"
    )
}

/// Copy the staging table into a partition's change-log history
pub fn copy_staged_to_history(schema: &str, cluster: ClusterId, log_id: i64) -> String {
    format!(
        "insert into {schema}.transactionlog_{cluster}_{log_id} \
         (rowid, xaction, cmdtype, tabname, info) \
         select rowid, xaction, cmdtype, tabname, info from {STAGING_TABLE}"
    )
}

/// Distinct tables referenced by staged rows
pub fn staged_tables() -> String {
    format!("select distinct tabname from {STAGING_TABLE} order by tabname")
}

/// Whether a `schema.table` carries the write-deny trigger from `$2`
pub fn table_replicated() -> &'static str {
    "select exists ( \
       select 1 from pg_trigger t \
         join pg_class c on c.oid = t.tgrelid \
         join pg_namespace n on n.oid = c.relnamespace \
         join pg_proc p on p.oid = t.tgfoid \
         join pg_namespace pn on pn.oid = p.pronamespace \
       where n.nspname || '.' || c.relname = $1 \
         and p.proname = 'denyaccesstrigger' \
         and pn.nspname = $2) as replicated"
}

/// Drop staged rows for one table
pub fn discard_staged() -> String {
    format!("delete from {STAGING_TABLE} where tabname = $1")
}

/// Suspend write protection on replicated tables
pub fn daemon_mode(schema: &str) -> String {
    format!("select {schema}.daemonmode()")
}

/// Restore write protection on replicated tables
pub fn normal_mode(schema: &str) -> String {
    format!("select {schema}.normalmode()")
}

/// Replay staged rows in master order
pub fn apply_staged(schema: &str) -> String {
    format!(
        "select {schema}.applylogtransaction(cmdtype, tabname, info) \
         from {STAGING_TABLE} order by rowid"
    )
}

/// Drop the staging table
pub fn drop_staging() -> String {
    format!("drop table if exists {STAGING_TABLE}")
}

/// Slave-local id of the running transaction
pub fn local_transaction_id() -> &'static str {
    "select txid_current() as xid"
}

/// Rotate a cluster's log partitions
pub fn rotate_logs(schema: &str) -> String {
    format!("select {schema}.rotate_logs($1)")
}

#[cfg(test)]
mod tests {
    use super::*;
    use snaplog_core::TransactionId;

    #[test]
    fn test_next_snapshot_contiguous() {
        let window = SnapshotWindow::after(TransactionId::new(100));
        let sql = next_snapshot("snaplog", 3, &window);
        assert!(sql.contains("from snaplog.snapshotlog_3 "));
        assert!(sql.contains("current_xaction >= 101 and current_xaction <= 2147483747"));
        assert!(sql.contains("order by current_xaction desc limit 1"));
        assert!(sql.contains("not in (0, 1, 2)"));
    }

    #[test]
    fn test_next_snapshot_wrapped_prefers_post_wrap() {
        let window = SnapshotWindow::after(TransactionId::new(u32::MAX - 2));
        let sql = next_snapshot("snaplog", 3, &window);
        assert!(sql.contains("current_xaction >= 4294967294 and current_xaction <= 4294967295"));
        assert!(sql.contains("current_xaction >= 3 and current_xaction <= "));
        assert!(sql.contains("order by (current_xaction < 4294967294) desc"));
    }

    #[test]
    fn test_change_cursor_predicates() {
        let plain = XidRange {
            low: TransactionId::new(90),
            high: TransactionId::new(150),
        };
        let sql = declare_change_cursor("snaplog", 1, &plain);
        assert!(sql.starts_with("declare snaplog_changes no scroll cursor"));
        assert!(sql.contains("from snaplog.transactionlog_1 where xaction >= 90 and xaction < 150"));

        let wrapped = XidRange {
            low: TransactionId::new(u32::MAX - 5),
            high: TransactionId::new(10),
        };
        let sql = declare_change_cursor("snaplog", 1, &wrapped);
        assert!(sql.ends_with("(xaction >= 4294967290 or xaction < 10)"));
    }

    #[test]
    fn test_partition_tables() {
        assert!(insert_snapshot_history("repl", 2, 17).contains("repl.snapshotlog_2_17 "));
        assert!(copy_staged_to_history("repl", 2, 17).contains("repl.transactionlog_2_17 "));
        assert_eq!(current_log("repl", 2), "select max(id) as id from repl.currentlog_2");
    }

    #[test]
    fn test_fetch_and_apply() {
        assert_eq!(fetch_changes(50), "fetch forward 50 from snaplog_changes");
        assert!(apply_staged("repl").ends_with("from snaplog_staging order by rowid"));
        assert!(create_staging().ends_with("on commit drop"));
    }
}
