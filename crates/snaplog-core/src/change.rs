//! Change log rows moved from the master log into the slave staging buffer

use crate::xid::TransactionId;
use crate::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Row mutation kind recorded by the master's capture trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// Row inserted
    Insert,
    /// Row updated
    Update,
    /// Row deleted
    Delete,
}

impl CommandKind {
    /// Single-letter code used in the log tables
    pub fn code(self) -> &'static str {
        match self {
            Self::Insert => "I",
            Self::Update => "U",
            Self::Delete => "D",
        }
    }
}

impl FromStr for CommandKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "I" | "i" => Ok(Self::Insert),
            "U" | "u" => Ok(Self::Update),
            "D" | "d" => Ok(Self::Delete),
            other => Err(Error::invalid_change(format!(
                "unknown command type {:?}",
                other
            ))),
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// One captured row change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    /// Master append position; replay order within a batch
    pub row_id: i64,
    /// Transaction that produced the change
    pub xid: TransactionId,
    /// Mutation kind
    pub command: CommandKind,
    /// Qualified target table (`schema.table`)
    pub table: String,
    /// Opaque row image understood by the slave's apply function
    pub payload: String,
}

impl ChangeRecord {
    /// Create a change record
    pub fn new(
        row_id: i64,
        xid: TransactionId,
        command: CommandKind,
        table: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            row_id,
            xid,
            command,
            table: table.into(),
            payload: payload.into(),
        }
    }

    /// Decode a change from raw log columns
    pub fn from_columns(
        row_id: i64,
        xid: i64,
        command: &str,
        table: String,
        payload: Option<String>,
    ) -> Result<Self> {
        Ok(Self {
            row_id,
            xid: TransactionId::try_from(xid)?,
            command: command.parse()?,
            table,
            payload: payload.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_codes() {
        for kind in [CommandKind::Insert, CommandKind::Update, CommandKind::Delete] {
            assert_eq!(kind.code().parse::<CommandKind>().unwrap(), kind);
        }
        assert!("X".parse::<CommandKind>().is_err());
    }

    #[test]
    fn test_from_columns() {
        let change =
            ChangeRecord::from_columns(7, 101, "U", "public.accounts".into(), None).unwrap();
        assert_eq!(change.xid, TransactionId::new(101));
        assert_eq!(change.command, CommandKind::Update);
        assert_eq!(change.payload, "");

        let err = ChangeRecord::from_columns(7, -1, "U", "public.accounts".into(), None);
        assert!(matches!(err, Err(Error::InvalidTransactionId(-1))));
    }
}
