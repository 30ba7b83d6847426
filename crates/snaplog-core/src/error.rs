//! Error types for snaplog

use thiserror::Error;

/// Result type alias using snaplog Error
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed backend error carried by [`Error::Backend`]
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Core error types for the replication engine
#[derive(Error, Debug)]
pub enum Error {
    /// The slave has no status record for the cluster
    #[error("Unable to obtain slave snapshot status for cluster {cluster} on {node}: {reason}")]
    Bootstrap {
        /// Cluster being replicated
        cluster: i64,
        /// Slave node name or uri
        node: String,
        /// What was missing
        reason: String,
    },

    /// A stored integer is not a valid 32-bit transaction id
    #[error("Invalid transaction id: {0}")]
    InvalidTransactionId(i64),

    /// Snapshot fields violate the in-flight invariant or fail to parse
    #[error("Invalid snapshot: {0}")]
    InvalidSnapshot(String),

    /// A change log row could not be decoded
    #[error("Invalid change record: {0}")]
    InvalidChange(String),

    /// Storage-level failures reported by a backend without a source error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Errors raised by the underlying database driver
    #[error("Backend error: {0}")]
    Backend(#[source] BoxError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Wrap a driver error
    pub fn backend(err: impl Into<BoxError>) -> Self {
        Self::Backend(err.into())
    }

    /// Create an invalid snapshot error
    pub fn invalid_snapshot(msg: impl Into<String>) -> Self {
        Self::InvalidSnapshot(msg.into())
    }

    /// Create an invalid change error
    pub fn invalid_change(msg: impl Into<String>) -> Self {
        Self::InvalidChange(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_message_names_cluster_and_node() {
        let err = Error::Bootstrap {
            cluster: 7,
            node: "slave1".into(),
            reason: "no status row".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("cluster 7"));
        assert!(msg.contains("slave1"));
    }

    #[test]
    fn test_backend_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = Error::backend(io);
        assert!(std::error::Error::source(&err).is_some());
    }
}
