//! Error types for shardctl
//!
//! Provides a unified error type for topology, keyspace and reparent operations.

use crate::tablet::{ReplicationPosition, TabletAlias, TabletRole};
use crate::records::Version;
use thiserror::Error;

/// Result type alias for shardctl operations
pub type Result<T> = std::result::Result<T, ShardctlError>;

/// Boxed underlying cause carried by operational errors
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Unified error type for shardctl
#[derive(Error, Debug)]
pub enum ShardctlError {
    // ===== Caller Errors =====
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid role change for {tablet}: {from} -> {to}: {reason}")]
    InvalidRoleChange {
        tablet: TabletAlias,
        from: TabletRole,
        to: TabletRole,
        reason: String,
    },

    // ===== Lookup Errors =====
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Empty keyspace: {0}")]
    EmptyKeyspace(String),

    #[error("Cannot find shard for keyspace id {keyspace_id:#018x} in {keyspace} ({role})")]
    ShardNotFound {
        keyspace: String,
        keyspace_id: u64,
        role: TabletRole,
    },

    // ===== Store Errors =====
    #[error("Operational error on {context}: {source}")]
    Operational {
        context: String,
        #[source]
        source: BoxError,
    },

    #[error("Concurrent modification of {path}: expected version {expected}, found {actual}")]
    ConcurrentModification {
        path: String,
        expected: Version,
        actual: Version,
    },

    // ===== Reparent Protocol Errors =====
    #[error("DemoteMaster failed on {tablet}: {cause}")]
    DemoteMasterFailed { tablet: TabletAlias, cause: String },

    #[error("New master {tablet} is not serving as master: {cause}")]
    NewMasterNotServing { tablet: TabletAlias, cause: String },

    #[error("New master {tablet} is at {position}, behind most advanced replica position {best}")]
    NewMasterBehind {
        tablet: TabletAlias,
        position: ReplicationPosition,
        best: ReplicationPosition,
    },

    #[error("Tablet {0} is already the master, nothing to reparent")]
    NoOpReparent(TabletAlias),

    // ===== RPC Errors =====
    #[error("{method} on {tablet} error: {cause}")]
    Rpc {
        method: &'static str,
        tablet: TabletAlias,
        cause: String,
    },

    // ===== Configuration Errors =====
    #[error("Configuration error: {0}")]
    Configuration(String),

    // ===== Generic Errors =====
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ShardctlError {
    /// Wrap an underlying store failure with the identifiers it happened on
    pub fn operational(
        context: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        ShardctlError::Operational {
            context: context.into(),
            source: source.into(),
        }
    }

    /// Only optimistic-concurrency conflicts may be retried, from a fresh read
    pub fn is_retryable(&self) -> bool {
        matches!(self, ShardctlError::ConcurrentModification { .. })
    }

    /// Whether this is a lookup miss
    pub fn is_not_found(&self) -> bool {
        matches!(self, ShardctlError::NotFound(_))
    }
}

impl From<serde_json::Error> for ShardctlError {
    fn from(err: serde_json::Error) -> Self {
        ShardctlError::operational("record encoding", err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_error_display() {
        let err = ShardctlError::Rpc {
            method: "TabletManager.SetMaster",
            tablet: TabletAlias::new("test_nj", 41983),
            cause: "connection refused".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "TabletManager.SetMaster on test_nj-0000041983 error: connection refused"
        );
    }

    #[test]
    fn test_operational_keeps_cause() {
        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err = ShardctlError::operational("keyspace test_keyspace", io_err);
        assert!(err.to_string().contains("test_keyspace"));
        assert!(err.to_string().contains("disk gone"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_only_conflicts_are_retryable() {
        let conflict = ShardctlError::ConcurrentModification {
            path: "keyspaces/ks/shards/0".to_string(),
            expected: Version(3),
            actual: Version(4),
        };
        assert!(conflict.is_retryable());
        assert!(!ShardctlError::NotFound("x".into()).is_retryable());
        assert!(!ShardctlError::DemoteMasterFailed {
            tablet: TabletAlias::new("c", 1),
            cause: "timeout".into(),
        }
        .is_retryable());
    }
}
