//! Topology backend trait
//!
//! A versioned key/value directory. Every node carries a version that is
//! bumped on each write; conditional writes compare it first.

use shardctl_core::{ShardctlError, Version};
use thiserror::Error;

/// Backend errors
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("node does not exist: {0}")]
    NoNode(String),

    #[error("node already exists: {0}")]
    NodeExists(String),

    #[error("bad version on {path}: expected {expected}, found {actual}")]
    BadVersion {
        path: String,
        expected: Version,
        actual: Version,
    },

    #[error("corrupt node {path}: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("storage failure on {path}: {source}")]
    Storage {
        path: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl BackendError {
    pub fn storage(
        path: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        BackendError::Storage {
            path: path.into(),
            source: source.into(),
        }
    }
}

impl From<BackendError> for ShardctlError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::NoNode(path) => ShardctlError::NotFound(path),
            BackendError::NodeExists(path) => ShardctlError::AlreadyExists(path),
            BackendError::BadVersion {
                path,
                expected,
                actual,
            } => ShardctlError::ConcurrentModification {
                path,
                expected,
                actual,
            },
            BackendError::Corrupt { path, reason } => ShardctlError::operational(path, reason),
            BackendError::Storage { path, source } => ShardctlError::Operational {
                context: path,
                source,
            },
        }
    }
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Synchronous versioned directory backend
pub trait TopoBackend: Send + Sync {
    /// Read a node and its version
    fn get(&self, path: &str) -> BackendResult<Option<(Vec<u8>, Version)>>;

    /// Create a node that must not exist yet
    fn create(&self, path: &str, data: Vec<u8>) -> BackendResult<Version>;

    /// Write a node. With `expected`, the node must exist at that version;
    /// without it the write is unconditional and creates the node if needed.
    fn update(&self, path: &str, data: Vec<u8>, expected: Option<Version>)
        -> BackendResult<Version>;

    /// Remove a node, optionally at an expected version
    fn delete(&self, path: &str, expected: Option<Version>) -> BackendResult<()>;

    /// Distinct first path segments below `dir`, sorted
    fn list(&self, dir: &str) -> BackendResult<Vec<String>>;

    /// Flush any pending writes
    fn flush(&self) -> BackendResult<()>;
}

/// Child names of `dir` given the full keys stored under it
pub(crate) fn child_names<'a>(dir: &str, keys: impl Iterator<Item = &'a str>) -> Vec<String> {
    let prefix = format!("{}/", dir.trim_end_matches('/'));
    let mut names: Vec<String> = keys
        .filter_map(|key| key.strip_prefix(prefix.as_str()))
        .filter_map(|rest| rest.split('/').next())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect();
    names.sort();
    names.dedup();
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_names() {
        let keys = [
            "cells/test_nj/tablets/0000000001",
            "cells/test_nj/tablets/0000000002",
            "cells/test_ny/tablets/0000000003",
            "cellsx/other",
        ];
        assert_eq!(
            child_names("cells", keys.iter().copied()),
            vec!["test_nj".to_string(), "test_ny".to_string()]
        );
        assert_eq!(
            child_names("cells/test_nj/tablets", keys.iter().copied()).len(),
            2
        );
    }

    #[test]
    fn test_bad_version_maps_to_conflict() {
        let err: ShardctlError = BackendError::BadVersion {
            path: "keyspaces/ks/shards/0".into(),
            expected: Version(1),
            actual: Version(2),
        }
        .into();
        assert!(err.is_retryable());
        let missing: ShardctlError = BackendError::NoNode("keyspaces/ks".into()).into();
        assert!(missing.is_not_found());
    }
}
