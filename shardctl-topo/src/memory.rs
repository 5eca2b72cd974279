//! In-memory topology backend
//!
//! Used for testing and development. Not persistent. Supports injecting
//! store failures on path prefixes. Versions come from one store-wide
//! counter, so a deleted and re-created node never reuses a version.

use crate::backend::{child_names, BackendError, BackendResult, TopoBackend};
use parking_lot::RwLock;
use shardctl_core::Version;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// In-memory versioned directory
pub struct MemoryBackend {
    nodes: RwLock<BTreeMap<String, (Vec<u8>, Version)>>,

    /// Last version handed out
    last_version: AtomicU64,

    /// Paths under these prefixes fail every operation
    failing: RwLock<Vec<String>>,
}

impl MemoryBackend {
    /// Create a new in-memory backend
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(BTreeMap::new()),
            last_version: AtomicU64::new(0),
            failing: RwLock::new(Vec::new()),
        }
    }

    /// Make every operation on paths starting with `prefix` fail
    pub fn fail_path(&self, prefix: impl Into<String>) {
        self.failing.write().push(prefix.into());
    }

    /// Clear all injected failures
    pub fn heal(&self) {
        self.failing.write().clear();
    }

    /// Number of stored nodes
    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    fn next_version(&self) -> Version {
        Version(self.last_version.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn check(&self, path: &str) -> BackendResult<()> {
        if self.failing.read().iter().any(|p| path.starts_with(p.as_str())) {
            return Err(BackendError::storage(path, "injected store failure"));
        }
        Ok(())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl TopoBackend for MemoryBackend {
    fn get(&self, path: &str) -> BackendResult<Option<(Vec<u8>, Version)>> {
        self.check(path)?;
        Ok(self.nodes.read().get(path).cloned())
    }

    fn create(&self, path: &str, data: Vec<u8>) -> BackendResult<Version> {
        self.check(path)?;
        let mut nodes = self.nodes.write();
        if nodes.contains_key(path) {
            return Err(BackendError::NodeExists(path.to_string()));
        }
        let version = self.next_version();
        nodes.insert(path.to_string(), (data, version));
        Ok(version)
    }

    fn update(
        &self,
        path: &str,
        data: Vec<u8>,
        expected: Option<Version>,
    ) -> BackendResult<Version> {
        self.check(path)?;
        let mut nodes = self.nodes.write();
        let current = nodes.get(path).map(|(_, version)| *version);
        match (current, expected) {
            (None, Some(_)) => return Err(BackendError::NoNode(path.to_string())),
            (Some(actual), Some(expected)) if actual != expected => {
                return Err(BackendError::BadVersion {
                    path: path.to_string(),
                    expected,
                    actual,
                })
            }
            _ => {}
        }
        let next = self.next_version();
        nodes.insert(path.to_string(), (data, next));
        Ok(next)
    }

    fn delete(&self, path: &str, expected: Option<Version>) -> BackendResult<()> {
        self.check(path)?;
        let mut nodes = self.nodes.write();
        let actual = match nodes.get(path) {
            Some((_, version)) => *version,
            None => return Err(BackendError::NoNode(path.to_string())),
        };
        if let Some(expected) = expected {
            if expected != actual {
                return Err(BackendError::BadVersion {
                    path: path.to_string(),
                    expected,
                    actual,
                });
            }
        }
        nodes.remove(path);
        Ok(())
    }

    fn list(&self, dir: &str) -> BackendResult<Vec<String>> {
        self.check(dir)?;
        let nodes = self.nodes.read();
        Ok(child_names(dir, nodes.keys().map(String::as_str)))
    }

    fn flush(&self) -> BackendResult<()> {
        Ok(())
    }
}
