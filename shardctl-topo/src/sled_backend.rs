//! Sled-based topology backend
//!
//! Durable single-process store. Each value is the node version (8 bytes,
//! big-endian) followed by the record bytes; writes go through sled's
//! compare-and-swap so concurrent writers in one process serialize.
//! Versions are drawn from sled's monotonic id generator, so they keep
//! increasing across delete, re-create and restart.

use crate::backend::{child_names, BackendError, BackendResult, TopoBackend};
use shardctl_core::Version;
use std::path::Path;
use tracing::{debug, info};

const VERSION_LEN: usize = 8;
const TREE_NAME: &str = "topology";

/// Sled-based versioned directory
pub struct SledBackend {
    db: sled::Db,
    tree: sled::Tree,
}

impl SledBackend {
    /// Open or create a store at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> BackendResult<Self> {
        info!(path = ?path.as_ref(), "Opening sled topology store");
        let db = sled::open(path.as_ref())
            .map_err(|e| BackendError::storage(path.as_ref().display().to_string(), e))?;
        Self::from_db(db)
    }

    /// Open a store that is discarded on drop (for testing)
    pub fn open_temporary() -> BackendResult<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| BackendError::storage("<temporary>", e))?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> BackendResult<Self> {
        let tree = db
            .open_tree(TREE_NAME)
            .map_err(|e| BackendError::storage(TREE_NAME, e))?;
        Ok(Self { db, tree })
    }

    fn next_version(&self, path: &str) -> BackendResult<Version> {
        let id = self
            .db
            .generate_id()
            .map_err(|e| BackendError::storage(path, e))?;
        Ok(Version(id + 1))
    }

    fn read(&self, path: &str) -> BackendResult<Option<sled::IVec>> {
        self.tree
            .get(path)
            .map_err(|e| BackendError::storage(path, e))
    }

    fn swap(
        &self,
        path: &str,
        current: Option<&sled::IVec>,
        new: Option<Vec<u8>>,
    ) -> BackendResult<bool> {
        let result = self
            .tree
            .compare_and_swap(path, current, new)
            .map_err(|e| BackendError::storage(path, e))?;
        Ok(result.is_ok())
    }
}

fn encode(version: Version, data: &[u8]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(VERSION_LEN + data.len());
    raw.extend_from_slice(&version.0.to_be_bytes());
    raw.extend_from_slice(data);
    raw
}

fn version_of(path: &str, raw: &[u8]) -> BackendResult<Version> {
    let header: [u8; VERSION_LEN] = raw
        .get(..VERSION_LEN)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| BackendError::Corrupt {
            path: path.to_string(),
            reason: format!("value shorter than {VERSION_LEN} byte version header"),
        })?;
    Ok(Version(u64::from_be_bytes(header)))
}

impl TopoBackend for SledBackend {
    fn get(&self, path: &str) -> BackendResult<Option<(Vec<u8>, Version)>> {
        match self.read(path)? {
            Some(raw) => {
                let version = version_of(path, &raw)?;
                Ok(Some((raw[VERSION_LEN..].to_vec(), version)))
            }
            None => Ok(None),
        }
    }

    fn create(&self, path: &str, data: Vec<u8>) -> BackendResult<Version> {
        let version = self.next_version(path)?;
        if self.swap(path, None, Some(encode(version, &data)))? {
            debug!(path, "Created node");
            Ok(version)
        } else {
            Err(BackendError::NodeExists(path.to_string()))
        }
    }

    fn update(
        &self,
        path: &str,
        data: Vec<u8>,
        expected: Option<Version>,
    ) -> BackendResult<Version> {
        loop {
            let current = self.read(path)?;
            let actual = current
                .as_ref()
                .map(|raw| version_of(path, raw))
                .transpose()?;
            match (actual, expected) {
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
            let next = self.next_version(path)?;
            // a lost swap re-reads; a conditional writer then sees the new version
            if self.swap(path, current.as_ref(), Some(encode(next, &data)))? {
                return Ok(next);
            }
        }
    }

    fn delete(&self, path: &str, expected: Option<Version>) -> BackendResult<()> {
        loop {
            let Some(current) = self.read(path)? else {
                return Err(BackendError::NoNode(path.to_string()));
            };
            let actual = version_of(path, &current)?;
            if let Some(expected) = expected {
                if expected != actual {
                    return Err(BackendError::BadVersion {
                        path: path.to_string(),
                        expected,
                        actual,
                    });
                }
            }
            if self.swap(path, Some(&current), None)? {
                return Ok(());
            }
        }
    }

    fn list(&self, dir: &str) -> BackendResult<Vec<String>> {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        let mut keys = Vec::new();
        for item in self.tree.scan_prefix(prefix.as_bytes()) {
            let (key, _) = item.map_err(|e| BackendError::storage(dir, e))?;
            keys.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(child_names(dir, keys.iter().map(String::as_str)))
    }

    fn flush(&self) -> BackendResult<()> {
        self.db
            .flush()
            .map_err(|e| BackendError::storage("<flush>", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_update_get() {
        let backend = SledBackend::open_temporary().unwrap();
        let v1 = backend.create("keyspaces/ks", b"one".to_vec()).unwrap();
        let v2 = backend.update("keyspaces/ks", b"two".to_vec(), Some(v1)).unwrap();
        let (data, version) = backend.get("keyspaces/ks").unwrap().unwrap();
        assert_eq!(data, b"two");
        assert_eq!(version, v2);
        assert!(matches!(
            backend.update("keyspaces/ks", b"three".to_vec(), Some(v1)),
            Err(BackendError::BadVersion { .. })
        ));
    }

    #[test]
    fn test_list_and_delete() {
        let backend = SledBackend::open_temporary().unwrap();
        backend.update("cells/a/tablets/1", vec![], None).unwrap();
        backend.update("cells/b/tablets/2", vec![], None).unwrap();
        assert_eq!(backend.list("cells").unwrap(), vec!["a", "b"]);
        backend.delete("cells/a/tablets/1", None).unwrap();
        assert_eq!(backend.list("cells").unwrap(), vec!["b"]);
    }

    #[test]
    fn test_recreate_moves_version_forward() {
        let backend = SledBackend::open_temporary().unwrap();
        let old = backend.create("locks/ks/0", b"a".to_vec()).unwrap();
        backend.delete("locks/ks/0", None).unwrap();
        let new = backend.create("locks/ks/0", b"b".to_vec()).unwrap();
        assert!(new > old);
        assert!(matches!(
            backend.update("locks/ks/0", b"c".to_vec(), Some(old)),
            Err(BackendError::BadVersion { .. })
        ));
    }

    #[test]
    fn test_reopen_persists() {
        let dir = tempfile::tempdir().unwrap();
        {
            let backend = SledBackend::open(dir.path()).unwrap();
            backend.create("keyspaces/ks", b"{}".to_vec()).unwrap();
            backend.flush().unwrap();
        }
        let backend = SledBackend::open(dir.path()).unwrap();
        assert!(backend.get("keyspaces/ks").unwrap().is_some());
    }
}
