//! Key ranges over the keyspace id space
//!
//! Keyspace ids are packed into fixed-width big-endian byte strings and
//! compared lexicographically. An empty start is the minimum key, an empty
//! end is the unbounded maximum.

use crate::error::{Result, ShardctlError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Width of a packed keyspace id
pub const KEYSPACE_ID_WIDTH: usize = 8;

/// Minimum key (empty start)
pub const MIN_KEY: &[u8] = &[];

/// Unbounded maximum sentinel (empty end)
pub const MAX_KEY: &[u8] = &[];

/// Pack a keyspace id into its big-endian byte form
pub fn pack_keyspace_id(keyspace_id: u64) -> [u8; KEYSPACE_ID_WIDTH] {
    keyspace_id.to_be_bytes()
}

/// Half-open range `[start, end)` of packed keyspace ids
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct KeyRange {
    #[serde(with = "hex_bytes", default)]
    pub start: Vec<u8>,
    #[serde(with = "hex_bytes", default)]
    pub end: Vec<u8>,
}

impl KeyRange {
    pub fn new(start: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    /// The whole key space
    pub fn full() -> Self {
        Self::default()
    }

    pub fn is_full(&self) -> bool {
        self.start.is_empty() && self.end.is_empty()
    }

    pub fn is_unbounded(&self) -> bool {
        self.end == MAX_KEY
    }

    /// Whether the packed key falls inside `[start, end)`
    pub fn contains(&self, packed: &[u8]) -> bool {
        self.start.as_slice() <= packed && (self.is_unbounded() || packed < self.end.as_slice())
    }

    /// Whether both ranges share at least one key
    pub fn intersects(&self, other: &KeyRange) -> bool {
        let starts_before_other_ends = other.is_unbounded() || self.start < other.end;
        let other_starts_before_end = self.is_unbounded() || other.start < self.end;
        starts_before_other_ends && other_starts_before_end
    }

    /// Derive the range from a shard name such as `40-80`, `-80` or `80-`.
    /// Names without a dash (`0`, custom names) cover the whole key space.
    pub fn from_shard_name(name: &str) -> Result<Self> {
        if name.is_empty() {
            return Err(ShardctlError::InvalidArgument("shard name is empty".into()));
        }
        let Some((start, end)) = name.split_once('-') else {
            return Ok(Self::full());
        };
        let decode = |part: &str| {
            hex::decode(part).map_err(|e| {
                ShardctlError::InvalidArgument(format!("invalid key range in shard name {name}: {e}"))
            })
        };
        let range = Self::new(decode(start)?, decode(end)?);
        if !range.is_unbounded() && range.start >= range.end {
            return Err(ShardctlError::InvalidArgument(format!(
                "empty key range in shard name {name}"
            )));
        }
        Ok(range)
    }

    /// Canonical shard name for a range
    pub fn shard_name(&self) -> String {
        format!("{}-{}", hex::encode(&self.start), hex::encode(&self.end))
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.shard_name())
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
