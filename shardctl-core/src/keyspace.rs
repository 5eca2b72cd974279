//! Keyspace partitioning model
//!
//! In-memory view of how a keyspace is split into shards for each serving
//! role, loaded from the keyspace's serving record. Pure, no I/O.

use crate::error::{Result, ShardctlError};
use crate::keyrange::{pack_keyspace_id, KeyRange};
use crate::records::{ShardReference, ShardingColumnType, SrvKeyspace};
use crate::tablet::TabletRole;
use std::collections::BTreeMap;
use thiserror::Error;

/// Why a role's partitioning was rejected at load time
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PartitionError {
    #[error("{role} partition does not start at the minimum key (first shard {shard})")]
    MissingStart { role: TabletRole, shard: String },

    #[error("{role} partition has a gap or overlap between {previous} and {shard}")]
    NotContiguous {
        role: TabletRole,
        previous: String,
        shard: String,
    },

    #[error("{role} partition shard {shard} has an empty key range")]
    EmptyRange { role: TabletRole, shard: String },

    #[error("{role} partition does not end at the unbounded maximum (last shard {shard})")]
    MissingEnd { role: TabletRole, shard: String },
}

/// A keyspace's shard partitioning, keyed by role
#[derive(Debug, Clone)]
pub struct KeyspaceModel {
    name: String,
    partitions: BTreeMap<TabletRole, Vec<ShardReference>>,
    sharding_column_name: String,
    sharding_column_type: ShardingColumnType,
    served_from: BTreeMap<TabletRole, String>,
}

impl KeyspaceModel {
    /// Build the model from a keyspace's serving record.
    ///
    /// A missing or empty record is `EmptyKeyspace`; a malformed partitioning
    /// is an `Operational` error naming the keyspace and what is wrong.
    pub fn load(name: &str, record: Option<SrvKeyspace>) -> Result<Self> {
        let record = match record {
            Some(record) if !record.is_empty() => record,
            _ => return Err(ShardctlError::EmptyKeyspace(name.to_string())),
        };

        let mut partitions = BTreeMap::new();
        for (role, partition) in record.partitions {
            validate_partition(role, &partition.shard_references)
                .map_err(|e| ShardctlError::operational(format!("keyspace {name}"), e))?;
            partitions.insert(role, partition.shard_references);
        }

        Ok(Self {
            name: name.to_string(),
            partitions,
            sharding_column_name: record.sharding_column_name,
            sharding_column_type: record.sharding_column_type,
            served_from: record.served_from,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sharding_column(&self) -> (&str, ShardingColumnType) {
        (&self.sharding_column_name, self.sharding_column_type)
    }

    /// Keyspace this role is redirected to, if it is being migrated
    pub fn served_from(&self, role: TabletRole) -> Option<&str> {
        self.served_from.get(&role).map(String::as_str)
    }

    /// Ordered shards serving `role`. A role without a partitioning yields
    /// an empty slice (a keyspace with no spares is valid).
    pub fn shards_for_role(&self, role: TabletRole) -> Result<&[ShardReference]> {
        require_role(role)?;
        Ok(self
            .partitions
            .get(&role)
            .map(Vec::as_slice)
            .unwrap_or(&[]))
    }

    pub fn shard_count(&self, role: TabletRole) -> Result<usize> {
        Ok(self.shards_for_role(role)?.len())
    }

    pub fn shard_names(&self, role: TabletRole) -> Result<Vec<&str>> {
        Ok(self
            .shards_for_role(role)?
            .iter()
            .map(|shard| shard.name.as_str())
            .collect())
    }

    /// Name of the shard whose range holds `keyspace_id` for `role`
    pub fn resolve_shard(&self, keyspace_id: u64, role: TabletRole) -> Result<&str> {
        if keyspace_id == 0 {
            return Err(ShardctlError::InvalidArgument(
                "keyspace_id is not set".to_string(),
            ));
        }
        require_role(role)?;

        let packed = pack_keyspace_id(keyspace_id);
        self.shards_for_role(role)?
            .iter()
            .find(|shard| shard.key_range.contains(&packed))
            .map(|shard| shard.name.as_str())
            .ok_or_else(|| ShardctlError::ShardNotFound {
                keyspace: self.name.clone(),
                keyspace_id,
                role,
            })
    }
}

fn require_role(role: TabletRole) -> Result<()> {
    if role == TabletRole::Unknown {
        return Err(ShardctlError::InvalidArgument("role is not set".to_string()));
    }
    Ok(())
}

/// Ranges must be sorted, contiguous, non-empty, and span `[MIN, MAX)`.
fn validate_partition(
    role: TabletRole,
    shards: &[ShardReference],
) -> std::result::Result<(), PartitionError> {
    let (Some(first), Some(last)) = (shards.first(), shards.last()) else {
        return Ok(());
    };

    if !significant(&first.key_range.start).is_empty() {
        return Err(PartitionError::MissingStart {
            role,
            shard: first.name.clone(),
        });
    }

    for shard in shards {
        if !shard.key_range.is_unbounded()
            && significant(&shard.key_range.start) >= significant(&shard.key_range.end)
        {
            return Err(PartitionError::EmptyRange {
                role,
                shard: shard.name.clone(),
            });
        }
    }

    for pair in shards.windows(2) {
        if !is_adjacent(&pair[0].key_range, &pair[1].key_range) {
            return Err(PartitionError::NotContiguous {
                role,
                previous: pair[0].name.clone(),
                shard: pair[1].name.clone(),
            });
        }
    }

    if !last.key_range.is_unbounded() {
        return Err(PartitionError::MissingEnd {
            role,
            shard: last.name.clone(),
        });
    }

    Ok(())
}

fn is_adjacent(previous: &KeyRange, next: &KeyRange) -> bool {
    !previous.is_unbounded() && significant(&previous.end) == significant(&next.start)
}

/// A boundary without trailing zero bytes; `40` and `4000` name the same key
fn significant(bound: &[u8]) -> &[u8] {
    let len = bound.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    &bound[..len]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::KeyspacePartition;
    use proptest::prelude::*;

    fn shard(name: &str) -> ShardReference {
        ShardReference {
            name: name.to_string(),
            key_range: KeyRange::from_shard_name(name).unwrap(),
        }
    }

    fn srv_keyspace(role: TabletRole, names: &[&str]) -> SrvKeyspace {
        let mut srv = SrvKeyspace::default();
        srv.partitions.insert(
            role,
            KeyspacePartition {
                shard_references: names.iter().map(|n| shard(n)).collect(),
            },
        );
        srv
    }

    #[test]
    fn test_load_missing_or_empty_record() {
        assert!(matches!(
            KeyspaceModel::load("ks", None),
            Err(ShardctlError::EmptyKeyspace(name)) if name == "ks"
        ));
        assert!(matches!(
            KeyspaceModel::load("ks", Some(SrvKeyspace::default())),
            Err(ShardctlError::EmptyKeyspace(_))
        ));
    }

    #[test]
    fn test_load_rejects_gap_with_keyspace_context() {
        let err = KeyspaceModel::load(
            "test_keyspace",
            Some(srv_keyspace(TabletRole::Master, &["-40", "80-"])),
        )
        .unwrap_err();
        match err {
            ShardctlError::Operational { context, source } => {
                assert!(context.contains("test_keyspace"));
                assert!(source.to_string().contains("gap or overlap"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_load_rejects_bounded_tail_and_late_start() {
        assert!(KeyspaceModel::load("ks", Some(srv_keyspace(TabletRole::Master, &["-80"]))).is_err());
        assert!(KeyspaceModel::load("ks", Some(srv_keyspace(TabletRole::Master, &["40-"]))).is_err());
    }

    #[test]
    fn test_boundaries_of_different_width_are_adjacent() {
        let model = KeyspaceModel::load(
            "ks",
            Some(srv_keyspace(TabletRole::Master, &["-40", "4000000000000000-"])),
        )
        .unwrap();
        assert_eq!(
            model.resolve_shard(0x3fff_ffff_ffff_ffff, TabletRole::Master).unwrap(),
            "-40"
        );
        assert_eq!(
            model.resolve_shard(0x4000_0000_0000_0000, TabletRole::Master).unwrap(),
            "4000000000000000-"
        );

        // same width padding does not hide a real gap or an empty range
        assert!(KeyspaceModel::load("ks", Some(srv_keyspace(TabletRole::Master, &["-40", "4001-"]))).is_err());
        assert!(KeyspaceModel::load(
            "ks",
            Some(srv_keyspace(TabletRole::Master, &["-40", "40-4000", "4000-"]))
        )
        .is_err());
    }

    #[test]
    fn test_shards_for_absent_role_is_empty() {
        let model =
            KeyspaceModel::load("ks", Some(srv_keyspace(TabletRole::Master, &["-80", "80-"]))).unwrap();
        assert!(model.shards_for_role(TabletRole::Spare).unwrap().is_empty());
        assert_eq!(model.shard_count(TabletRole::Master).unwrap(), 2);
        assert_eq!(model.shard_names(TabletRole::Master).unwrap(), vec!["-80", "80-"]);
    }

    #[test]
    fn test_resolve_shard() {
        let model = KeyspaceModel::load(
            "ks",
            Some(srv_keyspace(TabletRole::Master, &["-40", "40-80", "80-"])),
        )
        .unwrap();
        assert_eq!(model.resolve_shard(1, TabletRole::Master).unwrap(), "-40");
        assert_eq!(
            model.resolve_shard(0x4000_0000_0000_0000, TabletRole::Master).unwrap(),
            "40-80"
        );
        assert_eq!(model.resolve_shard(u64::MAX, TabletRole::Master).unwrap(), "80-");
    }

    #[test]
    fn test_resolve_shard_requires_arguments() {
        let model = KeyspaceModel::load("ks", Some(srv_keyspace(TabletRole::Master, &["0"]))).unwrap();
        assert!(matches!(
            model.resolve_shard(0, TabletRole::Master),
            Err(ShardctlError::InvalidArgument(_))
        ));
        assert!(matches!(
            model.resolve_shard(7, TabletRole::Unknown),
            Err(ShardctlError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_resolve_shard_without_partition_is_not_found() {
        let model = KeyspaceModel::load("ks", Some(srv_keyspace(TabletRole::Master, &["0"]))).unwrap();
        assert!(matches!(
            model.resolve_shard(7, TabletRole::Replica),
            Err(ShardctlError::ShardNotFound { .. })
        ));
    }

    fn partition_from_bounds(bounds: &[u64]) -> Vec<ShardReference> {
        let mut edges: Vec<Vec<u8>> = vec![Vec::new()];
        edges.extend(bounds.iter().map(|b| pack_keyspace_id(*b).to_vec()));
        edges.push(Vec::new());
        edges
            .windows(2)
            .map(|w| {
                let range = KeyRange::new(w[0].clone(), w[1].clone());
                ShardReference {
                    name: range.shard_name(),
                    key_range: range,
                }
            })
            .collect()
    }

    proptest! {
        #[test]
        fn prop_every_key_resolves_to_exactly_one_shard(
            bounds in proptest::collection::btree_set(1u64.., 0..12),
            key in 1u64..,
        ) {
            let bounds: Vec<u64> = bounds.into_iter().collect();
            let shards = partition_from_bounds(&bounds);
            let mut srv = SrvKeyspace::default();
            srv.partitions.insert(
                TabletRole::Replica,
                KeyspacePartition { shard_references: shards.clone() },
            );
            let model = KeyspaceModel::load("ks", Some(srv)).unwrap();

            let packed = pack_keyspace_id(key);
            let owners: Vec<_> = shards.iter().filter(|s| s.key_range.contains(&packed)).collect();
            prop_assert_eq!(owners.len(), 1);
            prop_assert_eq!(model.resolve_shard(key, TabletRole::Replica).unwrap(), owners[0].name.as_str());
        }

        #[test]
        fn prop_ranges_are_pairwise_disjoint(
            bounds in proptest::collection::btree_set(1u64.., 1..12),
        ) {
            let bounds: Vec<u64> = bounds.into_iter().collect();
            let shards = partition_from_bounds(&bounds);
            for (i, a) in shards.iter().enumerate() {
                for b in shards.iter().skip(i + 1) {
                    prop_assert!(!a.key_range.intersects(&b.key_range));
                }
            }
        }
    }
}
