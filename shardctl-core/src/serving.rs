//! Serving graph derivation
//!
//! Serving records are pure functions of topology. They are recomputed
//! wholesale on every change and written by the topology layer.

use crate::records::{
    EndPoint, Keyspace, KeyspacePartition, Shard, ShardReference, SrvKeyspace, SrvShard,
};
use crate::tablet::{Tablet, TabletRole};

/// Roles that get a partitioning in the keyspace serving record
pub const SERVED_ROLES: [TabletRole; 2] = [TabletRole::Master, TabletRole::Replica];

impl From<&Tablet> for EndPoint {
    fn from(tablet: &Tablet) -> Self {
        EndPoint {
            uid: tablet.alias.uid,
            host: tablet.hostname.clone(),
            named_port_map: tablet.port_map.clone(),
        }
    }
}

/// Derive the serving record of one shard as seen from `cell`.
///
/// Only tablets of this cell assigned to the shard contribute. A tablet
/// claiming the master role is published only if the shard record names it
/// as master, so the serving graph can never lead the committed topology.
pub fn derive_srv_shard(keyspace: &str, shard: &Shard, tablets: &[Tablet], cell: &str) -> SrvShard {
    let mut srv = SrvShard {
        name: shard.name.clone(),
        key_range: shard.key_range.clone(),
        master_cell: shard.master_cell().map(str::to_string),
        endpoints: Default::default(),
    };

    for tablet in tablets {
        if tablet.alias.cell != cell || !tablet.is_in_shard(keyspace, &shard.name) {
            continue;
        }
        let publish = match tablet.role {
            TabletRole::Master => shard.master_alias.as_ref() == Some(&tablet.alias),
            role => role.is_serving(),
        };
        if publish {
            srv.endpoints
                .entry(tablet.role)
                .or_default()
                .push(EndPoint::from(tablet));
        }
    }

    for endpoints in srv.endpoints.values_mut() {
        endpoints.sort_by_key(|endpoint| endpoint.uid);
    }
    srv
}

/// Derive a keyspace's serving record from its shards.
/// Every served role is partitioned over all shards, ordered by range start.
pub fn derive_srv_keyspace(keyspace: &Keyspace, shards: &[Shard]) -> SrvKeyspace {
    let mut references: Vec<ShardReference> = shards
        .iter()
        .map(|shard| ShardReference {
            name: shard.name.clone(),
            key_range: shard.key_range.clone(),
        })
        .collect();
    references.sort_by(|a, b| {
        a.key_range
            .start
            .cmp(&b.key_range.start)
            .then_with(|| a.name.cmp(&b.name))
    });

    let mut srv = SrvKeyspace {
        partitions: Default::default(),
        sharding_column_name: keyspace.sharding_column_name.clone(),
        sharding_column_type: keyspace.sharding_column_type,
        served_from: keyspace.served_from.clone(),
    };
    if !references.is_empty() {
        for role in SERVED_ROLES {
            srv.partitions.insert(
                role,
                KeyspacePartition {
                    shard_references: references.clone(),
                },
            );
        }
    }
    srv
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyrange::KeyRange;
    use crate::tablet::TabletAlias;

    fn tablet(cell: &str, uid: u32, role: TabletRole) -> Tablet {
        Tablet::new(TabletAlias::new(cell, uid), format!("host{uid}"))
            .with_port("vt", 15000 + uid as u16)
            .assigned("test_keyspace", "0", role)
    }

    fn shard_with_master(alias: TabletAlias) -> Shard {
        let mut shard = Shard::new("0", KeyRange::full());
        shard.master_alias = Some(alias);
        shard
    }

    #[test]
    fn test_only_committed_master_is_published() {
        let shard = shard_with_master(TabletAlias::new("test_nj", 1));
        let tablets = vec![
            tablet("test_nj", 2, TabletRole::Master),
            tablet("test_nj", 1, TabletRole::Master),
            tablet("test_nj", 3, TabletRole::Replica),
        ];
        let srv = derive_srv_shard("test_keyspace", &shard, &tablets, "test_nj");
        let masters = srv.endpoints_for(TabletRole::Master);
        assert_eq!(masters.len(), 1);
        assert_eq!(masters[0].uid, 1);
        assert_eq!(srv.endpoints_for(TabletRole::Replica).len(), 1);
    }

    #[test]
    fn test_spares_and_other_cells_are_skipped() {
        let shard = shard_with_master(TabletAlias::new("test_nj", 1));
        let tablets = vec![
            tablet("test_nj", 1, TabletRole::Master),
            tablet("test_nj", 4, TabletRole::Spare),
            tablet("test_ny", 5, TabletRole::Replica),
        ];
        let srv = derive_srv_shard("test_keyspace", &shard, &tablets, "test_ny");
        assert!(srv.endpoints_for(TabletRole::Master).is_empty());
        assert!(srv.endpoints_for(TabletRole::Spare).is_empty());
        assert_eq!(srv.endpoints_for(TabletRole::Replica)[0].uid, 5);
        // master cell is global, not per serving cell
        assert_eq!(srv.master_cell.as_deref(), Some("test_nj"));
    }

    #[test]
    fn test_endpoints_sorted_by_uid() {
        let shard = Shard::new("0", KeyRange::full());
        let tablets = vec![
            tablet("c", 9, TabletRole::Replica),
            tablet("c", 3, TabletRole::Replica),
        ];
        let srv = derive_srv_shard("test_keyspace", &shard, &tablets, "c");
        let uids: Vec<u32> = srv
            .endpoints_for(TabletRole::Replica)
            .iter()
            .map(|e| e.uid)
            .collect();
        assert_eq!(uids, vec![3, 9]);
        assert!(srv.master_cell.is_none());
    }

    #[test]
    fn test_keyspace_partitions_sorted_by_start() {
        let shards = vec![
            Shard::new("80-", KeyRange::from_shard_name("80-").unwrap()),
            Shard::new("-80", KeyRange::from_shard_name("-80").unwrap()),
        ];
        let srv = derive_srv_keyspace(&Keyspace::default(), &shards);
        let names: Vec<&str> = srv.partitions[&TabletRole::Replica]
            .shard_references
            .iter()
            .map(|r| r.name.as_str())
            .collect();
        assert_eq!(names, vec!["-80", "80-"]);
        assert!(!srv.partitions.contains_key(&TabletRole::Spare));
    }

    #[test]
    fn test_keyspace_without_shards_is_empty() {
        assert!(derive_srv_keyspace(&Keyspace::default(), &[]).is_empty());
    }
}
