//! Keyspace Commands

use super::Session;
use crate::symbols;
use anyhow::Result;
use console::style;
use shardctl_core::{Keyspace, ShardingColumnType, TabletRole};
use std::collections::BTreeMap;

/// Create-keyspace configuration
pub struct CreateKeyspaceArgs {
    pub name: String,
    pub sharding_column_name: String,
    pub sharding_column_type: ShardingColumnType,
    pub served_from: BTreeMap<TabletRole, String>,
}

pub async fn create_keyspace(session: &Session, args: CreateKeyspaceArgs) -> Result<()> {
    let keyspace = Keyspace {
        sharding_column_name: args.sharding_column_name,
        sharding_column_type: args.sharding_column_type,
        served_from: args.served_from,
    };
    session.admin.create_keyspace(&args.name, &keyspace).await?;
    println!("{} Created keyspace {}", style(symbols::CHECK).green(), args.name);
    Ok(())
}

pub async fn create_shard(session: &Session, keyspace: &str, shard: &str) -> Result<()> {
    let record = session.admin.create_shard(keyspace, shard).await?;
    println!(
        "{} Created shard {}/{} covering {}",
        style(symbols::CHECK).green(),
        keyspace,
        record.name,
        record.key_range
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::session;
    use shardctl_topo::TopologyClient;

    #[tokio::test]
    async fn test_create_keyspace_with_served_from() {
        let (session, _agent) = session();
        let args = CreateKeyspaceArgs {
            name: "dest".into(),
            sharding_column_name: "user_id".into(),
            sharding_column_type: ShardingColumnType::Uint64,
            served_from: BTreeMap::from([(TabletRole::Replica, "source".to_string())]),
        };

        create_keyspace(&session, args).await.unwrap();

        let keyspace = session.topo.get_keyspace("dest").await.unwrap();
        assert_eq!(keyspace.sharding_column_name, "user_id");
        assert_eq!(keyspace.served_from[&TabletRole::Replica], "source");
    }

    #[tokio::test]
    async fn test_create_keyspace_served_from_itself() {
        let (session, _agent) = session();
        let args = CreateKeyspaceArgs {
            name: "loop".into(),
            sharding_column_name: String::new(),
            sharding_column_type: ShardingColumnType::Unset,
            served_from: BTreeMap::from([(TabletRole::Master, "loop".to_string())]),
        };

        assert!(create_keyspace(&session, args).await.is_err());
    }

    #[tokio::test]
    async fn test_create_shard_parses_range() {
        let (session, _agent) = session();
        session
            .admin
            .create_keyspace("ks", &Keyspace::default())
            .await
            .unwrap();

        create_shard(&session, "ks", "40-80").await.unwrap();

        let shard = session.topo.get_shard("ks", "40-80").await.unwrap().into_inner();
        assert_eq!(shard.key_range.start, vec![0x40]);
        assert_eq!(shard.key_range.end, vec![0x80]);
    }
}
