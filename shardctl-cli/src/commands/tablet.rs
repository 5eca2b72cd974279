//! Tablet Commands
//!
//! Registration, role changes, decommissioning and replication control.

use super::Session;
use crate::symbols;
use anyhow::{Context, Result};
use console::style;
use shardctl_core::{Tablet, TabletAlias, TabletRole};
use std::collections::BTreeMap;

/// Init-tablet configuration
pub struct InitTabletArgs {
    pub alias: TabletAlias,
    pub role: TabletRole,
    pub hostname: String,
    pub ports: BTreeMap<String, u16>,
    pub keyspace: Option<String>,
    pub shard: Option<String>,
    pub tags: BTreeMap<String, String>,
}

impl InitTabletArgs {
    fn into_tablet(self) -> Tablet {
        let mut tablet = Tablet::new(self.alias, self.hostname);
        tablet.port_map = self.ports;
        tablet.keyspace = self.keyspace;
        tablet.shard = self.shard;
        tablet.role = self.role;
        tablet.tags = self.tags;
        tablet
    }
}

pub async fn init(session: &Session, args: InitTabletArgs) -> Result<()> {
    let tablet = session.admin.init_tablet(args.into_tablet()).await?;
    println!(
        "{} Registered {} as {}",
        style(symbols::CHECK).green(),
        tablet.alias,
        tablet.role
    );
    Ok(())
}

pub async fn change_role(
    session: &Session,
    alias: &TabletAlias,
    role: TabletRole,
    force: bool,
) -> Result<()> {
    let tablet = session.admin.change_tablet_role(alias, role, force).await?;
    println!(
        "{} {} is now {}",
        style(symbols::CHECK).green(),
        tablet.alias,
        tablet.role
    );
    Ok(())
}

pub async fn scrap(session: &Session, alias: &TabletAlias, force: bool) -> Result<()> {
    session
        .admin
        .scrap_tablet(alias, force)
        .await
        .with_context(|| format!("Failed to scrap {}", alias))?;
    println!("{} Scrapped {}", style(symbols::CHECK).green(), alias);
    Ok(())
}

pub async fn delete(session: &Session, alias: &TabletAlias) -> Result<()> {
    session.admin.delete_tablet(alias).await?;
    println!("{} Deleted {}", style(symbols::CHECK).green(), alias);
    Ok(())
}

pub async fn set_replication(session: &Session, alias: &TabletAlias, running: bool) -> Result<()> {
    if running {
        session.admin.start_replication(alias).await?;
    } else {
        session.admin.stop_replication(alias).await?;
    }
    println!(
        "{} Replication {} on {}",
        style(symbols::CHECK).green(),
        if running { "started" } else { "stopped" },
        alias
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::{alias, session, KEYSPACE};
    use shardctl_topo::TopologyClient;

    fn init_args(uid: u32, role: TabletRole) -> InitTabletArgs {
        InitTabletArgs {
            alias: alias(uid),
            role,
            hostname: format!("host{uid}"),
            ports: BTreeMap::from([("vt".to_string(), 15000), ("mysql".to_string(), 3306)]),
            keyspace: Some(KEYSPACE.to_string()),
            shard: Some("-80".to_string()),
            tags: BTreeMap::from([("dc".to_string(), "east".to_string())]),
        }
    }

    async fn keyspace_session() -> Session {
        let (session, _agent) = session();
        session
            .admin
            .create_keyspace(KEYSPACE, &Default::default())
            .await
            .unwrap();
        session
    }

    #[tokio::test]
    async fn test_init_tablet_records_flags() {
        let session = keyspace_session().await;

        init(&session, init_args(7, TabletRole::Spare)).await.unwrap();

        let tablet = session.topo.get_tablet(&alias(7)).await.unwrap().into_inner();
        assert_eq!(tablet.role, TabletRole::Spare);
        assert_eq!(tablet.addr().as_deref(), Some("host7:15000"));
        assert_eq!(tablet.tags["dc"], "east");

        let shard = session.topo.get_shard(KEYSPACE, "-80").await.unwrap().into_inner();
        assert!(shard.cells.contains("test_nj"));
    }

    #[tokio::test]
    async fn test_init_tablet_refuses_master() {
        let session = keyspace_session().await;

        let err = init(&session, init_args(7, TabletRole::Master)).await.unwrap_err();
        assert!(err.to_string().contains("init-shard-master"));
    }

    #[tokio::test]
    async fn test_forced_scrap_then_delete() {
        let session = keyspace_session().await;
        init(&session, init_args(7, TabletRole::Replica)).await.unwrap();

        assert!(delete(&session, &alias(7)).await.is_err());
        scrap(&session, &alias(7), true).await.unwrap();
        delete(&session, &alias(7)).await.unwrap();

        assert!(session.topo.get_tablet(&alias(7)).await.is_err());
    }
}
