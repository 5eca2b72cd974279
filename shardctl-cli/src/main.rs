//! shardctl CLI
//!
//! Operator tool for a sharded, replicated database cluster.
//!
//! # Commands
//! - keyspaces and shards: `create-keyspace`, `create-shard`
//! - tablets: `init-tablet`, `change-tablet-role`, `scrap-tablet`, `delete-tablet`,
//!   `start-replication`, `stop-replication`
//! - reparenting: `init-shard-master`, `planned-reparent-shard`,
//!   `emergency-reparent-shard`, `tablet-externally-reparented`, `reparent-tablet`
//! - graphs: `rebuild-shard-graph`, `rebuild-keyspace-graph`,
//!   `rebuild-replication-graph`, `validate-shard`, `shard-replication-positions`
//! - reads: `get-keyspace`, `get-shard`, `get-srv-shard`, `get-srv-keyspace`,
//!   `get-end-points`, `get-shard-replication`, `list-tablets`, `resolve-shard`
//! - `config` - Show or edit configuration
//!
//! # Configuration
//! Config file: ~/.shardctl/config.toml

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shardctl_agent::HttpAgentClient;
use shardctl_core::{ShardingColumnType, TabletAlias, TabletRole};
use shardctl_reparent::ReparentConfig;
use shardctl_topo::{SledTopo, TopologyClient};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

mod commands;
mod config;
mod flags;
mod symbols;

use commands::reparent::{ReparentArgs, ReparentKind};
use commands::{graph, inspect, keyspace, reparent, tablet, Session};

#[derive(Parser)]
#[command(name = "shardctl")]
#[command(about = "Sharded database cluster control")]
#[command(version)]
struct Cli {
    /// Topology store directory (overrides config file)
    #[arg(long, global = true, env = "SHARDCTL_TOPO_PATH")]
    topo_path: Option<PathBuf>,

    /// URL scheme used to reach node agents (overrides config file)
    #[arg(long, global = true, env = "SHARDCTL_AGENT_SCHEME")]
    agent_scheme: Option<String>,

    /// Transport timeout for a single agent request, in seconds
    #[arg(long, global = true, env = "SHARDCTL_AGENT_TIMEOUT")]
    agent_timeout: Option<u64>,

    /// Log state transitions
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    // ===== Keyspaces and Shards =====
    /// Create a keyspace
    CreateKeyspace {
        keyspace: String,

        #[arg(long, default_value = "")]
        sharding_column_name: String,

        /// unset, uint64 or bytes
        #[arg(long, default_value = "unset")]
        sharding_column_type: ShardingColumnType,

        /// Redirects such as replica:source_keyspace,master:source_keyspace
        #[arg(long)]
        served_from: Option<String>,
    },

    /// Create a shard; its key range comes from its name
    CreateShard {
        /// keyspace/shard
        keyspace_shard: String,
    },

    // ===== Tablets =====
    /// Register a tablet
    InitTablet {
        /// cell-uid
        tablet: TabletAlias,

        /// idle, replica or spare
        role: TabletRole,

        #[arg(long)]
        hostname: String,

        /// Named ports such as vt:15000,mysql:3306
        #[arg(long)]
        ports: Option<String>,

        #[arg(long)]
        keyspace: Option<String>,

        #[arg(long)]
        shard: Option<String>,

        /// Tags such as dc:east
        #[arg(long)]
        tags: Option<String>,
    },

    /// Change a tablet's role in the topology
    ChangeTabletRole {
        tablet: TabletAlias,
        role: TabletRole,

        /// Allow going back to idle
        #[arg(short, long)]
        force: bool,
    },

    /// Decommission a tablet
    ScrapTablet {
        tablet: TabletAlias,

        /// Do not contact the tablet's agent
        #[arg(short, long)]
        force: bool,
    },

    /// Remove an idle or scrapped tablet record
    DeleteTablet { tablet: TabletAlias },

    /// Start replication on a tablet
    StartReplication { tablet: TabletAlias },

    /// Stop replication on a tablet
    StopReplication { tablet: TabletAlias },

    // ===== Reparenting =====
    /// Make a tablet the first master of a shard
    InitShardMaster {
        keyspace_shard: String,
        tablet: TabletAlias,

        /// Replace an existing master
        #[arg(short, long)]
        force: bool,
    },

    /// Move mastership while the current master is healthy
    PlannedReparentShard {
        keyspace_shard: String,
        tablet: TabletAlias,
    },

    /// Move mastership away from a dead master
    EmergencyReparentShard {
        keyspace_shard: String,
        tablet: TabletAlias,
    },

    /// Record a mastership change made outside shardctl
    TabletExternallyReparented { tablet: TabletAlias },

    /// Point one tablet at the current shard master
    ReparentTablet { tablet: TabletAlias },

    // ===== Graphs =====
    /// Recompute a shard's cells and rebuild its serving graph
    RebuildShardGraph { keyspace_shard: String },

    /// Rebuild the serving graph of a keyspace in every cell
    RebuildKeyspaceGraph { keyspace: String },

    /// Rebuild replication graphs from tablet records
    RebuildReplicationGraph {
        /// Comma separated cells
        cells: String,

        /// Comma separated keyspaces
        keyspaces: String,
    },

    /// Check a shard's master and replication links
    ValidateShard {
        keyspace_shard: String,

        /// Also compare live replication state
        #[arg(long)]
        ping_tablets: bool,
    },

    /// Show replication positions, most advanced first
    ShardReplicationPositions { keyspace_shard: String },

    // ===== Reads =====
    /// Show a keyspace record
    GetKeyspace { keyspace: String },

    /// Show a shard record
    GetShard { keyspace_shard: String },

    /// Show a shard's serving record in a cell
    GetSrvShard { cell: String, keyspace_shard: String },

    /// Show a keyspace's serving record in a cell
    GetSrvKeyspace { cell: String, keyspace: String },

    /// Show serving addresses of one role
    GetEndPoints {
        cell: String,
        keyspace_shard: String,
        role: TabletRole,
    },

    /// Show a shard's replication graph in a cell
    GetShardReplication { cell: String, keyspace_shard: String },

    /// List tablets of a cell
    ListTablets {
        /// Defaults to cli.default_cell
        cell: Option<String>,
    },

    /// Find the shard serving a keyspace id
    ResolveShard {
        cell: String,
        keyspace: String,

        /// Decimal or 0x-prefixed hex
        keyspace_id: String,

        #[arg(long, default_value = "master")]
        role: TabletRole,
    },

    /// Show or initialize configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show current configuration
    Show,

    /// Show config file path
    Path,

    /// Initialize config file with defaults
    Init {
        /// Overwrite existing config
        #[arg(short, long)]
        force: bool,
    },

    /// Set a configuration value
    Set {
        /// Configuration key (e.g., topo.path, agent.scheme)
        key: String,
        /// Value to set
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::INFO
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Commands::Config { command } = cli.command {
        return handle_config_command(command);
    }

    // Load configuration from ~/.shardctl/config.toml; flags override it
    let cfg = config::load_config();
    let topo_path = cli.topo_path.unwrap_or(cfg.topo.path);
    let scheme = cli.agent_scheme.unwrap_or(cfg.agent.scheme);
    let request_timeout =
        Duration::from_secs(cli.agent_timeout.unwrap_or(cfg.agent.request_timeout_secs));

    let topo = Arc::new(
        SledTopo::open(&topo_path)
            .with_context(|| format!("Failed to open topology at {}", topo_path.display()))?,
    );
    let agent = Arc::new(
        HttpAgentClient::new(&scheme, request_timeout).context("Failed to create agent client")?,
    );
    let reparent_config = ReparentConfig::from_env().context("Invalid reparent configuration")?;
    let session = Session::new(topo.clone(), agent, reparent_config, cfg.cli.default_cell);

    let result = run(&session, cli.command).await;
    topo.flush().context("Failed to flush topology")?;
    result
}

async fn run(session: &Session, command: Commands) -> Result<()> {
    match command {
        Commands::CreateKeyspace {
            keyspace,
            sharding_column_name,
            sharding_column_type,
            served_from,
        } => {
            let served_from = served_from
                .as_deref()
                .map(flags::parse_served_from)
                .transpose()?
                .unwrap_or_default();
            let args = keyspace::CreateKeyspaceArgs {
                name: keyspace,
                sharding_column_name,
                sharding_column_type,
                served_from,
            };
            keyspace::create_keyspace(session, args).await?;
        }

        Commands::CreateShard { keyspace_shard } => {
            let (ks, shard) = flags::parse_keyspace_shard(&keyspace_shard)?;
            keyspace::create_shard(session, &ks, &shard).await?;
        }

        Commands::InitTablet {
            tablet,
            role,
            hostname,
            ports,
            keyspace,
            shard,
            tags,
        } => {
            let args = tablet::InitTabletArgs {
                alias: tablet,
                role,
                hostname,
                ports: ports.as_deref().map(flags::parse_ports).transpose()?.unwrap_or_default(),
                keyspace,
                shard,
                tags: tags.as_deref().map(flags::parse_map).transpose()?.unwrap_or_default(),
            };
            tablet::init(session, args).await?;
        }

        Commands::ChangeTabletRole {
            tablet,
            role,
            force,
        } => tablet::change_role(session, &tablet, role, force).await?,

        Commands::ScrapTablet { tablet, force } => tablet::scrap(session, &tablet, force).await?,

        Commands::DeleteTablet { tablet } => tablet::delete(session, &tablet).await?,

        Commands::StartReplication { tablet } => {
            tablet::set_replication(session, &tablet, true).await?
        }

        Commands::StopReplication { tablet } => {
            tablet::set_replication(session, &tablet, false).await?
        }

        Commands::InitShardMaster {
            keyspace_shard,
            tablet,
            force,
        } => {
            run_reparent(session, &keyspace_shard, tablet, ReparentKind::InitMaster { force })
                .await?
        }

        Commands::PlannedReparentShard {
            keyspace_shard,
            tablet,
        } => run_reparent(session, &keyspace_shard, tablet, ReparentKind::Planned).await?,

        Commands::EmergencyReparentShard {
            keyspace_shard,
            tablet,
        } => run_reparent(session, &keyspace_shard, tablet, ReparentKind::Emergency).await?,

        Commands::TabletExternallyReparented { tablet } => {
            // the shard comes from the tablet's own record
            let record = session.topo.get_tablet(&tablet).await?.into_inner();
            let (Some(keyspace), Some(shard)) = (record.keyspace, record.shard) else {
                anyhow::bail!("Tablet {} is not assigned to a shard", tablet);
            };
            let args = ReparentArgs {
                keyspace,
                shard,
                new_master: tablet,
                kind: ReparentKind::External,
            };
            reparent::run(session, args).await?;
        }

        Commands::ReparentTablet { tablet } => reparent::reparent_tablet(session, &tablet).await?,

        Commands::RebuildShardGraph { keyspace_shard } => {
            let (ks, shard) = flags::parse_keyspace_shard(&keyspace_shard)?;
            graph::rebuild_shard_graph(session, &ks, &shard).await?;
        }

        Commands::RebuildKeyspaceGraph { keyspace } => {
            graph::rebuild_keyspace_graph(session, &keyspace).await?
        }

        Commands::RebuildReplicationGraph { cells, keyspaces } => {
            let cells = flags::parse_list(&cells);
            let keyspaces = flags::parse_list(&keyspaces);
            graph::rebuild_replication_graph(session, &cells, &keyspaces).await?;
        }

        Commands::ValidateShard {
            keyspace_shard,
            ping_tablets,
        } => {
            let (ks, shard) = flags::parse_keyspace_shard(&keyspace_shard)?;
            graph::validate_shard(session, &ks, &shard, ping_tablets).await?;
        }

        Commands::ShardReplicationPositions { keyspace_shard } => {
            let (ks, shard) = flags::parse_keyspace_shard(&keyspace_shard)?;
            graph::shard_replication_positions(session, &ks, &shard).await?;
        }

        Commands::GetKeyspace { keyspace } => inspect::get_keyspace(session, &keyspace).await?,

        Commands::GetShard { keyspace_shard } => {
            let (ks, shard) = flags::parse_keyspace_shard(&keyspace_shard)?;
            inspect::get_shard(session, &ks, &shard).await?;
        }

        Commands::GetSrvShard {
            cell,
            keyspace_shard,
        } => {
            let (ks, shard) = flags::parse_keyspace_shard(&keyspace_shard)?;
            inspect::get_srv_shard(session, &cell, &ks, &shard).await?;
        }

        Commands::GetSrvKeyspace { cell, keyspace } => {
            inspect::get_srv_keyspace(session, &cell, &keyspace).await?
        }

        Commands::GetEndPoints {
            cell,
            keyspace_shard,
            role,
        } => {
            let (ks, shard) = flags::parse_keyspace_shard(&keyspace_shard)?;
            inspect::get_end_points(session, &cell, &ks, &shard, role).await?;
        }

        Commands::GetShardReplication {
            cell,
            keyspace_shard,
        } => {
            let (ks, shard) = flags::parse_keyspace_shard(&keyspace_shard)?;
            inspect::get_shard_replication(session, &cell, &ks, &shard).await?;
        }

        Commands::ListTablets { cell } => {
            let cell = session.cell_or_default(cell);
            inspect::list_tablets(session, &cell).await?;
        }

        Commands::ResolveShard {
            cell,
            keyspace,
            keyspace_id,
            role,
        } => {
            let keyspace_id = flags::parse_keyspace_id(&keyspace_id)?;
            inspect::resolve_shard(session, &cell, &keyspace, keyspace_id, role).await?;
        }

        Commands::Config { command } => handle_config_command(command)?,
    }

    Ok(())
}

async fn run_reparent(
    session: &Session,
    keyspace_shard: &str,
    new_master: TabletAlias,
    kind: ReparentKind,
) -> Result<()> {
    let (keyspace, shard) = flags::parse_keyspace_shard(keyspace_shard)?;
    let args = ReparentArgs {
        keyspace,
        shard,
        new_master,
        kind,
    };
    reparent::run(session, args).await
}

/// Handle config subcommands
fn handle_config_command(command: Option<ConfigCommands>) -> Result<()> {
    use console::style;

    match command {
        None | Some(ConfigCommands::Show) => {
            let cfg = config::load_config();
            println!();
            println!("{}", style("shardctl Configuration").bold().underlined());
            println!();
            println!("{}", style("[topo]").cyan());
            println!("  path = \"{}\"", cfg.topo.path.display());
            println!();
            println!("{}", style("[agent]").cyan());
            println!("  scheme = \"{}\"", cfg.agent.scheme);
            println!("  request_timeout_secs = {}", cfg.agent.request_timeout_secs);
            println!();
            println!("{}", style("[cli]").cyan());
            println!("  default_cell = \"{}\"", cfg.cli.default_cell);
            println!();

            if let Ok(path) = config::config_file_path() {
                println!("{} {}", style("Config file:").dim(), path.display());
                if !path.exists() {
                    println!(
                        "{} Run '{}' to create it",
                        style("(not created yet)").yellow(),
                        style("shardctl config init").green()
                    );
                }
            }
        }

        Some(ConfigCommands::Path) => {
            if let Ok(path) = config::config_file_path() {
                println!("{}", path.display());
            }
        }

        Some(ConfigCommands::Init { force }) => {
            let path = config::config_file_path()?;
            if path.exists() && !force {
                println!(
                    "{} Config file already exists at {}",
                    style(symbols::WARN).yellow(),
                    path.display()
                );
                println!("Use --force to overwrite");
                return Ok(());
            }

            config::save_config(&config::ShardctlConfig::default())?;
            println!(
                "{} Config file created at {}",
                style(symbols::CHECK).green(),
                path.display()
            );
        }

        Some(ConfigCommands::Set { key, value }) => {
            let mut cfg = config::load_config();
            cfg.set(&key, value)?;
            config::save_config(&cfg)?;
            println!("{} Configuration updated", style(symbols::CHECK).green());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_served_from_help_example_parses() {
        let command = Cli::command();
        let create = command
            .find_subcommand("create-keyspace")
            .expect("create-keyspace subcommand");
        let help = create
            .get_arguments()
            .find(|arg| arg.get_id() == "served_from")
            .and_then(|arg| arg.get_help())
            .expect("served-from help")
            .to_string();
        let example = help.rsplit(' ').next().unwrap();

        let served = flags::parse_served_from(example).unwrap();
        assert_eq!(served[&TabletRole::Replica], "source_keyspace");
        assert_eq!(served.len(), 2);
    }

    #[test]
    fn test_parse_reparent() {
        let cli = Cli::try_parse_from([
            "shardctl",
            "planned-reparent-shard",
            "test_keyspace/0",
            "test_nj-0000000002",
        ])
        .unwrap();
        match cli.command {
            Commands::PlannedReparentShard {
                keyspace_shard,
                tablet,
            } => {
                assert_eq!(keyspace_shard, "test_keyspace/0");
                assert_eq!(tablet, TabletAlias::new("test_nj", 2));
            }
            _ => panic!("wrong subcommand"),
        }
    }

    #[test]
    fn test_parse_rejects_bad_role() {
        assert!(Cli::try_parse_from([
            "shardctl",
            "change-tablet-role",
            "test_nj-0000000002",
            "primary",
        ])
        .is_err());
    }

    #[test]
    fn test_resolve_shard_defaults_to_master() {
        let cli = Cli::try_parse_from(["shardctl", "resolve-shard", "test_nj", "ks", "0x10"]).unwrap();
        match cli.command {
            Commands::ResolveShard { role, .. } => assert_eq!(role, TabletRole::Master),
            _ => panic!("wrong subcommand"),
        }
    }
}
