//! CLI configuration
//!
//! Config directory: ~/.shardctl/
//!
//! Config file format (~/.shardctl/config.toml):
//! ```toml
//! [topo]
//! path = "/var/lib/shardctl/topo"
//!
//! [agent]
//! scheme = "http"
//! request_timeout_secs = 10
//!
//! [cli]
//! default_cell = "test_nj"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Structure of ~/.shardctl/config.toml
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ShardctlConfig {
    /// Topology store settings
    #[serde(default)]
    pub topo: TopoSettings,

    /// Node agent settings
    #[serde(default)]
    pub agent: AgentSettings,

    /// CLI-specific settings
    #[serde(default)]
    pub cli: CliSettings,
}

/// Topology store settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopoSettings {
    /// Directory of the sled topology store
    #[serde(default = "default_topo_path")]
    pub path: PathBuf,
}

impl Default for TopoSettings {
    fn default() -> Self {
        Self {
            path: default_topo_path(),
        }
    }
}

fn default_topo_path() -> PathBuf {
    if let Ok(path) = std::env::var("SHARDCTL_TOPO_PATH") {
        return PathBuf::from(path);
    }
    dirs::home_dir()
        .map(|home| home.join(".shardctl").join("topo"))
        .unwrap_or_else(|| PathBuf::from("shardctl-topo"))
}

/// Node agent settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentSettings {
    /// URL scheme used to reach agents
    #[serde(default = "default_agent_scheme")]
    pub scheme: String,

    /// Transport timeout for a single agent request
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            scheme: default_agent_scheme(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_agent_scheme() -> String {
    std::env::var("SHARDCTL_AGENT_SCHEME").unwrap_or_else(|_| "http".to_string())
}

fn default_request_timeout_secs() -> u64 {
    60
}

/// CLI-specific settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CliSettings {
    /// Cell used by commands that take an optional cell
    #[serde(default = "default_cell")]
    pub default_cell: String,
}

impl Default for CliSettings {
    fn default() -> Self {
        Self {
            default_cell: default_cell(),
        }
    }
}

fn default_cell() -> String {
    std::env::var("SHARDCTL_CELL").unwrap_or_else(|_| shardctl_core::DEFAULT_CELL.to_string())
}

impl ShardctlConfig {
    /// Apply a `section.key = value` assignment
    pub fn set(&mut self, key: &str, value: String) -> Result<()> {
        match key {
            "topo.path" => self.topo.path = PathBuf::from(value),
            "agent.scheme" => self.agent.scheme = value,
            "agent.request_timeout_secs" => {
                self.agent.request_timeout_secs = value
                    .parse()
                    .with_context(|| format!("Invalid number of seconds: {value}"))?;
            }
            "cli.default_cell" => self.cli.default_cell = value,
            _ => {
                anyhow::bail!(
                    "Unknown config key: {}. Valid keys: topo.path, agent.scheme, agent.request_timeout_secs, cli.default_cell",
                    key
                );
            }
        }
        Ok(())
    }
}

/// Get the config directory path (~/.shardctl/)
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    let config_dir = home.join(".shardctl");

    if !config_dir.exists() {
        fs::create_dir_all(&config_dir)
            .context("Failed to create config directory ~/.shardctl/")?;
    }

    Ok(config_dir)
}

/// Get the config file path
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

/// Load configuration, falling back to defaults if the file doesn't exist
pub fn load_config() -> ShardctlConfig {
    match config_file_path() {
        Ok(path) if path.exists() => match load_from(&path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {:#}", e);
                ShardctlConfig::default()
            }
        },
        _ => ShardctlConfig::default(),
    }
}

pub fn load_from(path: &Path) -> Result<ShardctlConfig> {
    let content = fs::read_to_string(path).context("Failed to read config file")?;
    toml::from_str(&content).context("Failed to parse config file")
}

/// Save configuration to ~/.shardctl/config.toml
pub fn save_config(config: &ShardctlConfig) -> Result<()> {
    save_to(&config_file_path()?, config)
}

pub fn save_to(path: &Path, config: &ShardctlConfig) -> Result<()> {
    let content = toml::to_string_pretty(config).context("Failed to serialize config")?;
    fs::write(path, content).context("Failed to write config file")?;
    Ok(())
}
