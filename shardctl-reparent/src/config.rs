//! Reparent configuration
//!
//! Timeouts and retry bounds, loaded from defaults or environment variables.

use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

impl From<ConfigError> for shardctl_core::ShardctlError {
    fn from(err: ConfigError) -> Self {
        shardctl_core::ShardctlError::Configuration(err.to_string())
    }
}

/// Reparent configuration
#[derive(Debug, Clone)]
pub struct ReparentConfig {
    /// How long the old master gets to demote itself
    pub wait_time: Duration,

    /// Timeout for every other agent call
    pub rpc_timeout: Duration,

    /// How long the new master may take to reach the target position
    pub catchup_timeout: Duration,

    /// Retries for read-modify-write updates of tablet and shard records
    pub topo_retries: u32,
}

impl Default for ReparentConfig {
    fn default() -> Self {
        Self {
            wait_time: Duration::from_secs(30),
            rpc_timeout: Duration::from_secs(10),
            catchup_timeout: Duration::from_secs(30),
            topo_retries: 3,
        }
    }
}

impl ReparentConfig {
    /// Create configuration from environment variables, falling back to defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            wait_time: secs_from_env("SHARDCTL_WAIT_TIME")?.unwrap_or(defaults.wait_time),
            rpc_timeout: secs_from_env("SHARDCTL_RPC_TIMEOUT")?.unwrap_or(defaults.rpc_timeout),
            catchup_timeout: secs_from_env("SHARDCTL_CATCHUP_TIMEOUT")?
                .unwrap_or(defaults.catchup_timeout),
            topo_retries: match std::env::var("SHARDCTL_TOPO_RETRIES") {
                Ok(v) => v
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("SHARDCTL_TOPO_RETRIES".into(), v))?,
                Err(_) => defaults.topo_retries,
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_wait_time(mut self, wait_time: Duration) -> Self {
        self.wait_time = wait_time;
        self
    }

    pub fn with_rpc_timeout(mut self, rpc_timeout: Duration) -> Self {
        self.rpc_timeout = rpc_timeout;
        self
    }

    pub fn with_catchup_timeout(mut self, catchup_timeout: Duration) -> Self {
        self.catchup_timeout = catchup_timeout;
        self
    }

    /// Verify configuration is valid
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("wait_time", self.wait_time),
            ("rpc_timeout", self.rpc_timeout),
            ("catchup_timeout", self.catchup_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::InvalidValue(name.into(), "must be non-zero".into()));
            }
        }
        Ok(())
    }
}

fn secs_from_env(name: &str) -> Result<Option<Duration>, ConfigError> {
    match std::env::var(name) {
        Ok(v) => v
            .parse::<f64>()
            .ok()
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(|secs| Some(Duration::from_secs_f64(secs)))
            .ok_or_else(|| ConfigError::InvalidValue(name.to_string(), v)),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ReparentConfig::default();
        assert_eq!(config.wait_time, Duration::from_secs(30));
        assert_eq!(config.rpc_timeout, Duration::from_secs(10));
        assert_eq!(config.topo_retries, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = ReparentConfig::default().with_rpc_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_secs_from_env_parses_fractions() {
        std::env::set_var("SHARDCTL_TEST_SECS", "0.5");
        assert_eq!(
            secs_from_env("SHARDCTL_TEST_SECS").unwrap(),
            Some(Duration::from_millis(500))
        );
        std::env::set_var("SHARDCTL_TEST_SECS", "soon");
        assert!(secs_from_env("SHARDCTL_TEST_SECS").is_err());
        std::env::remove_var("SHARDCTL_TEST_SECS");
        assert_eq!(secs_from_env("SHARDCTL_TEST_SECS").unwrap(), None);
    }
}
