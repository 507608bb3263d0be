use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde::Deserialize;

use herald_broker::{default_sweep_interval, BrokerConfig};

use crate::error::ServerError;

#[derive(Parser)]
#[command(name = "herald-server", about = "Durable publish/subscribe broker")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the broker until interrupted
    Serve(ServeArgs),
}

#[derive(Args, Clone, Debug)]
pub struct ServeArgs {
    /// Path to a TOML config file; all defaults when omitted
    #[arg(long, env = "HERALD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Listening port, overrides the config file
    #[arg(long, env = "HERALD_PORT")]
    pub port: Option<u16>,

    /// Directory holding one subdirectory per topic, overrides the config file
    #[arg(long, env = "HERALD_STORAGE_ROOT")]
    pub storage_root: Option<PathBuf>,
}

// ---- TOML Config ----

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,
    /// How long a message stays in the in-memory cache.
    #[serde(default = "default_cache_duration_ms")]
    pub cache_duration_ms: u64,
    /// Eviction sweep cadence; derived from the cache duration when absent.
    #[serde(default)]
    pub sweep_interval_ms: Option<u64>,
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8889
}
fn default_storage_root() -> PathBuf {
    PathBuf::from("data")
}
fn default_cache_duration_ms() -> u64 {
    1000
}
fn default_max_frame_len() -> usize {
    16 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            storage_root: default_storage_root(),
            cache_duration_ms: default_cache_duration_ms(),
            sweep_interval_ms: None,
            max_frame_len: default_max_frame_len(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: &std::path::Path) -> Result<Self, ServerError> {
        let content = std::fs::read_to_string(path).map_err(|e| ServerError::Config {
            context: "read",
            detail: format!("'{}': {e}", path.display()),
        })?;
        Self::parse(&content).map_err(|detail| ServerError::Config {
            context: "parse",
            detail: format!("'{}': {detail}", path.display()),
        })
    }

    fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// File values (or defaults) with command-line overrides applied.
    pub fn resolve(args: &ServeArgs) -> Result<Self, ServerError> {
        let mut config = match &args.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        if let Some(port) = args.port {
            config.port = port;
        }
        if let Some(root) = &args.storage_root {
            config.storage_root = root.clone();
        }
        Ok(config)
    }

    pub fn broker_config(&self) -> BrokerConfig {
        let cache_duration = Duration::from_millis(self.cache_duration_ms);
        let sweep = self
            .sweep_interval_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| default_sweep_interval(cache_duration));
        BrokerConfig::new(self.port, cache_duration, self.storage_root.clone())
            .with_host(self.host.clone())
            .with_sweep_interval(sweep)
            .with_max_frame_len(self.max_frame_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_means_defaults() {
        let config = ServerConfig::parse("").unwrap();
        assert_eq!(config.port, 8889);
        assert_eq!(config.cache_duration_ms, 1000);
        assert_eq!(config.storage_root, PathBuf::from("data"));
    }

    #[test]
    fn file_values_and_flag_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("herald.toml");
        std::fs::write(
            &path,
            "port = 7000\ncache_duration_ms = 100\nsweep_interval_ms = 20\nstorage_root = \"/var/lib/herald\"\n",
        )
        .unwrap();

        let args = ServeArgs {
            config: Some(path),
            port: Some(7001),
            storage_root: None,
        };
        let config = ServerConfig::resolve(&args).unwrap();
        assert_eq!(config.port, 7001);
        assert_eq!(config.storage_root, PathBuf::from("/var/lib/herald"));

        let broker = config.broker_config();
        assert_eq!(broker.cache_duration, Duration::from_millis(100));
        assert_eq!(broker.sweep_interval, Duration::from_millis(20));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(ServerConfig::parse("prot = 1").is_err());
    }
}
