//! Server configuration, layered with figment.
//!
//! Merge order (later overrides earlier):
//! 1. Compiled defaults
//! 2. TOML file at `$SLOTWISE_CONFIG`, or `./slotwise.toml` (optional)
//! 3. `SLOTWISE_*` environment variables, e.g. `SLOTWISE_PORT=6543`

#![allow(clippy::result_large_err)] // figment::Error is external

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

const ENV_PREFIX: &str = "SLOTWISE_";
const CONFIG_PATH_VAR: &str = "SLOTWISE_CONFIG";
const DEFAULT_CONFIG_FILE: &str = "slotwise.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    /// One `<tenant>.wal` file per tenant lives here.
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// Appends since the last compaction that trigger a new one.
    pub compact_threshold: u64,
    pub compact_interval_secs: u64,
    /// Prometheus exporter port; disabled when unset.
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    /// Fallback filter when `RUST_LOG` is not set.
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            password: "slotwise".into(),
            max_connections: 256,
            compact_threshold: 1000,
            compact_interval_secs: 30,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
            log_level: "info".into(),
        }
    }
}

impl Config {
    /// Load from the configured file (if present) and the environment.
    pub fn load() -> Result<Self, figment::Error> {
        let path = std::env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.into());
        Self::load_from_path(Path::new(&path))
    }

    pub fn load_from_path(path: &Path) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).ignore(&["config"]))
            .extract()
    }

    pub fn load_from_str(toml: &str) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::string(toml))
            .extract()
    }

    pub fn compact_interval(&self) -> Duration {
        Duration::from_secs(self.compact_interval_secs.max(1))
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}
