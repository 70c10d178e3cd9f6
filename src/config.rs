//! Configuration: a TOML file with CLI flags layered on top.

use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dht::DhtConfig;
use crate::frontier::distributed::DistributedOptions;
use crate::frontier::PolitenessConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid scope regex: {0}")]
    Scope(regex::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: String,
    /// Newline-delimited seed file; empty means no seeds.
    pub seed: String,
    /// Regex a URL must match to be fetched; empty admits everything.
    pub scope: String,
    pub workers: usize,
    pub user_agent: String,
    pub politeness: PolitenessConf,
    pub distributed: DistributedConf,
    pub dht: DhtConf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            seed: String::new(),
            scope: String::new(),
            workers: 512,
            user_agent: "OrbweaverBot/0.3".to_string(),
            politeness: PolitenessConf::default(),
            distributed: DistributedConf::default(),
            dht: DhtConf::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolitenessConf {
    pub max_active_queues: usize,
    pub multiplier: u64,
    pub session_budget: u64,
    /// Fetch timeout forwarded to the HTTP client.
    pub timeout_ms: u64,
}

impl Default for PolitenessConf {
    fn default() -> Self {
        Self {
            max_active_queues: 256,
            multiplier: 10,
            session_budget: 50,
            timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DistributedConf {
    /// Listen address; empty disables distribution.
    pub addr: String,
    pub bootstrap_node: String,
    pub batch_period_ms: u64,
    pub checkkeys_period_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtConf {
    pub vnode_num: usize,
    pub succlist_length: usize,
    pub stabilize_interval_ms: u64,
    pub fixfingers_interval_ms: u64,
}

impl Default for DhtConf {
    fn default() -> Self {
        Self {
            vnode_num: 4,
            succlist_length: 4,
            stabilize_interval_ms: 1_000,
            fixfingers_interval_ms: 1_000,
        }
    }
}

impl Config {
    /// Loads the file if it exists, otherwise starts from defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            source: e,
        })
    }

    pub fn politeness_config(&self) -> PolitenessConfig {
        PolitenessConfig {
            max_active_queues: self.politeness.max_active_queues.max(1),
            multiplier: self.politeness.multiplier,
            session_budget: self.politeness.session_budget.max(1),
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.politeness.timeout_ms.max(1))
    }

    pub fn dht_config(&self) -> DhtConfig {
        let defaults = DhtConfig::default();
        DhtConfig {
            vnode_num: self.dht.vnode_num.max(1),
            succ_list_len: self.dht.succlist_length.max(1),
            stabilize_interval: pick_interval(self.dht.stabilize_interval_ms, defaults.stabilize_interval),
            fix_fingers_interval: pick_interval(
                self.dht.fixfingers_interval_ms,
                defaults.fix_fingers_interval,
            ),
            check_predecessor_interval: defaults.check_predecessor_interval,
        }
    }

    pub fn distributed_options(&self) -> DistributedOptions {
        let defaults = DistributedOptions::default();
        DistributedOptions {
            batch_period: pick_interval(self.distributed.batch_period_ms, defaults.batch_period),
            check_keys_period: pick_interval(
                self.distributed.checkkeys_period_ms,
                defaults.check_keys_period,
            ),
            max_batch: defaults.max_batch,
        }
    }

    pub fn scope_regex(&self) -> Result<Option<Regex>, ConfigError> {
        if self.scope.is_empty() {
            return Ok(None);
        }
        Regex::new(&self.scope).map(Some).map_err(ConfigError::Scope)
    }

    pub fn is_distributed(&self) -> bool {
        !self.distributed.addr.is_empty()
    }
}

fn pick_interval(ms: u64, fallback: Duration) -> Duration {
    if ms == 0 {
        fallback
    } else {
        Duration::from_millis(ms)
    }
}
