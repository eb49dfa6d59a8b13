use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use uuid::Uuid;

/// Node configuration. Loaded from a TOML file when one is given; CLI flags
/// override individual fields on top.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub node_id: String,
    pub listen_addr: String,
    /// Base URLs of every other node in the cluster, e.g.
    /// `http://10.0.0.2:5000`. Does not include this node.
    pub peers: Vec<String>,
    pub timing: TimingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            node_id: Uuid::new_v4().to_string(),
            listen_addr: "0.0.0.0:5000".to_string(),
            peers: vec![],
            timing: TimingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Election timeout is resampled uniformly from this range on every
    /// transition to follower and on every election start.
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub tick_interval_ms: u64,
    pub rpc_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        TimingConfig {
            election_timeout_min_ms: 3000,
            election_timeout_max_ms: 6000,
            heartbeat_interval_ms: 1000,
            tick_interval_ms: 100,
            rpc_timeout_ms: 500,
        }
    }
}

impl TimingConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
        let config: Config = toml::from_str(&contents).with_context(|| format!("parsing {path}"))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let t = &self.timing;
        if t.election_timeout_min_ms == 0 || t.election_timeout_min_ms > t.election_timeout_max_ms {
            bail!(
                "invalid election timeout range {}..{} ms",
                t.election_timeout_min_ms,
                t.election_timeout_max_ms
            );
        }
        // A heartbeat cadence at or above the election timeout floor would
        // make followers time out between legitimate heartbeats.
        if t.heartbeat_interval_ms >= t.election_timeout_min_ms {
            bail!(
                "heartbeat interval {} ms must be below the minimum election timeout {} ms",
                t.heartbeat_interval_ms,
                t.election_timeout_min_ms
            );
        }
        Ok(())
    }
}
