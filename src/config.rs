// src/config.rs

//! Manages node configuration: CLI flags, the optional TOML file, and validation.

use crate::core::cluster::NodeRole;
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// The full runtime configuration for a single node.
///
/// Every field has a serde default so a TOML file only needs to name what it
/// changes; command-line flags override the file.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// The host this node binds to and announces to peers.
    #[serde(default = "default_host")]
    pub host: String,

    /// The port this node binds to. `0` asks the OS for an ephemeral port.
    #[serde(default)]
    pub port: u16,

    /// The role this node starts with. Effective role is derived from cluster
    /// state after startup discovery.
    #[serde(default)]
    pub role: NodeRole,

    /// Address (`host:port`) of the initial master. Required for workers.
    #[serde(default)]
    pub master: Option<String>,

    /// Addresses of other known nodes.
    #[serde(default)]
    pub nodes: Vec<String>,

    /// Directory where a worker keeps incoming and processed shards.
    #[serde(default = "default_shards_dir")]
    pub shards_dir: PathBuf,

    /// Directory where a master keeps originals, segments and final outputs.
    #[serde(default = "default_master_data_dir")]
    pub master_data_dir: PathBuf,

    /// Name or path of the media tool binary.
    #[serde(default = "default_media_tool")]
    pub media_tool: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Duration of each video segment produced by the master, in seconds.
    #[serde(default = "default_segment_duration_secs")]
    pub segment_duration_secs: u32,

    /// How often a leader broadcasts its authority.
    #[serde(default = "default_announce_interval", with = "humantime_serde")]
    pub announce_interval: Duration,

    /// How often a follower probes its leader.
    #[serde(default = "default_health_check_interval", with = "humantime_serde")]
    pub health_check_interval: Duration,

    /// How long the cached resource score stays fresh, and the cadence of the
    /// background refresh and of worker score reports.
    #[serde(default = "default_score_update_interval", with = "humantime_serde")]
    pub score_update_interval: Duration,

    /// How long a backup master waits after the last successful leader probe
    /// before promoting itself.
    #[serde(default = "default_backup_failure_window", with = "humantime_serde")]
    pub backup_failure_window: Duration,

    /// How often a master sweeps all known nodes for liveness.
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Base election timeout; the effective timeout applies randomized
    /// exponential backoff on top of this.
    #[serde(default = "default_election_base_timeout", with = "humantime_serde")]
    pub election_base_timeout: Duration,
}

fn default_host() -> String {
    "localhost".to_string()
}
fn default_shards_dir() -> PathBuf {
    PathBuf::from("video_shards")
}
fn default_master_data_dir() -> PathBuf {
    PathBuf::from("master_data")
}
fn default_media_tool() -> String {
    "ffmpeg".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_segment_duration_secs() -> u32 {
    10
}
fn default_announce_interval() -> Duration {
    Duration::from_secs(5)
}
fn default_health_check_interval() -> Duration {
    Duration::from_secs(1)
}
fn default_score_update_interval() -> Duration {
    Duration::from_secs(10)
}
fn default_backup_failure_window() -> Duration {
    Duration::from_secs(2)
}
fn default_sweep_interval() -> Duration {
    Duration::from_secs(5)
}
fn default_election_base_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for Config {
    fn default() -> Self {
        toml::from_str("").expect("empty config must deserialize from defaults")
    }
}

impl Config {
    /// Loads a configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;
        Ok(config)
    }

    /// Builds a configuration from command-line arguments, layered on top of
    /// an optional `--config` file. `--port` and `--role` are mandatory;
    /// either may come from the file instead of the flag.
    pub fn from_args(args: &[String]) -> Result<Self> {
        // The role field has no "absent" sentinel, so whether one was
        // actually supplied is tracked alongside the merge.
        let mut role_given = false;
        let mut config = match flag_value(args, "--config") {
            Some(path) => {
                let contents = fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file at '{path}'"))?;
                let table: toml::Table = toml::from_str(&contents)
                    .with_context(|| format!("Failed to parse TOML from '{path}'"))?;
                role_given = table.contains_key("role");
                toml::from_str(&contents)
                    .with_context(|| format!("Failed to parse TOML from '{path}'"))?
            }
            None => Config::default(),
        };

        if let Some(host) = flag_value(args, "--host") {
            config.host = host.to_string();
        }
        if let Some(port) = flag_value(args, "--port") {
            config.port = port
                .parse()
                .with_context(|| format!("Invalid port number: {port}"))?;
        }
        if let Some(role) = flag_value(args, "--role") {
            config.role = role
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid role '{role}': expected master, backup_master or worker"))?;
            role_given = true;
        }
        if let Some(master) = flag_value(args, "--master") {
            config.master = Some(master.to_string());
        }
        if let Some(pos) = args.iter().position(|a| a == "--nodes") {
            config.nodes = args[pos + 1..]
                .iter()
                .take_while(|a| !a.starts_with("--"))
                .cloned()
                .collect();
        }

        if config.port == 0 {
            bail!("--port is required");
        }
        if !role_given {
            bail!("--role is required");
        }
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field requirements and normalizes the peer list.
    pub fn validate(&mut self) -> Result<()> {
        if self.role == NodeRole::Worker && self.master.is_none() {
            bail!("--master is required for worker nodes");
        }

        // The configured master must be connectable like any other peer.
        if let Some(master) = &self.master {
            if !self.nodes.contains(master) {
                self.nodes.push(master.clone());
            }
        }
        let own = self.address();
        self.nodes.sort();
        self.nodes.dedup();
        self.nodes.retain(|n| *n != own);
        Ok(())
    }

    /// The `host:port` address this node announces to peers.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Returns the value following `flag` in `args`, if present.
fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
}
