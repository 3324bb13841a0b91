// src/config.rs

//! Daemon and agent configuration: loading and defaults.

use crate::agent::AgentConfig;
use crate::core::TallydError;
use crate::core::auth::{AuthProvider, MacAuth};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// Name this process announces in its connection handshakes.
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,

    /// Address the daemon listens on.
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,

    /// Where the agent sends its records.
    #[serde(default = "default_host")]
    pub storage_host: String,
    #[serde(default = "default_port")]
    pub storage_port: u16,

    /// Directory holding the agent's spill file across restarts.
    #[serde(default = "default_state_save_location")]
    pub state_save_location: PathBuf,

    /// Receive budget per RPC reply.
    #[serde(with = "humantime_serde", default = "default_message_timeout")]
    pub message_timeout: Duration,

    /// Cap on concurrently serviced connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Hex-encoded shared MAC key. Without it a development key derived
    /// from the cluster name is used.
    #[serde(default)]
    pub auth_key_file: Option<PathBuf>,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_cluster_name() -> String {
    "cluster".to_string()
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    6819
}
fn default_state_save_location() -> PathBuf {
    PathBuf::from("/var/spool/tallyd")
}
fn default_message_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_max_connections() -> usize {
    crate::server::MAX_SERVICE_CONNS
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cluster_name: default_cluster_name(),
            host: default_host(),
            port: default_port(),
            storage_host: default_host(),
            storage_port: default_port(),
            state_save_location: default_state_save_location(),
            message_timeout: default_message_timeout(),
            max_connections: default_max_connections(),
            auth_key_file: None,
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Loads the configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()
            .with_context(|| format!("failed to read configuration from \"{path}\""))?;
        settings
            .try_deserialize()
            .context("invalid configuration values")
    }

    /// The agent settings implied by this configuration.
    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            remote_host: self.storage_host.clone(),
            remote_port: self.storage_port,
            cluster_name: self.cluster_name.clone(),
            persist_type: 1,
            local_port: 0,
            state_save_location: self.state_save_location.clone(),
            timeout: self.message_timeout,
            suppress_errors: false,
        }
    }

    /// Builds the credential provider from the configured key file, or a
    /// development key when none is configured.
    pub fn auth_provider(&self) -> Result<Arc<dyn AuthProvider>, TallydError> {
        match &self.auth_key_file {
            Some(path) => Ok(Arc::new(MacAuth::from_key_file(path)?)),
            None => {
                warn!("no auth_key_file configured, using a development key");
                let key = format!("tallyd-dev-{}", self.cluster_name).into_bytes();
                Ok(Arc::new(MacAuth::new(key)))
            }
        }
    }
}
