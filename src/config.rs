//! Proxy configuration, deserialized from JSON.

use anyhow::{bail, Context};
use serde::Deserialize;
use std::{collections::HashMap, fs::File, path::Path, time::Duration};

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Address the proxy listens on.
    pub bind: String,
    /// Message of the day shown in the server list.
    pub motd: String,
    /// Player slots advertised in the server list.
    pub max_players: i32,
    /// Time in milliseconds to wait for a packet before the connection is
    /// considered dead.
    pub read_timeout: u64,
    /// Time in milliseconds for connection establishment and writes.
    pub connection_timeout: u64,
    pub compression: CompressionConfig,
    /// Registered backend servers, name to address.
    pub servers: HashMap<String, String>,
    /// Server names to try in order when a player connects or is kicked.
    #[serde(rename = "try")]
    pub attempt_connection_order: Vec<String>,
    /// Virtual host to ordered server name list, overriding the global
    /// connection order for matching hosts.
    pub forced_hosts: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompressionConfig {
    /// Packets at least this large are compressed; -1 disables compression.
    pub threshold: i32,
    /// zlib level, 0-9.
    pub level: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:25565".to_owned(),
            motd: "A Portcullis proxy".to_owned(),
            max_players: 100,
            read_timeout: 30_000,
            connection_timeout: 5_000,
            compression: CompressionConfig::default(),
            servers: HashMap::new(),
            attempt_connection_order: Vec::new(),
            forced_hosts: HashMap::new(),
        }
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            threshold: 256,
            level: 6,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let file = File::open(path.as_ref())
            .with_context(|| format!("opening config {}", path.as_ref().display()))?;
        let config: Config = serde_json::from_reader(file).context("parsing config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.compression.level > 9 {
            bail!("compression.level must be between 0 and 9");
        }
        for name in self
            .attempt_connection_order
            .iter()
            .chain(self.forced_hosts.values().flatten())
        {
            if !self.servers.contains_key(name) {
                bail!("server {name:?} is referenced but not registered");
            }
        }
        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout)
    }
}
