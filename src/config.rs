//! Daemon configuration.
//!
//! Loaded from a TOML file; every key has a default, so an empty (or
//! absent) file yields a working configuration. Unknown keys are ignored.

use serde::Deserialize;
use std::path::PathBuf;

use crate::messages::MAX_MESSAGE_SIZE;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind: BindConfig,
    pub database: DatabaseConfig,
    pub tor: TorConfig,
    pub socks: SocksConfig,
    pub net: NetConfig,
    pub node: NodeConfig,
    /// Where the routing table, seed list and mirrored collections live.
    pub data_dir: PathBuf,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct BindConfig {
    /// TCP listen address for the protocol.
    pub zif: String,
    /// HTTP control plane listen address (served elsewhere).
    pub http: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Post database path (owned by the post store, not this crate).
    pub path: PathBuf,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TorConfig {
    pub enabled: bool,
    pub control: u16,
    pub socks: u16,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SocksConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetConfig {
    pub max_peers: usize,
    pub max_message_size: usize,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeConfig {
    pub name: String,
    pub desc: String,
    /// Advertised public address; probed when empty.
    pub public_address: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: BindConfig::default(),
            database: DatabaseConfig::default(),
            tor: TorConfig::default(),
            socks: SocksConfig::default(),
            net: NetConfig::default(),
            node: NodeConfig::default(),
            data_dir: PathBuf::from("./data"),
        }
    }
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            zif: "0.0.0.0:5050".into(),
            http: "127.0.0.1:8080".into(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/posts.db"),
        }
    }
}

impl Default for TorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            control: 10051,
            socks: 10050,
        }
    }
}

impl Default for SocksConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 10050,
        }
    }
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            max_peers: 100,
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            desc: String::new(),
            public_address: String::new(),
        }
    }
}

impl Config {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    /// The SOCKS port to dial through, when enabled.
    pub fn socks_port(&self) -> Option<u16> {
        self.socks.enabled.then_some(self.socks.port)
    }
}
