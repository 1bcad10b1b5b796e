use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use isolate_protocol::DEFAULT_SOCKET_PATH;
use isolate_runtime_wasm::HarnessConfig;
use serde::{Deserialize, Serialize};

pub const CONFIG_ENV: &str = "ISOLATE_NODE_CONFIG";
pub const SOCKET_ENV: &str = "ISOLATE_SOCKET";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct NodeConfig {
    pub socket_path: PathBuf,
    pub cpu_time_seconds: u64,
    /// Advisory; only reported, never applied as an address-space limit.
    pub memory_limit_bytes: u64,
    /// Larger frames drop the connection.
    pub max_message_bytes: usize,
    pub harness: HarnessConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            cpu_time_seconds: 30,
            memory_limit_bytes: 4 * 1024 * 1024 * 1024,
            max_message_bytes: 4 * 1024 * 1024,
            harness: HarnessConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading node config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing node config {}", path.display()))
    }

    /// Defaults, overlaid by the file named in `ISOLATE_NODE_CONFIG`, then by
    /// `ISOLATE_SOCKET`.
    pub fn load() -> Result<Self> {
        Self::resolve(std::env::var_os(CONFIG_ENV), std::env::var_os(SOCKET_ENV))
    }

    fn resolve(
        config_path: Option<std::ffi::OsString>,
        socket: Option<std::ffi::OsString>,
    ) -> Result<Self> {
        let mut config = match config_path {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        if let Some(socket) = socket {
            config.socket_path = PathBuf::from(socket);
        }
        Ok(config)
    }
}
