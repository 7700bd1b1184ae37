//! Client configuration

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory path
    pub data_dir: String,

    /// Signaling bus configuration
    pub signaling: SignalingConfig,

    /// NAT traversal configuration
    pub ice: IceConfig,

    /// Transfer configuration
    pub transfer: TransferConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// Signaling bus URL
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    /// STUN servers used for path discovery
    pub stun_servers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Chunk size in bytes
    pub chunk_size: u32,
    /// Suspend sending above this many buffered bytes
    pub buffer_high_water: usize,
    /// Resume sending below this many buffered bytes
    pub buffer_low_water: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: "~/.roomdrop".to_string(),
            signaling: SignalingConfig {
                url: "http://127.0.0.1:8000".to_string(),
            },
            ice: IceConfig {
                stun_servers: vec![
                    "stun:stun.l.google.com:19302".to_string(),
                    "stun:stun1.l.google.com:19302".to_string(),
                    "stun:stun2.l.google.com:19302".to_string(),
                ],
            },
            transfer: TransferConfig {
                chunk_size: roomdrop_core::DEFAULT_CHUNK_SIZE,
                buffer_high_water: roomdrop_core::BUFFER_HIGH_WATER,
                buffer_low_water: roomdrop_core::BUFFER_LOW_WATER,
            },
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Expand ~ in data_dir path
    pub fn data_dir(&self) -> std::path::PathBuf {
        if self.data_dir.starts_with("~/") {
            if let Some(home) = dirs::home_dir() {
                return home.join(&self.data_dir[2..]);
            }
        }
        std::path::PathBuf::from(&self.data_dir)
    }
}
