use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use utm_remote_core::storage::default_storage_dir;
use utm_remote_core::{RemoteVmState, SERVICE_TYPE};
use uuid::Uuid;

pub const CONFIG_FILE: &str = "host.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub device_name: String,
    /// UDP port for the QUIC listener. `0` lets the OS pick.
    pub port: u16,
    pub service_type: String,
    pub autoblock: bool,
    pub password: Option<String>,
    pub storage_dir: PathBuf,
    pub machines: Vec<MachineConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineConfig {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    #[serde(default = "stopped")]
    pub state: RemoteVmState,
}

fn stopped() -> RemoteVmState {
    RemoteVmState::Stopped
}

impl Default for HostConfig {
    fn default() -> Self {
        let device_name = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .ok()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| "utm-host".to_string());

        Self {
            device_name,
            port: 0,
            service_type: SERVICE_TYPE.to_string(),
            autoblock: false,
            password: None,
            storage_dir: default_storage_dir().unwrap_or_else(|_| PathBuf::from("utm-remote")),
            machines: Vec::new(),
        }
    }
}

impl HostConfig {
    /// Load `path`, or `<storage_dir>/host.toml` when present, or the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::from_file(path);
        }

        let defaults = Self::default();
        let implicit = defaults.storage_dir.join(CONFIG_FILE);
        if implicit.exists() {
            Self::from_file(&implicit)
        } else {
            Ok(defaults)
        }
    }

    fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: HostConfig = toml::from_str(&text)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }
}
