use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Driver configuration, loaded from lumen.toml.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DriverConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub kernel: KernelConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Path of the simulator's Unix-domain socket.
    #[serde(default = "default_socket_path")]
    pub socket_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Lowest usable device DRAM address.
    #[serde(default = "default_dram_base")]
    pub dram_base: u32,
    /// Allocatable DRAM bytes above the base.
    #[serde(default = "default_dram_size")]
    pub dram_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Shared transfer region size established at connect time. Growing the
    /// region later requires a full re-handshake, so this should be generous.
    #[serde(default = "default_region_bytes")]
    pub region_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Per-launch stack allocation.
    #[serde(default = "default_stack_bytes")]
    pub stack_bytes: u32,
    /// Per-launch thread-local-storage allocation.
    #[serde(default = "default_tls_bytes")]
    pub tls_bytes: u32,
    /// When set, kernel code is pinned to this exact device address instead
    /// of the first aligned offset after the launch params. The choice holds
    /// for the whole connection.
    pub fixed_load_addr: Option<u32>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            socket_path: default_socket_path(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            dram_base: default_dram_base(),
            dram_size: default_dram_size(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            region_bytes: default_region_bytes(),
        }
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            stack_bytes: default_stack_bytes(),
            tls_bytes: default_tls_bytes(),
            fixed_load_addr: None,
        }
    }
}

impl DriverConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| CoreError::Config(e.to_string()))
    }

    /// Load configuration from file if it exists, otherwise return defaults.
    pub fn load_or_default(path: &str) -> Self {
        Self::load(path).unwrap_or_default()
    }
}

fn default_socket_path() -> String {
    "/tmp/lumen-sim.sock".to_string()
}

fn default_dram_base() -> u32 {
    0x8000
}

fn default_dram_size() -> u64 {
    512 * 1024 * 1024
}

fn default_region_bytes() -> usize {
    1 << 20
}

fn default_stack_bytes() -> u32 {
    64 * 1024
}

fn default_tls_bytes() -> u32 {
    4 * 1024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config: DriverConfig = toml::from_str("").expect("parse");
        assert_eq!(config.device.dram_base, 0x8000);
        assert_eq!(config.transfer.region_bytes, 1 << 20);
        assert!(config.kernel.fixed_load_addr.is_none());
    }

    #[test]
    fn partial_sections_fill_in_defaults() {
        let config: DriverConfig = toml::from_str(
            r#"
            [server]
            socket_path = "/run/sim.sock"

            [kernel]
            fixed_load_addr = 0x20000
            "#,
        )
        .expect("parse");
        assert_eq!(config.server.socket_path, "/run/sim.sock");
        assert_eq!(config.kernel.fixed_load_addr, Some(0x20000));
        assert_eq!(config.kernel.stack_bytes, 64 * 1024);
        assert_eq!(config.device.dram_size, 512 * 1024 * 1024);
    }
}
