use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const LOG_BUFFER_CAPACITY: usize = 100;
pub const RETRY_QUEUE_CAPACITY: usize = 20;
pub const UPLOAD_QUEUE_CAPACITY: usize = 5;

// Sensor-node link
pub const NODE_PORT: u16 = 8888;
pub const RESPONSE_BUFFER_LEN: usize = 80; // 79 bytes + NUL on the wire
pub const UPLOAD_BODY_LEN: usize = 120;
pub const MAX_ROWS: usize = 5;
pub const MAX_COLUMNS: usize = 5;
pub const ROW_ID_COLUMN: usize = 4;

// Frequencies and timeouts (in Milliseconds)
pub const POLL_PERIOD_MS: u64 = 20_000;
pub const RETRY_PACE_MS: u64 = 50;
pub const UPLOAD_PACE_MS: u64 = 2_000;
pub const UPLOAD_STAGGER_MS: u64 = 500;
pub const READ_TIMEOUT_MS: u64 = 5_000;
pub const LONG_READ_TIMEOUT_MS: u64 = 35_000;
pub const TIMEOUT_BACKOFF_MS: u64 = 600;
pub const CONNECT_TIMEOUT_MS: u64 = 3_000;
pub const DRAIN_IDLE_MS: u64 = 50;
pub const HTTP_TIMEOUT_MS: u64 = 10_000;
pub const POLLER_GATE_WAIT_MS: u64 = 4_000; // Then the tick is skipped.
pub const ROLLBACK_ATTEMPTS: u32 = 5;
pub const MAIN_MS: u64 = 100;
pub const WORKER_IDLE_MS: u64 = 250;

// Lifecycle
pub const LWD_TIMEOUT_MS: u64 = 15_000;
pub const WATCHDOG_TICK_MS: u64 = 1_000;
pub const QUIESCENCE_TIMEOUT_MS: u64 = 5_000;
pub const QUIESCENCE_POLL_MS: u64 = 1_000;
pub const REBOOT_EXIT_CODE: i32 = 75;

pub const RETRY_PRIORITY: u8 = 3;
pub const UPLOAD_PRIORITY: u8 = 2;
pub const WATCHDOG_PRIORITY: u8 = 4;
pub const SIMULATION_PRIORITY: u8 = 1;
pub const LOGGING_PRIORITY: u8 = 0;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Runtime configuration, read from `gateway.toml`.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct GatewayConfig {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub timing: Timing,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    pub api_key: String,
    pub location: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DeviceConfig {
    pub mac_address: String,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LinkCipher {
    #[default]
    None,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    pub node_port: u16,
    pub cipher: LinkCipher,
}

/// Pacing and timeouts. Tests shrink these; production keeps the constants.
#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct Timing {
    pub poll_period_ms: u64,
    pub retry_pace_ms: u64,
    pub upload_pace_ms: u64,
    pub upload_stagger_ms: u64,
    pub read_timeout_ms: u64,
    pub long_read_timeout_ms: u64,
    pub timeout_backoff_ms: u64,
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SimulationConfig {
    pub enabled: bool,
    pub nodes: u8,
    pub fault_percent: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://192.168.1.252".to_string(),
            api_key: "changeme".to_string(),
            location: "HOME".to_string(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self { mac_address: "00:00:00:00:00:00".to_string() }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self { node_port: NODE_PORT, cipher: LinkCipher::None }
    }
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            poll_period_ms: POLL_PERIOD_MS,
            retry_pace_ms: RETRY_PACE_MS,
            upload_pace_ms: UPLOAD_PACE_MS,
            upload_stagger_ms: UPLOAD_STAGGER_MS,
            read_timeout_ms: READ_TIMEOUT_MS,
            long_read_timeout_ms: LONG_READ_TIMEOUT_MS,
            timeout_backoff_ms: TIMEOUT_BACKOFF_MS,
            connect_timeout_ms: CONNECT_TIMEOUT_MS,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), file: "gateway.log".to_string() }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self { enabled: false, nodes: 3, fault_percent: 10 }
    }
}

impl GatewayConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source,
        })?;

        Ok(toml::from_str(&content)?)
    }

    /// Tries `gateway.toml` then `config/gateway.toml`, falling back to defaults.
    pub fn load_or_default() -> Self {
        let paths = [PathBuf::from("gateway.toml"), PathBuf::from("config").join("gateway.toml")];

        for path in &paths {
            if path.exists() {
                match Self::load(path) {
                    Ok(config) => {
                        log::info!("[CONFIG] Loaded from {}", path.display());
                        return config;
                    }
                    Err(e) => log::warn!("[CONFIG] {}", e),
                }
            }
        }

        log::warn!("[CONFIG] No config file found - using defaults");
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults_for_missing_sections() {
        let config: GatewayConfig = toml::from_str(
            r#"
            [backend]
            base_url = "http://10.0.0.2"
            api_key = "k"

            [timing]
            retry_pace_ms = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.backend.base_url, "http://10.0.0.2");
        assert_eq!(config.backend.location, "HOME");
        assert_eq!(config.timing.retry_pace_ms, 5);
        assert_eq!(config.timing.upload_pace_ms, UPLOAD_PACE_MS);
        assert_eq!(config.network.node_port, NODE_PORT);
        assert_eq!(config.network.cipher, LinkCipher::None);
        assert!(!config.simulation.enabled);
    }

    #[test]
    fn unknown_cipher_is_rejected() {
        let parsed: Result<GatewayConfig, _> = toml::from_str("[network]\ncipher = \"aes\"\n");
        assert!(parsed.is_err());
    }
}
