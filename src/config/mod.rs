//! Configuration management.
//!
//! Supports configuration from:
//! - TOML config files
//! - Environment variables
//! - Builder methods (for embedding applications)

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{S2Error, Result};
use crate::protocol::{Role, PROTOCOL_VERSION};

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection engine configuration
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Resource Manager description
    #[serde(default)]
    pub resource_manager: ResourceManagerConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| S2Error::Config(format!("Failed to read config file: {e}")))?;

        toml::from_str(&content)
            .map_err(|e| S2Error::Config(format!("Failed to parse config: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("S2_URL") {
            config.connection.url = url;
        }
        if let Ok(token) = std::env::var("S2_BEARER_TOKEN") {
            if !token.is_empty() {
                config.connection.bearer_token = Some(token);
            }
        }
        if let Ok(val) = std::env::var("S2_RECONNECT") {
            if let Ok(val) = val.parse() {
                config.connection.reconnect = val;
            }
        }
        if let Ok(val) = std::env::var("S2_ACK_TIMEOUT_MS") {
            if let Ok(val) = val.parse() {
                config.connection.ack_timeout_ms = val;
            }
        }
        if let Ok(val) = std::env::var("S2_RECONNECT_DELAY_MS") {
            if let Ok(val) = val.parse() {
                config.connection.reconnect_delay_ms = val;
            }
        }

        config
    }

    /// Default config file location (`<config dir>/s2/config.toml`)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("s2").join("config.toml"))
    }
}

/// Connection engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// WebSocket URL of the peer
    pub url: String,

    /// Bearer token attached at connect time
    pub bearer_token: Option<String>,

    /// Restart the session after transport failures
    pub reconnect: bool,

    /// Pause before a reconnect attempt, in milliseconds
    pub reconnect_delay_ms: u64,

    /// Default budget for an acknowledgment, in milliseconds
    pub ack_timeout_ms: u64,

    /// Inbound messages buffered ahead of the dispatch loop
    pub dispatch_queue_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/s2".to_string(),
            bearer_token: None,
            reconnect: true,
            reconnect_delay_ms: 1000,
            ack_timeout_ms: 5000,
            dispatch_queue_capacity: 256,
        }
    }
}

impl ConnectionConfig {
    /// Set the peer URL
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Set the bearer token
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    /// Enable or disable reconnection
    pub fn with_reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Set the pause before reconnecting
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Set the default acknowledgment budget
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set how many inbound messages may wait for the dispatch loop
    pub fn with_dispatch_queue_capacity(mut self, capacity: usize) -> Self {
        self.dispatch_queue_capacity = capacity;
        self
    }

    /// Pause before reconnecting
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Default acknowledgment budget
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

/// Resource Manager description announced in `ResourceManagerDetails`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceManagerConfig {
    /// Stable resource identifier
    pub resource_id: String,

    /// Human-readable name
    pub name: Option<String>,

    /// Manufacturer
    pub manufacturer: Option<String>,

    /// Model
    pub model: Option<String>,

    /// Serial number
    pub serial_number: Option<String>,

    /// Firmware version
    pub firmware_version: Option<String>,

    /// Roles of the resource
    pub roles: Vec<Role>,

    /// Instruction processing delay in milliseconds
    pub instruction_processing_delay_ms: u64,

    /// Currency for cost figures
    pub currency: Option<String>,

    /// Whether the RM sends forecasts
    pub provides_forecast: bool,

    /// Commodity quantities the RM measures
    pub provides_power_measurement_types: Vec<String>,

    /// Protocol versions announced in the handshake
    pub supported_protocol_versions: Vec<String>,
}

impl Default for ResourceManagerConfig {
    fn default() -> Self {
        Self {
            resource_id: uuid::Uuid::new_v4().to_string(),
            name: None,
            manufacturer: None,
            model: None,
            serial_number: None,
            firmware_version: None,
            roles: Vec::new(),
            instruction_processing_delay_ms: 0,
            currency: None,
            provides_forecast: false,
            provides_power_measurement_types: Vec::new(),
            supported_protocol_versions: vec![PROTOCOL_VERSION.to_string()],
        }
    }
}
