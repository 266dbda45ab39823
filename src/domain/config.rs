use serde::{Deserialize, Serialize};
use std::time::Duration;

/// btserial configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BtSerialConfig {
    /// Global configuration
    #[serde(default)]
    pub global: GlobalConfig,
    /// Known devices
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

/// Global configuration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Default log level
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Maximum number of concurrent device sessions
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// How long a connect request may stay pending
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// How long a discovery scan may run before it is abandoned
    #[serde(default = "default_discovery_timeout")]
    pub discovery_timeout_ms: u64,
    /// How long a pair/unpair request may stay pending
    #[serde(default = "default_pairing_timeout")]
    pub pairing_timeout_ms: u64,
    /// Capacity of the broadcast event channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Return transport write failures to the caller (they are always
    /// published on the `error` event as well)
    #[serde(default = "default_propagate_write_errors")]
    pub propagate_write_errors: bool,
    /// Publish a `frame-available` event when a delimiter arrives
    #[serde(default)]
    pub emit_frame_events: bool,
}

/// Device configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device name
    pub name: String,
    /// Transport address used as the device id
    pub address: String,
    /// Device description
    #[serde(default)]
    pub description: String,
    /// Frame delimiter, e.g. "\n" or "0x0D"
    #[serde(default)]
    pub delimiter: Option<String>,
    /// Baud rate for serial-backed links
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_sessions() -> usize {
    10
}

fn default_connect_timeout() -> u64 {
    10_000
}

fn default_discovery_timeout() -> u64 {
    15_000
}

fn default_pairing_timeout() -> u64 {
    30_000
}

fn default_event_capacity() -> usize {
    256
}

fn default_propagate_write_errors() -> bool {
    true
}

fn default_baud_rate() -> u32 {
    9600
}

impl Default for BtSerialConfig {
    fn default() -> Self {
        Self {
            global: GlobalConfig::default(),
            devices: Vec::new(),
        }
    }
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            max_sessions: default_max_sessions(),
            connect_timeout_ms: default_connect_timeout(),
            discovery_timeout_ms: default_discovery_timeout(),
            pairing_timeout_ms: default_pairing_timeout(),
            event_capacity: default_event_capacity(),
            propagate_write_errors: default_propagate_write_errors(),
            emit_frame_events: false,
        }
    }
}

impl GlobalConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn pairing_timeout(&self) -> Duration {
        Duration::from_millis(self.pairing_timeout_ms)
    }
}

impl BtSerialConfig {
    /// Look up a device by name or address
    pub fn find_device(&self, name_or_address: &str) -> Option<&DeviceConfig> {
        self.devices
            .iter()
            .find(|d| d.name == name_or_address || d.address == name_or_address)
    }
}
