use crate::cli::args::OutputFormat;
use crate::core::events::SessionEvent;
use crate::core::transport::DeviceDescriptor;
use crate::domain::config::{BtSerialConfig, DeviceConfig};
use std::io;
use std::path::Path;
use tabled::{Table, Tabled};

/// Output writer trait for different formats
pub trait OutputWriter {
    fn write_devices(&self, devices: &[DeviceDescriptor]) -> Result<(), OutputError>;
    fn write_config(&self, config: &BtSerialConfig) -> Result<(), OutputError>;
    fn write_paths(&self, global: &Path, project: Option<&Path>) -> Result<(), OutputError>;
    fn write_frame(&self, device_id: &str, frame: &[u8], as_hex: bool) -> Result<(), OutputError>;
    fn write_event(&self, event: &SessionEvent) -> Result<(), OutputError>;
    fn write_message(&self, message: &str) -> Result<(), OutputError>;
    fn write_error(&self, error: &str) -> Result<(), OutputError>;
}

/// Output formatting errors
#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

impl From<OutputError> for crate::domain::error::BtSerialError {
    fn from(err: OutputError) -> Self {
        Self::Output(err.to_string())
    }
}

/// Render a frame for text output, escaping non-printable bytes
pub fn render_frame(frame: &[u8], as_hex: bool) -> String {
    if as_hex {
        return hex::encode_upper(frame);
    }
    frame
        .iter()
        .flat_map(|b| std::ascii::escape_default(*b))
        .map(char::from)
        .collect()
}

/// Console output writer
pub struct ConsoleWriter {
    format: OutputFormat,
}

impl ConsoleWriter {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }
}

impl OutputWriter for ConsoleWriter {
    fn write_devices(&self, devices: &[DeviceDescriptor]) -> Result<(), OutputError> {
        match self.format {
            OutputFormat::Text => {
                if devices.is_empty() {
                    println!("No devices found");
                }
                for device in devices {
                    println!("{}", device);
                }
            }
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(devices)?);
            }
            OutputFormat::Table => {
                if !devices.is_empty() {
                    let rows: Vec<DeviceRow> = devices.iter().map(DeviceRow::from).collect();
                    println!("{}", Table::new(rows));
                }
            }
        }
        Ok(())
    }

    fn write_config(&self, config: &BtSerialConfig) -> Result<(), OutputError> {
        match self.format {
            OutputFormat::Text => {
                let global = &config.global;
                println!("btserial configuration:");
                println!("  Log level: {}", global.log_level);
                println!("  Max sessions: {}", global.max_sessions);
                println!("  Connect timeout: {}ms", global.connect_timeout_ms);
                println!("  Discovery timeout: {}ms", global.discovery_timeout_ms);
                println!("  Pairing timeout: {}ms", global.pairing_timeout_ms);
                println!("  Propagate write errors: {}", global.propagate_write_errors);
                println!("  Frame events: {}", global.emit_frame_events);

                if !config.devices.is_empty() {
                    println!("  Devices:");
                    for device in &config.devices {
                        let desc = if device.description.is_empty() {
                            "No description"
                        } else {
                            &device.description
                        };
                        println!("    {} ({}): {}", device.name, device.address, desc);
                    }
                }
            }
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(config)?);
            }
            OutputFormat::Table => {
                if !config.devices.is_empty() {
                    let rows: Vec<ConfiguredDeviceRow> =
                        config.devices.iter().map(ConfiguredDeviceRow::from).collect();
                    println!("{}", Table::new(rows));
                }
            }
        }
        Ok(())
    }

    fn write_paths(&self, global: &Path, project: Option<&Path>) -> Result<(), OutputError> {
        match self.format {
            OutputFormat::Json => {
                let output = serde_json::json!({
                    "global": global,
                    "project": project,
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            _ => {
                println!("Global:  {}", global.display());
                match project {
                    Some(path) => println!("Project: {}", path.display()),
                    None => println!("Project: (none found)"),
                }
            }
        }
        Ok(())
    }

    fn write_frame(&self, device_id: &str, frame: &[u8], as_hex: bool) -> Result<(), OutputError> {
        match self.format {
            OutputFormat::Json => {
                let output = serde_json::json!({
                    "device": device_id,
                    "length": frame.len(),
                    "hex": hex::encode_upper(frame),
                    "text": String::from_utf8_lossy(frame),
                });
                println!("{}", serde_json::to_string(&output)?);
            }
            _ => println!("[{}] {}", device_id, render_frame(frame, as_hex)),
        }
        Ok(())
    }

    fn write_event(&self, event: &SessionEvent) -> Result<(), OutputError> {
        match self.format {
            OutputFormat::Json => println!("{}", serde_json::to_string(event)?),
            _ => match event {
                SessionEvent::ConnectionSucceeded { message, .. }
                | SessionEvent::ConnectionFailed { message, .. }
                | SessionEvent::ConnectionLost { message, .. } => {
                    println!("* {}: {}", event.name(), message)
                }
                SessionEvent::Error { message, tag, .. } => eprintln!("! {}: {}", tag, message),
                other => println!("* {}", other.name()),
            },
        }
        Ok(())
    }

    fn write_message(&self, message: &str) -> Result<(), OutputError> {
        match self.format {
            OutputFormat::Json => {
                let output = serde_json::json!({
                    "message": message,
                    "level": "info"
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            _ => println!("{}", message),
        }
        Ok(())
    }

    fn write_error(&self, error: &str) -> Result<(), OutputError> {
        match self.format {
            OutputFormat::Json => {
                let output = serde_json::json!({
                    "error": error,
                    "level": "error"
                });
                eprintln!("{}", serde_json::to_string_pretty(&output)?);
            }
            _ => eprintln!("Error: {}", error),
        }
        Ok(())
    }
}

/// Table row for a discovered device
#[derive(Tabled)]
struct DeviceRow {
    id: String,
    name: String,
}

impl From<&DeviceDescriptor> for DeviceRow {
    fn from(device: &DeviceDescriptor) -> Self {
        Self {
            id: device.id.clone(),
            name: device.name.clone().unwrap_or_default(),
        }
    }
}

/// Table row for a configured device
#[derive(Tabled)]
struct ConfiguredDeviceRow {
    name: String,
    address: String,
    delimiter: String,
    baud: u32,
    description: String,
}

impl From<&DeviceConfig> for ConfiguredDeviceRow {
    fn from(device: &DeviceConfig) -> Self {
        Self {
            name: device.name.clone(),
            address: device.address.clone(),
            delimiter: device.delimiter.clone().unwrap_or_else(|| "\\0".to_string()),
            baud: device.baud_rate,
            description: device.description.clone(),
        }
    }
}
