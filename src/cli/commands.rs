use crate::cli::args::{Args, Command, ConfigCommand, DataFormat};
use crate::cli::output::{ConsoleWriter, OutputWriter};
use crate::core::buffer::{parse_delimiter, DEFAULT_DELIMITER};
use crate::core::events::SessionEvent;
use crate::core::session::SessionManager;
use crate::domain::config::BtSerialConfig;
use crate::domain::error::{BtSerialError, BtSerialResult};
use crate::infrastructure::config::ConfigManager;
use crate::infrastructure::logging::init_logging;
use crate::infrastructure::serial::SerialTransport;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Execute CLI command
pub async fn execute_command(args: Args) -> BtSerialResult<()> {
    let writer = ConsoleWriter::new(args.output);

    let config_manager = ConfigManager::new()?;
    let config = match &args.config {
        Some(path) => config_manager.load_config_from_path(path)?,
        None => config_manager.load_config()?,
    };

    init_logging(args.log_level(&config.global.log_level))?;

    match args.command {
        Command::Ports => execute_ports(&writer, &config).await,
        Command::Monitor {
            device,
            delimiter,
            hex,
        } => execute_monitor(&writer, &config, &device, delimiter.as_deref(), hex).await,
        Command::Send {
            device,
            data,
            format,
        } => execute_send(&writer, &config, &device, &data, format).await,
        Command::Config(config_args) => {
            execute_config_command(config_args.command, &writer, &config, &config_manager)
        }
        Command::Version => {
            writer.write_message(&format!("btserial {}", env!("CARGO_PKG_VERSION")))?;
            Ok(())
        }
    }
}

/// Session manager over the serial transport, with its event loop running
fn start_manager(config: &BtSerialConfig) -> (Arc<SessionManager>, JoinHandle<()>) {
    let (transport, rx) = SerialTransport::new(config.devices.clone());
    let manager = SessionManager::new(Arc::new(transport), config.global.clone());
    let pump = manager.start(rx);
    (manager, pump)
}

/// Port address and configured delimiter for a device name or address
pub fn resolve_target(config: &BtSerialConfig, device: &str) -> (String, Option<String>) {
    match config.find_device(device) {
        Some(configured) => (configured.address.clone(), configured.delimiter.clone()),
        None => (device.to_string(), None),
    }
}

async fn execute_ports(writer: &ConsoleWriter, config: &BtSerialConfig) -> BtSerialResult<()> {
    let (manager, _pump) = start_manager(config);

    let mut devices = manager.paired_devices().await?;
    devices.extend(manager.discover_unpaired().await?);
    writer.write_devices(&devices)?;
    Ok(())
}

async fn execute_monitor(
    writer: &ConsoleWriter,
    config: &BtSerialConfig,
    device: &str,
    delimiter: Option<&str>,
    as_hex: bool,
) -> BtSerialResult<()> {
    let (manager, _pump) = start_manager(config);
    let (address, configured_delimiter) = resolve_target(config, device);

    let mut events = manager.subscribe();
    let descriptor = manager.connect(&address).await?;

    let delimiter = match delimiter.or(configured_delimiter.as_deref()) {
        Some(text) => parse_delimiter(text)?,
        None => DEFAULT_DELIMITER,
    };
    manager.set_delimiter(Some(&address), delimiter).await?;
    writer.write_message(&format!(
        "Monitoring {} (delimiter 0x{:02X}), Ctrl-C to stop",
        descriptor, delimiter
    ))?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ticker = tokio::time::interval(POLL_INTERVAL);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted, stopping monitor");
                break;
            }
            event = events.recv() => match event {
                Some(event) if event.device_id() == Some(address.as_str()) => {
                    let lost = matches!(event, SessionEvent::ConnectionLost { .. });
                    writer.write_event(&event)?;
                    if lost {
                        print_frames(writer, &manager, &address, as_hex).await?;
                        break;
                    }
                }
                Some(event) => debug!("Ignoring {} event", event.name()),
                None => break,
            },
            _ = ticker.tick() => print_frames(writer, &manager, &address, as_hex).await?,
        }
    }

    manager.disconnect(Some(&address)).await
}

async fn print_frames(
    writer: &ConsoleWriter,
    manager: &SessionManager,
    address: &str,
    as_hex: bool,
) -> BtSerialResult<()> {
    loop {
        let frame = manager.read_until_delimiter(Some(address)).await;
        if frame.is_empty() {
            return Ok(());
        }
        writer.write_frame(address, &frame, as_hex)?;
    }
}

async fn execute_send(
    writer: &ConsoleWriter,
    config: &BtSerialConfig,
    device: &str,
    data: &str,
    format: DataFormat,
) -> BtSerialResult<()> {
    let bytes = parse_data(data, format)?;
    let (manager, _pump) = start_manager(config);
    let (address, _) = resolve_target(config, device);

    manager.connect(&address).await?;
    let written = manager.write(Some(&address), &bytes).await;
    manager.disconnect(Some(&address)).await?;
    written?;

    writer.write_message(&format!("Sent {} bytes to {}", bytes.len(), address))?;
    Ok(())
}

fn execute_config_command(
    command: ConfigCommand,
    writer: &ConsoleWriter,
    config: &BtSerialConfig,
    config_manager: &ConfigManager,
) -> BtSerialResult<()> {
    match command {
        ConfigCommand::Show => writer.write_config(config)?,
        ConfigCommand::Init { path } => {
            let dir = match path {
                Some(path) => path,
                None => std::env::current_dir()?,
            };
            let created = config_manager.init_project_config(&dir)?;
            writer.write_message(&format!("Created {}", created.display()))?;
        }
        ConfigCommand::Path => writer.write_paths(
            config_manager.global_config_path(),
            config_manager.project_config_path().map(|p| p.as_path()),
        )?,
    }
    Ok(())
}

/// Decode command line data in the given format
pub fn parse_data(data: &str, format: DataFormat) -> BtSerialResult<Vec<u8>> {
    match format {
        DataFormat::Text => Ok(data.as_bytes().to_vec()),
        DataFormat::Hex => {
            let cleaned: String = data.chars().filter(|c| !c.is_whitespace()).collect();
            hex::decode(&cleaned)
                .map_err(|e| BtSerialError::InvalidInput(format!("Invalid hex data: {}", e)))
        }
        DataFormat::Base64 => {
            use base64::Engine;
            base64::engine::general_purpose::STANDARD
                .decode(data)
                .map_err(|e| BtSerialError::InvalidInput(format!("Invalid base64 data: {}", e)))
        }
    }
}
