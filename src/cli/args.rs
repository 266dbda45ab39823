use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Command line arguments for btserial
#[derive(Parser, Debug)]
#[command(
    name = "btserial",
    version = env!("CARGO_PKG_VERSION"),
    about = "Bluetooth serial session manager",
    long_about = "Connects to Bluetooth serial (SPP/RFCOMM) devices exposed as serial ports, \
                  splits inbound data into delimiter-terminated frames and sends data to them."
)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace); overrides the config file
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format
    #[arg(short, long, value_enum, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Command to execute
    #[command(subcommand)]
    pub command: Command,
}

impl Args {
    /// Effective log level given the configured default
    pub fn log_level<'a>(&'a self, configured: &'a str) -> &'a str {
        if self.verbose {
            "debug"
        } else {
            self.log_level.as_deref().unwrap_or(configured)
        }
    }
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Scan for devices and list them
    Ports,
    /// Connect to a device and print every frame it sends
    Monitor {
        /// Port name, or the name of a configured device
        device: String,
        /// Frame delimiter: \n, \r, \t, \0, 0x0A, or a literal character
        #[arg(short, long)]
        delimiter: Option<String>,
        /// Print frames as hex
        #[arg(long)]
        hex: bool,
    },
    /// Connect to a device, send data and disconnect
    Send {
        /// Port name, or the name of a configured device
        device: String,
        /// Data to send
        data: String,
        /// Data format
        #[arg(short, long, value_enum, default_value = "text")]
        format: DataFormat,
    },
    /// Configuration management commands
    Config(ConfigArgs),
    /// Display version information
    Version,
}

/// Configuration management arguments
#[derive(ClapArgs, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

/// Configuration management subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Show the effective configuration
    Show,
    /// Create an example project configuration
    Init {
        /// Directory to create `.btserial/config.toml` in
        #[arg(short, long)]
        path: Option<PathBuf>,
    },
    /// Show where configuration is read from
    Path,
}

/// Output format options
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OutputFormat {
    /// Human-readable text output
    #[default]
    Text,
    /// JSON output
    Json,
    /// Table output
    Table,
}

/// Data format argument
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFormat {
    Text,
    Hex,
    Base64,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Table => write!(f, "table"),
        }
    }
}

impl std::fmt::Display for DataFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataFormat::Text => write!(f, "text"),
            DataFormat::Hex => write!(f, "hex"),
            DataFormat::Base64 => write!(f, "base64"),
        }
    }
}
