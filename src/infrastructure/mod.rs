// Infrastructure module - Serial transport, config files and logging
pub mod config;
pub mod logging;
pub mod serial;

pub use config::ConfigManager;
pub use logging::init_logging;
pub use serial::SerialTransport;
