use thiserror::Error;

/// btserial unified error type
#[derive(Error, Debug)]
pub enum BtSerialError {
    #[error("No usable transport adapter available")]
    TransportUnavailable,

    #[error("Device '{device_id}' not found")]
    DeviceNotFound { device_id: String },

    #[error("Connection to '{device_id}' failed: {reason}")]
    ConnectFailed { device_id: String, reason: String },

    #[error("Link to '{device_id}' lost: {reason}")]
    LinkLost { device_id: String, reason: String },

    #[error("Operation failed: {message}")]
    OperationFailed { message: String },

    #[error("Pending operation for '{key}' superseded by a newer request")]
    Superseded { key: String },

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Output error: {0}")]
    Output(String),
}

impl BtSerialError {
    pub fn operation_failed(message: impl Into<String>) -> Self {
        Self::OperationFailed {
            message: message.into(),
        }
    }

    pub fn connect_failed(device_id: &str, reason: impl Into<String>) -> Self {
        Self::ConnectFailed {
            device_id: device_id.to_string(),
            reason: reason.into(),
        }
    }

    pub fn device_not_found(device_id: &str) -> Self {
        Self::DeviceNotFound {
            device_id: device_id.to_string(),
        }
    }
}

pub type BtSerialResult<T> = Result<T, BtSerialError>;
