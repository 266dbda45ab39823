use crate::domain::error::{BtSerialError, BtSerialResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Identity of a remote device as reported by a transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Stable transport address, used as the session key
    pub id: String,
    /// Human readable name, when the transport knows one
    pub name: Option<String>,
    /// Transport-specific device class
    pub class: Option<u32>,
}

impl DeviceDescriptor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            class: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_class(mut self, class: u32) -> Self {
        self.class = Some(class);
        self
    }

    /// Name if known, otherwise the id
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

impl std::fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.id),
            None => write!(f, "{}", self.id),
        }
    }
}

/// Asynchronous outcome reported by a transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected(DeviceDescriptor),
    ConnectFailed {
        device: DeviceDescriptor,
        reason: String,
    },
    ConnectionLost {
        device: DeviceDescriptor,
        reason: String,
    },
    DataReceived {
        device_id: String,
        data: Vec<u8>,
    },
    DeviceFound(DeviceDescriptor),
    DiscoveryFinished,
    BondStateChanged {
        device: DeviceDescriptor,
        bonded: bool,
    },
    AdapterStateChanged {
        enabled: bool,
    },
}

impl TransportEvent {
    pub fn device_id(&self) -> Option<&str> {
        match self {
            TransportEvent::Connected(device)
            | TransportEvent::ConnectFailed { device, .. }
            | TransportEvent::ConnectionLost { device, .. }
            | TransportEvent::DeviceFound(device)
            | TransportEvent::BondStateChanged { device, .. } => Some(device.id.as_str()),
            TransportEvent::DataReceived { device_id, .. } => Some(device_id.as_str()),
            TransportEvent::DiscoveryFinished | TransportEvent::AdapterStateChanged { .. } => None,
        }
    }
}

/// Sending half handed to transport implementations
pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;
/// Receiving half drained by the session manager
pub type TransportEventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Create the callback channel a transport reports through
pub fn transport_channel() -> (TransportEventSender, TransportEventReceiver) {
    mpsc::unbounded_channel()
}

/// Link layer the session manager drives.
///
/// Commands return as soon as they are issued. Outcomes that take time
/// (connects, discovery, bonding, inbound data, link loss) arrive later as
/// [`TransportEvent`]s on the channel the transport was built with. An `Err`
/// from a command means the command could not even be issued.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport name used in logs
    fn name(&self) -> &str;

    /// Whether an adapter is present at all
    fn is_available(&self) -> bool;

    /// Map an id to a reachable device, if it resolves
    async fn resolve_device(&self, device_id: &str) -> Option<DeviceDescriptor>;

    async fn connect(&self, device_id: &str) -> BtSerialResult<()>;

    async fn disconnect(&self, device_id: &str) -> BtSerialResult<()>;

    async fn disconnect_all(&self) -> BtSerialResult<()>;

    /// Write bytes to an open link
    async fn write(&self, device_id: &str, data: &[u8]) -> BtSerialResult<()>;

    async fn start_discovery(&self) -> BtSerialResult<()>;

    async fn cancel_discovery(&self) -> BtSerialResult<()>;

    /// Devices already bonded with this host
    async fn paired_devices(&self) -> BtSerialResult<Vec<DeviceDescriptor>>;

    async fn pair(&self, device_id: &str) -> BtSerialResult<()> {
        Err(BtSerialError::operation_failed(format!(
            "{} transport cannot pair '{}'",
            self.name(),
            device_id
        )))
    }

    async fn unpair(&self, device_id: &str) -> BtSerialResult<()> {
        Err(BtSerialError::operation_failed(format!(
            "{} transport cannot unpair '{}'",
            self.name(),
            device_id
        )))
    }

    async fn is_enabled(&self) -> bool {
        self.is_available()
    }

    async fn set_enabled(&self, enabled: bool) -> BtSerialResult<()> {
        if enabled == self.is_enabled().await {
            return Ok(());
        }
        Err(BtSerialError::operation_failed(format!(
            "{} transport cannot change adapter power",
            self.name()
        )))
    }

    /// Rename the local adapter and return the name it reports afterwards
    async fn set_adapter_name(&self, name: &str) -> BtSerialResult<String> {
        Err(BtSerialError::operation_failed(format!(
            "{} transport cannot rename its adapter to '{}'",
            self.name(),
            name
        )))
    }
}
