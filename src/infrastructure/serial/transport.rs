use crate::core::transport::{
    transport_channel, DeviceDescriptor, Transport, TransportEvent, TransportEventReceiver,
    TransportEventSender,
};
use crate::domain::config::DeviceConfig;
use crate::domain::error::{BtSerialError, BtSerialResult};
use crate::infrastructure::serial::client::{LinkSettings, SerialLink};
use async_trait::async_trait;
use serialport::{SerialPortInfo, SerialPortType};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Transport over serial ports, which is how RFCOMM links appear to
/// desktop systems (`/dev/rfcomm0`, `COM7`, ...).
///
/// Device ids are port names. Configured devices count as paired.
pub struct SerialTransport {
    events: TransportEventSender,
    links: Arc<RwLock<HashMap<String, SerialLink>>>,
    devices: Vec<DeviceConfig>,
    discovering: Arc<AtomicBool>,
    // Outcome of the latest port enumeration
    ports_available: Arc<AtomicBool>,
}

impl SerialTransport {
    /// Build the transport. Enumerates ports once, so call it off the async
    /// threads' hot paths.
    pub fn new(devices: Vec<DeviceConfig>) -> (Self, TransportEventReceiver) {
        let (events, rx) = transport_channel();
        let transport = Self {
            events,
            links: Arc::new(RwLock::new(HashMap::new())),
            devices,
            discovering: Arc::new(AtomicBool::new(false)),
            ports_available: Arc::new(AtomicBool::new(serialport::available_ports().is_ok())),
        };
        (transport, rx)
    }

    fn settings_for(&self, device_id: &str) -> LinkSettings {
        let mut settings = LinkSettings::default();
        if let Some(device) = self.devices.iter().find(|d| d.address == device_id) {
            settings.baud_rate = device.baud_rate;
        }
        settings
    }

    fn emit(events: &TransportEventSender, event: TransportEvent) {
        if events.send(event).is_err() {
            warn!("Transport event dropped, no session manager is listening");
        }
    }

    /// Enumerate ports on a blocking worker, recording whether it worked
    async fn list_ports(available: &AtomicBool) -> BtSerialResult<Vec<SerialPortInfo>> {
        let ports = tokio::task::spawn_blocking(serialport::available_ports)
            .await
            .map_err(|e| {
                BtSerialError::operation_failed(format!("port enumeration failed: {}", e))
            })?;
        available.store(ports.is_ok(), Ordering::SeqCst);
        ports.map_err(BtSerialError::from)
    }
}

/// Descriptor for a port, named after the configured device or the USB product
pub fn describe_port(info: &SerialPortInfo, devices: &[DeviceConfig]) -> DeviceDescriptor {
    let descriptor = DeviceDescriptor::new(info.port_name.clone());
    if let Some(device) = devices.iter().find(|d| d.address == info.port_name) {
        return descriptor.with_name(device.name.clone());
    }
    match &info.port_type {
        SerialPortType::UsbPort(usb) => match &usb.product {
            Some(product) => descriptor.with_name(product.clone()),
            None => descriptor,
        },
        SerialPortType::BluetoothPort => descriptor.with_name("Bluetooth serial port"),
        SerialPortType::PciPort | SerialPortType::Unknown => descriptor,
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn name(&self) -> &str {
        "serial"
    }

    fn is_available(&self) -> bool {
        self.ports_available.load(Ordering::SeqCst)
    }

    async fn resolve_device(&self, device_id: &str) -> Option<DeviceDescriptor> {
        if let Ok(ports) = Self::list_ports(&self.ports_available).await {
            if let Some(info) = ports.iter().find(|p| p.port_name == device_id) {
                return Some(describe_port(info, &self.devices));
            }
        }
        // Some ports (pseudo terminals, rfcomm binds) are not enumerated
        Path::new(device_id)
            .exists()
            .then(|| DeviceDescriptor::new(device_id))
    }

    async fn connect(&self, device_id: &str) -> BtSerialResult<()> {
        let settings = self.settings_for(device_id);
        let events = self.events.clone();
        let links = Arc::clone(&self.links);
        let devices = self.devices.clone();
        let available = Arc::clone(&self.ports_available);
        let device_id = device_id.to_string();

        tokio::spawn(async move {
            let opened = tokio::task::spawn_blocking({
                let device_id = device_id.clone();
                let events = events.clone();
                move || SerialLink::open(&device_id, &settings, events)
            })
            .await;

            let device = match Self::list_ports(&available).await {
                Ok(ports) => ports
                    .iter()
                    .find(|p| p.port_name == device_id)
                    .map(|info| describe_port(info, &devices))
                    .unwrap_or_else(|| DeviceDescriptor::new(device_id.clone())),
                Err(_) => DeviceDescriptor::new(device_id.clone()),
            };

            match opened {
                Ok(Ok(link)) => {
                    let previous = links.write().await.insert(device_id.clone(), link);
                    if let Some(mut previous) = previous {
                        debug!("Replacing existing link to '{}'", device_id);
                        previous.close();
                    }
                    Self::emit(&events, TransportEvent::Connected(device));
                }
                Ok(Err(e)) => Self::emit(
                    &events,
                    TransportEvent::ConnectFailed {
                        device,
                        reason: e.to_string(),
                    },
                ),
                Err(e) => Self::emit(
                    &events,
                    TransportEvent::ConnectFailed {
                        device,
                        reason: format!("open task failed: {}", e),
                    },
                ),
            }
        });
        Ok(())
    }

    async fn disconnect(&self, device_id: &str) -> BtSerialResult<()> {
        match self.links.write().await.remove(device_id) {
            Some(mut link) => link.close(),
            None => debug!("No open link to '{}'", device_id),
        }
        Ok(())
    }

    async fn disconnect_all(&self) -> BtSerialResult<()> {
        let mut links = self.links.write().await;
        for (_, mut link) in links.drain() {
            link.close();
        }
        Ok(())
    }

    async fn write(&self, device_id: &str, data: &[u8]) -> BtSerialResult<()> {
        // The table guard must not outlive the lookup
        let writer = self.links.read().await.get(device_id).map(SerialLink::writer);
        match writer {
            Some(writer) => writer.write(data.to_vec()).await,
            None => Err(BtSerialError::operation_failed(format!(
                "no open link to '{}'",
                device_id
            ))),
        }
    }

    async fn start_discovery(&self) -> BtSerialResult<()> {
        self.discovering.store(true, Ordering::SeqCst);
        let events = self.events.clone();
        let discovering = Arc::clone(&self.discovering);
        let devices = self.devices.clone();
        let available = Arc::clone(&self.ports_available);

        tokio::spawn(async move {
            match Self::list_ports(&available).await {
                Ok(ports) => {
                    info!("Scan found {} serial ports", ports.len());
                    for info in &ports {
                        if !discovering.load(Ordering::SeqCst) {
                            debug!("Discovery cancelled");
                            break;
                        }
                        let device = describe_port(info, &devices);
                        Self::emit(&events, TransportEvent::DeviceFound(device));
                    }
                }
                Err(e) => warn!("Port enumeration failed: {}", e),
            }
            discovering.store(false, Ordering::SeqCst);
            Self::emit(&events, TransportEvent::DiscoveryFinished);
        });
        Ok(())
    }

    async fn cancel_discovery(&self) -> BtSerialResult<()> {
        self.discovering.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn paired_devices(&self) -> BtSerialResult<Vec<DeviceDescriptor>> {
        let ports = Self::list_ports(&self.ports_available).await?;
        Ok(self
            .devices
            .iter()
            .filter(|device| {
                ports.iter().any(|p| p.port_name == device.address)
                    || Path::new(&device.address).exists()
            })
            .map(|device| {
                DeviceDescriptor::new(device.address.clone()).with_name(device.name.clone())
            })
            .collect())
    }
}
