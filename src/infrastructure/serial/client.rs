use crate::core::transport::{DeviceDescriptor, TransportEvent, TransportEventSender};
use crate::domain::error::{BtSerialError, BtSerialResult};
use parking_lot::Mutex;
use serialport::SerialPort;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const READ_CHUNK: usize = 1024;

/// Port parameters for one link
#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub baud_rate: u32,
    pub read_timeout: Duration,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            read_timeout: Duration::from_millis(100),
        }
    }
}

/// Write half of a link. Clones share the port and stay usable after the
/// link itself has been dropped from its owner's table.
#[derive(Clone)]
pub struct LinkWriter {
    device_id: String,
    port: Arc<Mutex<Box<dyn SerialPort>>>,
}

impl LinkWriter {
    pub async fn write(&self, data: Vec<u8>) -> BtSerialResult<()> {
        let port = Arc::clone(&self.port);
        let len = data.len();
        tokio::task::spawn_blocking(move || {
            let mut port = port.lock();
            port.write_all(&data)?;
            port.flush()
        })
        .await
        .map_err(|e| {
            BtSerialError::operation_failed(format!("serial writer task failed: {}", e))
        })??;

        debug!("Sent {} bytes over '{}'", len, self.device_id);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn hold(&self) -> parking_lot::MutexGuard<'_, Box<dyn SerialPort>> {
        self.port.lock()
    }
}

/// An open serial port with a reader thread that forwards inbound bytes
pub struct SerialLink {
    device_id: String,
    writer: LinkWriter,
    stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl SerialLink {
    /// Open `device_id` and start reading. Blocks while the port opens.
    pub fn open(
        device_id: &str,
        settings: &LinkSettings,
        events: TransportEventSender,
    ) -> BtSerialResult<Self> {
        let port = serialport::new(device_id, settings.baud_rate)
            .timeout(settings.read_timeout)
            .open()?;
        info!("Serial port '{}' opened at {} baud", device_id, settings.baud_rate);
        Self::from_port(device_id, port, events)
    }

    /// Wrap an already open port and start its reader thread
    pub fn from_port(
        device_id: &str,
        port: Box<dyn SerialPort>,
        events: TransportEventSender,
    ) -> BtSerialResult<Self> {
        let reader_port = port.try_clone()?;
        let stop = Arc::new(AtomicBool::new(false));
        let reader = std::thread::Builder::new()
            .name(format!("btserial-read-{}", device_id))
            .spawn({
                let device_id = device_id.to_string();
                let stop = Arc::clone(&stop);
                move || read_loop(device_id, reader_port, stop, events)
            })?;

        Ok(Self {
            device_id: device_id.to_string(),
            writer: LinkWriter {
                device_id: device_id.to_string(),
                port: Arc::new(Mutex::new(port)),
            },
            stop,
            reader: Some(reader),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn writer(&self) -> LinkWriter {
        self.writer.clone()
    }

    /// Stop the reader. The port closes once the reader lets go of it.
    pub fn close(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        // The reader notices within one read timeout; joining would block
        self.reader.take();
        info!("Serial link '{}' closed", self.device_id);
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        if self.reader.is_some() {
            self.close();
        }
    }
}

fn read_loop(
    device_id: String,
    mut port: Box<dyn SerialPort>,
    stop: Arc<AtomicBool>,
    events: TransportEventSender,
) {
    let mut buffer = [0u8; READ_CHUNK];
    while !stop.load(Ordering::SeqCst) {
        match port.read(&mut buffer) {
            Ok(0) => continue,
            Ok(n) => {
                debug!("Received {} bytes over '{}'", n, device_id);
                let event = TransportEvent::DataReceived {
                    device_id: device_id.clone(),
                    data: buffer[..n].to_vec(),
                };
                if events.send(event).is_err() {
                    warn!("Nobody is listening to '{}' any more, stopping reader", device_id);
                    break;
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(e) => {
                if !stop.load(Ordering::SeqCst) {
                    error!("Failed to read from '{}': {}", device_id, e);
                    let _ = events.send(TransportEvent::ConnectionLost {
                        device: DeviceDescriptor::new(device_id.clone()),
                        reason: e.to_string(),
                    });
                }
                break;
            }
        }
    }
    debug!("Reader for '{}' finished", device_id);
}
