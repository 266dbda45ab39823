// Shared scripted transport for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use btserial::core::transport::{transport_channel, TransportEventSender};
use btserial::domain::config::GlobalConfig;
use btserial::{
    BtSerialError, BtSerialResult, DeviceDescriptor, SessionManager, Transport, TransportEvent,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How the mock answers a connect command
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectBehavior {
    /// Report success through the callback channel
    Accept,
    /// Report a failure with this reason through the callback channel
    Refuse(String),
    /// Accept the command and never answer
    Silent,
    /// Reject the command outright
    Reject,
}

/// In-memory transport that records every command and answers from a script
pub struct MockTransport {
    events: TransportEventSender,
    available: AtomicBool,
    fail_writes: AtomicBool,
    connect_behavior: Mutex<ConnectBehavior>,
    scan_results: Mutex<Vec<DeviceDescriptor>>,
    paired: Mutex<Vec<DeviceDescriptor>>,
    adapter_name: Mutex<String>,
    calls: Mutex<Vec<String>>,
    written: Mutex<Vec<(String, Vec<u8>)>>,
}

impl MockTransport {
    pub fn new() -> (Arc<Self>, btserial::core::transport::TransportEventReceiver) {
        let (events, rx) = transport_channel();
        let transport = Arc::new(Self {
            events,
            available: AtomicBool::new(true),
            fail_writes: AtomicBool::new(false),
            connect_behavior: Mutex::new(ConnectBehavior::Accept),
            scan_results: Mutex::new(Vec::new()),
            paired: Mutex::new(Vec::new()),
            adapter_name: Mutex::new("mock-adapter".to_string()),
            calls: Mutex::new(Vec::new()),
            written: Mutex::new(Vec::new()),
        });
        (transport, rx)
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_connect_behavior(&self, behavior: ConnectBehavior) {
        *self.connect_behavior.lock() = behavior;
    }

    pub fn set_scan_results(&self, devices: Vec<DeviceDescriptor>) {
        *self.scan_results.lock() = devices;
    }

    pub fn set_paired(&self, devices: Vec<DeviceDescriptor>) {
        *self.paired.lock() = devices;
    }

    /// Send a callback as if the link layer raised it
    pub fn emit(&self, event: TransportEvent) {
        self.events.send(event).expect("session manager stopped listening");
    }

    pub fn adapter_name(&self) -> String {
        self.adapter_name.lock().clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn written(&self) -> Vec<(String, Vec<u8>)> {
        self.written.lock().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &str {
        "mock"
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn resolve_device(&self, device_id: &str) -> Option<DeviceDescriptor> {
        if device_id.starts_with("unknown") {
            return None;
        }
        Some(DeviceDescriptor::new(device_id))
    }

    async fn connect(&self, device_id: &str) -> BtSerialResult<()> {
        self.record(format!("connect {}", device_id));
        let behavior = self.connect_behavior.lock().clone();
        let device = DeviceDescriptor::new(device_id);
        match behavior {
            ConnectBehavior::Accept => self.emit(TransportEvent::Connected(device)),
            ConnectBehavior::Refuse(reason) => {
                self.emit(TransportEvent::ConnectFailed { device, reason })
            }
            ConnectBehavior::Silent => {}
            ConnectBehavior::Reject => {
                return Err(BtSerialError::operation_failed("adapter busy"));
            }
        }
        Ok(())
    }

    async fn disconnect(&self, device_id: &str) -> BtSerialResult<()> {
        self.record(format!("disconnect {}", device_id));
        Ok(())
    }

    async fn disconnect_all(&self) -> BtSerialResult<()> {
        self.record("disconnect_all".to_string());
        Ok(())
    }

    async fn write(&self, device_id: &str, data: &[u8]) -> BtSerialResult<()> {
        self.record(format!("write {}", device_id));
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(BtSerialError::operation_failed("socket closed"));
        }
        self.written.lock().push((device_id.to_string(), data.to_vec()));
        Ok(())
    }

    async fn start_discovery(&self) -> BtSerialResult<()> {
        self.record("start_discovery".to_string());
        let found = self.scan_results.lock().clone();
        for device in found {
            self.emit(TransportEvent::DeviceFound(device));
        }
        self.emit(TransportEvent::DiscoveryFinished);
        Ok(())
    }

    async fn cancel_discovery(&self) -> BtSerialResult<()> {
        self.record("cancel_discovery".to_string());
        Ok(())
    }

    async fn paired_devices(&self) -> BtSerialResult<Vec<DeviceDescriptor>> {
        Ok(self.paired.lock().clone())
    }

    async fn pair(&self, device_id: &str) -> BtSerialResult<()> {
        self.record(format!("pair {}", device_id));
        self.emit(TransportEvent::BondStateChanged {
            device: DeviceDescriptor::new(device_id).with_name("Paired"),
            bonded: !device_id.starts_with("stubborn"),
        });
        Ok(())
    }

    async fn set_adapter_name(&self, name: &str) -> BtSerialResult<String> {
        self.record(format!("set_adapter_name {}", name));
        if name.is_empty() {
            return Err(BtSerialError::operation_failed("adapter name must not be empty"));
        }
        *self.adapter_name.lock() = name.to_string();
        Ok(self.adapter_name())
    }
}

/// Manager wired to a fresh mock with its event loop running
pub fn harness(config: GlobalConfig) -> (Arc<SessionManager>, Arc<MockTransport>) {
    let (transport, rx) = MockTransport::new();
    let manager = SessionManager::new(transport.clone(), config);
    manager.start(rx);
    (manager, transport)
}

pub fn quick_config() -> GlobalConfig {
    GlobalConfig {
        connect_timeout_ms: 200,
        discovery_timeout_ms: 200,
        pairing_timeout_ms: 200,
        ..GlobalConfig::default()
    }
}

/// Feed inbound bytes straight into the manager
pub async fn deliver(manager: &SessionManager, device_id: &str, data: &[u8]) {
    manager
        .handle_transport_event(TransportEvent::DataReceived {
            device_id: device_id.to_string(),
            data: data.to_vec(),
        })
        .await;
}

/// Give the event loop a moment to drain queued callbacks
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}
