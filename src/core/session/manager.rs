use crate::core::events::{EventDispatcher, EventStream, SessionEvent};
use crate::core::pending::{Completion, ConnectKey, ExpiryHook, PendingRegistry};
use crate::core::session::registry::ConnectionRegistry;
use crate::core::session::state::{SessionSnapshot, SessionState};
use crate::core::transport::{DeviceDescriptor, Transport, TransportEvent, TransportEventReceiver};
use crate::domain::config::GlobalConfig;
use crate::domain::error::{BtSerialError, BtSerialResult};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const DISCOVERY_KEY: &str = "discovery";

/// Handle for an in-flight connect
pub type ConnectCompletion = Completion<ConnectKey, DeviceDescriptor>;

/// Result of a bonding request: the device and whether it is now bonded
type BondOutcome = (DeviceDescriptor, bool);

/// Session manager for every device reachable through one transport.
///
/// Commands are issued to the transport and their results are matched up
/// with the callers through pending registries once the transport reports
/// back via [`SessionManager::handle_transport_event`].
pub struct SessionManager {
    transport: Arc<dyn Transport>,
    config: GlobalConfig,
    sessions: ConnectionRegistry,
    connects: Arc<PendingRegistry<ConnectKey, DeviceDescriptor>>,
    discovery: Arc<PendingRegistry<&'static str, Vec<DeviceDescriptor>>>,
    bonding: Arc<PendingRegistry<String, BondOutcome>>,
    // Devices reported by the scan in progress
    discovered: Mutex<Vec<DeviceDescriptor>>,
    events: EventDispatcher,
}

impl SessionManager {
    pub fn new(transport: Arc<dyn Transport>, config: GlobalConfig) -> Arc<Self> {
        info!(
            "Created session manager on '{}' transport (max {} sessions)",
            transport.name(),
            config.max_sessions
        );
        Arc::new_cyclic(|manager: &Weak<Self>| {
            let on_connect_expired: ExpiryHook<ConnectKey> = {
                let manager = manager.clone();
                Arc::new(move |key, reason| {
                    let manager = manager.clone();
                    Box::pin(async move {
                        if let Some(manager) = manager.upgrade() {
                            manager.on_connect_expired(key, reason).await;
                        }
                    })
                })
            };
            let on_discovery_expired: ExpiryHook<&'static str> = {
                let manager = manager.clone();
                Arc::new(move |_key, reason| {
                    let manager = manager.clone();
                    Box::pin(async move {
                        if let Some(manager) = manager.upgrade() {
                            manager.on_discovery_expired(reason).await;
                        }
                    })
                })
            };

            Self {
                events: EventDispatcher::new(config.event_capacity),
                transport,
                config,
                sessions: ConnectionRegistry::new(),
                connects: PendingRegistry::with_expiry_hook("connect", on_connect_expired),
                discovery: PendingRegistry::with_expiry_hook("discovery", on_discovery_expired),
                bonding: PendingRegistry::new("bonding"),
                discovered: Mutex::new(Vec::new()),
            }
        })
    }

    /// Spawn the loop that feeds transport callbacks into the manager.
    ///
    /// The loop holds only a weak reference, so it ends once the manager is
    /// dropped or the transport closes its channel.
    pub fn start(self: &Arc<Self>, mut rx: TransportEventReceiver) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.handle_transport_event(event).await;
            }
            debug!("Transport event loop finished");
        })
    }

    pub fn events(&self) -> &EventDispatcher {
        &self.events
    }

    pub fn subscribe(&self) -> EventStream {
        self.events.subscribe()
    }

    pub fn config(&self) -> &GlobalConfig {
        &self.config
    }

    pub fn transport_name(&self) -> &str {
        self.transport.name()
    }

    // Adapter

    pub async fn is_enabled(&self) -> bool {
        self.transport.is_available() && self.transport.is_enabled().await
    }

    pub async fn enable(&self) -> BtSerialResult<()> {
        self.set_enabled(true, "SessionManager.enable").await
    }

    pub async fn disable(&self) -> BtSerialResult<()> {
        self.set_enabled(false, "SessionManager.disable").await
    }

    async fn set_enabled(&self, enabled: bool, tag: &str) -> BtSerialResult<()> {
        self.ensure_available(tag, None)?;
        self.transport
            .set_enabled(enabled)
            .await
            .map_err(|e| self.report_error(e, tag, None))
    }

    /// Rename the local adapter, returning the name it now reports
    pub async fn set_adapter_name(&self, name: &str) -> BtSerialResult<String> {
        const TAG: &str = "SessionManager.set_adapter_name";
        self.ensure_available(TAG, None)?;

        let applied = self
            .transport
            .set_adapter_name(name)
            .await
            .map_err(|e| self.report_error(e, TAG, None))?;
        info!("Adapter name is now '{}'", applied);
        Ok(applied)
    }

    // Devices

    pub async fn paired_devices(&self) -> BtSerialResult<Vec<DeviceDescriptor>> {
        self.ensure_available("SessionManager.paired_devices", None)?;
        self.transport.paired_devices().await
    }

    /// Scan for devices and return those that are not already paired
    pub async fn discover_unpaired(&self) -> BtSerialResult<Vec<DeviceDescriptor>> {
        const TAG: &str = "SessionManager.discover_unpaired";
        self.ensure_available(TAG, None)?;

        self.discovered.lock().await.clear();
        let completion = self
            .discovery
            .register(
                DISCOVERY_KEY,
                self.config.discovery_timeout(),
                BtSerialError::operation_failed(format!(
                    "discovery did not finish within {:?}",
                    self.config.discovery_timeout()
                )),
            )
            .await;

        if let Err(e) = self.transport.start_discovery().await {
            self.discovery.cancel(&DISCOVERY_KEY, completion.operation_id()).await;
            return Err(self.report_error(e, TAG, None));
        }

        let found = completion.wait().await?;
        let paired = match self.transport.paired_devices().await {
            Ok(paired) => paired,
            Err(e) => {
                warn!("Could not list paired devices, returning every discovered device: {}", e);
                Vec::new()
            }
        };
        Ok(found
            .into_iter()
            .filter(|device| !paired.iter().any(|p| p.id == device.id))
            .collect())
    }

    pub async fn cancel_discovery(&self) -> BtSerialResult<()> {
        self.transport
            .cancel_discovery()
            .await
            .map_err(|e| self.report_error(e, "SessionManager.cancel_discovery", None))
    }

    pub async fn pair(&self, device_id: &str) -> BtSerialResult<DeviceDescriptor> {
        self.change_bond(device_id, true).await
    }

    pub async fn unpair(&self, device_id: &str) -> BtSerialResult<DeviceDescriptor> {
        self.change_bond(device_id, false).await
    }

    async fn change_bond(&self, device_id: &str, bond: bool) -> BtSerialResult<DeviceDescriptor> {
        let (tag, verb) = if bond {
            ("SessionManager.pair", "pairing with")
        } else {
            ("SessionManager.unpair", "unpairing from")
        };
        self.ensure_available(tag, Some(device_id))?;

        let completion = self
            .bonding
            .register(
                device_id.to_string(),
                self.config.pairing_timeout(),
                BtSerialError::operation_failed(format!("{} '{}' timed out", verb, device_id)),
            )
            .await;

        let issued = if bond {
            self.transport.pair(device_id).await
        } else {
            self.transport.unpair(device_id).await
        };
        if let Err(e) = issued {
            self.bonding.cancel(&device_id.to_string(), completion.operation_id()).await;
            return Err(self.report_error(e, tag, Some(device_id)));
        }

        let (device, bonded) = completion.wait().await?;
        if bonded != bond {
            return Err(self.report_error(
                BtSerialError::operation_failed(format!("{} '{}' was rejected", verb, device_id)),
                tag,
                Some(device_id),
            ));
        }
        info!("Bond state of '{}' is now {}", device, if bonded { "bonded" } else { "none" });
        Ok(device)
    }

    // Connections

    /// Issue a connect for `device_id` and return a handle for its outcome
    pub async fn request_connect(&self, device_id: &str) -> BtSerialResult<ConnectCompletion> {
        const TAG: &str = "SessionManager.connect";
        self.ensure_available(TAG, Some(device_id))?;

        let descriptor = match self.transport.resolve_device(device_id).await {
            Some(descriptor) => descriptor,
            None => {
                let err = BtSerialError::device_not_found(device_id);
                return Err(self.report_error(err, TAG, Some(device_id)));
            }
        };
        let id = descriptor.id.clone();
        self.ensure_capacity(&id).await?;

        let key = ConnectKey::Device(id.clone());
        let completion = self
            .connects
            .register(
                key.clone(),
                self.config.connect_timeout(),
                BtSerialError::connect_failed(&id, "timed out"),
            )
            .await;
        self.sessions.begin_connect(descriptor).await;

        info!("Connecting to '{}' (operation {})", id, completion.operation_id());
        if let Err(e) = self.transport.connect(&id).await {
            if self.connects.cancel(&key, completion.operation_id()).await {
                self.sessions.mark_failed(&id).await;
            }
            let err = BtSerialError::connect_failed(&id, e.to_string());
            return Err(self.report_error(err, TAG, Some(&id)));
        }
        Ok(completion)
    }

    /// Connect to `device_id` and wait for the transport to confirm
    pub async fn connect(&self, device_id: &str) -> BtSerialResult<DeviceDescriptor> {
        self.request_connect(device_id).await?.wait().await
    }

    /// Start a scan and connect to whichever device it reports first
    pub async fn request_connect_first_available(&self) -> BtSerialResult<ConnectCompletion> {
        const TAG: &str = "SessionManager.connect_first_available";
        self.ensure_available(TAG, None)?;

        let key = ConnectKey::FirstAvailable;
        let completion = self
            .connects
            .register(
                key.clone(),
                self.config.discovery_timeout() + self.config.connect_timeout(),
                BtSerialError::connect_failed(&key.to_string(), "no device connected in time"),
            )
            .await;

        self.discovered.lock().await.clear();
        if let Err(e) = self.transport.start_discovery().await {
            self.connects.cancel(&key, completion.operation_id()).await;
            return Err(self.report_error(e, TAG, None));
        }
        info!(
            "Waiting for the first discovered device (operation {})",
            completion.operation_id()
        );
        Ok(completion)
    }

    pub async fn connect_first_available(&self) -> BtSerialResult<DeviceDescriptor> {
        self.request_connect_first_available().await?.wait().await
    }

    /// Expiry of a connect, run before any waiting caller sees the timeout.
    ///
    /// Also runs when the caller dropped its completion.
    async fn on_connect_expired(&self, key: ConnectKey, reason: String) {
        match key {
            ConnectKey::Device(id) => self.abandon_connect(&id, &reason).await,
            ConnectKey::FirstAvailable => {
                if let Err(e) = self.transport.cancel_discovery().await {
                    debug!("Could not stop discovery after first-available timeout: {}", e);
                }
            }
        }
    }

    // An expired connect leaves its session in Connecting
    async fn abandon_connect(&self, id: &str, reason: &str) {
        if self.sessions.state(id).await != Some(SessionState::Connecting) {
            return;
        }
        let device = self
            .sessions
            .descriptor(id)
            .await
            .unwrap_or_else(|| DeviceDescriptor::new(id));
        self.sessions.mark_failed(id).await;
        warn!("Connect to '{}' abandoned: {}", id, reason);
        self.events.publish(SessionEvent::ConnectionFailed {
            device,
            message: reason.to_string(),
        });
    }

    async fn on_discovery_expired(&self, reason: String) {
        warn!("Discovery abandoned: {}", reason);
        if let Err(e) = self.transport.cancel_discovery().await {
            warn!("Failed to cancel discovery: {}", e);
        }
    }

    /// Disconnect `device_id`, or the primary session when none is given.
    ///
    /// The session keeps its buffer and delimiter for a later reconnect.
    pub async fn disconnect(&self, device_id: Option<&str>) -> BtSerialResult<()> {
        let Some(id) = self.sessions.resolve_id(device_id).await else {
            debug!("Disconnect requested with no sessions");
            return Ok(());
        };

        // Marked first so link loss reported during teardown is ignored
        self.sessions.mark_disconnected(&id).await;
        self.connects
            .fail(
                &ConnectKey::Device(id.clone()),
                BtSerialError::connect_failed(&id, "disconnect requested"),
            )
            .await;

        self.transport
            .disconnect(&id)
            .await
            .map_err(|e| self.report_error(e, "SessionManager.disconnect", Some(&id)))?;
        info!("Disconnected '{}'", id);
        Ok(())
    }

    pub async fn disconnect_all(&self) -> BtSerialResult<()> {
        let ids = self.sessions.mark_all_disconnected().await;
        let failed = self
            .connects
            .fail_all(|key| BtSerialError::connect_failed(&key.to_string(), "disconnect requested"))
            .await;
        if failed > 0 {
            debug!("Failed {} pending connects on disconnect-all", failed);
        }

        self.transport
            .disconnect_all()
            .await
            .map_err(|e| self.report_error(e, "SessionManager.disconnect_all", None))?;
        info!("Disconnected {} sessions", ids.len());
        Ok(())
    }

    pub async fn is_connected(&self, device_id: Option<&str>) -> bool {
        match self.sessions.resolve_id(device_id).await {
            Some(id) => self.sessions.state(&id).await == Some(SessionState::Connected),
            None => false,
        }
    }

    pub async fn session_state(&self, device_id: &str) -> Option<SessionState> {
        self.sessions.state(device_id).await
    }

    pub async fn connected_devices(&self) -> Vec<DeviceDescriptor> {
        let mut devices = Vec::new();
        for id in self.sessions.connected_ids().await {
            if let Some(device) = self.sessions.descriptor(&id).await {
                devices.push(device);
            }
        }
        devices
    }

    pub async fn sessions(&self) -> Vec<SessionSnapshot> {
        self.sessions.snapshots().await
    }

    /// Forget every session including buffered data
    pub async fn reset(&self) -> usize {
        let cleared = self.sessions.reset().await;
        info!("Reset {} sessions", cleared);
        cleared
    }

    // Data

    /// Send bytes to `device_id`, or the primary session.
    ///
    /// A transport failure is always published as an error event. It is
    /// returned to the caller too unless `propagate_write_errors` is off.
    pub async fn write(&self, device_id: Option<&str>, data: &[u8]) -> BtSerialResult<()> {
        let id = self.require_id(device_id).await?;
        match self.transport.write(&id, data).await {
            Ok(()) => {
                self.sessions.record_sent(&id, data.len()).await;
                debug!("Wrote {} bytes to '{}'", data.len(), id);
                Ok(())
            }
            Err(e) => {
                let e = self.report_error(e, "SessionManager.write", Some(&id));
                if self.config.propagate_write_errors {
                    Err(e)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Everything buffered so far; empty when nothing has arrived
    pub async fn read_available(&self, device_id: Option<&str>) -> Vec<u8> {
        match self.sessions.resolve_id(device_id).await {
            Some(id) => self.sessions.drain_all(&id).await,
            None => Vec::new(),
        }
    }

    /// Next complete frame, delimiter included; empty when none is complete
    pub async fn read_until_delimiter(&self, device_id: Option<&str>) -> Vec<u8> {
        match self.sessions.resolve_id(device_id).await {
            Some(id) => self.sessions.extract_frame(&id).await,
            None => Vec::new(),
        }
    }

    pub async fn set_delimiter(
        &self,
        device_id: Option<&str>,
        delimiter: u8,
    ) -> BtSerialResult<()> {
        let id = self.require_id(device_id).await?;
        self.sessions.set_delimiter(&id, delimiter).await
    }

    pub async fn delimiter(&self, device_id: Option<&str>) -> u8 {
        match self.sessions.resolve_id(device_id).await {
            Some(id) => self.sessions.delimiter(&id).await,
            None => crate::core::buffer::DEFAULT_DELIMITER,
        }
    }

    pub async fn clear_buffer(&self, device_id: Option<&str>) {
        if let Some(id) = self.sessions.resolve_id(device_id).await {
            self.sessions.clear(&id).await;
        }
    }

    pub async fn buffered_byte_count(&self, device_id: Option<&str>) -> usize {
        match self.sessions.resolve_id(device_id).await {
            Some(id) => self.sessions.buffered_len(&id).await,
            None => 0,
        }
    }

    // Transport callbacks

    /// Apply one transport callback
    pub async fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connected(device) => self.on_connected(device).await,
            TransportEvent::ConnectFailed { device, reason } => {
                self.on_connect_failed(device, reason).await
            }
            TransportEvent::ConnectionLost { device, reason } => {
                self.on_link_lost(device, reason).await
            }
            TransportEvent::DataReceived { device_id, data } => {
                self.on_data(&device_id, &data).await
            }
            TransportEvent::DeviceFound(device) => self.on_device_found(device).await,
            TransportEvent::DiscoveryFinished => self.on_discovery_finished().await,
            TransportEvent::BondStateChanged { device, bonded } => {
                let id = device.id.clone();
                if !self.bonding.resolve(&id, (device, bonded)).await {
                    debug!("Unsolicited bond state change for '{}'", id);
                }
            }
            TransportEvent::AdapterStateChanged { enabled } => {
                info!("Adapter {}", if enabled { "enabled" } else { "disabled" });
                self.events.publish(if enabled {
                    SessionEvent::AdapterEnabled
                } else {
                    SessionEvent::AdapterDisabled
                });
            }
        }
    }

    async fn on_connected(&self, device: DeviceDescriptor) {
        let id = device.id.clone();
        if !self.sessions.mark_connected(device.clone()).await {
            warn!("Connected callback for '{}' could not update its session", id);
        }

        // Observers hear about the link before the caller is released
        info!("Connected to {}", device);
        self.events.publish(SessionEvent::ConnectionSucceeded {
            message: format!("Connected to {}", device.display_name()),
            device: device.clone(),
        });
        self.connects.resolve(&ConnectKey::Device(id), device).await;
    }

    async fn on_connect_failed(&self, device: DeviceDescriptor, reason: String) {
        let id = device.id.clone();
        self.sessions.mark_failed(&id).await;

        warn!("Connection to '{}' failed: {}", id, reason);
        self.events.publish(SessionEvent::ConnectionFailed {
            device,
            message: reason.clone(),
        });
        self.connects
            .fail(&ConnectKey::Device(id.clone()), BtSerialError::connect_failed(&id, reason))
            .await;
    }

    async fn on_link_lost(&self, device: DeviceDescriptor, reason: String) {
        let id = device.id.clone();
        match self.sessions.state(&id).await {
            Some(SessionState::Connected) => {
                self.sessions.mark_lost(&id).await;
            }
            Some(SessionState::Connecting) => {
                self.sessions.mark_failed(&id).await;
            }
            state => {
                debug!("Ignoring link loss for '{}' in state {:?}", id, state);
                return;
            }
        }

        self.connects
            .fail(
                &ConnectKey::Device(id.clone()),
                BtSerialError::LinkLost {
                    device_id: id.clone(),
                    reason: reason.clone(),
                },
            )
            .await;

        warn!("Link to '{}' lost: {}", id, reason);
        self.events.publish(SessionEvent::ConnectionLost {
            device,
            message: reason,
        });
    }

    async fn on_data(&self, device_id: &str, data: &[u8]) {
        match self.sessions.append(device_id, data).await {
            None => debug!(
                "Discarding {} bytes for '{}' without a connected session",
                data.len(),
                device_id
            ),
            Some(frame_complete) => {
                debug!("Buffered {} bytes for '{}'", data.len(), device_id);
                if frame_complete && self.config.emit_frame_events {
                    self.events.publish(SessionEvent::FrameAvailable {
                        device_id: device_id.to_string(),
                        buffered: self.sessions.buffered_len(device_id).await,
                    });
                }
            }
        }
    }

    async fn on_device_found(&self, device: DeviceDescriptor) {
        {
            let mut discovered = self.discovered.lock().await;
            if !discovered.iter().any(|d| d.id == device.id) {
                discovered.push(device.clone());
            }
        }
        debug!("Discovered {}", device);
        self.events.publish(SessionEvent::DeviceFound { device: device.clone() });

        let key = ConnectKey::Device(device.id.clone());
        if !self.connects.rekey(&ConnectKey::FirstAvailable, key.clone()).await {
            return;
        }

        const TAG: &str = "SessionManager.connect_first_available";
        info!("Connecting to first available device {}", device);
        if let Err(e) = self.transport.cancel_discovery().await {
            debug!("Could not stop discovery: {}", e);
        }
        if let Err(e) = self.ensure_capacity(&device.id).await {
            self.connects.fail(&key, e).await;
            return;
        }

        self.sessions.begin_connect(device.clone()).await;
        if let Err(e) = self.transport.connect(&device.id).await {
            let reason = e.to_string();
            self.report_error(e, TAG, Some(&device.id));
            self.sessions.mark_failed(&device.id).await;
            self.connects
                .fail(&key, BtSerialError::connect_failed(&device.id, reason))
                .await;
        }
    }

    async fn on_discovery_finished(&self) {
        let found = std::mem::take(&mut *self.discovered.lock().await);
        let count = found.len();
        info!("Discovery finished, {} devices found", count);

        self.events.publish(SessionEvent::DiscoveryFinished { found: count });

        self.discovery.resolve(&DISCOVERY_KEY, found).await;
        let key = ConnectKey::FirstAvailable;
        let err = BtSerialError::connect_failed(&key.to_string(), "discovery found no devices");
        self.connects.fail(&key, err).await;
    }

    // Helpers

    fn ensure_available(&self, tag: &str, device_id: Option<&str>) -> BtSerialResult<()> {
        if self.transport.is_available() {
            Ok(())
        } else {
            Err(self.report_error(BtSerialError::TransportUnavailable, tag, device_id))
        }
    }

    async fn ensure_capacity(&self, device_id: &str) -> BtSerialResult<()> {
        if self.sessions.contains(device_id).await {
            return Ok(());
        }
        let count = self.sessions.len().await;
        if count >= self.config.max_sessions {
            return Err(BtSerialError::operation_failed(format!(
                "Maximum number of sessions ({}) reached",
                self.config.max_sessions
            )));
        }
        Ok(())
    }

    async fn require_id(&self, device_id: Option<&str>) -> BtSerialResult<String> {
        self.sessions
            .resolve_id(device_id)
            .await
            .ok_or_else(|| BtSerialError::device_not_found(device_id.unwrap_or("<none>")))
    }

    /// Log a failure and publish it on the error channel, handing it back
    fn report_error(
        &self,
        err: BtSerialError,
        tag: &str,
        device_id: Option<&str>,
    ) -> BtSerialError {
        error!("{}: {}", tag, err);
        self.events
            .publish(SessionEvent::error(err.to_string(), tag, device_id));
        err
    }
}
