//! Lifecycle and data notifications for observers of the session manager.
//!
//! [`EventDispatcher`] offers three ways to observe events:
//!
//! - **Streams**: [`EventDispatcher::subscribe`] returns an [`EventStream`]
//!   backed by a broadcast channel.
//! - **Handlers**: [`EventDispatcher::on`] registers a callback that runs on
//!   the publishing task and must return quickly. A handler that errors or
//!   panics is logged and reported as an [`SessionEvent::Error`]; it never
//!   aborts the publish.
//! - **Waiters**: [`EventDispatcher::register_waiter`] captures the first
//!   matching event and then unregisters itself.
//!
//! Publishing never blocks and never queues events for subscribers that do
//! not exist yet.

use crate::core::transport::DeviceDescriptor;
use crate::domain::error::{BtSerialError, BtSerialResult};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

pub const CONNECTION_SUCCEEDED: &str = "connection-succeeded";
pub const CONNECTION_FAILED: &str = "connection-failed";
pub const CONNECTION_LOST: &str = "connection-lost";
pub const DEVICE_FOUND: &str = "device-found";
pub const DISCOVERY_FINISHED: &str = "discovery-finished";
pub const FRAME_AVAILABLE: &str = "frame-available";
pub const ADAPTER_ENABLED: &str = "adapter-enabled";
pub const ADAPTER_DISABLED: &str = "adapter-disabled";
pub const ERROR: &str = "error";

/// Notification raised by the session manager
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum SessionEvent {
    ConnectionSucceeded {
        device: DeviceDescriptor,
        message: String,
    },
    ConnectionFailed {
        device: DeviceDescriptor,
        message: String,
    },
    ConnectionLost {
        device: DeviceDescriptor,
        message: String,
    },
    DeviceFound {
        device: DeviceDescriptor,
    },
    DiscoveryFinished {
        found: usize,
    },
    /// A delimiter arrived, so at least one complete frame can be read
    FrameAvailable {
        device_id: String,
        buffered: usize,
    },
    AdapterEnabled,
    AdapterDisabled,
    /// A failure caught while handling a command or a transport callback
    Error {
        message: String,
        tag: String,
        device_id: Option<String>,
    },
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::ConnectionSucceeded { .. } => CONNECTION_SUCCEEDED,
            SessionEvent::ConnectionFailed { .. } => CONNECTION_FAILED,
            SessionEvent::ConnectionLost { .. } => CONNECTION_LOST,
            SessionEvent::DeviceFound { .. } => DEVICE_FOUND,
            SessionEvent::DiscoveryFinished { .. } => DISCOVERY_FINISHED,
            SessionEvent::FrameAvailable { .. } => FRAME_AVAILABLE,
            SessionEvent::AdapterEnabled => ADAPTER_ENABLED,
            SessionEvent::AdapterDisabled => ADAPTER_DISABLED,
            SessionEvent::Error { .. } => ERROR,
        }
    }

    pub fn device_id(&self) -> Option<&str> {
        match self {
            SessionEvent::ConnectionSucceeded { device, .. }
            | SessionEvent::ConnectionFailed { device, .. }
            | SessionEvent::ConnectionLost { device, .. }
            | SessionEvent::DeviceFound { device } => Some(device.id.as_str()),
            SessionEvent::FrameAvailable { device_id, .. } => Some(device_id.as_str()),
            SessionEvent::Error { device_id, .. } => device_id.as_deref(),
            _ => None,
        }
    }

    pub fn error(
        message: impl Into<String>,
        tag: impl Into<String>,
        device_id: Option<&str>,
    ) -> Self {
        SessionEvent::Error {
            message: message.into(),
            tag: tag.into(),
            device_id: device_id.map(str::to_string),
        }
    }

    pub fn to_json(&self) -> BtSerialResult<String> {
        serde_json::to_string(self).map_err(|e| BtSerialError::Output(e.to_string()))
    }
}

pub type EventHandler = Arc<dyn Fn(&SessionEvent) -> anyhow::Result<()> + Send + Sync>;

type HandlerTable = Mutex<HashMap<Uuid, (Option<&'static str>, EventHandler)>>;

struct WaiterEntry {
    predicate: Box<dyn Fn(&SessionEvent) -> bool + Send + Sync>,
    complete_tx: oneshot::Sender<SessionEvent>,
}

/// Fan-out of [`SessionEvent`]s to streams, handlers and one-shot waiters
pub struct EventDispatcher {
    tx: broadcast::Sender<SessionEvent>,
    handlers: Arc<HandlerTable>,
    waiters: Mutex<Vec<WaiterEntry>>,
}

impl EventDispatcher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            handlers: Arc::new(Mutex::new(HashMap::new())),
            waiters: Mutex::new(Vec::new()),
        }
    }

    /// Deliver `event` to everyone currently listening
    pub fn publish(&self, event: SessionEvent) {
        debug!(event = event.name(), device = ?event.device_id(), "publishing event");

        {
            let mut waiters = self.waiters.lock();
            let mut i = 0;
            while i < waiters.len() {
                if (waiters[i].predicate)(&event) {
                    let entry = waiters.swap_remove(i);
                    let _ = entry.complete_tx.send(event.clone());
                } else {
                    i += 1;
                }
            }
        }

        // No receivers is not a failure
        let _ = self.tx.send(event.clone());

        let handlers: Vec<(Uuid, EventHandler)> = self
            .handlers
            .lock()
            .iter()
            .filter(|(_, (filter, _))| filter.map_or(true, |name| name == event.name()))
            .map(|(id, (_, handler))| (*id, Arc::clone(handler)))
            .collect();

        let mut failures = Vec::new();
        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => failures.push((id, e.to_string())),
                Err(_) => failures.push((id, "handler panicked".to_string())),
            }
        }

        for (id, message) in failures {
            warn!(
                "Subscriber {} failed while handling '{}': {}",
                id,
                event.name(),
                message
            );
            // Failures while delivering an error event are only logged
            if !matches!(event, SessionEvent::Error { .. }) {
                self.publish(SessionEvent::error(
                    format!("subscriber failed on '{}': {}", event.name(), message),
                    "EventDispatcher.publish",
                    event.device_id(),
                ));
            }
        }
    }

    /// Subscribe to all future events as a stream
    pub fn subscribe(&self) -> EventStream {
        EventStream::new(self.tx.subscribe())
    }

    /// Register a handler for every event
    pub fn on<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&SessionEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.insert_handler(None, Arc::new(handler))
    }

    /// Register a handler for events named `name` only
    pub fn on_event<F>(&self, name: &'static str, handler: F) -> Subscription
    where
        F: Fn(&SessionEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.insert_handler(Some(name), Arc::new(handler))
    }

    fn insert_handler(&self, filter: Option<&'static str>, handler: EventHandler) -> Subscription {
        let id = Uuid::new_v4();
        self.handlers.lock().insert(id, (filter, handler));
        Subscription {
            id,
            handlers: Arc::downgrade(&self.handlers),
        }
    }

    /// Capture the first event matching `predicate`
    pub fn register_waiter<F>(&self, predicate: F) -> oneshot::Receiver<SessionEvent>
    where
        F: Fn(&SessionEvent) -> bool + Send + Sync + 'static,
    {
        let (complete_tx, complete_rx) = oneshot::channel();
        self.waiters.lock().push(WaiterEntry {
            predicate: Box::new(predicate),
            complete_tx,
        });
        complete_rx
    }

    /// Wait up to `timeout` for an event matching `predicate`
    pub async fn wait_for<F>(&self, predicate: F, timeout: Duration) -> BtSerialResult<SessionEvent>
    where
        F: Fn(&SessionEvent) -> bool + Send + Sync + 'static,
    {
        let rx = self.register_waiter(predicate);
        let outcome = tokio::time::timeout(timeout, rx).await;
        match outcome {
            Ok(Ok(event)) => Ok(event),
            Ok(Err(_)) => Err(BtSerialError::operation_failed("event dispatcher dropped")),
            Err(_) => {
                self.prune_waiters();
                Err(BtSerialError::operation_failed(format!(
                    "no matching event within {:?}",
                    timeout
                )))
            }
        }
    }

    /// Number of live streams and handlers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count() + self.handlers.lock().len()
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().len()
    }

    fn prune_waiters(&self) {
        self.waiters.lock().retain(|w| !w.complete_tx.is_closed());
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(256)
    }
}

/// RAII handle for a handler registered with [`EventDispatcher::on`].
///
/// Dropping it unregisters the handler.
pub struct Subscription {
    id: Uuid,
    handlers: Weak<HandlerTable>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(handlers) = self.handlers.upgrade() {
            handlers.lock().remove(&self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// Broadcast receiver that logs and skips over lag instead of failing
pub struct EventStream {
    rx: broadcast::Receiver<SessionEvent>,
}

impl EventStream {
    fn new(rx: broadcast::Receiver<SessionEvent>) -> Self {
        Self { rx }
    }

    /// Next event, or `None` once the dispatcher is gone
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(dropped = n, "Event stream lagged, dropped events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next event if one is already queued
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(n)) => {
                    warn!(dropped = n, "Event stream lagged, dropped events");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }
}
