use crate::core::buffer::DEFAULT_DELIMITER;
use crate::core::session::state::{DeviceSession, SessionSnapshot, SessionState};
use crate::core::transport::DeviceDescriptor;
use crate::domain::error::{BtSerialError, BtSerialResult};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

/// Authoritative set of device sessions.
///
/// The map lock is only held long enough to find or insert an entry; every
/// session then has its own lock, so traffic for one device never waits on
/// another. Sessions are ordered by id so "the first session" is stable.
pub struct ConnectionRegistry {
    sessions: RwLock<BTreeMap<String, Arc<Mutex<DeviceSession>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(BTreeMap::new()),
        }
    }

    async fn entry(&self, id: &str) -> Option<Arc<Mutex<DeviceSession>>> {
        self.sessions.read().await.get(id).cloned()
    }

    async fn with_session<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut DeviceSession) -> R,
    ) -> Option<R> {
        let entry = self.entry(id).await?;
        let mut session = entry.lock().await;
        Some(f(&mut session))
    }

    /// Track a connect attempt, creating the session on first use.
    ///
    /// A session that is already connected stays connected while the new
    /// attempt is in flight.
    pub async fn begin_connect(&self, descriptor: DeviceDescriptor) -> SessionState {
        let mut sessions = self.sessions.write().await;
        match sessions.get(&descriptor.id) {
            Some(entry) => {
                let mut session = entry.lock().await;
                if !session.state().is_connected() {
                    session.transition(SessionState::Connecting);
                }
                session.state()
            }
            None => {
                debug!("Tracking new session for '{}'", descriptor.id);
                let id = descriptor.id.clone();
                sessions.insert(id, Arc::new(Mutex::new(DeviceSession::connecting(descriptor))));
                SessionState::Connecting
            }
        }
    }

    /// Record a successful connection. Unknown ids are added, since a
    /// transport may report links it was not asked for.
    pub async fn mark_connected(&self, descriptor: DeviceDescriptor) -> bool {
        let entry = {
            let mut sessions = self.sessions.write().await;
            Arc::clone(
                sessions
                    .entry(descriptor.id.clone())
                    .or_insert_with(|| {
                        Arc::new(Mutex::new(DeviceSession::connecting(descriptor.clone())))
                    }),
            )
        };
        let mut session = entry.lock().await;
        if matches!(session.state(), SessionState::Disconnected | SessionState::Lost) {
            // Link reported without a connect in flight
            session.transition(SessionState::Connecting);
        }
        session.mark_connected(descriptor)
    }

    /// Record a failed attempt. A session that never connected is removed;
    /// one with history goes back to `Disconnected` and keeps its buffer.
    pub async fn mark_failed(&self, id: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        let remove = match sessions.get(id) {
            Some(entry) => {
                let mut session = entry.lock().await;
                if session.has_frames() {
                    if !session.state().is_connected() {
                        session.transition(SessionState::Disconnected);
                    }
                    false
                } else {
                    true
                }
            }
            None => return false,
        };
        if remove {
            sessions.remove(id);
            debug!("Dropped session '{}' after failed first connect", id);
        }
        true
    }

    /// Record link loss. Returns the state the session was in.
    pub async fn mark_lost(&self, id: &str) -> Option<SessionState> {
        self.with_session(id, |session| {
            let previous = session.state();
            session.transition(SessionState::Lost);
            previous
        })
        .await
    }

    pub async fn mark_disconnected(&self, id: &str) -> Option<SessionState> {
        self.with_session(id, |session| {
            let previous = session.state();
            session.transition(SessionState::Disconnected);
            previous
        })
        .await
    }

    pub async fn mark_all_disconnected(&self) -> Vec<String> {
        let entries: Vec<Arc<Mutex<DeviceSession>>> =
            self.sessions.read().await.values().cloned().collect();
        let mut ids = Vec::new();
        for entry in entries {
            let mut session = entry.lock().await;
            if session.state() != SessionState::Disconnected {
                session.transition(SessionState::Disconnected);
                ids.push(session.id().to_string());
            }
        }
        ids
    }

    pub async fn state(&self, id: &str) -> Option<SessionState> {
        self.with_session(id, |session| session.state()).await
    }

    pub async fn descriptor(&self, id: &str) -> Option<DeviceDescriptor> {
        self.with_session(id, |session| session.descriptor().clone()).await
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.sessions.read().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn connected_ids(&self) -> Vec<String> {
        let entries: Vec<Arc<Mutex<DeviceSession>>> =
            self.sessions.read().await.values().cloned().collect();
        let mut ids = Vec::new();
        for entry in entries {
            let session = entry.lock().await;
            if session.state().is_connected() {
                ids.push(session.id().to_string());
            }
        }
        ids
    }

    /// Session used when a caller does not name one: the lowest connected
    /// id, otherwise the lowest known id
    pub async fn primary_id(&self) -> Option<String> {
        if let Some(id) = self.connected_ids().await.into_iter().next() {
            return Some(id);
        }
        self.sessions.read().await.keys().next().cloned()
    }

    pub async fn resolve_id(&self, id: Option<&str>) -> Option<String> {
        match id {
            Some(id) => Some(id.to_string()),
            None => self.primary_id().await,
        }
    }

    pub async fn snapshot(&self, id: &str) -> Option<SessionSnapshot> {
        self.with_session(id, |session| session.snapshot()).await
    }

    pub async fn snapshots(&self) -> Vec<SessionSnapshot> {
        let entries: Vec<Arc<Mutex<DeviceSession>>> =
            self.sessions.read().await.values().cloned().collect();
        let mut snapshots = Vec::with_capacity(entries.len());
        for entry in entries {
            snapshots.push(entry.lock().await.snapshot());
        }
        snapshots
    }

    /// Forget every session, buffers included
    pub async fn reset(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let count = sessions.len();
        sessions.clear();
        count
    }

    // Inbound byte store

    /// Buffer a chunk for `id`. `None` means the chunk was dropped because
    /// the session has no buffer; `Some(true)` means a frame completed.
    pub async fn append(&self, id: &str, chunk: &[u8]) -> Option<bool> {
        self.with_session(id, |session| session.receive(chunk)).await.flatten()
    }

    pub async fn drain_all(&self, id: &str) -> Vec<u8> {
        self.with_session(id, |session| session.frames_mut().map(|f| f.drain_all()))
            .await
            .flatten()
            .unwrap_or_default()
    }

    pub async fn clear(&self, id: &str) -> bool {
        self.with_session(id, |session| match session.frames_mut() {
            Some(frames) => {
                frames.clear();
                true
            }
            None => false,
        })
        .await
        .unwrap_or(false)
    }

    pub async fn buffered_len(&self, id: &str) -> usize {
        self.with_session(id, |session| session.frames().map_or(0, |f| f.len()))
            .await
            .unwrap_or(0)
    }

    pub async fn extract_frame(&self, id: &str) -> Vec<u8> {
        self.with_session(id, |session| {
            let frame = session
                .frames_mut()
                .map(|f| f.extract_frame())
                .unwrap_or_default();
            if !frame.is_empty() {
                session.record_frame_read();
            }
            frame
        })
        .await
        .unwrap_or_default()
    }

    pub async fn record_sent(&self, id: &str, len: usize) {
        self.with_session(id, |session| session.record_sent(len)).await;
    }

    // Delimiter table

    pub async fn set_delimiter(&self, id: &str, delimiter: u8) -> BtSerialResult<()> {
        let updated = self
            .with_session(id, |session| match session.frames_mut() {
                Some(frames) => {
                    frames.set_delimiter(delimiter);
                    true
                }
                None => false,
            })
            .await
            .unwrap_or(false);

        if updated {
            debug!("Delimiter for '{}' set to 0x{:02X}", id, delimiter);
            Ok(())
        } else {
            Err(BtSerialError::device_not_found(id))
        }
    }

    pub async fn delimiter(&self, id: &str) -> u8 {
        self.with_session(id, |session| session.frames().map(|f| f.delimiter()))
            .await
            .flatten()
            .unwrap_or(DEFAULT_DELIMITER)
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
