use crate::core::buffer::FrameBuffer;
use crate::core::transport::DeviceDescriptor;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};
use tracing::warn;

/// Lifecycle of one device session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Not linked; buffered data is kept until reconnect or reset
    Disconnected,
    /// A connect has been issued and no outcome has arrived yet
    Connecting,
    /// Link is up
    Connected,
    /// The transport reported that the link dropped
    Lost,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Disconnected | Lost | Connecting, Connecting)
                | (Connecting | Connected, Connected)
                | (_, Disconnected)
                | (Connected, Lost)
        )
    }

    pub fn is_connected(self) -> bool {
        self == SessionState::Connected
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "Disconnected"),
            SessionState::Connecting => write!(f, "Connecting"),
            SessionState::Connected => write!(f, "Connected"),
            SessionState::Lost => write!(f, "Lost"),
        }
    }
}

/// Traffic counters for a session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionStatistics {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub bytes_discarded: u64,
    pub frames_read: u64,
    pub connect_count: u64,
}

/// Live record of one remote endpoint
#[derive(Debug)]
pub struct DeviceSession {
    descriptor: DeviceDescriptor,
    state: SessionState,
    // Created on the first successful connection, never before
    frames: Option<FrameBuffer>,
    created_at: SystemTime,
    last_activity: SystemTime,
    connected_since: Option<SystemTime>,
    statistics: SessionStatistics,
}

impl DeviceSession {
    /// A session whose first connect attempt is in flight
    pub fn connecting(descriptor: DeviceDescriptor) -> Self {
        let now = SystemTime::now();
        Self {
            descriptor,
            state: SessionState::Connecting,
            frames: None,
            created_at: now,
            last_activity: now,
            connected_since: None,
            statistics: SessionStatistics::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn statistics(&self) -> &SessionStatistics {
        &self.statistics
    }

    /// Move to `next`, refusing transitions the lifecycle does not allow
    pub fn transition(&mut self, next: SessionState) -> bool {
        if !self.state.can_transition_to(next) {
            warn!(
                "Refusing session transition {} -> {} for '{}'",
                self.state,
                next,
                self.descriptor.id
            );
            return false;
        }
        self.state = next;
        self.last_activity = SystemTime::now();
        true
    }

    /// Record a successful connection, refreshing the descriptor and
    /// creating the frame buffer if this is the first one
    pub fn mark_connected(&mut self, descriptor: DeviceDescriptor) -> bool {
        if !self.transition(SessionState::Connected) {
            return false;
        }
        if descriptor.name.is_some() || self.descriptor.name.is_none() {
            self.descriptor = descriptor;
        }
        self.frames.get_or_insert_with(FrameBuffer::new);
        self.connected_since = Some(SystemTime::now());
        self.statistics.connect_count += 1;
        true
    }

    pub fn has_frames(&self) -> bool {
        self.frames.is_some()
    }

    pub fn frames(&self) -> Option<&FrameBuffer> {
        self.frames.as_ref()
    }

    pub fn frames_mut(&mut self) -> Option<&mut FrameBuffer> {
        self.last_activity = SystemTime::now();
        self.frames.as_mut()
    }

    /// Buffer inbound bytes. Returns `None` when the session has no buffer
    /// yet and the chunk was dropped, otherwise whether a frame completed.
    pub fn receive(&mut self, chunk: &[u8]) -> Option<bool> {
        match self.frames.as_mut() {
            Some(frames) => {
                self.statistics.bytes_received += chunk.len() as u64;
                self.last_activity = SystemTime::now();
                Some(frames.append(chunk))
            }
            None => {
                self.statistics.bytes_discarded += chunk.len() as u64;
                None
            }
        }
    }

    pub fn record_sent(&mut self, len: usize) {
        self.statistics.bytes_sent += len as u64;
        self.last_activity = SystemTime::now();
    }

    pub fn record_frame_read(&mut self) {
        self.statistics.frames_read += 1;
    }

    pub fn uptime(&self) -> Duration {
        match (self.state, self.connected_since) {
            (SessionState::Connected, Some(since)) => since.elapsed().unwrap_or_default(),
            _ => Duration::ZERO,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            device: self.descriptor.clone(),
            state: self.state,
            delimiter: self.frames.as_ref().map(FrameBuffer::delimiter),
            buffered_bytes: self.frames.as_ref().map_or(0, FrameBuffer::len),
            created_at: self.created_at,
            last_activity: self.last_activity,
            uptime: self.uptime(),
            statistics: self.statistics.clone(),
        }
    }
}

/// Point-in-time summary of a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub device: DeviceDescriptor,
    pub state: SessionState,
    pub delimiter: Option<u8>,
    pub buffered_bytes: usize,
    pub created_at: SystemTime,
    pub last_activity: SystemTime,
    pub uptime: Duration,
    pub statistics: SessionStatistics,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        use SessionState::*;
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Lost));
        assert!(Connected.can_transition_to(Disconnected));
        assert!(Lost.can_transition_to(Connecting));

        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Disconnected.can_transition_to(Lost));
        assert!(!Connecting.can_transition_to(Lost));
        assert!(!Lost.can_transition_to(Connected));
    }

    #[test]
    fn test_frames_created_on_first_connection() {
        let mut session = DeviceSession::connecting(DeviceDescriptor::new("AA:BB"));
        assert!(!session.has_frames());
        assert_eq!(session.receive(b"early"), None);
        assert_eq!(session.statistics().bytes_discarded, 5);

        assert!(session.mark_connected(DeviceDescriptor::new("AA:BB").with_name("HC-05")));
        assert!(session.has_frames());
        assert_eq!(session.descriptor().name.as_deref(), Some("HC-05"));
        assert_eq!(session.receive(b"ok\0"), Some(true));
        assert_eq!(session.snapshot().buffered_bytes, 3);
    }

    #[test]
    fn test_buffer_survives_disconnect() {
        let mut session = DeviceSession::connecting(DeviceDescriptor::new("AA:BB"));
        session.mark_connected(DeviceDescriptor::new("AA:BB"));
        session.receive(b"kept");

        assert!(session.transition(SessionState::Disconnected));
        assert_eq!(session.frames().map(FrameBuffer::len), Some(4));
        assert_eq!(session.uptime(), Duration::ZERO);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::Connected.to_string(), "Connected");
        assert_eq!(SessionState::Lost.to_string(), "Lost");
    }
}
