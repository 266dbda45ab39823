// Core module - Framing, correlation, events and session management
pub mod buffer;
pub mod events;
pub mod pending;
pub mod session;
pub mod transport;

pub use buffer::{parse_delimiter, FrameBuffer, DEFAULT_DELIMITER};
pub use events::{EventDispatcher, EventStream, SessionEvent, Subscription};
pub use pending::{Completion, ConnectKey, OperationId, PendingRegistry};
pub use session::{SessionManager, SessionSnapshot, SessionState};
pub use transport::{transport_channel, DeviceDescriptor, Transport, TransportEvent};
