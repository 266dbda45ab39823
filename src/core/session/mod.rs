// Session module - Per-device sessions and the manager that drives them
pub mod manager;
pub mod registry;
pub mod state;

pub use manager::{ConnectCompletion, SessionManager};
pub use registry::ConnectionRegistry;
pub use state::{DeviceSession, SessionSnapshot, SessionState, SessionStatistics};
