//! btserial library
//!
//! Session management for Bluetooth serial devices: one session per remote
//! device, delimiter-based framing of inbound bytes, request/response
//! correlation for connects and scans, and an observable event channel.

pub mod cli;
pub mod core;
pub mod domain;
pub mod infrastructure;

pub use crate::core::events::{EventDispatcher, SessionEvent};
pub use crate::core::session::{SessionManager, SessionState};
pub use crate::core::transport::{DeviceDescriptor, Transport, TransportEvent};
pub use domain::config::BtSerialConfig;
pub use domain::error::{BtSerialError, BtSerialResult};
