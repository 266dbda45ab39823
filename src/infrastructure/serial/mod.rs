// Serial module - Serial port transport
pub mod client;
pub mod transport;

pub use client::{LinkSettings, SerialLink};
pub use transport::SerialTransport;
