pub mod clock;
pub mod config;
pub mod interface;
pub mod mock;
pub mod protocol;
pub mod retry;

pub use clock::{Clock, SystemClock};
pub use config::TransportConfig;
pub use interface::{list_ports, Connection, PortOpener, SerialPortIO, SystemOpener};
pub use protocol::{Identity, StatusReport};
pub use retry::{retry, Attempt, RetryPolicy};

use serde::{Deserialize, Serialize};

/// A serial port the OS reports as present
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    pub name: String,
    pub description: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("Failed to enumerate serial ports: {0}")]
    Enumeration(#[source] serialport::Error),

    #[error("Connection to {port} failed: {reason}")]
    Connect { port: String, reason: String },

    #[error("Device not connected")]
    NotConnected,

    #[error("Write failed: {0}")]
    Write(String),

    #[error("Read failed: {0}")]
    Read(String),

    #[error("Unexpected reply to {command}: {reply:?}")]
    Parse { command: &'static str, reply: String },

    #[error("Timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, SerialError>;
