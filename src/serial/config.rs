use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{Result, SerialError};

pub const BAUD_RATE: u32 = 9600;
/// Write and read timeout applied to every blocking call
pub const IO_TIMEOUT_MS: u64 = 800;
/// Maximum framed command length, terminator included
pub const MAX_COMMAND_LEN: usize = 256;
pub const COMMAND_TERMINATOR: &str = "\r\n";
/// Wait after opening a port before the first command
pub const CONNECT_SETTLE_MS: u64 = 50;

/// Transport settings that may differ between hosts.
///
/// Line parameters and timeouts are fixed by the device and are not part of
/// this struct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Reply buffer size for `send_raw`; at most `response_len - 1` bytes are read
    pub response_len: usize,
    /// Extra wait between writing a query and reading its reply
    pub pre_read_delay_ms: Option<u64>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            response_len: 512,
            // The Windows USB-serial driver stack hands back nothing for
            // slower queries (FREQ?, TEMP?) unless the device is given time first.
            pre_read_delay_ms: if cfg!(windows) { Some(100) } else { None },
        }
    }
}

impl TransportConfig {
    /// Load settings from a JSON file; missing keys take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| SerialError::Config(format!("{}: {}", path.display(), e)))?;
        let config: TransportConfig = serde_json::from_str(&text)
            .map_err(|e| SerialError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        log::debug!("Loaded transport config from {}: {:?}", path.display(), config);
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.response_len < 2 {
            return Err(SerialError::Config(format!(
                "response_len must be at least 2, got {}",
                self.response_len
            )));
        }
        Ok(())
    }

    pub fn pre_read_delay(&self) -> Option<Duration> {
        self.pre_read_delay_ms.map(Duration::from_millis)
    }
}
