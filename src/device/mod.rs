pub mod manager;
pub mod models;
pub mod monitor;

pub use manager::DeviceManager;
pub use models::*;
pub use monitor::StatusMonitor;


#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Device already connected")]
    AlreadyConnected,

    #[error("Device not connected")]
    NotConnected,

    #[error("Serial communication error: {0}")]
    SerialError(#[from] crate::serial::SerialError),

    #[error("Worker task failed: {0}")]
    Worker(String),
}

pub type Result<T> = std::result::Result<T, DeviceError>;
