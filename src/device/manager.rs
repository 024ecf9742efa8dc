use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::serial::{
    self, Clock, Connection, PortInfo, PortOpener, StatusReport, SystemClock, SystemOpener,
    TransportConfig,
};
use super::{ConnectionState, DeviceError, Result};

/// Owns the single live connection for async callers.
///
/// Every serial exchange blocks, so each call is moved onto tokio's blocking
/// pool while the connection mutex is held. That mutex is what keeps callers
/// to one command in flight.
pub struct DeviceManager {
    connection: Arc<Mutex<Option<Connection>>>,
    state: Arc<RwLock<ConnectionState>>,
    opener: Arc<dyn PortOpener>,
    config: TransportConfig,
    clock: Arc<dyn Clock>,
}

impl DeviceManager {
    pub fn new() -> Self {
        Self::with_opener(
            Arc::new(SystemOpener),
            TransportConfig::default(),
            Arc::new(SystemClock),
        )
    }

    pub fn with_opener(
        opener: Arc<dyn PortOpener>,
        config: TransportConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            connection: Arc::new(Mutex::new(None)),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            opener,
            config,
            clock,
        }
    }

    /// Enumerate serial ports without blocking the runtime
    pub async fn list_ports() -> Result<Vec<PortInfo>> {
        run_blocking(|| serial::list_ports().map_err(DeviceError::from)).await
    }

    /// Connect to a port
    pub async fn connect(&self, port_name: &str) -> Result<()> {
        let mut guard = Arc::clone(&self.connection).lock_owned().await;
        if matches!(&*guard, Some(c) if c.is_connected()) {
            return Err(DeviceError::AlreadyConnected);
        }

        self.set_state(ConnectionState::Connecting).await;

        let opener = Arc::clone(&self.opener);
        let config = self.config.clone();
        let clock = Arc::clone(&self.clock);
        let name = port_name.to_string();
        let result = run_blocking(move || {
            Connection::connect_with(opener.as_ref(), &name, config, clock).map_err(DeviceError::from)
        })
        .await;

        match result {
            Ok(connection) => {
                *guard = Some(connection);
                self.set_state(ConnectionState::Connected {
                    port_name: port_name.to_string(),
                })
                .await;
                log::info!("Device manager connected to {}", port_name);
                Ok(())
            }
            Err(e) => {
                log::error!("Connection to {} failed: {}", port_name, e);
                self.set_state(ConnectionState::Error(e.to_string())).await;
                Err(e)
            }
        }
    }

    /// Close the connection, if any
    pub async fn disconnect(&self) -> Result<()> {
        let mut guard = self.connection.lock().await;
        if let Some(mut connection) = guard.take() {
            connection.disconnect();
        }
        self.set_state(ConnectionState::Disconnected).await;
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        self.state.read().await.is_connected()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.state.read().await.clone()
    }

    /// Run `f` against the live connection on the blocking pool
    pub async fn with_connection<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> serial::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let mut guard = Arc::clone(&self.connection).lock_owned().await;
        run_blocking(move || {
            let connection = (*guard)
                .as_mut()
                .filter(|c| c.is_connected())
                .ok_or(DeviceError::NotConnected)?;
            f(connection).map_err(DeviceError::from)
        })
        .await
    }

    pub async fn status_report(&self) -> Result<StatusReport> {
        self.with_connection(|connection| Ok(connection.status_report()))
            .await
    }

    pub async fn send_raw(&self, command: &str) -> Result<Option<String>> {
        let command = command.to_string();
        self.with_connection(move |connection| connection.send_raw(&command))
            .await
    }

    pub async fn set_frequency_and_wait(&self, freq_ghz: f64, timeout_ms: u64) -> Result<()> {
        self.with_connection(move |connection| connection.set_frequency_and_wait(freq_ghz, timeout_ms))
            .await
    }

    async fn set_state(&self, state: ConnectionState) {
        *self.state.write().await = state;
    }
}

impl Default for DeviceManager {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DeviceError::Worker(e.to_string()))?
}
