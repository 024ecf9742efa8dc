use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serialport::{
    ClearBuffer, DataBits, FlowControl, Parity, SerialPort, SerialPortInfo, SerialPortType,
    StopBits,
};

use super::clock::{Clock, SystemClock};
use super::config::{
    TransportConfig, BAUD_RATE, COMMAND_TERMINATOR, CONNECT_SETTLE_MS, IO_TIMEOUT_MS,
    MAX_COMMAND_LEN,
};
use super::{PortInfo, Result, SerialError};

/// Byte-level operations the transport needs from an open port.
///
/// Implemented for real serial ports by [`SystemOpener`] and by the test
/// doubles in [`crate::serial::mock`].
pub trait SerialPortIO: Send {
    /// Drive DTR and RTS high; the converter keeps its UART disabled otherwise
    fn assert_control_lines(&mut self) -> io::Result<()>;

    /// Discard everything in the input and output buffers
    fn clear_buffers(&mut self) -> io::Result<()>;

    /// Blocking write; returns how many bytes went out before `timeout`
    fn write_timeout(&mut self, data: &[u8], timeout: Duration) -> io::Result<usize>;

    /// Blocking read of whatever arrives first; `Ok(0)` on timeout
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;
}

/// Opens a port by name with the device line settings (9600-8-N-1, no flow control)
pub trait PortOpener: Send + Sync {
    fn open(&self, port_name: &str) -> Result<Box<dyn SerialPortIO>>;
}

/// Opens OS serial ports through the `serialport` crate
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemOpener;

impl PortOpener for SystemOpener {
    fn open(&self, port_name: &str) -> Result<Box<dyn SerialPortIO>> {
        let port = serialport::new(port_name, BAUD_RATE)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(IO_TIMEOUT_MS))
            .open()
            .map_err(|e| SerialError::Connect {
                port: port_name.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Box::new(SystemPort { inner: port }))
    }
}

struct SystemPort {
    inner: Box<dyn SerialPort>,
}

impl SerialPortIO for SystemPort {
    fn assert_control_lines(&mut self) -> io::Result<()> {
        self.inner.write_data_terminal_ready(true)?;
        self.inner.write_request_to_send(true)?;
        Ok(())
    }

    fn clear_buffers(&mut self) -> io::Result<()> {
        self.inner.clear(ClearBuffer::All)?;
        Ok(())
    }

    fn write_timeout(&mut self, data: &[u8], timeout: Duration) -> io::Result<usize> {
        let deadline = Instant::now() + timeout;
        let mut written = 0;

        while written < data.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            self.inner.set_timeout(remaining)?;

            match self.inner.write(&data[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::TimedOut => break,
                Err(e) if written == 0 => return Err(e),
                Err(e) => {
                    log::warn!("Write aborted after {} bytes: {}", written, e);
                    break;
                }
            }
        }

        if written == data.len() {
            self.inner.flush()?;
        }
        Ok(written)
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.inner.set_timeout(timeout)?;

        match self.inner.read(buf) {
            Ok(n) => Ok(n),
            Err(ref e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }
}

/// Enumerate the serial ports the OS currently reports
pub fn list_ports() -> Result<Vec<PortInfo>> {
    let ports = serialport::available_ports().map_err(SerialError::Enumeration)?;
    Ok(port_infos(ports))
}

fn port_infos(ports: Vec<SerialPortInfo>) -> Vec<PortInfo> {
    ports
        .into_iter()
        .map(|port| PortInfo {
            description: describe_port(&port.port_type),
            name: port.port_name,
        })
        .collect()
}

fn describe_port(port_type: &SerialPortType) -> String {
    match port_type {
        SerialPortType::UsbPort(usb_info) => usb_info
            .product
            .clone()
            .or_else(|| usb_info.manufacturer.clone())
            .unwrap_or_else(|| format!("USB {:04x}:{:04x}", usb_info.vid, usb_info.pid)),
        SerialPortType::PciPort => "PCI".to_string(),
        SerialPortType::BluetoothPort => "Bluetooth".to_string(),
        SerialPortType::Unknown => "n/a".to_string(),
    }
}

/// An open, fully configured link to one converter.
///
/// Not internally synchronised: callers must keep at most one command in
/// flight. Dropping the connection closes the port.
pub struct Connection {
    port: Option<Box<dyn SerialPortIO>>,
    port_name: String,
    config: TransportConfig,
    clock: Arc<dyn Clock>,
}

impl Connection {
    /// Open `port_name` with default settings and the system clock
    pub fn connect(port_name: &str) -> Result<Self> {
        Self::connect_with(
            &SystemOpener,
            port_name,
            TransportConfig::default(),
            Arc::new(SystemClock),
        )
    }

    /// Open `port_name`, assert DTR/RTS, flush and wait for the device to settle.
    ///
    /// If any step fails the half-configured port is dropped before the error
    /// is returned.
    pub fn connect_with(
        opener: &dyn PortOpener,
        port_name: &str,
        config: TransportConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        log::debug!("Connecting to {}", port_name);

        let mut port = opener.open(port_name)?;
        let configure_error = |step: &str, e: io::Error| SerialError::Connect {
            port: port_name.to_string(),
            reason: format!("{}: {}", step, e),
        };

        port.assert_control_lines()
            .map_err(|e| configure_error("asserting DTR/RTS", e))?;
        port.clear_buffers()
            .map_err(|e| configure_error("flushing buffers", e))?;
        clock.sleep(Duration::from_millis(CONNECT_SETTLE_MS));

        log::info!("Connected to {}", port_name);
        Ok(Self {
            port: Some(port),
            port_name: port_name.to_string(),
            config,
            clock,
        })
    }

    /// Close the port. Safe to call more than once.
    pub fn disconnect(&mut self) {
        if self.port.take().is_some() {
            log::info!("Disconnected from {}", self.port_name);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub(crate) fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Send one command line; queries (text containing `?`) return the trimmed reply
    pub fn send_raw(&mut self, command: &str) -> Result<Option<String>> {
        let response_len = self.config.response_len;
        self.exchange(command, response_len)
    }

    /// Like [`send_raw`](Self::send_raw) but reads at most `response_len - 1` reply bytes
    pub(crate) fn exchange(&mut self, command: &str, response_len: usize) -> Result<Option<String>> {
        let port = self.port.as_mut().ok_or(SerialError::NotConnected)?;

        // A late reply to an earlier command must not be read as this one's
        if let Err(e) = port.clear_buffers() {
            log::warn!("Failed to flush buffers before {:?}: {}", command, e);
        }

        let framed = format!("{}{}", command, COMMAND_TERMINATOR);
        if framed.len() > MAX_COMMAND_LEN {
            return Err(SerialError::Write(format!(
                "command is {} bytes, limit is {}",
                framed.len(),
                MAX_COMMAND_LEN
            )));
        }

        let timeout = Duration::from_millis(IO_TIMEOUT_MS);
        log::debug!("Writing command {:?}", command);
        let written = port
            .write_timeout(framed.as_bytes(), timeout)
            .map_err(|e| SerialError::Write(format!("{}: {}", command, e)))?;
        log::debug!("Wrote {} of {} bytes", written, framed.len());

        if written < framed.len() {
            return Err(SerialError::Write(format!(
                "{}: wrote {} of {} bytes",
                command,
                written,
                framed.len()
            )));
        }

        if !command.contains('?') {
            return Ok(None);
        }

        if let Some(delay) = self.config.pre_read_delay() {
            self.clock.sleep(delay);
        }

        let mut buffer = vec![0u8; response_len.saturating_sub(1)];
        let bytes_read = port
            .read_timeout(&mut buffer, timeout)
            .map_err(|e| SerialError::Read(format!("{}: {}", command, e)))?;

        if bytes_read == 0 {
            return Err(SerialError::Read(format!(
                "no reply to {} within {} ms",
                command, IO_TIMEOUT_MS
            )));
        }

        let reply = String::from_utf8_lossy(&buffer[..bytes_read]).trim().to_string();
        log::debug!("Reply to {:?}: {:?}", command, reply);

        if reply.is_empty() {
            return Err(SerialError::Read(format!("empty reply to {}", command)));
        }
        Ok(Some(reply))
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("port_name", &self.port_name)
            .field("connected", &self.is_connected())
            .field("config", &self.config)
            .finish()
    }
}
