//! In-process stand-ins for the serial port and the clock.
//!
//! Used by the test suite and by `budc-cli --mock`. [`ScriptedPort`] replays
//! canned replies and records what was written; [`SimulatedDevice`] answers the
//! converter's command vocabulary from its own state; [`ManualClock`] makes
//! every settle delay and retry back-off instantaneous and observable.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::clock::Clock;
use super::interface::{PortOpener, SerialPortIO};
use super::{Result, SerialError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct ClockState {
    offset: Duration,
    sleeps: Vec<Duration>,
}

/// Virtual monotonic clock; `sleep` returns immediately and advances time
#[derive(Debug, Clone)]
pub struct ManualClock {
    base: Instant,
    state: Arc<Mutex<ClockState>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            state: Arc::new(Mutex::new(ClockState {
                offset: Duration::ZERO,
                sleeps: Vec::new(),
            })),
        }
    }

    /// Virtual time passed since the clock was created
    pub fn elapsed(&self) -> Duration {
        lock(&self.state).offset
    }

    /// Every duration passed to `sleep`, in order
    pub fn sleeps(&self) -> Vec<Duration> {
        lock(&self.state).sleeps.clone()
    }

    /// Move time forward without recording a sleep
    pub fn advance(&self, duration: Duration) {
        lock(&self.state).offset += duration;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + lock(&self.state).offset
    }

    fn sleep(&self, duration: Duration) {
        let mut state = lock(&self.state);
        state.offset += duration;
        state.sleeps.push(duration);
    }
}

/// One canned answer to a read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Sent back with a CR-LF appended
    Line(String),
    /// Nothing arrives before the read times out
    Silence,
    /// Sent back exactly as given
    Raw(Vec<u8>),
}

impl Reply {
    pub fn line(text: &str) -> Self {
        Reply::Line(text.to_string())
    }
}

/// A frame the transport wrote, with the virtual time it was written at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenFrame {
    pub text: String,
    pub at: Duration,
}

#[derive(Debug, Default)]
struct ScriptState {
    replies: VecDeque<Reply>,
    writes: Vec<WrittenFrame>,
    short_writes: usize,
    clears: usize,
    control_lines_asserted: bool,
}

/// Port double that replays queued replies.
///
/// Clones share state, so a test can keep one handle while the connection
/// owns another.
#[derive(Debug, Clone, Default)]
pub struct ScriptedPort {
    state: Arc<Mutex<ScriptState>>,
    clock: Option<ManualClock>,
}

impl ScriptedPort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timestamp written frames with `clock`
    pub fn with_clock(clock: &ManualClock) -> Self {
        Self {
            state: Arc::default(),
            clock: Some(clock.clone()),
        }
    }

    pub fn push_reply(&self, reply: Reply) -> &Self {
        lock(&self.state).replies.push_back(reply);
        self
    }

    pub fn push_line(&self, text: &str) -> &Self {
        self.push_reply(Reply::line(text))
    }

    /// The next `count` writes transfer zero bytes
    pub fn fail_writes(&self, count: usize) -> &Self {
        lock(&self.state).short_writes += count;
        self
    }

    pub fn writes(&self) -> Vec<WrittenFrame> {
        lock(&self.state).writes.clone()
    }

    /// Written frames with the terminator stripped
    pub fn commands(&self) -> Vec<String> {
        self.writes()
            .into_iter()
            .map(|w| w.text.trim_end_matches("\r\n").to_string())
            .collect()
    }

    /// How many times `command` was written
    pub fn count(&self, command: &str) -> usize {
        self.commands().iter().filter(|c| *c == command).count()
    }

    pub fn clears(&self) -> usize {
        lock(&self.state).clears
    }

    pub fn control_lines_asserted(&self) -> bool {
        lock(&self.state).control_lines_asserted
    }

    pub fn pending_replies(&self) -> usize {
        lock(&self.state).replies.len()
    }
}

impl SerialPortIO for ScriptedPort {
    fn assert_control_lines(&mut self) -> io::Result<()> {
        lock(&self.state).control_lines_asserted = true;
        Ok(())
    }

    fn clear_buffers(&mut self) -> io::Result<()> {
        lock(&self.state).clears += 1;
        Ok(())
    }

    fn write_timeout(&mut self, data: &[u8], _timeout: Duration) -> io::Result<usize> {
        let at = self.clock.as_ref().map(ManualClock::elapsed).unwrap_or_default();
        let mut state = lock(&self.state);
        state.writes.push(WrittenFrame {
            text: String::from_utf8_lossy(data).into_owned(),
            at,
        });
        if state.short_writes > 0 {
            state.short_writes -= 1;
            return Ok(0);
        }
        Ok(data.len())
    }

    fn read_timeout(&mut self, buf: &mut [u8], _timeout: Duration) -> io::Result<usize> {
        let bytes = match lock(&self.state).replies.pop_front() {
            Some(Reply::Line(text)) => format!("{}\r\n", text).into_bytes(),
            Some(Reply::Raw(bytes)) => bytes,
            Some(Reply::Silence) | None => return Ok(0),
        };
        let n = bytes.len().min(buf.len());
        buf[..n].copy_from_slice(&bytes[..n]);
        Ok(n)
    }
}

pub const SIMULATED_IDENTITY: &str = "SIMULATED,BUDC-SIM,000001,v1.0.0";

#[derive(Debug, Clone, PartialEq)]
struct DeviceSettings {
    frequency_hz: f64,
    power_level: i32,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            frequency_hz: 5.5e9,
            power_level: 0,
        }
    }
}

/// Stateful converter stand-in speaking the full command vocabulary
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    settings: DeviceSettings,
    saved: DeviceSettings,
    temperature_c: Option<f32>,
    lock_delay_polls: u32,
    polls_until_lock: u32,
    pending: Option<String>,
}

impl SimulatedDevice {
    pub fn new() -> Self {
        Self {
            settings: DeviceSettings::default(),
            saved: DeviceSettings::default(),
            temperature_c: Some(41.5),
            lock_delay_polls: 1,
            polls_until_lock: 0,
            pending: None,
        }
    }

    /// `LOCK?` answers 0 this many times after each frequency change
    pub fn with_lock_delay(mut self, polls: u32) -> Self {
        self.lock_delay_polls = polls;
        self
    }

    /// `None` models a unit without a temperature sensor
    pub fn with_temperature(mut self, temperature_c: Option<f32>) -> Self {
        self.temperature_c = temperature_c;
        self
    }

    fn handle(&mut self, line: &str) -> Option<String> {
        let upper = line.trim().to_ascii_uppercase();
        let (head, arg) = match upper.split_once(' ') {
            Some((head, arg)) => (head, Some(arg.trim())),
            None => (upper.as_str(), None),
        };

        match (head, arg) {
            ("*IDN?", None) => Some(SIMULATED_IDENTITY.to_string()),
            ("FREQ?", None) => Some(format!("{:.0}", self.settings.frequency_hz)),
            ("FREQ", Some(value)) => {
                if let Some(hz) = parse_frequency_argument(value) {
                    self.settings.frequency_hz = hz;
                    self.polls_until_lock = self.lock_delay_polls;
                }
                None
            }
            ("LOCK?", None) => {
                if self.polls_until_lock > 0 {
                    self.polls_until_lock -= 1;
                    Some("0".to_string())
                } else {
                    Some("1".to_string())
                }
            }
            ("TEMP?", None) => self.temperature_c.map(|t| format!("TEMP {:.1} C", t)),
            ("PWR?", None) => Some(self.settings.power_level.to_string()),
            ("PWR", Some(value)) => {
                if let Ok(level) = value.parse() {
                    self.settings.power_level = level;
                }
                None
            }
            ("SAVE", None) => {
                self.saved = self.settings.clone();
                None
            }
            ("PRESET", None) => {
                self.settings = self.saved.clone();
                self.polls_until_lock = self.lock_delay_polls;
                None
            }
            _ => {
                log::debug!("Simulated device ignoring {:?}", line);
                None
            }
        }
    }
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_frequency_argument(value: &str) -> Option<f64> {
    let (number, scale) = if let Some(n) = value.strip_suffix("GHZ") {
        (n, 1e9)
    } else if let Some(n) = value.strip_suffix("MHZ") {
        (n, 1e6)
    } else {
        (value, 1.0)
    };
    number.trim().parse::<f64>().ok().map(|v| v * scale)
}

impl SerialPortIO for SimulatedDevice {
    fn assert_control_lines(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn clear_buffers(&mut self) -> io::Result<()> {
        self.pending = None;
        Ok(())
    }

    fn write_timeout(&mut self, data: &[u8], _timeout: Duration) -> io::Result<usize> {
        let text = String::from_utf8_lossy(data);
        self.pending = self.handle(&text);
        Ok(data.len())
    }

    fn read_timeout(&mut self, buf: &mut [u8], _timeout: Duration) -> io::Result<usize> {
        let Some(reply) = self.pending.take() else {
            return Ok(0);
        };
        let bytes = format!("{}\r\n", reply).into_bytes();
        let n = bytes.len().min(buf.len());
        buf[..n].copy_from_slice(&bytes[..n]);
        Ok(n)
    }
}

type PortFactory = dyn Fn(&str) -> Box<dyn SerialPortIO> + Send + Sync;

/// Opener handing out mock ports while counting live handles
pub struct MockOpener {
    factory: Box<PortFactory>,
    live: Arc<AtomicUsize>,
    opens: AtomicUsize,
    fail_open: bool,
    fail_control_lines: bool,
}

impl MockOpener {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(&str) -> Box<dyn SerialPortIO> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            live: Arc::new(AtomicUsize::new(0)),
            opens: AtomicUsize::new(0),
            fail_open: false,
            fail_control_lines: false,
        }
    }

    /// Every open yields a fresh [`SimulatedDevice`]
    pub fn simulated() -> Self {
        Self::new(|_| Box::new(SimulatedDevice::new()))
    }

    /// Every open yields a handle sharing `port`'s script
    pub fn scripted(port: &ScriptedPort) -> Self {
        let port = port.clone();
        Self::new(move |_| Box::new(port.clone()))
    }

    /// Opens fail as if the port did not exist
    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Ports open but refuse to assert DTR/RTS
    pub fn failing_control_lines(mut self) -> Self {
        self.fail_control_lines = true;
        self
    }

    /// Handles opened and not yet dropped
    pub fn live_handles(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl PortOpener for MockOpener {
    fn open(&self, port_name: &str) -> Result<Box<dyn SerialPortIO>> {
        if self.fail_open {
            return Err(SerialError::Connect {
                port: port_name.to_string(),
                reason: "no such port".to_string(),
            });
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(TrackedPort {
            inner: (self.factory)(port_name),
            live: Arc::clone(&self.live),
            fail_control_lines: self.fail_control_lines,
        }))
    }
}

struct TrackedPort {
    inner: Box<dyn SerialPortIO>,
    live: Arc<AtomicUsize>,
    fail_control_lines: bool,
}

impl SerialPortIO for TrackedPort {
    fn assert_control_lines(&mut self) -> io::Result<()> {
        if self.fail_control_lines {
            return Err(io::Error::new(io::ErrorKind::Unsupported, "DTR/RTS not supported"));
        }
        self.inner.assert_control_lines()
    }

    fn clear_buffers(&mut self) -> io::Result<()> {
        self.inner.clear_buffers()
    }

    fn write_timeout(&mut self, data: &[u8], timeout: Duration) -> io::Result<usize> {
        self.inner.write_timeout(data, timeout)
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        self.inner.read_timeout(buf, timeout)
    }
}

impl Drop for TrackedPort {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

