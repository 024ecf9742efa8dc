use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, CommandFactory, Parser};

use crate::serial::mock::MockOpener;
use crate::serial::{
    self, Connection, PortInfo, PortOpener, StatusReport, SystemClock, SystemOpener,
    TransportConfig,
};

const WAIT_LOCK_TIMEOUT_MS: u64 = 5000;

const EXAMPLES: &str = "\
Examples:
  budc-cli --port /dev/ttyACM0 --status
  budc-cli --port COM3 --freq 5.5
  budc-cli --port COM3 --freq 2.4 --wait-lock
  budc-cli --mock --status --json";

/// BUDC command line interface
#[derive(Parser, Debug)]
#[command(name = "budc-cli", version, about, after_help = EXAMPLES)]
pub struct Cli {
    /// List available serial ports
    #[arg(long)]
    pub list: bool,

    /// Serial port to connect to (e.g. /dev/ttyACM0, COM3)
    #[arg(long, value_name = "NAME")]
    pub port: Option<String>,

    /// Talk to a built-in simulated device instead of a serial port
    #[arg(long, conflicts_with = "port")]
    pub mock: bool,

    /// JSON file with transport settings
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Print --list and --status output as JSON
    #[arg(long)]
    pub json: bool,

    /// More log output (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Get a full status report
    #[arg(long)]
    pub status: bool,

    /// Send a raw SCPI command
    #[arg(long, value_name = "CMD")]
    pub cmd: Option<String>,

    /// Set frequency in GHz
    #[arg(long, value_name = "GHZ")]
    pub freq: Option<f64>,

    /// Set frequency in MHz
    #[arg(long, value_name = "MHZ")]
    pub freq_mhz: Option<f64>,

    /// Set frequency in Hz
    #[arg(long, value_name = "HZ")]
    pub freq_hz: Option<f64>,

    /// Set power level
    #[arg(long, value_name = "LEVEL", allow_negative_numbers = true)]
    pub power: Option<i32>,

    /// Wait for the PLL to lock (5 s timeout) after a set command
    #[arg(long)]
    pub wait_lock: bool,

    /// Reset to preset values
    #[arg(long)]
    pub preset: bool,

    /// Save settings to flash
    #[arg(long)]
    pub save: bool,

    /// Get current frequency
    #[arg(long)]
    pub get_freq: bool,

    /// Get current power level
    #[arg(long)]
    pub get_power: bool,

    /// Get temperature
    #[arg(long)]
    pub get_temp: bool,

    /// Get lock status
    #[arg(long)]
    pub get_lock: bool,
}

/// Run the requested operations, printing to stdout.
///
/// Returns `Ok(false)` when at least one operation failed.
pub fn execute(cli: &Cli) -> Result<bool> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    execute_to(cli, &mut out)
}

pub fn execute_to(cli: &Cli, out: &mut dyn Write) -> Result<bool> {
    if cli.list {
        let ports = serial::list_ports().context("Error listing ports")?;
        print_ports(out, &ports, cli.json)?;
        return Ok(true);
    }

    let config = match &cli.config {
        Some(path) => TransportConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => TransportConfig::default(),
    };

    let (opener, port_name): (Box<dyn PortOpener>, &str) = if cli.mock {
        (Box::new(MockOpener::simulated()), "simulated")
    } else if let Some(port) = cli.port.as_deref() {
        (Box::new(SystemOpener), port)
    } else {
        writeln!(out, "{}", Cli::command().render_help())?;
        return Ok(true);
    };

    let mut connection =
        Connection::connect_with(opener.as_ref(), port_name, config, Arc::new(SystemClock))
            .with_context(|| format!("Failed to connect to {}", port_name))?;

    let ok = run_operations(cli, &mut connection, out);
    connection.disconnect();
    ok
}

fn run_operations(cli: &Cli, connection: &mut Connection, out: &mut dyn Write) -> Result<bool> {
    let mut ok = true;

    if let Some(ghz) = cli.freq {
        writeln!(out, "Setting frequency to {:.4} GHz...", ghz)?;
        ok &= check("Failed to set frequency", connection.set_frequency_ghz(ghz)).is_some();
    } else if let Some(mhz) = cli.freq_mhz {
        writeln!(out, "Setting frequency to {:.3} MHz...", mhz)?;
        ok &= check("Failed to set frequency", connection.set_frequency_mhz(mhz)).is_some();
    } else if let Some(hz) = cli.freq_hz {
        writeln!(out, "Setting frequency to {:.0} Hz...", hz)?;
        ok &= check("Failed to set frequency", connection.set_frequency_hz(hz)).is_some();
    }

    if let Some(level) = cli.power {
        writeln!(out, "Setting power to {}...", level)?;
        ok &= check("Failed to set power", connection.set_power_level(level)).is_some();
    }

    if cli.wait_lock {
        writeln!(out, "Waiting for PLL to lock (5 second timeout)...")?;
        if check("PLL lock failed", connection.wait_for_lock(WAIT_LOCK_TIMEOUT_MS)).is_some() {
            writeln!(out, "PLL locked.")?;
        } else {
            ok = false;
        }
    }

    if cli.preset {
        writeln!(out, "Executing PRESET...")?;
        ok &= check("Failed to execute preset", connection.preset()).is_some();
    }
    if cli.save {
        writeln!(out, "Executing SAVE...")?;
        ok &= check("Failed to save settings", connection.save_settings()).is_some();
    }

    if cli.get_freq {
        match check("Failed to get frequency", connection.get_frequency_ghz()) {
            Some(ghz) => writeln!(out, "Frequency: {:.4} GHz", ghz)?,
            None => ok = false,
        }
    }
    if cli.get_power {
        match check("Failed to get power level", connection.get_power_level()) {
            Some(level) => writeln!(out, "Power Level: {}", level)?,
            None => ok = false,
        }
    }
    if cli.get_temp {
        // Many units have no sensor; that is not a failure
        match connection.get_temperature_c() {
            Ok(temp) => writeln!(out, "Temperature: {:.1} C", temp)?,
            Err(e) => {
                log::info!("Temperature read failed: {}", e);
                writeln!(out, "Temperature: Not Supported or failed to read.")?;
            }
        }
    }
    if cli.get_lock {
        match check("Failed to get lock status", connection.get_lock_status()) {
            Some(locked) => writeln!(out, "Lock Status: {}", lock_label(locked))?,
            None => ok = false,
        }
    }

    if let Some(command) = &cli.cmd {
        writeln!(out, "Sending raw command: {}", command)?;
        match check("Failed to send raw command", connection.send_raw(command)) {
            Some(reply) => writeln!(
                out,
                "Response: {}",
                reply.as_deref().unwrap_or("(no response)")
            )?,
            None => ok = false,
        }
    }

    if cli.status {
        let report = connection.status_report();
        if cli.json {
            serde_json::to_writer_pretty(&mut *out, &report)?;
            writeln!(out)?;
        } else {
            print_status(out, &report)?;
        }
    }

    Ok(ok)
}

fn check<T>(what: &str, result: serial::Result<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            eprintln!("{}: {}", what, e);
            None
        }
    }
}

fn lock_label(locked: bool) -> &'static str {
    if locked {
        "LOCKED"
    } else {
        "UNLOCKED"
    }
}

fn print_ports(out: &mut dyn Write, ports: &[PortInfo], json: bool) -> Result<()> {
    if json {
        serde_json::to_writer_pretty(&mut *out, ports)?;
        writeln!(out)?;
    } else if ports.is_empty() {
        writeln!(out, "No serial ports found.")?;
    } else {
        writeln!(out, "Found {} serial port(s):", ports.len())?;
        for port in ports {
            writeln!(out, "  {} ({})", port.name, port.description)?;
        }
    }
    Ok(())
}

fn print_status(out: &mut dyn Write, report: &StatusReport) -> io::Result<()> {
    let na = || "N/A".to_string();
    let identity = report.identity.as_ref();

    writeln!(out)?;
    writeln!(out, "--- BUDC Status Report ---")?;
    writeln!(out, "  Identity:      {}", identity.map_or_else(na, |id| id.raw.clone()))?;
    writeln!(out, "  Serial Number: {}", identity.map_or_else(na, |id| id.serial_number.clone()))?;
    writeln!(out, "  Firmware:      {}", identity.map_or_else(na, |id| id.firmware.clone()))?;
    writeln!(
        out,
        "  Frequency:     {}",
        report.frequency_ghz.map_or_else(na, |ghz| format!("{:.4} GHz", ghz))
    )?;
    writeln!(out, "  Lock Status:   {}", report.locked.map_or_else(na, |l| lock_label(l).to_string()))?;
    writeln!(
        out,
        "  Temperature:   {}",
        report
            .temperature_c
            .map_or_else(|| "Not Supported".to_string(), |t| format!("{:.1} C", t))
    )?;
    writeln!(out, "  Power Level:   {}", report.power_level.map_or_else(na, |p| p.to_string()))?;
    writeln!(out, "--------------------------")?;
    Ok(())
}
