use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::interface::Connection;
use super::retry::{retry, Attempt, RetryPolicy};
use super::{Result, SerialError};

// Reply buffer sizes per query
const IDENTITY_REPLY_LEN: usize = 256;
const FREQUENCY_REPLY_LEN: usize = 64;
const LOCK_REPLY_LEN: usize = 16;
const POWER_REPLY_LEN: usize = 16;
const TEMPERATURE_REPLY_LEN: usize = 64;

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(200);
/// Wait between a frequency change and the first lock poll
const FREQUENCY_SETTLE: Duration = Duration::from_millis(200);

const TEMPERATURE_MIN_C: f32 = -50.0;
const TEMPERATURE_MAX_C: f32 = 150.0;

/// Fields of an `*IDN?` reply: `company,product,serial,firmware`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub raw: String,
    pub company: String,
    pub product: String,
    pub serial_number: String,
    pub firmware: String,
}

impl Identity {
    /// Split on commas; fields the device left out are empty.
    /// The firmware field keeps anything after the third comma.
    pub fn parse(raw: &str) -> Self {
        let mut fields = raw.splitn(4, ',').map(str::trim);
        let mut next = || fields.next().unwrap_or_default().to_string();

        Self {
            company: next(),
            product: next(),
            serial_number: next(),
            firmware: next(),
            raw: raw.to_string(),
        }
    }

    /// "company product", as shown to operators
    pub fn display_name(&self) -> String {
        format!("{} {}", self.company, self.product).trim().to_string()
    }
}

/// One pass over every readable value. `None` marks a read that failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub port_name: String,
    pub identity: Option<Identity>,
    pub frequency_ghz: Option<f64>,
    pub locked: Option<bool>,
    /// `None` usually means the unit has no temperature sensor
    pub temperature_c: Option<f32>,
    pub power_level: Option<i32>,
    pub taken_at: DateTime<Utc>,
}

impl Connection {
    /// Raw `*IDN?` reply; anything 5 characters or shorter is treated as garbage
    pub fn get_identity(&mut self) -> Result<String> {
        self.query_with_retry("*IDN?", IDENTITY_REPLY_LEN, RetryPolicy::STANDARD, |reply, _| {
            (reply.len() > 5).then(|| reply.to_string())
        })
    }

    pub fn get_identity_fields(&mut self) -> Result<Identity> {
        self.get_identity().map(|raw| Identity::parse(&raw))
    }

    /// Current output frequency; the device reports Hz
    pub fn get_frequency_ghz(&mut self) -> Result<f64> {
        self.query_with_retry("FREQ?", FREQUENCY_REPLY_LEN, RetryPolicy::STANDARD, |reply, _| {
            parse_frequency_ghz(reply)
        })
    }

    pub fn get_lock_status(&mut self) -> Result<bool> {
        self.query_with_retry("LOCK?", LOCK_REPLY_LEN, RetryPolicy::STANDARD, |reply, _| {
            parse_lock(reply)
        })
    }

    pub fn get_power_level(&mut self) -> Result<i32> {
        self.query_with_retry("PWR?", POWER_REPLY_LEN, RetryPolicy::STANDARD, |reply, _| {
            parse_power(reply)
        })
    }

    /// Board temperature in °C.
    ///
    /// Some units answer `TEMP?` with a spurious 0.0 before a real reading is
    /// available, so 0.0 is only trusted on the final attempt.
    pub fn get_temperature_c(&mut self) -> Result<f32> {
        self.query_with_retry(
            "TEMP?",
            TEMPERATURE_REPLY_LEN,
            RetryPolicy::TEMPERATURE,
            |reply, attempt| {
                let value = parse_temperature(reply)?;
                if accept_temperature(value, attempt) {
                    Some(value)
                } else {
                    log::debug!("Rejected temperature {} on attempt {}", value, attempt.index + 1);
                    None
                }
            },
        )
    }

    pub fn set_frequency_ghz(&mut self, freq_ghz: f64) -> Result<()> {
        self.send_action(&format!("FREQ {}GHZ", format_significant(freq_ghz)))
    }

    pub fn set_frequency_mhz(&mut self, freq_mhz: f64) -> Result<()> {
        self.send_action(&format!("FREQ {}MHZ", format_significant(freq_mhz)))
    }

    pub fn set_frequency_hz(&mut self, freq_hz: f64) -> Result<()> {
        self.send_action(&format!("FREQ {}", format_significant(freq_hz)))
    }

    pub fn set_power_level(&mut self, level: i32) -> Result<()> {
        self.send_action(&format!("PWR {}", level))
    }

    /// Persist the current settings in the device's flash
    pub fn save_settings(&mut self) -> Result<()> {
        self.send_action("SAVE")
    }

    pub fn preset(&mut self) -> Result<()> {
        self.send_action("PRESET")
    }

    /// Poll `LOCK?` every 200 ms until the PLL reports lock or `timeout_ms` passes.
    ///
    /// Elapsed time includes the retry back-off inside each poll.
    pub fn wait_for_lock(&mut self, timeout_ms: u64) -> Result<()> {
        let clock = self.clock();
        let timeout = Duration::from_millis(timeout_ms);
        let start = clock.now();

        loop {
            match self.get_lock_status() {
                Ok(true) => {
                    log::info!("PLL locked after {:?}", clock.elapsed_since(start));
                    return Ok(());
                }
                Ok(false) => log::debug!("PLL not locked yet"),
                Err(SerialError::NotConnected) => return Err(SerialError::NotConnected),
                Err(e) => log::debug!("Lock poll failed: {}", e),
            }

            if clock.elapsed_since(start) > timeout {
                log::warn!("PLL did not lock within {} ms", timeout_ms);
                return Err(SerialError::Timeout { timeout_ms });
            }
            clock.sleep(LOCK_POLL_INTERVAL);
        }
    }

    /// Change frequency, give the synthesizer time to start retuning, then wait for lock
    pub fn set_frequency_and_wait(&mut self, freq_ghz: f64, timeout_ms: u64) -> Result<()> {
        self.set_frequency_ghz(freq_ghz)?;
        self.clock().sleep(FREQUENCY_SETTLE);
        self.wait_for_lock(timeout_ms)
    }

    /// Read identity, frequency, lock, temperature and power in that order.
    ///
    /// A failed read is logged and left as `None`; the remaining reads still run.
    pub fn status_report(&mut self) -> StatusReport {
        let clock = self.clock();

        let identity = self.get_identity_fields();
        clock.sleep(Duration::from_millis(100));
        let frequency = self.get_frequency_ghz();
        clock.sleep(Duration::from_millis(50));
        let locked = self.get_lock_status();
        clock.sleep(Duration::from_millis(50));
        let temperature = self.get_temperature_c();
        clock.sleep(Duration::from_millis(50));
        let power = self.get_power_level();

        if let Err(ref e) = temperature {
            log::info!("Temperature not supported or unreadable: {}", e);
        }

        StatusReport {
            port_name: self.port_name().to_string(),
            identity: logged("identity", identity),
            frequency_ghz: logged("frequency", frequency),
            locked: logged("lock status", locked),
            temperature_c: temperature.ok(),
            power_level: logged("power level", power),
            taken_at: Utc::now(),
        }
    }

    fn send_action(&mut self, command: &str) -> Result<()> {
        self.send_raw(command).map(|_| ())
    }

    fn query_with_retry<T, F>(
        &mut self,
        command: &'static str,
        response_len: usize,
        policy: RetryPolicy,
        mut parse: F,
    ) -> Result<T>
    where
        F: FnMut(&str, Attempt) -> Option<T>,
    {
        let clock = self.clock();
        let result = retry(&policy, |delay| clock.sleep(delay), |attempt| {
            let reply = self
                .exchange(command, response_len)?
                .ok_or_else(|| SerialError::Read(format!("no reply to {}", command)))?;
            match parse(&reply, attempt) {
                Some(value) => Ok(value),
                None => Err(SerialError::Parse { command, reply }),
            }
        });

        if let Err(ref e) = result {
            log::debug!("{} failed after {} attempts: {}", command, policy.attempts, e);
        }
        result
    }
}

fn logged<T>(what: &str, result: Result<T>) -> Option<T> {
    result
        .map_err(|e| log::warn!("Failed to read {}: {}", what, e))
        .ok()
}

/// Reply in Hz to GHz
pub fn parse_frequency_ghz(reply: &str) -> Option<f64> {
    leading_float(reply).map(|hz| hz / 1e9)
}

pub fn parse_lock(reply: &str) -> Option<bool> {
    leading_int(reply).map(|value| value == 1)
}

pub fn parse_power(reply: &str) -> Option<i32> {
    leading_int(reply).and_then(|value| i32::try_from(value).ok())
}

/// First number in the reply, e.g. `TEMP 51.0 C` -> 51.0.
/// A `-` or `.` that does not start a number is skipped.
pub fn parse_temperature(reply: &str) -> Option<f32> {
    reply
        .char_indices()
        .filter(|(_, c)| c.is_ascii_digit() || *c == '-' || *c == '.')
        .find_map(|(start, _)| leading_float(&reply[start..]))
        .map(|value| value as f32)
}

pub fn accept_temperature(value: f32, attempt: Attempt) -> bool {
    (TEMPERATURE_MIN_C..=TEMPERATURE_MAX_C).contains(&value) && (value != 0.0 || attempt.is_last())
}

/// Format with up to 10 significant digits and no trailing zeros (C's `%.10g`)
pub fn format_significant(value: f64) -> String {
    const PRECISION: i32 = 10;

    if value == 0.0 {
        return "0".to_string();
    }
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }

    let scientific = format!("{:.*e}", (PRECISION - 1) as usize, value);
    let (mantissa, exponent) = scientific.split_once('e').unwrap_or((scientific.as_str(), "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);

    if exponent < -4 || exponent >= PRECISION {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", strip_trailing_zeros(mantissa), sign, exponent.abs())
    } else {
        let decimals = (PRECISION - 1 - exponent) as usize;
        strip_trailing_zeros(&format!("{:.*}", decimals, value)).to_string()
    }
}

fn strip_trailing_zeros(number: &str) -> &str {
    if number.contains('.') {
        number.trim_end_matches('0').trim_end_matches('.')
    } else {
        number
    }
}

fn count_digits(bytes: &[u8]) -> usize {
    bytes.iter().take_while(|b| b.is_ascii_digit()).count()
}

/// Longest numeric prefix after leading whitespace, e.g. `5.5e9 Hz` -> 5.5e9
fn leading_float(text: &str) -> Option<f64> {
    let text = text.trim_start();
    let bytes = text.as_bytes();

    let mut end = usize::from(matches!(bytes.first(), Some(b'+' | b'-')));
    let int_digits = count_digits(&bytes[end..]);
    end += int_digits;

    let mut frac_digits = 0;
    if bytes.get(end) == Some(&b'.') {
        frac_digits = count_digits(&bytes[end + 1..]);
        end += 1 + frac_digits;
    }
    if int_digits + frac_digits == 0 {
        return None;
    }

    if matches!(bytes.get(end), Some(b'e' | b'E')) {
        let mut exp_end = end + 1;
        if matches!(bytes.get(exp_end), Some(b'+' | b'-')) {
            exp_end += 1;
        }
        let exp_digits = count_digits(&bytes[exp_end..]);
        if exp_digits > 0 {
            end = exp_end + exp_digits;
        }
    }

    text[..end].parse().ok()
}

/// Optional sign then digits after leading whitespace, e.g. `1 locked` -> 1
fn leading_int(text: &str) -> Option<i64> {
    let text = text.trim_start();
    let bytes = text.as_bytes();

    let sign = usize::from(matches!(bytes.first(), Some(b'+' | b'-')));
    let digits = count_digits(&bytes[sign..]);
    if digits == 0 {
        return None;
    }
    text[..sign + digits].parse().ok()
}
