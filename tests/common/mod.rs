#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use budc_controller_lib::serial::mock::{ManualClock, MockOpener, ScriptedPort};
use budc_controller_lib::serial::{Connection, TransportConfig};

/// Settings with no host-specific pre-read delay
pub fn quiet_config() -> TransportConfig {
    TransportConfig {
        pre_read_delay_ms: None,
        ..TransportConfig::default()
    }
}

/// Connect a scripted port on a virtual clock
pub fn scripted_connection() -> (Connection, ScriptedPort, ManualClock) {
    let clock = ManualClock::new();
    let port = ScriptedPort::with_clock(&clock);
    let connection = Connection::connect_with(
        &MockOpener::scripted(&port),
        "mock0",
        quiet_config(),
        Arc::new(clock.clone()),
    )
    .expect("scripted connect");
    (connection, port, clock)
}

pub fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}
