mod common;

use std::sync::Arc;

use budc_controller_lib::serial::mock::{ManualClock, MockOpener, Reply, SimulatedDevice};
use budc_controller_lib::serial::{Connection, SerialError};
use common::{ms, quiet_config, scripted_connection};

fn simulated(device: SimulatedDevice) -> Connection {
    Connection::connect_with(
        &MockOpener::new(move |_| Box::new(device.clone())),
        "sim0",
        quiet_config(),
        Arc::new(ManualClock::new()),
    )
    .expect("connect")
}

#[test]
fn test_identity_fields() {
    let (mut connection, port, _clock) = scripted_connection();
    port.push_line("LOTUS,BUDC3G20GE,244003,v21.11.16");

    let identity = connection.get_identity_fields().expect("identity");
    assert_eq!(identity.company, "LOTUS");
    assert_eq!(identity.product, "BUDC3G20GE");
    assert_eq!(identity.serial_number, "244003");
    assert_eq!(identity.firmware, "v21.11.16");
}

#[test]
fn test_short_identity_is_retried() {
    let (mut connection, port, clock) = scripted_connection();
    port.push_line("OK").push_line("LOTUS,BUDC3G20GE");

    let identity = connection.get_identity_fields().expect("identity");
    assert_eq!(identity.product, "BUDC3G20GE");
    assert_eq!(identity.serial_number, "");
    assert_eq!(port.count("*IDN?"), 2);
    assert_eq!(clock.sleeps(), vec![ms(50), ms(100)]);
}

#[test]
fn test_frequency_retries_three_times_then_fails() {
    let (mut connection, port, clock) = scripted_connection();

    let err = connection.get_frequency_ghz().unwrap_err();
    assert!(matches!(err, SerialError::Read(_)), "got {:?}", err);
    assert_eq!(port.count("FREQ?"), 3);
    assert_eq!(clock.sleeps(), vec![ms(50), ms(100), ms(100)]);
}

#[test]
fn test_unparseable_frequency_is_retried() {
    let (mut connection, port, _clock) = scripted_connection();
    port.push_line("ERR").push_line("5500000000");

    assert_eq!(connection.get_frequency_ghz().expect("frequency"), 5.5);
    assert_eq!(port.count("FREQ?"), 2);
}

#[test]
fn test_lock_status() {
    let (mut connection, port, _clock) = scripted_connection();
    port.push_line("1").push_line("0");

    assert!(connection.get_lock_status().expect("locked"));
    assert!(!connection.get_lock_status().expect("unlocked"));
}

#[test]
fn test_power_level() {
    let (mut connection, port, _clock) = scripted_connection();
    port.push_reply(Reply::Silence).push_line("-7");

    assert_eq!(connection.get_power_level().expect("power"), -7);
    assert_eq!(port.count("PWR?"), 2);
}

#[test]
fn test_temperature_extracts_number_after_label() {
    let (mut connection, port, _clock) = scripted_connection();
    port.push_line("TEMP 51.0 C");

    assert_eq!(connection.get_temperature_c().expect("temperature"), 51.0);
}

#[test]
fn test_temperature_label_with_dash() {
    let (mut connection, port, _clock) = scripted_connection();
    port.push_line("TEMP-SENSOR 45.0");

    assert_eq!(connection.get_temperature_c().expect("temperature"), 45.0);
    assert_eq!(port.count("TEMP?"), 1);
}

#[test]
fn test_out_of_range_temperature_is_retried() {
    let (mut connection, port, clock) = scripted_connection();
    port.push_line("-999").push_line("23.5");

    assert_eq!(connection.get_temperature_c().expect("temperature"), 23.5);
    assert_eq!(port.count("TEMP?"), 2);
    assert_eq!(clock.sleeps(), vec![ms(50), ms(250)]);
}

#[test]
fn test_zero_temperature_accepted_only_on_last_attempt() {
    let (mut connection, port, _clock) = scripted_connection();
    for _ in 0..5 {
        port.push_line("0.0");
    }

    assert_eq!(connection.get_temperature_c().expect("temperature"), 0.0);
    assert_eq!(port.count("TEMP?"), 5, "0.0 must be rejected on attempts 1-4");
}

#[test]
fn test_zero_temperature_then_real_reading() {
    let (mut connection, port, _clock) = scripted_connection();
    port.push_line("0.0").push_line("0.0").push_line("12.0");

    assert_eq!(connection.get_temperature_c().expect("temperature"), 12.0);
    assert_eq!(port.count("TEMP?"), 3);
}

#[test]
fn test_temperature_unsupported_after_five_attempts() {
    let (mut connection, port, clock) = scripted_connection();
    for _ in 0..5 {
        port.push_line("-999");
    }

    let err = connection.get_temperature_c().unwrap_err();
    assert!(matches!(err, SerialError::Parse { command: "TEMP?", .. }), "got {:?}", err);
    assert_eq!(port.count("TEMP?"), 5);
    assert_eq!(clock.sleeps().iter().filter(|d| **d == ms(250)).count(), 4);
    assert!(connection.is_connected(), "failures never close the connection");
}

#[test]
fn test_set_commands_use_exact_vocabulary() {
    let (mut connection, port, _clock) = scripted_connection();

    connection.set_frequency_ghz(5.5).expect("ghz");
    connection.set_frequency_mhz(2412.5).expect("mhz");
    connection.set_frequency_hz(10_000_000_000.0).expect("hz");
    connection.set_power_level(-3).expect("power");
    connection.save_settings().expect("save");
    connection.preset().expect("preset");

    assert_eq!(
        port.commands(),
        vec!["FREQ 5.5GHZ", "FREQ 2412.5MHZ", "FREQ 1e+10", "PWR -3", "SAVE", "PRESET"]
    );
}

#[test]
fn test_set_reports_write_failure() {
    let (mut connection, port, _clock) = scripted_connection();
    port.fail_writes(1);

    assert!(matches!(connection.set_power_level(4), Err(SerialError::Write(_))));
}

#[test]
fn test_frequency_round_trip() {
    let mut connection = simulated(SimulatedDevice::new());

    for ghz in [2.4, 5.5, 10.125, 12.3456789] {
        connection.set_frequency_ghz(ghz).expect("set");
        let read_back = connection.get_frequency_ghz().expect("get");
        assert!((read_back - ghz).abs() < 1e-9, "set {} read {}", ghz, read_back);
    }
}

#[test]
fn test_frequency_round_trip_mhz() {
    let mut connection = simulated(SimulatedDevice::new());

    connection.set_frequency_mhz(3210.0).expect("set");
    assert!((connection.get_frequency_ghz().expect("get") - 3.21).abs() < 1e-9);
}

#[test]
fn test_status_report_tolerates_missing_temperature() {
    let mut connection = simulated(SimulatedDevice::new().with_temperature(None));
    connection.set_power_level(2).expect("power");

    let report = connection.status_report();
    assert_eq!(report.port_name, "sim0");
    assert_eq!(report.identity.map(|id| id.company), Some("SIMULATED".to_string()));
    assert_eq!(report.frequency_ghz, Some(5.5));
    assert_eq!(report.locked, Some(true));
    assert_eq!(report.temperature_c, None);
    assert_eq!(report.power_level, Some(2));
}

#[test]
fn test_status_report_order_and_settle_delays() {
    let (mut connection, port, clock) = scripted_connection();
    port.push_line("LOTUS,BUDC3G20GE,244003,v21.11.16")
        .push_line("5500000000")
        .push_line("1")
        .push_line("TEMP 40.0 C")
        .push_line("10");

    let report = connection.status_report();
    assert_eq!(port.commands(), vec!["*IDN?", "FREQ?", "LOCK?", "TEMP?", "PWR?"]);
    assert_eq!(clock.sleeps(), vec![ms(50), ms(100), ms(50), ms(50), ms(50)]);
    assert_eq!(report.temperature_c, Some(40.0));
    assert_eq!(report.power_level, Some(10));
}
