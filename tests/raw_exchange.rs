mod common;

use std::sync::Arc;

use budc_controller_lib::serial::mock::{ManualClock, MockOpener, Reply, ScriptedPort};
use budc_controller_lib::serial::{Connection, SerialError, TransportConfig};
use common::{ms, scripted_connection};

#[test]
fn test_action_writes_terminated_line_without_reading() {
    let (mut connection, port, _clock) = scripted_connection();
    port.push_line("stale");

    let reply = connection.send_raw("SAVE").expect("action");
    assert_eq!(reply, None);
    assert_eq!(port.writes()[0].text, "SAVE\r\n");
    assert_eq!(port.pending_replies(), 1, "actions must not consume replies");
}

#[test]
fn test_query_reply_is_trimmed() {
    let (mut connection, port, _clock) = scripted_connection();
    port.push_reply(Reply::Raw(b"  5500000000 \r\n".to_vec()));

    let reply = connection.send_raw("FREQ?").expect("query");
    assert_eq!(reply.as_deref(), Some("5500000000"));
}

#[test]
fn test_buffers_flushed_before_every_command() {
    let (mut connection, port, _clock) = scripted_connection();
    port.push_line("1");

    let after_connect = port.clears();
    connection.send_raw("PRESET").expect("action");
    connection.send_raw("LOCK?").expect("query");
    assert_eq!(port.clears(), after_connect + 2);
}

#[test]
fn test_query_with_no_reply_is_read_error() {
    let (mut connection, port, _clock) = scripted_connection();
    port.push_reply(Reply::Silence);

    let err = connection.send_raw("TEMP?").unwrap_err();
    assert!(matches!(err, SerialError::Read(_)), "got {:?}", err);
}

#[test]
fn test_whitespace_reply_is_never_success() {
    let (mut connection, port, _clock) = scripted_connection();
    port.push_reply(Reply::Raw(b" \r\n\t ".to_vec()));

    let err = connection.send_raw("PWR?").unwrap_err();
    assert!(matches!(err, SerialError::Read(_)), "got {:?}", err);
}

#[test]
fn test_short_write_is_write_error() {
    let (mut connection, port, _clock) = scripted_connection();
    port.fail_writes(1);

    let err = connection.send_raw("PWR 3").unwrap_err();
    assert!(matches!(err, SerialError::Write(_)), "got {:?}", err);

    // The connection stays usable
    assert!(connection.is_connected());
    connection.send_raw("PWR 3").expect("second write");
}

#[test]
fn test_short_write_skips_reply_read() {
    let (mut connection, port, _clock) = scripted_connection();
    port.fail_writes(1);
    port.push_line("1");

    assert!(connection.send_raw("LOCK?").is_err());
    assert_eq!(port.pending_replies(), 1);
}

#[test]
fn test_overlong_command_is_rejected() {
    let (mut connection, port, _clock) = scripted_connection();
    let command = "X".repeat(255);

    let err = connection.send_raw(&command).unwrap_err();
    assert!(matches!(err, SerialError::Write(_)), "got {:?}", err);
    assert!(port.writes().is_empty(), "nothing should reach the wire");

    connection.send_raw(&"X".repeat(254)).expect("254 bytes plus CR-LF fits");
}

#[test]
fn test_reply_limited_to_buffer_size() {
    let clock = ManualClock::new();
    let port = ScriptedPort::new();
    let config = TransportConfig {
        response_len: 5,
        pre_read_delay_ms: None,
    };
    let mut connection =
        Connection::connect_with(&MockOpener::scripted(&port), "mock0", config, Arc::new(clock))
            .expect("connect");
    port.push_line("ABCDEFGH");

    assert_eq!(connection.send_raw("*IDN?").expect("query").as_deref(), Some("ABCD"));
}

#[test]
fn test_pre_read_delay_applies_to_queries_only() {
    let clock = ManualClock::new();
    let port = ScriptedPort::new();
    let config = TransportConfig {
        response_len: 256,
        pre_read_delay_ms: Some(100),
    };
    let mut connection = Connection::connect_with(
        &MockOpener::scripted(&port),
        "mock0",
        config,
        Arc::new(clock.clone()),
    )
    .expect("connect");
    port.push_line("1");

    connection.send_raw("SAVE").expect("action");
    assert_eq!(clock.sleeps(), vec![ms(50)]);

    connection.send_raw("LOCK?").expect("query");
    assert_eq!(clock.sleeps(), vec![ms(50), ms(100)]);
}

#[test]
fn test_default_buffer_holds_511_byte_reply() {
    let (mut connection, port, _clock) = scripted_connection();
    port.push_reply(Reply::Raw(vec![b'A'; 600]));

    let reply = connection.send_raw("DUMP?").expect("query").expect("reply");
    assert_eq!(reply.len(), 511);
}
