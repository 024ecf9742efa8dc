mod common;

use budc_controller_lib::serial::SerialError;
use common::{ms, scripted_connection};

#[test]
fn test_wait_for_lock_polls_until_locked() {
    let (mut connection, port, clock) = scripted_connection();
    port.push_line("0").push_line("0").push_line("0").push_line("1");

    connection.wait_for_lock(5000).expect("lock");
    assert_eq!(port.count("LOCK?"), 4);
    assert_eq!(clock.sleeps(), vec![ms(50), ms(200), ms(200), ms(200)]);
}

#[test]
fn test_wait_for_lock_checks_before_timing_out() {
    let (mut connection, port, _clock) = scripted_connection();
    port.push_line("1");

    connection.wait_for_lock(0).expect("already locked");
    assert_eq!(port.count("LOCK?"), 1);
}

#[test]
fn test_wait_for_lock_times_out() {
    let (mut connection, port, _clock) = scripted_connection();
    for _ in 0..20 {
        port.push_line("0");
    }

    let err = connection.wait_for_lock(1000).unwrap_err();
    assert!(matches!(err, SerialError::Timeout { timeout_ms: 1000 }), "got {:?}", err);
    // Polls at 0, 200, ... 1200 ms; the one at 1000 ms is still inside the budget
    assert_eq!(port.count("LOCK?"), 7);
    assert!(connection.is_connected());
}

#[test]
fn test_retry_backoff_counts_toward_timeout() {
    let (mut connection, port, _clock) = scripted_connection();

    // No replies: every poll spends 2 x 100 ms in retries
    let err = connection.wait_for_lock(500).unwrap_err();
    assert!(matches!(err, SerialError::Timeout { .. }), "got {:?}", err);
    assert_eq!(port.count("LOCK?"), 6);
}

#[test]
fn test_set_frequency_and_wait_fails_fast_on_write_error() {
    let (mut connection, port, clock) = scripted_connection();
    port.fail_writes(1);
    port.push_line("1");

    let err = connection.set_frequency_and_wait(5.5, 5000).unwrap_err();
    assert!(matches!(err, SerialError::Write(_)), "got {:?}", err);
    assert_eq!(port.commands(), vec!["FREQ 5.5GHZ"]);
    assert_eq!(port.count("LOCK?"), 0, "no polling after a failed set");
    assert_eq!(clock.sleeps(), vec![ms(50)], "no settle delay after a failed set");
}

#[test]
fn test_set_frequency_and_wait_settles_before_polling() {
    let (mut connection, port, clock) = scripted_connection();
    port.push_line("0").push_line("1");

    connection.set_frequency_and_wait(2.4, 5000).expect("lock");

    let writes = port.writes();
    assert_eq!(writes[0].text, "FREQ 2.4GHZ\r\n");
    assert_eq!(writes[1].text, "LOCK?\r\n");
    assert!(
        writes[1].at - writes[0].at >= ms(200),
        "first poll {:?} after set",
        writes[1].at - writes[0].at
    );
    assert_eq!(clock.sleeps(), vec![ms(50), ms(200), ms(200)]);
    assert_eq!(port.count("LOCK?"), 2);
}
