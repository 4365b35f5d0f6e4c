#![cfg(test)]

use hostlink_core::Error;

#[test]
fn protocol_error_carries_its_message() {
    let e = Error::protocol("malformed HelloAck payload");
    assert_eq!(e.to_string(), "protocol: malformed HelloAck payload");
}

#[test]
fn config_error_carries_its_message() {
    let e = Error::config("conversation_key must be exactly 8 hex characters");
    assert_eq!(
        e.to_string(),
        "config: conversation_key must be exactly 8 hex characters"
    );
}

#[test]
fn io_error_wraps_the_underlying_source() {
    let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
    let e: Error = io.into();
    assert!(e.to_string().starts_with("io:"));
}

#[test]
fn terminal_variants_have_fixed_messages() {
    assert_eq!(Error::Timeout.to_string(), "timeout");
    assert_eq!(Error::Disconnected.to_string(), "disconnected");
    assert_eq!(Error::Canceled.to_string(), "canceled");
}
