//! Wire-level behavior seen by clients

use super::helpers::*;
use escalate::client::ClientError;
use escalate::daemon::{read_message, write_message, Request, Response};
use serde_json::json;
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::thread;
use std::time::Duration;

fn connect(daemon: &TestDaemon) -> UnixStream {
    let stream = UnixStream::connect(&daemon.config.socket_path).expect("Failed to connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

#[test]
fn test_frame_written_byte_by_byte_is_reassembled() {
    let daemon = TestDaemon::start();
    let mut stream = connect(&daemon);

    let mut frame = Vec::new();
    write_message(
        &mut frame,
        &Request::Add {
            id: "slow".to_string(),
            message: "dribbled".to_string(),
            stages: None,
        },
    )
    .unwrap();

    for byte in &frame {
        stream.write_all(std::slice::from_ref(byte)).unwrap();
        stream.flush().unwrap();
        thread::sleep(Duration::from_millis(1));
    }

    let response: Response = read_message(&mut stream).unwrap();
    assert!(response.ok, "unexpected response: {response:?}");
    assert_eq!(daemon.client().status().unwrap().pending[0].id, "slow");
}

#[test]
fn test_malformed_frame_closes_connection_without_state_change() {
    let daemon = TestDaemon::start();
    let mut stream = connect(&daemon);

    let body = b"{\"cmd\": \"add\", \"id\": ";
    stream.write_all(&(body.len() as u32).to_be_bytes()).unwrap();
    stream.write_all(body).unwrap();

    assert!(read_message::<Response, _>(&mut stream).is_err());
    assert!(daemon.client().status().unwrap().pending.is_empty());
    assert!(daemon.client().is_running());
}

#[test]
fn test_unknown_command_is_answered_with_error() {
    let daemon = TestDaemon::start();
    let mut stream = connect(&daemon);

    write_message(&mut stream, &json!({"cmd": "reboot"})).unwrap();
    let response: Response = read_message(&mut stream).unwrap();

    assert!(!response.ok);
    assert_eq!(response.error.as_deref(), Some("unknown command: reboot"));
}

#[test]
fn test_missing_field_is_answered_with_error() {
    let daemon = TestDaemon::start();
    let mut stream = connect(&daemon);

    write_message(&mut stream, &json!({"cmd": "cancel"})).unwrap();
    let response: Response = read_message(&mut stream).unwrap();

    assert!(!response.ok);
    assert!(response.error.unwrap().contains("invalid cancel request"));
}

#[test]
fn test_oversized_length_prefix_is_rejected() {
    let daemon = TestDaemon::start();
    let mut stream = connect(&daemon);

    stream.write_all(&u32::MAX.to_be_bytes()).unwrap();
    assert!(read_message::<Response, _>(&mut stream).is_err());
    assert!(daemon.client().is_running());
}

#[test]
fn test_connection_carries_several_requests() {
    let daemon = TestDaemon::start();
    let mut stream = connect(&daemon);

    for _ in 0..3 {
        write_message(&mut stream, &Request::Ping).unwrap();
        let response: Response = read_message(&mut stream).unwrap();
        assert!(response.ok);
    }
}

#[test]
fn test_cancel_unknown_id_is_not_an_error() {
    let daemon = TestDaemon::start();
    let reply = daemon.client().cancel("never-added").unwrap();
    assert!(!reply.cancelled);
}

#[test]
fn test_client_reports_not_running_after_stop() {
    let daemon = TestDaemon::start();
    let client = daemon.client();
    drop(daemon);

    match client.ping() {
        Err(ClientError::NotRunning { .. }) => {}
        other => panic!("Expected NotRunning, got {other:?}"),
    }
}
