//! Singleton enforcement, session reference counting and draining

use super::helpers::*;
use escalate::config::Config;
use escalate::daemon::{DaemonPhase, DaemonServer, RunOutcome, Stage};
use std::os::unix::net::UnixListener;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn test_last_unregister_drains_and_removes_socket() {
    let mut daemon = TestDaemon::start();
    let client = daemon.client();

    client.register_session(Some("A"), None).unwrap();
    client.register_session(Some("B"), None).unwrap();

    let reply = client.unregister_session(Some("A")).unwrap();
    assert_eq!(reply.session_count, 1);
    assert!(!reply.shutting_down);
    assert_eq!(client.ping().unwrap().phase, DaemonPhase::Listening);

    let status = client.status().unwrap();
    assert_eq!(status.phase, DaemonPhase::Listening);
    assert_eq!(status.session_count, 1);
    assert_eq!(status.sessions.len(), 1);
    assert_eq!(status.sessions[0].session_id, "B");

    let reply = client.unregister_session(Some("B")).unwrap();
    assert_eq!(reply.session_count, 0);
    assert!(reply.shutting_down);

    assert_eq!(daemon.wait_stopped(Duration::from_secs(5)), RunOutcome::Stopped);
    assert!(!daemon.config.socket_path.exists());
}

#[test]
fn test_unregister_without_id_removes_oldest() {
    let daemon = TestDaemon::start();
    let client = daemon.client();

    client.register_session(Some("first"), None).unwrap();
    std::thread::sleep(Duration::from_millis(20));
    client.register_session(Some("second"), None).unwrap();

    let reply = client.unregister_session(None).unwrap();
    assert_eq!(reply.session_id.as_deref(), Some("first"));
    assert_eq!(reply.session_count, 1);
}

#[test]
fn test_shutdown_drops_pending_escalations() {
    let mut daemon = TestDaemon::start();
    let client = daemon.client();

    client.add("t1", "m", Some(vec![Stage::new(0.3, 0)])).unwrap();
    client.shutdown().unwrap();

    assert_eq!(daemon.wait_stopped(Duration::from_secs(5)), RunOutcome::Stopped);
    std::thread::sleep(Duration::from_millis(400));
    assert!(daemon.recorder.deliveries().is_empty());
    assert!(!client.is_running());
}

#[test]
fn test_stale_socket_is_recovered() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let config = Config::with_runtime_dir(dir.path());

    // A daemon that died without cleanup leaves its socket file behind
    drop(UnixListener::bind(&config.socket_path).unwrap());
    assert!(config.socket_path.exists());

    let daemon = TestDaemon::start_in(dir, config);
    let reply = daemon.client().ping().expect("new daemon should answer");
    assert_eq!(reply.pid, std::process::id());
}

#[test]
fn test_restart_after_clean_shutdown() {
    let daemon = TestDaemon::start();
    let (dir, config) = daemon.into_parts();
    assert!(!config.socket_path.exists());

    let daemon = TestDaemon::start_in(dir, config);
    assert!(daemon.client().is_running());
}

#[test]
fn test_racing_starters_bind_exactly_once() {
    let daemon = TestDaemon::start();

    let outcomes: Vec<RunOutcome> = (0..4)
        .map(|_| {
            let config = daemon.config.clone();
            std::thread::spawn(move || {
                let server = DaemonServer::with_notifier(&config, Arc::new(Recorder::default()));
                server.run().expect("joining should not fail")
            })
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();

    assert!(outcomes.iter().all(|o| *o == RunOutcome::AlreadyRunning));
    assert!(daemon.config.socket_path.exists());
    assert!(daemon.client().is_running());
}

#[test]
fn test_dead_session_pid_is_reaped() {
    let mut daemon = TestDaemon::start_with(|config| {
        config.session_check_interval_secs = 1;
    });
    let client = daemon.client();

    let mut child = Command::new("sleep").arg("0.1").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();

    client.register_session(Some("gone"), Some(pid)).unwrap();

    // The only session is dead, so the sweep drains the daemon
    assert_eq!(daemon.wait_stopped(Duration::from_secs(5)), RunOutcome::Stopped);
    assert!(!daemon.config.socket_path.exists());
}

#[test]
fn test_socket_is_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let daemon = TestDaemon::start();
    let mode = std::fs::metadata(&daemon.config.socket_path)
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o600);
}
