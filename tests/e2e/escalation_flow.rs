//! Escalation scheduling through the socket

use super::helpers::*;
use escalate::daemon::Stage;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn test_stages_fire_in_order_with_titles() {
    let daemon = TestDaemon::start();
    let client = daemon.client();
    let t0 = Instant::now();

    client
        .add("t1", "Waiting for approval", Some(vec![Stage::new(0.2, 0), Stage::new(0.5, 2)]))
        .expect("add should succeed");

    wait_for(Duration::from_secs(3), || daemon.recorder.deliveries().len() == 2);
    let seen = daemon.recorder.deliveries();

    assert_eq!(seen[0].id, "t1");
    assert_eq!(seen[0].priority, 0);
    assert_eq!(seen[0].title, "Claude Permission");
    assert_eq!(seen[0].message, "Waiting for approval");
    assert!(seen[0].at.duration_since(t0) >= Duration::from_millis(200));

    assert_eq!(seen[1].priority, 2);
    assert_eq!(seen[1].title, "Claude Permission (1hr)");
    assert!(seen[1].at.duration_since(t0) >= Duration::from_millis(500));

    // Completed escalations leave the table
    assert!(client.status().unwrap().pending.is_empty());
}

#[test]
fn test_cancel_before_first_stage_prevents_delivery() {
    let daemon = TestDaemon::start();
    let client = daemon.client();

    client
        .add("t1", "m", Some(vec![Stage::new(0.3, 0), Stage::new(0.6, 2)]))
        .unwrap();
    let reply = client.cancel("t1").unwrap();
    assert!(reply.cancelled);

    thread::sleep(Duration::from_millis(900));
    assert!(daemon.recorder.deliveries().is_empty());
    assert!(client.status().unwrap().pending.is_empty());
}

#[test]
fn test_cancel_between_stages_stops_later_stages() {
    let daemon = TestDaemon::start();
    let client = daemon.client();

    client
        .add("t1", "m", Some(vec![Stage::new(0.1, 0), Stage::new(0.8, 2)]))
        .unwrap();
    wait_for(Duration::from_secs(2), || daemon.recorder.deliveries().len() == 1);

    assert!(client.cancel("t1").unwrap().cancelled);
    thread::sleep(Duration::from_millis(1000));

    let seen = daemon.recorder.deliveries();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].priority, 0);
}

#[test]
fn test_second_add_supersedes_first() {
    let daemon = TestDaemon::start();
    let client = daemon.client();

    client.add("t1", "first", Some(vec![Stage::new(0.2, 0)])).unwrap();
    let reply = client
        .add("t1", "second", Some(vec![Stage::new(0.4, 1)]))
        .unwrap();
    assert!(reply.superseded);

    wait_for(Duration::from_secs(2), || !daemon.recorder.deliveries().is_empty());
    thread::sleep(Duration::from_millis(300));

    let seen = daemon.recorder.deliveries();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].message, "second");
    assert_eq!(seen[0].priority, 1);
}

#[test]
fn test_concurrent_adds_are_all_pending() {
    let daemon = TestDaemon::start();
    let threads: Vec<_> = (0..16)
        .map(|i| {
            let client = daemon.client();
            thread::spawn(move || {
                client
                    .add(&format!("id-{i}"), "m", Some(vec![Stage::new(60.0, 0)]))
                    .expect("add should succeed")
            })
        })
        .collect();
    for handle in threads {
        handle.join().unwrap();
    }

    let status = daemon.client().status().unwrap();
    assert_eq!(status.pending.len(), 16);
    assert!(status.pending.iter().all(|p| p.stages_remaining == 1));
}

#[test]
fn test_default_stages_apply_when_omitted() {
    let daemon = TestDaemon::start_with(|config| {
        config.default_stages = vec![Stage::new(0.1, 1)];
    });

    let reply = daemon.client().add("t1", "m", None).unwrap();
    assert_eq!(reply.stages, 1);

    wait_for(Duration::from_secs(2), || daemon.recorder.deliveries().len() == 1);
    assert_eq!(daemon.recorder.deliveries()[0].priority, 1);
}

#[test]
fn test_invalid_stages_are_rejected_without_state_change() {
    let daemon = TestDaemon::start();
    let client = daemon.client();

    let err = client
        .add("t1", "m", Some(vec![Stage::new(1.0, 9)]))
        .unwrap_err();
    assert!(err.to_string().contains("invalid stages"));
    assert!(client.status().unwrap().pending.is_empty());
}

#[test]
fn test_busy_session_reminder_is_skipped() {
    let daemon = TestDaemon::start();
    let client = daemon.client();

    // A shell waiting on a child looks like an agent running a tool
    let mut working = Command::new("/bin/sh")
        .args(["-c", "sleep 10; true"])
        .stdin(Stdio::null())
        .spawn()
        .expect("Failed to spawn shell");
    let mut waiting = Command::new("sleep")
        .arg("10")
        .stdin(Stdio::null())
        .spawn()
        .expect("Failed to spawn sleep");
    thread::sleep(Duration::from_millis(200));

    client.register_session(Some("working"), Some(working.id())).unwrap();
    client.register_session(Some("waiting"), Some(waiting.id())).unwrap();
    client
        .add("working", "m", Some(vec![Stage::new(0.1, 0)]))
        .unwrap();
    client
        .add("waiting", "m", Some(vec![Stage::new(0.3, 0)]))
        .unwrap();

    // One delivery worker: once "waiting" is through, "working" was decided
    wait_for(Duration::from_secs(5), || !daemon.recorder.deliveries().is_empty());
    let seen = daemon.recorder.deliveries();

    for child in [&mut working, &mut waiting] {
        let _ = child.kill();
        let _ = child.wait();
    }

    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].id, "waiting");
}
