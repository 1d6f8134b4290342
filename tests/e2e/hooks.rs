//! Hook entry points against a running daemon

use super::helpers::*;
use escalate::commands::hook::{run, HookEvent, HookInput, HookOutcome};
use escalate::commands::Context;
use escalate::daemon::Stage;
use std::time::Duration;

fn context(daemon: &TestDaemon) -> Context {
    Context::from_config(daemon.config.clone())
}

#[test]
fn test_activity_cancels_session_escalation() {
    let daemon = TestDaemon::start();
    daemon
        .client()
        .add("session-1", "m", Some(vec![Stage::new(30.0, 0)]))
        .unwrap();

    let input = HookInput::parse(r#"{"session_id":"session-1","hook_event_name":"PostToolUse"}"#);
    let outcome = run(&context(&daemon), HookEvent::PostTool, &input).unwrap();

    assert_eq!(
        outcome,
        HookOutcome::Cancelled {
            id: "session-1".to_string(),
            found: true
        }
    );
    assert!(daemon.client().status().unwrap().pending.is_empty());
}

#[test]
fn test_permission_prompt_adds_escalation() {
    let daemon = TestDaemon::start();
    let input = HookInput::parse(
        r#"{"session_id":"s9","notification_type":"permission_prompt","message":"Allow Bash?"}"#,
    );

    let outcome = run(&context(&daemon), HookEvent::Permission, &input).unwrap();
    assert_eq!(outcome, HookOutcome::Added { id: "s9".to_string() });

    let status = daemon.client().status().unwrap();
    assert_eq!(status.pending[0].message, "Allow Bash?");
    assert_eq!(status.pending[0].stages_remaining, 2);
}

#[test]
fn test_session_end_unregisters_and_drains() {
    let mut daemon = TestDaemon::start();
    daemon.client().register_session(Some("s1"), None).unwrap();

    let input = HookInput::parse(r#"{"session_id":"s1"}"#);
    let outcome = run(&context(&daemon), HookEvent::SessionEnd, &input).unwrap();

    assert_eq!(
        outcome,
        HookOutcome::Unregistered {
            session_id: Some("s1".to_string()),
            shutting_down: true
        }
    );
    daemon.wait_stopped(Duration::from_secs(5));
}
