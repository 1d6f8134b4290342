//! Hook command - translate agent lifecycle callbacks into daemon calls
//!
//! Hooks run inside the agent's event pipeline, so they never fail: every
//! problem is logged and the process still exits 0.

use super::Context;
use crate::process;
use anyhow::Result;
use clap::ValueEnum;
use serde::Deserialize;
use std::io::Read;
use tracing::{debug, warn};

/// Fallback message when the agent does not supply one.
const DEFAULT_MESSAGE: &str = "Awaiting permission approval";

/// Notification type that starts an escalation.
const PERMISSION_PROMPT: &str = "permission_prompt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum HookEvent {
    /// Agent session started: ensure the daemon runs and attach the session
    SessionStart,
    /// Agent is waiting on a permission prompt: start escalating
    Permission,
    /// A tool finished running: cancel the session's escalation
    PostTool,
    /// Any other user activity (prompt submit, stop, ...): cancel
    Activity,
    /// Agent session ended: detach the session
    SessionEnd,
}

/// The subset of the agent's hook payload we look at.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct HookInput {
    pub session_id: Option<String>,
    pub notification_type: Option<String>,
    pub message: Option<String>,
    pub hook_event_name: Option<String>,
}

impl HookInput {
    /// Parse stdin; empty or malformed input is treated as `{}`.
    pub fn parse(raw: &str) -> Self {
        if raw.trim().is_empty() {
            return Self::default();
        }
        serde_json::from_str(raw).unwrap_or_else(|e| {
            warn!("Ignoring malformed hook input: {e}");
            Self::default()
        })
    }

    fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref().filter(|id| !id.is_empty())
    }
}

/// What a hook invocation ended up doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    Skipped(&'static str),
    Registered { session_id: String, pid: u32 },
    Added { id: String },
    Cancelled { id: String, found: bool },
    Unregistered { session_id: Option<String>, shutting_down: bool },
}

/// Entry point for `escalate hook <event>`: read stdin, act, always succeed.
pub fn execute(ctx: &Context, event: HookEvent) -> Result<()> {
    let mut raw = String::new();
    if let Err(e) = std::io::stdin().read_to_string(&mut raw) {
        warn!("Failed to read hook input: {e}");
    }

    match run(ctx, event, &HookInput::parse(&raw)) {
        Ok(outcome) => debug!(?event, ?outcome, "Hook finished"),
        Err(e) => warn!(?event, "Hook failed: {e:#}"),
    }
    Ok(())
}

/// Perform the daemon calls for `event`.
pub fn run(ctx: &Context, event: HookEvent, input: &HookInput) -> Result<HookOutcome> {
    match event {
        HookEvent::SessionStart => {
            let pid = process::agent_pid();
            let (client, _) = ctx.ensure_running()?;
            let reply = client.register_session(input.session_id(), Some(pid))?;
            Ok(HookOutcome::Registered {
                session_id: reply.session_id.unwrap_or_default(),
                pid,
            })
        }
        HookEvent::Permission => {
            if input.notification_type.as_deref() != Some(PERMISSION_PROMPT) {
                return Ok(HookOutcome::Skipped("not a permission prompt"));
            }
            let Some(id) = input.session_id() else {
                return Ok(HookOutcome::Skipped("no session_id"));
            };
            let message = input.message.as_deref().unwrap_or(DEFAULT_MESSAGE);
            let (client, _) = ctx.ensure_running()?;
            let reply = client.add(id, message, None)?;
            Ok(HookOutcome::Added { id: reply.id })
        }
        HookEvent::PostTool | HookEvent::Activity => {
            let Some(id) = input.session_id() else {
                return Ok(HookOutcome::Skipped("no session_id"));
            };
            let client = ctx.client();
            if !client.is_running() {
                return Ok(HookOutcome::Skipped("daemon not running"));
            }
            let reply = client.cancel(id)?;
            Ok(HookOutcome::Cancelled {
                id: reply.id,
                found: reply.cancelled,
            })
        }
        HookEvent::SessionEnd => {
            let client = ctx.client();
            if !client.is_running() {
                return Ok(HookOutcome::Skipped("daemon not running"));
            }
            let reply = client.unregister_session(input.session_id())?;
            Ok(HookOutcome::Unregistered {
                session_id: reply.session_id,
                shutting_down: reply.shutting_down,
            })
        }
    }
}
