//! Status command - pending escalations and attached sessions

use super::Context;
use crate::daemon::protocol::StatusReport;
use anyhow::{Context as _, Result};
use colored::Colorize;

pub fn execute(ctx: &Context, json: bool) -> Result<()> {
    let client = ctx.client();
    let report = match client.status() {
        Ok(report) => report,
        Err(e) if e.is_not_running() => {
            if json {
                println!("{}", serde_json::json!({ "running": false }));
            } else {
                println!("{} Daemon is not running", "─".dimmed());
            }
            return Ok(());
        }
        Err(e) => return Err(e).context("Failed to query daemon status"),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", render(&report));
    }
    Ok(())
}

/// Human-readable rendering of a status snapshot.
pub fn render(report: &StatusReport) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "{} Daemon {} ({} session{})\n",
        "●".green().bold(),
        report.phase.to_string().bold(),
        report.session_count,
        if report.session_count == 1 { "" } else { "s" }
    ));

    out.push_str(&format!("\n{}\n", "Pending escalations".bold()));
    if report.pending.is_empty() {
        out.push_str(&format!("  {}\n", "none".dimmed()));
    }
    for pending in &report.pending {
        out.push_str(&format!(
            "  {}  next in {}  ({} stage{} left)  {}\n",
            pending.id.cyan(),
            format_secs(pending.next_fire_in),
            pending.stages_remaining,
            if pending.stages_remaining == 1 { "" } else { "s" },
            pending.message.dimmed()
        ));
    }

    out.push_str(&format!("\n{}\n", "Sessions".bold()));
    if report.sessions.is_empty() {
        out.push_str(&format!("  {}\n", "none".dimmed()));
    }
    for session in &report.sessions {
        let pid = session
            .pid
            .map(|pid| pid.to_string())
            .unwrap_or_else(|| "-".to_string());
        out.push_str(&format!(
            "  {}  pid {}  age {}\n",
            session.session_id.cyan(),
            pid,
            format_secs(session.age_secs as f64)
        ));
    }
    out
}

fn format_secs(secs: f64) -> String {
    let secs = secs.max(0.0).round() as u64;
    match secs {
        0..=59 => format!("{secs}s"),
        60..=3599 => format!("{}m{:02}s", secs / 60, secs % 60),
        _ => format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60),
    }
}
