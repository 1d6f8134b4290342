//! Register and unregister commands

use super::Context;
use anyhow::{Context as _, Result};
use colored::Colorize;

/// Attach a session, starting the daemon if needed.
pub fn register(ctx: &Context, session_id: Option<&str>, pid: Option<u32>) -> Result<()> {
    let (client, _) = ctx.ensure_running()?;
    let reply = client
        .register_session(session_id, pid)
        .context("Failed to register session")?;

    println!(
        "{} Registered session {} ({} attached)",
        "✓".green().bold(),
        reply.session_id.as_deref().unwrap_or("?").cyan().bold(),
        reply.session_count
    );
    Ok(())
}

pub fn unregister(ctx: &Context, session_id: Option<&str>) -> Result<()> {
    let client = ctx.client();
    if !client.is_running() {
        println!("{} Daemon is not running", "─".dimmed());
        return Ok(());
    }

    let reply = client
        .unregister_session(session_id)
        .context("Failed to unregister session")?;

    match reply.session_id {
        Some(id) => println!(
            "{} Unregistered session {} ({} attached)",
            "✓".green().bold(),
            id.cyan().bold(),
            reply.session_count
        ),
        None => println!("{} No matching session", "─".dimmed()),
    }
    if reply.shutting_down {
        println!("{} Last session gone; daemon is shutting down", "→".cyan().bold());
    }
    Ok(())
}
