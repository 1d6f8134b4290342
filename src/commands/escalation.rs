//! Add and cancel commands

use super::Context;
use crate::daemon::protocol::Stage;
use anyhow::{Context as _, Result};
use colored::Colorize;

/// Install an escalation, starting the daemon unless `no_start` is set.
pub fn add(ctx: &Context, id: &str, message: &str, stages: Vec<Stage>, no_start: bool) -> Result<()> {
    let client = if no_start {
        ctx.client()
    } else {
        ctx.ensure_running()?.0
    };
    let stages = (!stages.is_empty()).then_some(stages);

    let reply = client
        .add(id, message, stages)
        .with_context(|| format!("Failed to add escalation {id}"))?;

    let verb = if reply.superseded { "Replaced" } else { "Added" };
    println!(
        "{} {} escalation {} ({} stage{})",
        "✓".green().bold(),
        verb,
        reply.id.cyan().bold(),
        reply.stages,
        if reply.stages == 1 { "" } else { "s" }
    );
    Ok(())
}

pub fn cancel(ctx: &Context, id: &str) -> Result<()> {
    let reply = ctx
        .client()
        .cancel(id)
        .with_context(|| format!("Failed to cancel escalation {id}"))?;

    if reply.cancelled {
        println!("{} Cancelled escalation {}", "✓".green().bold(), reply.id.cyan().bold());
    } else {
        println!("{} No pending escalation {}", "─".dimmed(), reply.id.cyan());
    }
    Ok(())
}
