//! Start command - make sure a daemon is running in the background

use super::Context;
use anyhow::Result;
use colored::Colorize;

pub fn execute(ctx: &Context) -> Result<()> {
    if let Ok(reply) = ctx.client().ping() {
        println!(
            "{} Daemon already running (pid {})",
            "─".dimmed(),
            reply.pid.to_string().bold()
        );
        return Ok(());
    }

    println!("{} Starting daemon...", "→".cyan().bold());
    let (_, reply) = ctx.ensure_running()?;
    println!(
        "{} Daemon running (pid {}) on {}",
        "✓".green().bold(),
        reply.pid.to_string().bold(),
        ctx.config.socket_path.display()
    );
    Ok(())
}
