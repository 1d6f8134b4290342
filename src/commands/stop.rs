//! Stop command - gracefully shuts down the daemon

use super::Context;
use anyhow::{Context as _, Result};
use colored::Colorize;
use std::thread;
use std::time::{Duration, Instant};

/// How long to wait for the socket to disappear after `shutdown`.
const STOP_WAIT: Duration = Duration::from_secs(5);

/// Execute the stop command to gracefully shut down the daemon
pub fn execute(ctx: &Context) -> Result<()> {
    let client = ctx.client();
    if !client.is_running() {
        println!("{} Daemon is not running", "─".dimmed());
        return Ok(());
    }

    println!("{} Stopping daemon...", "→".cyan().bold());
    client.shutdown().context("Failed to stop daemon")?;

    let deadline = Instant::now() + STOP_WAIT;
    while ctx.config.socket_path.exists() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(50));
    }
    if ctx.config.socket_path.exists() {
        println!(
            "{} Shutdown requested; socket still present at {}",
            "!".yellow().bold(),
            ctx.config.socket_path.display()
        );
        return Ok(());
    }

    println!("{} Daemon stopped", "✓".green().bold());
    Ok(())
}
