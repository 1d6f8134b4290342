//! Ping command - check whether the daemon answers

use super::Context;
use anyhow::{bail, Result};
use colored::Colorize;

pub fn execute(ctx: &Context) -> Result<()> {
    match ctx.client().ping() {
        Ok(reply) => {
            println!(
                "{} pong from pid {} ({}, v{})",
                "✓".green().bold(),
                reply.pid.to_string().bold(),
                reply.phase,
                reply.version
            );
            Ok(())
        }
        Err(e) if e.is_not_running() => bail!("Daemon is not running"),
        Err(e) => Err(e.into()),
    }
}
