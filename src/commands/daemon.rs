//! Daemon command - run the escalation daemon in the foreground

use super::Context;
use crate::daemon::{DaemonServer, RunOutcome};
use crate::logging;
use anyhow::{Context as _, Result};
use tracing::info;

/// Run the daemon until it drains.
///
/// Exits successfully both after a normal drain and when another daemon
/// already owns the socket.
pub fn execute(ctx: &Context, verbose: bool) -> Result<()> {
    logging::init_daemon(&ctx.config.log_path, verbose)?;

    let server = DaemonServer::new(&ctx.config);
    let shared = server.shared();
    ctrlc::set_handler(move || {
        shared.drain("termination signal");
    })
    .context("Failed to install signal handler")?;

    match server.run().context("Daemon failed to start")? {
        RunOutcome::Stopped => info!("Daemon exited cleanly"),
        RunOutcome::AlreadyRunning => info!(
            socket = %ctx.config.socket_path.display(),
            "Another daemon is already serving this socket"
        ),
    }
    Ok(())
}
