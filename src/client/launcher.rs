//! Auto-start: spawn a detached daemon when none answers.

use super::{Client, ClientError};
use crate::config::RuntimePaths;
use crate::daemon::guard::{self, Liveness, DEFAULT_PROBE_TIMEOUT};
use crate::daemon::protocol::{DaemonPhase, PingReply};
use nix::unistd::setsid;
use std::ffi::OsString;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Spawns `<program> <args...>` as a daemon in its own session.
#[derive(Debug, Clone)]
pub struct Launcher {
    program: PathBuf,
    args: Vec<OsString>,
    start_timeout: Duration,
}

impl Launcher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<OsString>) -> Self {
        Self {
            program: program.into(),
            args,
            start_timeout: Duration::from_secs(3),
        }
    }

    /// This executable's `daemon` subcommand, with `global_args` (such as
    /// `--config` and `--socket`) placed before it.
    pub fn current_exe(global_args: Vec<OsString>) -> io::Result<Self> {
        let mut args = global_args;
        args.push("daemon".into());
        Ok(Self::new(std::env::current_exe()?, args))
    }

    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    /// Make sure a listening daemon answers on `client`'s socket, starting one
    /// if needed.
    pub fn ensure_running(
        &self,
        client: &Client,
        paths: &RuntimePaths,
    ) -> Result<PingReply, ClientError> {
        if let Ok(reply) = client.ping() {
            if reply.phase == DaemonPhase::Listening {
                return Ok(reply);
            }
        }

        // Clear what a dead daemon left behind; a live one may also have won
        // a race with us in the meantime.
        match guard::clear_stale(paths, DEFAULT_PROBE_TIMEOUT)? {
            Liveness::Alive => {
                debug!("Daemon came up concurrently");
                return self.wait_until_ready(client, None);
            }
            // The successor waits for the draining daemon to let go of the socket
            Liveness::Draining => debug!("Daemon is draining; starting its successor"),
            Liveness::Absent | Liveness::Stale => {}
        }

        let child = self.spawn()?;
        info!(pid = child.id(), program = %self.program.display(), "Spawned daemon");
        self.wait_until_ready(client, Some(child))
    }

    fn spawn(&self) -> Result<Child, ClientError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        // SAFETY: setsid is async-signal-safe and touches no parent state.
        unsafe {
            command.pre_exec(|| setsid().map(|_| ()).map_err(io::Error::from));
        }

        command.spawn().map_err(ClientError::Spawn)
    }

    fn wait_until_ready(
        &self,
        client: &Client,
        mut child: Option<Child>,
    ) -> Result<PingReply, ClientError> {
        let probe = client.clone().with_retry_backoff(Duration::ZERO);
        let deadline = Instant::now() + self.start_timeout;

        loop {
            if let Ok(reply) = probe.ping() {
                if reply.phase == DaemonPhase::Listening {
                    return Ok(reply);
                }
            }

            if let Some(process) = child.as_mut() {
                if let Ok(Some(status)) = process.try_wait() {
                    if !status.success() {
                        return Err(ClientError::DaemonExited(status.to_string()));
                    }
                    // Exit 0 before binding means it joined a daemon that won
                    // the race; keep polling for that one.
                    debug!("Spawned daemon deferred to an existing instance");
                    child = None;
                }
            }

            if Instant::now() >= deadline {
                return Err(ClientError::StartTimeout(self.start_timeout));
            }
            thread::sleep(READY_POLL_INTERVAL);
        }
    }
}
