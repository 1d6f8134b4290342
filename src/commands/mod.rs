//! CLI command implementations.

pub mod completions;
pub mod daemon;
pub mod escalation;
pub mod hook;
pub mod ping;
pub mod session;
pub mod start;
pub mod status;
pub mod stop;

use crate::client::{Client, Launcher};
use crate::config::Config;
use crate::daemon::protocol::PingReply;
use anyhow::{Context as _, Result};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Resolved configuration plus the global flags a spawned daemon must see.
#[derive(Debug, Clone)]
pub struct Context {
    pub config: Config,
    forward_args: Vec<OsString>,
}

impl Context {
    /// Load configuration honouring `--config` and `--socket`.
    pub fn load(config_path: Option<&Path>, socket: Option<&Path>) -> Result<Self> {
        let mut config = Config::load(config_path)?;
        if let Some(socket) = socket {
            config.override_socket(socket);
        }

        let mut forward_args = Vec::new();
        if let Some(path) = config_path {
            forward_args.push("--config".into());
            forward_args.push(absolute(path).into_os_string());
        }
        if let Some(socket) = socket {
            forward_args.push("--socket".into());
            forward_args.push(absolute(socket).into_os_string());
        }

        Ok(Self {
            config,
            forward_args,
        })
    }

    /// Context around an already-built configuration (tests, embedding).
    pub fn from_config(config: Config) -> Self {
        Self {
            config,
            forward_args: Vec::new(),
        }
    }

    pub fn client(&self) -> Client {
        Client::from_config(&self.config)
    }

    pub fn launcher(&self) -> Result<Launcher> {
        Ok(Launcher::current_exe(self.forward_args.clone())
            .context("Failed to locate the escalate executable")?
            .with_start_timeout(self.config.start_timeout()))
    }

    /// Return a client for a listening daemon, starting one if needed.
    pub fn ensure_running(&self) -> Result<(Client, PingReply)> {
        let client = self.client();
        let reply = self
            .launcher()?
            .ensure_running(&client, &self.config.runtime_paths())
            .context("Failed to start escalation daemon")?;
        Ok((client, reply))
    }
}

/// The spawned daemon outlives the caller's working directory; hand it
/// absolute paths.
fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}
