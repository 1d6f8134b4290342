//! Delivery through an external notifier program.
//!
//! The program is invoked as
//! `<program> <title> <message> --priority <p>` and, for emergency priority,
//! additionally `--retry <secs> --expire <secs>`.

use super::{DeliveryError, Notification, Notifier};
use crate::config::NotifyConfig;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{ChildStderr, Command, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::Duration;
use tracing::debug;
use wait_timeout::ChildExt;

/// Priority that requires retry/expire parameters.
const EMERGENCY_PRIORITY: i8 = 2;

/// How long to wait for stderr after the notifier exited. A grandchild may
/// still hold the pipe open.
const STDERR_COLLECTION_TIMEOUT: Duration = Duration::from_millis(500);

/// Read `stderr` on its own thread so a chatty notifier never blocks on a
/// full pipe while we wait for it.
fn collect_stderr(stderr: Option<ChildStderr>) -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    match stderr {
        Some(mut pipe) => {
            thread::spawn(move || {
                let mut bytes = Vec::new();
                let _ = pipe.read_to_end(&mut bytes);
                let _ = tx.send(String::from_utf8_lossy(&bytes).into_owned());
            });
        }
        None => {
            let _ = tx.send(String::new());
        }
    }
    rx
}

#[derive(Debug, Clone)]
pub struct CommandNotifier {
    program: PathBuf,
    timeout: Duration,
    emergency_retry_secs: u32,
    emergency_expire_secs: u32,
}

impl CommandNotifier {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
            emergency_retry_secs: 60,
            emergency_expire_secs: 3600,
        }
    }

    pub fn from_config(program: &Path, config: &NotifyConfig) -> Self {
        Self {
            program: program.to_path_buf(),
            timeout: Duration::from_secs(config.timeout_secs),
            emergency_retry_secs: config.emergency_retry_secs,
            emergency_expire_secs: config.emergency_expire_secs,
        }
    }

    /// Arguments passed after the program name.
    pub fn args(&self, notification: &Notification) -> Vec<String> {
        let mut args = vec![
            notification.title.clone(),
            notification.message.clone(),
            "--priority".to_string(),
            notification.priority.to_string(),
        ];
        if notification.priority == EMERGENCY_PRIORITY {
            args.extend([
                "--retry".to_string(),
                self.emergency_retry_secs.to_string(),
                "--expire".to_string(),
                self.emergency_expire_secs.to_string(),
            ]);
        }
        args
    }

    /// Bare names are looked up on PATH; anything with a separator is used as is.
    fn resolve_program(&self) -> Result<PathBuf, DeliveryError> {
        if self.program.components().count() > 1 {
            if self.program.exists() {
                return Ok(self.program.clone());
            }
            return Err(DeliveryError::NotFound(self.program.display().to_string()));
        }
        which::which(&self.program)
            .map_err(|_| DeliveryError::NotFound(self.program.display().to_string()))
    }
}

impl Notifier for CommandNotifier {
    fn deliver(&self, notification: &Notification) -> Result<(), DeliveryError> {
        let program = self.resolve_program()?;
        debug!(program = %program.display(), "Running notifier");

        let mut child = Command::new(&program)
            .args(self.args(notification))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(DeliveryError::Spawn)?;
        let stderr = collect_stderr(child.stderr.take());

        let status = match child.wait_timeout(self.timeout).map_err(DeliveryError::Spawn)? {
            Some(status) => status,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(DeliveryError::TimedOut(self.timeout));
            }
        };

        if status.success() {
            return Ok(());
        }

        let stderr = stderr
            .recv_timeout(STDERR_COLLECTION_TIMEOUT)
            .unwrap_or_default();
        Err(DeliveryError::Failed {
            status: status.to_string(),
            stderr: stderr.trim().to_string(),
        })
    }
}
