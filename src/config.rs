//! Configuration file and runtime paths.
//!
//! Everything has a default; `~/.claude/escalation.toml` (or `--config`) only
//! needs to name what differs. Runtime files live under `~/.claude/run` and
//! `~/.claude/logs` unless configured otherwise.

use crate::daemon::protocol::{validate_stages, Stage};
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = ".claude/escalation.toml";
const SOCKET_FILE: &str = ".claude/run/escalation.sock";
const LOCK_FILE: &str = ".claude/run/escalation.lock";
const LOG_FILE: &str = ".claude/logs/escalation.log";

/// Filesystem surface shared by the daemon and its clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePaths {
    pub socket: PathBuf,
    pub lock: PathBuf,
    pub log: PathBuf,
}

impl RuntimePaths {
    /// All three files inside one directory (used by tests and `--socket`
    /// style overrides).
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            socket: dir.join("escalation.sock"),
            lock: dir.join("escalation.lock"),
            log: dir.join("escalation.log"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NotifyConfig {
    /// Notifier program; unset means deliveries are only logged
    pub command: Option<PathBuf>,
    pub timeout_secs: u64,
    pub title: String,
    pub urgent_title: String,
    pub emergency_retry_secs: u32,
    pub emergency_expire_secs: u32,
    /// Skip a reminder while the session's process is busy
    pub skip_when_busy: bool,
    /// CPU percentage above which a session counts as busy
    pub busy_cpu_percent: f32,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            command: None,
            timeout_secs: 10,
            title: "Claude Permission".to_string(),
            urgent_title: "Claude Permission (1hr)".to_string(),
            emergency_retry_secs: 60,
            emergency_expire_secs: 3600,
            skip_when_busy: true,
            busy_cpu_percent: 10.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub socket_path: PathBuf,
    pub lock_path: PathBuf,
    pub log_path: PathBuf,
    /// Stages used when `add` does not name any
    pub default_stages: Vec<Stage>,
    pub session_check_interval_secs: u64,
    pub client_timeout_ms: u64,
    pub client_retry_backoff_ms: u64,
    pub start_timeout_ms: u64,
    pub notify: NotifyConfig,
}

impl Default for Config {
    fn default() -> Self {
        let home = home_dir();
        Self {
            socket_path: home.join(SOCKET_FILE),
            lock_path: home.join(LOCK_FILE),
            log_path: home.join(LOG_FILE),
            default_stages: vec![Stage::new(60.0, 0), Stage::new(3600.0, 2)],
            session_check_interval_secs: 60,
            client_timeout_ms: 5000,
            client_retry_backoff_ms: 250,
            start_timeout_ms: 3000,
            notify: NotifyConfig::default(),
        }
    }
}

impl Config {
    /// `~/.claude/escalation.toml`
    pub fn default_path() -> PathBuf {
        home_dir().join(CONFIG_FILE)
    }

    /// Load configuration.
    ///
    /// An explicit `path` must exist. Without one, the default file is read if
    /// present and built-in defaults are used otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let default = Self::default_path();
                if default.exists() {
                    Self::from_file(&default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content)?;
        config.socket_path = expand_home(&config.socket_path);
        config.lock_path = expand_home(&config.lock_path);
        config.log_path = expand_home(&config.log_path);
        config.notify.command = config.notify.command.as_deref().map(expand_home);
        config.validate()?;
        Ok(config)
    }

    /// Defaults with every runtime file inside `dir`.
    pub fn with_runtime_dir(dir: &Path) -> Self {
        let mut config = Self::default();
        config.set_runtime_paths(RuntimePaths::in_dir(dir));
        config
    }

    /// Point the daemon at a different socket; the lock file follows it so two
    /// daemons on different sockets never contend.
    pub fn override_socket(&mut self, socket: &Path) {
        self.socket_path = socket.to_path_buf();
        self.lock_path = socket.with_extension("lock");
    }

    pub fn set_runtime_paths(&mut self, paths: RuntimePaths) {
        self.socket_path = paths.socket;
        self.lock_path = paths.lock;
        self.log_path = paths.log;
    }

    pub fn runtime_paths(&self) -> RuntimePaths {
        RuntimePaths {
            socket: self.socket_path.clone(),
            lock: self.lock_path.clone(),
            log: self.log_path.clone(),
        }
    }

    pub fn session_check_interval(&self) -> Duration {
        Duration::from_secs(self.session_check_interval_secs.max(1))
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_millis(self.client_timeout_ms)
    }

    pub fn client_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.client_retry_backoff_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if let Err(e) = validate_stages(&self.default_stages) {
            bail!("default_stages: {e}");
        }
        if !self.notify.busy_cpu_percent.is_finite() || self.notify.busy_cpu_percent < 0.0 {
            bail!("notify.busy_cpu_percent must be a non-negative number");
        }
        if self.client_timeout_ms == 0 {
            bail!("client_timeout_ms must be greater than zero");
        }
        Ok(())
    }
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(std::env::temp_dir)
}

/// Expand a leading `~/` against the home directory.
fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => home_dir().join(rest),
        Err(_) => path.to_path_buf(),
    }
}
