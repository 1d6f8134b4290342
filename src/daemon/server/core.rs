//! Core DaemonServer struct and constructors.

use super::dispatch::Dispatcher;
use crate::config::{Config, RuntimePaths};
use crate::daemon::guard::DEFAULT_PROBE_TIMEOUT;
use crate::daemon::protocol::{DaemonPhase, Stage};
use crate::daemon::scheduler::Delivery;
use crate::daemon::state::Shared;
use crate::notify::{self, Notifier, Titles};
use crate::process::{BusyCheck, ProcessActivity};
use std::sync::atomic::{AtomicU64, AtomicUsize};
use std::sync::Arc;
use std::time::Duration;

/// Maximum number of concurrent client connections allowed.
pub(super) const MAX_CONNECTIONS: usize = 100;

/// Idle read timeout on an accepted connection.
pub(super) const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a draining daemon waits for open connections to finish.
pub(super) const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// How [`DaemonServer::run`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// This instance served and drained
    Stopped,
    /// Another daemon already owned the socket; nothing was bound
    AlreadyRunning,
}

/// Daemon server that listens on a Unix domain socket.
pub struct DaemonServer {
    pub(super) paths: RuntimePaths,
    pub(super) default_stages: Arc<[Stage]>,
    pub(super) session_check_interval: Duration,
    pub(super) probe_timeout: Duration,
    pub(super) shared: Arc<Shared>,
    pub(super) delivery: Delivery,
    pub(super) connection_count: Arc<AtomicUsize>,
    /// Inode of the socket file this instance bound, 0 if none. Cleanup only
    /// removes that exact file, never a successor's.
    pub(super) bound_inode: AtomicU64,
}

impl DaemonServer {
    /// Create a server using the notifier described by `config`.
    ///
    /// # Arguments
    /// * `config` - Runtime paths, default stages and notifier settings
    ///
    /// # Returns
    /// A `DaemonServer` in the `Starting` phase; nothing is bound until
    /// [`DaemonServer::run`]
    pub fn new(config: &Config) -> Self {
        Self::with_notifier(config, notify::from_config(&config.notify))
    }

    /// Create a server that delivers through `notifier`.
    ///
    /// Busy suppression follows `config.notify.skip_when_busy`.
    ///
    /// # Arguments
    /// * `config` - Runtime paths, default stages and notifier settings
    /// * `notifier` - Receives every fired stage that is not suppressed
    ///
    /// # Returns
    /// A `DaemonServer` in the `Starting` phase
    pub fn with_notifier(config: &Config, notifier: Arc<dyn Notifier>) -> Self {
        let busy = config.notify.skip_when_busy.then(|| {
            Arc::new(ProcessActivity::new(config.notify.busy_cpu_percent)) as Arc<dyn BusyCheck>
        });
        Self {
            paths: config.runtime_paths(),
            default_stages: config.default_stages.clone().into(),
            session_check_interval: config.session_check_interval(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            shared: Arc::new(Shared::new()),
            delivery: Delivery::new(notifier, Titles::from_config(&config.notify))
                .with_busy_check(busy),
            connection_count: Arc::new(AtomicUsize::new(0)),
            bound_inode: AtomicU64::new(0),
        }
    }

    /// Override how often tracked session PIDs are checked.
    pub fn with_session_check_interval(mut self, interval: Duration) -> Self {
        self.session_check_interval = interval;
        self
    }

    /// Replace the busy check consulted before each delivery.
    ///
    /// # Arguments
    /// * `busy` - The check to use, or `None` to always deliver
    pub fn with_busy_check(mut self, busy: Option<Arc<dyn BusyCheck>>) -> Self {
        self.delivery.busy = busy;
        self
    }

    pub fn paths(&self) -> &RuntimePaths {
        &self.paths
    }

    /// Handle other threads (signal handlers, tests) can use to drain the
    /// daemon or inspect its state.
    pub fn shared(&self) -> Arc<Shared> {
        Arc::clone(&self.shared)
    }

    pub fn phase(&self) -> DaemonPhase {
        self.shared.phase()
    }

    /// Request graceful shutdown of the daemon.
    ///
    /// Safe to call from any thread, before or during [`DaemonServer::run`].
    /// Pending escalations are dropped and the accept loop exits within one
    /// poll interval.
    pub fn shutdown(&self) {
        self.shared.drain("shutdown requested");
    }

    pub(super) fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(Arc::clone(&self.shared), Arc::clone(&self.default_stages))
    }
}
