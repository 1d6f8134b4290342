//! Daemon server lifecycle methods: run, serve, drain, cleanup.

use super::connection::handle_connection;
use super::core::{DaemonServer, RunOutcome, CONNECTION_TIMEOUT, DRAIN_GRACE, MAX_CONNECTIONS};
use super::reaper::spawn_reaper;
use crate::daemon::guard::{self, BindOutcome, LifecycleError};
use crate::daemon::protocol::{write_message, DaemonPhase, ProtocolError, Response};
use crate::daemon::scheduler::Scheduler;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::MetadataExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Accept-loop poll interval while no client is connecting.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Error sent to clients beyond the connection limit.
pub(super) const TOO_MANY_CONNECTIONS: &str = "too many connections";

const REJECT_WRITE_TIMEOUT: Duration = Duration::from_millis(100);

impl DaemonServer {
    /// Become the daemon, or join the one that already is.
    ///
    /// Blocks until the daemon drains: the last session went away, a client
    /// sent `shutdown`, or a signal handler called [`DaemonServer::shutdown`].
    ///
    /// # Returns
    /// * `Ok(RunOutcome::Stopped)` - This instance served and has drained
    /// * `Ok(RunOutcome::AlreadyRunning)` - Another live daemon owns the
    ///   socket; nothing was bound
    /// * `Err(LifecycleError)` - The lock, runtime directory or socket could
    ///   not be set up
    pub fn run(&self) -> Result<RunOutcome, LifecycleError> {
        let listener = match guard::bind_or_join(&self.paths, self.probe_timeout)? {
            BindOutcome::Bound(listener) => listener,
            BindOutcome::Joined => return Ok(RunOutcome::AlreadyRunning),
        };
        match fs::symlink_metadata(&self.paths.socket) {
            Ok(metadata) => self.bound_inode.store(metadata.ino(), Ordering::SeqCst),
            Err(e) => warn!("Failed to stat bound socket: {e}"),
        }

        let result = self.serve(listener);
        self.cleanup();
        self.shared.lock().set_phase(DaemonPhase::Stopped);
        info!("Daemon stopped");
        result.map(|()| RunOutcome::Stopped)
    }

    /// Accept loop plus the timer, delivery and reaper threads.
    fn serve(&self, listener: UnixListener) -> Result<(), LifecycleError> {
        listener
            .set_nonblocking(true)
            .map_err(|source| LifecycleError::Bind {
                path: self.paths.socket.clone(),
                source,
            })?;

        {
            let mut state = self.shared.lock();
            // A signal may have arrived before the socket was bound
            if state.phase() == DaemonPhase::Starting {
                state.set_phase(DaemonPhase::Listening);
            }
        }
        info!(
            socket = %self.paths.socket.display(),
            pid = std::process::id(),
            "Daemon listening"
        );

        let scheduler = Scheduler::spawn(Arc::clone(&self.shared), self.delivery.clone());
        let reaper = spawn_reaper(Arc::clone(&self.shared), self.session_check_interval);

        let workers = match (scheduler, reaper) {
            (Ok(scheduler), Ok(reaper)) => {
                self.accept_loop(&listener);
                Some((scheduler, reaper))
            }
            (scheduler, reaper) => {
                error!("Failed to spawn daemon worker threads");
                self.shared.drain("worker threads failed to start");
                if let Ok(scheduler) = scheduler {
                    scheduler.join();
                }
                if let Ok(reaper) = reaper {
                    let _ = reaper.join();
                }
                None
            }
        };

        // Closing the listener and removing the file happen together so the
        // socket never outlives the listening phase.
        drop(listener);
        self.cleanup();

        if let Some((scheduler, reaper)) = workers {
            scheduler.join();
            if reaper.join().is_err() {
                error!("Reaper thread panicked");
            }
        }
        self.wait_for_connections();
        Ok(())
    }

    fn accept_loop(&self, listener: &UnixListener) {
        while self.shared.phase() == DaemonPhase::Listening {
            match listener.accept() {
                Ok((stream, _addr)) => {
                    // Check connection limit before accepting
                    let current = self.connection_count.load(Ordering::SeqCst);
                    if current >= MAX_CONNECTIONS {
                        warn!("Connection limit reached ({MAX_CONNECTIONS}), rejecting");
                        reject_connection(stream);
                        continue;
                    }
                    self.connection_count.fetch_add(1, Ordering::SeqCst);

                    let dispatcher = self.dispatcher();
                    let connection_count = Arc::clone(&self.connection_count);
                    let spawned = thread::Builder::new()
                        .name("escalate-conn".to_string())
                        .spawn(move || {
                            let result = handle_connection(stream, dispatcher, CONNECTION_TIMEOUT);
                            connection_count.fetch_sub(1, Ordering::SeqCst);
                            match result {
                                Ok(()) | Err(ProtocolError::Closed) => {}
                                Err(e) => warn!("Closing connection: {e}"),
                            }
                        });
                    if let Err(e) = spawned {
                        self.connection_count.fetch_sub(1, Ordering::SeqCst);
                        error!("Failed to spawn connection thread: {e}");
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    error!("Accept error: {e}");
                    self.shared.drain("accept failed");
                    break;
                }
            }
        }
        debug!(phase = %self.shared.phase(), "Accept loop finished");
    }

    /// Give in-flight connections a short grace period to finish.
    fn wait_for_connections(&self) {
        let deadline = Instant::now() + DRAIN_GRACE;
        while self.connection_count.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        let open = self.connection_count.load(Ordering::SeqCst);
        if open > 0 {
            debug!(open, "Exiting with connections still open");
        }
    }

    /// Remove the socket file, but only if it is still the one this instance
    /// bound.
    pub(super) fn cleanup(&self) {
        let inode = self.bound_inode.swap(0, Ordering::SeqCst);
        if inode == 0 {
            return;
        }
        match fs::symlink_metadata(&self.paths.socket) {
            Ok(metadata) if metadata.ino() == inode => {}
            Ok(_) => {
                debug!("Socket was replaced by another daemon; leaving it");
                return;
            }
            Err(_) => return,
        }
        match guard::remove_socket(&self.paths.socket) {
            Ok(true) => debug!(socket = %self.paths.socket.display(), "Socket removed"),
            Ok(false) => {}
            Err(e) => warn!("Failed to remove socket: {e}"),
        }
    }
}

/// Tell an over-limit client why it is being turned away, so it never
/// mistakes this daemon for a dead one.
fn reject_connection(mut stream: UnixStream) {
    let _ = stream.set_nonblocking(false);
    let _ = stream.set_write_timeout(Some(REJECT_WRITE_TIMEOUT));
    if let Err(e) = write_message(&mut stream, &Response::failure(TOO_MANY_CONNECTIONS)) {
        debug!("Failed to send rejection: {e}");
    }
}

impl Drop for DaemonServer {
    fn drop(&mut self) {
        self.cleanup();
    }
}
