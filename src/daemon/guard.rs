//! Single-instance enforcement.
//!
//! Startup is a two-phase protocol around an advisory lock on the lockfile:
//! take the lock, probe whatever socket is already there with a `ping`, then
//! either bind (no answer) or join (a live daemon answered), and release the
//! lock. Two racing starters serialize on the lock, so exactly one binds.

use super::protocol::{read_message, write_message, DaemonPhase, PingReply, Request, Response};
use crate::config::RuntimePaths;
use fs2::FileExt;
use nix::sys::stat::{umask, Mode};
use nix::unistd::geteuid;
use std::fs::{self, DirBuilder, File, OpenOptions, Permissions};
use std::io::{self, ErrorKind};
use std::os::unix::fs::{DirBuilderExt, FileTypeExt, MetadataExt, PermissionsExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// How often a blocked starter retries the lock.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How long a starter waits for the lock before giving up.
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(5);

/// Default timeout for the liveness ping.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// How long a starter waits for a draining daemon to give up the socket.
pub const DRAIN_WAIT: Duration = Duration::from_secs(3);

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// The umask is process-wide; binders take turns changing it.
static UMASK_LOCK: Mutex<()> = Mutex::new(());

/// Bind-time and lock-time failures. Fatal to the starting instance only.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("failed to create runtime directory {path}: {source}")]
    RuntimeDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("lockfile {0} is held by another starting daemon")]
    LockBusy(PathBuf),
    #[error("failed to lock {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{0} exists and is not a socket; refusing to remove it")]
    NotASocket(PathBuf),
    #[error("failed to remove stale socket {path}: {source}")]
    StaleCleanup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to bind {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to restrict permissions on {path}: {source}")]
    Permissions {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// What a socket path currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Nothing at the path
    Absent,
    /// Something accepted the connection: a daemon that is starting or
    /// listening, or one too busy to answer
    Alive,
    /// A daemon answered but is shutting down and about to remove its socket
    Draining,
    /// A socket file is there but nothing accepts connections on it
    Stale,
}

/// Exclusive hold on the lockfile; released on drop.
#[derive(Debug)]
pub struct StartupLock {
    file: File,
    path: PathBuf,
}

impl StartupLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StartupLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), "Failed to release lockfile: {e}");
        }
    }
}

/// Result of [`bind_or_join`].
#[derive(Debug)]
pub enum BindOutcome {
    /// This process is now the daemon
    Bound(UnixListener),
    /// Another daemon is already serving the socket
    Joined,
}

/// Create `dir` (and parents) with owner-only permissions.
///
/// An existing directory owned by this user is tightened to 0700. Shared
/// sticky directories such as `/tmp` and directories owned by someone else
/// are left as they are; the socket itself is still created 0600.
pub fn ensure_runtime_dir(dir: &Path) -> Result<(), LifecycleError> {
    if dir.as_os_str().is_empty() {
        return Ok(());
    }
    let runtime_dir_error = |source| LifecycleError::RuntimeDir {
        path: dir.to_path_buf(),
        source,
    };

    let metadata = match fs::metadata(dir) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(dir)
                .map_err(runtime_dir_error);
        }
        Err(source) => return Err(runtime_dir_error(source)),
    };

    let mode = metadata.mode();
    let shared = mode & 0o1000 != 0 || metadata.uid() != geteuid().as_raw();
    if metadata.is_dir() && !shared && mode & 0o077 != 0 {
        debug!(dir = %dir.display(), "Tightening runtime directory to 0700");
        fs::set_permissions(dir, Permissions::from_mode(0o700)).map_err(runtime_dir_error)?;
    }
    Ok(())
}

/// Bind `socket` so that it is 0600 from the moment it exists.
///
/// `bind` also starts listening, so fixing the mode afterwards would leave a
/// window where anyone could connect.
fn bind_private(socket: &Path) -> Result<UnixListener, LifecycleError> {
    let bound = {
        let _guard = UMASK_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let previous = umask(Mode::from_bits_truncate(0o177));
        let bound = UnixListener::bind(socket);
        umask(previous);
        bound
    };
    let listener = bound.map_err(|source| LifecycleError::Bind {
        path: socket.to_path_buf(),
        source,
    })?;

    // Normally a no-op; covers filesystems that ignore the umask
    if let Err(source) = fs::set_permissions(socket, Permissions::from_mode(0o600)) {
        let _ = fs::remove_file(socket);
        return Err(LifecycleError::Permissions {
            path: socket.to_path_buf(),
            source,
        });
    }
    Ok(listener)
}

/// Take the lockfile, waiting up to `wait` for a concurrent starter.
pub fn acquire_lock(path: &Path, wait: Duration) -> Result<StartupLock, LifecycleError> {
    if let Some(parent) = path.parent() {
        ensure_runtime_dir(parent)?;
    }

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|source| LifecycleError::Lock {
            path: path.to_path_buf(),
            source,
        })?;

    let deadline = Instant::now() + wait;
    loop {
        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!(path = %path.display(), "Lockfile acquired");
                return Ok(StartupLock {
                    file,
                    path: path.to_path_buf(),
                });
            }
            Err(e) if is_contended(&e) => {
                if Instant::now() >= deadline {
                    return Err(LifecycleError::LockBusy(path.to_path_buf()));
                }
                thread::sleep(LOCK_POLL_INTERVAL);
            }
            Err(source) => {
                return Err(LifecycleError::Lock {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }
    }
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Probe `socket` with a `ping`.
///
/// Only a refused connection makes a socket stale. A listener that accepted
/// and then hung up, timed out or answered with an error still owns the
/// socket.
pub fn probe(socket: &Path, timeout: Duration) -> Liveness {
    match fs::symlink_metadata(socket) {
        Err(e) if e.kind() == ErrorKind::NotFound => return Liveness::Absent,
        _ => {}
    }

    let mut stream = match UnixStream::connect(socket) {
        Ok(stream) => stream,
        Err(e) if e.kind() == ErrorKind::NotFound => return Liveness::Absent,
        Err(e) if e.kind() == ErrorKind::ConnectionRefused => {
            debug!(socket = %socket.display(), "Socket refused connection");
            return Liveness::Stale;
        }
        Err(e) => {
            warn!(socket = %socket.display(), "Cannot connect to socket, leaving it alone: {e}");
            return Liveness::Alive;
        }
    };

    match ping_phase(&mut stream, timeout) {
        Ok(Some(DaemonPhase::Draining | DaemonPhase::Stopped)) => Liveness::Draining,
        Ok(_) => Liveness::Alive,
        Err(e) => {
            debug!(socket = %socket.display(), "Listener did not answer ping: {e}");
            Liveness::Alive
        }
    }
}

/// Send `ping` and return the phase reported, if the reply carried one.
fn ping_phase(stream: &mut UnixStream, timeout: Duration) -> io::Result<Option<DaemonPhase>> {
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    write_message(stream, &Request::Ping).map_err(io::Error::other)?;
    let response: Response = read_message(stream).map_err(io::Error::other)?;
    Ok(response
        .into_result()
        .ok()
        .and_then(|data| serde_json::from_value::<PingReply>(data).ok())
        .map(|reply| reply.phase))
}

/// Poll `socket` until a draining daemon has released it or `wait` elapses.
fn wait_for_release(socket: &Path, probe_timeout: Duration, wait: Duration) -> Liveness {
    let deadline = Instant::now() + wait;
    loop {
        let liveness = probe(socket, probe_timeout);
        if liveness != Liveness::Draining || Instant::now() >= deadline {
            return liveness;
        }
        thread::sleep(DRAIN_POLL_INTERVAL);
    }
}

/// Remove the socket file at `path`, but only if it really is a socket.
pub fn remove_socket(path: &Path) -> Result<bool, LifecycleError> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(source) => {
            return Err(LifecycleError::StaleCleanup {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    if !metadata.file_type().is_socket() {
        return Err(LifecycleError::NotASocket(path.to_path_buf()));
    }
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        // Someone else cleaned it up first
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(source) => Err(LifecycleError::StaleCleanup {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Clear a dead daemon's socket under the lock. Returns the liveness found.
///
/// Used by clients before they spawn a replacement daemon.
pub fn clear_stale(paths: &RuntimePaths, probe_timeout: Duration) -> Result<Liveness, LifecycleError> {
    let _lock = acquire_lock(&paths.lock, DEFAULT_LOCK_WAIT)?;
    let liveness = probe(&paths.socket, probe_timeout);
    if liveness == Liveness::Stale && remove_socket(&paths.socket)? {
        info!(socket = %paths.socket.display(), "Removed stale socket");
    }
    Ok(liveness)
}

/// The bind-or-join decision.
///
/// Holds the lockfile while probing and binding, and releases it before
/// returning either way. A draining predecessor gets up to [`DRAIN_WAIT`] to
/// remove its socket.
///
/// # Arguments
/// * `paths` - Socket and lockfile locations
/// * `probe_timeout` - Read/write timeout for the liveness ping
///
/// # Returns
/// `BindOutcome::Bound` with a listener on a 0600 socket, or
/// `BindOutcome::Joined` when a live daemon already answers
pub fn bind_or_join(
    paths: &RuntimePaths,
    probe_timeout: Duration,
) -> Result<BindOutcome, LifecycleError> {
    if let Some(parent) = paths.socket.parent() {
        ensure_runtime_dir(parent)?;
    }
    let lock = acquire_lock(&paths.lock, DEFAULT_LOCK_WAIT)?;

    let mut liveness = probe(&paths.socket, probe_timeout);
    if liveness == Liveness::Draining {
        info!(socket = %paths.socket.display(), "Previous daemon is draining; waiting for it");
        liveness = wait_for_release(&paths.socket, probe_timeout, DRAIN_WAIT);
    }

    match liveness {
        Liveness::Alive => {
            info!(socket = %paths.socket.display(), "Daemon already running; joining it");
            return Ok(BindOutcome::Joined);
        }
        Liveness::Draining => {
            // It only removes the socket it bound, so replacing it is safe
            warn!(socket = %paths.socket.display(), "Draining daemon kept its socket; replacing it");
            remove_socket(&paths.socket)?;
        }
        Liveness::Stale => {
            warn!(socket = %paths.socket.display(), "Found unresponsive socket; recovering");
            remove_socket(&paths.socket)?;
        }
        Liveness::Absent => {}
    }

    let listener = bind_private(&paths.socket)?;

    drop(lock);
    debug!(socket = %paths.socket.display(), "Socket bound; lockfile released");
    Ok(BindOutcome::Bound(listener))
}
