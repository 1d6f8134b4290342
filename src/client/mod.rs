//! Client side of the daemon socket.
//!
//! Each call opens a fresh connection, sends one request and reads one
//! response. Connecting is retried once after a short backoff, which covers a
//! daemon that is still binding or a socket being replaced under us.

mod launcher;

pub use launcher::Launcher;

use crate::config::Config;
use crate::daemon::guard::LifecycleError;
use crate::daemon::protocol::{
    read_message, write_message, AddReply, CancelReply, PingReply, ProtocolError, Request,
    Response, SessionReply, Stage, StatusReport,
};
use serde::de::DeserializeOwned;
use std::io::{self, ErrorKind};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("escalation daemon is not running ({socket}): {source}")]
    NotRunning {
        socket: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("daemon communication failed: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("daemon rejected `{command}`: {message}")]
    Rejected { command: String, message: String },
    #[error("unexpected response to `{command}`: {source}")]
    Decode {
        command: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to spawn daemon: {0}")]
    Spawn(#[source] io::Error),
    #[error("daemon exited with {0} before it was reachable")]
    DaemonExited(String),
    #[error("daemon did not become reachable within {0:?}")]
    StartTimeout(Duration),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

impl ClientError {
    /// True when the failure means "no daemon is listening".
    pub fn is_not_running(&self) -> bool {
        matches!(self, ClientError::NotRunning { .. })
    }
}

#[derive(Debug, Clone)]
pub struct Client {
    socket: PathBuf,
    timeout: Duration,
    retry_backoff: Duration,
}

impl Client {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
            timeout: Duration::from_secs(5),
            retry_backoff: Duration::from_millis(250),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            socket: config.socket_path.clone(),
            timeout: config.client_timeout(),
            retry_backoff: config.client_retry_backoff(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Send one request and return the raw response.
    pub fn request(&self, request: &Request) -> Result<Response, ClientError> {
        let mut stream = self.connect()?;
        write_message(&mut stream, request)?;
        Ok(read_message(&mut stream)?)
    }

    /// Send one request and decode the `data` of a successful response.
    pub fn call<T: DeserializeOwned>(&self, request: &Request) -> Result<T, ClientError> {
        let command = request.name();
        let data = self
            .request(request)?
            .into_result()
            .map_err(|message| ClientError::Rejected {
                command: command.to_string(),
                message,
            })?;
        serde_json::from_value(data).map_err(|source| ClientError::Decode {
            command: command.to_string(),
            source,
        })
    }

    pub fn ping(&self) -> Result<PingReply, ClientError> {
        self.call(&Request::Ping)
    }

    /// `true` if a daemon answers `ping`.
    pub fn is_running(&self) -> bool {
        self.ping().is_ok()
    }

    /// Install an escalation. `None` stages means the daemon's defaults.
    pub fn add(
        &self,
        id: &str,
        message: &str,
        stages: Option<Vec<Stage>>,
    ) -> Result<AddReply, ClientError> {
        self.call(&Request::Add {
            id: id.to_string(),
            message: message.to_string(),
            stages,
        })
    }

    pub fn cancel(&self, id: &str) -> Result<CancelReply, ClientError> {
        self.call(&Request::Cancel { id: id.to_string() })
    }

    pub fn status(&self) -> Result<StatusReport, ClientError> {
        self.call(&Request::Status)
    }

    pub fn register_session(
        &self,
        session_id: Option<&str>,
        pid: Option<u32>,
    ) -> Result<SessionReply, ClientError> {
        self.call(&Request::RegisterSession {
            session_id: session_id.map(str::to_string),
            pid,
        })
    }

    pub fn unregister_session(&self, session_id: Option<&str>) -> Result<SessionReply, ClientError> {
        self.call(&Request::UnregisterSession {
            session_id: session_id.map(str::to_string),
        })
    }

    pub fn shutdown(&self) -> Result<(), ClientError> {
        let _: serde_json::Value = self.call(&Request::Shutdown)?;
        Ok(())
    }

    /// Connect, retrying once after `retry_backoff` on transient errors.
    fn connect(&self) -> Result<UnixStream, ClientError> {
        let stream = match UnixStream::connect(&self.socket) {
            Ok(stream) => stream,
            Err(e) if is_transient(&e) => {
                debug!(socket = %self.socket.display(), "Connect failed ({e}); retrying once");
                thread::sleep(self.retry_backoff);
                UnixStream::connect(&self.socket).map_err(|source| ClientError::NotRunning {
                    socket: self.socket.clone(),
                    source,
                })?
            }
            Err(source) => {
                return Err(ClientError::NotRunning {
                    socket: self.socket.clone(),
                    source,
                })
            }
        };
        stream
            .set_read_timeout(Some(self.timeout))
            .map_err(ProtocolError::Io)?;
        stream
            .set_write_timeout(Some(self.timeout))
            .map_err(ProtocolError::Io)?;
        Ok(stream)
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::ConnectionRefused
            | ErrorKind::NotFound
            | ErrorKind::WouldBlock
            | ErrorKind::TimedOut
            | ErrorKind::Interrupted
    )
}
