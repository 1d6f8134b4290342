//! Request dispatch: the only place socket commands touch daemon state.

use crate::daemon::protocol::{
    validate_stages, AddReply, CancelReply, CommandError, PingReply, Request, Response,
    SessionReply, Stage, StatusReport,
};
use crate::daemon::state::Shared;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Applies requests to the shared state. Cheap to clone into each connection.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
    default_stages: Arc<[Stage]>,
}

impl Dispatcher {
    pub fn new(shared: Arc<Shared>, default_stages: Arc<[Stage]>) -> Self {
        Self {
            shared,
            default_stages,
        }
    }

    /// Apply one request and build its response.
    pub fn dispatch(&self, request: Request) -> Response {
        let command = request.name();
        match self.apply(request) {
            Ok(response) => response,
            Err(e) => {
                warn!(command, "Request rejected: {e}");
                Response::failure(e.to_string())
            }
        }
    }

    fn apply(&self, request: Request) -> Result<Response, CommandError> {
        match request {
            Request::Add { id, message, stages } => self.add(id, message, stages),
            Request::Cancel { id } => Ok(self.cancel(id)),
            Request::Status => Ok(self.status()),
            Request::RegisterSession { session_id, pid } => self.register(session_id, pid),
            Request::UnregisterSession { session_id } => Ok(self.unregister(session_id)),
            Request::Ping => Ok(self.ping()),
            Request::Shutdown => Ok(self.shutdown()),
        }
    }

    fn add(
        &self,
        id: String,
        message: String,
        stages: Option<Vec<Stage>>,
    ) -> Result<Response, CommandError> {
        if id.is_empty() {
            return Err(CommandError::InvalidRequest {
                command: "add".to_string(),
                reason: "`id` must not be empty".to_string(),
            });
        }
        let stages = match stages {
            Some(stages) => stages,
            None => self.default_stages.to_vec(),
        };
        validate_stages(&stages)?;

        let mut state = self.shared.lock();
        if !state.is_listening() {
            return Err(CommandError::ShuttingDown);
        }
        let outcome = state.store.add(&id, &message, &stages, Instant::now());
        drop(state);
        self.shared.notify();

        info!(
            id = %id,
            stages = outcome.stages,
            superseded = outcome.superseded,
            "Escalation added"
        );
        Ok(reply(&AddReply {
            id,
            stages: outcome.stages,
            superseded: outcome.superseded,
        }))
    }

    fn cancel(&self, id: String) -> Response {
        let cancelled = self.shared.lock().store.cancel(&id);
        if cancelled {
            self.shared.notify();
        }
        info!(id = %id, cancelled, "Escalation cancel");
        reply(&CancelReply { id, cancelled })
    }

    fn status(&self) -> Response {
        let state = self.shared.lock();
        let report = StatusReport {
            phase: state.phase(),
            pending: state.store.snapshot(Instant::now()),
            sessions: state.sessions.snapshot(Utc::now()),
            session_count: state.sessions.count(),
        };
        drop(state);
        debug!(
            pending = report.pending.len(),
            sessions = report.session_count,
            "Status requested"
        );
        reply(&report)
    }

    fn register(
        &self,
        session_id: Option<String>,
        pid: Option<u32>,
    ) -> Result<Response, CommandError> {
        let session_id = match session_id {
            Some(id) if id.is_empty() => {
                return Err(CommandError::InvalidRequest {
                    command: "register_session".to_string(),
                    reason: "`session_id` must not be empty".to_string(),
                })
            }
            Some(id) => id,
            None => format!("session-{}", Uuid::new_v4()),
        };

        let mut state = self.shared.lock();
        if !state.is_listening() {
            return Err(CommandError::ShuttingDown);
        }
        let added = state.sessions.register(&session_id, pid);
        let session_count = state.sessions.count();
        drop(state);

        if added {
            info!(session_id = %session_id, ?pid, session_count, "Session registered");
        } else {
            info!(session_id = %session_id, ?pid, session_count, "Session re-registered");
        }
        Ok(reply(&SessionReply {
            session_id: Some(session_id),
            session_count,
            shutting_down: false,
        }))
    }

    fn unregister(&self, session_id: Option<String>) -> Response {
        let mut state = self.shared.lock();
        let removed = state.sessions.unregister(session_id.as_deref());
        let session_count = state.sessions.count();

        let shutting_down = match &removed {
            Some(_) if session_count == 0 => state.begin_drain("last session unregistered"),
            _ => false,
        };
        drop(state);

        match &removed {
            Some(id) => info!(session_id = %id, session_count, "Session unregistered"),
            None => info!(
                requested = ?session_id,
                session_count,
                "Unregister matched no session"
            ),
        }
        if shutting_down {
            self.shared.notify();
        }

        reply(&SessionReply {
            session_id: removed,
            session_count,
            shutting_down,
        })
    }

    fn ping(&self) -> Response {
        reply(&PingReply {
            pid: std::process::id(),
            phase: self.shared.phase(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    fn shutdown(&self) -> Response {
        let started = self.shared.drain("shutdown requested");
        Response::success(json!({ "shutting_down": started }))
    }
}

fn reply<T: Serialize>(data: &T) -> Response {
    match serde_json::to_value(data) {
        Ok(value) => Response::success(value),
        Err(e) => Response::failure(format!("failed to encode response: {e}")),
    }
}
