//! Attached-session registry. Its size is the daemon's reference count.

use super::protocol::SessionSnapshot;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub pid: Option<u32>,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, SessionInfo>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `session_id`. Returns `true` if it was not attached before.
    ///
    /// Re-registering keeps the original registration time and only refreshes
    /// the tracked pid when a new one is supplied.
    pub fn register(&mut self, session_id: &str, pid: Option<u32>) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(existing) => {
                if pid.is_some() {
                    existing.pid = pid;
                }
                false
            }
            None => {
                self.sessions.insert(
                    session_id.to_string(),
                    SessionInfo {
                        pid,
                        registered_at: Utc::now(),
                    },
                );
                true
            }
        }
    }

    /// Detach a session. With no id, the oldest registration is removed.
    /// Returns the id that was actually removed, if any.
    pub fn unregister(&mut self, session_id: Option<&str>) -> Option<String> {
        match session_id {
            Some(id) => self.sessions.remove(id).map(|_| id.to_string()),
            None => {
                let oldest = self
                    .sessions
                    .iter()
                    .min_by(|a, b| a.1.registered_at.cmp(&b.1.registered_at).then(a.0.cmp(b.0)))
                    .map(|(id, _)| id.clone())?;
                self.sessions.remove(&oldest);
                Some(oldest)
            }
        }
    }

    /// Remove every session whose tracked pid `is_alive` rejects. Sessions
    /// without a pid are never reaped.
    pub fn reap(&mut self, is_alive: impl Fn(u32) -> bool) -> Vec<(String, u32)> {
        let dead: Vec<(String, u32)> = self
            .sessions
            .iter()
            .filter_map(|(id, info)| {
                let pid = info.pid?;
                (!is_alive(pid)).then(|| (id.clone(), pid))
            })
            .collect();

        for (id, _) in &dead {
            self.sessions.remove(id);
        }
        dead
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Tracked pid of `session_id`, if it registered one.
    pub fn pid_of(&self, session_id: &str) -> Option<u32> {
        self.sessions.get(session_id).and_then(|info| info.pid)
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> Vec<SessionSnapshot> {
        let mut sessions: Vec<SessionSnapshot> = self
            .sessions
            .iter()
            .map(|(id, info)| SessionSnapshot {
                session_id: id.clone(),
                pid: info.pid,
                registered_at: info.registered_at,
                age_secs: (now - info.registered_at).num_seconds().max(0),
            })
            .collect();
        sessions.sort_by(|a, b| {
            a.registered_at
                .cmp(&b.registered_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        sessions
    }
}
