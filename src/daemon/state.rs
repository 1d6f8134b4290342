//! The daemon's single serialization point.
//!
//! Everything mutable (escalations, timers, sessions, lifecycle phase) lives in
//! one [`DaemonState`] behind one mutex. Connection workers, the scheduler and
//! the session reaper only ever see it through [`Shared::lock`].

use super::protocol::DaemonPhase;
use super::sessions::SessionRegistry;
use super::store::EscalationStore;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::info;

#[derive(Debug)]
pub struct DaemonState {
    pub store: EscalationStore,
    pub sessions: SessionRegistry,
    phase: DaemonPhase,
}

impl DaemonState {
    pub fn new() -> Self {
        Self {
            store: EscalationStore::new(),
            sessions: SessionRegistry::new(),
            phase: DaemonPhase::Starting,
        }
    }

    pub fn phase(&self) -> DaemonPhase {
        self.phase
    }

    pub fn is_listening(&self) -> bool {
        self.phase == DaemonPhase::Listening
    }

    /// Move to `Draining` and drop un-fired stages. Returns `false` if the
    /// daemon was already draining or stopped.
    pub fn begin_drain(&mut self, reason: &str) -> bool {
        if matches!(self.phase, DaemonPhase::Draining | DaemonPhase::Stopped) {
            return false;
        }
        let dropped = self.store.clear();
        info!(reason, dropped_escalations = dropped, "Daemon draining");
        self.phase = DaemonPhase::Draining;
        true
    }

    pub(crate) fn set_phase(&mut self, phase: DaemonPhase) {
        self.phase = phase;
    }
}

impl Default for DaemonState {
    fn default() -> Self {
        Self::new()
    }
}

/// State plus the condition variable the scheduler sleeps on.
#[derive(Debug, Default)]
pub struct Shared {
    state: Mutex<DaemonState>,
    wakeup: Condvar,
}

impl Shared {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the state. A worker that panicked mid-update does not take the
    /// daemon down with it; the table is still structurally valid.
    pub fn lock(&self) -> MutexGuard<'_, DaemonState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wake everything waiting on state changes (scheduler, reaper).
    pub fn notify(&self) {
        self.wakeup.notify_all();
    }

    /// Block until notified or `timeout` elapses; `None` waits indefinitely.
    pub fn wait<'a>(
        &self,
        guard: MutexGuard<'a, DaemonState>,
        timeout: Option<Duration>,
    ) -> MutexGuard<'a, DaemonState> {
        match timeout {
            Some(timeout) => {
                self.wakeup
                    .wait_timeout(guard, timeout)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
            None => self
                .wakeup
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner),
        }
    }

    pub fn phase(&self) -> DaemonPhase {
        self.lock().phase()
    }

    /// Start draining and wake every waiter so they notice.
    pub fn drain(&self, reason: &str) -> bool {
        let started = self.lock().begin_drain(reason);
        self.notify();
        started
    }
}
