//! Timer thread and delivery worker.
//!
//! The timer thread sleeps on the shared condition variable until the next
//! live deadline, pops due stages under the state lock and hands them to the
//! delivery worker over a channel. Delivery runs outside the lock, so a slow or
//! failing notifier never holds up other timers or socket dispatch.

use super::state::Shared;
use super::store::Firing;
use crate::notify::{Notification, Notifier, Titles};
use crate::process::BusyCheck;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// How fired stages reach the user.
#[derive(Clone)]
pub struct Delivery {
    pub notifier: Arc<dyn Notifier>,
    pub titles: Titles,
    /// Consulted before each push when the session has a tracked pid;
    /// `None` disables busy suppression.
    pub busy: Option<Arc<dyn BusyCheck>>,
}

/// What happened to one fired stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivered {
    Sent,
    Failed,
    /// The session's process was busy, so the reminder was dropped
    SkippedBusy,
}

impl Delivery {
    pub fn new(notifier: Arc<dyn Notifier>, titles: Titles) -> Self {
        Self {
            notifier,
            titles,
            busy: None,
        }
    }

    pub fn with_busy_check(mut self, busy: Option<Arc<dyn BusyCheck>>) -> Self {
        self.busy = busy;
        self
    }

    /// Deliver one fired stage. Failures are logged and swallowed.
    pub fn deliver(&self, firing: &Firing) -> Delivered {
        if let (Some(busy), Some(pid)) = (&self.busy, firing.session_pid) {
            if busy.is_busy(pid) {
                info!(
                    id = %firing.id,
                    stage = firing.stage_index + 1,
                    pid,
                    "Session busy; notification skipped"
                );
                return Delivered::SkippedBusy;
            }
        }

        let notification = Notification {
            escalation_id: firing.id.clone(),
            title: self.titles.for_priority(firing.priority).to_string(),
            message: firing.message.clone(),
            priority: firing.priority,
        };

        match self.notifier.deliver(&notification) {
            Ok(()) => {
                info!(
                    id = %firing.id,
                    stage = firing.stage_index + 1,
                    of = firing.stage_count,
                    priority = firing.priority,
                    "Notification sent"
                );
                Delivered::Sent
            }
            Err(e) => {
                warn!(
                    id = %firing.id,
                    stage = firing.stage_index + 1,
                    of = firing.stage_count,
                    priority = firing.priority,
                    "Notification failed: {e}"
                );
                Delivered::Failed
            }
        }
    }
}

/// Handles for the scheduler's threads.
pub struct Scheduler {
    timer: JoinHandle<()>,
    delivery: JoinHandle<()>,
}

impl Scheduler {
    /// Start both threads. They run until the daemon leaves `Listening`.
    pub fn spawn(shared: Arc<Shared>, delivery: Delivery) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel();

        let worker = thread::Builder::new()
            .name("escalate-delivery".to_string())
            .spawn(move || run_delivery(rx, delivery))?;

        let timer = thread::Builder::new()
            .name("escalate-timers".to_string())
            .spawn(move || run_timers(shared, tx))?;

        Ok(Self {
            timer,
            delivery: worker,
        })
    }

    /// Wait for both threads. The caller must already have moved the daemon
    /// out of `Listening` (and notified), or this blocks forever.
    pub fn join(self) {
        if self.timer.join().is_err() {
            error!("Timer thread panicked");
        }
        // The timer thread owned the only sender, so the worker finishes any
        // in-flight deliveries and then sees the channel close.
        if self.delivery.join().is_err() {
            error!("Delivery thread panicked");
        }
    }
}

fn run_timers(shared: Arc<Shared>, tx: Sender<Firing>) {
    debug!("Timer thread started");
    let mut state = shared.lock();

    while state.is_listening() {
        let now = Instant::now();
        let due = state.store.take_due(now);

        if !due.is_empty() {
            for mut firing in due {
                firing.session_pid = state.sessions.pid_of(&firing.id);
                debug!(
                    id = %firing.id,
                    stage = firing.stage_index,
                    priority = firing.priority,
                    "Stage due"
                );
                if tx.send(firing).is_err() {
                    warn!("Delivery worker is gone; stage dropped");
                }
            }
            continue;
        }

        let timeout = state
            .store
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(now));
        state = shared.wait(state, timeout);
    }

    debug!(phase = %state.phase(), "Timer thread stopping");
}

fn run_delivery(rx: Receiver<Firing>, delivery: Delivery) {
    for firing in rx {
        delivery.deliver(&firing);
    }
}
