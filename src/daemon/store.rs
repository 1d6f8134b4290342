//! Escalation store: pending escalations and the timer heap that drives them.
//!
//! The store is plain data. It is only ever touched through
//! [`super::state::Shared`], which holds it behind the daemon's single mutex;
//! the scheduler thread and the connection workers all go through that lock.

use super::protocol::{PendingEscalation, Stage};
use chrono::{DateTime, Utc};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

/// An installed escalation.
#[derive(Debug, Clone)]
pub struct Escalation {
    pub id: String,
    pub message: String,
    pub stages: Vec<Stage>,
    pub created_at: DateTime<Utc>,
    /// Stamp shared with this installation's timers. A timer whose generation
    /// differs from the stored entry belongs to a cancelled or superseded
    /// installation.
    generation: u64,
    /// Un-fired stages, ordered by fire time.
    pending: Vec<PendingStage>,
}

impl Escalation {
    pub fn stages_remaining(&self) -> usize {
        self.pending.len()
    }

    pub fn next_fire_at(&self) -> Option<Instant> {
        self.pending.first().map(|stage| stage.fire_at)
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingStage {
    index: usize,
    fire_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Timer {
    fire_at: Instant,
    /// Insertion order, so equal deadlines fire in the order they were added.
    seq: u64,
    id: String,
    generation: u64,
    stage_index: usize,
}

impl Ord for Timer {
    fn cmp(&self, other: &Self) -> Ordering {
        self.fire_at
            .cmp(&other.fire_at)
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A stage that came due and should be handed to delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct Firing {
    pub id: String,
    pub message: String,
    pub priority: i8,
    pub stage_index: usize,
    pub stage_count: usize,
    /// True when this was the escalation's final stage and the entry is gone.
    pub completed: bool,
    /// Pid of the session sharing the escalation's id, filled in by the
    /// timer thread while it holds the state lock.
    pub session_pid: Option<u32>,
}

/// Result of [`EscalationStore::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddOutcome {
    pub superseded: bool,
    pub stages: usize,
}

#[derive(Debug, Default)]
pub struct EscalationStore {
    escalations: HashMap<String, Escalation>,
    timers: BinaryHeap<Reverse<Timer>>,
    next_generation: u64,
    next_seq: u64,
}

impl EscalationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install an escalation, scheduling every stage relative to `now`.
    ///
    /// An existing entry with the same id is superseded: its un-fired timers
    /// become stale and only the new installation's stages will fire.
    /// `stages` must already be validated.
    pub fn add(&mut self, id: &str, message: &str, stages: &[Stage], now: Instant) -> AddOutcome {
        let superseded = self.escalations.remove(id).is_some();

        self.next_generation += 1;
        let generation = self.next_generation;

        let mut pending: Vec<PendingStage> = stages
            .iter()
            .enumerate()
            .map(|(index, stage)| PendingStage {
                index,
                fire_at: now + Duration::from_secs_f64(stage.delay_secs),
            })
            .collect();
        pending.sort_by_key(|stage| (stage.fire_at, stage.index));

        for stage in &pending {
            self.next_seq += 1;
            self.timers.push(Reverse(Timer {
                fire_at: stage.fire_at,
                seq: self.next_seq,
                id: id.to_string(),
                generation,
                stage_index: stage.index,
            }));
        }

        self.escalations.insert(
            id.to_string(),
            Escalation {
                id: id.to_string(),
                message: message.to_string(),
                stages: stages.to_vec(),
                created_at: Utc::now(),
                generation,
                pending,
            },
        );

        AddOutcome {
            superseded,
            stages: stages.len(),
        }
    }

    /// Remove an escalation and strand its timers. Unknown ids are fine;
    /// returns whether anything was pending.
    pub fn cancel(&mut self, id: &str) -> bool {
        self.escalations.remove(id).is_some()
    }

    /// Drop everything; used when the daemon drains.
    pub fn clear(&mut self) -> usize {
        let dropped = self.escalations.len();
        self.escalations.clear();
        self.timers.clear();
        dropped
    }

    pub fn get(&self, id: &str) -> Option<&Escalation> {
        self.escalations.get(id)
    }

    pub fn len(&self) -> usize {
        self.escalations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.escalations.is_empty()
    }

    /// Earliest live deadline, discarding stale timers off the top of the heap.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse(timer)) = self.timers.peek() {
            if self.is_live(timer) {
                return Some(timer.fire_at);
            }
            self.timers.pop();
        }
        None
    }

    /// Pop every live timer due at or before `now`, advancing the owning
    /// escalations. Entries whose last stage fires are removed.
    pub fn take_due(&mut self, now: Instant) -> Vec<Firing> {
        let mut due = Vec::new();

        while let Some(Reverse(timer)) = self.timers.peek() {
            if timer.fire_at > now {
                break;
            }
            let Some(Reverse(timer)) = self.timers.pop() else {
                break;
            };
            if !self.is_live(&timer) {
                continue;
            }
            let Some(escalation) = self.escalations.get_mut(&timer.id) else {
                continue;
            };

            escalation
                .pending
                .retain(|stage| stage.index != timer.stage_index);
            let completed = escalation.pending.is_empty();
            let stage = escalation.stages[timer.stage_index];

            due.push(Firing {
                id: escalation.id.clone(),
                message: escalation.message.clone(),
                priority: stage.priority,
                stage_index: timer.stage_index,
                stage_count: escalation.stages.len(),
                completed,
                session_pid: None,
            });

            if completed {
                self.escalations.remove(&timer.id);
            }
        }

        due
    }

    /// Read-only view of what is still pending, ordered by next fire time.
    pub fn snapshot(&self, now: Instant) -> Vec<PendingEscalation> {
        let mut entries: Vec<(Instant, PendingEscalation)> = self
            .escalations
            .values()
            .filter_map(|escalation| {
                let next = escalation.next_fire_at()?;
                Some((
                    next,
                    PendingEscalation {
                        id: escalation.id.clone(),
                        message: escalation.message.clone(),
                        stages_remaining: escalation.stages_remaining(),
                        next_fire_in: next.saturating_duration_since(now).as_secs_f64(),
                    },
                ))
            })
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)));
        entries.into_iter().map(|(_, entry)| entry).collect()
    }

    fn is_live(&self, timer: &Timer) -> bool {
        self.escalations
            .get(&timer.id)
            .is_some_and(|escalation| escalation.generation == timer.generation)
    }
}
