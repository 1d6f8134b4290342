//! Dead-session sweeper.

use crate::daemon::state::Shared;
use crate::process::is_process_alive;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Spawn the thread that auto-unregisters sessions whose PID has exited.
///
/// If a sweep removes the last session the daemon drains, exactly as if that
/// session had unregistered itself.
pub fn spawn_reaper(shared: Arc<Shared>, interval: Duration) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("escalate-reaper".to_string())
        .spawn(move || run_reaper(&shared, interval, is_process_alive))
}

pub(super) fn run_reaper(shared: &Shared, interval: Duration, is_alive: impl Fn(u32) -> bool) {
    let mut next_sweep = Instant::now() + interval;
    let mut state = shared.lock();

    while state.is_listening() {
        let now = Instant::now();
        if now < next_sweep {
            // Woken early by an unrelated state change
            state = shared.wait(state, Some(next_sweep - now));
            continue;
        }
        next_sweep = now + interval;

        let dead = state.sessions.reap(&is_alive);
        if dead.is_empty() {
            continue;
        }
        for (session_id, pid) in &dead {
            info!(session_id = %session_id, pid, "Auto-unregistered dead session");
        }
        if state.sessions.is_empty() && state.begin_drain("all sessions exited") {
            shared.notify();
        }
    }

    debug!("Reaper stopping");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::protocol::DaemonPhase;

    fn listening() -> Arc<Shared> {
        let shared = Arc::new(Shared::new());
        shared.lock().set_phase(DaemonPhase::Listening);
        shared
    }

    #[test]
    fn test_dead_sessions_are_removed_and_last_one_drains() {
        let shared = listening();
        {
            let mut state = shared.lock();
            state.sessions.register("alive", Some(1));
            state.sessions.register("dead", Some(2));
        }

        let worker = Arc::clone(&shared);
        let handle = thread::spawn(move || {
            run_reaper(&worker, Duration::from_millis(20), |pid| pid == 1)
        });

        thread::sleep(Duration::from_millis(150));
        {
            let state = shared.lock();
            assert!(state.sessions.contains("alive"));
            assert!(!state.sessions.contains("dead"));
            assert!(state.is_listening());
        }

        // Once the remaining session also dies the sweep drains the daemon
        shared.lock().sessions.register("alive", Some(3));
        handle.join().unwrap();
        assert_eq!(shared.phase(), DaemonPhase::Draining);
    }

    #[test]
    fn test_sessions_without_pid_are_kept() {
        let shared = listening();
        shared.lock().sessions.register("manual", None);

        let worker = Arc::clone(&shared);
        let handle = thread::spawn(move || run_reaper(&worker, Duration::from_millis(10), |_| false));

        thread::sleep(Duration::from_millis(80));
        assert!(shared.lock().sessions.contains("manual"));

        shared.drain("test");
        handle.join().unwrap();
    }
}
