//! Busy detection for a session's agent process.
//!
//! A session counts as busy while its process burns CPU or has child
//! processes (a tool or shell command is running). Reminders for a busy
//! session are skipped: the prompt was evidently answered.

use std::thread;
use std::time::Duration;
use sysinfo::{Pid, System, MINIMUM_CPU_UPDATE_INTERVAL};
use tracing::debug;

/// Default CPU window for [`ProcessActivity`].
pub const DEFAULT_CPU_SAMPLE: Duration = Duration::from_millis(500);

/// Decides whether the process behind a session is busy.
pub trait BusyCheck: Send + Sync {
    fn is_busy(&self, pid: u32) -> bool;
}

impl<F> BusyCheck for F
where
    F: Fn(u32) -> bool + Send + Sync,
{
    fn is_busy(&self, pid: u32) -> bool {
        self(pid)
    }
}

/// CPU usage and direct child count of one process.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Activity {
    pub cpu_percent: f32,
    pub children: usize,
}

/// Measure `pid` over `window`. `None` if the process does not exist.
pub fn sample(pid: u32, window: Duration) -> Option<Activity> {
    let target = Pid::from_u32(pid);
    let mut sys = System::new_all();
    sys.process(target)?;

    // CPU usage is the delta between two refreshes
    thread::sleep(window.max(MINIMUM_CPU_UPDATE_INTERVAL));
    sys.refresh_all();

    let cpu_percent = sys.process(target)?.cpu_usage();
    let children = sys
        .processes()
        .values()
        .filter(|p| p.parent() == Some(target) && p.thread_kind().is_none())
        .count();

    Some(Activity {
        cpu_percent,
        children,
    })
}

/// [`BusyCheck`] backed by a live `sysinfo` sample.
#[derive(Debug, Clone)]
pub struct ProcessActivity {
    cpu_threshold: f32,
    window: Duration,
}

impl ProcessActivity {
    pub fn new(cpu_threshold: f32) -> Self {
        Self {
            cpu_threshold,
            window: DEFAULT_CPU_SAMPLE,
        }
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }
}

impl BusyCheck for ProcessActivity {
    fn is_busy(&self, pid: u32) -> bool {
        let Some(activity) = sample(pid, self.window) else {
            return false;
        };
        let busy = activity.cpu_percent > self.cpu_threshold || activity.children > 0;
        debug!(
            pid,
            cpu = activity.cpu_percent,
            children = activity.children,
            busy,
            "Busy check"
        );
        busy
    }
}
