//! Process helpers: liveness checks for tracked sessions and locating the
//! agent process a hook was launched from.

mod activity;

pub use activity::{sample, Activity, BusyCheck, ProcessActivity, DEFAULT_CPU_SAMPLE};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::process::Command;

/// Upper bound on ancestors inspected by [`find_ancestor_pid`].
const MAX_ANCESTOR_DEPTH: usize = 32;

/// Check if a process with the given PID is alive.
///
/// Sends the null signal: `EPERM` still means the process exists, `ESRCH`
/// means it is gone. PIDs that do not fit in `pid_t` are never alive.
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        // 0 and negatives address process groups, not a single process
        return false;
    }

    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Walk up from `start` looking for a process whose command name contains
/// `needle` (case-insensitive). Returns `None` if no ancestor matches.
pub fn find_ancestor_pid(start: u32, needle: &str) -> Option<u32> {
    let needle = needle.to_lowercase();
    let mut pid = start;
    let mut visited = Vec::new();

    while pid > 1 && !visited.contains(&pid) && visited.len() < MAX_ANCESTOR_DEPTH {
        visited.push(pid);
        let (comm, ppid) = command_and_parent(pid)?;
        if comm.to_lowercase().contains(&needle) {
            return Some(pid);
        }
        pid = ppid;
    }
    None
}

/// PID of the coding agent that ran this hook: the nearest `claude` ancestor,
/// else the direct parent.
pub fn agent_pid() -> u32 {
    let parent = std::os::unix::process::parent_id();
    find_ancestor_pid(parent, "claude").unwrap_or(parent)
}

/// `(command name, parent pid)` as reported by `ps`.
fn command_and_parent(pid: u32) -> Option<(String, u32)> {
    let output = Command::new("ps")
        .args(["-o", "comm=,ppid=", "-p", &pid.to_string()])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    parse_ps_line(&String::from_utf8_lossy(&output.stdout))
}

/// Parse `comm ppid`. The command name may contain spaces, the ppid is the
/// last field.
fn parse_ps_line(line: &str) -> Option<(String, u32)> {
    let line = line.trim();
    let (comm, ppid) = line.rsplit_once(char::is_whitespace)?;
    let ppid = ppid.trim().parse().ok()?;
    Some((comm.trim().to_string(), ppid))
}
