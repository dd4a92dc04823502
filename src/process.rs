//! Child process supervision
//!
//! Everything a phase spawns is registered with a [`ChildTracker`] so it can be
//! stopped when the phase ends. [`ProcessGroup`] additionally makes the phase its
//! own process group, so grandchildren that escaped tracking are signalled too.

use parking_lot::Mutex;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Log target for lines read from child processes
pub const CHILD_LOG_TARGET: &str = "ctfgate::child";

/// Configure `cmd` so its output can be forwarded with [`forward_output`]
pub fn prepare_command(cmd: &mut Command) {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);
}

/// Log every stdout line at info and every stderr line at warn, tagged with `label`
pub fn forward_output(child: &mut Child, label: &str) {
    if let Some(stdout) = child.stdout.take() {
        let label = label.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => info!(target: CHILD_LOG_TARGET, process = %label, "{}", line),
                    Ok(None) => break,
                    Err(e) => {
                        warn!(process = %label, error = %e, "Error reading stdout");
                        break;
                    }
                }
            }
        });
    }

    if let Some(stderr) = child.stderr.take() {
        let label = label.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => warn!(target: CHILD_LOG_TARGET, process = %label, "{}", line),
                    Ok(None) => break,
                    Err(e) => {
                        warn!(process = %label, error = %e, "Error reading stderr");
                        break;
                    }
                }
            }
        });
    }
}

/// Stop a child: SIGTERM, wait up to `grace_period`, then SIGKILL.
///
/// The child is always reaped before returning.
pub async fn terminate(label: &str, child: &mut Child, grace_period: Duration) {
    match child.try_wait() {
        Ok(Some(status)) => {
            debug!(process = label, ?status, "Process already exited");
            return;
        }
        Ok(None) => {}
        Err(e) => warn!(process = label, error = %e, "Failed to poll process status"),
    }

    if let Some(pid) = child.id() {
        info!(process = label, pid, "Sending SIGTERM");

        #[cfg(unix)]
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }

        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
    }

    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(Ok(status)) => {
            info!(process = label, ?status, "Process exited");
        }
        Ok(Err(e)) => {
            warn!(process = label, error = %e, "Error waiting for process to exit");
        }
        Err(_) => {
            warn!(
                process = label,
                grace_period_ms = grace_period.as_millis(),
                "Grace period exceeded, sending SIGKILL"
            );
            let _ = child.kill().await;
        }
    }
}

/// True if a process with this pid exists and has not exited
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    if unsafe { libc::kill(pid as i32, 0) } != 0 {
        return false;
    }
    // Zombies still accept signal 0
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => !stat
            .rsplit(')')
            .next()
            .is_some_and(|rest| rest.trim_start().starts_with('Z')),
        Err(_) => true,
    }
}

struct TrackedChild {
    label: String,
    child: Child,
}

/// Children spawned during a phase, stopped together when it ends
#[derive(Default)]
pub struct ChildTracker {
    children: Mutex<Vec<TrackedChild>>,
}

impl ChildTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `child`. Returns its pid (0 if it already exited).
    pub fn track(&self, label: impl Into<String>, child: Child) -> u32 {
        let pid = child.id().unwrap_or(0);
        let label = label.into();
        debug!(process = %label, pid, "Tracking child process");
        self.children.lock().push(TrackedChild { label, child });
        pid
    }

    pub fn len(&self) -> usize {
        self.children.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.lock().is_empty()
    }

    pub fn pids(&self) -> Vec<u32> {
        self.children
            .lock()
            .iter()
            .filter_map(|c| c.child.id())
            .collect()
    }

    /// Stop every tracked child, most recent first
    pub async fn terminate_all(&self, grace_period: Duration) {
        let mut children = std::mem::take(&mut *self.children.lock());
        if children.is_empty() {
            return;
        }
        info!(count = children.len(), "Stopping tracked processes");
        while let Some(mut tracked) = children.pop() {
            terminate(&tracked.label, &mut tracked.child, grace_period).await;
        }
    }

    /// Best-effort synchronous kill, for paths that cannot await
    pub fn kill_all_now(&self) {
        for tracked in self.children.lock().iter_mut() {
            if let Err(e) = tracked.child.start_kill() {
                debug!(process = %tracked.label, error = %e, "Kill failed");
            }
        }
    }
}

/// Membership of the current process in its own process group.
///
/// [`ProcessGroup::isolate`] makes this process a group leader so every
/// descendant inherits the group. [`ProcessGroup::signal_all`] terminates the
/// whole group, but only when this process really leads it.
#[derive(Debug)]
pub struct ProcessGroup {
    leader: bool,
}

impl ProcessGroup {
    /// A group handle that never signals anything
    pub fn detached() -> Self {
        Self { leader: false }
    }

    #[cfg(unix)]
    pub fn isolate() -> Self {
        let (pid, before) = unsafe { (libc::getpid(), libc::getpgrp()) };
        // EPERM here means we already lead a session, and with it a group
        if unsafe { libc::setpgid(0, 0) } != 0 {
            debug!(error = %std::io::Error::last_os_error(), "setpgid failed");
        }
        let pgid = unsafe { libc::getpgrp() };
        let leader = pgid == pid;
        info!(pid, pgid, previous_pgid = before, leader, "Process group established");
        Self { leader }
    }

    #[cfg(not(unix))]
    pub fn isolate() -> Self {
        Self::detached()
    }

    pub fn is_leader(&self) -> bool {
        self.leader
    }

    /// Send SIGTERM to every process in the group.
    ///
    /// This process ignores the signal it sends itself. Errors are logged, never
    /// returned.
    #[cfg(unix)]
    pub fn signal_all(&self) {
        if !self.leader {
            return;
        }
        info!("Killing all processes in group");
        unsafe {
            libc::signal(libc::SIGTERM, libc::SIG_IGN);
            if libc::killpg(0, libc::SIGTERM) != 0 {
                debug!(error = %std::io::Error::last_os_error(), "killpg failed");
            }
        }
    }

    #[cfg(not(unix))]
    pub fn signal_all(&self) {}
}
