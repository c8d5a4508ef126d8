//! Process-group termination.
//!
//! Every child is spawned as the leader of its own process group, so a
//! program that forks helpers cannot outlive a kill. All signal delivery goes
//! through [`ProcessGroup`].

use std::io;
use std::process::ExitStatus;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::process::Child;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessGroup {
    pgid: Pid,
}

impl ProcessGroup {
    /// Group led by `child`, or `None` if it has already been reaped.
    pub fn of(child: &Child) -> Option<Self> {
        child.id().map(|pid| Self {
            pgid: Pid::from_raw(pid as i32),
        })
    }

    pub fn id(&self) -> i32 {
        self.pgid.as_raw()
    }

    /// Deliver `signal` to every member. Returns `false` when the group no
    /// longer exists.
    pub fn signal(&self, signal: Signal) -> io::Result<bool> {
        match killpg(self.pgid, signal) {
            Ok(()) => Ok(true),
            Err(Errno::ESRCH) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn is_alive(&self) -> bool {
        matches!(killpg(self.pgid, None), Ok(()) | Err(Errno::EPERM))
    }

    /// SIGKILL anything still in the group, e.g. background helpers left
    /// behind after the leader exited.
    pub fn kill_stragglers(&self) {
        match self.signal(Signal::SIGKILL) {
            Ok(true) => debug!(pgid = self.id(), "Killed leftover group members"),
            Ok(false) => {}
            Err(e) => warn!(pgid = self.id(), error = %e, "Failed to kill leftover group members"),
        }
    }
}

/// Stop `child` and its group: SIGTERM, wait up to `grace`, then SIGKILL.
/// Always reaps the leader before returning.
pub async fn terminate(
    child: &mut Child,
    group: ProcessGroup,
    grace: Duration,
) -> io::Result<ExitStatus> {
    if let Ok(Some(status)) = child.try_wait() {
        group.kill_stragglers();
        return Ok(status);
    }

    if let Err(e) = group.signal(Signal::SIGTERM) {
        warn!(pgid = group.id(), error = %e, "SIGTERM failed, escalating");
    }
    let status = match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status?,
        Err(_) => {
            debug!(pgid = group.id(), "Grace period elapsed, sending SIGKILL");
            if !group.signal(Signal::SIGKILL)? {
                // Group vanished between the checks; only the leader can remain.
                child.start_kill().ok();
            }
            child.wait().await?
        }
    };
    group.kill_stragglers();
    Ok(status)
}
