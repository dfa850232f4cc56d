//! Unix process-group signalling.
//!
//! Workers are spawned into their own process group, so termination targets
//! the whole group and reaches anything the worker itself forked. Orphan
//! reconciliation probes PIDs recorded by a previous server run with
//! signal 0.

use std::time::Duration;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

/// Signal-0 existence probe.
pub fn alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// SIGTERM the process group now; escalate to SIGKILL after the grace
/// period if the leader is still running.
pub fn terminate_with_grace(pid: u32, grace: Duration) {
    let group = Pid::from_raw(-(pid as i32));
    if let Err(error) = kill(group, Signal::SIGTERM) {
        // Fall back to the single process when the group is already gone.
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        tracing::debug!(pid, error = %error, "group SIGTERM failed, signalled leader only");
    }

    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        if alive(pid) {
            tracing::warn!(pid, "worker ignored SIGTERM, escalating to SIGKILL");
            if kill(group, Signal::SIGKILL).is_err() {
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_pid_is_alive() {
        assert!(alive(std::process::id()));
    }

    #[test]
    fn implausible_pid_is_not_alive() {
        // PID numbers wrap long before this value.
        assert!(!alive(i32::MAX as u32));
    }
}
