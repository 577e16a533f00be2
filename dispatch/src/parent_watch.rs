//! Polls the host process named by `--host-process-id` and signals when it
//! is gone.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct ParentWatcher {
    gone: CancellationToken,
    task: JoinHandle<()>,
}

impl ParentWatcher {
    pub fn spawn(pid: u32, interval: Duration) -> Self {
        let gone = CancellationToken::new();
        let cancel = gone.clone();
        // Reparenting also means the host is gone, even if its pid was reused.
        let was_direct_parent = parent_pid() == Some(pid);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let alive = process_alive(pid) && (!was_direct_parent || parent_pid() == Some(pid));
                if !alive {
                    break;
                }
            }
            tracing::debug!("host process {pid} is gone");
            cancel.cancel();
        });
        Self { gone, task }
    }

    pub fn gone(&self) -> CancellationToken {
        self.gone.clone()
    }
}

impl Drop for ParentWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn parent_pid() -> Option<u32> {
    u32::try_from(unsafe { libc::getppid() }).ok()
}

/// `kill(pid, 0)` checks for existence without delivering a signal. `EPERM`
/// means the process exists but belongs to someone else.
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}
