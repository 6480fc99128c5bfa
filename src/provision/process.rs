//! Lifecycle tracking for the server subprocess this crate spawns itself

use log::{debug, info, warn};
use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Sent by a watcher task once its process is gone.
#[derive(Debug)]
pub(crate) struct ProcessExit {
    pub(crate) pid: u32,
    pub(crate) status: Option<ExitStatus>,
}

struct TrackedProcess {
    pid: u32,
    /// Carries the grace period for a polite shutdown before the kill.
    stop: oneshot::Sender<Duration>,
    exited: watch::Receiver<bool>,
    watcher: JoinHandle<()>,
}

pub(crate) struct ProcessTracker {
    tracked: Mutex<Option<TrackedProcess>>,
    exits_tx: mpsc::UnboundedSender<ProcessExit>,
    exits_rx: Mutex<mpsc::UnboundedReceiver<ProcessExit>>,
}

impl ProcessTracker {
    pub(crate) fn new() -> Self {
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        Self {
            tracked: Mutex::new(None),
            exits_tx,
            exits_rx: Mutex::new(exits_rx),
        }
    }

    /// Spawn `program` in the background and watch it for `grace`.
    ///
    /// Returns the pid when the process is still alive afterwards, `None` when
    /// it exited within the grace period.
    pub(crate) async fn spawn(
        &self,
        program: &Path,
        args: &[String],
        grace: Duration,
    ) -> io::Result<Option<u32>> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        let Some(pid) = child.id() else {
            return Ok(None);
        };

        let (stop_tx, stop_rx) = oneshot::channel();
        let (exited_tx, mut exited_rx) = watch::channel(false);
        let exits_tx = self.exits_tx.clone();
        let watcher = tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status.ok(),
                Ok(grace) = stop_rx => shut_down(&mut child, pid, grace).await,
            };
            info!("runtime_exit: pid={} status={:?}", pid, status);
            let _ = exited_tx.send(true);
            let _ = exits_tx.send(ProcessExit { pid, status });
        });

        if timeout(grace, exited_rx.wait_for(|exited| *exited))
            .await
            .is_ok()
        {
            warn!("runtime_exited_early: pid={} grace_ms={}", pid, grace.as_millis());
            self.reap();
            return Ok(None);
        }

        let previous = self.lock_tracked().replace(TrackedProcess {
            pid,
            stop: stop_tx,
            exited: exited_rx,
            watcher,
        });
        if let Some(previous) = previous {
            // Still running, but no longer ours to stop.
            debug!("runtime_untracked: pid={}", previous.pid);
        }
        Ok(Some(pid))
    }

    /// Pid of the tracked process while it is still running.
    pub(crate) fn tracked_pid(&self) -> Option<u32> {
        self.reap();
        self.lock_tracked()
            .as_ref()
            .filter(|process| !*process.exited.borrow())
            .map(|process| process.pid)
    }

    /// Stop the tracked process, politely first. Returns `false` when none was tracked.
    pub(crate) async fn terminate(&self, grace: Duration) -> bool {
        let tracked = self.lock_tracked().take();
        let Some(process) = tracked else {
            return false;
        };
        info!("runtime_terminate: pid={}", process.pid);
        let _ = process.stop.send(grace);
        // The watcher kills after `grace`, so this only waits for the reap.
        if timeout(grace + Duration::from_secs(5), process.watcher)
            .await
            .is_err()
        {
            warn!("runtime_terminate_timeout: pid={}", process.pid);
        }
        self.reap();
        true
    }

    /// Apply pending exit messages, clearing the tracked process if it is gone.
    pub(crate) fn reap(&self) {
        let mut exits = Vec::new();
        {
            let mut rx = self.exits_rx.lock().unwrap_or_else(PoisonError::into_inner);
            while let Ok(exit) = rx.try_recv() {
                debug!("runtime_reaped: pid={} status={:?}", exit.pid, exit.status);
                exits.push(exit);
            }
        }
        if !exits.is_empty() {
            let mut tracked = self.lock_tracked();
            if tracked
                .as_ref()
                .is_some_and(|process| exits.iter().any(|exit| exit.pid == process.pid))
            {
                *tracked = None;
            }
        }
    }

    fn lock_tracked(&self) -> MutexGuard<'_, Option<TrackedProcess>> {
        self.tracked.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn shut_down(child: &mut Child, pid: u32, grace: Duration) -> Option<ExitStatus> {
    if send_terminate(pid) {
        if let Ok(status) = timeout(grace, child.wait()).await {
            return status.ok();
        }
        warn!("runtime_kill: pid={} reason=grace_elapsed", pid);
    }
    if let Err(e) = child.kill().await {
        warn!("runtime_kill: pid={} error={}", pid, e);
    }
    child.wait().await.ok()
}

/// SIGTERM the child. `false` means go straight to the kill.
#[cfg(unix)]
fn send_terminate(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: `pid` is our own unreaped child, so it cannot have been recycled.
    unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
fn send_terminate(_pid: u32) -> bool {
    false
}

/// Best-effort kill of every process called `name`, including ones started
/// outside this tracker.
pub(crate) async fn kill_by_name(name: &str) {
    #[cfg(unix)]
    let mut command = {
        let mut command = Command::new("pkill");
        command.args(["-x", name]);
        command
    };
    #[cfg(not(unix))]
    let mut command = {
        let mut command = Command::new("taskkill");
        command.args(["/F", "/IM", &format!("{}.exe", name)]);
        command
    };

    let result = command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match result {
        Ok(status) if status.success() => info!("runtime_kill_by_name: {} killed=true", name),
        // pkill exits 1 when nothing matched.
        Ok(status) => debug!("runtime_kill_by_name: {} status={}", name, status),
        Err(e) => warn!("runtime_kill_by_name: {} error={}", name, e),
    }
}
