//! Daemon process handle and teardown.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::stat::Mode;
use nix::unistd::{mkfifo, Pid};
use tokio::process::Child;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{AppError, Result};

/// File paths owned by one daemon: its FIFO pair plus a stderr log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FifoPair {
    /// FIFO the daemon reads requests from.
    pub request: PathBuf,
    /// FIFO the daemon writes responses and notifications to.
    pub response: PathBuf,
    /// Regular file capturing the daemon's stderr.
    pub log: PathBuf,
}

impl FifoPair {
    /// Paths for session `name` under `dir`, namespaced by `pr_number`.
    ///
    /// Each part is escaped so the result is always a single path component
    /// and distinct `(pr_number, name)` pairs never share a path: ASCII
    /// letters and digits are kept, every other byte becomes `_` followed by
    /// two lowercase hex digits.
    #[must_use]
    pub fn for_session(dir: &Path, pr_number: &str, name: &str) -> Self {
        let name = escape_component(name);
        let stem = if pr_number.trim().is_empty() {
            format!("droid-{name}")
        } else {
            format!("droid-{}-{name}", escape_component(pr_number))
        };
        Self {
            request: dir.join(format!("{stem}.req")),
            response: dir.join(format!("{stem}.resp")),
            log: dir.join(format!("{stem}.log")),
        }
    }

    /// Create both FIFOs (mode `0600`), replacing stale files.
    ///
    /// # Errors
    ///
    /// [`AppError::DaemonStart`] if a stale file cannot be removed or
    /// `mkfifo` fails.
    pub fn create(&self) -> Result<()> {
        for path in [&self.request, &self.response] {
            remove_if_present(path)
                .map_err(|e| AppError::DaemonStart(format!("stale fifo {}: {e}", path.display())))?;
            mkfifo(path.as_path(), Mode::S_IRUSR | Mode::S_IWUSR).map_err(|e| {
                AppError::DaemonStart(format!("mkfifo {}: {e}", path.display()))
            })?;
        }
        Ok(())
    }

    /// Remove both FIFOs. The log is kept for post-mortems.
    ///
    /// # Errors
    ///
    /// [`AppError::Io`] for removal failures other than "not found".
    pub fn remove(&self) -> Result<()> {
        remove_if_present(&self.request)?;
        remove_if_present(&self.response)?;
        Ok(())
    }
}

/// Handle to a daemon process owned by exactly one session.
#[derive(Debug)]
pub struct DaemonProcess {
    label: String,
    child: Option<Child>,
    fifos: Option<FifoPair>,
    terminated: bool,
}

impl DaemonProcess {
    /// Wrap a spawned child and the FIFO files it uses.
    #[must_use]
    pub fn spawned(label: impl Into<String>, child: Child, fifos: Option<FifoPair>) -> Self {
        Self {
            label: label.into(),
            child: Some(child),
            fifos,
            terminated: false,
        }
    }

    /// A daemon without an OS process, e.g. one served in-memory.
    #[must_use]
    pub fn detached(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            child: None,
            fifos: None,
            terminated: false,
        }
    }

    /// OS process id while the child is running.
    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// FIFO paths, if the daemon uses files.
    #[must_use]
    pub fn fifos(&self) -> Option<&FifoPair> {
        self.fifos.as_ref()
    }

    /// Whether [`terminate`](Self::terminate) has completed.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Non-blocking check whether the process is still running.
    ///
    /// Detached daemons count as running until terminated.
    pub fn is_running(&mut self) -> bool {
        if self.terminated {
            return false;
        }
        match self.child.as_mut() {
            None => true,
            Some(child) => matches!(child.try_wait(), Ok(None)),
        }
    }

    /// Ask the daemon to exit, force-killing it after `grace`.
    ///
    /// Sends `SIGTERM`, waits up to `grace` for the process to exit, then
    /// kills it. FIFO files are removed afterwards. Calling this again, or on
    /// a process that already exited, is a no-op.
    ///
    /// # Errors
    ///
    /// [`AppError::Io`] if the force-kill or FIFO removal fails. The handle
    /// is marked terminated regardless, so a retry does not signal twice.
    pub async fn terminate(&mut self, grace: Duration) -> Result<()> {
        if self.terminated {
            debug!(daemon = %self.label, "terminate: already terminated");
            return Ok(());
        }
        self.terminated = true;

        let span = info_span!("terminate_daemon", daemon = %self.label);
        let mut outcome = Ok(());

        if let Some(child) = self.child.as_mut() {
            if let Err(e) = stop_child(child, grace).instrument(span.clone()).await {
                outcome = Err(e);
            }
        }

        if let Some(fifos) = &self.fifos {
            if let Err(e) = fifos.remove() {
                warn!(parent: &span, error = %e, "failed to remove fifo files");
                outcome = outcome.and(Err(e));
            }
        }

        info!(parent: &span, "daemon terminated");
        outcome
    }
}

// ── Private helpers ───────────────────────────────────────────────────────────

async fn stop_child(child: &mut Child, grace: Duration) -> Result<()> {
    if let Ok(Some(status)) = child.try_wait() {
        debug!(?status, "daemon already exited");
        return Ok(());
    }

    if let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) {
        match kill(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!(pid, error = %e, "failed to send SIGTERM"),
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            info!(?status, "daemon exited gracefully");
            Ok(())
        }
        Ok(Err(err)) => {
            warn!(%err, "error waiting for daemon process");
            Ok(())
        }
        Err(_) => {
            warn!(?grace, "daemon did not exit within grace period, forcing kill");
            child
                .kill()
                .await
                .map_err(|e| AppError::Io(format!("failed to force-kill daemon: {e}")))
        }
    }
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn escape_component(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() {
            escaped.push(char::from(byte));
        } else {
            escaped.push_str(&format!("_{byte:02x}"));
        }
    }
    escaped
}
