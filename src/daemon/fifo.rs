//! FIFO-backed daemon launcher.
//!
//! Startup sequence:
//!
//! 1. Create `<fifo_dir>/droid-<pr>-<name>.req` and `.resp`.
//! 2. Open the response FIFO for reading without blocking.
//! 3. Spawn the daemon through `sh`, which redirects stdout to the response
//!    FIFO and then stdin from the request FIFO before `exec`ing the CLI.
//! 4. Poll the request FIFO for writing. Opening succeeds (no `ENXIO`) only
//!    once the daemon has it open for reading, which also means its stdout
//!    is connected. That is the readiness signal.
//!
//! If the daemon exits or the startup window elapses first, the child is
//! killed and both FIFOs are removed.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

use super::process::{DaemonProcess, FifoPair};
use super::{DaemonConnection, DaemonLauncher, LaunchFuture, LaunchSpec};
use crate::config::SwarmConfig;
use crate::{AppError, Result};

/// Delay between readiness checks of the request FIFO.
const READY_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// `$0` is the CLI, `"$@"` its arguments; redirections are applied in order.
const EXEC_SCRIPT: &str = r#"exec "$0" "$@" >"$DROID_RESPONSE_FIFO" <"$DROID_REQUEST_FIFO""#;

/// Launches the droid CLI with its stdio bound to a FIFO pair.
#[derive(Debug, Clone)]
pub struct FifoLauncher {
    config: Arc<SwarmConfig>,
}

impl FifoLauncher {
    /// Create a launcher using `config` for the CLI, FIFO directory and
    /// startup timeout.
    #[must_use]
    pub fn new(config: Arc<SwarmConfig>) -> Self {
        Self { config }
    }

    fn command(&self, spec: &LaunchSpec, fifos: &FifoPair, resume: bool) -> Result<Command> {
        let log = std::fs::File::create(&fifos.log).map_err(|e| {
            AppError::DaemonStart(format!("cannot create log {}: {e}", fifos.log.display()))
        })?;

        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(EXEC_SCRIPT)
            .arg(&self.config.host_cli)
            .args(&self.config.host_cli_args);
        if !resume {
            cmd.arg("-m").arg(&spec.model);
        }
        cmd.arg("--auto")
            .arg(spec.auto_level.as_str())
            .env("DROID_REQUEST_FIFO", &fifos.request)
            .env("DROID_RESPONSE_FIFO", &fifos.response)
            .current_dir(&spec.working_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(log))
            .process_group(0)
            .kill_on_drop(true);
        Ok(cmd)
    }

    async fn launch(&self, spec: &LaunchSpec, resume: bool) -> Result<DaemonConnection> {
        let fifos = FifoPair::for_session(&self.config.fifo_dir, &spec.pr_number, &spec.name);
        fifos.create()?;

        match self.connect(spec, &fifos, resume).await {
            Ok(connection) => Ok(connection),
            Err(e) => {
                if let Err(cleanup) = fifos.remove() {
                    warn!(error = %cleanup, "failed to remove fifo files after launch failure");
                }
                Err(e)
            }
        }
    }

    async fn connect(
        &self,
        spec: &LaunchSpec,
        fifos: &FifoPair,
        resume: bool,
    ) -> Result<DaemonConnection> {
        let receiver = pipe::OpenOptions::new()
            .open_receiver(&fifos.response)
            .map_err(|e| {
                AppError::DaemonStart(format!(
                    "cannot open {}: {e}",
                    fifos.response.display()
                ))
            })?;

        let mut child = self.command(spec, fifos, resume)?.spawn().map_err(|e| {
            AppError::DaemonStart(format!("failed to spawn {}: {e}", self.config.host_cli))
        })?;
        info!(pid = ?child.id(), "daemon spawned");

        let sender = match wait_until_ready(&mut child, fifos, self.config.timeouts.startup()).await
        {
            Ok(sender) => sender,
            Err(e) => {
                if let Err(kill_err) = child.kill().await {
                    debug!(error = %kill_err, "kill after failed startup");
                }
                return Err(e);
            }
        };

        info!("daemon ready");
        Ok(DaemonConnection {
            process: DaemonProcess::spawned(spec.name.clone(), child, Some(fifos.clone())),
            reader: Box::new(receiver),
            writer: Box::new(sender),
        })
    }
}

impl DaemonLauncher for FifoLauncher {
    fn start_new<'a>(&'a self, spec: &'a LaunchSpec) -> LaunchFuture<'a> {
        let span = info_span!("launch_daemon", session = %spec.name, model = %spec.model);
        Box::pin(self.launch(spec, false).instrument(span))
    }

    fn resume<'a>(&'a self, session_id: &'a str, spec: &'a LaunchSpec) -> LaunchFuture<'a> {
        let span = info_span!("resume_daemon", session = %spec.name, session_id = %session_id);
        Box::pin(self.launch(spec, true).instrument(span))
    }
}

async fn wait_until_ready(
    child: &mut Child,
    fifos: &FifoPair,
    startup: Duration,
) -> Result<pipe::Sender> {
    let deadline = Instant::now() + startup;
    loop {
        match pipe::OpenOptions::new().open_sender(&fifos.request) {
            Ok(sender) => return Ok(sender),
            Err(e) if e.raw_os_error() == Some(Errno::ENXIO as i32) => {}
            Err(e) => {
                return Err(AppError::DaemonStart(format!(
                    "cannot open {}: {e}",
                    fifos.request.display()
                )))
            }
        }

        match child.try_wait() {
            Ok(Some(status)) => {
                return Err(AppError::DaemonStart(format!(
                    "daemon exited before opening its fifos ({status}); see {}",
                    fifos.log.display()
                )))
            }
            Ok(None) => {}
            Err(e) => return Err(AppError::DaemonStart(format!("cannot poll daemon: {e}"))),
        }

        if Instant::now() >= deadline {
            warn!(?startup, "daemon did not open its fifos in time");
            return Err(AppError::DaemonStartTimeout(format!(
                "daemon did not open {} within {startup:?}",
                fifos.request.display()
            )));
        }
        tokio::time::sleep(READY_POLL_INTERVAL).await;
    }
}
