//! Droid daemon lifecycle: launching, resuming, and terminating daemons.
//!
//! A [`DaemonLauncher`] turns a [`LaunchSpec`] into a running daemon and the
//! byte streams connected to it. The production launcher is
//! [`FifoLauncher`], which wires the daemon's stdin and stdout to a FIFO
//! pair. Tests supply launchers that serve in-memory daemons.

pub mod fifo;
pub mod process;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use tokio::io::AsyncRead;

use crate::protocol::AutonomyLevel;
use crate::transport::writer::BoxedWriter;
use crate::Result;

pub use fifo::FifoLauncher;
pub use process::{DaemonProcess, FifoPair};

/// Boxed inbound byte stream.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Future returned by [`DaemonLauncher`] methods.
pub type LaunchFuture<'a> = Pin<Box<dyn Future<Output = Result<DaemonConnection>> + Send + 'a>>;

/// What a launcher needs to know about the session it starts a daemon for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Session name, unique within a swarm.
    pub name: String,
    /// Model identifier. Ignored when resuming.
    pub model: String,
    /// Namespace for FIFO file names; may be empty.
    pub pr_number: String,
    /// Working directory of the daemon process.
    pub working_directory: PathBuf,
    /// Autonomy level for the daemon's `--auto` flag.
    pub auto_level: AutonomyLevel,
}

/// A launched daemon and the streams connected to it.
pub struct DaemonConnection {
    /// Process handle used for teardown.
    pub process: DaemonProcess,
    /// Daemon → client stream (responses and notifications).
    pub reader: BoxedReader,
    /// Client → daemon stream (requests).
    pub writer: BoxedWriter,
}

impl std::fmt::Debug for DaemonConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonConnection")
            .field("process", &self.process)
            .finish_non_exhaustive()
    }
}

/// Starts daemons for sessions.
///
/// Implementations must not return before the daemon is ready to accept
/// requests. A launch that fails must leave no process or FIFO behind.
pub trait DaemonLauncher: Send + Sync {
    /// Start a daemon for a brand-new session.
    fn start_new<'a>(&'a self, spec: &'a LaunchSpec) -> LaunchFuture<'a>;

    /// Start a daemon that will load the existing session `session_id`.
    fn resume<'a>(&'a self, session_id: &'a str, spec: &'a LaunchSpec) -> LaunchFuture<'a>;
}

/// Host identity sent as `machineId` when initializing a session.
///
/// Falls back to a random identifier when the hostname is unavailable.
#[must_use]
pub fn machine_id() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| format!("droid-swarm-{}", uuid::Uuid::new_v4()))
}
