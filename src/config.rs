//! Configuration parsing and validation.
//!
//! Everything has a default, so an empty TOML document is a valid
//! configuration:
//!
//! ```toml
//! host_cli = "droid"
//! auto_level = "high"
//! fifo_dir = "/tmp"
//! log_format = "text"         # or "json"
//!
//! [timeouts]
//! startup_seconds = 30
//! request_seconds = 0          # 0 disables the default request timeout
//! terminate_grace_seconds = 5
//!
//! [transport]
//! max_consecutive_violations = 16
//! notification_buffer = 256
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::logging::LogFormat;
use crate::protocol::AutonomyLevel;
use crate::{AppError, Result};

/// Timeout values, in seconds.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// How long a daemon may take to open its FIFOs.
    #[serde(default = "default_startup_seconds")]
    pub startup_seconds: u64,
    /// Default per-request timeout; 0 means wait indefinitely.
    #[serde(default)]
    pub request_seconds: u64,
    /// Grace period between SIGTERM and a forced kill.
    #[serde(default = "default_terminate_grace_seconds")]
    pub terminate_grace_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            startup_seconds: default_startup_seconds(),
            request_seconds: 0,
            terminate_grace_seconds: default_terminate_grace_seconds(),
        }
    }
}

impl TimeoutConfig {
    /// Startup window as a [`Duration`].
    #[must_use]
    pub fn startup(&self) -> Duration {
        Duration::from_secs(self.startup_seconds)
    }

    /// Default request timeout, `None` when disabled.
    #[must_use]
    pub fn request(&self) -> Option<Duration> {
        (self.request_seconds > 0).then(|| Duration::from_secs(self.request_seconds))
    }

    /// Terminate grace period as a [`Duration`].
    #[must_use]
    pub fn terminate_grace(&self) -> Duration {
        Duration::from_secs(self.terminate_grace_seconds)
    }
}

/// Transport tuning.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TransportConfig {
    /// Consecutive bad lines tolerated before the daemon is considered crashed.
    #[serde(default = "default_max_consecutive_violations")]
    pub max_consecutive_violations: u32,
    /// Capacity of the read task's notification channel.
    #[serde(default = "default_notification_buffer")]
    pub notification_buffer: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_consecutive_violations: default_max_consecutive_violations(),
            notification_buffer: default_notification_buffer(),
        }
    }
}

fn default_host_cli() -> String {
    "droid".into()
}

fn default_host_cli_args() -> Vec<String> {
    [
        "exec",
        "--input-format",
        "stream-jsonrpc",
        "--output-format",
        "stream-jsonrpc",
        "--allow-background-processes",
    ]
    .into_iter()
    .map(str::to_owned)
    .collect()
}

fn default_auto_level() -> AutonomyLevel {
    AutonomyLevel::High
}

fn default_fifo_dir() -> PathBuf {
    std::env::temp_dir()
}

fn default_startup_seconds() -> u64 {
    30
}

fn default_terminate_grace_seconds() -> u64 {
    5
}

fn default_max_consecutive_violations() -> u32 {
    16
}

fn default_notification_buffer() -> usize {
    256
}

/// Top-level configuration shared by every session of a swarm.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SwarmConfig {
    /// Droid CLI binary.
    #[serde(default = "default_host_cli")]
    pub host_cli: String,
    /// Arguments placed before the per-session `-m` / `--auto` flags.
    #[serde(default = "default_host_cli_args")]
    pub host_cli_args: Vec<String>,
    /// Autonomy level passed as `--auto`.
    #[serde(default = "default_auto_level")]
    pub auto_level: AutonomyLevel,
    /// Directory the FIFO pairs are created in.
    #[serde(default = "default_fifo_dir")]
    pub fifo_dir: PathBuf,
    /// Timeouts.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Transport tuning.
    #[serde(default)]
    pub transport: TransportConfig,
    /// Output format for [`init_tracing`](crate::logging::init_tracing).
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            host_cli: default_host_cli(),
            host_cli_args: default_host_cli_args(),
            auto_level: default_auto_level(),
            fifo_dir: default_fifo_dir(),
            timeouts: TimeoutConfig::default(),
            transport: TransportConfig::default(),
            log_format: LogFormat::default(),
        }
    }
}

impl SwarmConfig {
    /// Load and validate configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read, is not valid
    /// TOML, or fails validation.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants the rest of the crate relies on.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` describing the first violated invariant.
    pub fn validate(&self) -> Result<()> {
        if self.host_cli.trim().is_empty() {
            return Err(AppError::Config("host_cli must not be empty".into()));
        }
        if self.timeouts.startup_seconds == 0 {
            return Err(AppError::Config(
                "timeouts.startup_seconds must be greater than zero".into(),
            ));
        }
        if self.transport.max_consecutive_violations == 0 {
            return Err(AppError::Config(
                "transport.max_consecutive_violations must be greater than zero".into(),
            ));
        }
        if self.transport.notification_buffer == 0 {
            return Err(AppError::Config(
                "transport.notification_buffer must be greater than zero".into(),
            ));
        }
        if !self.fifo_dir.is_dir() {
            return Err(AppError::Config(format!(
                "fifo_dir {} is not a directory",
                self.fifo_dir.display()
            )));
        }
        Ok(())
    }
}
