//! Unit tests for `SwarmConfig` parsing and validation.

use std::path::PathBuf;
use std::time::Duration;

use droid_swarm::protocol::AutonomyLevel;
use droid_swarm::{AppError, SwarmConfig};

/// An empty document yields every default.
#[test]
fn empty_document_uses_defaults() {
    let config = SwarmConfig::from_toml_str("").expect("empty config is valid");

    assert_eq!(config, SwarmConfig::default());
    assert_eq!(config.host_cli, "droid");
    assert_eq!(config.auto_level, AutonomyLevel::High);
    assert_eq!(config.timeouts.startup(), Duration::from_secs(30));
    assert_eq!(config.timeouts.request(), None);
    assert_eq!(config.timeouts.terminate_grace(), Duration::from_secs(5));
    assert_eq!(config.transport.max_consecutive_violations, 16);
    assert_eq!(config.transport.notification_buffer, 256);
}

/// The default CLI arguments select the stream-jsonrpc exec mode.
#[test]
fn default_cli_args_select_stream_jsonrpc() {
    let args = SwarmConfig::default().host_cli_args;
    assert_eq!(args.first().map(String::as_str), Some("exec"));
    assert!(args.windows(2).any(|w| w == ["--input-format", "stream-jsonrpc"]));
    assert!(args.windows(2).any(|w| w == ["--output-format", "stream-jsonrpc"]));
    assert!(args.iter().any(|a| a == "--allow-background-processes"));
}

/// Every field can be overridden.
#[test]
fn overrides_are_applied() {
    let dir = tempfile::tempdir().unwrap();
    let toml = format!(
        r#"
host_cli = "/opt/droid/bin/droid"
host_cli_args = ["exec"]
auto_level = "low"
fifo_dir = '{}'

[timeouts]
startup_seconds = 3
request_seconds = 12
terminate_grace_seconds = 1

[transport]
max_consecutive_violations = 4
notification_buffer = 8
"#,
        dir.path().display()
    );

    let config = SwarmConfig::from_toml_str(&toml).expect("valid config");
    assert_eq!(config.host_cli, "/opt/droid/bin/droid");
    assert_eq!(config.host_cli_args, vec!["exec".to_owned()]);
    assert_eq!(config.auto_level, AutonomyLevel::Low);
    assert_eq!(config.fifo_dir, PathBuf::from(dir.path()));
    assert_eq!(config.timeouts.request(), Some(Duration::from_secs(12)));
    assert_eq!(config.transport.max_consecutive_violations, 4);
}

/// A config file on disk is read and validated.
#[test]
fn load_from_path_reads_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("swarm.toml");
    std::fs::write(&path, "host_cli = \"droid-nightly\"\n").unwrap();

    let config = SwarmConfig::load_from_path(&path).expect("valid file");
    assert_eq!(config.host_cli, "droid-nightly");
}

/// A missing file is a config error.
#[test]
fn missing_file_is_config_error() {
    let err = SwarmConfig::load_from_path("/nonexistent/droid-swarm.toml").unwrap_err();
    assert!(matches!(err, AppError::Config(_)), "got {err}");
}

// ── Validation ──────────────────────────────────────────────────────────────

/// A blank CLI is rejected.
#[test]
fn blank_host_cli_is_rejected() {
    let err = SwarmConfig::from_toml_str("host_cli = \"  \"").unwrap_err();
    assert!(matches!(err, AppError::Config(ref m) if m.contains("host_cli")));
}

/// A zero startup window is rejected.
#[test]
fn zero_startup_timeout_is_rejected() {
    let err = SwarmConfig::from_toml_str("[timeouts]\nstartup_seconds = 0").unwrap_err();
    assert!(matches!(err, AppError::Config(ref m) if m.contains("startup_seconds")));
}

/// A zero violation threshold is rejected.
#[test]
fn zero_violation_threshold_is_rejected() {
    let err =
        SwarmConfig::from_toml_str("[transport]\nmax_consecutive_violations = 0").unwrap_err();
    assert!(matches!(err, AppError::Config(_)));
}

/// A zero-capacity notification buffer is rejected.
#[test]
fn zero_notification_buffer_is_rejected() {
    let err = SwarmConfig::from_toml_str("[transport]\nnotification_buffer = 0").unwrap_err();
    assert!(matches!(err, AppError::Config(ref m) if m.contains("notification_buffer")));
}

/// The FIFO directory must exist.
#[test]
fn missing_fifo_dir_is_rejected() {
    let err = SwarmConfig::from_toml_str("fifo_dir = '/nonexistent/fifos'").unwrap_err();
    assert!(matches!(err, AppError::Config(ref m) if m.contains("fifo_dir")));
}

/// Unknown autonomy levels fail to parse.
#[test]
fn unknown_auto_level_is_rejected() {
    let err = SwarmConfig::from_toml_str("auto_level = \"reckless\"").unwrap_err();
    assert!(matches!(err, AppError::Config(_)));
}
