//! Error types shared across the crate.

use std::fmt::{Display, Formatter};

/// Shared crate result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Error enumeration covering every failure mode of the session layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// A request failed caller-side validation and was never sent.
    MalformedRequest(String),
    /// Inbound wire data could not be parsed or correlated.
    ProtocolViolation(String),
    /// The daemon process could not be launched.
    DaemonStart(String),
    /// The daemon did not become ready within the startup window.
    DaemonStartTimeout(String),
    /// The daemon's inbound stream closed; the session is unusable.
    DaemonDisconnected(String),
    /// A request received no response within its timeout.
    RequestTimeout(String),
    /// A permission response referenced an id never delivered by the daemon.
    UnknownPermissionRequest(String),
    /// No swarm member is registered under the given name.
    UnknownAgent(String),
    /// A swarm member with the given name already exists.
    DuplicateName(String),
    /// The verb is not valid in the session's current lifecycle state.
    InvalidState(String),
    /// Application error reported by the daemon, returned verbatim.
    Rpc {
        /// JSON-RPC error code.
        code: i64,
        /// Human-readable message from the daemon.
        message: String,
    },
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::MalformedRequest(msg) => write!(f, "malformed request: {msg}"),
            Self::ProtocolViolation(msg) => write!(f, "protocol violation: {msg}"),
            Self::DaemonStart(msg) => write!(f, "daemon start: {msg}"),
            Self::DaemonStartTimeout(msg) => write!(f, "daemon start timeout: {msg}"),
            Self::DaemonDisconnected(msg) => write!(f, "daemon disconnected: {msg}"),
            Self::RequestTimeout(msg) => write!(f, "request timeout: {msg}"),
            Self::UnknownPermissionRequest(msg) => {
                write!(f, "unknown permission request: {msg}")
            }
            Self::UnknownAgent(msg) => write!(f, "unknown agent: {msg}"),
            Self::DuplicateName(msg) => write!(f, "duplicate name: {msg}"),
            Self::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            Self::Rpc { code, message } => write!(f, "rpc error {code}: {message}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::ProtocolViolation(format!("invalid json: {err}"))
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}
