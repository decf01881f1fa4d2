//! Session lifecycle and execution state.

use std::fmt::{Display, Formatter};

/// Lifecycle of a [`Session`](super::Session).
///
/// `Unstarted → Starting → Ready → Closed`. A failed start lands in
/// `Failed`, from which only cleanup (to `Closed`) is possible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// Constructed; no daemon yet.
    Unstarted,
    /// Launching the daemon and performing the handshake.
    Starting,
    /// Handshake complete; verbs are accepted.
    Ready,
    /// Start failed; resources have been released.
    Failed,
    /// Cleaned up. Terminal.
    Closed,
}

impl LifecycleState {
    /// Check whether a transition to `next` is allowed.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Unstarted, Self::Starting)
                | (Self::Starting, Self::Ready | Self::Failed | Self::Closed)
                | (
                    Self::Unstarted | Self::Ready | Self::Failed,
                    Self::Closed
                )
        )
    }

    /// Lowercase name used in messages and logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unstarted => "unstarted",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Closed => "closed",
        }
    }
}

impl Display for LifecycleState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the daemon reports it is doing, from `droid_working_state_changed`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum ExecutionState {
    /// Waiting for input.
    #[default]
    Idle,
    /// Streaming an assistant reply.
    StreamingAssistantMessage,
    /// Any other state the daemon reports, verbatim.
    Other(String),
}

impl ExecutionState {
    /// Map a wire state name.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw {
            "idle" => Self::Idle,
            "streaming_assistant_message" => Self::StreamingAssistantMessage,
            other => Self::Other(other.to_owned()),
        }
    }

    /// Wire state name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Idle => "idle",
            Self::StreamingAssistantMessage => "streaming_assistant_message",
            Self::Other(raw) => raw,
        }
    }
}
