//! Inter-agent message envelope.
//!
//! Messages routed between sessions are delivered as ordinary user messages
//! whose text is tagged with sender and recipient:
//!
//! ```text
//! <MESSAGE from="opus" to="codex">
//! please review the diff
//! </MESSAGE>
//! ```

use std::sync::OnceLock;

use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use serde_json::{json, Value};

/// A message from one agent to another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentMessage {
    /// Sending agent's name.
    pub from: String,
    /// Receiving agent's name.
    pub to: String,
    /// Message body. May span several lines.
    pub content: String,
    /// When the message was routed, if recorded.
    pub timestamp: Option<DateTime<Utc>>,
}

impl AgentMessage {
    /// Create an unstamped message.
    #[must_use]
    pub fn new(from: impl Into<String>, to: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            content: content.into(),
            timestamp: None,
        }
    }

    /// Record the current time as the message timestamp.
    #[must_use]
    pub fn stamped(mut self) -> Self {
        self.timestamp = Some(Utc::now());
        self
    }

    /// Text delivered to the recipient's daemon.
    #[must_use]
    pub fn format(&self) -> String {
        format!(
            "<MESSAGE from=\"{}\" to=\"{}\">\n{}\n</MESSAGE>",
            self.from, self.to, self.content
        )
    }

    /// Recover a message produced by [`format`](Self::format).
    ///
    /// Agent names must be word characters. Returns `None` for text that is
    /// not a tagged message.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let captures = envelope_pattern()?.captures(text)?;
        Some(Self::new(
            captures.get(1)?.as_str(),
            captures.get(2)?.as_str(),
            captures.get(3)?.as_str(),
        ))
    }

    /// JSON view with `from`, `to`, `content` and `timestamp` (RFC 3339 or
    /// `null`).
    #[must_use]
    pub fn to_value(&self) -> Value {
        json!({
            "from": self.from,
            "to": self.to,
            "content": self.content,
            "timestamp": self
                .timestamp
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true)),
        })
    }
}

fn envelope_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r#"(?s)\A<MESSAGE from="(\w+)" to="(\w+)">\n(.*)\n</MESSAGE>"#).ok())
        .as_ref()
}
