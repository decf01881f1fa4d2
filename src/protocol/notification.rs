//! Server-initiated session notifications.
//!
//! Every notification arrives as a `droid.session_notification` whose
//! `params.notification` object carries a `type` discriminator plus a
//! type-specific payload. The payload is kept verbatim so encoding it again
//! reproduces the original message; typed accessors cover the fields the
//! session layer cares about.

use serde_json::{Map, Value};

use crate::protocol::message::{FACTORY_API_VERSION, JSONRPC_VERSION, NOTIFICATION_METHOD};
use crate::{AppError, Result};

/// Discriminator of a session notification.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    /// `droid_working_state_changed`: execution state transition.
    WorkingStateChanged,
    /// `create_message`: a complete message was added to the transcript.
    CreateMessage,
    /// `session_title_updated`: the daemon retitled the session.
    SessionTitleUpdated,
    /// `thinking_text_delta`: streamed reasoning text.
    ThinkingTextDelta,
    /// `assistant_text_delta`: streamed assistant text.
    AssistantTextDelta,
    /// `mcp_status_changed`: an MCP server changed state.
    McpStatusChanged,
    /// `session_initialized`: a new session finished initialising.
    SessionInitialized,
    /// `session_loaded`: a resumed session finished loading.
    SessionLoaded,
    /// `tool_call`: the agent invoked a tool.
    ToolCall,
    /// `tool_result`: a tool invocation completed.
    ToolResult,
    /// `permission_request`: the agent asks to run a tool.
    PermissionRequest,
    /// `complete`: the agent finished its turn.
    Complete,
    /// `error`: the daemon reported an execution error.
    Error,
    /// Any type this crate does not recognise, carried verbatim.
    Unknown(String),
}

impl NotificationKind {
    /// Wire value of the `type` field.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::WorkingStateChanged => "droid_working_state_changed",
            Self::CreateMessage => "create_message",
            Self::SessionTitleUpdated => "session_title_updated",
            Self::ThinkingTextDelta => "thinking_text_delta",
            Self::AssistantTextDelta => "assistant_text_delta",
            Self::McpStatusChanged => "mcp_status_changed",
            Self::SessionInitialized => "session_initialized",
            Self::SessionLoaded => "session_loaded",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
            Self::PermissionRequest => "permission_request",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Unknown(other) => other,
        }
    }

    /// Parse the `type` field of a notification.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw {
            "droid_working_state_changed" => Self::WorkingStateChanged,
            "create_message" => Self::CreateMessage,
            "session_title_updated" => Self::SessionTitleUpdated,
            "thinking_text_delta" => Self::ThinkingTextDelta,
            "assistant_text_delta" => Self::AssistantTextDelta,
            "mcp_status_changed" => Self::McpStatusChanged,
            "session_initialized" => Self::SessionInitialized,
            "session_loaded" => Self::SessionLoaded,
            "tool_call" => Self::ToolCall,
            "tool_result" => Self::ToolResult,
            "permission_request" => Self::PermissionRequest,
            "complete" => Self::Complete,
            "error" => Self::Error,
            other => Self::Unknown(other.to_owned()),
        }
    }
}

/// A decoded session notification.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    kind: NotificationKind,
    payload: Map<String, Value>,
}

impl Notification {
    /// Build a notification of `kind` from a payload object.
    ///
    /// Non-object payloads are stored under a `data` key. The `type` field is
    /// always set from `kind`.
    #[must_use]
    pub fn new(kind: NotificationKind, payload: Value) -> Self {
        let mut payload = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("data".into(), other);
                map
            }
        };
        payload.insert("type".into(), Value::from(kind.as_str()));
        Self { kind, payload }
    }

    /// Decode the `params` of a `droid.session_notification`.
    ///
    /// Accepts the daemon's `{"notification": {"type": …}}` shape and the
    /// flat `{"type": …}` shape.
    ///
    /// # Errors
    ///
    /// [`AppError::ProtocolViolation`] when no object with a string `type`
    /// can be found.
    pub fn from_params(params: Value) -> Result<Self> {
        let Value::Object(mut params) = params else {
            return Err(AppError::ProtocolViolation(
                "notification params must be an object".into(),
            ));
        };

        let payload = match params.remove("notification") {
            Some(Value::Object(inner)) => inner,
            Some(_) => {
                return Err(AppError::ProtocolViolation(
                    "notification payload must be an object".into(),
                ))
            }
            None => params,
        };

        let kind = payload
            .get("type")
            .and_then(Value::as_str)
            .map(NotificationKind::parse)
            .ok_or_else(|| AppError::ProtocolViolation("notification without type".into()))?;

        Ok(Self { kind, payload })
    }

    /// Serialise to a single NDJSON line (without the trailing newline).
    ///
    /// # Errors
    ///
    /// Never fails for payloads built by this module; the signature mirrors
    /// the other encoders.
    pub fn encode(&self) -> Result<String> {
        let mut params = Map::new();
        params.insert("notification".into(), Value::Object(self.payload.clone()));

        let mut obj = Map::new();
        obj.insert("jsonrpc".into(), Value::from(JSONRPC_VERSION));
        obj.insert("type".into(), Value::from("notification"));
        obj.insert("factoryApiVersion".into(), Value::from(FACTORY_API_VERSION));
        obj.insert("method".into(), Value::from(NOTIFICATION_METHOD));
        obj.insert("params".into(), Value::Object(params));
        Ok(Value::Object(obj).to_string())
    }

    /// Notification discriminator.
    #[must_use]
    pub fn kind(&self) -> &NotificationKind {
        &self.kind
    }

    /// Full payload, including the `type` field.
    #[must_use]
    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    /// Look up a string field of the payload.
    #[must_use]
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// `messageId` of message and delta notifications.
    #[must_use]
    pub fn message_id(&self) -> Option<&str> {
        self.str_field("messageId")
    }

    /// Streamed or complete text: `textDelta`, falling back to `text`.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        self.str_field("textDelta").or_else(|| self.str_field("text"))
    }

    /// `newState` of a working-state change.
    #[must_use]
    pub fn new_state(&self) -> Option<&str> {
        self.str_field("newState")
    }

    /// `blockIndex` of a delta notification; `0` when absent.
    #[must_use]
    pub fn block_index(&self) -> u64 {
        self.payload
            .get("blockIndex")
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }

    /// `title` of a title update.
    #[must_use]
    pub fn title(&self) -> Option<&str> {
        self.str_field("title")
    }

    /// The `message` object of a `create_message` notification.
    #[must_use]
    pub fn message(&self) -> Option<&Map<String, Value>> {
        self.payload.get("message").and_then(Value::as_object)
    }

    /// Role of the created message (`user`, `assistant`, …).
    #[must_use]
    pub fn role(&self) -> Option<&str> {
        self.message()
            .and_then(|m| m.get("role"))
            .and_then(Value::as_str)
    }

    /// Id of the permission prompt carried by a `permission_request`.
    #[must_use]
    pub fn permission_request_id(&self) -> Option<&str> {
        self.str_field("requestId")
    }

    /// Tool name carried by permission and tool notifications.
    #[must_use]
    pub fn tool_name(&self) -> Option<&str> {
        self.str_field("toolName")
    }
}
