//! Request builders for every droid method.
//!
//! Builders are pure: they validate their arguments and return a
//! [`Request`] ready for the transport. A missing or blank required field
//! yields [`AppError::MalformedRequest`] and nothing reaches the wire.

use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::protocol::message::{Method, Request, RequestId};
use crate::{AppError, Result};

// ── Id allocation ────────────────────────────────────────────────────────────

/// Monotonic request-id allocator, one per session.
///
/// Ids are `req-1`, `req-2`, … and are never reused for the allocator's
/// lifetime.
#[derive(Debug, Default)]
pub struct RequestIds {
    next: AtomicU64,
}

impl RequestIds {
    /// Create an allocator whose first id is `req-1`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next id.
    pub fn next_id(&self) -> RequestId {
        let n = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        RequestId::new(format!("req-{n}"))
    }
}

// ── Argument types ───────────────────────────────────────────────────────────

/// Autonomy level the daemon runs tools at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutonomyLevel {
    /// Ask before anything with side effects.
    Low,
    /// Allow reversible edits without asking.
    Medium,
    /// Run without prompting.
    High,
}

impl AutonomyLevel {
    /// Wire value.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl Display for AutonomyLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settings changed by `droid.update_session_settings`.
///
/// At least one field must be set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSettings {
    /// New autonomy level.
    pub auto_mode: Option<AutonomyLevel>,
    /// New model identifier.
    pub model: Option<String>,
}

/// Operator decision on a tool permission prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionAction {
    /// Let the tool run.
    Allow,
    /// Refuse the tool.
    Deny,
}

impl PermissionAction {
    /// Wire value.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
        }
    }
}

/// Full answer to a permission prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermissionDecision {
    /// Allow or deny.
    pub action: PermissionAction,
    /// Whether the daemon should remember the decision for this tool.
    pub remember: bool,
}

impl PermissionDecision {
    /// One-off allow.
    #[must_use]
    pub fn allow() -> Self {
        Self {
            action: PermissionAction::Allow,
            remember: false,
        }
    }

    /// One-off deny.
    #[must_use]
    pub fn deny() -> Self {
        Self {
            action: PermissionAction::Deny,
            remember: false,
        }
    }

    /// Ask the daemon to remember this decision.
    #[must_use]
    pub fn remembered(mut self) -> Self {
        self.remember = true;
        self
    }
}

// ── Session lifecycle ────────────────────────────────────────────────────────

/// `droid.initialize_session`: start a fresh session.
///
/// # Errors
///
/// [`AppError::MalformedRequest`] if `machine_id` or `cwd` is blank.
pub fn initialize_session(id: RequestId, machine_id: &str, cwd: &str) -> Result<Request> {
    require("initialize_session", "machineId", machine_id)?;
    require("initialize_session", "cwd", cwd)?;
    Ok(build(
        id,
        Method::InitializeSession,
        json!({ "machineId": machine_id, "cwd": cwd }),
    ))
}

/// `droid.load_session`: resume an existing session.
///
/// # Errors
///
/// [`AppError::MalformedRequest`] if `session_id` is blank.
pub fn load_session(id: RequestId, session_id: &str) -> Result<Request> {
    require("load_session", "sessionId", session_id)?;
    Ok(build(
        id,
        Method::LoadSession,
        json!({ "sessionId": session_id }),
    ))
}

/// `droid.interrupt_session`: stop the current execution.
#[must_use]
pub fn interrupt_session(id: RequestId) -> Request {
    build(id, Method::InterruptSession, json!({}))
}

/// `droid.update_session_settings`: change autonomy level and/or model.
///
/// # Errors
///
/// [`AppError::MalformedRequest`] if neither field is set or `model` is
/// blank.
pub fn update_session_settings(id: RequestId, settings: &SessionSettings) -> Result<Request> {
    let mut params = Map::new();
    if let Some(level) = settings.auto_mode {
        params.insert("autoMode".into(), Value::from(level.as_str()));
    }
    if let Some(model) = &settings.model {
        require("update_session_settings", "model", model)?;
        params.insert("model".into(), Value::from(model.as_str()));
    }
    if params.is_empty() {
        return Err(AppError::MalformedRequest(
            "update_session_settings: at least one of autoMode or model is required".into(),
        ));
    }
    Ok(build(id, Method::UpdateSessionSettings, Value::Object(params)))
}

// ── Messages ─────────────────────────────────────────────────────────────────

/// `droid.add_user_message`: deliver user text.
///
/// # Errors
///
/// [`AppError::MalformedRequest`] if `text` is blank.
pub fn add_user_message(id: RequestId, text: &str) -> Result<Request> {
    require("add_user_message", "text", text)?;
    Ok(build(id, Method::AddUserMessage, json!({ "text": text })))
}

// ── Permissions ──────────────────────────────────────────────────────────────

/// `droid.request_permission`: answer a tool permission prompt.
///
/// `request_id` is the id delivered by the daemon's `permission_request`
/// notification; `tool_name` the tool it asked about.
///
/// # Errors
///
/// [`AppError::MalformedRequest`] if `request_id` or `tool_name` is blank.
pub fn request_permission(
    id: RequestId,
    request_id: &str,
    tool_name: &str,
    decision: PermissionDecision,
) -> Result<Request> {
    require("request_permission", "requestId", request_id)?;
    require("request_permission", "toolName", tool_name)?;
    Ok(build(
        id,
        Method::RequestPermission,
        json!({
            "requestId": request_id,
            "toolName": tool_name,
            "action": decision.action.as_str(),
            "remember": decision.remember,
        }),
    ))
}

// ── MCP ──────────────────────────────────────────────────────────────────────

/// `droid.authenticate_mcp_server`: authenticate an MCP server.
///
/// `authToken` is only sent when provided and non-blank.
///
/// # Errors
///
/// [`AppError::MalformedRequest`] if `server_name` is blank.
pub fn authenticate_mcp_server(
    id: RequestId,
    server_name: &str,
    auth_token: Option<&str>,
) -> Result<Request> {
    require("authenticate_mcp_server", "serverName", server_name)?;
    let mut params = Map::new();
    params.insert("serverName".into(), Value::from(server_name));
    if let Some(token) = auth_token.filter(|t| !t.trim().is_empty()) {
        params.insert("authToken".into(), Value::from(token));
    }
    Ok(build(id, Method::AuthenticateMcpServer, Value::Object(params)))
}

/// `droid.retry_mcp_server`: retry a failed MCP server connection.
///
/// # Errors
///
/// [`AppError::MalformedRequest`] if `server_name` is blank.
pub fn retry_mcp_server(id: RequestId, server_name: &str) -> Result<Request> {
    require("retry_mcp_server", "serverName", server_name)?;
    Ok(build(
        id,
        Method::RetryMcpServer,
        json!({ "serverName": server_name }),
    ))
}

/// `droid.toggle_mcp_server`: enable or disable an MCP server.
///
/// # Errors
///
/// [`AppError::MalformedRequest`] if `server_name` is blank.
pub fn toggle_mcp_server(id: RequestId, server_name: &str, enabled: bool) -> Result<Request> {
    require("toggle_mcp_server", "serverName", server_name)?;
    Ok(build(
        id,
        Method::ToggleMcpServer,
        json!({ "serverName": server_name, "enabled": enabled }),
    ))
}

/// `droid.clear_mcp_auth`: forget stored MCP credentials.
///
/// # Errors
///
/// [`AppError::MalformedRequest`] if `server_name` is blank.
pub fn clear_mcp_auth(id: RequestId, server_name: &str) -> Result<Request> {
    require("clear_mcp_auth", "serverName", server_name)?;
    Ok(build(
        id,
        Method::ClearMcpAuth,
        json!({ "serverName": server_name }),
    ))
}

// ── Private helpers ──────────────────────────────────────────────────────────

fn build(id: RequestId, method: Method, params: Value) -> Request {
    Request { id, method, params }
}

fn require(builder: &str, field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(AppError::MalformedRequest(format!(
            "{builder}: required field `{field}` is missing or empty"
        )));
    }
    Ok(())
}
