//! JSON-RPC envelopes exchanged with a droid daemon.
//!
//! Outbound requests carry the Factory envelope fields (`jsonrpc`, `type`,
//! `factoryApiVersion`) alongside the usual `method` / `params` / `id`.
//! Inbound lines are either responses (correlated by `id`) or
//! `droid.session_notification` messages; [`decode_line`] tells them apart.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::protocol::notification::Notification;
use crate::{AppError, Result};

/// JSON-RPC version string written on every envelope.
pub const JSONRPC_VERSION: &str = "2.0";

/// Factory API version understood by the droid CLI.
pub const FACTORY_API_VERSION: &str = "1.0.0";

/// Method name of every server-initiated notification.
pub const NOTIFICATION_METHOD: &str = "droid.session_notification";

// ── Identifiers and methods ──────────────────────────────────────────────────

/// Correlation identifier of a request.
///
/// Always encoded as a JSON string. Daemons that echo numeric ids are
/// accepted on decode and normalised to their decimal string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(String);

impl RequestId {
    /// Wrap an existing identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for RequestId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RequestId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawId {
            Text(String),
            Number(serde_json::Number),
        }

        Ok(match RawId::deserialize(deserializer)? {
            RawId::Text(text) => Self(text),
            RawId::Number(number) => Self(number.to_string()),
        })
    }
}

/// Every request method a client may send to the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    /// Start a fresh session.
    #[serde(rename = "droid.initialize_session")]
    InitializeSession,
    /// Restore a previously created session.
    #[serde(rename = "droid.load_session")]
    LoadSession,
    /// Stop the current execution.
    #[serde(rename = "droid.interrupt_session")]
    InterruptSession,
    /// Change autonomy level or model.
    #[serde(rename = "droid.update_session_settings")]
    UpdateSessionSettings,
    /// Deliver a user message.
    #[serde(rename = "droid.add_user_message")]
    AddUserMessage,
    /// Answer a tool permission prompt.
    #[serde(rename = "droid.request_permission")]
    RequestPermission,
    /// Authenticate against an MCP server.
    #[serde(rename = "droid.authenticate_mcp_server")]
    AuthenticateMcpServer,
    /// Retry a failed MCP server connection.
    #[serde(rename = "droid.retry_mcp_server")]
    RetryMcpServer,
    /// Enable or disable an MCP server.
    #[serde(rename = "droid.toggle_mcp_server")]
    ToggleMcpServer,
    /// Forget stored MCP credentials.
    #[serde(rename = "droid.clear_mcp_auth")]
    ClearMcpAuth,
}

impl Method {
    /// Every method, in protocol order.
    pub const ALL: [Self; 10] = [
        Self::InitializeSession,
        Self::LoadSession,
        Self::InterruptSession,
        Self::UpdateSessionSettings,
        Self::AddUserMessage,
        Self::RequestPermission,
        Self::AuthenticateMcpServer,
        Self::RetryMcpServer,
        Self::ToggleMcpServer,
        Self::ClearMcpAuth,
    ];

    /// Wire name of the method.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InitializeSession => "droid.initialize_session",
            Self::LoadSession => "droid.load_session",
            Self::InterruptSession => "droid.interrupt_session",
            Self::UpdateSessionSettings => "droid.update_session_settings",
            Self::AddUserMessage => "droid.add_user_message",
            Self::RequestPermission => "droid.request_permission",
            Self::AuthenticateMcpServer => "droid.authenticate_mcp_server",
            Self::RetryMcpServer => "droid.retry_mcp_server",
            Self::ToggleMcpServer => "droid.toggle_mcp_server",
            Self::ClearMcpAuth => "droid.clear_mcp_auth",
        }
    }

    /// Look up a method by wire name.
    #[must_use]
    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.as_str() == name)
    }
}

impl Display for Method {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Request ──────────────────────────────────────────────────────────────────

/// A client-to-daemon request.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Correlation id, unique within the session.
    pub id: RequestId,
    /// Method being invoked.
    pub method: Method,
    /// Method-specific parameters (always a JSON object).
    pub params: Value,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestEnvelope {
    #[serde(default)]
    jsonrpc: String,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    factory_api_version: String,
    method: Method,
    #[serde(default)]
    params: Value,
    id: RequestId,
}

impl Request {
    /// Serialise to a single NDJSON line (without the trailing newline).
    ///
    /// # Errors
    ///
    /// Returns [`AppError::MalformedRequest`] if serialisation fails.
    pub fn encode(&self) -> Result<String> {
        let envelope = RequestEnvelope {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            kind: "request".to_owned(),
            factory_api_version: FACTORY_API_VERSION.to_owned(),
            method: self.method,
            params: self.params.clone(),
            id: self.id.clone(),
        };
        serde_json::to_string(&envelope)
            .map_err(|e| AppError::MalformedRequest(format!("cannot serialise {}: {e}", self.method)))
    }

    /// Parse a request line, as a daemon would.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::ProtocolViolation`] if the line is not a request
    /// envelope for a known method.
    pub fn decode(line: &str) -> Result<Self> {
        let envelope: RequestEnvelope = serde_json::from_str(line.trim())
            .map_err(|e| AppError::ProtocolViolation(format!("malformed request: {e}")))?;
        Ok(Self {
            id: envelope.id,
            method: envelope.method,
            params: envelope.params,
        })
    }
}

// ── Response ─────────────────────────────────────────────────────────────────

/// Error object carried by a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// JSON-RPC error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Optional structured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Success or failure payload of a response.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The daemon accepted the request.
    Result(Value),
    /// The daemon rejected the request.
    Error(RpcError),
}

/// A daemon-to-client response correlated to one request.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Id of the request this answers.
    pub id: RequestId,
    /// Result or error payload.
    pub outcome: Outcome,
}

impl Response {
    /// Build a successful response.
    #[must_use]
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            id,
            outcome: Outcome::Result(result),
        }
    }

    /// Build an error response.
    #[must_use]
    pub fn failure(id: RequestId, code: i64, message: impl Into<String>) -> Self {
        Self {
            id,
            outcome: Outcome::Error(RpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    /// Whether the daemon rejected the request.
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self.outcome, Outcome::Error(_))
    }

    /// Convert into the result payload, surfacing daemon errors verbatim.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Rpc`] when the response carries an error object.
    pub fn into_result(self) -> Result<Value> {
        match self.outcome {
            Outcome::Result(value) => Ok(value),
            Outcome::Error(err) => Err(AppError::Rpc {
                code: err.code,
                message: err.message,
            }),
        }
    }

    /// Serialise to a single NDJSON line (without the trailing newline).
    ///
    /// # Errors
    ///
    /// Returns [`AppError::ProtocolViolation`] if serialisation fails.
    pub fn encode(&self) -> Result<String> {
        let mut obj = Map::new();
        obj.insert("jsonrpc".into(), Value::from(JSONRPC_VERSION));
        obj.insert("type".into(), Value::from("response"));
        obj.insert("factoryApiVersion".into(), Value::from(FACTORY_API_VERSION));
        obj.insert("id".into(), Value::from(self.id.as_str()));
        match &self.outcome {
            Outcome::Result(value) => {
                obj.insert("result".into(), value.clone());
            }
            Outcome::Error(err) => {
                obj.insert("error".into(), serde_json::to_value(err)?);
            }
        }
        Ok(Value::Object(obj).to_string())
    }

    fn from_object(mut obj: Map<String, Value>) -> Result<Self> {
        let id: RequestId = obj
            .remove("id")
            .filter(|v| !v.is_null())
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| AppError::ProtocolViolation(format!("invalid response id: {e}")))?
            .ok_or_else(|| AppError::ProtocolViolation("response without id".into()))?;

        let outcome = match (obj.remove("error"), obj.remove("result")) {
            (Some(err), _) if !err.is_null() => {
                let err: RpcError = serde_json::from_value(err).map_err(|e| {
                    AppError::ProtocolViolation(format!("invalid error object: {e}"))
                })?;
                Outcome::Error(err)
            }
            (_, Some(result)) => Outcome::Result(result),
            _ => {
                return Err(AppError::ProtocolViolation(format!(
                    "response {id} has neither result nor error"
                )))
            }
        };

        Ok(Self { id, outcome })
    }
}

// ── Inbound classification ───────────────────────────────────────────────────

/// A classified inbound line.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Response to a request issued by this client.
    Response(Response),
    /// Server-initiated session notification.
    Notification(Notification),
}

/// Classify one inbound NDJSON line.
///
/// # Return value
///
/// - `Ok(None)`: blank or whitespace-only line.
/// - `Ok(Some(Inbound::Notification(_)))`: `method` is
///   [`NOTIFICATION_METHOD`].
/// - `Ok(Some(Inbound::Response(_)))`: carries an `id` plus `result` or
///   `error`.
///
/// # Errors
///
/// [`AppError::ProtocolViolation`] for invalid JSON, non-object values, and
/// objects that are neither a response nor a session notification.
pub fn decode_line(line: &str) -> Result<Option<Inbound>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let value: Value = serde_json::from_str(trimmed)
        .map_err(|e| AppError::ProtocolViolation(format!("malformed json: {e}")))?;
    let Value::Object(obj) = value else {
        return Err(AppError::ProtocolViolation(
            "inbound message is not a json object".into(),
        ));
    };

    match obj.get("method").and_then(Value::as_str) {
        Some(NOTIFICATION_METHOD) => {
            let params = obj.get("params").cloned().unwrap_or(Value::Null);
            Notification::from_params(params).map(|n| Some(Inbound::Notification(n)))
        }
        Some(other) => Err(AppError::ProtocolViolation(format!(
            "unexpected inbound method '{other}'"
        ))),
        None if obj.contains_key("id") => {
            Response::from_object(obj).map(|r| Some(Inbound::Response(r)))
        }
        None => Err(AppError::ProtocolViolation(
            "message is neither a response nor a session notification".into(),
        )),
    }
}

/// Serialise an inbound message back to its wire form.
///
/// # Errors
///
/// Propagates serialisation failures as [`AppError::ProtocolViolation`].
pub fn encode_inbound(message: &Inbound) -> Result<String> {
    match message {
        Inbound::Response(response) => response.encode(),
        Inbound::Notification(notification) => notification.encode(),
    }
}
