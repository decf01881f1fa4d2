//! Session handshake performed once the transport is open.
//!
//! A new daemon receives `droid.initialize_session` and answers with the id
//! it assigned; a resumed daemon receives `droid.load_session` for the id
//! the caller already knows. Either way the handshake yields the session id.

use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info};

use crate::protocol::{request, RequestIds};
use crate::transport::Transport;
use crate::{AppError, Result};

/// Which handshake to perform.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Handshake<'a> {
    Initialize { machine_id: &'a str, cwd: &'a str },
    Load { session_id: &'a str },
}

/// Run the handshake and return the daemon's session id.
///
/// # Errors
///
/// Any transport or daemon error from the request, or
/// [`AppError::ProtocolViolation`] if a new daemon omits `sessionId`.
pub(crate) async fn perform(
    transport: &Transport,
    ids: &RequestIds,
    handshake: Handshake<'_>,
    timeout: Duration,
) -> Result<String> {
    match handshake {
        Handshake::Initialize { machine_id, cwd } => {
            let request = request::initialize_session(ids.next_id(), machine_id, cwd)?;
            let result = transport.call(request, Some(timeout)).await?;
            let session_id = session_id_of(&result).ok_or_else(|| {
                AppError::ProtocolViolation(
                    "initialize_session result carries no sessionId".into(),
                )
            })?;
            info!(transport = %transport.label(), %session_id, "session initialized");
            Ok(session_id)
        }
        Handshake::Load { session_id } => {
            let request = request::load_session(ids.next_id(), session_id)?;
            let result = transport.call(request, Some(timeout)).await?;
            let loaded = session_id_of(&result).unwrap_or_else(|| session_id.to_owned());
            if loaded != session_id {
                debug!(requested = %session_id, %loaded, "daemon loaded a different session id");
            }
            info!(transport = %transport.label(), session_id = %loaded, "session loaded");
            Ok(loaded)
        }
    }
}

fn session_id_of(result: &Value) -> Option<String> {
    result
        .get("sessionId")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_owned)
}
