//! Droid JSON-RPC message protocol.
//!
//! Pure data: envelope types, request builders for every method, and the
//! inbound classifier. Nothing here performs I/O.
//!
//! | Method                           | Builder                                   |
//! |----------------------------------|-------------------------------------------|
//! | `droid.initialize_session`       | [`request::initialize_session`]           |
//! | `droid.load_session`             | [`request::load_session`]                 |
//! | `droid.interrupt_session`        | [`request::interrupt_session`]            |
//! | `droid.update_session_settings`  | [`request::update_session_settings`]      |
//! | `droid.add_user_message`         | [`request::add_user_message`]             |
//! | `droid.request_permission`       | [`request::request_permission`]           |
//! | `droid.authenticate_mcp_server`  | [`request::authenticate_mcp_server`]      |
//! | `droid.retry_mcp_server`         | [`request::retry_mcp_server`]             |
//! | `droid.toggle_mcp_server`        | [`request::toggle_mcp_server`]            |
//! | `droid.clear_mcp_auth`           | [`request::clear_mcp_auth`]               |

pub mod message;
pub mod notification;
pub mod request;

pub use message::{
    decode_line, encode_inbound, Inbound, Method, Outcome, Request, RequestId, Response, RpcError,
    NOTIFICATION_METHOD,
};
pub use notification::{Notification, NotificationKind};
pub use request::{
    AutonomyLevel, PermissionAction, PermissionDecision, RequestIds, SessionSettings,
};
