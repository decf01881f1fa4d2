//! One conversation with one droid daemon.
//!
//! A [`Session`] composes a launched daemon, the [`Transport`] over its
//! FIFO pair, and an event pump task that applies notifications to the
//! session's observable state before fanning them out to [`EventStream`]
//! subscribers.
//!
//! Verbs never hold a lock across I/O: the transport handle is cloned out
//! of the state mutex and the request is awaited afterwards, so any number
//! of verbs may be in flight at once.

pub mod events;
mod handshake;
pub mod state;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::SwarmConfig;
use crate::daemon::{self, DaemonConnection, DaemonLauncher, DaemonProcess, LaunchSpec};
use crate::protocol::{
    request, AutonomyLevel, Notification, NotificationKind, PermissionDecision, Request,
    RequestId, RequestIds, SessionSettings,
};
use crate::swarm::message::AgentMessage;
use crate::transport::Transport;
use crate::{AppError, Result};

pub use events::EventStream;
pub use state::{ExecutionState, LifecycleState};

use handshake::Handshake;

/// Model used when the caller does not name one.
pub const DEFAULT_MODEL: &str = "claude-opus-4-5-20251101";

/// How a session is launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    /// Model identifier. Ignored when resuming.
    pub model: String,
    /// Daemon working directory, also sent as `cwd` on initialize.
    pub working_directory: PathBuf,
    /// Namespace for FIFO names.
    pub pr_number: String,
    /// Existing session to load instead of initializing a new one.
    pub resume_session_id: Option<String>,
    /// Overrides the configured autonomy level.
    pub auto_level: Option<AutonomyLevel>,
}

impl SessionOptions {
    /// Options for a new session of `model` in the current directory.
    #[must_use]
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            working_directory: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            pr_number: String::new(),
            resume_session_id: None,
            auto_level: None,
        }
    }

    /// Set the working directory.
    #[must_use]
    pub fn working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = dir.into();
        self
    }

    /// Set the FIFO namespace.
    #[must_use]
    pub fn pr_number(mut self, pr_number: impl Into<String>) -> Self {
        self.pr_number = pr_number.into();
        self
    }

    /// Resume `session_id` instead of starting fresh.
    #[must_use]
    pub fn resume(mut self, session_id: impl Into<String>) -> Self {
        self.resume_session_id = Some(session_id.into());
        self
    }

    /// Override the autonomy level.
    #[must_use]
    pub fn auto_level(mut self, level: AutonomyLevel) -> Self {
        self.auto_level = Some(level);
        self
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::new(DEFAULT_MODEL)
    }
}

// ── Shared state ─────────────────────────────────────────────────────────────

/// State read by observers and written by verbs and the event pump.
struct Observed {
    lifecycle: LifecycleState,
    session_id: Option<String>,
    execution: ExecutionState,
    title: Option<String>,
    /// Outstanding permission prompts: request id → tool name.
    permissions: HashMap<String, String>,
    transport: Option<Arc<Transport>>,
    /// One sender per live [`EventStream`]; `None` once the session can no
    /// longer produce notifications.
    events: Option<Vec<mpsc::UnboundedSender<Notification>>>,
}

impl Observed {
    fn transition(&mut self, name: &str, next: LifecycleState) -> Result<()> {
        if !self.lifecycle.can_transition_to(next) {
            return Err(AppError::InvalidState(format!(
                "session {name} cannot move from {} to {next}",
                self.lifecycle
            )));
        }
        self.lifecycle = next;
        Ok(())
    }
}

struct Shared {
    name: String,
    observed: Mutex<Observed>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Observed> {
        self.observed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `notification` to the observable state and hand it to every
    /// subscriber. Both happen under one lock, so a subscriber never sees a
    /// notification before its effect is observable.
    fn publish(&self, notification: Notification) {
        let mut observed = self.lock();
        match notification.kind() {
            NotificationKind::WorkingStateChanged => {
                if let Some(state) = notification.new_state() {
                    observed.execution = ExecutionState::parse(state);
                }
            }
            NotificationKind::SessionTitleUpdated => {
                if let Some(title) = notification.title() {
                    observed.title = Some(title.to_owned());
                }
            }
            NotificationKind::PermissionRequest => {
                match (notification.permission_request_id(), notification.tool_name()) {
                    (Some(id), Some(tool)) => {
                        debug!(session = %self.name, request_id = %id, tool, "permission requested");
                        observed.permissions.insert(id.to_owned(), tool.to_owned());
                    }
                    _ => warn!(
                        session = %self.name,
                        "permission_request without requestId or toolName ignored"
                    ),
                }
            }
            _ => {}
        }
        if let Some(subscribers) = observed.events.as_mut() {
            subscribers.retain(|tx| tx.send(notification.clone()).is_ok());
        }
    }
}

struct Running {
    process: DaemonProcess,
    pump: JoinHandle<()>,
}

// ── Session ──────────────────────────────────────────────────────────────────

/// Handle to one agent conversation.
pub struct Session {
    shared: Arc<Shared>,
    options: SessionOptions,
    config: Arc<SwarmConfig>,
    launcher: Arc<dyn DaemonLauncher>,
    ids: RequestIds,
    /// Held for the whole of `start` and `cleanup`, never by verbs.
    daemon: tokio::sync::Mutex<Option<Running>>,
}

impl Session {
    /// Create an unstarted session.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        options: SessionOptions,
        config: Arc<SwarmConfig>,
        launcher: Arc<dyn DaemonLauncher>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                observed: Mutex::new(Observed {
                    lifecycle: LifecycleState::Unstarted,
                    session_id: options.resume_session_id.clone(),
                    execution: ExecutionState::default(),
                    title: None,
                    permissions: HashMap::new(),
                    transport: None,
                    events: Some(Vec::new()),
                }),
            }),
            options,
            config,
            launcher,
            ids: RequestIds::new(),
            daemon: tokio::sync::Mutex::new(None),
        }
    }

    /// Launch the daemon and perform the handshake.
    ///
    /// Resumes when the options carry a session id. Returns the session id
    /// reported by the daemon.
    ///
    /// # Errors
    ///
    /// - [`AppError::InvalidState`] unless the session is unstarted.
    /// - Launch errors ([`AppError::DaemonStart`],
    ///   [`AppError::DaemonStartTimeout`]) and handshake errors. On any
    ///   failure the daemon is torn down and the session moves to `Failed`.
    pub async fn start(&self) -> Result<String> {
        let span = info_span!(
            "session_start",
            session = %self.shared.name,
            model = %self.options.model,
            resume = self.options.resume_session_id.is_some()
        );
        self.start_inner().instrument(span).await
    }

    async fn start_inner(&self) -> Result<String> {
        let mut daemon = self.daemon.lock().await;
        self.shared
            .lock()
            .transition(&self.shared.name, LifecycleState::Starting)?;

        let spec = LaunchSpec {
            name: self.shared.name.clone(),
            model: self.options.model.clone(),
            pr_number: self.options.pr_number.clone(),
            working_directory: self.options.working_directory.clone(),
            auto_level: self.options.auto_level.unwrap_or(self.config.auto_level),
        };
        let launched = match &self.options.resume_session_id {
            Some(session_id) => self.launcher.resume(session_id, &spec).await,
            None => self.launcher.start_new(&spec).await,
        };
        let DaemonConnection {
            process,
            reader,
            writer,
        } = match launched {
            Ok(connection) => connection,
            Err(e) => {
                warn!(error = %e, "daemon launch failed");
                self.mark_failed();
                return Err(e);
            }
        };

        let (transport, notifications) =
            Transport::open(self.shared.name.clone(), reader, writer, &self.config.transport);
        let transport = Arc::new(transport);
        let pump = tokio::spawn(pump_events(Arc::clone(&self.shared), notifications));
        let running = Running { process, pump };

        let machine_id = daemon::machine_id();
        let cwd = self.options.working_directory.to_string_lossy();
        let handshake = match &self.options.resume_session_id {
            Some(session_id) => Handshake::Load { session_id },
            None => Handshake::Initialize {
                machine_id: &machine_id,
                cwd: &cwd,
            },
        };

        match handshake::perform(&transport, &self.ids, handshake, self.config.timeouts.startup())
            .await
        {
            Ok(session_id) => {
                {
                    let mut observed = self.shared.lock();
                    observed.lifecycle = LifecycleState::Ready;
                    observed.session_id = Some(session_id.clone());
                    observed.transport = Some(transport);
                }
                *daemon = Some(running);
                info!(%session_id, "session ready");
                Ok(session_id)
            }
            Err(e) => {
                warn!(error = %e, "handshake failed, tearing daemon down");
                self.teardown(Some(transport), Some(running)).await;
                self.mark_failed();
                Err(e)
            }
        }
    }

    fn mark_failed(&self) {
        let mut observed = self.shared.lock();
        observed.lifecycle = LifecycleState::Failed;
        observed.events = None;
    }

    /// Tear the session down: close the transport, terminate the daemon,
    /// end every event stream, and move to `Closed`.
    ///
    /// Valid from any state. Idempotent. Teardown failures are logged and
    /// do not stop the remaining steps.
    pub async fn cleanup(&self) {
        let span = info_span!("session_cleanup", session = %self.shared.name);
        async {
            let mut daemon = self.daemon.lock().await;
            let transport = {
                let mut observed = self.shared.lock();
                if observed.lifecycle == LifecycleState::Closed {
                    debug!("session already closed");
                    return;
                }
                observed.lifecycle = LifecycleState::Closed;
                observed.events = None;
                observed.permissions.clear();
                observed.transport.take()
            };
            self.teardown(transport, daemon.take()).await;
            info!("session closed");
        }
        .instrument(span)
        .await;
    }

    async fn teardown(&self, transport: Option<Arc<Transport>>, running: Option<Running>) {
        if let Some(transport) = transport {
            transport.close().await;
        }
        let Some(Running { mut process, pump }) = running else {
            return;
        };
        if let Err(e) = process.terminate(self.config.timeouts.terminate_grace()).await {
            warn!(error = %e, "daemon termination failed");
        }
        if let Err(e) = pump.await {
            warn!(error = %e, "event pump join failed");
        }
    }

    // ── Verbs ────────────────────────────────────────────────────────────────

    /// Verbs bound to the configured default request timeout.
    #[must_use]
    pub fn calls(&self) -> SessionCalls<'_> {
        SessionCalls {
            session: self,
            timeout: self.config.timeouts.request(),
        }
    }

    /// Verbs bound to an explicit request timeout.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> SessionCalls<'_> {
        SessionCalls {
            session: self,
            timeout: Some(timeout),
        }
    }

    /// Send a user message; returns once the daemon acknowledges it.
    ///
    /// # Errors
    ///
    /// See [`SessionCalls::send`].
    pub async fn send(&self, text: &str) -> Result<()> {
        self.calls().send(text).await
    }

    /// Deliver `text` to `target`, tagged as coming from this session.
    ///
    /// # Errors
    ///
    /// As [`send`](Self::send) on `target`.
    pub async fn send_to(&self, target: &Session, text: &str) -> Result<()> {
        let message = AgentMessage::new(self.name(), target.name(), text);
        target.send(&message.format()).await
    }

    /// Ask the daemon to stop its current turn.
    ///
    /// # Errors
    ///
    /// See [`SessionCalls::interrupt`].
    pub async fn interrupt(&self) -> Result<()> {
        self.calls().interrupt().await
    }

    /// Change autonomy level and/or model.
    ///
    /// # Errors
    ///
    /// See [`SessionCalls::update_settings`].
    pub async fn update_settings(&self, settings: &SessionSettings) -> Result<()> {
        self.calls().update_settings(settings).await
    }

    /// Answer a permission prompt.
    ///
    /// # Errors
    ///
    /// See [`SessionCalls::respond_to_permission`].
    pub async fn respond_to_permission(
        &self,
        request_id: &str,
        decision: PermissionDecision,
    ) -> Result<()> {
        self.calls().respond_to_permission(request_id, decision).await
    }

    /// Authenticate an MCP server.
    ///
    /// # Errors
    ///
    /// See [`SessionCalls::authenticate_mcp_server`].
    pub async fn authenticate_mcp_server(
        &self,
        server_name: &str,
        auth_token: Option<&str>,
    ) -> Result<Value> {
        self.calls()
            .authenticate_mcp_server(server_name, auth_token)
            .await
    }

    /// Retry connecting to an MCP server.
    ///
    /// # Errors
    ///
    /// See [`SessionCalls::retry_mcp_server`].
    pub async fn retry_mcp_server(&self, server_name: &str) -> Result<Value> {
        self.calls().retry_mcp_server(server_name).await
    }

    /// Enable or disable an MCP server.
    ///
    /// # Errors
    ///
    /// See [`SessionCalls::toggle_mcp_server`].
    pub async fn toggle_mcp_server(&self, server_name: &str, enabled: bool) -> Result<Value> {
        self.calls().toggle_mcp_server(server_name, enabled).await
    }

    /// Forget stored MCP credentials.
    ///
    /// # Errors
    ///
    /// See [`SessionCalls::clear_mcp_auth`].
    pub async fn clear_mcp_auth(&self, server_name: &str) -> Result<Value> {
        self.calls().clear_mcp_auth(server_name).await
    }

    /// A new subscriber to this session's notifications.
    ///
    /// The stream sees every notification published after it was created,
    /// however slowly it is drained. It ends when the session closes or the
    /// daemon disconnects; a stream requested after that ends immediately.
    #[must_use]
    pub fn events(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(subscribers) = self.shared.lock().events.as_mut() {
            subscribers.push(tx);
        }
        EventStream::new(self.shared.name.clone(), rx)
    }

    // ── Observers ────────────────────────────────────────────────────────────

    /// Session name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Model requested at launch.
    #[must_use]
    pub fn model(&self) -> &str {
        &self.options.model
    }

    /// Daemon working directory.
    #[must_use]
    pub fn working_directory(&self) -> &Path {
        &self.options.working_directory
    }

    /// Daemon-assigned id, once known.
    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.shared.lock().session_id.clone()
    }

    /// Lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.shared.lock().lifecycle
    }

    /// Last working state reported by the daemon.
    #[must_use]
    pub fn execution_state(&self) -> ExecutionState {
        self.shared.lock().execution.clone()
    }

    /// Last title reported by the daemon.
    #[must_use]
    pub fn title(&self) -> Option<String> {
        self.shared.lock().title.clone()
    }

    /// Ids of permission prompts not yet answered, sorted.
    #[must_use]
    pub fn pending_permissions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.shared.lock().permissions.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Ready and still connected to its daemon.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        let observed = self.shared.lock();
        observed.lifecycle == LifecycleState::Ready
            && observed
                .transport
                .as_ref()
                .is_some_and(|transport| !transport.is_closed())
    }

    fn ready_transport(&self) -> Result<Arc<Transport>> {
        let observed = self.shared.lock();
        match (observed.lifecycle, &observed.transport) {
            (LifecycleState::Ready, Some(transport)) => Ok(Arc::clone(transport)),
            (state, _) => Err(AppError::InvalidState(format!(
                "session {} is {state}",
                self.shared.name
            ))),
        }
    }

    fn take_permission(&self, request_id: &str) -> Result<String> {
        self.shared
            .lock()
            .permissions
            .remove(request_id)
            .ok_or_else(|| {
                AppError::UnknownPermissionRequest(format!(
                    "session {} has no outstanding permission request {request_id}",
                    self.shared.name
                ))
            })
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.shared.name)
            .field("model", &self.options.model)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// ── Verbs with a timeout ─────────────────────────────────────────────────────

/// Session verbs bound to one request timeout.
///
/// Obtained from [`Session::calls`] or [`Session::with_timeout`]. Expiry
/// fails the verb with [`AppError::RequestTimeout`]; the session stays
/// usable.
#[derive(Debug, Clone, Copy)]
pub struct SessionCalls<'a> {
    session: &'a Session,
    timeout: Option<Duration>,
}

impl SessionCalls<'_> {
    /// `droid.add_user_message`.
    ///
    /// # Errors
    ///
    /// [`AppError::InvalidState`] unless ready, [`AppError::MalformedRequest`]
    /// for blank text, and any transport or daemon error.
    pub async fn send(&self, text: &str) -> Result<()> {
        self.call(|id| request::add_user_message(id, text))
            .await
            .map(drop)
    }

    /// `droid.interrupt_session`. Never changes the lifecycle state.
    ///
    /// # Errors
    ///
    /// [`AppError::InvalidState`] unless ready, and any transport or daemon
    /// error.
    pub async fn interrupt(&self) -> Result<()> {
        self.call(|id| Ok(request::interrupt_session(id)))
            .await
            .map(drop)
    }

    /// `droid.update_session_settings`.
    ///
    /// # Errors
    ///
    /// [`AppError::MalformedRequest`] if `settings` is empty, plus the
    /// errors of [`send`](Self::send).
    pub async fn update_settings(&self, settings: &SessionSettings) -> Result<()> {
        self.call(|id| request::update_session_settings(id, settings))
            .await
            .map(drop)
    }

    /// `droid.request_permission` for a prompt delivered by a
    /// `permission_request` notification.
    ///
    /// The prompt is consumed by this call whether or not the daemon
    /// accepts the answer.
    ///
    /// # Errors
    ///
    /// [`AppError::UnknownPermissionRequest`] if `request_id` is not an
    /// outstanding prompt, plus the errors of [`send`](Self::send).
    pub async fn respond_to_permission(
        &self,
        request_id: &str,
        decision: PermissionDecision,
    ) -> Result<()> {
        self.call(|id| {
            let tool_name = self.session.take_permission(request_id)?;
            request::request_permission(id, request_id, &tool_name, decision)
        })
        .await
        .map(drop)
    }

    /// `droid.authenticate_mcp_server`; returns the daemon's result.
    ///
    /// # Errors
    ///
    /// As [`send`](Self::send).
    pub async fn authenticate_mcp_server(
        &self,
        server_name: &str,
        auth_token: Option<&str>,
    ) -> Result<Value> {
        self.call(|id| request::authenticate_mcp_server(id, server_name, auth_token))
            .await
    }

    /// `droid.retry_mcp_server`; returns the daemon's result.
    ///
    /// # Errors
    ///
    /// As [`send`](Self::send).
    pub async fn retry_mcp_server(&self, server_name: &str) -> Result<Value> {
        self.call(|id| request::retry_mcp_server(id, server_name))
            .await
    }

    /// `droid.toggle_mcp_server`; returns the daemon's result.
    ///
    /// # Errors
    ///
    /// As [`send`](Self::send).
    pub async fn toggle_mcp_server(&self, server_name: &str, enabled: bool) -> Result<Value> {
        self.call(|id| request::toggle_mcp_server(id, server_name, enabled))
            .await
    }

    /// `droid.clear_mcp_auth`; returns the daemon's result.
    ///
    /// # Errors
    ///
    /// As [`send`](Self::send).
    pub async fn clear_mcp_auth(&self, server_name: &str) -> Result<Value> {
        self.call(|id| request::clear_mcp_auth(id, server_name))
            .await
    }

    async fn call<F>(&self, build: F) -> Result<Value>
    where
        F: FnOnce(RequestId) -> Result<Request>,
    {
        let transport = self.session.ready_transport()?;
        let request = build(self.session.ids.next_id())?;
        debug!(
            session = %self.session.name(),
            request_id = %request.id,
            method = %request.method,
            "issuing request"
        );
        transport.call(request, self.timeout).await
    }
}

// ── Event pump ───────────────────────────────────────────────────────────────

/// Apply each notification to the observable state, then fan it out.
///
/// Ends when the transport's read task stops; the subscriber senders are
/// dropped with it so every [`EventStream`] ends too.
async fn pump_events(shared: Arc<Shared>, mut notifications: mpsc::Receiver<Notification>) {
    while let Some(notification) = notifications.recv().await {
        shared.publish(notification);
    }
    shared.lock().events = None;
    debug!(session = %shared.name, "event pump stopped");
}
