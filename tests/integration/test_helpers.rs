//! Shared helpers for integration tests.
//!
//! [`ScriptedLauncher`] implements `DaemonLauncher` with in-memory daemons
//! served over `tokio::io::duplex`. Each daemon decodes request lines and
//! answers according to a [`Script`] in a task of its own, so tests control
//! the ordering of acknowledgements and notifications as well as delays,
//! garbage lines and hang-ups.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, WriteHalf};

use droid_swarm::config::SwarmConfig;
use droid_swarm::daemon::{
    DaemonConnection, DaemonLauncher, DaemonProcess, LaunchFuture, LaunchSpec,
};
use droid_swarm::protocol::{Method, Notification, NotificationKind, Request, Response};
use droid_swarm::AppError;

/// Model used by the reference scenario.
pub const OPUS_MODEL: &str = "claude-opus-4-5-20251101";

/// Gap between the acknowledgement of a message and its first delta.
pub const PING_PONG_DELAY: Duration = Duration::from_millis(300);

/// One action a scripted daemon takes in reply to a request.
#[derive(Debug, Clone)]
pub enum Step {
    /// Answer the request successfully with this result.
    Ack(Value),
    /// Answer the request with an error object.
    Fail(i64, String),
    /// Emit a session notification.
    Notify(Notification),
    /// Write a raw line verbatim.
    Raw(String),
    /// Pause before the next step.
    Sleep(Duration),
    /// Close the daemon's streams.
    HangUp,
}

/// Maps each request to the steps the daemon performs.
pub type Script = Arc<dyn Fn(&LaunchSpec, &Request) -> Vec<Step> + Send + Sync>;

/// Build a notification of `kind` with `payload`.
pub fn notification(kind: NotificationKind, payload: Value) -> Notification {
    Notification::new(kind, payload)
}

/// Handshake replies every script starts from.
pub fn handshake_steps(spec: &LaunchSpec, request: &Request) -> Option<Vec<Step>> {
    match request.method {
        Method::InitializeSession => Some(vec![Step::Ack(json!({
            "sessionId": format!("sess-{}", spec.name)
        }))]),
        Method::LoadSession => Some(vec![Step::Ack(json!({
            "sessionId": request.params["sessionId"].clone()
        }))]),
        _ => None,
    }
}

/// Acknowledge everything.
pub fn ack_all() -> Script {
    Arc::new(|spec, request| {
        handshake_steps(spec, request).unwrap_or_else(|| vec![Step::Ack(json!({}))])
    })
}

/// The opus reference scenario: acknowledge `add_user_message` at once, then
/// after [`PING_PONG_DELAY`] stream `pong` as assistant deltas bracketed by
/// working-state changes.
pub fn ping_pong() -> Script {
    Arc::new(|spec, request| {
        if let Some(steps) = handshake_steps(spec, request) {
            return steps;
        }
        match request.method {
            Method::AddUserMessage => vec![
                Step::Ack(json!({})),
                Step::Sleep(PING_PONG_DELAY),
                Step::Notify(notification(
                    NotificationKind::WorkingStateChanged,
                    json!({"newState": "streaming_assistant_message"}),
                )),
                Step::Notify(notification(
                    NotificationKind::AssistantTextDelta,
                    json!({"messageId": "m1", "blockIndex": 0, "textDelta": "po"}),
                )),
                Step::Notify(notification(
                    NotificationKind::AssistantTextDelta,
                    json!({"messageId": "m1", "blockIndex": 0, "textDelta": "ng"}),
                )),
                Step::Notify(notification(
                    NotificationKind::WorkingStateChanged,
                    json!({"newState": "idle"}),
                )),
            ],
            _ => vec![Step::Ack(json!({}))],
        }
    })
}

/// One request observed by a scripted daemon.
#[derive(Debug, Clone)]
pub struct Seen {
    /// Name of the session whose daemon received it.
    pub session: String,
    /// The decoded request.
    pub request: Request,
}

/// In-memory `DaemonLauncher`.
pub struct ScriptedLauncher {
    script: Script,
    seen: Arc<Mutex<Vec<Seen>>>,
    launches: AtomicUsize,
    resumes: Mutex<Vec<String>>,
    fail_launch: Option<AppError>,
    launch_delay: Option<Duration>,
}

impl ScriptedLauncher {
    /// Launcher whose daemons follow `script`.
    pub fn new(script: Script) -> Self {
        Self {
            script,
            seen: Arc::new(Mutex::new(Vec::new())),
            launches: AtomicUsize::new(0),
            resumes: Mutex::new(Vec::new()),
            fail_launch: None,
            launch_delay: None,
        }
    }

    /// Every launch fails with `error`.
    pub fn failing(error: AppError) -> Self {
        Self {
            fail_launch: Some(error),
            ..Self::new(ack_all())
        }
    }

    /// Delay each launch, to widen race windows.
    pub fn with_launch_delay(mut self, delay: Duration) -> Self {
        self.launch_delay = Some(delay);
        self
    }

    /// Requests received so far, across all daemons.
    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    /// Requests of `method` received by the daemon of `session`.
    pub fn seen_by(&self, session: &str, method: Method) -> Vec<Request> {
        self.seen()
            .into_iter()
            .filter(|s| s.session == session && s.request.method == method)
            .map(|s| s.request)
            .collect()
    }

    /// Number of launch attempts.
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Session ids passed to `resume`.
    pub fn resumes(&self) -> Vec<String> {
        self.resumes.lock().unwrap().clone()
    }

    async fn launch(&self, spec: &LaunchSpec) -> droid_swarm::Result<DaemonConnection> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.launch_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = &self.fail_launch {
            return Err(error.clone());
        }

        let (client, daemon) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(client);
        tokio::spawn(serve(
            spec.clone(),
            daemon,
            Arc::clone(&self.script),
            Arc::clone(&self.seen),
        ));

        Ok(DaemonConnection {
            process: DaemonProcess::detached(spec.name.clone()),
            reader: Box::new(reader),
            writer: Box::new(writer),
        })
    }
}

impl DaemonLauncher for ScriptedLauncher {
    fn start_new<'a>(&'a self, spec: &'a LaunchSpec) -> LaunchFuture<'a> {
        Box::pin(self.launch(spec))
    }

    fn resume<'a>(&'a self, session_id: &'a str, spec: &'a LaunchSpec) -> LaunchFuture<'a> {
        self.resumes.lock().unwrap().push(session_id.to_owned());
        Box::pin(self.launch(spec))
    }
}

type SharedWriter = Arc<tokio::sync::Mutex<Option<WriteHalf<DuplexStream>>>>;

/// Read requests and run each one's steps in its own task, so replies to
/// different requests may interleave.
async fn serve(spec: LaunchSpec, stream: DuplexStream, script: Script, seen: Arc<Mutex<Vec<Seen>>>) {
    let (read_half, write_half) = tokio::io::split(stream);
    let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(Some(write_half)));
    let mut lines = BufReader::new(read_half).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let request = Request::decode(&line).unwrap();
        seen.lock().unwrap().push(Seen {
            session: spec.name.clone(),
            request: request.clone(),
        });
        let steps = script(&spec, &request);
        tokio::spawn(perform(request, steps, Arc::clone(&writer)));
    }
}

async fn perform(request: Request, steps: Vec<Step>, writer: SharedWriter) {
    for step in steps {
        let line = match step {
            Step::Ack(result) => Response::success(request.id.clone(), result)
                .encode()
                .unwrap(),
            Step::Fail(code, message) => Response::failure(request.id.clone(), code, message)
                .encode()
                .unwrap(),
            Step::Notify(notification) => notification.encode().unwrap(),
            Step::Raw(raw) => raw,
            Step::Sleep(delay) => {
                tokio::time::sleep(delay).await;
                continue;
            }
            Step::HangUp => {
                if let Some(mut half) = writer.lock().await.take() {
                    half.shutdown().await.ok();
                }
                return;
            }
        };
        let mut guard = writer.lock().await;
        let Some(half) = guard.as_mut() else {
            return;
        };
        if half.write_all(format!("{line}\n").as_bytes()).await.is_err() {
            return;
        }
    }
}

/// Configuration for in-memory tests: no default request timeout, short
/// startup window.
pub fn test_config() -> Arc<SwarmConfig> {
    let mut config = SwarmConfig::default();
    config.timeouts.startup_seconds = 2;
    config.timeouts.terminate_grace_seconds = 1;
    Arc::new(config)
}
