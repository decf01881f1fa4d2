//! Integration tests for `Swarm` with scripted in-memory daemons.
//!
//! Covers:
//! - name uniqueness, including two concurrent spawns of one name
//! - routing through `send_to` and `broadcast`
//! - remove / shutdown closing every session
//! - spawns racing a shutdown
//! - `Swarm::scope`

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use droid_swarm::daemon::DaemonLauncher;
use droid_swarm::protocol::Method;
use droid_swarm::session::LifecycleState;
use droid_swarm::{AgentMessage, AppError, Swarm, SwarmContext};

use super::test_helpers::{
    ack_all, handshake_steps, test_config, Script, ScriptedLauncher, Step, OPUS_MODEL,
};

const CODEX_MODEL: &str = "gpt-5.1-codex";

fn context() -> SwarmContext {
    SwarmContext::new("42")
        .repo("acme/widgets")
        .branches("feature/login", "main")
        .cwd("/work/widgets")
}

fn swarm_with(launcher: &Arc<ScriptedLauncher>) -> Swarm {
    Swarm::new(
        context(),
        test_config(),
        Arc::clone(launcher) as Arc<dyn DaemonLauncher>,
    )
}

// ── Spawning ────────────────────────────────────────────────────────────────

/// Spawned sessions inherit the context's working directory and PR number.
#[tokio::test]
async fn spawn_registers_ready_session() {
    let launcher = Arc::new(ScriptedLauncher::new(ack_all()));
    let swarm = swarm_with(&launcher);
    assert!(swarm.is_empty());

    let opus = swarm.spawn("opus", OPUS_MODEL).await.expect("spawn");
    assert_eq!(opus.state(), LifecycleState::Ready);
    assert_eq!(opus.working_directory().to_str(), Some("/work/widgets"));
    assert_eq!(swarm.len(), 1);
    assert!(Arc::ptr_eq(&opus, &swarm.get("opus").unwrap()));

    let init = launcher.seen_by("opus", Method::InitializeSession);
    assert_eq!(init[0].params["cwd"], "/work/widgets");
    swarm.shutdown().await;
}

/// A second spawn of a taken name fails and leaves the first session usable.
#[tokio::test]
async fn duplicate_name_is_rejected() {
    let launcher = Arc::new(ScriptedLauncher::new(ack_all()));
    let swarm = swarm_with(&launcher);
    swarm.spawn("opus", OPUS_MODEL).await.unwrap();

    let err = swarm.spawn("opus", CODEX_MODEL).await.unwrap_err();
    assert_eq!(err, AppError::DuplicateName("opus".into()));
    assert_eq!(launcher.launches(), 1);

    swarm.send_to("user", "opus", "still there?").await.unwrap();
    assert!(swarm.get("opus").unwrap().is_alive());
    swarm.shutdown().await;
}

/// Two concurrent spawns of one name: exactly one wins, one daemon starts.
#[tokio::test]
async fn concurrent_spawns_of_one_name() {
    let launcher =
        Arc::new(ScriptedLauncher::new(ack_all()).with_launch_delay(Duration::from_millis(200)));
    let swarm = swarm_with(&launcher);

    let (first, second) = tokio::join!(
        swarm.spawn("opus", OPUS_MODEL),
        swarm.spawn("opus", OPUS_MODEL)
    );
    let outcomes = [first.is_ok(), second.is_ok()];
    assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);
    let err = first.err().or(second.err()).unwrap();
    assert_eq!(err, AppError::DuplicateName("opus".into()));
    assert_eq!(launcher.launches(), 1);
    assert_eq!(swarm.agents(), vec!["opus".to_owned()]);
    swarm.shutdown().await;
}

/// Blank names are refused before anything is launched.
#[tokio::test]
async fn blank_name_is_invalid() {
    let launcher = Arc::new(ScriptedLauncher::new(ack_all()));
    let swarm = swarm_with(&launcher);

    let err = swarm.spawn("  ", OPUS_MODEL).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidState(_)), "got {err}");
    assert_eq!(launcher.launches(), 0);
}

/// A failed spawn releases the name.
#[tokio::test]
async fn failed_spawn_releases_the_name() {
    let launcher = Arc::new(ScriptedLauncher::failing(AppError::DaemonStart(
        "droid not found".into(),
    )));
    let swarm = swarm_with(&launcher);

    let err = swarm.spawn("opus", OPUS_MODEL).await.unwrap_err();
    assert!(matches!(err, AppError::DaemonStart(_)), "got {err}");
    assert!(swarm.is_empty());

    let err = swarm.spawn("opus", OPUS_MODEL).await.unwrap_err();
    assert!(matches!(err, AppError::DaemonStart(_)), "name was released: {err}");
    assert_eq!(launcher.launches(), 2);
}

/// Options may resume an earlier session.
#[tokio::test]
async fn spawn_with_resumes() {
    let launcher = Arc::new(ScriptedLauncher::new(ack_all()));
    let swarm = swarm_with(&launcher);

    let options = swarm.session_options(OPUS_MODEL).resume("sess-yesterday");
    let opus = swarm.spawn_with("opus", options).await.unwrap();
    assert_eq!(opus.session_id().as_deref(), Some("sess-yesterday"));
    assert_eq!(launcher.resumes(), vec!["sess-yesterday".to_owned()]);
    swarm.shutdown().await;
}

// ── Routing ─────────────────────────────────────────────────────────────────

/// A message to a missing agent fails with `UnknownAgent`; the sender is
/// unaffected.
#[tokio::test]
async fn send_to_missing_agent() {
    let launcher = Arc::new(ScriptedLauncher::new(ack_all()));
    let swarm = swarm_with(&launcher);
    let opus = swarm.spawn("opus", OPUS_MODEL).await.unwrap();

    let err = swarm.send_to("opus", "codex", "hello").await.unwrap_err();
    assert_eq!(err, AppError::UnknownAgent("codex".into()));

    assert!(opus.is_alive());
    opus.send("carry on").await.unwrap();
    swarm.shutdown().await;
}

/// `send_to` wraps the text in a `<MESSAGE>` envelope naming both agents.
#[tokio::test]
async fn send_to_wraps_the_message() {
    let launcher = Arc::new(ScriptedLauncher::new(ack_all()));
    let swarm = swarm_with(&launcher);
    swarm.spawn("opus", OPUS_MODEL).await.unwrap();
    swarm.spawn("codex", CODEX_MODEL).await.unwrap();

    swarm
        .send_to("opus", "codex", "check the migration")
        .await
        .unwrap();

    let delivered = launcher.seen_by("codex", Method::AddUserMessage);
    assert_eq!(delivered.len(), 1);
    let parsed = AgentMessage::parse(delivered[0].params["text"].as_str().unwrap())
        .expect("envelope parses");
    assert_eq!(parsed.from, "opus");
    assert_eq!(parsed.to, "codex");
    assert_eq!(parsed.content, "check the migration");
    assert!(launcher.seen_by("opus", Method::AddUserMessage).is_empty());
    swarm.shutdown().await;
}

/// Broadcast skips the sender and reports per-agent outcomes.
#[tokio::test]
async fn broadcast_reports_each_recipient() {
    let script: Script = Arc::new(|spec, request| {
        if let Some(steps) = handshake_steps(spec, request) {
            return steps;
        }
        if spec.name == "gemini" {
            vec![Step::Fail(-32001, "busy".into())]
        } else {
            vec![Step::Ack(json!({}))]
        }
    });
    let launcher = Arc::new(ScriptedLauncher::new(script));
    let swarm = swarm_with(&launcher);
    for name in ["opus", "codex", "gemini"] {
        swarm.spawn(name, OPUS_MODEL).await.unwrap();
    }

    let report = swarm.broadcast("opus", "rebase done").await;
    assert_eq!(report.delivered, vec!["codex".to_owned()]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "gemini");
    assert!(matches!(report.failed[0].1, AppError::Rpc { code: -32001, .. }));
    assert!(!report.is_complete());
    assert!(launcher.seen_by("opus", Method::AddUserMessage).is_empty());
    swarm.shutdown().await;
}

// ── Introspection ───────────────────────────────────────────────────────────

/// `agents` is sorted; `session_ids` maps every agent to its id.
#[tokio::test]
async fn agents_and_session_ids() {
    let launcher = Arc::new(ScriptedLauncher::new(ack_all()));
    let swarm = swarm_with(&launcher);
    swarm.spawn("opus", OPUS_MODEL).await.unwrap();
    swarm.spawn("codex", CODEX_MODEL).await.unwrap();

    assert_eq!(swarm.agents(), vec!["codex".to_owned(), "opus".to_owned()]);
    let ids = swarm.session_ids();
    assert_eq!(ids["opus"].as_deref(), Some("sess-opus"));
    assert_eq!(ids["codex"].as_deref(), Some("sess-codex"));
    assert_eq!(swarm.context().base_branch, "main");
    swarm.shutdown().await;
}

// ── Teardown ────────────────────────────────────────────────────────────────

/// `remove` closes one session and frees its name.
#[tokio::test]
async fn remove_closes_the_session() {
    let launcher = Arc::new(ScriptedLauncher::new(ack_all()));
    let swarm = swarm_with(&launcher);
    let opus = swarm.spawn("opus", OPUS_MODEL).await.unwrap();
    swarm.spawn("codex", CODEX_MODEL).await.unwrap();

    swarm.remove("opus").await.unwrap();
    assert_eq!(opus.state(), LifecycleState::Closed);
    assert_eq!(swarm.agents(), vec!["codex".to_owned()]);
    assert_eq!(
        swarm.remove("opus").await.unwrap_err(),
        AppError::UnknownAgent("opus".into())
    );

    swarm.spawn("opus", OPUS_MODEL).await.expect("name is free again");
    swarm.shutdown().await;
}

/// `shutdown` closes every session and leaves a reusable, empty swarm.
#[tokio::test]
async fn shutdown_closes_everything() {
    let launcher = Arc::new(ScriptedLauncher::new(ack_all()));
    let swarm = swarm_with(&launcher);
    let opus = swarm.spawn("opus", OPUS_MODEL).await.unwrap();
    let codex = swarm.spawn("codex", CODEX_MODEL).await.unwrap();
    let mut events = opus.events();

    swarm.shutdown().await;
    assert!(swarm.is_empty());
    assert_eq!(opus.state(), LifecycleState::Closed);
    assert_eq!(codex.state(), LifecycleState::Closed);
    assert!(events.next().await.is_none());

    swarm.shutdown().await;
    swarm.spawn("opus", OPUS_MODEL).await.expect("swarm is reusable");
    swarm.shutdown().await;
}

/// A spawn still starting when the swarm shuts down fails and its session
/// is cleaned up.
#[tokio::test]
async fn spawn_racing_shutdown_fails() {
    let launcher =
        Arc::new(ScriptedLauncher::new(ack_all()).with_launch_delay(Duration::from_millis(300)));
    let swarm = Arc::new(swarm_with(&launcher));

    let spawning = {
        let swarm = Arc::clone(&swarm);
        tokio::spawn(async move { swarm.spawn("opus", OPUS_MODEL).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    swarm.shutdown().await;

    let err = spawning.await.unwrap().unwrap_err();
    assert!(matches!(err, AppError::InvalidState(_)), "got {err}");
    assert!(swarm.is_empty());
}

/// `scope` shuts the swarm down after the body, on success and on error.
#[tokio::test]
async fn scope_always_shuts_down() {
    let launcher = Arc::new(ScriptedLauncher::new(ack_all()));

    let opus = Swarm::scope(
        context(),
        test_config(),
        Arc::clone(&launcher) as Arc<dyn DaemonLauncher>,
        |swarm| async move {
            let opus = swarm.spawn("opus", OPUS_MODEL).await?;
            opus.send("ping").await?;
            Ok::<_, AppError>(opus)
        },
    )
    .await
    .unwrap();
    assert_eq!(opus.state(), LifecycleState::Closed);

    let mut spawned = None;
    let err = Swarm::scope(
        context(),
        test_config(),
        Arc::clone(&launcher) as Arc<dyn DaemonLauncher>,
        |swarm| {
            let spawned = &mut spawned;
            async move {
                *spawned = Some(swarm.spawn("codex", CODEX_MODEL).await?);
                swarm.send_to("codex", "nobody", "hello").await?;
                Ok::<_, AppError>(())
            }
        },
    )
    .await
    .unwrap_err();
    assert_eq!(err, AppError::UnknownAgent("nobody".into()));
    assert_eq!(spawned.unwrap().state(), LifecycleState::Closed);
}
