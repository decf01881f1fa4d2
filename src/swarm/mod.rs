//! Registry of concurrently running sessions.
//!
//! Names are reserved before a session starts, so two concurrent spawns of
//! the same name cannot both launch a daemon. The registry lock is only held
//! for map operations; starting, messaging and cleaning up sessions happen
//! outside it.
//!
//! `shutdown` bumps a generation counter. A spawn that was in flight when
//! the swarm shut down notices the new generation on completion, cleans its
//! own session up, and fails with [`AppError::InvalidState`].

pub mod message;

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::join_all;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::SwarmConfig;
use crate::daemon::{DaemonLauncher, FifoLauncher};
use crate::session::{Session, SessionOptions};
use crate::{AppError, Result};

use message::AgentMessage;

/// Context shared by every session of a swarm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwarmContext {
    /// Pull request the swarm works on; namespaces FIFO names.
    pub pr_number: String,
    /// Repository, e.g. `owner/name`.
    pub repo: String,
    /// Branch under review.
    pub branch: String,
    /// Branch the change targets.
    pub base_branch: String,
    /// Working directory for every daemon.
    pub cwd: PathBuf,
}

impl SwarmContext {
    /// Context for `pr_number`, working in the current directory.
    #[must_use]
    pub fn new(pr_number: impl Into<String>) -> Self {
        Self {
            pr_number: pr_number.into(),
            repo: String::new(),
            branch: String::new(),
            base_branch: String::new(),
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Set the repository.
    #[must_use]
    pub fn repo(mut self, repo: impl Into<String>) -> Self {
        self.repo = repo.into();
        self
    }

    /// Set the branch and its base.
    #[must_use]
    pub fn branches(mut self, branch: impl Into<String>, base_branch: impl Into<String>) -> Self {
        self.branch = branch.into();
        self.base_branch = base_branch.into();
        self
    }

    /// Set the working directory.
    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = cwd.into();
        self
    }
}

/// Outcome of [`Swarm::broadcast`].
#[derive(Debug, Default)]
pub struct BroadcastReport {
    /// Agents that acknowledged the message.
    pub delivered: Vec<String>,
    /// Agents whose delivery failed, with the error.
    pub failed: Vec<(String, AppError)>,
}

impl BroadcastReport {
    /// Whether every recipient acknowledged.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

enum Slot {
    Starting { generation: u64 },
    Ready(Arc<Session>),
}

#[derive(Default)]
struct Registry {
    slots: HashMap<String, Slot>,
    generation: u64,
}

/// Coordinator for many named sessions.
pub struct Swarm {
    context: SwarmContext,
    config: Arc<SwarmConfig>,
    launcher: Arc<dyn DaemonLauncher>,
    registry: Mutex<Registry>,
}

impl Swarm {
    /// Create an empty swarm that launches daemons through `launcher`.
    #[must_use]
    pub fn new(
        context: SwarmContext,
        config: Arc<SwarmConfig>,
        launcher: Arc<dyn DaemonLauncher>,
    ) -> Self {
        Self {
            context,
            config,
            launcher,
            registry: Mutex::new(Registry::default()),
        }
    }

    /// Create a swarm using the [`FifoLauncher`].
    ///
    /// # Errors
    ///
    /// [`AppError::Config`] if `config` fails validation.
    pub fn with_fifo_launcher(context: SwarmContext, config: SwarmConfig) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let launcher = Arc::new(FifoLauncher::new(Arc::clone(&config)));
        Ok(Self::new(context, config, launcher))
    }

    /// Run `body` against a fresh swarm and always shut it down afterwards.
    ///
    /// # Errors
    ///
    /// Whatever `body` returns.
    pub async fn scope<F, Fut, T>(
        context: SwarmContext,
        config: Arc<SwarmConfig>,
        launcher: Arc<dyn DaemonLauncher>,
        body: F,
    ) -> Result<T>
    where
        F: FnOnce(Arc<Swarm>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let swarm = Arc::new(Self::new(context, config, launcher));
        let outcome = body(Arc::clone(&swarm)).await;
        swarm.shutdown().await;
        outcome
    }

    /// Shared context.
    #[must_use]
    pub fn context(&self) -> &SwarmContext {
        &self.context
    }

    /// Options for a new session of `model`, filled from the context.
    #[must_use]
    pub fn session_options(&self, model: impl Into<String>) -> SessionOptions {
        SessionOptions::new(model)
            .working_directory(self.context.cwd.clone())
            .pr_number(self.context.pr_number.clone())
    }

    /// Start a new session named `name` running `model`.
    ///
    /// # Errors
    ///
    /// As [`spawn_with`](Self::spawn_with).
    pub async fn spawn(&self, name: &str, model: &str) -> Result<Arc<Session>> {
        self.spawn_with(name, self.session_options(model)).await
    }

    /// Start a session named `name` with explicit options, e.g. to resume.
    ///
    /// # Errors
    ///
    /// - [`AppError::DuplicateName`] if `name` is registered or starting.
    /// - [`AppError::InvalidState`] if `name` is blank or the swarm shut
    ///   down while the session was starting.
    /// - Any error from [`Session::start`]; the name is released.
    pub async fn spawn_with(&self, name: &str, options: SessionOptions) -> Result<Arc<Session>> {
        let span = info_span!("swarm_spawn", agent = %name, model = %options.model);
        async {
            let reservation = self.reserve(name)?;
            let session = Arc::new(Session::new(
                name,
                options,
                Arc::clone(&self.config),
                Arc::clone(&self.launcher),
            ));

            if let Err(e) = session.start().await {
                session.cleanup().await;
                return Err(e);
            }

            if let Err(e) = reservation.commit(Arc::clone(&session)) {
                warn!("swarm shut down while the session was starting");
                session.cleanup().await;
                return Err(e);
            }
            info!("agent joined swarm");
            Ok(session)
        }
        .instrument(span)
        .await
    }

    /// Registered session named `name`.
    ///
    /// # Errors
    ///
    /// [`AppError::UnknownAgent`] if absent or still starting.
    pub fn get(&self, name: &str) -> Result<Arc<Session>> {
        match self.lock().slots.get(name) {
            Some(Slot::Ready(session)) => Ok(Arc::clone(session)),
            _ => Err(AppError::UnknownAgent(name.to_owned())),
        }
    }

    /// Deliver `text` to `to`, tagged as coming from `from`.
    ///
    /// # Errors
    ///
    /// [`AppError::UnknownAgent`] if `to` is not registered, otherwise any
    /// error from the recipient's [`Session::send`].
    pub async fn send_to(&self, from: &str, to: &str, text: &str) -> Result<()> {
        let target = self.get(to)?;
        let message = AgentMessage::new(from, to, text).stamped();
        debug!(from, to, "routing agent message");
        target.send(&message.format()).await
    }

    /// Deliver `text` from `from` to every other registered agent.
    ///
    /// Deliveries run concurrently; a failure for one agent does not stop
    /// the others.
    pub async fn broadcast(&self, from: &str, text: &str) -> BroadcastReport {
        let targets: Vec<Arc<Session>> = self
            .ready_sessions()
            .into_iter()
            .filter(|session| session.name() != from)
            .collect();

        let outcomes = join_all(targets.iter().map(|target| {
            let message = AgentMessage::new(from, target.name(), text).stamped();
            async move { target.send(&message.format()).await }
        }))
        .await;

        let mut report = BroadcastReport::default();
        for (target, outcome) in targets.iter().zip(outcomes) {
            match outcome {
                Ok(()) => report.delivered.push(target.name().to_owned()),
                Err(e) => {
                    warn!(from, to = %target.name(), error = %e, "broadcast delivery failed");
                    report.failed.push((target.name().to_owned(), e));
                }
            }
        }
        report
    }

    /// Names of registered agents, sorted.
    #[must_use]
    pub fn agents(&self) -> Vec<String> {
        self.ready_sessions()
            .iter()
            .map(|session| session.name().to_owned())
            .collect()
    }

    /// Session id of every registered agent.
    #[must_use]
    pub fn session_ids(&self) -> BTreeMap<String, Option<String>> {
        self.ready_sessions()
            .iter()
            .map(|session| (session.name().to_owned(), session.session_id()))
            .collect()
    }

    /// Number of registered agents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ready_sessions().len()
    }

    /// Whether no agent is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unregister `name` and clean its session up.
    ///
    /// # Errors
    ///
    /// [`AppError::UnknownAgent`] if absent or still starting.
    pub async fn remove(&self, name: &str) -> Result<()> {
        let session = {
            let mut registry = self.lock();
            match registry.slots.remove(name) {
                Some(Slot::Ready(session)) => session,
                Some(starting) => {
                    registry.slots.insert(name.to_owned(), starting);
                    return Err(AppError::UnknownAgent(name.to_owned()));
                }
                None => return Err(AppError::UnknownAgent(name.to_owned())),
            }
        };
        session.cleanup().await;
        info!(agent = %name, "agent removed from swarm");
        Ok(())
    }

    /// Clean every registered session up and clear the registry.
    ///
    /// Sessions are torn down concurrently. Spawns still in flight fail once
    /// they complete. The swarm can be used again afterwards.
    pub async fn shutdown(&self) {
        let span = info_span!("swarm_shutdown", pr = %self.context.pr_number);
        async {
            let sessions: Vec<Arc<Session>> = {
                let mut registry = self.lock();
                registry.generation += 1;
                registry
                    .slots
                    .drain()
                    .filter_map(|(_, slot)| match slot {
                        Slot::Ready(session) => Some(session),
                        Slot::Starting { .. } => None,
                    })
                    .collect()
            };
            let count = sessions.len();
            join_all(sessions.iter().map(|session| session.cleanup())).await;
            info!(sessions = count, "swarm shut down");
        }
        .instrument(span)
        .await;
    }

    // ── Private helpers ──────────────────────────────────────────────────────

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ready_sessions(&self) -> Vec<Arc<Session>> {
        let registry = self.lock();
        let mut sessions: Vec<Arc<Session>> = registry
            .slots
            .values()
            .filter_map(|slot| match slot {
                Slot::Ready(session) => Some(Arc::clone(session)),
                Slot::Starting { .. } => None,
            })
            .collect();
        sessions.sort_by(|a, b| a.name().cmp(b.name()));
        sessions
    }

    fn reserve(&self, name: &str) -> Result<Reservation<'_>> {
        if name.trim().is_empty() {
            return Err(AppError::InvalidState("agent name must not be empty".into()));
        }
        let mut registry = self.lock();
        if registry.slots.contains_key(name) {
            return Err(AppError::DuplicateName(name.to_owned()));
        }
        let generation = registry.generation;
        registry
            .slots
            .insert(name.to_owned(), Slot::Starting { generation });
        Ok(Reservation {
            swarm: self,
            name: name.to_owned(),
            generation,
            committed: false,
        })
    }
}

impl std::fmt::Debug for Swarm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Swarm")
            .field("context", &self.context)
            .field("agents", &self.agents())
            .finish_non_exhaustive()
    }
}

/// A claimed name. Released on drop unless committed, so a failed or
/// cancelled spawn frees the name.
struct Reservation<'a> {
    swarm: &'a Swarm,
    name: String,
    generation: u64,
    committed: bool,
}

impl Reservation<'_> {
    fn commit(mut self, session: Arc<Session>) -> Result<()> {
        let swarm = self.swarm;
        let mut registry = swarm.lock();
        if registry.generation != self.generation {
            return Err(AppError::InvalidState(format!(
                "swarm shut down while {} was starting",
                self.name
            )));
        }
        registry
            .slots
            .insert(self.name.clone(), Slot::Ready(session));
        self.committed = true;
        Ok(())
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut registry = self.swarm.lock();
        let ours = matches!(
            registry.slots.get(&self.name),
            Some(Slot::Starting { generation }) if *generation == self.generation
        );
        if ours {
            registry.slots.remove(&self.name);
        }
    }
}
