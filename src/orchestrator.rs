// Orchestrator: drives one run per submit through the delegate tree
//
// Design Decision: Spawned run task streaming events over an unbounded channel
//
// Rationale: Reasoning and capability calls are long-latency awaits, and many
// sessions must progress at once. Each `submit` claims its session in the
// store, spawns the run on the tokio runtime and hands back a stream fed from
// the run's channel. Sessions never share a run task; the store's
// `begin_run` makes sure one session never has two.
//
// Step discipline: decide, append, act. Every decision is recorded as an event
// before it has any effect, so an interrupted run leaves a readable trail.
//
// Error routing:
// - Invocation errors (unknown/unbound capability, bad arguments, handler or
//   provider call failure): failed `capability_result`, run continues
// - Provider unavailable at resolve time: failed `capability_result`, then
//   `run_error`, run fails
// - Handoff to a non-child, reasoning failure, step limit, run deadline:
//   `run_error`, run fails
// - Cancellation: observed between steps, `run_cancelled`, session reopens

use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};

use crate::capability::CapabilityRegistry;
use crate::delegate::{Delegate, DelegateId, DelegateTree};
use crate::error::{MasterpieceError, Result};
use crate::events::{BusEvent, CapabilityOutcome, Event, EventBus, EventKind, RunErrorKind};
use crate::reasoning::{Decision, DecisionRequest, Reasoning};
use crate::session::{InMemorySessionStore, RunStatus, Session, SessionStore};

const DEFAULT_MAX_STEPS: usize = 50;

/// Run guards
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Decisions allowed per run
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,

    /// Deadline for a single reasoning call
    #[serde(default)]
    pub decision_timeout_secs: Option<u64>,

    /// Wall-clock budget for a whole run, checked between steps
    #[serde(default)]
    pub run_timeout_secs: Option<u64>,
}

fn default_max_steps() -> usize {
    DEFAULT_MAX_STEPS
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            decision_timeout_secs: None,
            run_timeout_secs: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn decision_timeout(&self) -> Option<Duration> {
        self.decision_timeout_secs.map(Duration::from_secs)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_secs.map(Duration::from_secs)
    }
}

struct Inner {
    tree: Arc<DelegateTree>,
    registry: Arc<CapabilityRegistry>,
    store: Arc<dyn SessionStore>,
    reasoners: HashMap<String, Arc<dyn Reasoning>>,
    fallback: Option<Arc<dyn Reasoning>>,
    max_steps: usize,
    decision_timeout: Option<Duration>,
    run_timeout: Option<Duration>,
    bus: Option<Arc<EventBus>>,
    /// Cancellation flags of in-flight runs, by session id
    runs: RwLock<HashMap<String, Arc<AtomicBool>>>,
}

impl Inner {
    fn reasoner_for(&self, delegate: &str) -> Option<&Arc<dyn Reasoning>> {
        self.reasoners.get(delegate).or(self.fallback.as_ref())
    }
}

/// Session API over a validated delegate tree
///
/// Cheap to clone; clones share sessions and in-flight runs.
///
/// Usage:
///     let orchestrator = Orchestrator::builder()
///         .tree(tree)
///         .registry(registry)
///         .reasoners(script.into_reasoners())
///         .build()?;
///     let session = orchestrator.create_session("alice").await?;
///     let mut events = orchestrator.submit(&session, "build an iOS login screen").await?;
///     while let Some(event) = events.next().await { ... }
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::default()
    }

    pub fn tree(&self) -> &DelegateTree {
        &self.inner.tree
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.inner.registry
    }

    /// Open a session positioned at the root delegate
    pub async fn create_session(&self, user_id: &str) -> Result<String> {
        self.inner.store.create(user_id, self.inner.tree.root().name()).await
    }

    /// Start a run and stream its events
    ///
    /// The stream yields every event the run appends, starting with the
    /// `user_message`, and ends after the terminal event. The run itself
    /// does not depend on the stream being polled; dropping the stream early
    /// leaves the run going and `get_history` still shows everything.
    ///
    /// # Errors
    /// - `SessionNotFound` for an unknown id
    /// - `SessionBusy` while another run on the session is in flight
    /// - `SessionTerminated` once the session's last run failed
    pub async fn submit(&self, session_id: &str, message: &str) -> Result<BoxStream<'static, Event>> {
        let root = self.inner.tree.root().name();
        self.inner.store.begin_run(session_id, root).await?;

        let cancelled = Arc::new(AtomicBool::new(false));
        self.inner
            .runs
            .write()
            .await
            .insert(session_id.to_string(), cancelled.clone());

        let (tx, rx) = mpsc::unbounded_channel();
        let run = Run {
            inner: self.inner.clone(),
            session_id: session_id.to_string(),
            cancelled,
            tx,
        };
        tracing::info!(session_id, root, "Run started");
        tokio::spawn(run.drive(message.to_string()));

        Ok(stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|event| (event, rx)) }).boxed())
    }

    pub async fn get_history(&self, session_id: &str) -> Result<Vec<Event>> {
        self.inner.store.history(session_id).await
    }

    pub async fn session(&self, session_id: &str) -> Result<Session> {
        self.inner.store.get(session_id).await
    }

    /// Ask the session's in-flight run to stop at its next step boundary
    ///
    /// An in-progress capability call finishes first. Returns `false` when
    /// no run is in flight.
    pub async fn cancel(&self, session_id: &str) -> Result<bool> {
        // Surface unknown ids as errors rather than "nothing to cancel"
        self.inner.store.get(session_id).await?;

        match self.inner.runs.read().await.get(session_id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                tracing::info!(session_id, "Run cancellation requested");
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// One in-flight run
struct Run {
    inner: Arc<Inner>,
    session_id: String,
    cancelled: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<Event>,
}

impl Run {
    async fn drive(self, message: String) {
        let status = match self.execute(message).await {
            Ok(status) => status,
            Err(e) => {
                tracing::error!(session_id = %self.session_id, "Run aborted: {}", e);
                let cause = e.to_string();
                if let Err(e) = self
                    .record(EventKind::RunError { kind: RunErrorKind::Internal, cause })
                    .await
                {
                    tracing::error!(session_id = %self.session_id, "Failed to record run error: {}", e);
                }
                RunStatus::Failed
            }
        };

        self.inner.runs.write().await.remove(&self.session_id);
        if let Err(e) = self.inner.store.finish(&self.session_id, status).await {
            tracing::error!(session_id = %self.session_id, "Failed to release session: {}", e);
        }
        tracing::info!(session_id = %self.session_id, %status, "Run finished");
        // Dropping self closes the event stream after the status is visible
    }

    /// The step loop; `Err` only for store failures
    async fn execute(&self, message: String) -> Result<RunStatus> {
        let tree = self.inner.tree.clone();
        let started = Instant::now();
        let mut active = DelegateId::ROOT;
        let mut steps = 0usize;

        self.record(EventKind::UserMessage { text: message }).await?;

        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                self.record(EventKind::RunCancelled).await?;
                return Ok(RunStatus::AwaitingInput);
            }
            if let Some(limit) = self.inner.run_timeout {
                if started.elapsed() >= limit {
                    let cause = format!("run exceeded {}s", limit.as_secs());
                    return self.fail(RunErrorKind::RunTimedOut, cause).await;
                }
            }
            if steps >= self.inner.max_steps {
                let cause = format!("run exceeded {} steps", self.inner.max_steps);
                return self.fail(RunErrorKind::StepLimitExceeded, cause).await;
            }
            steps += 1;

            let delegate = tree.get(active);
            let decision = match self.decide(active, delegate).await? {
                Ok(decision) => decision,
                Err(e) => return self.fail(RunErrorKind::Reasoning, e.to_string()).await,
            };

            match decision {
                Decision::Respond { text } => {
                    self.record(EventKind::DelegateResponse {
                        delegate: delegate.name().to_string(),
                        text,
                    })
                    .await?;
                    return Ok(RunStatus::Completed);
                }

                Decision::Invoke { capability, args } => {
                    self.record(EventKind::CapabilityInvocation {
                        delegate: delegate.name().to_string(),
                        capability: capability.clone(),
                        args: args.clone(),
                    })
                    .await?;

                    let outcome = self.invoke(delegate, &capability, args).await;
                    let unavailable = matches!(outcome, Err(MasterpieceError::ProviderUnavailable { .. }));
                    let outcome = match outcome {
                        Ok(value) => CapabilityOutcome::Ok { value },
                        Err(e) => {
                            tracing::warn!(session_id = %self.session_id, capability = %capability, "Capability failed: {}", e);
                            CapabilityOutcome::Error { message: e.to_string() }
                        }
                    };
                    let cause = match &outcome {
                        CapabilityOutcome::Error { message } if unavailable => Some(message.clone()),
                        _ => None,
                    };
                    self.record(EventKind::CapabilityResult { capability, outcome }).await?;

                    if let Some(cause) = cause {
                        return self.fail(RunErrorKind::ProviderUnavailable, cause).await;
                    }
                }

                Decision::Handoff { child } => {
                    let Some(next) = tree.child(active, &child) else {
                        let err = MasterpieceError::InvalidHandoffTarget {
                            from: delegate.name().to_string(),
                            to: child,
                        };
                        return self.fail(RunErrorKind::InvalidHandoffTarget, err.to_string()).await;
                    };

                    self.record(EventKind::DelegateHandoff {
                        from: delegate.name().to_string(),
                        to: child.clone(),
                    })
                    .await?;
                    self.inner.store.set_active(&self.session_id, &child).await?;
                    tracing::info!(session_id = %self.session_id, from = delegate.name(), to = %child, "Delegate handoff");
                    active = next;
                }
            }
        }
    }

    /// Ask the delegate's reasoning behavior for the next decision
    ///
    /// The outer `Result` carries store failures, the inner one reasoning
    /// failures and timeouts.
    async fn decide(&self, id: DelegateId, delegate: &Delegate) -> Result<Result<Decision>> {
        let Some(reasoner) = self.inner.reasoner_for(delegate.name()) else {
            return Ok(Err(MasterpieceError::Reasoning(format!(
                "no reasoning behavior for delegate '{}'",
                delegate.name()
            ))));
        };

        let request = DecisionRequest {
            delegate: delegate.name().to_string(),
            instruction: delegate.instruction().to_string(),
            capabilities: self.inner.registry.describe(delegate.capabilities()).await,
            children: self.inner.tree.child_names(id),
            conversation: self.inner.store.history(&self.session_id).await?,
        };

        let decision = match self.inner.decision_timeout {
            Some(limit) => match tokio::time::timeout(limit, reasoner.decide(request)).await {
                Ok(decision) => decision,
                Err(_) => Err(MasterpieceError::Reasoning(format!(
                    "decision timed out after {}s",
                    limit.as_secs()
                ))),
            },
            None => reasoner.decide(request).await,
        };
        Ok(decision)
    }

    async fn invoke(&self, delegate: &Delegate, capability: &str, args: Value) -> Result<Value> {
        if !delegate.binds(capability) {
            return Err(MasterpieceError::UnknownCapability(capability.to_string()));
        }
        self.inner.registry.invoke(capability, args).await
    }

    async fn fail(&self, kind: RunErrorKind, cause: String) -> Result<RunStatus> {
        tracing::warn!(session_id = %self.session_id, %kind, "Run failed: {}", cause);
        self.record(EventKind::RunError { kind, cause }).await?;
        Ok(RunStatus::Failed)
    }

    /// Append to the session, then publish on the bus and the run stream
    async fn record(&self, kind: EventKind) -> Result<Event> {
        let event = self.inner.store.append(&self.session_id, kind).await?;
        if let Some(bus) = &self.inner.bus {
            bus.emit(BusEvent::Session {
                session_id: self.session_id.clone(),
                event: event.clone(),
            });
        }
        if self.tx.send(event.clone()).is_err() {
            tracing::trace!(session_id = %self.session_id, "Run stream dropped, event kept in history only");
        }
        Ok(event)
    }
}

/// Assembles an `Orchestrator`
#[derive(Default)]
pub struct OrchestratorBuilder {
    tree: Option<Arc<DelegateTree>>,
    registry: Option<Arc<CapabilityRegistry>>,
    store: Option<Arc<dyn SessionStore>>,
    reasoners: HashMap<String, Arc<dyn Reasoning>>,
    fallback: Option<Arc<dyn Reasoning>>,
    config: OrchestratorConfig,
    bus: Option<Arc<EventBus>>,
}

impl OrchestratorBuilder {
    pub fn tree(mut self, tree: impl Into<Arc<DelegateTree>>) -> Self {
        self.tree = Some(tree.into());
        self
    }

    pub fn registry(mut self, registry: Arc<CapabilityRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Defaults to an `InMemorySessionStore`
    pub fn store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn reasoner(mut self, delegate: impl Into<String>, reasoner: Arc<dyn Reasoning>) -> Self {
        self.reasoners.insert(delegate.into(), reasoner);
        self
    }

    pub fn reasoners(mut self, reasoners: HashMap<String, Arc<dyn Reasoning>>) -> Self {
        self.reasoners.extend(reasoners);
        self
    }

    /// Used by every delegate without its own reasoner
    pub fn default_reasoner(mut self, reasoner: Arc<dyn Reasoning>) -> Self {
        self.fallback = Some(reasoner);
        self
    }

    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn max_steps(mut self, max_steps: usize) -> Self {
        self.config.max_steps = max_steps;
        self
    }

    pub fn event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Error Conditions:
    /// - Missing tree or registry: `Config`
    /// - `max_steps` of zero: `Config`
    /// - A delegate without a reasoner and no default reasoner: `Config`
    pub fn build(self) -> Result<Orchestrator> {
        let tree = self
            .tree
            .ok_or_else(|| MasterpieceError::Config("Orchestrator needs a delegate tree".into()))?;
        let registry = self
            .registry
            .ok_or_else(|| MasterpieceError::Config("Orchestrator needs a capability registry".into()))?;
        if self.config.max_steps == 0 {
            return Err(MasterpieceError::Config("max_steps must be at least 1".into()));
        }

        if self.fallback.is_none() {
            if let Some((_, missing)) = tree.iter().find(|(_, d)| !self.reasoners.contains_key(d.name())) {
                return Err(MasterpieceError::Config(format!(
                    "No reasoning behavior for delegate '{}'",
                    missing.name()
                )));
            }
        }
        for name in self.reasoners.keys().filter(|n| tree.find(n).is_none()) {
            tracing::warn!(delegate = %name, "Reasoner given for a delegate outside the tree");
        }

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemorySessionStore::new()));

        Ok(Orchestrator {
            inner: Arc::new(Inner {
                tree,
                registry,
                store,
                reasoners: self.reasoners,
                fallback: self.fallback,
                max_steps: self.config.max_steps,
                decision_timeout: self.config.decision_timeout(),
                run_timeout: self.config.run_timeout(),
                bus: self.bus,
                runs: RwLock::new(HashMap::new()),
            }),
        })
    }
}
