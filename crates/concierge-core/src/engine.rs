use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn, Level};

use concierge_observability::{emit_event, redact_text, ObservabilityEvent, ProcessKind};
use concierge_orchestrator::{
    ClarificationManager, DispatchError, Dispatched, PromptTemplates, TaskMachine, TaskStart,
    TransitionError,
};
use concierge_providers::{build_oracle, LanguageOracle};
use concierge_tools::{
    ConfirmationGuard, NormalizeContext, ToolExecutor, ToolRegistry, Validation,
};
use concierge_types::{
    AbandonReason, EngineEvent, Session, Speaker, TaskStatus, ToolSchema, TurnError, TurnOutcome,
    UnrecognizedReason,
};

use crate::config::EngineConfig;
use crate::event_bus::EventBus;
use crate::router::{matches_command, IntentRouter, RouteError};
use crate::store::SessionStore;

/// The decision core: one `handle_turn` per utterance. Turns of the same
/// session run one at a time; different sessions run in parallel.
pub struct Engine {
    registry: ToolRegistry,
    router: IntentRouter,
    machine: TaskMachine,
    clarifier: ClarificationManager,
    executor: Arc<dyn ToolExecutor>,
    store: Arc<dyn SessionStore>,
    bus: EventBus,
    config: EngineConfig,
    process: ProcessKind,
    session_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        oracle: Arc<dyn LanguageOracle>,
        executor: Arc<dyn ToolExecutor>,
        store: Arc<dyn SessionStore>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let registry = ToolRegistry::with_extra_tools(config.tools.clone())?;
        let executor: Arc<dyn ToolExecutor> =
            Arc::new(ConfirmationGuard::new(registry.clone(), executor));
        let router = IntentRouter::new(registry.clone(), oracle, config.router.clone());
        let clarifier =
            ClarificationManager::new(PromptTemplates::builtin().with_overrides(&config.prompts));
        Ok(Self {
            registry,
            router,
            machine: TaskMachine::new(config.tasks.clone()),
            clarifier,
            executor,
            store,
            bus: EventBus::new(),
            config,
            process: ProcessKind::Engine,
            session_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Builds the oracle named by `config.oracle`.
    pub fn from_config(
        config: EngineConfig,
        executor: Arc<dyn ToolExecutor>,
        store: Arc<dyn SessionStore>,
    ) -> anyhow::Result<Self> {
        let oracle = build_oracle(&config.oracle)?;
        Self::new(config, oracle, executor, store)
    }

    pub fn with_process(mut self, process: ProcessKind) -> Self {
        self.process = process;
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn oracle_id(&self) -> &str {
        self.router.oracle_id()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.bus.subscribe()
    }

    async fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.session_locks.lock().await;
        locks.entry(session_id.to_string()).or_default().clone()
    }

    /// Hands back a handle from `session_lock`. The entry is dropped once no
    /// turn holds or waits on it; clones are only taken under the map lock,
    /// so a count of one here cannot race with a new waiter.
    async fn release_session_lock(&self, session_id: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.session_locks.lock().await;
        drop(lock);
        if locks
            .get(session_id)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            locks.remove(session_id);
        }
    }

    async fn with_session<T, F>(&self, session_id: &str, work: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        let lock = self.session_lock(session_id).await;
        let result = {
            let _guard = lock.lock().await;
            work.await
        };
        self.release_session_lock(session_id, lock).await;
        result
    }

    async fn load_or_create(&self, session_id: &str) -> anyhow::Result<Session> {
        Ok(self.store.load(session_id).await?.unwrap_or_else(|| {
            Session::new(session_id, self.config.session.default_preferences.clone())
        }))
    }

    /// Processes one utterance end to end. `Err` is reserved for session
    /// store failures and broken internal invariants; every user-facing
    /// failure is a `TurnOutcome::Failed`.
    pub async fn handle_turn(&self, session_id: &str, utterance: &str) -> anyhow::Result<TurnOutcome> {
        self.with_session(session_id, self.handle_turn_locked(session_id, utterance))
            .await
    }

    async fn handle_turn_locked(
        &self,
        session_id: &str,
        utterance: &str,
    ) -> anyhow::Result<TurnOutcome> {
        let mut session = self.load_or_create(session_id).await?;
        let text = utterance.trim();
        let outcome = if text.is_empty() {
            TurnOutcome::Failed(TurnError::UnrecognizedIntent {
                reason: UnrecognizedReason::NoConfidentCandidate,
            })
        } else {
            let limit = self.config.session.recent_turn_limit;
            session.record_turn(Speaker::User, text, limit);
            let outcome = self.run_turn(&mut session, text).await?;
            session.record_turn(Speaker::Assistant, outcome.reply(), limit);
            outcome
        };

        self.store.save(&session).await?;
        self.report(&session, text, &outcome);
        Ok(outcome)
    }

    async fn run_turn(&self, session: &mut Session, text: &str) -> anyhow::Result<TurnOutcome> {
        let router_config = self.router.config();

        if matches_command(text, &router_config.cancel_phrases) {
            let abandoned = self.machine.abandon(session, AbandonReason::Cancelled)?;
            return Ok(TurnOutcome::Cancelled {
                tool: abandoned.map(|task| task.tool),
            });
        }

        if matches_command(text, &router_config.retry_phrases) {
            if let Some(task) = session.current.as_ref().filter(|t| t.status == TaskStatus::Ready) {
                let schema = self.registry.lookup(&task.tool)?.clone();
                info!(session_id = %session.id, task_id = %task.id, tool = %task.tool, "retrying ready task");
                return self.dispatch_current(session, &schema).await;
            }
        }

        if let Some(task) = session
            .current
            .as_ref()
            .filter(|t| t.status == TaskStatus::Collecting && self.machine.limit_reached(t))
        {
            let tool = task.tool.clone();
            let rounds = task.clarification_rounds;
            self.machine
                .abandon(session, AbandonReason::ClarificationLimit { rounds })?;
            return Ok(TurnOutcome::Failed(TurnError::ClarificationLimitExceeded {
                tool,
                rounds,
            }));
        }

        let routing = match self.router.route(text, session).await {
            Ok(routing) => routing,
            Err(err) => {
                warn!(session_id = %session.id, error = %err, "routing failed");
                let reason = match err {
                    RouteError::OracleTimeout { .. } => UnrecognizedReason::OracleTimeout,
                    RouteError::OracleFailed { .. } => UnrecognizedReason::OracleFailed,
                };
                return Ok(TurnOutcome::Failed(TurnError::UnrecognizedIntent { reason }));
            }
        };
        let Some(primary) = routing.primary() else {
            return Ok(TurnOutcome::Failed(TurnError::UnrecognizedIntent {
                reason: UnrecognizedReason::NoConfidentCandidate,
            }));
        };
        let schema = self.registry.lookup(&primary.tool)?.clone();

        let start = self.machine.start_or_continue(session, &schema, primary)?;
        if let TaskStart::Created {
            superseded: Some(old),
            ..
        } = &start
        {
            self.bus.task_superseded(&session.id, old);
        }

        let preferences = session.preferences.clone();
        let ctx = NormalizeContext::new(preferences.local_today(Utc::now()), &preferences);
        let rejection = match self.machine.check_ready(session, &schema, &ctx)? {
            Validation::Accepted(_) => return self.dispatch_current(session, &schema).await,
            Validation::Rejected(rejection) => rejection,
        };

        let task = session
            .current
            .as_mut()
            .ok_or(TransitionError::NoCurrentTask)?;
        let question =
            self.clarifier
                .next_question(task, &schema, &rejection, routing.alternatives());
        if self.machine.limit_reached(task) {
            let tool = task.tool.clone();
            let rounds = task.clarification_rounds;
            self.machine
                .abandon(session, AbandonReason::ClarificationLimit { rounds })?;
            return Ok(TurnOutcome::Failed(TurnError::ClarificationLimitExceeded {
                tool,
                rounds,
            }));
        }
        Ok(match question {
            Some(request) => TurnOutcome::Clarify(request),
            None => TurnOutcome::Failed(TurnError::ValidationIncomplete {
                tool: schema.name.clone(),
                missing: rejection.missing.clone(),
                invalid: rejection.invalid_names(),
            }),
        })
    }

    async fn dispatch_current(
        &self,
        session: &mut Session,
        schema: &ToolSchema,
    ) -> anyhow::Result<TurnOutcome> {
        let timeout = Duration::from_millis(self.config.execution.timeout_ms);
        match self
            .machine
            .dispatch(session, schema, self.executor.as_ref(), timeout)
            .await
        {
            Ok(Dispatched { task, result }) => Ok(TurnOutcome::Dispatched {
                tool: task.tool,
                task_id: task.id,
                result,
            }),
            Err(DispatchError::ExecutionFailed { tool, message }) => {
                warn!(session_id = %session.id, tool = %tool, error = %message, "tool execution failed");
                Ok(TurnOutcome::Failed(TurnError::ExecutionError { tool, message }))
            }
            Err(DispatchError::TimedOut { tool, timeout_ms }) => {
                warn!(session_id = %session.id, tool = %tool, timeout_ms, "tool execution timed out");
                Ok(TurnOutcome::Failed(TurnError::ExecutionTimeout { tool, timeout_ms }))
            }
            Err(other) => Err(other.into()),
        }
    }

    fn report(&self, session: &Session, text: &str, outcome: &TurnOutcome) {
        let (tool, task_id) = match outcome {
            TurnOutcome::Dispatched { tool, task_id, .. } => (Some(tool.clone()), Some(task_id.clone())),
            TurnOutcome::Clarify(request) => (
                Some(request.tool.clone()),
                session.current.as_ref().map(|t| t.id.clone()),
            ),
            TurnOutcome::Cancelled { tool } => (tool.clone(), None),
            TurnOutcome::Failed(
                TurnError::ExecutionError { tool, .. }
                | TurnError::ExecutionTimeout { tool, .. }
                | TurnError::ClarificationLimitExceeded { tool, .. }
                | TurnError::ValidationIncomplete { tool, .. },
            ) => (Some(tool.clone()), None),
            TurnOutcome::Failed(TurnError::UnrecognizedIntent { .. }) => (None, None),
        };
        let error_code = match outcome {
            TurnOutcome::Failed(err) => Some(err.code()),
            _ => None,
        };

        self.bus.turn_completed(
            &session.id,
            outcome.status(),
            tool.as_deref(),
            task_id.as_deref(),
            error_code,
        );

        let detail = redact_text(text);
        let level = if error_code.is_some() {
            Level::WARN
        } else {
            Level::INFO
        };
        emit_event(
            level,
            self.process,
            ObservabilityEvent {
                session_id: Some(&session.id),
                task_id: task_id.as_deref(),
                tool: tool.as_deref(),
                status: Some(outcome.status()),
                error_code,
                detail: Some(&detail),
                ..ObservabilityEvent::new("engine", "turn.completed")
            },
        );
    }

    /// Drops all state for a session. Returns whether anything was stored.
    pub async fn reset_session(&self, session_id: &str) -> anyhow::Result<bool> {
        let removed = self
            .with_session(session_id, self.store.remove(session_id))
            .await?;
        self.bus.session_reset(session_id, removed);
        Ok(removed)
    }

    pub async fn session_snapshot(&self, session_id: &str) -> anyhow::Result<Option<Session>> {
        self.with_session(session_id, self.store.load(session_id))
            .await
    }
}
