//! The decision loop: run, parse, ask the backend, gate, execute or surface.

mod audit;
mod error;
mod handle;
mod state;

pub use audit::spawn_audit_writer;
pub use error::EngineError;
pub use handle::EngineHandle;
pub use state::EngineState;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use pentra_llm::{
    AnyBackend, Backend, BackendError, BackendErrorKind, Recommendation, StreamItem, TurnContext,
    complete, complete_streaming,
};
use pentra_tools::{
    CommandRunner, CommandStatus, ParserRegistry, SafetyPolicy, SafetyVerdict, ToolInfo, Verdict,
    detect_tool,
};

use crate::backends::BackendSet;
use crate::config::Config;
use crate::context::{ContextBuilder, ContextSettings};
use crate::session::{CommandRecord, NewRecord, RecordId, RecordedFinding, Session};

/// Broadcast buffer; slower subscribers lag and lose the oldest events.
pub const EVENT_CAPACITY: usize = 256;

/// Rule id the safety policy reports when nothing matched.
const DEFAULT_RULE: &str = "default";

/// Notifications for front ends and the audit writer.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    StateChanged { from: EngineState, to: EngineState },
    Status(String),
    CommandStarted { command: String, tool: Option<ToolInfo> },
    OutputChunk(String),
    CommandFinished(CommandRecord),
    FindingAdded(RecordedFinding),
    RecommendationChunk(String),
    Recommendation(Recommendation),
    ApprovalRequired { command: String, verdict: SafetyVerdict },
    Blocked { command: String, verdict: SafetyVerdict },
    Rejected { command: String },
    BackendFailed { kind: BackendErrorKind, message: String },
    BackendChanged { id: String },
    TargetChanged { target: String },
}

/// A command held at the approval checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommand {
    pub command: String,
    pub verdict: SafetyVerdict,
    /// Present when the command came from a backend.
    pub recommendation: Option<Recommendation>,
}

/// How one submit/approve/reject call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The command ran and the backend answered without proposing a command.
    Completed {
        record: RecordId,
        recommendation: Option<Recommendation>,
    },
    AwaitingApproval(PendingCommand),
    /// The command was refused by the safety policy and never ran.
    Blocked { command: String, verdict: SafetyVerdict },
    SpawnFailed { record: RecordId, reason: String },
    /// The command ran but the backend step failed.
    BackendFailed {
        record: RecordId,
        kind: BackendErrorKind,
        message: String,
    },
    Cancelled { record: Option<RecordId> },
    Rejected { command: String },
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Overrides the runner's default timeout.
    pub command_timeout: Option<Duration>,
    pub ai_timeout: Duration,
    /// Consecutive backend timeouts before the turn gives up.
    pub ai_attempts: u32,
    pub streaming: bool,
    /// Snapshot written after every finished turn.
    pub autosave: Option<PathBuf>,
    pub context: ContextSettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            command_timeout: None,
            ai_timeout: Duration::from_secs(120),
            ai_attempts: 3,
            streaming: true,
            autosave: None,
            context: ContextSettings::default(),
        }
    }
}

impl EngineSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            command_timeout: None,
            ai_timeout: Duration::from_secs(config.ai.timeout_secs),
            ai_attempts: config.ai.timeout_attempts.max(1),
            streaming: config.ai.streaming,
            autosave: config
                .session
                .autosave
                .then(|| PathBuf::from(&config.session.snapshot_path)),
            context: ContextSettings {
                history_window: config.ai.history_window,
                max_output_chars: config.ai.max_output_chars,
                max_findings: config.ai.max_findings,
            },
        }
    }
}

/// Cancels whatever the engine is doing right now.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    slot: Arc<Mutex<CancellationToken>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let token = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        tracing::info!("cancelling current turn");
        token.cancel();
    }
}

/// Owns the session and drives one command at a time through the loop.
pub struct DecisionEngine {
    session: Session,
    backends: BackendSet,
    runner: CommandRunner,
    parsers: ParserRegistry,
    safety: SafetyPolicy,
    context: ContextBuilder,
    settings: EngineSettings,
    state: EngineState,
    state_tx: watch::Sender<EngineState>,
    events: broadcast::Sender<EngineEvent>,
    pending: Option<PendingCommand>,
    cancel: Arc<Mutex<CancellationToken>>,
}

impl std::fmt::Debug for DecisionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionEngine")
            .field("state", &self.state)
            .field("active_backend", &self.session.active_backend())
            .field("records", &self.session.records().len())
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

impl DecisionEngine {
    /// # Errors
    ///
    /// Returns `EngineError::UnknownBackend` if the session's active backend
    /// is not in `backends`.
    pub fn new(session: Session, backends: BackendSet) -> Result<Self, EngineError> {
        if !backends.contains(session.active_backend()) {
            return Err(EngineError::UnknownBackend(session.active_backend().to_owned()));
        }
        let (state_tx, _) = watch::channel(EngineState::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            session,
            backends,
            runner: CommandRunner::default(),
            parsers: ParserRegistry::with_defaults(),
            safety: SafetyPolicy::default(),
            context: ContextBuilder::default(),
            settings: EngineSettings::default(),
            state: EngineState::Idle,
            state_tx,
            events,
            pending: None,
            cancel: Arc::new(Mutex::new(CancellationToken::new())),
        })
    }

    #[must_use]
    pub fn with_runner(mut self, runner: CommandRunner) -> Self {
        self.runner = runner;
        self
    }

    #[must_use]
    pub fn with_parsers(mut self, parsers: ParserRegistry) -> Self {
        self.parsers = parsers;
        self
    }

    #[must_use]
    pub fn with_safety(mut self, safety: SafetyPolicy) -> Self {
        self.safety = safety;
        self
    }

    #[must_use]
    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.context = ContextBuilder::new(settings.context);
        self.settings = settings;
        self
    }

    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    #[must_use]
    pub fn state(&self) -> EngineState {
        self.state
    }

    #[must_use]
    pub fn pending(&self) -> Option<&PendingCommand> {
        self.pending.as_ref()
    }

    #[must_use]
    pub fn backend_ids(&self) -> Vec<String> {
        self.backends.ids()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<EngineState> {
        self.state_tx.subscribe()
    }

    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            slot: Arc::clone(&self.cancel),
        }
    }

    pub fn set_auto_execute(&mut self, enabled: bool) {
        tracing::info!(enabled, "auto-execute changed");
        self.safety.set_auto_execute(enabled);
    }

    /// The context the active backend would receive right now.
    #[must_use]
    pub fn preview_context(&self) -> TurnContext {
        let window = self
            .backends
            .get(self.session.active_backend())
            .and_then(Backend::context_window);
        self.context.build(&self.session, window)
    }

    /// Run an operator-submitted command through the loop.
    ///
    /// The submission itself counts as the operator's confirmation, so only
    /// an explicit `confirm` rule holds the command for approval. `block`
    /// verdicts never execute.
    ///
    /// # Errors
    ///
    /// Returns `Busy` outside `Idle`, `EmptyCommand` for blank input, or
    /// `Fatal` when no process can be spawned at all.
    pub async fn submit(&mut self, command: &str) -> Result<TurnOutcome, EngineError> {
        let command = command.trim();
        if command.is_empty() {
            return Err(EngineError::EmptyCommand);
        }
        if self.state != EngineState::Idle {
            return Err(EngineError::Busy(self.state));
        }

        let verdict = self.safety.classify(command);
        match verdict.verdict {
            Verdict::Block => return Ok(self.block(command.to_owned(), verdict)),
            Verdict::Confirm if verdict.rule != DEFAULT_RULE => {
                return Ok(self.hold_for_approval(PendingCommand {
                    command: command.to_owned(),
                    verdict,
                    recommendation: None,
                }));
            }
            Verdict::Confirm | Verdict::Allow => {}
        }
        self.run_turn(command.to_owned()).await
    }

    /// Execute the pending command after re-checking it against the policy.
    ///
    /// # Errors
    ///
    /// Returns `NothingPending` unless the engine is awaiting approval.
    pub async fn approve(&mut self) -> Result<TurnOutcome, EngineError> {
        if self.state != EngineState::AwaitingApproval {
            return Err(EngineError::NothingPending);
        }
        let pending = self.pending.take().ok_or(EngineError::NothingPending)?;
        let verdict = self.safety.classify(&pending.command);
        if verdict.is_blocked() {
            return Ok(self.block(pending.command, verdict));
        }
        tracing::info!(command = %pending.command, "pending command approved");
        self.run_turn(pending.command).await
    }

    /// Drop the pending command without running it.
    ///
    /// # Errors
    ///
    /// Returns `NothingPending` unless the engine is awaiting approval.
    pub fn reject(&mut self) -> Result<TurnOutcome, EngineError> {
        if self.state != EngineState::AwaitingApproval {
            return Err(EngineError::NothingPending);
        }
        let pending = self.pending.take().ok_or(EngineError::NothingPending)?;
        tracing::info!(command = %pending.command, "pending command rejected");
        self.emit(EngineEvent::Rejected {
            command: pending.command.clone(),
        });
        self.transition(EngineState::Idle);
        Ok(TurnOutcome::Rejected {
            command: pending.command,
        })
    }

    /// Discard a pending command through `Cancelled`. Returns whether one was pending.
    pub fn cancel_pending(&mut self) -> bool {
        if self.state != EngineState::AwaitingApproval {
            return false;
        }
        if let Some(pending) = self.pending.take() {
            tracing::info!(command = %pending.command, "pending command cancelled");
        }
        self.transition(EngineState::Cancelled);
        self.transition(EngineState::Idle);
        true
    }

    /// Switch the active backend; history and findings are kept.
    ///
    /// # Errors
    ///
    /// Returns `UnknownBackend` if `id` is not configured.
    pub fn set_backend(&mut self, id: &str) -> Result<(), EngineError> {
        if !self.backends.contains(id) {
            return Err(EngineError::UnknownBackend(id.to_owned()));
        }
        tracing::info!(from = %self.session.active_backend(), to = id, "active backend changed");
        self.session.set_active_backend(id);
        self.emit(EngineEvent::BackendChanged { id: id.to_owned() });
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `EmptyCommand` for a blank target.
    pub fn set_target(&mut self, target: &str) -> Result<(), EngineError> {
        let target = target.trim();
        if target.is_empty() {
            return Err(EngineError::EmptyCommand);
        }
        self.session.set_target(target);
        self.emit(EngineEvent::TargetChanged {
            target: target.to_owned(),
        });
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `Session` if the snapshot cannot be written.
    pub async fn save(&self, path: &Path) -> Result<(), EngineError> {
        self.session.save(path).await?;
        Ok(())
    }

    async fn run_turn(&mut self, command: String) -> Result<TurnOutcome, EngineError> {
        let token = self.begin_turn();
        let outcome = self.execute_and_reason(command, &token).await;
        if self.state != EngineState::Idle && self.state != EngineState::AwaitingApproval {
            self.transition(EngineState::Idle);
        }
        self.autosave().await;
        outcome
    }

    async fn execute_and_reason(
        &mut self,
        command: String,
        token: &CancellationToken,
    ) -> Result<TurnOutcome, EngineError> {
        let tool = detect_tool(&command);
        self.transition(EngineState::Executing);
        self.emit(EngineEvent::CommandStarted {
            command: command.clone(),
            tool: tool.clone(),
        });

        let mut execution = self
            .runner
            .execute(&command, self.settings.command_timeout, token.clone())
            .inspect_err(|e| tracing::error!(%command, "runner unavailable: {e}"))?;
        while let Some(chunk) = execution.next_chunk().await {
            self.emit(EngineEvent::OutputChunk(chunk));
        }
        let outcome = execution.finish().await?;

        let record_id = self.session.append_record(NewRecord {
            command: command.clone(),
            output: outcome.output,
            tool: tool.clone(),
            status: outcome.status.clone(),
            issued_at: outcome.started_at,
            finished_at: outcome.finished_at,
        });
        if let Some(record) = self.session.record(record_id) {
            self.emit(EngineEvent::CommandFinished(record.clone()));
        }

        match outcome.status {
            CommandStatus::Cancelled => return Ok(self.cancelled(Some(record_id))),
            CommandStatus::SpawnFailure { reason } => {
                tracing::warn!(%command, %reason, "command could not be started");
                self.emit(EngineEvent::Status(format!("spawn failure: {reason}")));
                self.transition(EngineState::Idle);
                return Ok(TurnOutcome::SpawnFailed {
                    record: record_id,
                    reason,
                });
            }
            CommandStatus::TimedOut => {
                self.emit(EngineEvent::Status(format!("{command} timed out")));
            }
            CommandStatus::Exited { .. } => {}
        }

        self.transition(EngineState::Parsing);
        let output = self
            .session
            .record(record_id)
            .map(|r| r.output.clone())
            .unwrap_or_default();
        let findings = self.parsers.dispatch(&output, Some(&command));
        if token.is_cancelled() {
            return Ok(self.cancelled(Some(record_id)));
        }
        let degraded = findings.iter().filter(|f| f.is_degraded()).count();
        if degraded > 0 {
            tracing::warn!(%command, degraded, "parser output degraded");
        }
        let added = self.session.add_findings(record_id, findings)?.to_vec();
        tracing::info!(%command, findings = added.len(), "output parsed");
        for finding in added {
            self.emit(EngineEvent::FindingAdded(finding));
        }

        self.transition(EngineState::AwaitingAiResponse);
        match self.query_backend(token).await {
            Ok(Some(recommendation)) => Ok(self.handle_recommendation(record_id, recommendation)),
            Ok(None) => {
                self.transition(EngineState::Idle);
                Ok(TurnOutcome::Completed {
                    record: record_id,
                    recommendation: None,
                })
            }
            Err(BackendError::Cancelled) => Ok(self.cancelled(Some(record_id))),
            Err(e) if e.is_no_recommendation() => {
                tracing::warn!("backend answer unusable: {e}");
                self.transition(EngineState::Idle);
                Ok(TurnOutcome::Completed {
                    record: record_id,
                    recommendation: None,
                })
            }
            Err(e) => {
                let kind = e.kind();
                let message = e.to_string();
                tracing::warn!(%kind, "backend step failed: {message}");
                self.emit(EngineEvent::BackendFailed {
                    kind,
                    message: message.clone(),
                });
                self.transition(EngineState::Idle);
                Ok(TurnOutcome::BackendFailed {
                    record: record_id,
                    kind,
                    message,
                })
            }
        }
    }

    /// Ask the active backend, retrying timeouts up to the configured attempts.
    async fn query_backend(
        &self,
        token: &CancellationToken,
    ) -> Result<Option<Recommendation>, BackendError> {
        let id = self.session.active_backend();
        let backend = self
            .backends
            .get(id)
            .ok_or_else(|| BackendError::Unavailable(format!("backend '{id}' is not configured")))?;
        let context = self.context.build(&self.session, backend.context_window());
        let attempts = self.settings.ai_attempts.max(1);

        for attempt in 1..=attempts {
            let call = tokio::time::timeout(self.settings.ai_timeout, self.call_backend(backend, &context));
            let result = tokio::select! {
                () = token.cancelled() => return Err(BackendError::Cancelled),
                result = call => result,
            };
            match result {
                Ok(answer) => return answer,
                Err(_) => {
                    tracing::warn!(backend = id, attempt, attempts, "backend call timed out");
                    self.emit(EngineEvent::Status(format!(
                        "{id} timed out ({attempt}/{attempts})"
                    )));
                }
            }
        }
        Err(BackendError::Unavailable(format!(
            "{id} timed out {attempts} times"
        )))
    }

    async fn call_backend(
        &self,
        backend: &AnyBackend,
        context: &TurnContext,
    ) -> Result<Option<Recommendation>, BackendError> {
        if !(self.settings.streaming && backend.supports_streaming()) {
            return complete(backend, context).await;
        }
        let mut stream = complete_streaming(backend, context).await?;
        let mut recommendation = None;
        while let Some(item) = stream.next().await {
            match item? {
                StreamItem::Chunk(text) => self.emit(EngineEvent::RecommendationChunk(text)),
                StreamItem::Done(done) => recommendation = done,
            }
        }
        Ok(recommendation)
    }

    fn handle_recommendation(&mut self, record_id: RecordId, recommendation: Recommendation) -> TurnOutcome {
        self.emit(EngineEvent::Recommendation(recommendation.clone()));
        let Some(command) = recommendation.command.clone() else {
            self.transition(EngineState::Idle);
            return TurnOutcome::Completed {
                record: record_id,
                recommendation: Some(recommendation),
            };
        };

        let verdict = self.safety.classify(&command);
        if verdict.is_blocked() {
            return self.block(command, verdict);
        }
        self.hold_for_approval(PendingCommand {
            command,
            verdict,
            recommendation: Some(recommendation),
        })
    }

    fn block(&mut self, command: String, verdict: SafetyVerdict) -> TurnOutcome {
        tracing::warn!(%command, rule = %verdict.rule, reason = %verdict.reason, "command blocked");
        self.emit(EngineEvent::Blocked {
            command: command.clone(),
            verdict: verdict.clone(),
        });
        self.transition(EngineState::Idle);
        TurnOutcome::Blocked { command, verdict }
    }

    fn hold_for_approval(&mut self, pending: PendingCommand) -> TurnOutcome {
        tracing::info!(command = %pending.command, verdict = %pending.verdict, "awaiting approval");
        self.emit(EngineEvent::ApprovalRequired {
            command: pending.command.clone(),
            verdict: pending.verdict.clone(),
        });
        self.pending = Some(pending.clone());
        self.transition(EngineState::AwaitingApproval);
        TurnOutcome::AwaitingApproval(pending)
    }

    fn cancelled(&mut self, record: Option<RecordId>) -> TurnOutcome {
        self.transition(EngineState::Cancelled);
        self.transition(EngineState::Idle);
        TurnOutcome::Cancelled { record }
    }

    /// Install a fresh token for the turn about to start.
    fn begin_turn(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.cancel.lock().unwrap_or_else(PoisonError::into_inner) = token.clone();
        token
    }

    fn transition(&mut self, to: EngineState) {
        let from = self.state;
        if from == to {
            return;
        }
        if !from.can_transition_to(to) {
            tracing::error!(%from, %to, "invalid engine transition");
        }
        tracing::info!(%from, %to, "engine state");
        self.state = to;
        self.state_tx.send_replace(to);
        self.emit(EngineEvent::StateChanged { from, to });
    }

    fn emit(&self, event: EngineEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    async fn autosave(&self) {
        if let Some(path) = &self.settings.autosave
            && let Err(e) = self.session.save(path).await
        {
            tracing::warn!(path = %path.display(), "autosave failed: {e}");
        }
    }
}
