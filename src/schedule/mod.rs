//! # Scheduler
//!
//! Drives tasks from READY to terminal states, respecting dependencies,
//! concurrency limits, and cancellation.
//!
//! The event loop runs on one task and owns all bookkeeping; workers execute
//! dispatches concurrently through a [`tokio::task::JoinSet`]. Each pass the
//! loop:
//!
//! 1. ingests inbound review decisions and HITL deadline events,
//! 2. promotes due retries back to READY,
//! 3. dispatches admissible queue heads while the global and per-role caps
//!    allow,
//! 4. processes one worker completion or sleeps a tick.
//!
//! Ordering guarantees: strict FIFO within a priority class, higher classes
//! preempt selection (never execution), and a downstream task starts only
//! after every dependency is DONE. All deadlines run on the monotonic clock.

mod queue;

pub use queue::ReadyQueue;

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::artifact::ArtifactWriter;
use crate::audit::{AuditLog, EntryKind};
use crate::config::EngineConfig;
use crate::dispatch::Dispatcher;
use crate::error::{EngineError, ErrorCode};
use crate::executor::{ExecOutcome, ExecutorError};
use crate::hitl::{drain_decision_files, HitlEngine, ReviewDisposition, ReviewOutcome};
use crate::memory::MemoryEngine;
use crate::metrics::{self, MetricsSnapshot};
use crate::store::TaskStore;
use crate::task::{ProducedArtifact, QaVerdict, RecordedError, TaskSpec, TaskState};
use crate::types::{QaSeverity, RoleId, TaskId};

/// Event-loop tick while idle
const TICK: Duration = Duration::from_millis(20);

// ============================================================================
// RUN OUTCOME
// ============================================================================

/// Summary of a finished run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub done: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total: usize,
    /// True when the drain window expired with workers still in flight
    pub forced_shutdown: bool,
}

impl RunOutcome {
    /// Process exit code: 0 success, 1 failures, 2 forced shutdown
    pub fn exit_code(&self, config: &EngineConfig) -> i32 {
        if self.forced_shutdown {
            return 2;
        }
        if self.failed > 0 {
            return 1;
        }
        if self.total == 0 {
            return 0;
        }
        let done_rate = self.done as f64 / self.total as f64;
        if done_rate >= config.done_threshold {
            0
        } else {
            1
        }
    }
}

// ============================================================================
// LOOP STATE
// ============================================================================

struct LoopState {
    queue: ReadyQueue,
    /// Unmet-dependency count per task
    remaining: HashMap<TaskId, usize>,
    /// Tasks awaiting a backoff deadline before re-entering READY
    retries: Vec<(TaskId, tokio::time::Instant)>,
    running_roles: HashMap<RoleId, usize>,
}

// ============================================================================
// SCHEDULER
// ============================================================================

pub struct Scheduler {
    store: Arc<TaskStore>,
    graph: crate::graph::TaskGraph,
    dispatcher: Arc<Dispatcher>,
    artifacts: Arc<ArtifactWriter>,
    hitl: Arc<HitlEngine>,
    memory: Arc<MemoryEngine>,
    config: EngineConfig,
    audit: AuditLog,
    cancel: CancellationToken,
    task_cancels: DashMap<TaskId, CancellationToken>,
    cancel_requests: DashMap<TaskId, ()>,
    /// Where decisions are ingested from and metrics persisted to
    state_dir: Option<PathBuf>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<TaskStore>,
        graph: crate::graph::TaskGraph,
        dispatcher: Arc<Dispatcher>,
        artifacts: Arc<ArtifactWriter>,
        hitl: Arc<HitlEngine>,
        memory: Arc<MemoryEngine>,
        config: EngineConfig,
        audit: AuditLog,
        state_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            store,
            graph,
            dispatcher,
            artifacts,
            hitl,
            memory,
            config,
            audit,
            cancel: CancellationToken::new(),
            task_cancels: DashMap::new(),
            cancel_requests: DashMap::new(),
            state_dir,
        }
    }

    /// Token that cancels the whole run when triggered
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel one task (and its descendants) or the whole run
    pub fn cancel(&self, task_id: Option<&TaskId>) {
        match task_id {
            None => self.cancel.cancel(),
            Some(id) => {
                self.cancel_requests.insert(id.clone(), ());
                if let Some(token) = self.task_cancels.get(id) {
                    token.cancel();
                }
            }
        }
    }

    /// Read-only snapshot for the metrics emitter
    pub fn status(&self) -> MetricsSnapshot {
        metrics::snapshot(&self.store, &self.hitl, &self.memory, &self.audit)
    }

    pub fn store(&self) -> Arc<TaskStore> {
        Arc::clone(&self.store)
    }

    pub fn audit_log(&self) -> AuditLog {
        self.audit.clone()
    }

    pub fn hitl(&self) -> Arc<HitlEngine> {
        Arc::clone(&self.hitl)
    }

    pub fn memory(&self) -> Arc<MemoryEngine> {
        Arc::clone(&self.memory)
    }

    // ------------------------------------------------------------------
    // Run loop
    // ------------------------------------------------------------------

    /// Block until every task is terminal or the run is cancelled
    pub async fn run(&self) -> Result<RunOutcome, EngineError> {
        let total = self.store.len();
        self.audit.record(EntryKind::RunStarted { task_count: total });

        if total == 0 {
            return Ok(self.finish(false));
        }

        // Background tier sweeper lives for the duration of the run.
        let sweep_cancel = CancellationToken::new();
        let _sweeper = self.memory.spawn_sweeper(sweep_cancel.clone());
        let _sweep_guard = sweep_cancel.drop_guard();

        let mut state = LoopState {
            queue: ReadyQueue::new(),
            remaining: HashMap::with_capacity(total),
            retries: Vec::new(),
            running_roles: HashMap::new(),
        };

        for spec in self.store.specs() {
            state
                .remaining
                .insert(spec.id.clone(), self.graph.dependencies_of(&spec.id).len());
        }
        let roots: Vec<TaskId> = state
            .remaining
            .iter()
            .filter(|(_, &count)| count == 0)
            .map(|(id, _)| id.clone())
            .collect();
        for id in roots {
            self.make_ready(&id, &mut state)?;
        }

        let mut workers: JoinSet<(TaskId, Result<ExecOutcome, EngineError>)> = JoinSet::new();

        loop {
            self.ingest_decisions(&mut state)?;
            self.process_deadlines(&mut state)?;
            self.process_cancel_requests(&mut state)?;
            self.promote_due_retries(&mut state)?;
            self.dispatch_admissible(&mut state, &mut workers)?;

            if self.store.all_terminal() && workers.is_empty() {
                break;
            }

            tokio::select! {
                joined = workers.join_next(), if !workers.is_empty() => {
                    if let Some(joined) = joined {
                        let (task_id, result) = joined
                            .map_err(|e| EngineError::other(format!("worker panicked: {e}")))?;
                        self.task_cancels.remove(&task_id);
                        if let Some(spec) = self.store.spec(&task_id) {
                            if let Some(count) = state.running_roles.get_mut(&spec.owner) {
                                *count = count.saturating_sub(1);
                            }
                        }
                        match result {
                            Ok(outcome) => self.handle_success(&task_id, outcome, &mut state)?,
                            Err(error) => self.handle_failure(&task_id, error, &mut state)?,
                        }
                    }
                }
                _ = tokio::time::sleep(TICK) => {}
                _ = self.cancel.cancelled() => {
                    let forced = self.drain(&mut workers).await;
                    self.cancel_everything_non_terminal();
                    return Ok(self.finish(forced));
                }
            }
        }

        Ok(self.finish(false))
    }

    fn finish(&self, forced: bool) -> RunOutcome {
        let (done, failed, cancelled) = self.store.terminal_counts();
        self.audit.record(EntryKind::RunFinished {
            done,
            failed,
            cancelled,
        });
        if let Some(ref dir) = self.state_dir {
            metrics::persist(&self.status(), dir);
        }
        RunOutcome {
            done,
            failed,
            cancelled,
            total: self.store.len(),
            forced_shutdown: forced,
        }
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    fn make_ready(&self, task_id: &TaskId, state: &mut LoopState) -> Result<(), EngineError> {
        let Some(spec) = self.store.spec(task_id) else {
            return Ok(());
        };
        self.store.transition(task_id, TaskState::Ready)?;
        state.queue.push(
            task_id.clone(),
            spec.priority,
            self.graph.on_critical_path(task_id),
        );
        Ok(())
    }

    fn dispatch_admissible(
        &self,
        state: &mut LoopState,
        workers: &mut JoinSet<(TaskId, Result<ExecOutcome, EngineError>)>,
    ) -> Result<(), EngineError> {
        while workers.len() < self.config.max_parallel {
            let running_roles = &state.running_roles;
            let store = &self.store;
            let config = &self.config;
            let Some(task_id) = state.queue.pop_admissible(|id| {
                store
                    .spec(id)
                    .map(|spec| {
                        let used = running_roles.get(&spec.owner).copied().unwrap_or(0);
                        used < config.role_cap(spec.owner)
                    })
                    .unwrap_or(false)
            }) else {
                break;
            };

            // Cancelled while queued: skip, the cancel pass handles it.
            if self.store.state(&task_id) != Some(TaskState::Ready) {
                continue;
            }
            self.start_worker(&task_id, state, workers)?;
        }
        Ok(())
    }

    fn start_worker(
        &self,
        task_id: &TaskId,
        state: &mut LoopState,
        workers: &mut JoinSet<(TaskId, Result<ExecOutcome, EngineError>)>,
    ) -> Result<(), EngineError> {
        let spec = self
            .store
            .spec(task_id)
            .ok_or_else(|| EngineError::other(format!("unknown task {task_id}")))?;

        self.store.transition(task_id, TaskState::Running)?;
        let lease = uuid::Uuid::new_v4().to_string();
        self.store.update(task_id, |record| {
            record.assigned_worker = Some(lease.clone());
        });
        *state.running_roles.entry(spec.owner).or_default() += 1;

        let token = self.cancel.child_token();
        self.task_cancels.insert(task_id.clone(), token.clone());

        let attempt = self
            .store
            .record(task_id)
            .map(|record| record.attempts)
            .unwrap_or(1);
        let timeout = self.config.hard_timeout(spec.effort());
        let dispatcher = Arc::clone(&self.dispatcher);
        let id = task_id.clone();

        workers.spawn(async move {
            let result = match tokio::time::timeout(
                timeout,
                dispatcher.dispatch(&spec, attempt, timeout, token.clone()),
            )
            .await
            {
                Ok(inner) => inner,
                Err(_) => {
                    token.cancel();
                    Err(EngineError::Executor(ExecutorError::Timeout {
                        task_id: spec.id.clone(),
                        after: timeout,
                    }))
                }
            };
            (id, result)
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------

    fn handle_success(
        &self,
        task_id: &TaskId,
        outcome: ExecOutcome,
        state: &mut LoopState,
    ) -> Result<(), EngineError> {
        let spec = self
            .store
            .spec(task_id)
            .ok_or_else(|| EngineError::other(format!("unknown task {task_id}")))?;

        self.store.transition(task_id, TaskState::QaPending)?;
        let produced = match self.persist_artifacts(task_id, &outcome) {
            Ok(produced) => produced,
            Err(error) => {
                // Artifact IO failure fails the attempt, never the run.
                self.store.record_error(
                    task_id,
                    RecordedError::new(error.code(), error.to_string()),
                );
                self.store.transition(task_id, TaskState::NeedsRework)?;
                return self.continue_after_rework(task_id, state);
            }
        };

        let qa = qa_validate(&spec, &outcome, &produced);
        self.store.update(task_id, |record| {
            record.qa_verdict = Some(qa.clone());
            record.produced_artifacts = produced.clone();
            record.assigned_worker = None;
        });
        self.persist_qa_report(task_id, &qa);

        if !qa.passed {
            self.store.record_error(
                task_id,
                RecordedError::new(
                    ErrorCode::Validation,
                    qa.notes.first().cloned().unwrap_or_default(),
                ),
            );
            self.store.transition(task_id, TaskState::NeedsRework)?;
            return self.continue_after_rework(task_id, state);
        }

        match self.hitl.open_review(&spec, &qa) {
            ReviewDisposition::AutoApproved { score } => {
                tracing::debug!(task_id = %task_id, score, "auto-approved");
                self.store.transition(task_id, TaskState::Done)?;
                self.resolve_dependents(task_id, state)?;
            }
            ReviewDisposition::Queued { score, state: review_state } => {
                let item = self.hitl.item(task_id);
                self.audit.record(EntryKind::ReviewOpened {
                    task_id: Arc::from(task_id.as_str()),
                    score,
                    factors: item.map(|i| i.risk_factors).unwrap_or_default(),
                });
                self.store.transition(task_id, TaskState::HitlPending)?;
                if review_state == crate::hitl::ReviewState::Escalated {
                    self.store.transition(task_id, TaskState::Escalated)?;
                    self.audit.record(EntryKind::ReviewEscalated {
                        task_id: Arc::from(task_id.as_str()),
                        level: 1,
                    });
                }
            }
        }
        Ok(())
    }

    /// Mirror the QA verdict into `<state>/<task>/qa_report.json`
    fn persist_qa_report(&self, task_id: &TaskId, qa: &QaVerdict) {
        let Some(ref root) = self.state_dir else {
            return;
        };
        let dir = root.join(task_id.as_str());
        if std::fs::create_dir_all(&dir).is_err() {
            return;
        }
        if let Ok(raw) = serde_json::to_string_pretty(qa) {
            if let Err(e) = std::fs::write(dir.join("qa_report.json"), raw) {
                tracing::warn!(task_id = %task_id, error = %e, "qa report not persisted");
            }
        }
    }

    fn persist_artifacts(
        &self,
        task_id: &TaskId,
        outcome: &ExecOutcome,
    ) -> Result<Vec<ProducedArtifact>, EngineError> {
        if outcome.artifacts.is_empty() {
            return Ok(self.artifacts.records_for(task_id));
        }

        let worker = self
            .store
            .record(task_id)
            .and_then(|record| record.assigned_worker)
            .unwrap_or_else(|| "scheduler".to_string());

        let lease = self.artifacts.acquire(task_id, &worker)?;
        for artifact in &outcome.artifacts {
            let written = self
                .artifacts
                .write(&lease, &artifact.relative_path, &artifact.bytes)?;
            if !written.deduplicated {
                self.audit.record(EntryKind::ArtifactWritten {
                    task_id: Arc::from(task_id.as_str()),
                    relative_path: written.record.relative_path.clone(),
                    sha256: written.record.sha256.clone(),
                });
            }
        }
        Ok(self.artifacts.records_for(task_id))
    }

    fn handle_failure(
        &self,
        task_id: &TaskId,
        error: EngineError,
        state: &mut LoopState,
    ) -> Result<(), EngineError> {
        match &error {
            // Invalid result shape: NEEDS_REWORK without invoking QA.
            EngineError::Dispatch(_) => {
                self.store.record_error(
                    task_id,
                    RecordedError::new(ErrorCode::Validation, error.to_string()),
                );
                self.store.transition(task_id, TaskState::QaPending)?;
                self.store.transition(task_id, TaskState::NeedsRework)?;
                self.continue_after_rework(task_id, state)
            }
            EngineError::Executor(ExecutorError::Cancelled) => {
                self.store.transition(task_id, TaskState::Cancelled)?;
                self.store.update(task_id, |record| record.assigned_worker = None);
                self.propagate_cancellation(task_id, state)
            }
            _ => {
                let code = error.code();
                self.store
                    .record_error(task_id, RecordedError::new(code, error.to_string()));
                self.store.transition(task_id, TaskState::Failed)?;
                self.store.update(task_id, |record| record.assigned_worker = None);

                let attempts = self
                    .store
                    .record(task_id)
                    .map(|record| record.attempts)
                    .unwrap_or(0);

                if code.is_recoverable() && attempts < self.config.retry.max_attempts {
                    let backoff = self.config.retry.backoff_for_attempt(attempts + 1);
                    tracing::info!(task_id = %task_id, attempts, ?backoff, "scheduling retry");
                    state
                        .retries
                        .push((task_id.clone(), tokio::time::Instant::now() + backoff));
                    Ok(())
                } else {
                    self.permanent_failure(task_id, state)
                }
            }
        }
    }

    fn promote_due_retries(&self, state: &mut LoopState) -> Result<(), EngineError> {
        let now = tokio::time::Instant::now();
        let due: Vec<TaskId> = {
            let (ready, pending): (Vec<_>, Vec<_>) =
                state.retries.drain(..).partition(|(_, at)| *at <= now);
            state.retries = pending;
            ready.into_iter().map(|(id, _)| id).collect()
        };
        for task_id in due {
            // A cancel may have landed while the task waited out its backoff.
            if self.store.state(&task_id) == Some(TaskState::Failed) {
                let Some(spec) = self.store.spec(&task_id) else {
                    continue;
                };
                self.store.transition(&task_id, TaskState::Ready)?;
                state.queue.push(
                    task_id.clone(),
                    spec.priority,
                    self.graph.on_critical_path(&task_id),
                );
            }
        }
        Ok(())
    }

    /// NEEDS_REWORK -> READY while budget remains, FAILED at the cap
    fn continue_after_rework(
        &self,
        task_id: &TaskId,
        state: &mut LoopState,
    ) -> Result<(), EngineError> {
        let attempts = self
            .store
            .record(task_id)
            .map(|record| record.attempts)
            .unwrap_or(0);

        if attempts < self.config.retry.max_attempts {
            let Some(spec) = self.store.spec(task_id) else {
                return Ok(());
            };
            self.store.transition(task_id, TaskState::Ready)?;
            state.queue.push(
                task_id.clone(),
                spec.priority,
                self.graph.on_critical_path(task_id),
            );
            Ok(())
        } else {
            self.store.transition(task_id, TaskState::Failed)?;
            self.permanent_failure(task_id, state)
        }
    }

    // ------------------------------------------------------------------
    // Propagation
    // ------------------------------------------------------------------

    fn resolve_dependents(
        &self,
        task_id: &TaskId,
        state: &mut LoopState,
    ) -> Result<(), EngineError> {
        for dependent in self.graph.dependents_of(task_id).to_vec() {
            self.resolve_one_dependency(&dependent, state)?;
        }
        Ok(())
    }

    fn resolve_one_dependency(
        &self,
        dependent: &TaskId,
        state: &mut LoopState,
    ) -> Result<(), EngineError> {
        let Some(count) = state.remaining.get_mut(dependent) else {
            return Ok(());
        };
        *count = count.saturating_sub(1);
        if *count == 0 && self.store.state(dependent) == Some(TaskState::Declared) {
            self.make_ready(dependent, state)?;
        }
        Ok(())
    }

    /// Permanent failure: record history, cancel descendants unless flagged
    fn permanent_failure(&self, task_id: &TaskId, state: &mut LoopState) -> Result<(), EngineError> {
        tracing::warn!(task_id = %task_id, "permanent failure");
        self.hitl.history().record_failure(task_id);

        let mut frontier: VecDeque<(TaskId, bool)> = self
            .graph
            .dependents_of(task_id)
            .iter()
            .map(|d| (d.clone(), true))
            .collect();

        while let Some((next, via_failure)) = frontier.pop_front() {
            let Some(current) = self.store.state(&next) else {
                continue;
            };
            if current.is_terminal() {
                continue;
            }
            let independent = self
                .store
                .spec(&next)
                .map(|spec| spec.independent_on_failure)
                .unwrap_or(false);

            if via_failure && independent {
                // Flagged: the failed dependency counts as resolved.
                self.resolve_one_dependency(&next, state)?;
                continue;
            }

            self.store.transition(&next, TaskState::Cancelled)?;
            self.store.record_error(
                &next,
                RecordedError::new(ErrorCode::Cancelled, format!("ancestor {task_id} failed")),
            );
            // Dependents of a CANCELLED ancestor cancel unconditionally.
            for dependent in self.graph.dependents_of(&next) {
                frontier.push_back((dependent.clone(), false));
            }
        }
        Ok(())
    }

    /// Cancellation of one task cancels its whole descendant subtree
    fn propagate_cancellation(
        &self,
        task_id: &TaskId,
        _state: &mut LoopState,
    ) -> Result<(), EngineError> {
        let mut frontier: VecDeque<TaskId> =
            self.graph.dependents_of(task_id).iter().cloned().collect();
        while let Some(next) = frontier.pop_front() {
            let Some(current) = self.store.state(&next) else {
                continue;
            };
            if current.is_terminal() {
                continue;
            }
            if current == TaskState::Running {
                if let Some(token) = self.task_cancels.get(&next) {
                    token.cancel();
                }
                continue; // its completion handler finishes the job
            }
            self.store.transition(&next, TaskState::Cancelled)?;
            for dependent in self.graph.dependents_of(&next) {
                frontier.push_back(dependent.clone());
            }
        }
        Ok(())
    }

    fn process_cancel_requests(&self, state: &mut LoopState) -> Result<(), EngineError> {
        let requested: Vec<TaskId> = self
            .cancel_requests
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for task_id in requested {
            self.cancel_requests.remove(&task_id);
            let Some(current) = self.store.state(&task_id) else {
                continue;
            };
            // Cancelling an already-terminal task is a no-op.
            if current.is_terminal() {
                continue;
            }
            if current == TaskState::Running {
                if let Some(token) = self.task_cancels.get(&task_id) {
                    token.cancel();
                }
                continue;
            }
            self.store.transition(&task_id, TaskState::Cancelled)?;
            self.propagate_cancellation(&task_id, state)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Review plumbing
    // ------------------------------------------------------------------

    fn ingest_decisions(&self, state: &mut LoopState) -> Result<(), EngineError> {
        let Some(ref dir) = self.state_dir else {
            return Ok(());
        };
        for decision in drain_decision_files(dir) {
            match self.hitl.submit_decision(&decision) {
                Ok(Some(outcome)) => {
                    self.audit.record(EntryKind::ReviewDecided {
                        task_id: Arc::from(decision.task_id.as_str()),
                        reviewer: decision.reviewer.clone(),
                        verdict: format!("{:?}", decision.verdict).to_lowercase(),
                    });
                    self.apply_review_outcome(&decision.task_id, outcome, state)?;
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "decision not applied"),
            }
        }
        Ok(())
    }

    fn process_deadlines(&self, state: &mut LoopState) -> Result<(), EngineError> {
        for (task_id, outcome) in self.hitl.check_deadlines() {
            self.apply_review_outcome(&task_id, outcome, state)?;
        }
        Ok(())
    }

    fn apply_review_outcome(
        &self,
        task_id: &TaskId,
        outcome: ReviewOutcome,
        state: &mut LoopState,
    ) -> Result<(), EngineError> {
        let Some(current) = self.store.state(task_id) else {
            return Ok(());
        };
        if current.is_terminal() {
            return Ok(());
        }

        match outcome {
            ReviewOutcome::Approved => {
                self.store.update(task_id, |record| {
                    record.hitl_verdict = Some("approved".to_string());
                });
                self.store.transition(task_id, TaskState::Done)?;
                self.resolve_dependents(task_id, state)?;
            }
            ReviewOutcome::Rejected => {
                self.store.update(task_id, |record| {
                    record.hitl_verdict = Some("rejected".to_string());
                });
                self.store.record_error(
                    task_id,
                    RecordedError::new(ErrorCode::HitlRejected, "review rejected"),
                );
                self.store.transition(task_id, TaskState::Rejected)?;
                self.store.transition(task_id, TaskState::Failed)?;
                self.permanent_failure(task_id, state)?;
            }
            ReviewOutcome::Rework { notes } => {
                if current == TaskState::Escalated {
                    // Escalated items only resolve to DONE or REJECTED.
                    return self.apply_review_outcome(task_id, ReviewOutcome::Rejected, state);
                }
                self.store.update(task_id, |record| {
                    record.hitl_verdict = notes.clone().or(Some("rework".to_string()));
                });
                self.store.transition(task_id, TaskState::NeedsRework)?;
                self.continue_after_rework(task_id, state)?;
            }
            ReviewOutcome::Escalated { level } => {
                if current == TaskState::HitlPending {
                    self.store.transition(task_id, TaskState::Escalated)?;
                }
                self.audit.record(EntryKind::ReviewEscalated {
                    task_id: Arc::from(task_id.as_str()),
                    level,
                });
            }
            ReviewOutcome::EscalationExhausted => {
                if current == TaskState::HitlPending {
                    self.store.transition(task_id, TaskState::Escalated)?;
                }
                self.store.record_error(
                    task_id,
                    RecordedError::new(
                        ErrorCode::HitlEscalationExhausted,
                        "review deadline breached at final escalation level",
                    ),
                );
                self.store.update(task_id, |record| {
                    record.hitl_verdict = Some("escalation_exhausted".to_string());
                });
                self.store.transition(task_id, TaskState::Rejected)?;
                self.store.transition(task_id, TaskState::Failed)?;
                self.permanent_failure(task_id, state)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Wait for in-flight workers within the drain window; true = forced
    async fn drain(
        &self,
        workers: &mut JoinSet<(TaskId, Result<ExecOutcome, EngineError>)>,
    ) -> bool {
        let grace = self.config.cancel_grace.max(self.config.drain_window);
        let deadline = tokio::time::sleep(grace);
        tokio::pin!(deadline);

        loop {
            if workers.is_empty() {
                return false;
            }
            tokio::select! {
                _ = &mut deadline => {
                    tracing::warn!(in_flight = workers.len(), "drain window expired; aborting workers");
                    workers.abort_all();
                    return true;
                }
                joined = workers.join_next() => {
                    if joined.is_none() {
                        return false;
                    }
                }
            }
        }
    }

    fn cancel_everything_non_terminal(&self) {
        for spec in self.store.specs() {
            if let Some(current) = self.store.state(&spec.id) {
                if !current.is_terminal() {
                    if let Err(e) = self.store.transition(&spec.id, TaskState::Cancelled) {
                        tracing::warn!(task_id = %spec.id, error = %e, "cancel on shutdown failed");
                    }
                }
            }
        }
    }
}

// ============================================================================
// QA VALIDATION
// ============================================================================

/// Deterministic post-execution validation: every expected artifact pattern
/// must match something the attempt produced
fn qa_validate(spec: &TaskSpec, outcome: &ExecOutcome, produced: &[ProducedArtifact]) -> QaVerdict {
    for pattern in &spec.expected_artifacts {
        let matches = produced.iter().any(|artifact| {
            artifact.relative_path == *pattern
                || glob::Pattern::new(pattern)
                    .map(|p| p.matches(&artifact.relative_path))
                    .unwrap_or(false)
        });
        if !matches {
            return QaVerdict::finding(
                QaSeverity::Blocker,
                format!("expected artifact '{pattern}' was not produced"),
            );
        }
    }
    if outcome.output.trim().is_empty() && !produced.is_empty() {
        return QaVerdict::finding(QaSeverity::Major, "empty output alongside artifacts");
    }
    QaVerdict::pass()
}

// ============================================================================
// TESTS
// ============================================================================
