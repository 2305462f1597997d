//! Task definitions and the execution state machine
//!
//! A task is an immutable [`TaskSpec`] (one YAML document on disk) plus a
//! mutable [`ExecutionRecord`] owned by the task store. State changes go
//! through [`TaskState::can_transition`]; the scheduler refuses anything the
//! table does not allow and every accepted transition lands in the audit log.
//!
//! ```text
//! DECLARED -> READY -> RUNNING -> {QA_PENDING | FAILED}
//! QA_PENDING -> {HITL_PENDING | DONE | NEEDS_REWORK}
//! HITL_PENDING -> {DONE | NEEDS_REWORK | ESCALATED}
//! ESCALATED -> {DONE | REJECTED}
//! NEEDS_REWORK -> {READY | FAILED}   (attempts++, capped; FAILED at cap)
//! FAILED -> READY              (retry edge, capped)
//! HITL_PENDING -> REJECTED     (human reject), REJECTED -> FAILED
//! any non-terminal -> CANCELLED
//! ```

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::duration_str;
use crate::types::{Priority, QaSeverity, RiskTier, RoleId, TaskId};

// ============================================================================
// TASK STATE
// ============================================================================

/// Execution state of a task. Terminal: DONE, FAILED, CANCELLED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    #[default]
    Declared,
    Ready,
    Running,
    QaPending,
    HitlPending,
    Escalated,
    NeedsRework,
    Rejected,
    Done,
    Failed,
    Cancelled,
}

impl TaskState {
    /// Terminal states admit no further transitions (except the FAILED->READY
    /// retry edge, which the scheduler takes only while attempts remain).
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Done | TaskState::Failed | TaskState::Cancelled)
    }

    /// Whether `self -> to` is a legal transition
    pub fn can_transition(&self, to: TaskState) -> bool {
        use TaskState::*;

        // Any non-terminal state may be cancelled by an external signal.
        if to == Cancelled {
            return !self.is_terminal();
        }

        matches!(
            (self, to),
            (Declared, Ready)
                | (Ready, Running)
                | (Running, QaPending)
                | (Running, Failed)
                | (QaPending, HitlPending)
                | (QaPending, Done)
                | (QaPending, NeedsRework)
                | (HitlPending, Done)
                | (HitlPending, NeedsRework)
                | (HitlPending, Escalated)
                | (HitlPending, Rejected)
                | (Escalated, Done)
                | (Escalated, Rejected)
                | (NeedsRework, Ready)
                | (NeedsRework, Failed)
                | (Failed, Ready)
                | (Rejected, Failed)
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Declared => "declared",
            TaskState::Ready => "ready",
            TaskState::Running => "running",
            TaskState::QaPending => "qa_pending",
            TaskState::HitlPending => "hitl_pending",
            TaskState::Escalated => "escalated",
            TaskState::NeedsRework => "needs_rework",
            TaskState::Rejected => "rejected",
            TaskState::Done => "done",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Rejected transition, surfaced when a component tries to move a task
/// somewhere the table does not allow
#[derive(Debug, thiserror::Error)]
#[error("Illegal state transition for {task_id}: {from} -> {to}")]
pub struct StateError {
    pub task_id: TaskId,
    pub from: TaskState,
    pub to: TaskState,
}

// ============================================================================
// TASK SPEC
// ============================================================================

/// Default effort when a definition omits `estimatedEffort`
const DEFAULT_EFFORT: Duration = Duration::from_secs(15 * 60);

/// Immutable task definition, one per YAML file in the run's `tasks/`
/// directory. Unknown fields are rejected at load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TaskSpec {
    /// Unique identifier (required), e.g. `BE-07`
    pub id: TaskId,

    /// Human-readable title (required)
    pub title: String,

    /// Optional longer description, folded into the executor prompt
    #[serde(default)]
    pub description: Option<String>,

    /// Role that executes this task (required)
    pub owner: RoleId,

    /// Upstream task ids that must be DONE first
    #[serde(default)]
    pub depends_on: BTreeSet<TaskId>,

    /// Initial state; the loader rejects anything but `declared`
    #[serde(default)]
    pub state: TaskState,

    /// Priority class (required)
    pub priority: Priority,

    /// Domain tags used for memory retrieval and risk features
    #[serde(default)]
    pub context_topics: BTreeSet<String>,

    /// Effort estimate driving critical path and hard timeouts
    #[serde(default, with = "duration_str::option")]
    pub estimated_effort: Option<Duration>,

    /// Static risk classification
    #[serde(default)]
    pub risk_tier: RiskTier,

    /// Relative paths the task is expected to produce (may be globs)
    #[serde(default)]
    pub expected_artifacts: Vec<String>,

    /// When true, downstream failure propagation skips this task
    #[serde(default)]
    pub independent_on_failure: bool,
}

impl TaskSpec {
    /// Effort estimate, defaulted when the definition omits it
    pub fn effort(&self) -> Duration {
        self.estimated_effort.unwrap_or(DEFAULT_EFFORT)
    }

    /// Query text used for memory retrieval at dispatch time
    pub fn query_text(&self) -> String {
        match &self.description {
            Some(desc) => format!("{} {}", self.title, desc),
            None => self.title.clone(),
        }
    }
}

// ============================================================================
// EXECUTION RECORD
// ============================================================================

/// Stable error code plus message, as recorded in audit entries and metrics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedError {
    pub code: crate::error::ErrorCode,
    pub message: String,
}

impl RecordedError {
    pub fn new(code: crate::error::ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// QA validation outcome for one attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaVerdict {
    pub passed: bool,
    /// Severity of the worst finding; None when nothing was flagged
    pub severity: Option<QaSeverity>,
    pub notes: Vec<String>,
}

impl QaVerdict {
    pub fn pass() -> Self {
        Self {
            passed: true,
            severity: None,
            notes: Vec::new(),
        }
    }

    pub fn finding(severity: QaSeverity, note: impl Into<String>) -> Self {
        Self {
            passed: severity < QaSeverity::Blocker,
            severity: Some(severity),
            notes: vec![note.into()],
        }
    }

    /// Risk-score contribution of this verdict
    pub fn weight(&self) -> u32 {
        self.severity.map(|s| s.weight()).unwrap_or(0)
    }
}

/// Artifact produced by an attempt, as referenced from the execution record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducedArtifact {
    pub relative_path: String,
    pub sha256: String,
    pub len: u64,
    pub written_at: DateTime<Utc>,
}

/// Mutable execution state, owned by the task store and persisted per task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub state: TaskState,
    pub attempts: u32,
    /// Wall-clock timestamps are recorded for audit, never for scheduling
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<RecordedError>,
    pub produced_artifacts: Vec<ProducedArtifact>,
    pub qa_verdict: Option<QaVerdict>,
    pub hitl_verdict: Option<String>,
    /// Lease id of the worker currently running the task
    pub assigned_worker: Option<String>,
}

impl Default for ExecutionRecord {
    fn default() -> Self {
        Self {
            state: TaskState::Declared,
            attempts: 0,
            started_at: None,
            finished_at: None,
            last_error: None,
            produced_artifacts: Vec::new(),
            qa_verdict: None,
            hitl_verdict: None,
            assigned_worker: None,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        use TaskState::*;
        assert!(Declared.can_transition(Ready));
        assert!(Ready.can_transition(Running));
        assert!(Running.can_transition(QaPending));
        assert!(QaPending.can_transition(Done));
        assert!(QaPending.can_transition(HitlPending));
        assert!(HitlPending.can_transition(Done));
        assert!(HitlPending.can_transition(Escalated));
        assert!(Escalated.can_transition(Rejected));
        assert!(Rejected.can_transition(Failed));
    }

    #[test]
    fn test_retry_edges() {
        use TaskState::*;
        assert!(Failed.can_transition(Ready));
        assert!(NeedsRework.can_transition(Ready));
        // Rework-cap exhaustion and direct human reject
        assert!(NeedsRework.can_transition(Failed));
        assert!(HitlPending.can_transition(Rejected));
    }

    #[test]
    fn test_cancel_from_any_non_terminal() {
        use TaskState::*;
        for state in [
            Declared,
            Ready,
            Running,
            QaPending,
            HitlPending,
            Escalated,
            NeedsRework,
            Rejected,
        ] {
            assert!(state.can_transition(Cancelled), "{state} should cancel");
        }
        assert!(!Done.can_transition(Cancelled));
        assert!(!Cancelled.can_transition(Cancelled));
    }

    #[test]
    fn test_illegal_transitions() {
        use TaskState::*;
        assert!(!Declared.can_transition(Running));
        assert!(!Ready.can_transition(Done));
        assert!(!Done.can_transition(Ready));
        assert!(!Cancelled.can_transition(Ready));
        assert!(!Running.can_transition(Done));
    }

    #[test]
    fn test_terminal_states() {
        use TaskState::*;
        assert!(Done.is_terminal());
        assert!(Failed.is_terminal());
        assert!(Cancelled.is_terminal());
        assert!(!Escalated.is_terminal());
        assert!(!NeedsRework.is_terminal());
    }

    #[test]
    fn test_parse_minimal_spec() {
        let yaml = r#"
id: BE-07
title: "Implement the orders endpoint"
owner: backend
priority: HIGH
"#;
        let spec: TaskSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.id.as_str(), "BE-07");
        assert_eq!(spec.owner, RoleId::Backend);
        assert_eq!(spec.state, TaskState::Declared);
        assert!(spec.depends_on.is_empty());
        assert_eq!(spec.effort(), DEFAULT_EFFORT);
        assert!(!spec.independent_on_failure);
    }

    #[test]
    fn test_parse_full_spec() {
        let yaml = r#"
id: FE-02
title: "Checkout page"
description: "Build the checkout flow against the orders API"
owner: frontend
dependsOn: [BE-07]
state: declared
priority: MED
contextTopics: [checkout, payments]
estimatedEffort: 90m
riskTier: HIGH
expectedArtifacts:
  - src/pages/checkout.tsx
independentOnFailure: true
"#;
        let spec: TaskSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.effort(), Duration::from_secs(90 * 60));
        assert_eq!(spec.risk_tier, RiskTier::High);
        assert!(spec.depends_on.contains(&TaskId::new("BE-07").unwrap()));
        assert!(spec.independent_on_failure);
        assert_eq!(spec.query_text(), "Checkout page Build the checkout flow against the orders API");
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let yaml = r#"
id: BE-07
title: "x"
owner: backend
priority: LOW
surprise: true
"#;
        let result: Result<TaskSpec, _> = serde_yaml::from_str(yaml);
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_owner_rejected() {
        let yaml = r#"
id: BE-07
title: "x"
owner: wizard
priority: LOW
"#;
        let result: Result<TaskSpec, _> = serde_yaml::from_str(yaml);
        assert!(result.is_err());
    }

    #[test]
    fn test_qa_verdict_weights() {
        assert_eq!(QaVerdict::pass().weight(), 0);
        assert_eq!(QaVerdict::finding(QaSeverity::Major, "x").weight(), 2);
        let blocker = QaVerdict::finding(QaSeverity::Blocker, "missing artifact");
        assert_eq!(blocker.weight(), 5);
        assert!(!blocker.passed);
    }
}
