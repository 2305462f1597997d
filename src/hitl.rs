//! # HITL Review Engine
//!
//! Gates task completion behind a risk-scored human review.
//!
//! ## Risk scoring
//!
//! Weighted sum over: task risk tier (0/2/5), infrastructure or credential
//! topics (+3), production-write topics (+4), QA verdict severity (0/2/5),
//! and the task id's historical failure rate (0-3, decayed with a 30-day
//! half-life). Score < 3 auto-approves; < 7 awaits a human; >= 7 enters
//! ESCALATED directly.
//!
//! ## Escalation ladder
//!
//! reviewer -> team lead -> product owner -> incident channel. A deadline
//! breach promotes one level and resets the per-level deadline; a breach at
//! the final level rejects the item outright. Items that enter ESCALATED
//! start one rung up, so they exhaust after two promotions.
//!
//! Review items are arena-owned here and referenced by task id; tasks never
//! hold pointers back. Deadlines run on the monotonic clock; wall-clock
//! stamps are audit-only.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::HitlConfig;
use crate::task::QaVerdict;
use crate::types::{RoleId, TaskId};

/// Ladder levels, in promotion order
const LADDER: [&str; 4] = ["reviewer", "team_lead", "product_owner", "incident_channel"];

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum HitlError {
    #[error("No review item for task {task_id}")]
    UnknownTask { task_id: TaskId },

    #[error("Review for task {task_id} is already {state}")]
    AlreadyDecided { task_id: TaskId, state: ReviewState },
}

impl HitlError {
    pub fn code(&self) -> crate::error::ErrorCode {
        crate::error::ErrorCode::HitlRejected
    }
}

// ============================================================================
// REVIEW MODEL
// ============================================================================

/// Review item state. Terminal: APPROVED, REJECTED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewState {
    AwaitingQa,
    AwaitingHuman,
    InReview,
    Escalated,
    Approved,
    Rejected,
}

impl ReviewState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReviewState::Approved | ReviewState::Rejected)
    }
}

impl std::fmt::Display for ReviewState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReviewState::AwaitingQa => "AWAITING_QA",
            ReviewState::AwaitingHuman => "AWAITING_HUMAN",
            ReviewState::InReview => "IN_REVIEW",
            ReviewState::Escalated => "ESCALATED",
            ReviewState::Approved => "APPROVED",
            ReviewState::Rejected => "REJECTED",
        };
        f.write_str(s)
    }
}

/// One queued review, owned by the engine
#[derive(Debug, Clone)]
pub struct ReviewItem {
    pub task_id: TaskId,
    pub risk_score: u32,
    pub risk_factors: Vec<String>,
    pub reviewer_role: RoleId,
    pub state: ReviewState,
    pub created_at: DateTime<Utc>,
    /// Current ladder level (index into the promotion order)
    pub level: u32,
    pub promotions: u32,
    /// Monotonic deadline for the current level
    pub deadline: Instant,
    /// Wall-clock mirror of the deadline, for operators only
    pub deadline_at: DateTime<Utc>,
}

impl ReviewItem {
    pub fn ladder_position(&self) -> &'static str {
        LADDER[(self.level as usize).min(LADDER.len() - 1)]
    }
}

/// Inbound decision record (`decisions/*.jsonl` or programmatic)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewDecision {
    pub task_id: TaskId,
    /// Opaque reviewer token; identity verification is out of scope
    pub reviewer: String,
    pub verdict: ReviewVerdict,
    #[serde(default)]
    pub notes: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewVerdict {
    Approve,
    Reject,
    Rework,
}

/// What the scheduler should do with the task after a review event
#[derive(Debug, Clone, PartialEq)]
pub enum ReviewOutcome {
    Approved,
    Rejected,
    Rework { notes: Option<String> },
    Escalated { level: u32 },
    EscalationExhausted,
}

/// Disposition of a freshly scored task
#[derive(Debug, Clone, PartialEq)]
pub enum ReviewDisposition {
    /// Score under the threshold; no human involved
    AutoApproved { score: u32 },
    /// Queued for review (AWAITING_HUMAN or ESCALATED)
    Queued { score: u32, state: ReviewState },
}

// ============================================================================
// FAILURE HISTORY
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct FailureEntry {
    count: f64,
    updated_at: DateTime<Utc>,
}

/// Persisted per-task-id failure counters with half-life decay
pub struct FailureHistory {
    path: Option<PathBuf>,
    entries: Mutex<HashMap<String, FailureEntry>>,
    half_life: std::time::Duration,
}

impl FailureHistory {
    pub fn in_memory(half_life: std::time::Duration) -> Self {
        Self {
            path: None,
            entries: Mutex::new(HashMap::new()),
            half_life,
        }
    }

    /// Load from `<state_dir>/failure_history.json` (created on first save)
    pub fn open(state_dir: &Path, half_life: std::time::Duration) -> Self {
        let path = state_dir.join("failure_history.json");
        let entries = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        Self {
            path: Some(path),
            entries: Mutex::new(entries),
            half_life,
        }
    }

    fn decayed(&self, entry: &FailureEntry, now: DateTime<Utc>) -> f64 {
        let elapsed = (now - entry.updated_at)
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        let half_lives = elapsed.as_secs_f64() / self.half_life.as_secs_f64().max(1.0);
        entry.count * 0.5f64.powf(half_lives)
    }

    /// Record one permanent failure for a task id
    pub fn record_failure(&self, task_id: &TaskId) {
        let now = Utc::now();
        let mut entries = self.entries.lock();
        let entry = entries.entry(task_id.to_string()).or_default();
        let current = if entry.updated_at.timestamp() == 0 {
            0.0
        } else {
            self.decayed(entry, now)
        };
        entry.count = current + 1.0;
        entry.updated_at = now;
        self.persist(&entries);
    }

    /// Risk points contributed by history: 0-3
    pub fn risk_points(&self, task_id: &TaskId) -> u32 {
        let now = Utc::now();
        let entries = self.entries.lock();
        let Some(entry) = entries.get(task_id.as_str()) else {
            return 0;
        };
        (self.decayed(entry, now).round() as u32).min(3)
    }

    fn persist(&self, entries: &HashMap<String, FailureEntry>) {
        let Some(ref path) = self.path else { return };
        if let Ok(raw) = serde_json::to_string_pretty(entries) {
            if let Err(e) = std::fs::write(path, raw) {
                tracing::warn!(error = %e, "failure history not persisted");
            }
        }
    }
}

// ============================================================================
// RISK SCORING
// ============================================================================

/// Topics that mark infrastructure or credential changes
const INFRA_TOPICS: [&str; 4] = ["infrastructure", "credentials", "secrets", "iam"];
/// Topics that mark writes to production resources
const PRODUCTION_TOPICS: [&str; 3] = ["production", "prod-db", "prod-deploy"];

/// Compute the weighted risk score and its contributing factors
pub fn score_risk(
    spec: &crate::task::TaskSpec,
    qa: &QaVerdict,
    history: &FailureHistory,
) -> (u32, Vec<String>) {
    let mut score = 0u32;
    let mut factors = Vec::new();

    let tier = spec.risk_tier.weight();
    if tier > 0 {
        score += tier;
        factors.push(format!("risk_tier:{}(+{tier})", spec.risk_tier));
    }

    if spec
        .context_topics
        .iter()
        .any(|t| INFRA_TOPICS.contains(&t.as_str()))
    {
        score += 3;
        factors.push("infrastructure_or_credentials(+3)".to_string());
    }

    if spec
        .context_topics
        .iter()
        .any(|t| PRODUCTION_TOPICS.contains(&t.as_str()))
    {
        score += 4;
        factors.push("production_write(+4)".to_string());
    }

    let qa_weight = qa.weight();
    if qa_weight > 0 {
        score += qa_weight;
        factors.push(format!("qa_severity(+{qa_weight})"));
    }

    let history_points = history.risk_points(&spec.id);
    if history_points > 0 {
        score += history_points;
        factors.push(format!("failure_history(+{history_points})"));
    }

    (score, factors)
}

// ============================================================================
// HITL ENGINE
// ============================================================================

/// Review engine: owns the item arena, the queue ordering, and the ladder
pub struct HitlEngine {
    config: HitlConfig,
    items: Mutex<HashMap<TaskId, ReviewItem>>,
    history: FailureHistory,
}

impl HitlEngine {
    pub fn new(config: HitlConfig, history: FailureHistory) -> Self {
        Self {
            config,
            items: Mutex::new(HashMap::new()),
            history,
        }
    }

    pub fn history(&self) -> &FailureHistory {
        &self.history
    }

    /// Score a QA-passed task and route it: auto-approve, queue, or escalate
    pub fn open_review(
        &self,
        spec: &crate::task::TaskSpec,
        qa: &QaVerdict,
    ) -> ReviewDisposition {
        let (score, factors) = score_risk(spec, qa, &self.history);

        if score < self.config.auto_approve_below {
            return ReviewDisposition::AutoApproved { score };
        }

        let escalated = score >= self.config.escalate_at;
        let sla = if escalated {
            self.config.escalated_sla
        } else {
            self.config.standard_sla
        };
        let state = if escalated {
            ReviewState::Escalated
        } else {
            ReviewState::AwaitingHuman
        };

        let item = ReviewItem {
            task_id: spec.id.clone(),
            risk_score: score,
            risk_factors: factors,
            reviewer_role: RoleId::TechnicalLead,
            state,
            created_at: Utc::now(),
            level: if escalated { 1 } else { 0 },
            promotions: 0,
            deadline: Instant::now() + sla,
            deadline_at: Utc::now() + chrono::Duration::from_std(sla).unwrap_or_else(|_| chrono::Duration::zero()),
        };

        self.items.lock().insert(spec.id.clone(), item);
        ReviewDisposition::Queued { score, state }
    }

    /// Queue snapshot ordered by `(deadline ASC, score DESC, created_at ASC)`
    pub fn queue(&self) -> Vec<ReviewItem> {
        let items = self.items.lock();
        let mut queue: Vec<ReviewItem> = items
            .values()
            .filter(|item| !item.state.is_terminal())
            .cloned()
            .collect();
        queue.sort_by(|a, b| {
            a.deadline
                .cmp(&b.deadline)
                .then_with(|| b.risk_score.cmp(&a.risk_score))
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        queue
    }

    /// Snapshot of one item
    pub fn item(&self, task_id: &TaskId) -> Option<ReviewItem> {
        self.items.lock().get(task_id).cloned()
    }

    /// Count of open reviews, and of those past their deadline
    pub fn open_counts(&self) -> (usize, usize) {
        let now = Instant::now();
        let items = self.items.lock();
        let open = items.values().filter(|i| !i.state.is_terminal()).count();
        let overdue = items
            .values()
            .filter(|i| !i.state.is_terminal() && i.deadline <= now)
            .count();
        (open, overdue)
    }

    /// Apply one inbound decision. Duplicate decisions for the same reviewer
    /// collapse idempotently; conflicting decisions on a terminal item fail.
    pub fn submit_decision(
        &self,
        decision: &ReviewDecision,
    ) -> Result<Option<ReviewOutcome>, HitlError> {
        let mut items = self.items.lock();
        let state = items
            .get(&decision.task_id)
            .map(|item| item.state)
            .ok_or_else(|| HitlError::UnknownTask {
                task_id: decision.task_id.clone(),
            })?;

        if state.is_terminal() {
            let matches_terminal = matches!(
                (state, decision.verdict),
                (ReviewState::Approved, ReviewVerdict::Approve)
                    | (ReviewState::Rejected, ReviewVerdict::Reject)
            );
            if matches_terminal {
                // Idempotent duplicate; no transition, no error.
                return Ok(None);
            }
            return Err(HitlError::AlreadyDecided {
                task_id: decision.task_id.clone(),
                state,
            });
        }

        match decision.verdict {
            ReviewVerdict::Approve => {
                if let Some(item) = items.get_mut(&decision.task_id) {
                    item.state = ReviewState::Approved;
                }
                Ok(Some(ReviewOutcome::Approved))
            }
            ReviewVerdict::Reject => {
                if let Some(item) = items.get_mut(&decision.task_id) {
                    item.state = ReviewState::Rejected;
                }
                Ok(Some(ReviewOutcome::Rejected))
            }
            ReviewVerdict::Rework => {
                // The next attempt opens a fresh review item.
                items.remove(&decision.task_id);
                Ok(Some(ReviewOutcome::Rework {
                    notes: decision.notes.clone(),
                }))
            }
        }
    }

    /// Mark an item as picked up by a reviewer
    pub fn begin_review(&self, task_id: &TaskId) -> Result<(), HitlError> {
        let mut items = self.items.lock();
        let item = items.get_mut(task_id).ok_or_else(|| HitlError::UnknownTask {
            task_id: task_id.clone(),
        })?;
        if item.state.is_terminal() {
            return Err(HitlError::AlreadyDecided {
                task_id: task_id.clone(),
                state: item.state,
            });
        }
        item.state = ReviewState::InReview;
        Ok(())
    }

    /// Promote or reject items whose deadline has passed
    pub fn check_deadlines(&self) -> Vec<(TaskId, ReviewOutcome)> {
        let now = Instant::now();
        let mut events = Vec::new();
        let mut items = self.items.lock();

        for item in items.values_mut() {
            if item.state.is_terminal() || item.deadline > now {
                continue;
            }

            // A breach with nowhere left to climb rejects the item; items
            // entering at a higher rung therefore exhaust in fewer cycles.
            let at_top = item.level as usize == LADDER.len() - 1;
            if at_top || item.promotions >= self.config.max_promotions {
                item.state = ReviewState::Rejected;
                events.push((item.task_id.clone(), ReviewOutcome::EscalationExhausted));
                continue;
            }

            item.promotions += 1;
            item.level += 1;
            item.state = ReviewState::Escalated;
            item.deadline = now + self.config.escalated_sla;
            item.deadline_at = Utc::now()
                + chrono::Duration::from_std(self.config.escalated_sla).unwrap_or_else(|_| chrono::Duration::zero());
            events.push((
                item.task_id.clone(),
                ReviewOutcome::Escalated { level: item.level },
            ));
        }

        events
    }
}

// ============================================================================
// DECISION FILE INGESTION
// ============================================================================

/// Read decision records from `<dir>/decisions/*.jsonl`, consuming the files
pub fn drain_decision_files(dir: &Path) -> Vec<ReviewDecision> {
    let decisions_dir = dir.join("decisions");
    let Ok(entries) = std::fs::read_dir(&decisions_dir) else {
        return Vec::new();
    };

    let mut decisions = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
            continue;
        }
        let Ok(raw) = std::fs::read_to_string(&path) else {
            continue;
        };
        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<ReviewDecision>(line) {
                Ok(decision) => decisions.push(decision),
                Err(e) => tracing::warn!(file = %path.display(), error = %e, "bad decision record"),
            }
        }
        let _ = std::fs::remove_file(&path);
    }
    decisions
}

// ============================================================================
// TESTS
// ============================================================================
