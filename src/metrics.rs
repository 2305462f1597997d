//! Metrics emitter
//!
//! Read-only, strongly typed snapshots for external dashboards. A snapshot is
//! assembled in one pass under brief read locks and never mutates engine
//! state. The shape is versioned; changes must stay additive.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::{AuditLog, EntryKind};
use crate::hitl::HitlEngine;
use crate::memory::{CacheStats, MemoryEngine};
use crate::store::TaskStore;
use crate::task::TaskState;
use crate::types::RoleId;

/// Snapshot shape version; additive changes only
pub const SNAPSHOT_VERSION: u32 = 1;

// ============================================================================
// SNAPSHOT TYPES
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMetrics {
    pub id: String,
    pub state: TaskState,
    pub attempts: u32,
    pub duration_ms: Option<u64>,
    pub qa_passed: Option<bool>,
    pub hitl_state: Option<String>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleMetrics {
    pub role: RoleId,
    /// Tasks brought to DONE
    pub throughput: usize,
    /// Tasks not yet terminal
    pub backlog: usize,
    pub mean_latency_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalMetrics {
    pub total_tasks: usize,
    pub done: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub completion_rate: f64,
    pub qa_pass_rate: f64,
    pub active_reviews: usize,
    pub overdue_reviews: usize,
    pub cache: CacheStats,
    /// Stable error code -> occurrence count
    pub error_counts: HashMap<String, u64>,
    /// Derived, additive: weighted blend of completion, QA, and review health
    pub health_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub version: u32,
    pub taken_at: DateTime<Utc>,
    pub tasks: Vec<TaskMetrics>,
    pub roles: Vec<RoleMetrics>,
    pub global: GlobalMetrics,
}

// ============================================================================
// COLLECTION
// ============================================================================

/// Assemble one consistent snapshot
pub fn snapshot(
    store: &TaskStore,
    hitl: &HitlEngine,
    memory: &MemoryEngine,
    audit: &AuditLog,
) -> MetricsSnapshot {
    let mut tasks = Vec::with_capacity(store.len());
    let mut per_role: HashMap<RoleId, (usize, usize, Vec<u64>)> = HashMap::new();
    let mut qa_total = 0usize;
    let mut qa_passed = 0usize;

    let mut specs: Vec<_> = store.specs().cloned().collect();
    specs.sort_by(|a, b| a.id.cmp(&b.id));

    for spec in &specs {
        let Some(record) = store.record(&spec.id) else {
            continue;
        };

        let duration_ms = match (record.started_at, record.finished_at) {
            (Some(start), Some(end)) => (end - start).num_milliseconds().try_into().ok(),
            _ => None,
        };

        if let Some(ref verdict) = record.qa_verdict {
            qa_total += 1;
            if verdict.passed {
                qa_passed += 1;
            }
        }

        let entry = per_role.entry(spec.owner).or_default();
        if record.state == TaskState::Done {
            entry.0 += 1;
            if let Some(ms) = duration_ms {
                entry.2.push(ms);
            }
        } else if !record.state.is_terminal() {
            entry.1 += 1;
        }

        tasks.push(TaskMetrics {
            id: spec.id.to_string(),
            state: record.state,
            attempts: record.attempts,
            duration_ms,
            qa_passed: record.qa_verdict.as_ref().map(|v| v.passed),
            hitl_state: hitl.item(&spec.id).map(|item| item.state.to_string()),
            last_error: record.last_error.map(|e| e.code.to_string()),
        });
    }

    let roles = RoleId::ALL
        .into_iter()
        .filter_map(|role| {
            let (throughput, backlog, latencies) = per_role.remove(&role)?;
            let mean_latency_ms = if latencies.is_empty() {
                None
            } else {
                Some(latencies.iter().sum::<u64>() / latencies.len() as u64)
            };
            Some(RoleMetrics {
                role,
                throughput,
                backlog,
                mean_latency_ms,
            })
        })
        .collect();

    let (done, failed, cancelled) = store.terminal_counts();
    let total = store.len();
    let completion_rate = if total == 0 {
        1.0
    } else {
        done as f64 / total as f64
    };
    let qa_pass_rate = if qa_total == 0 {
        1.0
    } else {
        qa_passed as f64 / qa_total as f64
    };

    let (active_reviews, overdue_reviews) = hitl.open_counts();

    let mut error_counts: HashMap<String, u64> = HashMap::new();
    for entry in audit.entries() {
        if let EntryKind::TaskErrored { code, .. } = entry.kind {
            *error_counts.entry(code.to_string()).or_default() += 1;
        }
    }

    let review_health = 1.0 - overdue_reviews as f64 / active_reviews.max(1) as f64;
    let health_score =
        (0.5 * completion_rate + 0.3 * qa_pass_rate + 0.2 * review_health).clamp(0.0, 1.0);

    MetricsSnapshot {
        version: SNAPSHOT_VERSION,
        taken_at: Utc::now(),
        tasks,
        roles,
        global: GlobalMetrics {
            total_tasks: total,
            done,
            failed,
            cancelled,
            completion_rate,
            qa_pass_rate,
            active_reviews,
            overdue_reviews,
            cache: memory.cache_stats(),
            error_counts,
            health_score,
        },
    }
}

/// Persist a snapshot as `<state_dir>/metrics.json` for pull consumers
pub fn persist(snapshot: &MetricsSnapshot, state_dir: &Path) {
    let Ok(raw) = serde_json::to_string_pretty(snapshot) else {
        return;
    };
    let path = state_dir.join("metrics.json");
    let tmp = state_dir.join(".metrics.tmp");
    let result = std::fs::write(&tmp, raw).and_then(|()| std::fs::rename(&tmp, &path));
    if let Err(e) = result {
        tracing::warn!(error = %e, "metrics snapshot not persisted");
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HitlConfig, MemoryConfig};
    use crate::hitl::FailureHistory;
    use crate::task::{QaVerdict, TaskSpec};
    use crate::types::TaskId;
    use std::time::Duration;

    fn spec(id: &str, owner: &str) -> TaskSpec {
        serde_yaml::from_str(&format!(
            "id: {id}\ntitle: \"{id}\"\nowner: {owner}\npriority: MED\n"
        ))
        .unwrap()
    }

    fn fixtures(dir: &Path) -> (TaskStore, HitlEngine, MemoryEngine, AuditLog) {
        let audit = AuditLog::new();
        let store = TaskStore::in_memory(
            vec![spec("A", "backend"), spec("B", "frontend")],
            audit.clone(),
        );
        let hitl = HitlEngine::new(
            HitlConfig::default(),
            FailureHistory::in_memory(Duration::from_secs(3600)),
        );
        let memory = MemoryEngine::open(
            dir,
            MemoryConfig {
                passphrase: Some("t".into()),
                ..MemoryConfig::default()
            },
        )
        .unwrap();
        (store, hitl, memory, audit)
    }

    #[test]
    fn test_snapshot_counts_and_rates() {
        let dir = tempfile::tempdir().unwrap();
        let (store, hitl, memory, audit) = fixtures(dir.path());
        let a = TaskId::new("A").unwrap();

        store.transition(&a, TaskState::Ready).unwrap();
        store.transition(&a, TaskState::Running).unwrap();
        store.transition(&a, TaskState::QaPending).unwrap();
        store.update(&a, |r| r.qa_verdict = Some(QaVerdict::pass()));
        store.transition(&a, TaskState::Done).unwrap();

        let snap = snapshot(&store, &hitl, &memory, &audit);
        assert_eq!(snap.version, SNAPSHOT_VERSION);
        assert_eq!(snap.global.total_tasks, 2);
        assert_eq!(snap.global.done, 1);
        assert!((snap.global.completion_rate - 0.5).abs() < 1e-9);
        assert!((snap.global.qa_pass_rate - 1.0).abs() < 1e-9);

        let task_a = snap.tasks.iter().find(|t| t.id == "A").unwrap();
        assert_eq!(task_a.state, TaskState::Done);
        assert_eq!(task_a.attempts, 1);
        assert_eq!(task_a.qa_passed, Some(true));
    }

    #[test]
    fn test_role_breakdown() {
        let dir = tempfile::tempdir().unwrap();
        let (store, hitl, memory, audit) = fixtures(dir.path());
        let a = TaskId::new("A").unwrap();
        store.transition(&a, TaskState::Ready).unwrap();
        store.transition(&a, TaskState::Running).unwrap();
        store.transition(&a, TaskState::QaPending).unwrap();
        store.transition(&a, TaskState::Done).unwrap();

        let snap = snapshot(&store, &hitl, &memory, &audit);
        let backend = snap.roles.iter().find(|r| r.role == RoleId::Backend).unwrap();
        assert_eq!(backend.throughput, 1);
        assert_eq!(backend.backlog, 0);
        let frontend = snap
            .roles
            .iter()
            .find(|r| r.role == RoleId::Frontend)
            .unwrap();
        assert_eq!(frontend.backlog, 1);
    }

    #[test]
    fn test_error_counts_from_audit() {
        let dir = tempfile::tempdir().unwrap();
        let (store, hitl, memory, audit) = fixtures(dir.path());
        let a = TaskId::new("A").unwrap();
        store.record_error(
            &a,
            crate::task::RecordedError::new(crate::error::ErrorCode::Executor, "x"),
        );
        store.record_error(
            &a,
            crate::task::RecordedError::new(crate::error::ErrorCode::Executor, "y"),
        );

        let snap = snapshot(&store, &hitl, &memory, &audit);
        assert_eq!(snap.global.error_counts.get("EXECUTOR"), Some(&2));
        let task_a = snap.tasks.iter().find(|t| t.id == "A").unwrap();
        assert_eq!(task_a.last_error.as_deref(), Some("EXECUTOR"));
    }

    #[test]
    fn test_empty_run_health() {
        let dir = tempfile::tempdir().unwrap();
        let audit = AuditLog::new();
        let store = TaskStore::in_memory(vec![], audit.clone());
        let hitl = HitlEngine::new(
            HitlConfig::default(),
            FailureHistory::in_memory(Duration::from_secs(3600)),
        );
        let memory = MemoryEngine::open(
            dir.path(),
            MemoryConfig {
                passphrase: Some("t".into()),
                ..MemoryConfig::default()
            },
        )
        .unwrap();

        let snap = snapshot(&store, &hitl, &memory, &audit);
        assert_eq!(snap.global.total_tasks, 0);
        assert!((snap.global.health_score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_persist_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (store, hitl, memory, audit) = fixtures(dir.path());
        let snap = snapshot(&store, &hitl, &memory, &audit);
        persist(&snap, dir.path());

        let raw = std::fs::read_to_string(dir.path().join("metrics.json")).unwrap();
        let loaded: MetricsSnapshot = serde_json::from_str(&raw).unwrap();
        assert_eq!(loaded.version, snap.version);
        assert_eq!(loaded.tasks.len(), 2);
    }
}
