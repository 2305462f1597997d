//! End-to-end review gate scenarios
//!
//! High-risk tasks route through the HITL queue; decisions arrive through
//! the state directory's `decisions/` drop-box exactly as an operator (or
//! the dashboard's backend) would deliver them.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use maestro::config::{EngineConfig, HitlConfig, RetryPolicy};
use maestro::executor::{Executor, MockExecutor};
use maestro::hitl::{ReviewDecision, ReviewVerdict};
use maestro::task::TaskState;
use maestro::types::TaskId;

fn write_task(run_dir: &Path, file: &str, yaml: &str) {
    let tasks = run_dir.join("tasks");
    std::fs::create_dir_all(&tasks).unwrap();
    std::fs::write(tasks.join(file), yaml).unwrap();
}

fn config(standard_ms: u64, escalated_ms: u64) -> EngineConfig {
    EngineConfig {
        hitl: HitlConfig {
            standard_sla: Duration::from_millis(standard_ms),
            escalated_sla: Duration::from_millis(escalated_ms),
            ..HitlConfig::default()
        },
        retry: RetryPolicy {
            max_attempts: 2,
            backoff_base: Duration::from_millis(5),
            backoff_factor: 2,
            jitter: 0.0,
        },
        ..EngineConfig::testing()
    }
}

fn scheduler(
    run_dir: &Path,
    state_dir: &Path,
    config: EngineConfig,
) -> (Arc<maestro::Scheduler>, Arc<MockExecutor>) {
    let mock = Arc::new(MockExecutor::new());
    let scheduler = maestro::bootstrap_with_executor(
        run_dir,
        state_dir,
        config,
        Arc::clone(&mock) as Arc<dyn Executor>,
    )
    .unwrap();
    (Arc::new(scheduler), mock)
}

fn drop_decision(state_dir: &Path, task: &str, verdict: ReviewVerdict, notes: Option<&str>) {
    let decision = ReviewDecision {
        task_id: TaskId::new(task).unwrap(),
        reviewer: "reviewer-7".into(),
        verdict,
        notes: notes.map(String::from),
        timestamp: chrono::Utc::now(),
    };
    let dir = state_dir.join("decisions");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join(format!("{task}.jsonl")),
        format!("{}\n", serde_json::to_string(&decision).unwrap()),
    )
    .unwrap();
}

const RISKY_TASK: &str = "id: W-1\ntitle: \"rotate keys\"\nowner: backend\npriority: HIGH\nriskTier: MED\ncontextTopics: [infrastructure]\n";

// ============================================================================
// SCENARIO 5: ESCALATION EXHAUSTION
// ============================================================================

#[tokio::test]
async fn unanswered_escalated_review_exhausts_ladder_and_fails() {
    let run = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    // HIGH tier (5) + production (+4) = 9 -> ESCALATED on entry
    write_task(
        run.path(),
        "w.yaml",
        "id: W-1\ntitle: \"drop prod table\"\nowner: backend\npriority: HIGH\nriskTier: HIGH\ncontextTopics: [production]\n",
    );

    let (scheduler, _mock) = scheduler(run.path(), state.path(), config(30, 15));
    let outcome = scheduler.run().await.unwrap();

    assert_eq!(outcome.failed, 1);
    let record = scheduler.store().record(&TaskId::new("W-1").unwrap()).unwrap();
    assert_eq!(record.state, TaskState::Failed);
    assert_eq!(
        record.last_error.unwrap().code,
        maestro::ErrorCode::HitlEscalationExhausted
    );
    assert_eq!(record.hitl_verdict.as_deref(), Some("escalation_exhausted"));

    // The review item entered ESCALATED, was promoted twice, then rejected
    let item = scheduler.hitl().item(&TaskId::new("W-1").unwrap()).unwrap();
    assert_eq!(item.state, maestro::hitl::ReviewState::Rejected);
    assert_eq!(item.promotions, 2);
    assert_eq!(item.ladder_position(), "incident_channel");
}

// ============================================================================
// DECISION INGESTION
// ============================================================================

#[tokio::test]
async fn approve_decision_completes_the_task() {
    let run = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    // MED (2) + infrastructure (+3) = 5 -> AWAITING_HUMAN
    write_task(run.path(), "w.yaml", RISKY_TASK);

    let (scheduler, _mock) = scheduler(run.path(), state.path(), config(10_000, 10_000));
    let handle = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.run().await })
    };

    // Wait for the task to reach the review gate, then approve it
    let task_id = TaskId::new("W-1").unwrap();
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if scheduler.store().state(&task_id) == Some(TaskState::HitlPending) {
            break;
        }
    }
    assert_eq!(scheduler.store().state(&task_id), Some(TaskState::HitlPending));
    drop_decision(state.path(), "W-1", ReviewVerdict::Approve, None);

    let outcome = handle.await.unwrap().unwrap();
    assert_eq!(outcome.done, 1);
    let record = scheduler.store().record(&task_id).unwrap();
    assert_eq!(record.state, TaskState::Done);
    assert_eq!(record.hitl_verdict.as_deref(), Some("approved"));
}

#[tokio::test]
async fn reject_decision_fails_the_task() {
    let run = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    write_task(run.path(), "w.yaml", RISKY_TASK);

    let (scheduler, _mock) = scheduler(run.path(), state.path(), config(10_000, 10_000));
    let handle = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.run().await })
    };

    let task_id = TaskId::new("W-1").unwrap();
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if scheduler.store().state(&task_id) == Some(TaskState::HitlPending) {
            break;
        }
    }
    drop_decision(state.path(), "W-1", ReviewVerdict::Reject, None);

    let outcome = handle.await.unwrap().unwrap();
    assert_eq!(outcome.failed, 1);
    let record = scheduler.store().record(&task_id).unwrap();
    assert_eq!(record.state, TaskState::Failed);
    assert_eq!(record.last_error.unwrap().code, maestro::ErrorCode::HitlRejected);
}

#[tokio::test]
async fn rework_decision_reruns_and_second_review_approves() {
    let run = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    write_task(run.path(), "w.yaml", RISKY_TASK);

    let (scheduler, mock) = scheduler(run.path(), state.path(), config(10_000, 10_000));
    let handle = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.run().await })
    };

    let task_id = TaskId::new("W-1").unwrap();
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if scheduler.store().state(&task_id) == Some(TaskState::HitlPending) {
            break;
        }
    }
    drop_decision(
        state.path(),
        "W-1",
        ReviewVerdict::Rework,
        Some("tighten the rollback plan"),
    );

    // Second attempt lands back in review; approve it this time
    for _ in 0..200 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let attempts = scheduler
            .store()
            .record(&task_id)
            .map(|r| r.attempts)
            .unwrap_or(0);
        if attempts >= 2 && scheduler.store().state(&task_id) == Some(TaskState::HitlPending) {
            break;
        }
    }
    drop_decision(state.path(), "W-1", ReviewVerdict::Approve, None);

    let outcome = handle.await.unwrap().unwrap();
    assert_eq!(outcome.done, 1);
    let record = scheduler.store().record(&task_id).unwrap();
    assert_eq!(record.attempts, 2);
    assert_eq!(mock.invocations("W-1"), 2);
}

// ============================================================================
// METRICS VISIBILITY
// ============================================================================

#[tokio::test]
async fn open_reviews_appear_in_status_snapshot() {
    let run = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    write_task(run.path(), "w.yaml", RISKY_TASK);

    let (scheduler, _mock) = scheduler(run.path(), state.path(), config(10_000, 10_000));
    let handle = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.run().await })
    };

    let task_id = TaskId::new("W-1").unwrap();
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if scheduler.store().state(&task_id) == Some(TaskState::HitlPending) {
            break;
        }
    }

    let snapshot = scheduler.status();
    assert_eq!(snapshot.global.active_reviews, 1);
    let task = snapshot.tasks.iter().find(|t| t.id == "W-1").unwrap();
    assert_eq!(task.hitl_state.as_deref(), Some("AWAITING_HUMAN"));

    drop_decision(state.path(), "W-1", ReviewVerdict::Approve, None);
    handle.await.unwrap().unwrap();

    let snapshot = scheduler.status();
    assert_eq!(snapshot.global.active_reviews, 0);
}
