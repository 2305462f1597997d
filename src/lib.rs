//! # Maestro Engine Library
//!
//! Workflow engine for multi-agent task orchestration with a
//! human-in-the-loop review gate.
//!
//! ## Overview
//!
//! Maestro consumes declarative task definitions (one YAML document per
//! task), compiles them into a dependency DAG, and drives every task through
//! a closed state machine across role-specialized executors:
//!
//! - **Loading & validation**: typed task specs, aggregated errors
//! - **Graph**: cycle/missing-dependency detection, critical path
//! - **Scheduling**: bounded worker pool, per-role caps, retry with backoff,
//!   cooperative cancellation, hard timeouts
//! - **Memory**: encrypted content-addressed context store with domain-scoped
//!   vector retrieval
//! - **HITL**: risk-scored review queue with an escalation ladder
//! - **Artifacts**: atomic writes with sha256 verification
//! - **Metrics**: versioned read-only snapshots
//!
//! ## State machine
//!
//! ```text
//! DECLARED -> READY -> RUNNING -> {QA_PENDING | FAILED}
//! QA_PENDING -> {HITL_PENDING | DONE | NEEDS_REWORK}
//! HITL_PENDING -> {DONE | NEEDS_REWORK | ESCALATED | REJECTED}
//! ESCALATED -> {DONE | REJECTED}          REJECTED -> FAILED
//! NEEDS_REWORK -> READY (capped)          FAILED -> READY (retry, capped)
//! any non-terminal -> CANCELLED
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use maestro::config::EngineConfig;
//!
//! # async fn run() -> Result<(), maestro::error::EngineError> {
//! let run_dir = std::path::Path::new("./my-run");
//! let state_dir = run_dir.join("state");
//! let config = EngineConfig::load(run_dir)?;
//!
//! let scheduler = maestro::engine::bootstrap(run_dir, &state_dir, config)?;
//! let outcome = scheduler.run().await?;
//! println!("done={} failed={}", outcome.done, outcome.failed);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`task`] | Task specs, execution records, state machine |
//! | [`store`] | Definition loading, record persistence, advisory lock |
//! | [`graph`] | DAG build, validation, critical path |
//! | [`schedule`] | Event loop, ready queue, retry, cancellation |
//! | [`dispatch`] | Role/tool registries, prompt composition, shape checks |
//! | [`executor`] | Executor trait, mock and command implementations |
//! | [`memory`] | Encrypted store, PII, caches, vector index |
//! | [`hitl`] | Risk scoring, review queue, escalation ladder |
//! | [`artifact`] | Atomic artifact persistence with digests |
//! | [`metrics`] | Read-only snapshots for dashboards |
//! | [`audit`] | Append-only JSON-lines audit trail |

pub mod artifact;
pub mod audit;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod executor;
pub mod graph;
pub mod hitl;
pub mod memory;
pub mod metrics;
pub mod schedule;
pub mod store;
pub mod task;
pub mod types;

// Re-export the main surface
pub use artifact::{ArtifactWriter, WriteOutcome};
pub use audit::{AuditEntry, AuditLog, EntryKind};
pub use config::{EngineConfig, HitlConfig, MemoryConfig, RetryPolicy};
pub use dispatch::{Dispatcher, RoleRegistry, ToolRegistry};
pub use engine::{bootstrap, bootstrap_with_executor, validate_run_dir};
pub use error::{EngineError, ErrorCode, FixSuggestion};
pub use executor::{create_executor, ExecOutcome, ExecRequest, Executor, MockExecutor};
pub use graph::{GraphError, TaskGraph};
pub use hitl::{HitlEngine, ReviewDecision, ReviewVerdict};
pub use memory::{MemoryEngine, MemoryError};
pub use metrics::MetricsSnapshot;
pub use schedule::{RunOutcome, Scheduler};
pub use store::{load_task_specs, TaskStore};
pub use task::{ExecutionRecord, TaskSpec, TaskState};
pub use types::{Priority, RiskTier, RoleId, Sensitivity, TaskId};
