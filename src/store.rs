//! Task store
//!
//! Loads task definitions from a run directory (`tasks/*.yaml`, one document
//! per task), validates them with aggregated errors, and owns every mutable
//! execution record. State transitions go through [`TaskStore::transition`],
//! which enforces the state machine, mirrors each change into the audit log,
//! and persists the record atomically under the per-task state directory.
//!
//! The state directory is guarded by an advisory file lock so two runs never
//! share it; readers of persisted records see atomic-replace semantics.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use fs2::FileExt;
use walkdir::WalkDir;

use crate::audit::{AuditLog, EntryKind};
use crate::task::{ExecutionRecord, RecordedError, StateError, TaskSpec, TaskState};
use crate::types::TaskId;

// ============================================================================
// LOAD ERRORS
// ============================================================================

/// One violation found while loading task definitions
#[derive(Debug, Clone)]
pub enum LoadViolation {
    MissingTasksDir { dir: String },
    Parse { file: String, message: String },
    BadInitialState { task_id: TaskId, state: TaskState },
}

impl std::fmt::Display for LoadViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadViolation::MissingTasksDir { dir } => {
                write!(f, "tasks directory not found: {dir}")
            }
            LoadViolation::Parse { file, message } => write!(f, "{file}: {message}"),
            LoadViolation::BadInitialState { task_id, state } => {
                write!(f, "task '{task_id}' declares initial state '{state}' (must be 'declared')")
            }
        }
    }
}

/// Aggregated load failure; any violation fails the entire run load
#[derive(Debug)]
pub struct LoadError {
    pub violations: Vec<LoadViolation>,
}

impl std::error::Error for LoadError {}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Task definitions are invalid ({} violations):",
            self.violations.len()
        )?;
        for v in &self.violations {
            writeln!(f, "  - {v}")?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("State directory IO failure at {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("State directory {path} is locked by another run")]
    Locked { path: String },
}

// ============================================================================
// LOADING
// ============================================================================

/// Load and validate every task definition under `<run_dir>/tasks/`
pub fn load_task_specs(run_dir: &Path) -> Result<Vec<TaskSpec>, LoadError> {
    let tasks_dir = run_dir.join("tasks");
    if !tasks_dir.is_dir() {
        return Err(LoadError {
            violations: vec![LoadViolation::MissingTasksDir {
                dir: tasks_dir.display().to_string(),
            }],
        });
    }

    let mut specs = Vec::new();
    let mut violations = Vec::new();

    for entry in WalkDir::new(&tasks_dir)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
    {
        let path = entry.path();
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e == "yaml" || e == "yml")
            .unwrap_or(false);
        if !entry.file_type().is_file() || !is_yaml {
            continue;
        }

        let display = path
            .strip_prefix(run_dir)
            .unwrap_or(path)
            .display()
            .to_string();

        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) => {
                violations.push(LoadViolation::Parse {
                    file: display,
                    message: e.to_string(),
                });
                continue;
            }
        };

        match serde_yaml::from_str::<TaskSpec>(&raw) {
            Ok(spec) => {
                if spec.state != TaskState::Declared {
                    violations.push(LoadViolation::BadInitialState {
                        task_id: spec.id.clone(),
                        state: spec.state,
                    });
                } else {
                    specs.push(spec);
                }
            }
            Err(e) => violations.push(LoadViolation::Parse {
                file: display,
                message: e.to_string(),
            }),
        }
    }

    if violations.is_empty() {
        Ok(specs)
    } else {
        Err(LoadError { violations })
    }
}

// ============================================================================
// TASK STORE
// ============================================================================

/// Owner of task definitions and execution records
pub struct TaskStore {
    specs: HashMap<TaskId, Arc<TaskSpec>>,
    records: DashMap<TaskId, ExecutionRecord>,
    state_root: Option<PathBuf>,
    audit: AuditLog,
    /// Advisory lock held for the store's lifetime
    _lock: Option<File>,
}

impl TaskStore {
    /// In-memory store (tests, validate-only)
    pub fn in_memory(specs: Vec<TaskSpec>, audit: AuditLog) -> Self {
        let records = DashMap::new();
        for spec in &specs {
            records.insert(spec.id.clone(), ExecutionRecord::default());
        }
        Self {
            specs: specs
                .into_iter()
                .map(|s| (s.id.clone(), Arc::new(s)))
                .collect(),
            records,
            state_root: None,
            audit,
            _lock: None,
        }
    }

    /// Store persisting under `state_root`, guarded by an advisory lock
    pub fn open(
        specs: Vec<TaskSpec>,
        state_root: &Path,
        audit: AuditLog,
    ) -> Result<Self, StoreError> {
        std::fs::create_dir_all(state_root).map_err(|source| StoreError::Io {
            path: state_root.display().to_string(),
            source,
        })?;

        let lock_path = state_root.join(".lock");
        let lock = File::create(&lock_path).map_err(|source| StoreError::Io {
            path: lock_path.display().to_string(),
            source,
        })?;
        lock.try_lock_exclusive().map_err(|_| StoreError::Locked {
            path: state_root.display().to_string(),
        })?;

        let mut store = Self::in_memory(specs, audit);
        store.state_root = Some(state_root.to_path_buf());
        store._lock = Some(lock);

        // Resume: pick up previously persisted records where present.
        let task_ids: Vec<TaskId> = store.specs.keys().cloned().collect();
        for task_id in task_ids {
            let Some(path) = store.record_path(&task_id) else {
                continue;
            };
            if let Ok(raw) = std::fs::read_to_string(&path) {
                if let Ok(persisted) = serde_json::from_str::<ExecutionRecord>(&raw) {
                    store.records.insert(task_id, persisted);
                }
            }
        }

        Ok(store)
    }

    fn record_path(&self, task_id: &TaskId) -> Option<PathBuf> {
        self.state_root
            .as_ref()
            .map(|root| root.join(task_id.as_str()).join("record.json"))
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn spec(&self, task_id: &TaskId) -> Option<Arc<TaskSpec>> {
        self.specs.get(task_id).cloned()
    }

    pub fn specs(&self) -> impl Iterator<Item = &Arc<TaskSpec>> {
        self.specs.values()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Snapshot of one execution record
    pub fn record(&self, task_id: &TaskId) -> Option<ExecutionRecord> {
        self.records.get(task_id).map(|r| r.clone())
    }

    pub fn state(&self, task_id: &TaskId) -> Option<TaskState> {
        self.records.get(task_id).map(|r| r.state)
    }

    /// Count of tasks per terminal disposition
    pub fn terminal_counts(&self) -> (usize, usize, usize) {
        let mut done = 0;
        let mut failed = 0;
        let mut cancelled = 0;
        for record in self.records.iter() {
            match record.state {
                TaskState::Done => done += 1,
                TaskState::Failed => failed += 1,
                TaskState::Cancelled => cancelled += 1,
                _ => {}
            }
        }
        (done, failed, cancelled)
    }

    pub fn all_terminal(&self) -> bool {
        self.records.iter().all(|r| r.state.is_terminal())
    }

    // ------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------

    /// Apply one state transition; illegal moves are refused
    pub fn transition(&self, task_id: &TaskId, to: TaskState) -> Result<(), StateError> {
        let mut record = match self.records.get_mut(task_id) {
            Some(record) => record,
            None => {
                return Err(StateError {
                    task_id: task_id.clone(),
                    from: TaskState::Declared,
                    to,
                })
            }
        };

        let from = record.state;
        if !from.can_transition(to) {
            return Err(StateError {
                task_id: task_id.clone(),
                from,
                to,
            });
        }

        record.state = to;
        match to {
            TaskState::Running => {
                record.attempts += 1;
                record.started_at = Some(Utc::now());
            }
            state if state.is_terminal() => {
                record.finished_at = Some(Utc::now());
            }
            _ => {}
        }

        let attempt = record.attempts;
        let snapshot = record.clone();
        drop(record);

        self.audit.record(EntryKind::StateChanged {
            task_id: Arc::from(task_id.as_str()),
            from,
            to,
            attempt,
        });
        tracing::info!(task_id = %task_id, %from, %to, attempt, "state transition");
        self.persist(task_id, &snapshot);
        Ok(())
    }

    /// Mutate non-state fields of a record and persist
    pub fn update<F: FnOnce(&mut ExecutionRecord)>(&self, task_id: &TaskId, mutate: F) {
        if let Some(mut record) = self.records.get_mut(task_id) {
            mutate(&mut record);
            let snapshot = record.clone();
            drop(record);
            self.persist(task_id, &snapshot);
        }
    }

    /// Record an error on a task and mirror it into the audit log
    pub fn record_error(&self, task_id: &TaskId, error: RecordedError) {
        self.audit.record(EntryKind::TaskErrored {
            task_id: Arc::from(task_id.as_str()),
            code: error.code,
            message: error.message.clone(),
        });
        self.update(task_id, |record| record.last_error = Some(error));
    }

    fn persist(&self, task_id: &TaskId, record: &ExecutionRecord) {
        let Some(path) = self.record_path(task_id) else {
            return;
        };
        let Some(dir) = path.parent() else { return };
        if let Err(e) = std::fs::create_dir_all(dir) {
            tracing::warn!(task_id = %task_id, error = %e, "state dir unavailable");
            return;
        }
        let Ok(raw) = serde_json::to_string_pretty(record) else {
            return;
        };
        // Atomic replace so concurrent readers never see a torn record.
        let tmp = dir.join(".record.tmp");
        let result = std::fs::write(&tmp, raw).and_then(|()| std::fs::rename(&tmp, &path));
        if let Err(e) = result {
            tracing::warn!(task_id = %task_id, error = %e, "record persist failed");
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
