//! Append-only audit trail for task runs
//!
//! - Entry: envelope with seq + monotonic offset + wall-clock stamp + kind
//! - EntryKind: run, task, review, and tool-call events
//! - AuditLog: thread-safe in-memory log with JSON-lines persistence
//!
//! The sequence number is strictly monotonic across the run; per-task entries
//! mirror state transitions one-to-one, which the test suite counts on.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;
use crate::task::TaskState;
use crate::types::TaskId;

/// Single entry in the run audit log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Monotonic sequence number (for ordering)
    pub seq: u64,
    /// Milliseconds since run start (monotonic clock)
    pub offset_ms: u64,
    /// Wall-clock stamp, recorded for operators, never used for ordering
    pub at: DateTime<Utc>,
    /// Event type and data
    pub kind: EntryKind,
}

/// All audit event types
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryKind {
    // ═══════════════════════════════════════════
    // RUN LEVEL
    // ═══════════════════════════════════════════
    RunStarted {
        task_count: usize,
    },
    RunFinished {
        done: usize,
        failed: usize,
        cancelled: usize,
    },

    // ═══════════════════════════════════════════
    // TASK LEVEL
    // ═══════════════════════════════════════════
    StateChanged {
        task_id: Arc<str>,
        from: TaskState,
        to: TaskState,
        attempt: u32,
    },
    TaskErrored {
        task_id: Arc<str>,
        code: ErrorCode,
        message: String,
    },
    ArtifactWritten {
        task_id: Arc<str>,
        relative_path: String,
        sha256: String,
    },

    // ═══════════════════════════════════════════
    // REVIEW LEVEL
    // ═══════════════════════════════════════════
    ReviewOpened {
        task_id: Arc<str>,
        score: u32,
        factors: Vec<String>,
    },
    ReviewDecided {
        task_id: Arc<str>,
        reviewer: String,
        verdict: String,
    },
    ReviewEscalated {
        task_id: Arc<str>,
        level: u32,
    },

    // ═══════════════════════════════════════════
    // TOOL LEVEL
    // ═══════════════════════════════════════════
    ToolCalled {
        task_id: Arc<str>,
        tool: String,
        arguments_hash: String,
        duration_ms: u64,
        outcome: String,
    },
}

impl EntryKind {
    /// Extract task_id if the entry is task-scoped
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::StateChanged { task_id, .. }
            | Self::TaskErrored { task_id, .. }
            | Self::ArtifactWritten { task_id, .. }
            | Self::ReviewOpened { task_id, .. }
            | Self::ReviewDecided { task_id, .. }
            | Self::ReviewEscalated { task_id, .. }
            | Self::ToolCalled { task_id, .. } => Some(task_id),
            Self::RunStarted { .. } | Self::RunFinished { .. } => None,
        }
    }
}

/// Thread-safe, append-only audit log
///
/// Entries live in memory for snapshot queries and are mirrored to
/// `audit.jsonl` files under each task's state directory when a sink is
/// attached.
#[derive(Clone)]
pub struct AuditLog {
    entries: Arc<RwLock<Vec<AuditEntry>>>,
    start: Instant,
    next_seq: Arc<AtomicU64>,
    /// Root of the per-task state directories; None keeps the log in memory
    sink_root: Option<PathBuf>,
}

impl AuditLog {
    /// In-memory log (tests, validate-only runs)
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(Vec::new())),
            start: Instant::now(),
            next_seq: Arc::new(AtomicU64::new(0)),
            sink_root: None,
        }
    }

    /// Log mirrored to `<state_root>/<task_id>/audit.jsonl`
    pub fn with_sink(state_root: &Path) -> Self {
        Self {
            sink_root: Some(state_root.to_path_buf()),
            ..Self::new()
        }
    }

    /// Append an entry (thread-safe, returns sequence number)
    pub fn record(&self, kind: EntryKind) -> u64 {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let entry = AuditEntry {
            seq,
            offset_ms: self.start.elapsed().as_millis() as u64,
            at: Utc::now(),
            kind,
        };

        self.persist(&entry);
        self.entries.write().push(entry);
        seq
    }

    fn persist(&self, entry: &AuditEntry) {
        let Some(ref root) = self.sink_root else {
            return;
        };
        let Some(task_id) = entry.kind.task_id() else {
            return;
        };
        let dir = root.join(task_id);
        if let Err(e) = std::fs::create_dir_all(&dir) {
            tracing::warn!(task_id, error = %e, "audit sink directory unavailable");
            return;
        }
        let line = match serde_json::to_string(entry) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(task_id, error = %e, "audit entry not serializable");
                return;
            }
        };
        use std::io::Write;
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("audit.jsonl"))
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(e) = result {
            tracing::warn!(task_id, error = %e, "audit append failed");
        }
    }

    /// Snapshot of all entries
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.read().clone()
    }

    /// Entries scoped to one task, in sequence order
    pub fn entries_for(&self, task_id: &TaskId) -> Vec<AuditEntry> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.kind.task_id() == Some(task_id.as_str()))
            .cloned()
            .collect()
    }

    /// Count of state transitions recorded for one task
    pub fn transition_count(&self, task_id: &TaskId) -> usize {
        self.entries
            .read()
            .iter()
            .filter(|e| {
                matches!(&e.kind, EntryKind::StateChanged { task_id: t, .. } if t.as_ref() == task_id.as_str())
            })
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn tid(s: &str) -> Arc<str> {
        Arc::from(s)
    }

    #[test]
    fn test_sequence_is_monotonic() {
        let log = AuditLog::new();
        for _ in 0..10 {
            log.record(EntryKind::RunStarted { task_count: 1 });
        }
        let entries = log.entries();
        for pair in entries.windows(2) {
            assert!(pair[0].seq < pair[1].seq);
            assert!(pair[0].offset_ms <= pair[1].offset_ms);
        }
    }

    #[test]
    fn test_entries_for_filters_by_task() {
        let log = AuditLog::new();
        log.record(EntryKind::StateChanged {
            task_id: tid("A"),
            from: TaskState::Declared,
            to: TaskState::Ready,
            attempt: 0,
        });
        log.record(EntryKind::StateChanged {
            task_id: tid("B"),
            from: TaskState::Declared,
            to: TaskState::Ready,
            attempt: 0,
        });
        log.record(EntryKind::RunStarted { task_count: 2 });

        let a = TaskId::new("A").unwrap();
        assert_eq!(log.entries_for(&a).len(), 1);
        assert_eq!(log.transition_count(&a), 1);
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn test_jsonl_sink_appends_per_task() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::with_sink(dir.path());
        log.record(EntryKind::StateChanged {
            task_id: tid("T-1"),
            from: TaskState::Ready,
            to: TaskState::Running,
            attempt: 1,
        });
        log.record(EntryKind::StateChanged {
            task_id: tid("T-1"),
            from: TaskState::Running,
            to: TaskState::QaPending,
            attempt: 1,
        });

        let raw = std::fs::read_to_string(dir.path().join("T-1/audit.jsonl")).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: AuditEntry = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.seq, 0);
    }

    #[test]
    fn test_run_level_entries_not_mirrored() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::with_sink(dir.path());
        log.record(EntryKind::RunStarted { task_count: 0 });
        // No task directory should exist
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_tool_call_entry_round_trip() {
        let entry = EntryKind::ToolCalled {
            task_id: tid("BE-1"),
            tool: "test_run".into(),
            arguments_hash: "ab12".into(),
            duration_ms: 40,
            outcome: "ok".into(),
        };
        let json = serde_json::to_string(&entry).unwrap();
        let back: EntryKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
        assert_eq!(back.task_id(), Some("BE-1"));
    }
}
