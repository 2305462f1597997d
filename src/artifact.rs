//! Artifact persistence with atomic swap
//!
//! Outputs land in a per-task directory via temp file + fsync + rename; the
//! sha256 digest is computed from the renamed file and recorded. Reads verify
//! the digest and refuse mismatches. Path rules fail closed: relative paths
//! only, inside the task directory, no `..` components.
//!
//! A per-task write lease keeps concurrent writers out of one task's output
//! directory; the lease releases on drop.

use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::task::ProducedArtifact;
use crate::types::TaskId;

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("Unsafe artifact path '{path}': {reason}")]
    PathViolation { path: String, reason: String },

    #[error("IO error writing artifact '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Integrity error for artifact '{path}': stored digest {expected}, found {actual}")]
    Integrity {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("Write lease for task '{task_id}' is held by worker {holder}")]
    LeaseHeld { task_id: TaskId, holder: String },

    #[error("Artifact not found: {task_id}/{path}")]
    NotFound { task_id: TaskId, path: String },
}

impl ArtifactError {
    pub fn code(&self) -> crate::error::ErrorCode {
        match self {
            ArtifactError::PathViolation { .. } => crate::error::ErrorCode::Validation,
            ArtifactError::Io { .. } => crate::error::ErrorCode::Io,
            ArtifactError::Integrity { .. } => crate::error::ErrorCode::Integrity,
            ArtifactError::LeaseHeld { .. } => crate::error::ErrorCode::Io,
            ArtifactError::NotFound { .. } => crate::error::ErrorCode::Io,
        }
    }
}

// ============================================================================
// PATH RULES
// ============================================================================

/// Reject absolute paths, parent traversal, and empty paths
pub fn validate_relative_path(raw: &str) -> Result<PathBuf, ArtifactError> {
    if raw.is_empty() {
        return Err(ArtifactError::PathViolation {
            path: raw.to_string(),
            reason: "empty path".to_string(),
        });
    }
    let path = Path::new(raw);
    if path.is_absolute() {
        return Err(ArtifactError::PathViolation {
            path: raw.to_string(),
            reason: "absolute paths are not allowed".to_string(),
        });
    }
    for component in path.components() {
        match component {
            Component::Normal(_) => {}
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(ArtifactError::PathViolation {
                    path: raw.to_string(),
                    reason: "'..' components are not allowed".to_string(),
                })
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(ArtifactError::PathViolation {
                    path: raw.to_string(),
                    reason: "path escapes the task directory".to_string(),
                })
            }
        }
    }
    Ok(path.to_path_buf())
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// WRITE LEASE
// ============================================================================

/// Exclusive write permission for one task's output directory.
/// Released on drop.
pub struct WriteLease {
    task_id: TaskId,
    worker: String,
    leases: Arc<DashMap<TaskId, String>>,
}

impl WriteLease {
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn worker(&self) -> &str {
        &self.worker
    }
}

impl Drop for WriteLease {
    fn drop(&mut self) {
        self.leases
            .remove_if(&self.task_id, |_, holder| holder == &self.worker);
    }
}

// ============================================================================
// OUTCOME
// ============================================================================

/// Result of a write: the record, and whether an identical artifact was
/// already recorded (digest-based idempotence)
#[derive(Debug, Clone)]
pub struct WriteOutcome {
    pub record: ProducedArtifact,
    pub deduplicated: bool,
}

// ============================================================================
// ARTIFACT WRITER
// ============================================================================

/// Persists task outputs and QA reports under `<root>/<task_id>/artifacts/`
pub struct ArtifactWriter {
    root: PathBuf,
    records: DashMap<(TaskId, String), ProducedArtifact>,
    leases: Arc<DashMap<TaskId, String>>,
}

impl ArtifactWriter {
    pub fn new(state_root: &Path) -> Self {
        Self {
            root: state_root.to_path_buf(),
            records: DashMap::new(),
            leases: Arc::new(DashMap::new()),
        }
    }

    /// Acquire the write lease for a task; a second concurrent caller is
    /// rejected with `LeaseHeld`
    pub fn acquire(&self, task_id: &TaskId, worker: &str) -> Result<WriteLease, ArtifactError> {
        use dashmap::mapref::entry::Entry;
        match self.leases.entry(task_id.clone()) {
            Entry::Occupied(slot) => Err(ArtifactError::LeaseHeld {
                task_id: task_id.clone(),
                holder: slot.get().clone(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(worker.to_string());
                Ok(WriteLease {
                    task_id: task_id.clone(),
                    worker: worker.to_string(),
                    leases: Arc::clone(&self.leases),
                })
            }
        }
    }

    fn task_dir(&self, task_id: &TaskId) -> PathBuf {
        self.root.join(task_id.as_str()).join("artifacts")
    }

    /// Write one artifact atomically and record its digest
    pub fn write(
        &self,
        lease: &WriteLease,
        relative_path: &str,
        bytes: &[u8],
    ) -> Result<WriteOutcome, ArtifactError> {
        let rel = validate_relative_path(relative_path)?;
        let digest = sha256_hex(bytes);
        let key = (lease.task_id().clone(), relative_path.to_string());

        // Idempotent re-run: identical digest means no new record.
        if let Some(existing) = self.records.get(&key) {
            if existing.sha256 == digest {
                return Ok(WriteOutcome {
                    record: existing.clone(),
                    deduplicated: true,
                });
            }
        }

        let dir = self.task_dir(lease.task_id());
        let target = dir.join(&rel);
        let parent = target.parent().unwrap_or(&dir).to_path_buf();
        std::fs::create_dir_all(&parent).map_err(|source| ArtifactError::Io {
            path: relative_path.to_string(),
            source,
        })?;

        let tmp = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let io_err = |source| ArtifactError::Io {
            path: relative_path.to_string(),
            source,
        };

        let mut file = std::fs::File::create(&tmp).map_err(io_err)?;
        file.write_all(bytes).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        drop(file);

        if let Err(source) = std::fs::rename(&tmp, &target) {
            let _ = std::fs::remove_file(&tmp);
            return Err(ArtifactError::Io {
                path: relative_path.to_string(),
                source,
            });
        }

        // Digest is recorded from the renamed file, not the buffer we held.
        let on_disk = std::fs::read(&target).map_err(io_err)?;
        let recorded = sha256_hex(&on_disk);

        let record = ProducedArtifact {
            relative_path: relative_path.to_string(),
            sha256: recorded,
            len: on_disk.len() as u64,
            written_at: Utc::now(),
        };
        self.records.insert(key, record.clone());
        Ok(WriteOutcome {
            record,
            deduplicated: false,
        })
    }

    /// Read an artifact back, verifying its recorded digest
    pub fn read(&self, task_id: &TaskId, relative_path: &str) -> Result<Vec<u8>, ArtifactError> {
        let rel = validate_relative_path(relative_path)?;
        let key = (task_id.clone(), relative_path.to_string());
        let record = self
            .records
            .get(&key)
            .map(|r| r.clone())
            .ok_or_else(|| ArtifactError::NotFound {
                task_id: task_id.clone(),
                path: relative_path.to_string(),
            })?;

        let target = self.task_dir(task_id).join(&rel);
        let bytes = std::fs::read(&target).map_err(|_| ArtifactError::NotFound {
            task_id: task_id.clone(),
            path: relative_path.to_string(),
        })?;

        let actual = sha256_hex(&bytes);
        if actual != record.sha256 {
            return Err(ArtifactError::Integrity {
                path: relative_path.to_string(),
                expected: record.sha256,
                actual,
            });
        }
        Ok(bytes)
    }

    /// Records for one task, in write order
    pub fn records_for(&self, task_id: &TaskId) -> Vec<ProducedArtifact> {
        let mut out: Vec<ProducedArtifact> = self
            .records
            .iter()
            .filter(|entry| &entry.key().0 == task_id)
            .map(|entry| entry.value().clone())
            .collect();
        out.sort_by(|a, b| a.written_at.cmp(&b.written_at));
        out
    }
}

// ============================================================================
// TESTS
// ============================================================================
