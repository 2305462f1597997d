//! Backing store for memory records
//!
//! One JSON document per record under `records/`, named by
//! `sha256(domain|key)`. Writes are atomic (temp + rename) and retried with
//! short exponential backoff when the filesystem misbehaves; records that
//! fail integrity checks are moved to `quarantine/`, never deleted.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::pii::PiiFlag;
use crate::types::Sensitivity;

/// Retry schedule for a flaky backend: 3 attempts, exponential 50-400ms
const RETRY_DELAYS: [Duration; 2] = [Duration::from_millis(50), Duration::from_millis(200)];

/// Storage tier assigned by the sweeper from access recency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Tier {
    #[default]
    Hot,
    Warm,
    Cold,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Hot => write!(f, "HOT"),
            Tier::Warm => write!(f, "WARM"),
            Tier::Cold => write!(f, "COLD"),
        }
    }
}

/// At-rest representation of one record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRecord {
    pub domain: String,
    pub key: String,
    pub sensitivity: Sensitivity,
    pub tier: Tier,
    /// base64(nonce || ciphertext) when encrypted, base64(plaintext) for PUBLIC
    pub payload: String,
    pub encrypted: bool,
    /// sha256 of the plaintext content
    pub digest: String,
    pub pii_flags: Vec<PiiFlag>,
    pub created_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    pub access_count: u64,
}

/// Content-address for a `(domain, key)` pair
pub fn record_id(domain: &str, key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(domain.as_bytes());
    hasher.update(b"|");
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// sha256 hex of plaintext content
pub fn content_digest(content: &str) -> String {
    format!("{:x}", Sha256::digest(content.as_bytes()))
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Backend unavailable after {attempts} attempts: {last}")]
    Unavailable { attempts: u32, last: String },
    #[error("Corrupt record file {record_id}: {reason}")]
    Corrupt { record_id: String, reason: String },
}

/// Filesystem-backed record store
pub struct BackingStore {
    records_dir: PathBuf,
    quarantine_dir: PathBuf,
}

impl BackingStore {
    pub fn open(root: &Path) -> std::io::Result<Self> {
        let records_dir = root.join("records");
        let quarantine_dir = root.join("quarantine");
        std::fs::create_dir_all(&records_dir)?;
        std::fs::create_dir_all(&quarantine_dir)?;
        Ok(Self {
            records_dir,
            quarantine_dir,
        })
    }

    fn path_for(&self, record_id: &str) -> PathBuf {
        self.records_dir.join(format!("{record_id}.json"))
    }

    fn with_retry<T>(
        &self,
        mut op: impl FnMut() -> std::io::Result<T>,
    ) -> Result<T, BackendError> {
        let mut last = None;
        for (attempt, delay) in std::iter::once(None)
            .chain(RETRY_DELAYS.iter().copied().map(Some))
            .enumerate()
        {
            if let Some(delay) = delay {
                std::thread::sleep(delay);
            }
            match op() {
                Ok(value) => return Ok(value),
                Err(e) => {
                    tracing::debug!(attempt = attempt + 1, error = %e, "backend op failed");
                    last = Some(e);
                }
            }
        }
        Err(BackendError::Unavailable {
            attempts: RETRY_DELAYS.len() as u32 + 1,
            last: last.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    /// Atomically persist one record; the caller's `put` is not acknowledged
    /// until this returns
    pub fn commit(&self, id: &str, record: &StoredRecord) -> Result<(), BackendError> {
        let serialized =
            serde_json::to_string_pretty(record).map_err(|e| BackendError::Corrupt {
                record_id: id.to_string(),
                reason: e.to_string(),
            })?;
        let target = self.path_for(id);
        let tmp = self.records_dir.join(format!(".tmp-{id}"));
        self.with_retry(|| {
            std::fs::write(&tmp, &serialized)?;
            std::fs::rename(&tmp, &target)
        })
    }

    /// Load one record; Ok(None) when absent
    pub fn load(&self, id: &str) -> Result<Option<StoredRecord>, BackendError> {
        let path = self.path_for(id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = self.with_retry(|| std::fs::read_to_string(&path))?;
        let record = serde_json::from_str(&raw).map_err(|e| BackendError::Corrupt {
            record_id: id.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Some(record))
    }

    /// Parse a raw at-rest payload (used when serving from the L2 cache)
    pub fn parse(raw: &str) -> Option<StoredRecord> {
        serde_json::from_str(raw).ok()
    }

    /// Serialize a record to its at-rest form (used to fill the L2 cache)
    pub fn serialize(record: &StoredRecord) -> Option<String> {
        serde_json::to_string(record).ok()
    }

    /// Irreversibly remove one record
    pub fn remove(&self, id: &str) -> Result<(), BackendError> {
        let path = self.path_for(id);
        if !path.exists() {
            return Ok(());
        }
        self.with_retry(|| std::fs::remove_file(&path))
    }

    /// Move a record that failed integrity checks into quarantine
    pub fn quarantine(&self, id: &str) {
        let from = self.path_for(id);
        let to = self.quarantine_dir.join(format!("{id}.json"));
        if let Err(e) = std::fs::rename(&from, &to) {
            tracing::warn!(record_id = id, error = %e, "quarantine move failed");
        } else {
            tracing::warn!(record_id = id, "record quarantined");
        }
    }

    /// Iterate all persisted records (index rebuild, tier sweeps)
    pub fn scan(&self) -> Vec<(String, StoredRecord)> {
        let Ok(entries) = std::fs::read_dir(&self.records_dir) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if name.starts_with(".tmp-") {
                continue;
            }
            if let Ok(raw) = std::fs::read_to_string(&path) {
                if let Ok(record) = serde_json::from_str::<StoredRecord>(&raw) {
                    out.push((name.to_string(), record));
                }
            }
        }
        out
    }
}

// ============================================================================
// TESTS
// ============================================================================
