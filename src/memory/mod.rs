//! # Memory Engine
//!
//! Content-addressed context store with confidentiality and domain-scoped
//! retrieval.
//!
//! ## Overview
//!
//! | Piece | Module | Job |
//! |-------|--------|-----|
//! | Encryption | [`crypt`] | AES-256-GCM, master key derived once at init |
//! | PII | [`pii`] | regex scanner + custom validators, redaction |
//! | Caches | [`cache`] | L1 in-memory LRU, L2 on-disk LRU |
//! | Index | [`index`] | hashed bag-of-words vectors, cosine search |
//! | Backing store | [`store`] | atomic record files, retry, quarantine |
//!
//! ## Contract
//!
//! - `put(domain, key, content, sensitivity)` replaces atomically and is
//!   acknowledged only after the backing store commits. PUBLIC content with
//!   detectable PII is refused with `PII_VIOLATION`.
//! - `get(domain, key)` reads L1 -> L2 -> backing store. A store outage
//!   degrades to `NOT_FOUND` after bounded retry; corruption surfaces
//!   `INTEGRITY_ERROR` and quarantines the record.
//! - `search(domains, query, k)` ranks by cosine similarity, ties broken by
//!   recency then key.
//! - `purge(domain, key)` removes content, vector, and cache entries,
//!   irreversibly.
//!
//! Writers serialize per key via 64 stripe locks; readers work against
//! concurrent snapshots and never block on writers of other stripes.

pub mod cache;
pub mod crypt;
pub mod index;
pub mod pii;
pub mod store;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::MemoryConfig;
use crate::error::ErrorCode;
use crate::types::Sensitivity;
use cache::{L1Cache, L2Cache};
use crypt::{CryptError, MasterKey, Sealed};
use index::VectorIndex;
pub use index::SearchHit;
use pii::{CustomValidator, PiiFlag, PiiScanner};
pub use store::Tier;
use store::{content_digest, record_id, BackendError, BackingStore, StoredRecord};

/// Writer stripe count; >= 64 per the concurrency contract
const STRIPES: usize = 64;

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("PII violation storing ({domain}, {key}) as PUBLIC: {kinds:?}")]
    PiiViolation {
        domain: String,
        key: String,
        kinds: Vec<String>,
    },

    #[error("Integrity error for ({domain}, {key}); record quarantined")]
    Integrity { domain: String, key: String },

    #[error("Memory backend unavailable: {reason}")]
    BackendUnavailable { reason: String },

    #[error("No record for ({domain}, {key})")]
    NotFound { domain: String, key: String },

    #[error("Crypto failure: {0}")]
    Crypto(#[from] CryptError),

    #[error("Tool '{tool}' lacks the capability to mutate SECRET records")]
    CapabilityDenied { tool: String },
}

impl MemoryError {
    pub fn code(&self) -> ErrorCode {
        match self {
            MemoryError::PiiViolation { .. } => ErrorCode::PiiViolation,
            MemoryError::Integrity { .. } => ErrorCode::Integrity,
            MemoryError::BackendUnavailable { .. } => ErrorCode::BackendUnavailable,
            MemoryError::NotFound { .. } => ErrorCode::BackendUnavailable,
            MemoryError::Crypto(_) => ErrorCode::Integrity,
            MemoryError::CapabilityDenied { .. } => ErrorCode::Validation,
        }
    }
}

// ============================================================================
// OPTIONS & SNAPSHOTS
// ============================================================================

/// Options for `put_with_options`
#[derive(Debug, Clone, Copy, Default)]
pub struct PutOptions {
    /// Store a redacted copy instead of refusing / annotating
    pub redact: bool,
}

/// Immutable metadata snapshot other components may hold
#[derive(Debug, Clone)]
pub struct RecordMeta {
    pub sensitivity: Sensitivity,
    pub tier: Tier,
    pub pii_flags: Vec<PiiFlag>,
    pub created_at: chrono::DateTime<Utc>,
    pub last_access: chrono::DateTime<Utc>,
    pub access_count: u64,
}

/// Cache hit ratios surfaced in the metrics snapshot
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CacheStats {
    pub l1_hit_ratio: f64,
    pub l2_hit_ratio: f64,
    pub records: usize,
}

// ============================================================================
// MEMORY ENGINE
// ============================================================================

/// Process-wide memory engine handle. Create one per run with [`MemoryEngine::open`]
/// and thread it through dependencies; there are no hidden globals.
pub struct MemoryEngine {
    store: BackingStore,
    master_key: MasterKey,
    scanner: RwLock<PiiScanner>,
    l1: L1Cache,
    l2: L2Cache,
    vectors: RwLock<VectorIndex>,
    index_dir: std::path::PathBuf,
    meta: DashMap<(String, String), RecordMeta>,
    stripes: Vec<Mutex<()>>,
    config: MemoryConfig,
}

impl MemoryEngine {
    /// Open (or create) the store under `root` and derive the master key once
    pub fn open(root: &Path, config: MemoryConfig) -> Result<Self, MemoryError> {
        let store = BackingStore::open(root).map_err(|e| MemoryError::BackendUnavailable {
            reason: e.to_string(),
        })?;

        let salt = Self::load_or_create_salt(root)?;
        let passphrase = match config.resolve_passphrase() {
            Some(p) => p,
            None => Self::load_or_create_keyfile(root)?,
        };
        let master_key = MasterKey::derive(&passphrase, &salt);

        let l1 = L1Cache::new(config.l1_entries);
        let l2 = L2Cache::open(&root.join("cache"), config.l2_entries).map_err(|e| {
            MemoryError::BackendUnavailable {
                reason: e.to_string(),
            }
        })?;

        let index_dir = root.join("index");
        let engine = Self {
            store,
            master_key,
            scanner: RwLock::new(PiiScanner::new()),
            l1,
            l2,
            vectors: RwLock::new(VectorIndex::new()),
            index_dir,
            meta: DashMap::new(),
            stripes: (0..STRIPES).map(|_| Mutex::new(())).collect(),
            config,
        };
        engine.rebuild_index();
        Ok(engine)
    }

    fn load_or_create_salt(root: &Path) -> Result<[u8; 16], MemoryError> {
        let path = root.join("store.salt");
        if let Ok(raw) = std::fs::read(&path) {
            if raw.len() == 16 {
                let mut salt = [0u8; 16];
                salt.copy_from_slice(&raw);
                return Ok(salt);
            }
        }
        let salt = MasterKey::generate_salt();
        std::fs::write(&path, salt).map_err(|e| MemoryError::BackendUnavailable {
            reason: e.to_string(),
        })?;
        Ok(salt)
    }

    /// Runs without a configured passphrase get a generated one, persisted so
    /// later runs against the same store still decrypt
    fn load_or_create_keyfile(root: &Path) -> Result<String, MemoryError> {
        let path = root.join("store.pass");
        if let Ok(existing) = std::fs::read_to_string(&path) {
            return Ok(existing);
        }
        let generated = BASE64.encode(MasterKey::generate_salt());
        std::fs::write(&path, &generated).map_err(|e| MemoryError::BackendUnavailable {
            reason: e.to_string(),
        })?;
        Ok(generated)
    }

    /// Rebuild the vector index and metadata map from the backing store.
    /// A persisted index matching the record set skips the embedding pass.
    fn rebuild_index(&self) {
        let records = self.store.scan();
        let mut vectors = self.vectors.write();
        let reuse = match VectorIndex::load(&self.index_dir) {
            Some(loaded) if loaded.len() == records.len() => {
                *vectors = loaded;
                true
            }
            _ => false,
        };

        for (_, record) in records {
            match self.open_payload(&record) {
                Ok(content) => {
                    if !reuse {
                        vectors.upsert(&record.domain, &record.key, &content, record.created_at);
                    }
                    self.meta.insert(
                        (record.domain.clone(), record.key.clone()),
                        Self::meta_of(&record),
                    );
                }
                Err(_) => {
                    vectors.remove(&record.domain, &record.key);
                    tracing::warn!(
                        domain = record.domain,
                        key = record.key,
                        "record failed to open during index rebuild; skipped"
                    );
                }
            }
        }
        vectors.persist(&self.index_dir);
    }

    fn meta_of(record: &StoredRecord) -> RecordMeta {
        RecordMeta {
            sensitivity: record.sensitivity,
            tier: record.tier,
            pii_flags: record.pii_flags.clone(),
            created_at: record.created_at,
            last_access: record.last_access,
            access_count: record.access_count,
        }
    }

    fn stripe_for(&self, domain: &str, key: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        domain.hash(&mut hasher);
        key.hash(&mut hasher);
        &self.stripes[(hasher.finish() % STRIPES as u64) as usize]
    }

    /// Register a custom PII validator on top of the builtin set
    pub fn register_pii_validator(&self, validator: CustomValidator) {
        self.scanner.write().register(validator);
    }

    // ------------------------------------------------------------------
    // put
    // ------------------------------------------------------------------

    /// Store content under `(domain, key)`, replacing atomically
    pub fn put(
        &self,
        domain: &str,
        key: &str,
        content: &str,
        sensitivity: Sensitivity,
    ) -> Result<String, MemoryError> {
        self.put_with_options(domain, key, content, sensitivity, PutOptions::default())
    }

    pub fn put_with_options(
        &self,
        domain: &str,
        key: &str,
        content: &str,
        sensitivity: Sensitivity,
        options: PutOptions,
    ) -> Result<String, MemoryError> {
        let flags = self.scanner.read().scan(content);

        if sensitivity == Sensitivity::Public && !flags.is_empty() && !options.redact {
            return Err(MemoryError::PiiViolation {
                domain: domain.to_string(),
                key: key.to_string(),
                kinds: flags.iter().map(|f| f.kind.as_str().to_string()).collect(),
            });
        }

        // Redaction only rewrites the stored copy when explicitly requested;
        // otherwise findings are annotated and the content kept verbatim.
        let stored_content = if options.redact && !flags.is_empty() {
            self.scanner.read().redact(content, &flags)
        } else {
            content.to_string()
        };

        let id = record_id(domain, key);
        let now = Utc::now();

        let (payload, encrypted) = if sensitivity.encrypted_at_rest() {
            let sealed = self.master_key.seal(stored_content.as_bytes())?;
            (sealed.encode(), true)
        } else {
            (BASE64.encode(stored_content.as_bytes()), false)
        };

        let record = StoredRecord {
            domain: domain.to_string(),
            key: key.to_string(),
            sensitivity,
            tier: Tier::Hot,
            payload,
            encrypted,
            digest: content_digest(&stored_content),
            pii_flags: flags,
            created_at: now,
            last_access: now,
            access_count: 0,
        };

        {
            let _guard = self.stripe_for(domain, key).lock();
            self.store
                .commit(&id, &record)
                .map_err(|e| MemoryError::BackendUnavailable {
                    reason: e.to_string(),
                })?;
        }

        // Caches and index are populated after the commit acknowledges.
        self.l1.put(domain, key, stored_content.clone());
        if let Some(at_rest) = BackingStore::serialize(&record) {
            self.l2.put(&id, &at_rest);
        }
        {
            let mut vectors = self.vectors.write();
            vectors.upsert(domain, key, &stored_content, now);
            vectors.persist(&self.index_dir);
        }
        self.meta
            .insert((domain.to_string(), key.to_string()), Self::meta_of(&record));

        Ok(id)
    }

    // ------------------------------------------------------------------
    // get
    // ------------------------------------------------------------------

    /// Retrieve content; read order is L1 -> L2 -> backing store
    pub fn get(&self, domain: &str, key: &str) -> Result<String, MemoryError> {
        if let Some(content) = self.l1.get(domain, key) {
            self.touch(domain, key);
            return Ok(content);
        }

        let id = record_id(domain, key);

        if let Some(raw) = self.l2.get(&id) {
            if let Some(record) = BackingStore::parse(&raw) {
                match self.open_payload(&record) {
                    Ok(content) => {
                        self.l1.put(domain, key, content.clone());
                        self.touch(domain, key);
                        return Ok(content);
                    }
                    Err(_) => {
                        // Stale or corrupt cache entry; fall through to the store.
                        self.l2.remove(&id);
                    }
                }
            }
        }

        let record = match self.store.load(&id) {
            Ok(Some(record)) => record,
            Ok(None) => {
                return Err(MemoryError::NotFound {
                    domain: domain.to_string(),
                    key: key.to_string(),
                })
            }
            // A store outage degrades reads to NOT_FOUND after bounded retry.
            Err(BackendError::Unavailable { .. }) => {
                return Err(MemoryError::NotFound {
                    domain: domain.to_string(),
                    key: key.to_string(),
                })
            }
            Err(BackendError::Corrupt { .. }) => {
                self.quarantine(domain, key, &id);
                return Err(MemoryError::Integrity {
                    domain: domain.to_string(),
                    key: key.to_string(),
                });
            }
        };

        let content = match self.open_payload(&record) {
            Ok(content) => content,
            Err(_) => {
                self.quarantine(domain, key, &id);
                return Err(MemoryError::Integrity {
                    domain: domain.to_string(),
                    key: key.to_string(),
                });
            }
        };

        self.l1.put(domain, key, content.clone());
        if let Some(at_rest) = BackingStore::serialize(&record) {
            self.l2.put(&id, &at_rest);
        }
        self.touch(domain, key);
        Ok(content)
    }

    /// Decrypt and digest-verify one record's payload
    fn open_payload(&self, record: &StoredRecord) -> Result<String, MemoryError> {
        let plaintext = if record.encrypted {
            let sealed = Sealed::decode(&record.payload)?;
            self.master_key.open(&sealed)?
        } else {
            BASE64
                .decode(&record.payload)
                .map_err(|e| CryptError::Malformed(e.to_string()))?
        };

        let content = String::from_utf8(plaintext).map_err(|_| MemoryError::Integrity {
            domain: record.domain.clone(),
            key: record.key.clone(),
        })?;

        if content_digest(&content) != record.digest {
            return Err(MemoryError::Integrity {
                domain: record.domain.clone(),
                key: record.key.clone(),
            });
        }
        Ok(content)
    }

    fn quarantine(&self, domain: &str, key: &str, id: &str) {
        self.store.quarantine(id);
        self.l1.remove(domain, key);
        self.l2.remove(id);
        {
            let mut vectors = self.vectors.write();
            vectors.remove(domain, key);
            vectors.persist(&self.index_dir);
        }
        self.meta.remove(&(domain.to_string(), key.to_string()));
    }

    /// Record an access: bump counters, promote to HOT, persist best-effort
    fn touch(&self, domain: &str, key: &str) {
        let now = Utc::now();
        let mut snapshot = None;
        if let Some(mut meta) = self.meta.get_mut(&(domain.to_string(), key.to_string())) {
            meta.access_count += 1;
            meta.last_access = now;
            meta.tier = Tier::Hot;
            snapshot = Some((meta.access_count, meta.tier));
        }
        if let Some((access_count, tier)) = snapshot {
            let id = record_id(domain, key);
            if let Ok(Some(mut record)) = self.store.load(&id) {
                record.access_count = access_count;
                record.last_access = now;
                record.tier = tier;
                let _ = self.store.commit(&id, &record);
            }
        }
    }

    // ------------------------------------------------------------------
    // search / purge
    // ------------------------------------------------------------------

    /// Rank records in `domains` against `query_text`
    pub fn search(&self, domains: &[String], query_text: &str, k: usize) -> Vec<SearchHit> {
        self.vectors.read().search(domains, query_text, k)
    }

    /// Remove content, vector, and cache entries; irreversible
    pub fn purge(&self, domain: &str, key: &str) -> Result<(), MemoryError> {
        let id = record_id(domain, key);
        let _guard = self.stripe_for(domain, key).lock();
        self.store
            .remove(&id)
            .map_err(|e| MemoryError::BackendUnavailable {
                reason: e.to_string(),
            })?;
        self.l1.remove(domain, key);
        self.l2.remove(&id);
        {
            let mut vectors = self.vectors.write();
            vectors.remove(domain, key);
            vectors.persist(&self.index_dir);
        }
        self.meta.remove(&(domain.to_string(), key.to_string()));
        Ok(())
    }

    // ------------------------------------------------------------------
    // tiering & stats
    // ------------------------------------------------------------------

    /// Demote untouched records HOT->WARM->COLD; returns demotion count.
    /// Latency-only: demoted records read identically.
    pub fn sweep_tiers(&self) -> usize {
        let now = Utc::now();
        let hot_to_warm =
            chrono::Duration::from_std(self.config.hot_to_warm).unwrap_or(chrono::Duration::hours(1));
        let warm_to_cold = chrono::Duration::from_std(self.config.warm_to_cold)
            .unwrap_or(chrono::Duration::hours(24));

        let mut demoted = 0usize;
        for mut entry in self.meta.iter_mut() {
            let idle = now - entry.last_access;
            let next = if idle >= warm_to_cold {
                Tier::Cold
            } else if idle >= hot_to_warm {
                Tier::Warm
            } else {
                continue;
            };
            if entry.tier != next {
                entry.tier = next;
                demoted += 1;
                let ((domain, key), tier) = (entry.key().clone(), next);
                let id = record_id(&domain, &key);
                if let Ok(Some(mut record)) = self.store.load(&id) {
                    record.tier = tier;
                    let _ = self.store.commit(&id, &record);
                }
            }
        }
        demoted
    }

    /// Background sweeper; demotion cadence follows the HOT->WARM threshold
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        let period = engine.config.hot_to_warm.min(Duration::from_secs(300));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period.max(Duration::from_millis(50)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let demoted = engine.sweep_tiers();
                        if demoted > 0 {
                            tracing::debug!(demoted, "memory tier sweep");
                        }
                    }
                }
            }
        })
    }

    /// Metadata snapshot for one record
    pub fn meta_for(&self, domain: &str, key: &str) -> Option<RecordMeta> {
        self.meta
            .get(&(domain.to_string(), key.to_string()))
            .map(|m| m.clone())
    }

    /// Cache hit ratios and record count for the metrics snapshot
    pub fn cache_stats(&self) -> CacheStats {
        CacheStats {
            l1_hit_ratio: self.l1.stats.ratio(),
            l2_hit_ratio: self.l2.stats.ratio(),
            records: self.meta.len(),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(dir: &Path) -> MemoryEngine {
        let config = MemoryConfig {
            passphrase: Some("test-pass".into()),
            ..MemoryConfig::default()
        };
        MemoryEngine::open(dir, config).unwrap()
    }

    #[test]
    fn test_put_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());

        engine
            .put("db-schema", "v1", "orders table layout", Sensitivity::Internal)
            .unwrap();
        assert_eq!(
            engine.get("db-schema", "v1").unwrap(),
            "orders table layout"
        );
    }

    #[test]
    fn test_put_is_idempotent_by_digest() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());

        let a = engine.put("d", "k", "same content", Sensitivity::Internal).unwrap();
        let b = engine.put("d", "k", "same content", Sensitivity::Internal).unwrap();
        assert_eq!(a, b);
        let meta = engine.meta_for("d", "k").unwrap();
        assert_eq!(
            engine.cache_stats().records,
            1,
            "double put keeps one record"
        );
        assert_eq!(meta.tier, Tier::Hot);
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        assert!(matches!(
            engine.get("d", "ghost"),
            Err(MemoryError::NotFound { .. })
        ));
    }

    #[test]
    fn test_public_with_pii_refused() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let err = engine
            .put("d", "k", "mail me at a@b.co", Sensitivity::Public)
            .unwrap_err();
        assert!(matches!(err, MemoryError::PiiViolation { .. }));
        assert_eq!(err.code(), ErrorCode::PiiViolation);
    }

    #[test]
    fn test_public_with_pii_redacted_when_asked() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        engine
            .put_with_options(
                "d",
                "k",
                "mail me at a@b.co",
                Sensitivity::Public,
                PutOptions { redact: true },
            )
            .unwrap();
        let stored = engine.get("d", "k").unwrap();
        assert!(!stored.contains("a@b.co"));
        assert!(stored.contains("[REDACTED:email]"));
    }

    #[test]
    fn test_internal_with_pii_annotated_not_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        engine
            .put("d", "k", "owner is a@b.co", Sensitivity::Internal)
            .unwrap();
        assert_eq!(engine.get("d", "k").unwrap(), "owner is a@b.co");
        let meta = engine.meta_for("d", "k").unwrap();
        assert_eq!(meta.pii_flags.len(), 1);
    }

    #[test]
    fn test_encrypted_at_rest_for_internal_and_secret() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        engine.put("d", "sec", "classified", Sensitivity::Secret).unwrap();
        engine.put("d", "pub", "open data", Sensitivity::Public).unwrap();

        // Raw record files never contain INTERNAL/SECRET plaintext
        for (_, record) in engine.store.scan() {
            if record.sensitivity.encrypted_at_rest() {
                assert!(record.encrypted);
                assert!(!record.payload.contains("classified"));
            }
        }
    }

    #[test]
    fn test_corruption_quarantines_and_spares_others() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        engine.put("db-schema", "v1", "the schema", Sensitivity::Internal).unwrap();
        engine.put("db-schema", "other", "unrelated", Sensitivity::Internal).unwrap();

        // Flip one ciphertext byte on disk and drop the caches
        let id = record_id("db-schema", "v1");
        let path = dir.path().join(format!("records/{id}.json"));
        let mut record: StoredRecord =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let mut raw = BASE64.decode(&record.payload).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        record.payload = BASE64.encode(raw);
        std::fs::write(&path, serde_json::to_string(&record).unwrap()).unwrap();
        engine.l1.remove("db-schema", "v1");
        engine.l2.remove(&id);

        let err = engine.get("db-schema", "v1").unwrap_err();
        assert!(matches!(err, MemoryError::Integrity { .. }));
        assert!(dir
            .path()
            .join(format!("quarantine/{id}.json"))
            .exists());

        // Unrelated key still reads fine
        assert_eq!(engine.get("db-schema", "other").unwrap(), "unrelated");
    }

    #[test]
    fn test_reading_without_master_key_fails() {
        let dir = tempfile::tempdir().unwrap();
        {
            let engine = engine(dir.path());
            engine.put("d", "k", "secret stuff", Sensitivity::Internal).unwrap();
        }
        // Reopen with a different passphrase: decrypt fails as integrity
        let other = MemoryEngine::open(
            dir.path(),
            MemoryConfig {
                passphrase: Some("wrong-pass".into()),
                ..MemoryConfig::default()
            },
        )
        .unwrap();
        assert!(matches!(
            other.get("d", "k"),
            Err(MemoryError::Integrity { .. })
        ));
    }

    #[test]
    fn test_search_scoped_to_domains() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        engine.put("db", "schema", "orders table columns", Sensitivity::Internal).unwrap();
        engine.put("ux", "palette", "color tokens", Sensitivity::Internal).unwrap();

        let hits = engine.search(&["db".to_string()], "orders table", 5);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].key, "schema");
        assert!(hits[0].score > 0.0);
    }

    #[test]
    fn test_purge_is_irreversible() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        engine.put("d", "k", "to be purged", Sensitivity::Public).unwrap();
        engine.purge("d", "k").unwrap();

        assert!(matches!(
            engine.get("d", "k"),
            Err(MemoryError::NotFound { .. })
        ));
        assert!(engine.search(&["d".to_string()], "purged", 5).is_empty());
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let engine = engine(dir.path());
            engine.put("d", "k", "durable content", Sensitivity::Secret).unwrap();
        }
        let engine = engine(dir.path());
        assert_eq!(engine.get("d", "k").unwrap(), "durable content");
        // Index was rebuilt from the store
        assert_eq!(engine.search(&["d".to_string()], "durable", 5).len(), 1);
    }

    #[test]
    fn test_sweep_demotes_idle_records() {
        let dir = tempfile::tempdir().unwrap();
        let config = MemoryConfig {
            passphrase: Some("test-pass".into()),
            hot_to_warm: Duration::from_millis(0),
            warm_to_cold: Duration::from_secs(3600),
            ..MemoryConfig::default()
        };
        let engine = MemoryEngine::open(dir.path(), config).unwrap();
        engine.put("d", "k", "idle", Sensitivity::Public).unwrap();

        let demoted = engine.sweep_tiers();
        assert_eq!(demoted, 1);
        assert_eq!(engine.meta_for("d", "k").unwrap().tier, Tier::Warm);

        // Demotion never affects reads
        assert_eq!(engine.get("d", "k").unwrap(), "idle");
        // Access promoted it back to HOT
        assert_eq!(engine.meta_for("d", "k").unwrap().tier, Tier::Hot);
    }

    #[test]
    fn test_cache_stats_track_hits() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        engine.put("d", "k", "cached", Sensitivity::Public).unwrap();
        engine.get("d", "k").unwrap(); // L1 hit (populated by put)
        let stats = engine.cache_stats();
        assert!(stats.l1_hit_ratio > 0.0);
        assert_eq!(stats.records, 1);
    }
}
