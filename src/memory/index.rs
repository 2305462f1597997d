//! In-memory vector index for semantic retrieval
//!
//! Embeddings are hashed bag-of-words vectors: each token hashes into one of
//! `EMBEDDING_DIM` buckets, term counts accumulate, and the vector is
//! L2-normalized. Deterministic, dependency-free, and good enough to rank
//! domain-scoped snippets; the interface stays stable if a model-backed
//! embedder replaces it.
//!
//! Search filters by domain, ranks by cosine similarity, and breaks ties by
//! recency (newer first) then key lexicographic.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Fixed embedding dimensionality
pub const EMBEDDING_DIM: usize = 256;

/// Characters of content carried into search hits
const SNIPPET_LEN: usize = 160;

/// One ranked search hit
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub domain: String,
    pub key: String,
    pub score: f32,
    pub snippet: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    vector: Vec<f32>,
    snippet: String,
    stored_at: DateTime<Utc>,
}

/// Tokenize into lowercase alphanumeric runs
fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

fn bucket(token: &str) -> usize {
    let digest = Sha256::digest(token.as_bytes());
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&digest[..8]);
    (u64::from_le_bytes(raw) % EMBEDDING_DIM as u64) as usize
}

/// Embed text into a normalized hashed bag-of-words vector
pub fn embed(text: &str) -> Vec<f32> {
    let mut vector = vec![0f32; EMBEDDING_DIM];
    for token in tokens(text) {
        vector[bucket(&token)] += 1.0;
    }
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut vector {
            *v /= norm;
        }
    }
    vector
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    // Both sides are already normalized, so the dot product is the cosine.
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn snippet_of(content: &str) -> String {
    if content.len() <= SNIPPET_LEN {
        return content.to_string();
    }
    let mut end = SNIPPET_LEN;
    while !content.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &content[..end])
}

/// Vector index over memory records, keyed by `(domain, key)`
#[derive(Default)]
pub struct VectorIndex {
    entries: HashMap<(String, String), IndexEntry>,
}

impl VectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the vector for one record
    pub fn upsert(&mut self, domain: &str, key: &str, content: &str, stored_at: DateTime<Utc>) {
        self.entries.insert(
            (domain.to_string(), key.to_string()),
            IndexEntry {
                vector: embed(content),
                snippet: snippet_of(content),
                stored_at,
            },
        );
    }

    pub fn remove(&mut self, domain: &str, key: &str) {
        self.entries
            .remove(&(domain.to_string(), key.to_string()));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rank records in the given domains against the query text
    pub fn search(&self, domains: &[String], query: &str, k: usize) -> Vec<SearchHit> {
        if k == 0 {
            return Vec::new();
        }
        let query_vec = embed(query);

        let mut hits: Vec<(&(String, String), &IndexEntry, f32)> = self
            .entries
            .iter()
            .filter(|((domain, _), _)| domains.iter().any(|d| d == domain))
            .map(|(id, entry)| (id, entry, cosine(&query_vec, &entry.vector)))
            .collect();

        // Score desc, then recency (newer first), then key lexicographic.
        hits.sort_by(|a, b| {
            b.2.partial_cmp(&a.2)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.1.stored_at.cmp(&a.1.stored_at))
                .then_with(|| a.0 .1.cmp(&b.0 .1))
        });

        hits.into_iter()
            .take(k)
            .map(|((domain, key), entry, score)| SearchHit {
                domain: domain.clone(),
                key: key.clone(),
                score,
                snippet: entry.snippet.clone(),
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Write the index to `<dir>/vectors.json` (best-effort; the index is
    /// always rebuildable from the record store)
    pub fn persist(&self, dir: &Path) {
        if std::fs::create_dir_all(dir).is_err() {
            return;
        }
        let entries: Vec<(&(String, String), &IndexEntry)> = self.entries.iter().collect();
        let Ok(raw) = serde_json::to_string(&entries) else {
            return;
        };
        let target = dir.join("vectors.json");
        let tmp = dir.join(".vectors.tmp");
        let result = std::fs::write(&tmp, raw).and_then(|()| std::fs::rename(&tmp, &target));
        if let Err(e) = result {
            tracing::debug!(error = %e, "vector index not persisted");
        }
    }

    /// Load a persisted index; None when absent or unreadable
    pub fn load(dir: &Path) -> Option<Self> {
        let raw = std::fs::read_to_string(dir.join("vectors.json")).ok()?;
        let entries: Vec<((String, String), IndexEntry)> = serde_json::from_str(&raw).ok()?;
        Some(Self {
            entries: entries.into_iter().collect(),
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
