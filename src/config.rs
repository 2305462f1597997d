//! Run configuration (`maestro.yaml`)
//!
//! One file per run directory configures concurrency caps, retry policy,
//! HITL thresholds and SLAs, cache sizes, and shutdown behavior. Durations
//! are written as strings ("30s", "5m", "2h"). Hot reload is not supported;
//! the file is read once when the run starts.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::RoleId;

// ============================================================================
// DURATION PARSING
// ============================================================================

/// Parse a duration string like "500ms", "30s", "5m", "1h" into a Duration
pub fn parse_duration(duration_str: &str) -> Option<Duration> {
    let s = duration_str.trim();
    if s.is_empty() {
        return None;
    }

    if let Some(ms) = s.strip_suffix("ms") {
        return ms.trim().parse::<u64>().ok().map(Duration::from_millis);
    }
    if let Some(secs) = s.strip_suffix('s') {
        return secs.trim().parse::<u64>().ok().map(Duration::from_secs);
    }
    if let Some(mins) = s.strip_suffix('m') {
        return mins
            .trim()
            .parse::<u64>()
            .ok()
            .map(|m| Duration::from_secs(m * 60));
    }
    if let Some(hours) = s.strip_suffix('h') {
        return hours
            .trim()
            .parse::<u64>()
            .ok()
            .map(|h| Duration::from_secs(h * 3600));
    }

    s.parse::<u64>().ok().map(Duration::from_secs)
}

/// Render a Duration back into the shortest exact suffix form
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if d.subsec_millis() != 0 || (secs == 0 && d.as_millis() > 0) {
        return format!("{}ms", d.as_millis());
    }
    if secs % 3600 == 0 && secs != 0 {
        format!("{}h", secs / 3600)
    } else if secs % 60 == 0 && secs != 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

/// Serde adapters for duration strings
pub mod duration_str {
    use super::{format_duration, parse_duration};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(de)?;
        parse_duration(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid duration: '{raw}'")))
    }

    /// `Option<Duration>` variant for optional fields
    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(d: &Option<Duration>, ser: S) -> Result<S::Ok, S::Error> {
            match d {
                Some(d) => ser.serialize_some(&format_duration(*d)),
                None => ser.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            de: D,
        ) -> Result<Option<Duration>, D::Error> {
            let raw: Option<String> = Option::deserialize(de)?;
            match raw {
                None => Ok(None),
                Some(raw) => parse_duration(&raw)
                    .map(Some)
                    .ok_or_else(|| serde::de::Error::custom(format!("invalid duration: '{raw}'"))),
            }
        }
    }
}

// ============================================================================
// RETRY POLICY
// ============================================================================

/// Exponential backoff with jitter, applied to failed task attempts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first (0 disables retry entirely)
    pub max_attempts: u32,
    /// Backoff before attempt n+1 is `base * factor^(n-1)`, jittered
    #[serde(with = "duration_str")]
    pub backoff_base: Duration,
    pub backoff_factor: u32,
    /// Fractional jitter applied symmetrically (0.25 = +/-25%)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(30),
            backoff_factor: 2,
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Jittered backoff before the given attempt number (1-based; attempt 1
    /// has no backoff)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exp = attempt.saturating_sub(2).min(16);
        let base = self.backoff_base.as_millis() as u64;
        let raw = base.saturating_mul(u64::from(self.backoff_factor).saturating_pow(exp));

        if self.jitter <= 0.0 {
            return Duration::from_millis(raw);
        }
        let spread = (raw as f64 * self.jitter) as u64;
        let low = raw.saturating_sub(spread);
        let high = raw.saturating_add(spread).max(low + 1);
        Duration::from_millis(rand::Rng::gen_range(&mut rand::thread_rng(), low..high))
    }
}

// ============================================================================
// HITL CONFIG
// ============================================================================

/// Review routing thresholds and SLAs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HitlConfig {
    /// Below this score the review auto-approves
    pub auto_approve_below: u32,
    /// At or above this score the item enters ESCALATED directly
    pub escalate_at: u32,
    /// Deadline for a standard review
    #[serde(with = "duration_str")]
    pub standard_sla: Duration,
    /// Deadline for an escalated review
    #[serde(with = "duration_str")]
    pub escalated_sla: Duration,
    /// Cap on ladder promotions; a breach at the final ladder level rejects
    /// the item regardless of how many promotions it took to get there
    pub max_promotions: u32,
    /// Half-life for historical failure-rate decay
    #[serde(with = "duration_str")]
    pub failure_decay_half_life: Duration,
}

impl Default for HitlConfig {
    fn default() -> Self {
        Self {
            auto_approve_below: 3,
            escalate_at: 7,
            standard_sla: Duration::from_secs(4 * 3600),
            escalated_sla: Duration::from_secs(3600),
            max_promotions: 3,
            failure_decay_half_life: Duration::from_secs(30 * 24 * 3600),
        }
    }
}

// ============================================================================
// MEMORY CONFIG
// ============================================================================

/// Memory engine sizing and tiering
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MemoryConfig {
    /// L1 in-memory LRU entries
    pub l1_entries: usize,
    /// L2 on-disk LRU entries
    pub l2_entries: usize,
    /// Untouched records demote HOT -> WARM after this long
    #[serde(with = "duration_str")]
    pub hot_to_warm: Duration,
    /// Untouched records demote WARM -> COLD after this long
    #[serde(with = "duration_str")]
    pub warm_to_cold: Duration,
    /// Passphrase the master key is derived from. Tests set it inline;
    /// deployments point `passphraseEnv` at a secret instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase_env: Option<String>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            l1_entries: 1000,
            l2_entries: 10_000,
            hot_to_warm: Duration::from_secs(3600),
            warm_to_cold: Duration::from_secs(24 * 3600),
            passphrase: None,
            passphrase_env: None,
        }
    }
}

impl MemoryConfig {
    /// Resolve the configured passphrase, preferring the environment variable
    pub fn resolve_passphrase(&self) -> Option<String> {
        if let Some(ref var) = self.passphrase_env {
            if let Ok(value) = std::env::var(var) {
                return Some(value);
            }
        }
        self.passphrase.clone()
    }
}

// ============================================================================
// ENGINE CONFIG
// ============================================================================

/// Full run configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EngineConfig {
    /// Global cap on concurrently running tasks
    pub max_parallel: usize,

    /// Per-role caps; roles absent from the map fall back to `max_parallel`
    #[serde(default)]
    pub role_caps: HashMap<RoleId, usize>,

    /// Executor binding ("mock", "command")
    #[serde(default = "default_executor")]
    pub executor: String,

    /// Per-role command lines for the command executor
    #[serde(default)]
    pub role_commands: HashMap<RoleId, String>,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub hitl: HitlConfig,

    #[serde(default)]
    pub memory: MemoryConfig,

    /// Hard per-task timeout bounds: `clamp(4 * effort, min, max)`
    #[serde(with = "duration_str", default = "default_timeout_floor")]
    pub task_timeout_min: Duration,
    #[serde(with = "duration_str", default = "default_timeout_ceiling")]
    pub task_timeout_max: Duration,

    /// Grace period granted to cancelled workers before leases are revoked
    #[serde(with = "duration_str", default = "default_cancel_grace")]
    pub cancel_grace: Duration,

    /// Drain window for graceful shutdown before forcing exit code 2
    #[serde(with = "duration_str", default = "default_drain_window")]
    pub drain_window: Duration,

    /// Fraction of tasks that must be DONE for exit code 0
    #[serde(default = "default_done_threshold")]
    pub done_threshold: f64,
}

fn default_executor() -> String {
    "mock".to_string()
}

fn default_timeout_floor() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_timeout_ceiling() -> Duration {
    Duration::from_secs(2 * 3600)
}

fn default_cancel_grace() -> Duration {
    Duration::from_secs(30)
}

fn default_drain_window() -> Duration {
    Duration::from_secs(60)
}

fn default_done_threshold() -> f64 {
    1.0
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            role_caps: HashMap::new(),
            executor: default_executor(),
            role_commands: HashMap::new(),
            retry: RetryPolicy::default(),
            hitl: HitlConfig::default(),
            memory: MemoryConfig::default(),
            task_timeout_min: default_timeout_floor(),
            task_timeout_max: default_timeout_ceiling(),
            cancel_grace: default_cancel_grace(),
            drain_window: default_drain_window(),
            done_threshold: default_done_threshold(),
        }
    }
}

impl EngineConfig {
    /// Load from `<run_dir>/maestro.yaml`, falling back to defaults when the
    /// file is absent
    pub fn load(run_dir: &Path) -> Result<Self, ConfigError> {
        let path = run_dir.join("maestro.yaml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: EngineConfig =
            serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the scheduler cannot honor
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_parallel == 0 {
            return Err(ConfigError::Invalid(
                "maxParallel must be at least 1".to_string(),
            ));
        }
        if let Some((role, _)) = self.role_caps.iter().find(|(_, &cap)| cap == 0) {
            return Err(ConfigError::Invalid(format!(
                "roleCaps.{role} must be at least 1"
            )));
        }
        if self.hitl.auto_approve_below > self.hitl.escalate_at {
            return Err(ConfigError::Invalid(
                "hitl.autoApproveBelow must not exceed hitl.escalateAt".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.done_threshold) {
            return Err(ConfigError::Invalid(
                "doneThreshold must be between 0 and 1".to_string(),
            ));
        }
        if self.task_timeout_min > self.task_timeout_max {
            return Err(ConfigError::Invalid(
                "taskTimeoutMin must not exceed taskTimeoutMax".to_string(),
            ));
        }
        Ok(())
    }

    /// Concurrency cap for one role
    pub fn role_cap(&self, role: RoleId) -> usize {
        self.role_caps
            .get(&role)
            .copied()
            .unwrap_or(self.max_parallel)
    }

    /// Hard deadline for one task: `clamp(4 * effort, min, max)`
    pub fn hard_timeout(&self, effort: Duration) -> Duration {
        (effort * 4).clamp(self.task_timeout_min, self.task_timeout_max)
    }

    /// Profile with tight timings for tests
    pub fn testing() -> Self {
        Self {
            max_parallel: 2,
            retry: RetryPolicy {
                max_attempts: 2,
                backoff_base: Duration::from_millis(10),
                backoff_factor: 2,
                jitter: 0.0,
            },
            hitl: HitlConfig {
                standard_sla: Duration::from_millis(200),
                escalated_sla: Duration::from_millis(50),
                ..HitlConfig::default()
            },
            task_timeout_min: Duration::from_secs(5),
            cancel_grace: Duration::from_millis(100),
            drain_window: Duration::from_secs(1),
            ..Self::default()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// TESTS
// ============================================================================
