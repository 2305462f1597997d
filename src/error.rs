//! Unified error handling with stable codes and fix suggestions
//!
//! Each subsystem owns its error enum; this module provides:
//! - [`ErrorCode`]: the closed taxonomy recorded in audit logs and metrics
//! - [`EngineError`]: top-level wrapper for the CLI entry point
//! - [`FixSuggestion`]: operator hints attached to every error family
//!
//! Recoverable errors (executor failures, backend unavailability, timeouts)
//! are retried under the scheduler's policy; everything else propagates.

use thiserror::Error;

use serde::{Deserialize, Serialize};

// ============================================================================
// ERROR CODES
// ============================================================================

/// Stable error codes, recorded verbatim in audit entries, execution records,
/// and the per-code metric counters. Additive changes only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Validation,
    Dependency,
    Executor,
    Timeout,
    Integrity,
    BackendUnavailable,
    PiiViolation,
    Io,
    HitlRejected,
    HitlEscalationExhausted,
    Cancelled,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Validation => "VALIDATION",
            ErrorCode::Dependency => "DEPENDENCY",
            ErrorCode::Executor => "EXECUTOR",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::Integrity => "INTEGRITY",
            ErrorCode::BackendUnavailable => "BACKEND_UNAVAILABLE",
            ErrorCode::PiiViolation => "PII_VIOLATION",
            ErrorCode::Io => "IO_ERROR",
            ErrorCode::HitlRejected => "HITL_REJECTED",
            ErrorCode::HitlEscalationExhausted => "HITL_ESCALATION_EXHAUSTED",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::Internal => "INTERNAL",
        }
    }

    /// Recoverable codes are retried under the scheduler's retry policy
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ErrorCode::Executor | ErrorCode::Timeout | ErrorCode::BackendUnavailable
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// FIX SUGGESTION TRAIT
// ============================================================================

/// Trait for errors that can provide fix suggestions
///
/// All maestro errors should implement this trait to provide helpful
/// guidance to operators on how to resolve the error.
pub trait FixSuggestion {
    /// Get a fix suggestion for this error, if available
    fn fix_suggestion(&self) -> Option<&str>;
}

// ============================================================================
// ENGINE ERROR (Top-level CLI Error)
// ============================================================================

/// Top-level error type for the maestro CLI
///
/// This wraps specific error types from different modules,
/// providing a unified interface for the CLI entry point.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Task definition load/validation failure (fatal to the run)
    #[error("{0}")]
    Load(#[from] crate::store::LoadError),

    /// DAG violation: cycles, missing or duplicate ids (fatal to the run)
    #[error("{0}")]
    Graph(#[from] crate::graph::GraphError),

    /// Configuration failure
    #[error("{0}")]
    Config(#[from] crate::config::ConfigError),

    /// Task store persistence failure
    #[error("{0}")]
    Store(#[from] crate::store::StoreError),

    /// Memory engine failure
    #[error("{0}")]
    Memory(#[from] crate::memory::MemoryError),

    /// Executor failure
    #[error("{0}")]
    Executor(#[from] crate::executor::ExecutorError),

    /// Dispatch failure (templates, result shape)
    #[error("{0}")]
    Dispatch(#[from] crate::dispatch::DispatchError),

    /// Review engine failure
    #[error("{0}")]
    Hitl(#[from] crate::hitl::HitlError),

    /// Artifact persistence failure
    #[error("{0}")]
    Artifact(#[from] crate::artifact::ArtifactError),

    /// Illegal state transition (internal invariant breach)
    #[error("{0}")]
    State(#[from] crate::task::StateError),

    /// IO error (file not found, permission denied, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// Create a generic error with a message
    pub fn other(msg: impl Into<String>) -> Self {
        EngineError::Other(msg.into())
    }

    /// Stable code for audit logs and exit-code mapping
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::Load(_) => ErrorCode::Validation,
            EngineError::Graph(_) => ErrorCode::Dependency,
            EngineError::Config(_) => ErrorCode::Validation,
            EngineError::Store(_) => ErrorCode::Io,
            EngineError::Memory(e) => e.code(),
            EngineError::Executor(e) => e.code(),
            EngineError::Dispatch(_) => ErrorCode::Validation,
            EngineError::Hitl(e) => e.code(),
            EngineError::Artifact(e) => e.code(),
            EngineError::State(_) => ErrorCode::Internal,
            EngineError::Io(_) => ErrorCode::Io,
            EngineError::YamlParse(_) => ErrorCode::Validation,
            EngineError::Other(_) => ErrorCode::Internal,
        }
    }
}

impl FixSuggestion for EngineError {
    fn fix_suggestion(&self) -> Option<&str> {
        match self {
            EngineError::Load(e) => e.fix_suggestion(),
            EngineError::Graph(_) => {
                Some("Fix every listed violation in the task definitions and re-run validate")
            }
            EngineError::Config(_) => {
                Some("Check maestro.yaml: camelCase keys, duration strings like 30s/5m/2h")
            }
            EngineError::Store(_) => {
                Some("Check the state directory exists, is writable, and is not locked by another run")
            }
            EngineError::Memory(e) => e.fix_suggestion(),
            EngineError::Executor(e) => e.fix_suggestion(),
            EngineError::Dispatch(e) => e.fix_suggestion(),
            EngineError::Hitl(_) => {
                Some("Check the review decision records: taskId must match a task awaiting review")
            }
            EngineError::Artifact(e) => e.fix_suggestion(),
            EngineError::State(_) => {
                Some("This is an internal invariant breach; re-run with RUST_LOG=debug and report it")
            }
            EngineError::YamlParse(_) => {
                Some("Check YAML syntax: ensure proper indentation and quoting")
            }
            EngineError::Io(_) => Some("Check file path exists and has correct permissions"),
            EngineError::Other(_) => None,
        }
    }
}

// ============================================================================
// FIX SUGGESTION IMPLEMENTATIONS
// ============================================================================

impl FixSuggestion for crate::store::LoadError {
    fn fix_suggestion(&self) -> Option<&str> {
        Some("Each task file needs id, title, owner, priority; owners come from the eight-role registry; unknown fields are rejected")
    }
}

impl FixSuggestion for crate::memory::MemoryError {
    fn fix_suggestion(&self) -> Option<&str> {
        use crate::memory::MemoryError;

        Some(match self {
            MemoryError::PiiViolation { .. } => {
                "PUBLIC content must not contain emails, card numbers, or credentials; store it as INTERNAL or SECRET, or pass redact=true"
            }
            MemoryError::Integrity { .. } => {
                "The record was quarantined; inspect the store's quarantine/ directory and restore from a backup"
            }
            MemoryError::BackendUnavailable { .. } => {
                "Check the memory store directory exists and is writable"
            }
            MemoryError::NotFound { .. } => "Check the (domain, key) pair; purged records do not come back",
            MemoryError::Crypto(_) => {
                "Set memory.passphrase (or memory.passphraseEnv) consistently across runs sharing a store"
            }
            MemoryError::CapabilityDenied { .. } => {
                "Grant the tool an explicit secretWrite capability in the role registry"
            }
        })
    }
}

impl FixSuggestion for crate::executor::ExecutorError {
    fn fix_suggestion(&self) -> Option<&str> {
        use crate::executor::ExecutorError;

        Some(match self {
            ExecutorError::Unknown(_) => "Available executors: mock, command",
            ExecutorError::Spawn { .. } => {
                "Check the roleCommands entry for this role points at a runnable command"
            }
            ExecutorError::Failed { .. } => "Inspect the task's audit log for the executor output",
            ExecutorError::Timeout { .. } => {
                "Raise estimatedEffort on the task or taskTimeoutMax in maestro.yaml"
            }
            ExecutorError::Cancelled => "The run was cancelled; re-run to continue",
        })
    }
}

impl FixSuggestion for crate::dispatch::DispatchError {
    fn fix_suggestion(&self) -> Option<&str> {
        use crate::dispatch::DispatchError;

        Some(match self {
            DispatchError::UnknownPlaceholder { .. } => {
                "Role templates may only reference {task_id}, {title}, {description}, {role}, {context}, {attempt}"
            }
            DispatchError::MissingField { .. } => {
                "The executor result must carry a non-empty output field"
            }
            DispatchError::UnsafePath { .. } => {
                "Artifact paths must be relative, inside the task directory, without '..' components"
            }
            DispatchError::UnboundRole { .. } => {
                "Bind the role to an executor in maestro.yaml (executor + roleCommands)"
            }
            DispatchError::UnknownTool { .. } => {
                "Tools must be registered at init; check the role's capability list"
            }
        })
    }
}

impl FixSuggestion for crate::artifact::ArtifactError {
    fn fix_suggestion(&self) -> Option<&str> {
        use crate::artifact::ArtifactError;

        Some(match self {
            ArtifactError::PathViolation { .. } => {
                "Artifact paths must be relative, inside the task directory, without '..' components"
            }
            ArtifactError::Io { .. } => "Check disk space and directory permissions",
            ArtifactError::Integrity { .. } => {
                "The stored bytes no longer match the recorded digest; restore the artifact from the producing task"
            }
            ArtifactError::LeaseHeld { .. } => {
                "Another worker holds the write lease for this task's output directory"
            }
            ArtifactError::NotFound { .. } => "Check the task id and relative path",
        })
    }
}

// ============================================================================
// DISPLAY HELPERS
// ============================================================================

/// Format an error with its fix suggestion for display
pub fn format_error_with_suggestion<E: std::error::Error + FixSuggestion>(error: &E) -> String {
    let mut result = error.to_string();
    if let Some(suggestion) = error.fix_suggestion() {
        result.push_str("\n  Fix: ");
        result.push_str(suggestion);
    }
    result
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_stability() {
        assert_eq!(ErrorCode::PiiViolation.as_str(), "PII_VIOLATION");
        assert_eq!(ErrorCode::BackendUnavailable.as_str(), "BACKEND_UNAVAILABLE");
        assert_eq!(
            ErrorCode::HitlEscalationExhausted.as_str(),
            "HITL_ESCALATION_EXHAUSTED"
        );
    }

    #[test]
    fn test_error_code_serde_round_trip() {
        let json = serde_json::to_string(&ErrorCode::Timeout).unwrap();
        assert_eq!(json, "\"TIMEOUT\"");
        let back: ErrorCode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ErrorCode::Timeout);
    }

    #[test]
    fn test_recoverable_codes() {
        assert!(ErrorCode::Executor.is_recoverable());
        assert!(ErrorCode::Timeout.is_recoverable());
        assert!(ErrorCode::BackendUnavailable.is_recoverable());
        assert!(!ErrorCode::Integrity.is_recoverable());
        assert!(!ErrorCode::Validation.is_recoverable());
        assert!(!ErrorCode::PiiViolation.is_recoverable());
    }

    #[test]
    fn test_engine_error_wraps_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: EngineError = io_err.into();

        assert!(err.to_string().contains("IO error"));
        assert_eq!(err.code(), ErrorCode::Io);
        assert!(err.fix_suggestion().is_some());
    }

    #[test]
    fn test_format_error_with_suggestion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: EngineError = io_err.into();
        let formatted = format_error_with_suggestion(&err);
        assert!(formatted.contains("Fix:"));
    }
}
