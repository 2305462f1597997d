//! # Executor Abstraction Layer
//!
//! Trait and implementations for role executors.
//!
//! ## Overview
//!
//! The executor module defines how maestro invokes worker agents:
//!
//! - [`Executor`] - Core trait for executing a composed task request
//! - [`CommandExecutor`] - Runs a configured command per role
//! - [`MockExecutor`] - Test executor with scripted outcomes
//!
//! Concrete LLM providers stay behind this trait; the engine never talks to
//! an SDK directly. Executors must honor cancellation within the scheduler's
//! grace period.
//!
//! ## Creating Executors
//!
//! Use [`create_executor`] to instantiate an executor by name:
//!
//! ```rust
//! use maestro::executor::create_executor;
//! use maestro::config::EngineConfig;
//!
//! let mock = create_executor("mock", &EngineConfig::default());
//! assert!(mock.is_ok());
//!
//! let unknown = create_executor("quantum", &EngineConfig::default());
//! assert!(unknown.is_err());
//! ```

mod command;
mod mock;

pub use command::CommandExecutor;
pub use mock::{MockExecutor, ScriptedOutcome};

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::ErrorCode;
use crate::types::{RoleId, TaskId};

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Unknown executor: '{0}'. Available: mock, command")]
    Unknown(String),

    #[error("Failed to start executor for role {role}: {reason}")]
    Spawn { role: RoleId, reason: String },

    #[error("Executor failed for task {task_id}: {message}")]
    Failed { task_id: TaskId, message: String },

    #[error("Executor timed out for task {task_id} after {after:?}")]
    Timeout { task_id: TaskId, after: Duration },

    #[error("Execution cancelled")]
    Cancelled,
}

impl ExecutorError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ExecutorError::Unknown(_) => ErrorCode::Validation,
            ExecutorError::Spawn { .. } => ErrorCode::Executor,
            ExecutorError::Failed { .. } => ErrorCode::Executor,
            ExecutorError::Timeout { .. } => ErrorCode::Timeout,
            ExecutorError::Cancelled => ErrorCode::Cancelled,
        }
    }
}

// ============================================================================
// REQUEST / OUTCOME
// ============================================================================

/// Composed request handed to an executor
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub task_id: TaskId,
    pub role: RoleId,
    /// Fully composed prompt (role template + context + task metadata)
    pub prompt: String,
    /// 1-based attempt number
    pub attempt: u32,
    /// Relative paths (or globs) the task is expected to produce
    pub expected_artifacts: Vec<String>,
    /// Hard deadline for this invocation
    pub timeout: Duration,
}

/// Artifact emitted by an executor, persisted by the artifact writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmittedArtifact {
    pub relative_path: String,
    pub bytes: Vec<u8>,
}

/// Result of a successful executor invocation
#[derive(Debug, Clone, Default)]
pub struct ExecOutcome {
    /// Primary textual output; an empty output fails shape validation
    pub output: String,
    pub artifacts: Vec<EmittedArtifact>,
}

impl ExecOutcome {
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            artifacts: Vec::new(),
        }
    }

    pub fn with_artifact(mut self, relative_path: impl Into<String>, bytes: Vec<u8>) -> Self {
        self.artifacts.push(EmittedArtifact {
            relative_path: relative_path.into(),
            bytes,
        });
        self
    }
}

// ============================================================================
// EXECUTOR TRAIT
// ============================================================================

/// Core trait that all role executors implement
///
/// The executor receives a fully composed request; it owns nothing about
/// prompt construction or artifact persistence. Implementations must return
/// promptly once `cancel` fires.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Executor name (e.g. "mock", "command")
    fn name(&self) -> &str;

    /// Execute one task attempt
    async fn execute(
        &self,
        request: ExecRequest,
        cancel: CancellationToken,
    ) -> Result<ExecOutcome, ExecutorError>;

    /// Check if this executor can run in the current environment
    fn is_available(&self) -> bool {
        true
    }
}

// ============================================================================
// FACTORY
// ============================================================================

/// Create an executor instance by name
///
/// | Name | Description |
/// |------|-------------|
/// | `mock` | Scripted outcomes, failure injection; default for tests |
/// | `command` | Runs `roleCommands` entries with a wait timeout |
pub fn create_executor(
    name: &str,
    config: &EngineConfig,
) -> Result<Box<dyn Executor>, ExecutorError> {
    match name.to_lowercase().as_str() {
        "mock" => Ok(Box::new(MockExecutor::new())),
        "command" => Ok(Box::new(CommandExecutor::new(config.role_commands.clone()))),
        other => Err(ExecutorError::Unknown(other.to_string())),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_executor_mock() {
        let executor = create_executor("mock", &EngineConfig::default()).unwrap();
        assert_eq!(executor.name(), "mock");
        assert!(executor.is_available());
    }

    #[test]
    fn test_create_executor_command() {
        let executor = create_executor("command", &EngineConfig::default()).unwrap();
        assert_eq!(executor.name(), "command");
    }

    #[test]
    fn test_create_executor_unknown() {
        let result = create_executor("quantum", &EngineConfig::default());
        assert!(matches!(result, Err(ExecutorError::Unknown(_))));
    }

    #[test]
    fn test_outcome_builder() {
        let outcome = ExecOutcome::text("done").with_artifact("out/a.txt", b"abc".to_vec());
        assert_eq!(outcome.output, "done");
        assert_eq!(outcome.artifacts.len(), 1);
        assert_eq!(outcome.artifacts[0].relative_path, "out/a.txt");
    }

    #[test]
    fn test_error_codes() {
        let t = ExecutorError::Timeout {
            task_id: TaskId::new("A").unwrap(),
            after: Duration::from_secs(1),
        };
        assert_eq!(t.code(), ErrorCode::Timeout);
        assert_eq!(ExecutorError::Cancelled.code(), ErrorCode::Cancelled);
    }
}
