//! Mock executor for testing
//!
//! Returns configurable outcomes without invoking anything real. Essential
//! for unit tests, the end-to-end scenario suite, and CI. Outcomes are
//! scripted per task id and consumed FIFO; tasks without a script fall back
//! to a deterministic success that emits every expected artifact.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use super::{EmittedArtifact, ExecOutcome, ExecRequest, Executor, ExecutorError};

/// One scripted behavior, consumed per attempt
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    /// Succeed with this output and these artifacts
    Succeed {
        output: String,
        artifacts: Vec<(String, Vec<u8>)>,
    },
    /// Fail with an executor error
    Fail { message: String },
    /// Sleep, then succeed (for overlap and timeout tests)
    SleepThenSucceed { delay: Duration, output: String },
    /// Block until cancelled (for cancellation tests)
    HangUntilCancelled,
}

/// Mock executor with per-task scripted outcomes
pub struct MockExecutor {
    scripts: DashMap<String, VecDeque<ScriptedOutcome>>,
    /// Every request seen, for assertions
    requests: Mutex<Vec<ExecRequest>>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self {
            scripts: DashMap::new(),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue one scripted outcome for a task id
    pub fn script(&self, task_id: &str, outcome: ScriptedOutcome) {
        self.scripts
            .entry(task_id.to_string())
            .or_default()
            .push_back(outcome);
    }

    /// Convenience: fail `n` attempts, then fall through to the default
    pub fn fail_times(&self, task_id: &str, n: u32) {
        for i in 0..n {
            self.script(
                task_id,
                ScriptedOutcome::Fail {
                    message: format!("injected failure {}", i + 1),
                },
            );
        }
    }

    /// All requests made to this executor
    pub fn requests(&self) -> Vec<ExecRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    /// Number of invocations for one task
    pub fn invocations(&self, task_id: &str) -> usize {
        self.requests
            .lock()
            .expect("requests lock")
            .iter()
            .filter(|r| r.task_id.as_str() == task_id)
            .count()
    }

    fn default_outcome(request: &ExecRequest) -> ExecOutcome {
        let artifacts = request
            .expected_artifacts
            .iter()
            .map(|path| EmittedArtifact {
                relative_path: path.clone(),
                bytes: format!("mock artifact for {}:{path}", request.task_id).into_bytes(),
            })
            .collect();
        ExecOutcome {
            output: format!("[mock:{}] completed {}", request.role, request.task_id),
            artifacts,
        }
    }
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for MockExecutor {
    fn name(&self) -> &str {
        "mock"
    }

    async fn execute(
        &self,
        request: ExecRequest,
        cancel: CancellationToken,
    ) -> Result<ExecOutcome, ExecutorError> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());

        let scripted = self
            .scripts
            .get_mut(request.task_id.as_str())
            .and_then(|mut queue| queue.pop_front());

        match scripted {
            None => Ok(Self::default_outcome(&request)),
            Some(ScriptedOutcome::Succeed { output, artifacts }) => Ok(ExecOutcome {
                output,
                artifacts: artifacts
                    .into_iter()
                    .map(|(relative_path, bytes)| EmittedArtifact {
                        relative_path,
                        bytes,
                    })
                    .collect(),
            }),
            Some(ScriptedOutcome::Fail { message }) => Err(ExecutorError::Failed {
                task_id: request.task_id.clone(),
                message,
            }),
            Some(ScriptedOutcome::SleepThenSucceed { delay, output }) => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(ExecutorError::Cancelled),
                    _ = tokio::time::sleep(delay) => Ok(ExecOutcome::text(output)),
                }
            }
            Some(ScriptedOutcome::HangUntilCancelled) => {
                cancel.cancelled().await;
                Err(ExecutorError::Cancelled)
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RoleId, TaskId};

    fn request(task_id: &str) -> ExecRequest {
        ExecRequest {
            task_id: TaskId::new(task_id).unwrap(),
            role: RoleId::Backend,
            prompt: "do the thing".into(),
            attempt: 1,
            expected_artifacts: vec!["out/report.md".into()],
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_default_outcome_emits_expected_artifacts() {
        let executor = MockExecutor::new();
        let outcome = executor
            .execute(request("BE-1"), CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.output.contains("BE-1"));
        assert_eq!(outcome.artifacts.len(), 1);
        assert_eq!(outcome.artifacts[0].relative_path, "out/report.md");
    }

    #[tokio::test]
    async fn test_scripted_failures_then_default() {
        let executor = MockExecutor::new();
        executor.fail_times("BE-1", 2);

        let cancel = CancellationToken::new();
        assert!(executor.execute(request("BE-1"), cancel.clone()).await.is_err());
        assert!(executor.execute(request("BE-1"), cancel.clone()).await.is_err());
        assert!(executor.execute(request("BE-1"), cancel).await.is_ok());
        assert_eq!(executor.invocations("BE-1"), 3);
    }

    #[tokio::test]
    async fn test_hang_until_cancelled() {
        let executor = std::sync::Arc::new(MockExecutor::new());
        executor.script("BE-1", ScriptedOutcome::HangUntilCancelled);

        let cancel = CancellationToken::new();
        let handle = {
            let executor = std::sync::Arc::clone(&executor);
            let cancel = cancel.clone();
            tokio::spawn(async move { executor.execute(request("BE-1"), cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(ExecutorError::Cancelled)));
    }

    #[tokio::test]
    async fn test_sleep_then_succeed() {
        let executor = MockExecutor::new();
        executor.script(
            "BE-1",
            ScriptedOutcome::SleepThenSucceed {
                delay: Duration::from_millis(10),
                output: "slow but fine".into(),
            },
        );
        let outcome = executor
            .execute(request("BE-1"), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.output, "slow but fine");
    }
}
