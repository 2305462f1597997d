//! Command executor
//!
//! Binds each role to a configured command line (`roleCommands` in
//! `maestro.yaml`). The command runs in a scratch directory with the task
//! context in environment variables; expected artifacts are collected from
//! the scratch directory by glob after the command exits. The child is
//! killed once the request's timeout elapses.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use wait_timeout::ChildExt;

use super::{EmittedArtifact, ExecOutcome, ExecRequest, Executor, ExecutorError};
use crate::types::RoleId;

pub struct CommandExecutor {
    role_commands: HashMap<RoleId, String>,
}

impl CommandExecutor {
    pub fn new(role_commands: HashMap<RoleId, String>) -> Self {
        Self { role_commands }
    }

    fn scratch_dir(task_id: &str) -> PathBuf {
        std::env::temp_dir().join(format!("maestro-{task_id}-{}", Uuid::new_v4()))
    }

    /// Collect artifacts matching the expected patterns from the scratch dir
    fn collect_artifacts(
        scratch: &std::path::Path,
        patterns: &[String],
    ) -> Vec<EmittedArtifact> {
        let mut artifacts = Vec::new();
        for pattern in patterns {
            let full = scratch.join(pattern);
            let Some(full) = full.to_str() else { continue };
            let Ok(paths) = glob::glob(full) else { continue };
            for path in paths.flatten() {
                let Ok(bytes) = std::fs::read(&path) else {
                    continue;
                };
                let Ok(relative) = path.strip_prefix(scratch) else {
                    continue;
                };
                artifacts.push(EmittedArtifact {
                    relative_path: relative.to_string_lossy().into_owned(),
                    bytes,
                });
            }
        }
        artifacts
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    fn name(&self) -> &str {
        "command"
    }

    async fn execute(
        &self,
        request: ExecRequest,
        cancel: CancellationToken,
    ) -> Result<ExecOutcome, ExecutorError> {
        let command_line = self
            .role_commands
            .get(&request.role)
            .cloned()
            .ok_or_else(|| ExecutorError::Spawn {
                role: request.role,
                reason: "no roleCommands entry for this role".to_string(),
            })?;

        let scratch = Self::scratch_dir(request.task_id.as_str());
        std::fs::create_dir_all(&scratch).map_err(|e| ExecutorError::Spawn {
            role: request.role,
            reason: e.to_string(),
        })?;

        let task_id = request.task_id.clone();
        let role = request.role;
        let timeout = request.timeout;
        let prompt = request.prompt.clone();
        let attempt = request.attempt;
        let patterns = request.expected_artifacts.clone();
        let scratch_clone = scratch.clone();

        let work = tokio::task::spawn_blocking(move || {
            let mut child = Command::new("sh")
                .arg("-c")
                .arg(&command_line)
                .current_dir(&scratch_clone)
                .env("MAESTRO_TASK_ID", task_id.as_str())
                .env("MAESTRO_ROLE", role.as_str())
                .env("MAESTRO_PROMPT", &prompt)
                .env("MAESTRO_ATTEMPT", attempt.to_string())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .map_err(|e| ExecutorError::Spawn {
                    role,
                    reason: e.to_string(),
                })?;

            match child.wait_timeout(timeout) {
                Ok(Some(status)) => {
                    let mut stdout = String::new();
                    if let Some(mut pipe) = child.stdout.take() {
                        use std::io::Read;
                        let _ = pipe.read_to_string(&mut stdout);
                    }
                    let mut stderr = String::new();
                    if let Some(mut pipe) = child.stderr.take() {
                        use std::io::Read;
                        let _ = pipe.read_to_string(&mut stderr);
                    }

                    if status.success() {
                        let artifacts = Self::collect_artifacts(&scratch_clone, &patterns);
                        Ok(ExecOutcome {
                            output: stdout.trim().to_string(),
                            artifacts,
                        })
                    } else {
                        let message = if stderr.trim().is_empty() {
                            format!("command exited with code {}", status.code().unwrap_or(-1))
                        } else {
                            stderr.trim().to_string()
                        };
                        Err(ExecutorError::Failed { task_id, message })
                    }
                }
                Ok(None) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    Err(ExecutorError::Timeout {
                        task_id,
                        after: timeout,
                    })
                }
                Err(e) => Err(ExecutorError::Failed {
                    task_id,
                    message: e.to_string(),
                }),
            }
        });

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(ExecutorError::Cancelled),
            joined = work => match joined {
                Ok(result) => result,
                Err(e) => Err(ExecutorError::Failed {
                    task_id: request.task_id.clone(),
                    message: format!("executor task panicked: {e}"),
                }),
            },
        };

        let _ = std::fs::remove_dir_all(&scratch);
        result
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskId;
    use std::time::Duration;

    fn request(task_id: &str, artifacts: Vec<String>) -> ExecRequest {
        ExecRequest {
            task_id: TaskId::new(task_id).unwrap(),
            role: RoleId::Backend,
            prompt: "write the file".into(),
            attempt: 1,
            expected_artifacts: artifacts,
            timeout: Duration::from_secs(10),
        }
    }

    fn executor(command: &str) -> CommandExecutor {
        let mut commands = HashMap::new();
        commands.insert(RoleId::Backend, command.to_string());
        CommandExecutor::new(commands)
    }

    #[tokio::test]
    async fn test_runs_command_and_captures_stdout() {
        let executor = executor("echo done-$MAESTRO_TASK_ID");
        let outcome = executor
            .execute(request("BE-1", vec![]), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.output, "done-BE-1");
    }

    #[tokio::test]
    async fn test_collects_expected_artifacts_from_scratch_dir() {
        let executor = executor("printf data > out.txt && echo ok");
        let outcome = executor
            .execute(request("BE-1", vec!["out.txt".into()]), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.artifacts.len(), 1);
        assert_eq!(outcome.artifacts[0].bytes, b"data");
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails() {
        let executor = executor("echo boom >&2; exit 3");
        let err = executor
            .execute(request("BE-1", vec![]), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Failed { ref message, .. } if message.contains("boom")));
    }

    #[tokio::test]
    async fn test_timeout_kills_child() {
        let executor = executor("sleep 30");
        let mut req = request("BE-1", vec![]);
        req.timeout = Duration::from_millis(100);
        let err = executor
            .execute(req, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_unbound_role_rejected() {
        let executor = CommandExecutor::new(HashMap::new());
        let err = executor
            .execute(request("BE-1", vec![]), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Spawn { .. }));
    }
}
