//! # Agent Dispatch
//!
//! For a READY task, compose its execution request and invoke the bound
//! executor:
//!
//! 1. Query the memory engine with `domains = context_topics`, `k = 8`, and a
//!    query derived from title + description; fold top snippets into the
//!    prompt up to a fixed budget.
//! 2. Render the role template (data, fail-closed placeholders).
//! 3. Invoke the executor with a cancellable handle.
//! 4. Validate the result shape: non-empty output, artifact paths inside the
//!    task's output directory, no traversal. Shape violations surface as
//!    dispatch errors, which the scheduler turns into NEEDS_REWORK without
//!    invoking QA.
//!
//! Tool calls go through [`Dispatcher::call_tool`], which enforces the role's
//! declared capabilities and traces `(task_id, tool, arguments_hash,
//! duration, outcome)` into the audit log.

pub mod registry;
pub mod template;

pub use registry::{
    MemoryReadTool, MemoryWriteTool, RoleProfile, RoleRegistry, Tool, ToolCapability, ToolRegistry,
};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use crate::artifact::validate_relative_path;
use crate::audit::{AuditLog, EntryKind};
use crate::error::EngineError;
use crate::executor::{ExecOutcome, ExecRequest, Executor};
use crate::memory::MemoryEngine;
use crate::task::TaskSpec;
use crate::types::RoleId;

/// Snippets fetched per dispatch
const CONTEXT_K: usize = 8;

/// Budget for context folded into the prompt, in characters
const CONTEXT_BUDGET: usize = 4000;

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Template references unknown placeholder '{placeholder}'")]
    UnknownPlaceholder { placeholder: String },

    #[error("Executor result is missing required field '{field}'")]
    MissingField { field: String },

    #[error("Executor emitted unsafe artifact path '{path}'")]
    UnsafePath { path: String },

    #[error("Role {role} has no executor binding")]
    UnboundRole { role: RoleId },

    #[error("Unknown tool '{tool}'")]
    UnknownTool { tool: String },
}

// ============================================================================
// DISPATCHER
// ============================================================================

/// Composes requests and routes them to the bound executor
pub struct Dispatcher {
    executor: Arc<dyn Executor>,
    memory: Arc<MemoryEngine>,
    roles: RoleRegistry,
    tools: ToolRegistry,
    audit: AuditLog,
}

impl Dispatcher {
    pub fn new(
        executor: Arc<dyn Executor>,
        memory: Arc<MemoryEngine>,
        roles: RoleRegistry,
        tools: ToolRegistry,
        audit: AuditLog,
    ) -> Self {
        Self {
            executor,
            memory,
            roles,
            tools,
            audit,
        }
    }

    /// Compose the context block for one task from domain-scoped retrieval
    fn compose_context(&self, spec: &TaskSpec) -> String {
        let domains: Vec<String> = spec.context_topics.iter().cloned().collect();
        if domains.is_empty() {
            return "(no context topics declared)".to_string();
        }

        let hits = self.memory.search(&domains, &spec.query_text(), CONTEXT_K);
        if hits.is_empty() {
            return "(no matching context records)".to_string();
        }

        let mut block = String::new();
        for hit in hits {
            let snippet = format!("- [{}/{}] {}\n", hit.domain, hit.key, hit.snippet);
            if block.len() + snippet.len() > CONTEXT_BUDGET {
                break;
            }
            block.push_str(&snippet);
        }
        block
    }

    /// Build the prompt for one attempt via the role template
    pub fn compose_prompt(&self, spec: &TaskSpec, attempt: u32) -> Result<String, DispatchError> {
        let profile = self.roles.profile(spec.owner)?;
        let vars = HashMap::from([
            ("task_id", spec.id.to_string()),
            ("title", spec.title.clone()),
            ("description", spec.description.clone().unwrap_or_default()),
            ("role", spec.owner.to_string()),
            ("context", self.compose_context(spec)),
            ("attempt", attempt.to_string()),
        ]);
        template::render(&profile.template, &vars)
    }

    /// Dispatch one attempt; shape-validates the outcome before returning
    pub async fn dispatch(
        &self,
        spec: &TaskSpec,
        attempt: u32,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<ExecOutcome, EngineError> {
        let prompt = self.compose_prompt(spec, attempt)?;

        let request = ExecRequest {
            task_id: spec.id.clone(),
            role: spec.owner,
            prompt,
            attempt,
            expected_artifacts: spec.expected_artifacts.clone(),
            timeout,
        };

        tracing::debug!(
            task_id = %spec.id,
            role = %spec.owner,
            attempt,
            "dispatching task"
        );

        let outcome = self.executor.execute(request, cancel).await?;
        self.validate_shape(&outcome)?;
        Ok(outcome)
    }

    /// Result-shape validation: required fields present, paths safe
    fn validate_shape(&self, outcome: &ExecOutcome) -> Result<(), DispatchError> {
        if outcome.output.trim().is_empty() {
            return Err(DispatchError::MissingField {
                field: "output".to_string(),
            });
        }
        for artifact in &outcome.artifacts {
            if validate_relative_path(&artifact.relative_path).is_err() {
                return Err(DispatchError::UnsafePath {
                    path: artifact.relative_path.clone(),
                });
            }
        }
        Ok(())
    }

    /// Invoke a registered tool on behalf of a task, enforcing the role's
    /// capability set and tracing the call
    pub fn call_tool(
        &self,
        spec: &TaskSpec,
        tool_name: &str,
        args: &serde_json::Value,
    ) -> Result<serde_json::Value, DispatchError> {
        let tool = self.tools.get(tool_name)?;
        if !self.roles.has_capability(spec.owner, tool.capability()) {
            return Err(DispatchError::UnknownTool {
                tool: format!("{tool_name} (not granted to {})", spec.owner),
            });
        }

        let arguments_hash = {
            let serialized = serde_json::to_vec(args).unwrap_or_default();
            let digest = Sha256::digest(&serialized);
            format!("{:x}", digest)[..12].to_string()
        };

        let started = Instant::now();
        let result = tool.call(args);
        let duration = started.elapsed();

        self.audit.record(EntryKind::ToolCalled {
            task_id: Arc::from(spec.id.as_str()),
            tool: tool_name.to_string(),
            arguments_hash: arguments_hash.clone(),
            duration_ms: duration.as_millis() as u64,
            outcome: match &result {
                Ok(_) => "ok".to_string(),
                Err(e) => format!("error: {e}"),
            },
        });
        tracing::debug!(
            task_id = %spec.id,
            tool = tool_name,
            arguments_hash,
            duration_ms = duration.as_millis() as u64,
            "tool call"
        );

        result
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::executor::{MockExecutor, ScriptedOutcome};
    use crate::types::Sensitivity;

    fn memory(dir: &std::path::Path) -> Arc<MemoryEngine> {
        Arc::new(
            MemoryEngine::open(
                dir,
                MemoryConfig {
                    passphrase: Some("t".into()),
                    ..MemoryConfig::default()
                },
            )
            .unwrap(),
        )
    }

    fn spec(yaml: &str) -> TaskSpec {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn dispatcher(dir: &std::path::Path) -> (Dispatcher, Arc<MockExecutor>) {
        let executor = Arc::new(MockExecutor::new());
        let memory = memory(dir);
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(MemoryReadTool::new(Arc::clone(&memory))));
        let dispatcher = Dispatcher::new(
            Arc::clone(&executor) as Arc<dyn Executor>,
            memory,
            RoleRegistry::builtin(),
            tools,
            AuditLog::new(),
        );
        (dispatcher, executor)
    }

    #[tokio::test]
    async fn test_dispatch_composes_context_into_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, executor) = dispatcher(dir.path());
        dispatcher
            .memory
            .put("db", "schema", "orders table with totals", Sensitivity::Internal)
            .unwrap();

        let spec = spec(
            "id: BE-1\ntitle: \"orders endpoint\"\nowner: backend\npriority: HIGH\ncontextTopics: [db]\n",
        );
        dispatcher
            .dispatch(&spec, 1, Duration::from_secs(5), CancellationToken::new())
            .await
            .unwrap();

        let request = executor.requests().pop().unwrap();
        assert!(request.prompt.contains("orders table with totals"));
        assert!(request.prompt.contains("Task BE-1"));
        assert!(request.prompt.contains("backend"));
    }

    #[tokio::test]
    async fn test_empty_output_is_shape_violation() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, executor) = dispatcher(dir.path());
        executor.script(
            "BE-1",
            ScriptedOutcome::Succeed {
                output: "   ".into(),
                artifacts: vec![],
            },
        );

        let spec = spec("id: BE-1\ntitle: \"x\"\nowner: backend\npriority: LOW\n");
        let err = dispatcher
            .dispatch(&spec, 1, Duration::from_secs(5), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Dispatch(DispatchError::MissingField { .. })
        ));
    }

    #[tokio::test]
    async fn test_traversal_artifact_is_shape_violation() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, executor) = dispatcher(dir.path());
        executor.script(
            "BE-1",
            ScriptedOutcome::Succeed {
                output: "done".into(),
                artifacts: vec![("../../etc/passwd".into(), b"x".to_vec())],
            },
        );

        let spec = spec("id: BE-1\ntitle: \"x\"\nowner: backend\npriority: LOW\n");
        let err = dispatcher
            .dispatch(&spec, 1, Duration::from_secs(5), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Dispatch(DispatchError::UnsafePath { .. })
        ));
    }

    #[tokio::test]
    async fn test_tool_call_traced_and_gated() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, _) = dispatcher(dir.path());
        dispatcher
            .memory
            .put("d", "k", "value", Sensitivity::Internal)
            .unwrap();

        let spec = spec("id: BE-1\ntitle: \"x\"\nowner: backend\npriority: LOW\n");
        let result = dispatcher
            .call_tool(&spec, "memory_read", &serde_json::json!({"domain": "d", "key": "k"}))
            .unwrap();
        assert_eq!(result["content"], "value");

        // Traced
        let entries = dispatcher.audit.entries();
        assert!(entries
            .iter()
            .any(|e| matches!(&e.kind, EntryKind::ToolCalled { tool, outcome, .. } if tool == "memory_read" && outcome == "ok")));

        // Unknown tool rejected
        assert!(dispatcher
            .call_tool(&spec, "teleport", &serde_json::json!({}))
            .is_err());
    }

    #[tokio::test]
    async fn test_capability_enforced_per_role() {
        let dir = tempfile::tempdir().unwrap();
        let executor = Arc::new(MockExecutor::new());
        let memory = memory(dir.path());
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(MemoryWriteTool::new(Arc::clone(&memory), false)));
        let dispatcher = Dispatcher::new(
            executor as Arc<dyn Executor>,
            memory,
            RoleRegistry::builtin(),
            tools,
            AuditLog::new(),
        );

        // documentation has MemoryRead only, not MemoryWrite
        let spec = spec("id: DOC-1\ntitle: \"x\"\nowner: documentation\npriority: LOW\n");
        let err = dispatcher
            .call_tool(
                &spec,
                "memory_write",
                &serde_json::json!({"domain": "d", "key": "k", "content": "v"}),
            )
            .unwrap_err();
        assert!(matches!(err, DispatchError::UnknownTool { .. }));
    }
}
