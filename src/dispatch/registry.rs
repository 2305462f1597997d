//! Role and tool registries
//!
//! Both registries are typed and populated at startup: configuration names
//! map to pre-registered constructors, never to dynamic loading. A role
//! declares the tool capabilities it may consume; a tool implementation
//! declares the capability it provides. Dispatch refuses calls outside the
//! declared set.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::template::{role_preamble, DEFAULT_TEMPLATE};
use super::DispatchError;
use crate::memory::{MemoryEngine, MemoryError};
use crate::types::{RoleId, Sensitivity};

// ============================================================================
// CAPABILITIES
// ============================================================================

/// Tool capabilities a role may be granted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCapability {
    DatabaseQuery,
    RepoCommit,
    TestRun,
    MemoryRead,
    MemoryWrite,
    /// Required on top of MemoryWrite to mutate SECRET records
    SecretWrite,
}

// ============================================================================
// ROLE REGISTRY
// ============================================================================

/// One role's executor-facing profile
#[derive(Debug, Clone)]
pub struct RoleProfile {
    pub role: RoleId,
    pub capabilities: Vec<ToolCapability>,
    /// Prompt template (data); rendered with the fail-closed placeholder set
    pub template: String,
}

/// Registry mapping each role to its profile
#[derive(Debug, Clone)]
pub struct RoleRegistry {
    profiles: HashMap<RoleId, RoleProfile>,
}

impl RoleRegistry {
    /// The builtin eight-role registry
    pub fn builtin() -> Self {
        use RoleId::*;
        use ToolCapability::*;

        let caps = |role: RoleId| -> Vec<ToolCapability> {
            match role {
                Coordinator => vec![MemoryRead, MemoryWrite, SecretWrite],
                TechnicalLead => vec![MemoryRead, MemoryWrite, RepoCommit],
                Backend => vec![MemoryRead, DatabaseQuery, RepoCommit, TestRun],
                Frontend => vec![MemoryRead, RepoCommit, TestRun],
                Ux => vec![MemoryRead],
                Product => vec![MemoryRead, MemoryWrite],
                Qa => vec![MemoryRead, TestRun],
                Documentation => vec![MemoryRead],
            }
        };

        let profiles = RoleId::ALL
            .into_iter()
            .map(|role| {
                (
                    role,
                    RoleProfile {
                        role,
                        capabilities: caps(role),
                        template: format!("{}{}", role_preamble(role), DEFAULT_TEMPLATE),
                    },
                )
            })
            .collect();

        Self { profiles }
    }

    pub fn profile(&self, role: RoleId) -> Result<&RoleProfile, DispatchError> {
        self.profiles
            .get(&role)
            .ok_or(DispatchError::UnboundRole { role })
    }

    /// Replace one role's template (templates are configuration, not code)
    pub fn set_template(&mut self, role: RoleId, template: String) {
        if let Some(profile) = self.profiles.get_mut(&role) {
            profile.template = template;
        }
    }

    pub fn has_capability(&self, role: RoleId, capability: ToolCapability) -> bool {
        self.profiles
            .get(&role)
            .map(|p| p.capabilities.contains(&capability))
            .unwrap_or(false)
    }
}

// ============================================================================
// TOOL TRAIT & REGISTRY
// ============================================================================

/// A tool invocable synchronously from an executor
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn capability(&self) -> ToolCapability;
    fn call(&self, args: &serde_json::Value) -> Result<serde_json::Value, DispatchError>;
}

/// Typed tool registry populated at startup
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Tool>, DispatchError> {
        self.tools
            .get(name)
            .cloned()
            .ok_or_else(|| DispatchError::UnknownTool {
                tool: name.to_string(),
            })
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }
}

// ============================================================================
// MEMORY TOOLS
// ============================================================================

/// Read-only memory access for executors
pub struct MemoryReadTool {
    engine: Arc<MemoryEngine>,
}

impl MemoryReadTool {
    pub fn new(engine: Arc<MemoryEngine>) -> Self {
        Self { engine }
    }
}

impl Tool for MemoryReadTool {
    fn name(&self) -> &str {
        "memory_read"
    }

    fn capability(&self) -> ToolCapability {
        ToolCapability::MemoryRead
    }

    fn call(&self, args: &serde_json::Value) -> Result<serde_json::Value, DispatchError> {
        let domain = args["domain"].as_str().unwrap_or_default();
        let key = args["key"].as_str().unwrap_or_default();
        match self.engine.get(domain, key) {
            Ok(content) => Ok(serde_json::json!({ "content": content })),
            Err(e) => Ok(serde_json::json!({ "error": e.to_string() })),
        }
    }
}

/// Memory mutation for executors; SECRET writes need the explicit grant
pub struct MemoryWriteTool {
    engine: Arc<MemoryEngine>,
    allow_secret: bool,
}

impl MemoryWriteTool {
    pub fn new(engine: Arc<MemoryEngine>, allow_secret: bool) -> Self {
        Self {
            engine,
            allow_secret,
        }
    }
}

impl Tool for MemoryWriteTool {
    fn name(&self) -> &str {
        if self.allow_secret {
            "memory_write_secret"
        } else {
            "memory_write"
        }
    }

    /// The secret-granted instance requires the stronger capability
    fn capability(&self) -> ToolCapability {
        if self.allow_secret {
            ToolCapability::SecretWrite
        } else {
            ToolCapability::MemoryWrite
        }
    }

    fn call(&self, args: &serde_json::Value) -> Result<serde_json::Value, DispatchError> {
        let domain = args["domain"].as_str().unwrap_or_default();
        let key = args["key"].as_str().unwrap_or_default();
        let content = args["content"].as_str().unwrap_or_default();
        let sensitivity = match args["sensitivity"].as_str() {
            Some("PUBLIC") => Sensitivity::Public,
            Some("SECRET") => Sensitivity::Secret,
            _ => Sensitivity::Internal,
        };

        if sensitivity == Sensitivity::Secret && !self.allow_secret {
            let err = MemoryError::CapabilityDenied {
                tool: self.name().to_string(),
            };
            return Ok(serde_json::json!({ "error": err.to_string() }));
        }

        match self.engine.put(domain, key, content, sensitivity) {
            Ok(record_id) => Ok(serde_json::json!({ "recordId": record_id })),
            Err(e) => Ok(serde_json::json!({ "error": e.to_string() })),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;

    #[test]
    fn test_builtin_registry_covers_all_roles() {
        let registry = RoleRegistry::builtin();
        for role in RoleId::ALL {
            let profile = registry.profile(role).unwrap();
            assert!(profile.capabilities.contains(&ToolCapability::MemoryRead));
            assert!(profile.template.contains("{task_id}"));
        }
    }

    #[test]
    fn test_capability_checks() {
        let registry = RoleRegistry::builtin();
        assert!(registry.has_capability(RoleId::Backend, ToolCapability::DatabaseQuery));
        assert!(!registry.has_capability(RoleId::Ux, ToolCapability::RepoCommit));
        assert!(registry.has_capability(RoleId::Coordinator, ToolCapability::SecretWrite));
        assert!(!registry.has_capability(RoleId::Backend, ToolCapability::SecretWrite));
    }

    #[test]
    fn test_template_override() {
        let mut registry = RoleRegistry::builtin();
        registry.set_template(RoleId::Qa, "QA check {task_id}".to_string());
        assert_eq!(
            registry.profile(RoleId::Qa).unwrap().template,
            "QA check {task_id}"
        );
    }

    #[test]
    fn test_tool_registry_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(
            MemoryEngine::open(
                dir.path(),
                MemoryConfig {
                    passphrase: Some("t".into()),
                    ..MemoryConfig::default()
                },
            )
            .unwrap(),
        );

        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(MemoryReadTool::new(Arc::clone(&engine))));
        assert!(tools.get("memory_read").is_ok());
        assert!(matches!(
            tools.get("teleport"),
            Err(DispatchError::UnknownTool { .. })
        ));
    }

    #[test]
    fn test_secret_write_requires_grant() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(
            MemoryEngine::open(
                dir.path(),
                MemoryConfig {
                    passphrase: Some("t".into()),
                    ..MemoryConfig::default()
                },
            )
            .unwrap(),
        );

        let ungranted = MemoryWriteTool::new(Arc::clone(&engine), false);
        let args = serde_json::json!({
            "domain": "d", "key": "k", "content": "v", "sensitivity": "SECRET"
        });
        let result = ungranted.call(&args).unwrap();
        assert!(result["error"].as_str().unwrap().contains("capability"));

        let granted = MemoryWriteTool::new(Arc::clone(&engine), true);
        let result = granted.call(&args).unwrap();
        assert!(result["recordId"].is_string());
        assert_eq!(engine.get("d", "k").unwrap(), "v");
    }

    #[test]
    fn test_memory_read_tool() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(
            MemoryEngine::open(
                dir.path(),
                MemoryConfig {
                    passphrase: Some("t".into()),
                    ..MemoryConfig::default()
                },
            )
            .unwrap(),
        );
        engine.put("d", "k", "stored", Sensitivity::Internal).unwrap();

        let tool = MemoryReadTool::new(engine);
        let result = tool
            .call(&serde_json::json!({ "domain": "d", "key": "k" }))
            .unwrap();
        assert_eq!(result["content"], "stored");
    }
}
