//! Engine assembly
//!
//! Wires the subsystems into a ready-to-run [`Scheduler`]: load + validate
//! task definitions, build the DAG, open the memory engine, bind the
//! executor, and register the builtin tools. There are no globals; everything
//! hangs off the returned scheduler and is torn down when it drops.

use std::path::Path;
use std::sync::Arc;

use crate::artifact::ArtifactWriter;
use crate::audit::AuditLog;
use crate::config::EngineConfig;
use crate::dispatch::{
    Dispatcher, MemoryReadTool, MemoryWriteTool, RoleRegistry, ToolRegistry,
};
use crate::error::EngineError;
use crate::executor::{create_executor, Executor};
use crate::graph::TaskGraph;
use crate::hitl::{FailureHistory, HitlEngine};
use crate::memory::MemoryEngine;
use crate::schedule::Scheduler;
use crate::store::{load_task_specs, TaskStore};

/// Load a run directory and assemble a scheduler with the configured executor
pub fn bootstrap(
    run_dir: &Path,
    state_dir: &Path,
    config: EngineConfig,
) -> Result<Scheduler, EngineError> {
    let executor: Arc<dyn Executor> = Arc::from(create_executor(&config.executor, &config)?);
    bootstrap_with_executor(run_dir, state_dir, config, executor)
}

/// Assembly with an injected executor (tests script a mock through this)
pub fn bootstrap_with_executor(
    run_dir: &Path,
    state_dir: &Path,
    config: EngineConfig,
    executor: Arc<dyn Executor>,
) -> Result<Scheduler, EngineError> {
    config.validate()?;

    let specs = load_task_specs(run_dir)?;
    let graph = TaskGraph::build(&specs)?;

    std::fs::create_dir_all(state_dir)?;
    let audit = AuditLog::with_sink(state_dir);
    let store = Arc::new(TaskStore::open(specs, state_dir, audit.clone())?);

    let memory = Arc::new(MemoryEngine::open(
        &state_dir.join("memory"),
        config.memory.clone(),
    )?);

    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(MemoryReadTool::new(Arc::clone(&memory))));
    tools.register(Arc::new(MemoryWriteTool::new(Arc::clone(&memory), false)));
    tools.register(Arc::new(MemoryWriteTool::new(Arc::clone(&memory), true)));

    let dispatcher = Arc::new(Dispatcher::new(
        executor,
        Arc::clone(&memory),
        RoleRegistry::builtin(),
        tools,
        audit.clone(),
    ));

    let artifacts = Arc::new(ArtifactWriter::new(state_dir));
    let history = FailureHistory::open(state_dir, config.hitl.failure_decay_half_life);
    let hitl = Arc::new(HitlEngine::new(config.hitl.clone(), history));

    Ok(Scheduler::new(
        store,
        graph,
        dispatcher,
        artifacts,
        hitl,
        memory,
        config,
        audit,
        Some(state_dir.to_path_buf()),
    ))
}

/// Load + validate only; used by `maestro validate`
pub fn validate_run_dir(run_dir: &Path) -> Result<usize, EngineError> {
    let config = EngineConfig::load(run_dir)?;
    config.validate()?;
    let specs = load_task_specs(run_dir)?;
    let graph = TaskGraph::build(&specs)?;
    Ok(graph.len())
}

// ============================================================================
// TESTS
// ============================================================================
