//! Task graph builder
//!
//! Compiles the loaded task set into an executable DAG:
//! - adjacency (task -> dependents) and reverse index (task -> dependencies)
//! - topological layers for ready-set seeding
//! - critical path: longest chain weighted by `estimated_effort`
//!
//! The build rejects cycles (Kahn with residual-set check), missing
//! dependencies, and duplicate ids, and aggregates every violation into one
//! error so a single validate run shows the full damage.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::Duration;

use crate::task::TaskSpec;
use crate::types::TaskId;

// ============================================================================
// VIOLATIONS
// ============================================================================

/// One rule violation found while building the graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphViolation {
    DuplicateId { task_id: TaskId },
    MissingDependency { task_id: TaskId, missing: TaskId },
    SelfDependency { task_id: TaskId },
    Cycle { members: Vec<TaskId> },
}

impl std::fmt::Display for GraphViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GraphViolation::DuplicateId { task_id } => {
                write!(f, "duplicate task id '{task_id}'")
            }
            GraphViolation::MissingDependency { task_id, missing } => {
                write!(f, "task '{task_id}' depends on unknown task '{missing}'")
            }
            GraphViolation::SelfDependency { task_id } => {
                write!(f, "task '{task_id}' depends on itself")
            }
            GraphViolation::Cycle { members } => {
                let ids: Vec<&str> = members.iter().map(|t| t.as_str()).collect();
                write!(f, "dependency cycle through [{}]", ids.join(", "))
            }
        }
    }
}

/// Aggregated build failure listing every violation
#[derive(Debug)]
pub struct GraphError {
    pub violations: Vec<GraphViolation>,
}

impl std::error::Error for GraphError {}

impl std::fmt::Display for GraphError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Task graph is invalid ({} violations):", self.violations.len())?;
        for v in &self.violations {
            writeln!(f, "  - {v}")?;
        }
        Ok(())
    }
}

// ============================================================================
// TASK GRAPH
// ============================================================================

/// Immutable-by-default DAG over the loaded tasks
///
/// The only mutation is [`TaskGraph::update_effort`], which recomputes the
/// critical path for the affected subgraph (the changed task and its
/// ancestors) without touching the rest.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    /// task -> tasks that depend on it
    dependents: HashMap<TaskId, Vec<TaskId>>,
    /// task -> its dependencies
    dependencies: HashMap<TaskId, Vec<TaskId>>,
    /// Effort weights driving the critical path
    efforts: HashMap<TaskId, Duration>,
    /// Topological layers: layer 0 holds the roots
    layers: Vec<Vec<TaskId>>,
    /// Longest effort-weighted distance from each task to any terminal task
    /// (inclusive of the task's own effort)
    downstream_weight: HashMap<TaskId, Duration>,
    /// Members of the longest chain
    critical_path: Vec<TaskId>,
}

impl TaskGraph {
    /// Build and validate the DAG from loaded task specs
    pub fn build(specs: &[TaskSpec]) -> Result<Self, GraphError> {
        let mut violations = Vec::new();

        let mut seen: HashSet<&TaskId> = HashSet::with_capacity(specs.len());
        for spec in specs {
            if !seen.insert(&spec.id) {
                violations.push(GraphViolation::DuplicateId {
                    task_id: spec.id.clone(),
                });
            }
        }

        let mut dependencies: HashMap<TaskId, Vec<TaskId>> = HashMap::with_capacity(specs.len());
        let mut dependents: HashMap<TaskId, Vec<TaskId>> = HashMap::with_capacity(specs.len());
        let mut efforts: HashMap<TaskId, Duration> = HashMap::with_capacity(specs.len());

        for spec in specs {
            dependencies.entry(spec.id.clone()).or_default();
            dependents.entry(spec.id.clone()).or_default();
            efforts.insert(spec.id.clone(), spec.effort());
        }

        for spec in specs {
            for dep in &spec.depends_on {
                if dep == &spec.id {
                    violations.push(GraphViolation::SelfDependency {
                        task_id: spec.id.clone(),
                    });
                    continue;
                }
                if !efforts.contains_key(dep) {
                    violations.push(GraphViolation::MissingDependency {
                        task_id: spec.id.clone(),
                        missing: dep.clone(),
                    });
                    continue;
                }
                if let Some(deps) = dependencies.get_mut(&spec.id) {
                    deps.push(dep.clone());
                }
                if let Some(outs) = dependents.get_mut(dep) {
                    outs.push(spec.id.clone());
                }
            }
        }

        // Kahn's algorithm; whatever survives with in-degree > 0 is cyclic.
        let mut in_degree: BTreeMap<&TaskId, usize> = dependencies
            .iter()
            .map(|(id, deps)| (id, deps.len()))
            .collect();

        let mut frontier: VecDeque<&TaskId> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&id, _)| id)
            .collect();

        let mut layers: Vec<Vec<TaskId>> = Vec::new();
        let mut resolved = 0usize;

        while !frontier.is_empty() {
            let mut layer: Vec<TaskId> = Vec::with_capacity(frontier.len());
            let mut next: VecDeque<&TaskId> = VecDeque::new();

            while let Some(id) = frontier.pop_front() {
                layer.push(id.clone());
                resolved += 1;
                for dependent in &dependents[id] {
                    if let Some(deg) = in_degree.get_mut(dependent) {
                        *deg -= 1;
                        if *deg == 0 {
                            next.push_back(dependent);
                        }
                    }
                }
            }

            layer.sort();
            layers.push(layer);
            frontier = next;
        }

        if resolved != dependencies.len() {
            let mut members: Vec<TaskId> = in_degree
                .iter()
                .filter(|(_, &deg)| deg > 0)
                .map(|(&id, _)| id.clone())
                .collect();
            members.sort();
            violations.push(GraphViolation::Cycle { members });
        }

        if !violations.is_empty() {
            return Err(GraphError { violations });
        }

        let mut graph = Self {
            dependents,
            dependencies,
            efforts,
            layers,
            downstream_weight: HashMap::new(),
            critical_path: Vec::new(),
        };
        graph.recompute_weights_full();
        Ok(graph)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn contains(&self, id: &TaskId) -> bool {
        self.dependencies.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.dependencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }

    /// Direct dependencies of a task
    pub fn dependencies_of(&self, id: &TaskId) -> &[TaskId] {
        self.dependencies.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Direct dependents of a task
    pub fn dependents_of(&self, id: &TaskId) -> &[TaskId] {
        self.dependents.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All transitive dependents (descendants), excluding the task itself
    pub fn descendants_of(&self, id: &TaskId) -> Vec<TaskId> {
        let mut out = Vec::new();
        let mut seen: HashSet<&TaskId> = HashSet::new();
        let mut queue: VecDeque<&TaskId> = self.dependents_of(id).iter().collect();
        while let Some(next) = queue.pop_front() {
            if seen.insert(next) {
                out.push(next.clone());
                queue.extend(self.dependents_of(next).iter());
            }
        }
        out
    }

    /// Topological layers; layer 0 holds tasks without dependencies
    pub fn layers(&self) -> &[Vec<TaskId>] {
        &self.layers
    }

    /// Longest effort-weighted chain, root to terminal
    pub fn critical_path(&self) -> &[TaskId] {
        &self.critical_path
    }

    /// Whether a task sits on the critical path (scheduling tie-break)
    pub fn on_critical_path(&self, id: &TaskId) -> bool {
        self.critical_path.iter().any(|t| t == id)
    }

    /// Total effort along the critical path
    pub fn critical_path_effort(&self) -> Duration {
        self.critical_path
            .first()
            .and_then(|id| self.downstream_weight.get(id))
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    // ------------------------------------------------------------------
    // Incremental updates
    // ------------------------------------------------------------------

    /// Change one task's effort estimate and recompute weights for the
    /// affected subgraph only (the task and its ancestors)
    pub fn update_effort(&mut self, id: &TaskId, effort: Duration) {
        if !self.contains(id) {
            return;
        }
        self.efforts.insert(id.clone(), effort);

        // Only the task itself and everything upstream of it can change.
        let mut affected: HashSet<TaskId> = HashSet::new();
        let mut queue: VecDeque<TaskId> = VecDeque::new();
        queue.push_back(id.clone());
        while let Some(next) = queue.pop_front() {
            if affected.insert(next.clone()) {
                for dep in self.dependencies_of(&next) {
                    queue.push_back(dep.clone());
                }
            }
        }

        // Layers are already reverse-topological when walked back to front.
        for layer in self.layers.clone().iter().rev() {
            for task in layer {
                if affected.contains(task) {
                    let weight = self.weight_from_children(task);
                    self.downstream_weight.insert(task.clone(), weight);
                }
            }
        }
        self.rebuild_critical_path();
    }

    fn weight_from_children(&self, id: &TaskId) -> Duration {
        let own = self.efforts.get(id).copied().unwrap_or(Duration::ZERO);
        let best_child = self
            .dependents_of(id)
            .iter()
            .filter_map(|d| self.downstream_weight.get(d))
            .max()
            .copied()
            .unwrap_or(Duration::ZERO);
        own + best_child
    }

    fn recompute_weights_full(&mut self) {
        self.downstream_weight.clear();
        for layer in self.layers.clone().iter().rev() {
            for task in layer {
                let weight = self.weight_from_children(task);
                self.downstream_weight.insert(task.clone(), weight);
            }
        }
        self.rebuild_critical_path();
    }

    fn rebuild_critical_path(&mut self) {
        // Start from the heaviest root; lexicographic id breaks ties.
        let Some(start) = self
            .layers
            .first()
            .into_iter()
            .flatten()
            .max_by(|a, b| self.cmp_by_weight(a, b))
            .cloned()
        else {
            self.critical_path = Vec::new();
            return;
        };

        let mut path = vec![start.clone()];
        let mut cursor = start;
        while let Some(next) = self
            .dependents_of(&cursor)
            .iter()
            .max_by(|a, b| self.cmp_by_weight(a, b))
            .cloned()
        {
            path.push(next.clone());
            cursor = next;
        }
        self.critical_path = path;
    }

    fn cmp_by_weight(&self, a: &TaskId, b: &TaskId) -> std::cmp::Ordering {
        let wa = self.downstream_weight.get(a).copied().unwrap_or_default();
        let wb = self.downstream_weight.get(b).copied().unwrap_or_default();
        // Heavier wins; on equal weight the lexicographically smaller id wins.
        wa.cmp(&wb).then_with(|| b.cmp(a))
    }
}

// ============================================================================
// TESTS
// ============================================================================
