//! Dependency graph of tasks.
//!
//! A [`WorkflowGraph`] owns the set of tasks and the dependency relation
//! among them, guarantees acyclicity at mutation time, and answers the
//! scheduler's central question: given a snapshot of task states, which
//! tasks are ready to run. The graph itself holds no execution state; the
//! scheduler owns the state table and passes snapshots in.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt::Write as _;
use std::sync::Arc;

use thiserror::Error;

use super::task::{Task, TaskState};
use super::types::{TaskId, WorkflowId};

/// Errors that can occur when constructing or validating a graph.
#[derive(Debug, Error)]
pub enum GraphError {
    /// Attempted to add a task whose name already exists.
    #[error("duplicate task: {0}")]
    DuplicateTask(TaskId),

    /// An operation referenced a task that is not in the graph.
    #[error("unknown task: {0}")]
    UnknownTask(TaskId),

    /// The edge or graph would contain a cycle.
    #[error("cycle detected involving task: {0}")]
    Cycle(TaskId),
}

/// A workflow's tasks and their ordering constraints.
pub struct WorkflowGraph {
    id: WorkflowId,
    name: String,
    nodes: HashMap<TaskId, Arc<dyn Task>>,
    /// Edges: task id -> the tasks it depends on.
    dependencies: HashMap<TaskId, Vec<TaskId>>,
}

impl WorkflowGraph {
    /// Create a new empty graph.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: WorkflowId::new(id),
            name: name.into(),
            nodes: HashMap::new(),
            dependencies: HashMap::new(),
        }
    }

    /// Get the workflow ID.
    pub fn id(&self) -> &WorkflowId {
        &self.id
    }

    /// Get the workflow name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check if the graph is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Get the number of tasks in the graph.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Add a task to the graph with no dependencies.
    pub fn add_task(&mut self, task: Arc<dyn Task>) -> Result<(), GraphError> {
        let id = TaskId::new(task.name());
        if self.nodes.contains_key(&id) {
            return Err(GraphError::DuplicateTask(id));
        }

        self.nodes.insert(id.clone(), task);
        self.dependencies.insert(id, Vec::new());
        Ok(())
    }

    /// Add a dependency edge: `dependent` may only run after `dependency`
    /// has succeeded.
    ///
    /// Fails with [`GraphError::UnknownTask`] if either endpoint is absent
    /// and with [`GraphError::Cycle`] if the edge would close a cycle. On
    /// failure the graph is left unchanged.
    pub fn add_dependency(
        &mut self,
        dependent: &TaskId,
        dependency: &TaskId,
    ) -> Result<(), GraphError> {
        if !self.nodes.contains_key(dependent) {
            return Err(GraphError::UnknownTask(dependent.clone()));
        }
        if !self.nodes.contains_key(dependency) {
            return Err(GraphError::UnknownTask(dependency.clone()));
        }
        if dependent == dependency {
            return Err(GraphError::Cycle(dependent.clone()));
        }

        // The edge closes a cycle iff `dependency` already (transitively)
        // depends on `dependent`. Checked before inserting.
        if self.depends_transitively(dependency, dependent) {
            return Err(GraphError::Cycle(dependent.clone()));
        }

        let deps = self.dependencies.entry(dependent.clone()).or_default();
        if !deps.contains(dependency) {
            deps.push(dependency.clone());
        }
        Ok(())
    }

    /// Whether `from` reaches `target` by following dependency edges.
    fn depends_transitively(&self, from: &TaskId, target: &TaskId) -> bool {
        let mut stack = vec![from.clone()];
        let mut seen = HashSet::new();
        while let Some(current) = stack.pop() {
            if &current == target {
                return true;
            }
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(deps) = self.dependencies.get(&current) {
                stack.extend(deps.iter().cloned());
            }
        }
        false
    }

    /// Get a task by ID.
    pub fn get_task(&self, id: &TaskId) -> Option<&Arc<dyn Task>> {
        self.nodes.get(id)
    }

    /// Get the dependencies of a task.
    pub fn dependencies_of(&self, id: &TaskId) -> &[TaskId] {
        self.dependencies.get(id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Get the direct dependents of a task (tasks that depend on it).
    pub fn dependents_of(&self, id: &TaskId) -> Vec<TaskId> {
        let mut out: Vec<TaskId> = self
            .dependencies
            .iter()
            .filter(|(_, deps)| deps.contains(id))
            .map(|(task_id, _)| task_id.clone())
            .collect();
        out.sort();
        out
    }

    /// Get every task downstream of `id`, directly or transitively.
    ///
    /// Used for skip propagation: when a task fails terminally, all of these
    /// can never run.
    pub fn transitive_dependents(&self, id: &TaskId) -> Vec<TaskId> {
        let mut queue: VecDeque<TaskId> = VecDeque::from([id.clone()]);
        let mut seen: HashSet<TaskId> = HashSet::new();
        while let Some(current) = queue.pop_front() {
            for dependent in self.dependents_of(&current) {
                if seen.insert(dependent.clone()) {
                    queue.push_back(dependent);
                }
            }
        }
        let mut out: Vec<TaskId> = seen.into_iter().collect();
        out.sort();
        out
    }

    /// Get the tasks that are ready to run under the given state snapshot:
    /// `Pending`, with every dependency in `Success`.
    ///
    /// Tasks missing from the snapshot are treated as `Pending`. The result
    /// is sorted by name so draw order is deterministic.
    pub fn ready_set(&self, states: &HashMap<TaskId, TaskState>) -> Vec<TaskId> {
        let state_of = |id: &TaskId| states.get(id).copied().unwrap_or(TaskState::Pending);

        let mut ready: Vec<TaskId> = self
            .nodes
            .keys()
            .filter(|id| state_of(id) == TaskState::Pending)
            .filter(|id| {
                self.dependencies_of(id)
                    .iter()
                    .all(|dep| state_of(dep) == TaskState::Success)
            })
            .cloned()
            .collect();
        ready.sort();
        ready
    }

    /// Validate the graph: every dependency reference must exist and the
    /// dependency relation must be acyclic.
    ///
    /// Incremental [`add_dependency`](Self::add_dependency) already rejects
    /// cycles; this is defense in depth for graphs assembled through the
    /// builder or deserialized wholesale.
    pub fn validate(&self) -> Result<(), GraphError> {
        for (task_id, deps) in &self.dependencies {
            for dep in deps {
                if !self.nodes.contains_key(dep) {
                    return Err(GraphError::UnknownTask(dep.clone()));
                }
            }
            if !self.nodes.contains_key(task_id) {
                return Err(GraphError::UnknownTask(task_id.clone()));
            }
        }

        self.topological_order().map(|_| ())
    }

    /// Return all tasks in a valid execution order.
    ///
    /// Kahn's algorithm with a name-ordered frontier: tasks with no ordering
    /// constraint between them appear in ascending name order, so the output
    /// is reproducible run to run.
    pub fn topological_order(&self) -> Result<Vec<TaskId>, GraphError> {
        let mut in_degree: HashMap<TaskId, usize> = HashMap::new();
        let mut dependents: HashMap<TaskId, Vec<TaskId>> = HashMap::new();

        for id in self.nodes.keys() {
            in_degree.insert(id.clone(), 0);
            dependents.insert(id.clone(), Vec::new());
        }

        for (task_id, deps) in &self.dependencies {
            in_degree.insert(task_id.clone(), deps.len());
            for dep in deps {
                dependents.entry(dep.clone()).or_default().push(task_id.clone());
            }
        }

        // BTreeSet keeps the frontier sorted by name.
        let mut frontier: BTreeSet<TaskId> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| id.clone())
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(id) = frontier.pop_first() {
            order.push(id.clone());

            if let Some(downstream) = dependents.get(&id) {
                for next in downstream {
                    if let Some(degree) = in_degree.get_mut(next) {
                        *degree -= 1;
                        if *degree == 0 {
                            frontier.insert(next.clone());
                        }
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            let cycle_member = in_degree
                .iter()
                .filter(|(_, degree)| **degree > 0)
                .map(|(id, _)| id.clone())
                .min()
                .ok_or_else(|| GraphError::Cycle(TaskId::new("<unknown>")))?;
            return Err(GraphError::Cycle(cycle_member));
        }

        Ok(order)
    }

    /// Get all task IDs in the graph, sorted by name.
    pub fn task_ids(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.nodes.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Render a plain-text description of the graph for inspection.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "workflow {} ({})", self.id, self.name);
        for id in self.task_ids() {
            let deps = self.dependencies_of(&id);
            if deps.is_empty() {
                let _ = writeln!(out, "  {}", id);
            } else {
                let mut names: Vec<&str> = deps.iter().map(|d| d.as_str()).collect();
                names.sort_unstable();
                let _ = writeln!(out, "  {} <- {}", id, names.join(", "));
            }
        }
        out
    }
}

/// Builder for constructing graphs fluently.
///
/// Errors from intermediate steps are held and surfaced by
/// [`build`](GraphBuilder::build), which also validates the finished graph.
pub struct GraphBuilder {
    graph: WorkflowGraph,
    error: Option<GraphError>,
}

impl GraphBuilder {
    /// Create a new graph builder.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            graph: WorkflowGraph::new(id, name),
            error: None,
        }
    }

    fn record(&mut self, result: Result<(), GraphError>) {
        if self.error.is_none() {
            if let Err(err) = result {
                self.error = Some(err);
            }
        }
    }

    /// Add a task with no dependencies.
    pub fn add_task(mut self, task: Arc<dyn Task>) -> Self {
        let result = self.graph.add_task(task);
        self.record(result);
        self
    }

    /// Add a task that depends on the named upstream tasks.
    pub fn add_task_with_deps(mut self, task: Arc<dyn Task>, depends_on: &[&str]) -> Self {
        let task_id = TaskId::new(task.name());
        let result = self.graph.add_task(task);
        self.record(result);
        for dep in depends_on {
            let result = self.graph.add_dependency(&task_id, &TaskId::new(*dep));
            self.record(result);
        }
        self
    }

    /// Add a dependency between two already-added tasks.
    pub fn add_dependency(mut self, dependent: &str, dependency: &str) -> Self {
        let result = self
            .graph
            .add_dependency(&TaskId::new(dependent), &TaskId::new(dependency));
        self.record(result);
        self
    }

    /// Build the graph, surfacing any held error and validating the result.
    pub fn build(self) -> Result<WorkflowGraph, GraphError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        self.graph.validate()?;
        Ok(self.graph)
    }
}
