//! Task DAG (Directed Acyclic Graph) for dependency management.
//!
//! This module provides the TaskDAG structure that represents task dependencies
//! as a directed acyclic graph, and the batcher that turns it into an ordered
//! list of batches whose members can run concurrently.

use crate::core::task::{TaskDefinition, TaskId};
use crate::error::ValidationError;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// A set of tasks that may run concurrently.
///
/// Every dependency of every member lives in a strictly earlier batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    /// Position in the run, 0-based.
    pub index: usize,
    /// Dependency layer this batch was cut from, 0-based.
    pub layer: usize,
    /// Cohort shared by the members, if the layer was split by group.
    pub parallel_group: Option<u32>,
    pub tasks: Vec<TaskDefinition>,
}

impl Batch {
    pub fn task_ids(&self) -> Vec<TaskId> {
        self.tasks.iter().map(|t| t.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// The task dependency graph.
///
/// Nodes are task definitions; an edge `a -> b` means `b` depends on `a`.
pub struct TaskDAG {
    /// The underlying directed graph.
    graph: DiGraph<TaskDefinition, ()>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    task_index: HashMap<TaskId, NodeIndex>,
}

impl TaskDAG {
    /// Create a new empty TaskDAG.
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
        }
    }

    /// Build and validate a DAG from a task set.
    ///
    /// Rejects empty sets, incomplete definitions, duplicate ids, self
    /// dependencies and dependencies on ids outside the set. Cycles are
    /// reported by [`TaskDAG::batches`], which names every stuck task.
    pub fn from_definitions(
        tasks: &[TaskDefinition],
    ) -> std::result::Result<Self, ValidationError> {
        if tasks.is_empty() {
            return Err(ValidationError::Empty);
        }

        let mut dag = Self::new();
        for task in tasks {
            task.validate_fields()?;
            dag.add_task(task.clone())?;
        }

        for task in tasks {
            for dep in &task.dependencies {
                dag.add_dependency(dep, &task.id)?;
            }
        }

        Ok(dag)
    }

    /// Add a task to the DAG.
    ///
    /// # Errors
    /// Returns `DuplicateTask` if a task with the same id is already present.
    pub fn add_task(
        &mut self,
        task: TaskDefinition,
    ) -> std::result::Result<NodeIndex, ValidationError> {
        if self.task_index.contains_key(&task.id) {
            return Err(ValidationError::DuplicateTask(task.id));
        }

        let id = task.id.clone();
        let index = self.graph.add_node(task);
        self.task_index.insert(id, index);
        Ok(index)
    }

    /// Record that `to` depends on `from`.
    ///
    /// Repeated dependencies collapse into a single edge.
    pub fn add_dependency(
        &mut self,
        from: &TaskId,
        to: &TaskId,
    ) -> std::result::Result<(), ValidationError> {
        if from == to {
            return Err(ValidationError::SelfDependency(to.clone()));
        }

        let to_index = *self
            .task_index
            .get(to)
            .ok_or_else(|| ValidationError::UnknownDependency {
                task: to.clone(),
                dependency: to.clone(),
            })?;

        let from_index =
            *self
                .task_index
                .get(from)
                .ok_or_else(|| ValidationError::UnknownDependency {
                    task: to.clone(),
                    dependency: from.clone(),
                })?;

        self.graph.update_edge(from_index, to_index, ());
        Ok(())
    }

    /// Get the number of tasks in the DAG.
    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Get the number of dependencies (edges) in the DAG.
    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    // ========== Scheduling Operations ==========

    /// Get all tasks whose dependencies are all in `completed`, in insertion order.
    ///
    /// Tasks already in `completed` are skipped.
    pub fn ready_tasks<'a>(&'a self, completed: &HashSet<TaskId>) -> Vec<&'a TaskDefinition> {
        self.graph
            .node_indices()
            .filter_map(|index| {
                let task = self.graph.node_weight(index)?;

                if completed.contains(&task.id) {
                    return None;
                }

                let deps_satisfied = self
                    .graph
                    .neighbors_directed(index, petgraph::Direction::Incoming)
                    .all(|dep_index| {
                        self.graph
                            .node_weight(dep_index)
                            .map(|dep_task| completed.contains(&dep_task.id))
                            .unwrap_or(false)
                    });

                deps_satisfied.then_some(task)
            })
            .collect()
    }

    /// Check if every task in the DAG is in `completed`.
    pub fn all_complete(&self, completed: &HashSet<TaskId>) -> bool {
        self.task_index.keys().all(|id| completed.contains(id))
    }

    /// Get tasks in topological order (respecting dependencies).
    ///
    /// # Errors
    /// Returns `CircularDependency` naming the node petgraph found on a cycle.
    pub fn topological_order(
        &self,
    ) -> std::result::Result<Vec<&TaskDefinition>, ValidationError> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let ids = self
                .graph
                .node_weight(cycle.node_id())
                .map(|t| vec![t.id.clone()])
                .unwrap_or_default();
            ValidationError::CircularDependency { ids }
        })?;

        Ok(sorted
            .into_iter()
            .filter_map(|index| self.graph.node_weight(index))
            .collect())
    }

    /// Split the DAG into ordered batches by greedy topological layering.
    ///
    /// Each round takes every unscheduled task whose dependencies are already
    /// scheduled. If any of them carries a `parallel_group`, the layer is split
    /// into one batch per group value (ungrouped tasks form their own batch),
    /// in order of first appearance. Otherwise the layer is a single batch.
    ///
    /// # Errors
    /// Returns `CircularDependency` with every task that can never become
    /// ready, sorted by id.
    pub fn batches(&self) -> std::result::Result<Vec<Batch>, ValidationError> {
        let mut scheduled: HashSet<TaskId> = HashSet::with_capacity(self.task_count());
        let mut batches = Vec::new();
        let mut layer = 0;

        while !self.all_complete(&scheduled) {
            let ready = self.ready_tasks(&scheduled);

            if ready.is_empty() {
                let mut ids: Vec<TaskId> = self
                    .task_index
                    .keys()
                    .filter(|id| !scheduled.contains(*id))
                    .cloned()
                    .collect();
                ids.sort();
                return Err(ValidationError::CircularDependency { ids });
            }

            for (group, tasks) in split_by_group(&ready) {
                batches.push(Batch {
                    index: batches.len(),
                    layer,
                    parallel_group: group,
                    tasks: tasks.into_iter().cloned().collect(),
                });
            }

            scheduled.extend(ready.iter().map(|t| t.id.clone()));
            layer += 1;
        }

        Ok(batches)
    }
}

/// Partition one ready layer into cohorts keyed by `parallel_group`.
fn split_by_group<'a>(
    ready: &[&'a TaskDefinition],
) -> Vec<(Option<u32>, Vec<&'a TaskDefinition>)> {
    if ready.iter().all(|t| t.parallel_group.is_none()) {
        return vec![(None, ready.to_vec())];
    }

    let mut cohorts: Vec<(Option<u32>, Vec<&TaskDefinition>)> = Vec::new();
    for task in ready {
        match cohorts.iter_mut().find(|(g, _)| *g == task.parallel_group) {
            Some((_, members)) => members.push(task),
            None => cohorts.push((task.parallel_group, vec![task])),
        }
    }
    cohorts
}

/// Validate a task set and compute its batches in one step.
pub fn plan_batches(
    tasks: &[TaskDefinition],
) -> std::result::Result<Vec<Batch>, ValidationError> {
    TaskDAG::from_definitions(tasks)?.batches()
}

impl Default for TaskDAG {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskDAG {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDAG")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
