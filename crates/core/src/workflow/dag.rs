use crate::config::CyclePolicy;
use crate::error::GraphError;
use crate::types::{StepId, StepSpec, WorkflowGraph};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::HashMap;

/// A batch of steps with no dependency among them
pub type Level = Vec<StepId>;

/// DAG representation of a workflow
pub struct WorkflowDag {
    graph: DiGraph<StepSpec, ()>,
    step_indices: HashMap<StepId, NodeIndex>,
}

impl WorkflowDag {
    /// Build a DAG from a submitted graph.
    ///
    /// Duplicate or empty step ids are rejected. Links naming a step that is not
    /// part of the graph are dropped, and repeated links collapse into one edge.
    pub fn from_graph(workflow: &WorkflowGraph) -> Result<Self, GraphError> {
        let mut graph = DiGraph::new();
        let mut step_indices = HashMap::new();

        // Add all steps as nodes
        for step in &workflow.steps {
            if step.id.as_str().is_empty() {
                return Err(GraphError::EmptyStepId);
            }
            if step_indices.contains_key(&step.id) {
                return Err(GraphError::DuplicateStep(step.id.clone()));
            }

            let node = graph.add_node(step.clone());
            step_indices.insert(step.id.clone(), node);
        }

        // Add dependency edges (source -> target)
        for link in &workflow.links {
            let (Some(&source), Some(&target)) = (
                step_indices.get(&link.source),
                step_indices.get(&link.target),
            ) else {
                tracing::debug!(
                    "Ignoring link {} -> {}: endpoint not in graph",
                    link.source,
                    link.target
                );
                continue;
            };

            graph.update_edge(source, target, ());
        }

        Ok(Self {
            graph,
            step_indices,
        })
    }

    /// Number of steps in the graph
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Look up a step by id
    pub fn step(&self, step_id: &StepId) -> Option<&StepSpec> {
        self.step_indices.get(step_id).map(|&n| &self.graph[n])
    }

    /// Steps in submission order
    pub fn steps(&self) -> impl Iterator<Item = &StepSpec> {
        self.graph.node_indices().map(move |n| &self.graph[n])
    }

    pub fn is_cyclic(&self) -> bool {
        petgraph::algo::is_cyclic_directed(&self.graph)
    }

    /// Group steps into execution levels.
    ///
    /// Every round takes all steps whose dependencies are resolved, in
    /// submission order. When a round finds nothing while steps remain, the
    /// leftovers sit on or behind a cycle and `policy` decides between one
    /// final level holding all of them and an error.
    pub fn levels(&self, policy: CyclePolicy) -> Result<Vec<Level>, GraphError> {
        let count = self.graph.node_count();
        let mut remaining: Vec<usize> = self
            .graph
            .node_indices()
            .map(|n| self.graph.neighbors_directed(n, Direction::Incoming).count())
            .collect();
        let mut resolved = vec![false; count];
        let mut unresolved = count;
        let mut levels = Vec::new();

        while unresolved > 0 {
            let ready: Vec<NodeIndex> = self
                .graph
                .node_indices()
                .filter(|n| !resolved[n.index()] && remaining[n.index()] == 0)
                .collect();

            if ready.is_empty() {
                let stuck: Level = self
                    .graph
                    .node_indices()
                    .filter(|n| !resolved[n.index()])
                    .map(|n| self.graph[n].id.clone())
                    .collect();

                match policy {
                    CyclePolicy::Reject => return Err(GraphError::Cycle { steps: stuck }),
                    CyclePolicy::CoSchedule => {
                        tracing::warn!(
                            "Dependency cycle detected, co-scheduling {} steps in final level",
                            stuck.len()
                        );
                        levels.push(stuck);
                        break;
                    }
                }
            }

            for &node in &ready {
                resolved[node.index()] = true;
                unresolved -= 1;
                for next in self.graph.neighbors_directed(node, Direction::Outgoing) {
                    remaining[next.index()] = remaining[next.index()].saturating_sub(1);
                }
            }

            levels.push(ready.into_iter().map(|n| self.graph[n].id.clone()).collect());
        }

        Ok(levels)
    }

    /// Get dependencies for a step
    pub fn dependencies(&self, step_id: &StepId) -> Option<Vec<StepId>> {
        let node = self.step_indices.get(step_id)?;

        Some(
            self.graph
                .neighbors_directed(*node, Direction::Incoming)
                .map(|n| self.graph[n].id.clone())
                .collect(),
        )
    }

    /// Get steps that depend on the given step
    pub fn dependents(&self, step_id: &StepId) -> Option<Vec<StepId>> {
        let node = self.step_indices.get(step_id)?;

        Some(
            self.graph
                .neighbors_directed(*node, Direction::Outgoing)
                .map(|n| self.graph[n].id.clone())
                .collect(),
        )
    }

    /// Get all steps with no dependencies (can start immediately)
    pub fn entry_steps(&self) -> Vec<&StepSpec> {
        self.graph
            .node_indices()
            .filter(|&n| {
                self.graph
                    .neighbors_directed(n, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|n| &self.graph[n])
            .collect()
    }
}
