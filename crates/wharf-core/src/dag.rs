//! DAG construction over a pipeline's tasks.
//!
//! Nodes are inserted in declaration order and petgraph's node
//! indices preserve that order, which is what makes ready-set
//! iteration deterministic.

use crate::run::TaskRun;
use crate::{Error, Result};
use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone)]
pub struct TaskNode {
    pub name: String,
    pub label: String,
}

/// Dependency graph for one pipeline run. Edges run from a
/// predecessor to the tasks that wait on it.
#[derive(Debug)]
pub struct TaskGraph {
    graph: DiGraph<TaskNode, ()>,
    name_to_index: HashMap<String, NodeIndex>,
}

impl TaskGraph {
    /// Build the graph from task stubs, resolving `depends` by name
    /// and rejecting cycles.
    pub fn build(tasks: &[TaskRun]) -> Result<Self> {
        if tasks.is_empty() {
            return Err(Error::Validation("pipeline has no tasks".to_string()));
        }

        let mut graph = DiGraph::new();
        let mut name_to_index = HashMap::new();
        for task in tasks {
            let idx = graph.add_node(TaskNode {
                name: task.name.clone(),
                label: task.label.clone(),
            });
            name_to_index.insert(task.name.clone(), idx);
        }

        for task in tasks {
            let task_idx = name_to_index[&task.name];
            for dep in &task.depends {
                let dep_idx = name_to_index.get(dep).ok_or_else(|| Error::UnknownDependency {
                    task: task.name.clone(),
                    dependency: dep.clone(),
                })?;
                graph.add_edge(*dep_idx, task_idx, ());
            }
        }

        let dag = TaskGraph { graph, name_to_index };
        // Surfaces one node on the cycle.
        if let Err(cycle) = toposort(&dag.graph, None) {
            let name = dag.graph[cycle.node_id()].name.clone();
            return Err(Error::CycleDetected(name));
        }
        Ok(dag)
    }

    /// Task names in declaration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.graph.node_indices().map(|idx| self.graph[idx].name.as_str())
    }

    /// Tasks with no dependencies, in declaration order.
    pub fn roots(&self) -> Vec<&TaskNode> {
        self.graph
            .node_indices()
            .filter(|&idx| {
                self.graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .count()
                    == 0
            })
            .map(|idx| &self.graph[idx])
            .collect()
    }

    /// Direct dependencies of a task.
    pub fn predecessors(&self, name: &str) -> Vec<&TaskNode> {
        self.name_to_index
            .get(name)
            .map(|&idx| {
                self.graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .map(|n| &self.graph[n])
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Everything that transitively waits on a task; used to retire
    /// the subtree under a failed task.
    pub fn descendants(&self, name: &str) -> Vec<&TaskNode> {
        let Some(&start) = self.name_to_index.get(name) else {
            return Vec::new();
        };
        let mut seen: HashSet<NodeIndex> = HashSet::new();
        let mut stack = vec![start];
        while let Some(idx) = stack.pop() {
            for next in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                if seen.insert(next) {
                    stack.push(next);
                }
            }
        }
        // Report in declaration order for deterministic store writes.
        self.graph
            .node_indices()
            .filter(|idx| seen.contains(idx))
            .map(|idx| &self.graph[idx])
            .collect()
    }

    /// Is every dependency of `name` in the executed set?
    pub fn is_ready(&self, name: &str, executed: &HashSet<String>) -> bool {
        self.predecessors(name)
            .iter()
            .all(|pred| executed.contains(&pred.name))
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::TaskDefinition;
    use crate::run::TaskRun;

    fn stub(name: &str, depends: &[&str]) -> TaskRun {
        let yaml = format!("{{name: {}, image: img, command: [c]}}", name);
        let mut def: TaskDefinition = serde_yaml::from_str(&yaml).unwrap();
        def.depends = depends.iter().map(|s| s.to_string()).collect();
        TaskRun::from_definition("flow-test", &def)
    }

    #[test]
    fn roots_follow_declaration_order() {
        let tasks = vec![stub("b", &[]), stub("a", &[]), stub("c", &["a"])];
        let dag = TaskGraph::build(&tasks).unwrap();
        let roots: Vec<_> = dag.roots().iter().map(|n| n.name.as_str()).collect();
        assert_eq!(roots, vec!["b", "a"]);
    }

    #[test]
    fn ready_requires_all_predecessors_executed() {
        let tasks = vec![stub("train", &[]), stub("export", &["train"])];
        let dag = TaskGraph::build(&tasks).unwrap();

        let mut executed = HashSet::new();
        assert!(dag.is_ready("train", &executed));
        assert!(!dag.is_ready("export", &executed));
        executed.insert("train".to_string());
        assert!(dag.is_ready("export", &executed));
    }

    #[test]
    fn descendants_are_transitive() {
        let tasks = vec![
            stub("a", &[]),
            stub("b", &["a"]),
            stub("c", &["b"]),
            stub("d", &[]),
        ];
        let dag = TaskGraph::build(&tasks).unwrap();
        let below: Vec<_> = dag.descendants("a").iter().map(|n| n.name.as_str()).collect();
        assert_eq!(below, vec!["b", "c"]);
        assert!(dag.descendants("d").is_empty());
    }

    #[test]
    fn cycle_is_rejected_naming_a_node() {
        let tasks = vec![stub("a", &["b"]), stub("b", &["a"])];
        match TaskGraph::build(&tasks) {
            Err(Error::CycleDetected(name)) => {
                assert!(name == "a" || name == "b");
            }
            other => panic!("expected CycleDetected, got {:?}", other),
        }
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let tasks = vec![stub("a", &["ghost"])];
        match TaskGraph::build(&tasks) {
            Err(Error::UnknownDependency { task, dependency }) => {
                assert_eq!(task, "a");
                assert_eq!(dependency, "ghost");
            }
            other => panic!("expected UnknownDependency, got {:?}", other),
        }
    }

    #[test]
    fn empty_pipeline_is_rejected() {
        assert!(TaskGraph::build(&[]).is_err());
    }
}
