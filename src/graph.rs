//! The validated, immutable task graph.
//!
//! Tasks are nodes of a [`petgraph`] graph and edges point from a dependency
//! to its dependent. Node indices follow registration order, which gives the
//! topological order a stable tie-break.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;

use petgraph::Direction;
use petgraph::Graph;
use petgraph::graph::NodeIndex;
use petgraph::visit::Dfs;

use crate::config::Config;
use crate::core::TaskId;
use crate::error::GraphError;
use crate::task::Task;

pub struct TaskGraph {
    config: Arc<Config>,
    graph: Graph<Arc<Task>, ()>,
    index: HashMap<TaskId, NodeIndex>,
    order: Vec<NodeIndex>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

impl TaskGraph {
    /// Validate registered tasks and freeze them into a graph.
    ///
    /// Fails if a dependency does not resolve to a registered task, or if the
    /// dependencies form a cycle. The cycle is reported as a full path that
    /// starts and ends with the same task.
    pub(crate) fn validate(config: Arc<Config>, tasks: Vec<Task>) -> Result<Self, GraphError> {
        let mut graph = Graph::with_capacity(tasks.len(), tasks.len());
        let mut index = HashMap::with_capacity(tasks.len());

        for task in tasks {
            let name = task.name.clone();
            let node = graph.add_node(Arc::new(task));
            index.insert(name, node);
        }

        for node in graph.node_indices() {
            let task = graph[node].clone();
            let mut seen = HashSet::new();

            for dependency in &task.dependencies {
                let &source = index.get(dependency).ok_or_else(|| GraphError::UnknownDependency {
                    task: task.name.clone(),
                    dependency: dependency.clone(),
                })?;

                if seen.insert(source) {
                    graph.add_edge(source, node, ());
                }
            }
        }

        let mut marks = vec![Mark::Unvisited; graph.node_count()];
        let mut stack = Vec::new();
        for node in graph.node_indices() {
            if marks[node.index()] == Mark::Unvisited {
                find_cycle(&graph, node, &mut marks, &mut stack)?;
            }
        }

        let order = stable_toposort(&graph);

        Ok(Self {
            config,
            graph,
            index,
            order,
        })
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Task>> {
        self.index.get(name).map(|&node| &self.graph[node])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Tasks in registration order.
    pub fn tasks(&self) -> impl Iterator<Item = &Arc<Task>> {
        self.graph.node_indices().map(|node| &self.graph[node])
    }

    /// Every task after all of its dependencies. Whenever several tasks are
    /// ready, the one registered first goes next.
    pub fn topological_order(&self) -> impl Iterator<Item = &TaskId> {
        self.order.iter().map(|&node| &self.graph[node].name)
    }

    /// Tasks `name` depends on directly, in registration order.
    pub fn dependencies(&self, name: &str) -> Vec<TaskId> {
        let Some(&node) = self.index.get(name) else {
            return vec![];
        };

        let mut dependencies: Vec<_> = self
            .graph
            .neighbors_directed(node, Direction::Incoming)
            .collect();
        dependencies.sort();
        dependencies
            .into_iter()
            .map(|n| self.graph[n].name.clone())
            .collect()
    }

    /// Tasks that depend directly on `name`, in registration order.
    pub fn dependents(&self, name: &str) -> Vec<TaskId> {
        let Some(&node) = self.index.get(name) else {
            return vec![];
        };

        let mut dependents: Vec<_> = self
            .graph
            .neighbors_directed(node, Direction::Outgoing)
            .collect();
        dependents.sort();
        dependents
            .into_iter()
            .map(|n| self.graph[n].name.clone())
            .collect()
    }

    /// The given tasks and everything that transitively depends on them.
    pub fn descendants<'a>(&self, names: impl IntoIterator<Item = &'a TaskId>) -> HashSet<TaskId> {
        let mut acc = HashSet::new();

        for name in names {
            let Some(&start) = self.index.get(name) else {
                continue;
            };

            let mut dfs = Dfs::new(&self.graph, start);
            while let Some(node) = dfs.next(&self.graph) {
                acc.insert(self.graph[node].name.clone());
            }
        }

        acc
    }
}

/// Depth-first search with recursion-stack marking. Follows edges from a task
/// to its dependencies, so a reported path reads "a depends on b depends on
/// ... depends on a".
fn find_cycle(
    graph: &Graph<Arc<Task>, ()>,
    node: NodeIndex,
    marks: &mut [Mark],
    stack: &mut Vec<NodeIndex>,
) -> Result<(), GraphError> {
    marks[node.index()] = Mark::OnStack;
    stack.push(node);

    let mut dependencies: Vec<_> = graph.neighbors_directed(node, Direction::Incoming).collect();
    dependencies.sort();

    for dependency in dependencies {
        match marks[dependency.index()] {
            Mark::Done => {}
            Mark::Unvisited => find_cycle(graph, dependency, marks, stack)?,
            Mark::OnStack => {
                let start = stack.iter().position(|&n| n == dependency).unwrap_or(0);
                let path = stack[start..]
                    .iter()
                    .chain(std::iter::once(&dependency))
                    .map(|&n| graph[n].name.clone())
                    .collect();

                return Err(GraphError::CyclicDependency(path));
            }
        }
    }

    stack.pop();
    marks[node.index()] = Mark::Done;
    Ok(())
}

/// Kahn's algorithm with a min-heap over node indices, so the ready task
/// with the lowest registration index is emitted first.
fn stable_toposort(graph: &Graph<Arc<Task>, ()>) -> Vec<NodeIndex> {
    let mut pending: Vec<usize> = graph
        .node_indices()
        .map(|n| graph.neighbors_directed(n, Direction::Incoming).count())
        .collect();

    let mut ready: BinaryHeap<Reverse<NodeIndex>> = graph
        .node_indices()
        .filter(|n| pending[n.index()] == 0)
        .map(Reverse)
        .collect();

    let mut order = Vec::with_capacity(graph.node_count());
    while let Some(Reverse(node)) = ready.pop() {
        order.push(node);

        for dependent in graph.neighbors_directed(node, Direction::Outgoing) {
            pending[dependent.index()] -= 1;
            if pending[dependent.index()] == 0 {
                ready.push(Reverse(dependent));
            }
        }
    }

    order
}

impl std::fmt::Display for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let task = &self.graph[index];
            let name = task.name.replace('"', "\\\""); // Simple escape
            writeln!(f, "    {:?}[\"{}\"]", index.index(), name)?;

            if task.publish {
                writeln!(f, "    {:?} --> Output", index.index())?;
            }
        }

        writeln!(f, "    Output[Output]")?;

        for edge in self.graph.raw_edges() {
            writeln!(
                f,
                "    {:?} --> {:?}",
                edge.source().index(),
                edge.target().index()
            )?;
        }

        Ok(())
    }
}
