//! Dependency walker.
//!
//! Starting from a sink task, the walker traverses the `inputs` edges
//! backwards, interning each task once (keyed by identity, not name) and
//! emitting one graph edge per unique (producer, stream-label, consumer)
//! triple. A duplicate triple is a malformed graph and rejected with
//! [`Error::DuplicateEdge`]; a dependency cycle is rejected with
//! [`Error::CycleDetected`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::core::task::{Task, TaskId};
use crate::error::{Error, Result};

/// The resolved run graph: every task reachable from the sink, with edges
/// labeled by the connecting stream.
#[derive(Debug)]
pub(crate) struct RunGraph {
    pub graph: DiGraph<Arc<Task>, String>,
    index: HashMap<TaskId, NodeIndex>,
}

impl RunGraph {
    fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            index: HashMap::new(),
        }
    }

    /// Add the task if unseen. Returns its node index and whether it was
    /// freshly interned.
    fn intern(&mut self, task: &Arc<Task>) -> (NodeIndex, bool) {
        if let Some(&idx) = self.index.get(&task.id()) {
            return (idx, false);
        }
        let idx = self.graph.add_node(task.clone());
        self.index.insert(task.id(), idx);
        (idx, true)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Arc<Task>> {
        self.graph.node_weights()
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }
}

/// Walk the graph from the sink, depth-first along inputs.
pub(crate) fn walk(sink: &Arc<Task>) -> Result<RunGraph> {
    let mut rg = RunGraph::new();
    let mut edges: HashSet<(TaskId, TaskId, String)> = HashSet::new();

    let (root, _) = rg.intern(sink);
    let mut stack = vec![(sink.clone(), root)];

    while let Some((task, node)) = stack.pop() {
        for input in task.inputs() {
            let label = input.label();
            for producer in input.producers() {
                let (pnode, fresh) = rg.intern(&producer);
                if !edges.insert((producer.id(), task.id(), label.clone())) {
                    return Err(Error::DuplicateEdge {
                        producer: producer.name().to_string(),
                        stream: label,
                        consumer: task.name().to_string(),
                    });
                }
                rg.graph.add_edge(pnode, node, label.clone());
                if fresh {
                    stack.push((producer, pnode));
                }
            }
        }
    }

    if is_cyclic_directed(&rg.graph) {
        return Err(Error::CycleDetected(sink.name().to_string()));
    }
    Ok(rg)
}
