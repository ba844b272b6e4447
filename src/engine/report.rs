//! Execution report.
//!
//! A run produces a [`Report`]: the DAG that actually ran, with each node
//! annotated by its outcome (elapsed wall-clock time, a skip marker, or a
//! failure) and each edge labeled by the connecting stream. The report
//! renders to a dot-language document via [`Report::to_dot`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use petgraph::graph::DiGraph;
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};

use crate::core::task::{Task, TaskId};
use crate::engine::walker::RunGraph;

/// Outcome of one task in a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "result")]
pub enum TaskOutcome {
    /// All outputs were already materialized; the processor never ran.
    Skipped,
    /// The task completed normally.
    Done { elapsed: Duration },
    /// A worker failed; the task's outputs were destroyed.
    Failed { elapsed: Duration, error: String },
}

impl std::fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskOutcome::Skipped => write!(f, "skipped"),
            TaskOutcome::Done { elapsed } => write!(f, "{}", format_elapsed(*elapsed)),
            TaskOutcome::Failed { elapsed, .. } => {
                write!(f, "failed after {}", format_elapsed(*elapsed))
            }
        }
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    if elapsed < Duration::from_secs(1) {
        format!("{:.1}ms", elapsed.as_secs_f64() * 1000.0)
    } else {
        format!("{:.2}s", elapsed.as_secs_f64())
    }
}

/// One node of the report DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportNode {
    pub task: String,
    pub outcome: TaskOutcome,
}

/// The execution DAG emitted by a run.
pub struct Report {
    name: String,
    graph: DiGraph<ReportNode, String>,
}

impl Report {
    pub(crate) fn assemble(
        name: &str,
        run_graph: &RunGraph,
        outcomes: &HashMap<TaskId, TaskOutcome>,
    ) -> Self {
        let graph = run_graph.graph.map(
            |_, task| ReportNode {
                task: task.name().to_string(),
                outcome: outcomes
                    .get(&task.id())
                    .cloned()
                    .unwrap_or(TaskOutcome::Skipped),
            },
            |_, label| label.clone(),
        );
        Self {
            name: name.to_string(),
            graph,
        }
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &ReportNode> {
        self.graph.node_weights()
    }

    /// Outcome of the first node with the given task name.
    pub fn outcome(&self, task: &str) -> Option<&TaskOutcome> {
        self.nodes()
            .find(|node| node.task == task)
            .map(|node| &node.outcome)
    }

    /// Edges as (producer, stream-label, consumer) triples.
    pub fn edges(&self) -> Vec<(&str, &str, &str)> {
        self.graph
            .edge_references()
            .map(|edge| {
                (
                    self.graph[edge.source()].task.as_str(),
                    edge.weight().as_str(),
                    self.graph[edge.target()].task.as_str(),
                )
            })
            .collect()
    }

    /// Render the report as a dot-language document.
    pub fn to_dot(&self) -> String {
        let mut out = format!("digraph {} {{\n", self.name);
        for idx in self.graph.node_indices() {
            let node = &self.graph[idx];
            let label = format!("{}\n{}", node.task, node.outcome);
            out.push_str(&format!("    {:?} [label={:?}];\n", node.task, label));
        }
        for edge in self.graph.edge_references() {
            out.push_str(&format!(
                "    {:?} -> {:?} [label={:?}];\n",
                self.graph[edge.source()].task,
                self.graph[edge.target()].task,
                edge.weight()
            ));
        }
        out.push_str("}\n");
        out
    }
}

impl std::fmt::Display for Report {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_dot())
    }
}

impl std::fmt::Debug for Report {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Report")
            .field("name", &self.name)
            .field("nodes", &self.node_count())
            .field("edges", &self.edge_count())
            .finish()
    }
}

/// A point-in-time view of one stream's buffer.
#[derive(Debug, Clone, Serialize)]
pub struct StreamStat {
    pub label: String,
    pub pending: usize,
    pub at: DateTime<Utc>,
}

/// Snapshot the buffer depth of every stream reachable from the sink.
///
/// Covers each task's outputs plus any externally seeded inputs; streams
/// shared between tasks are reported once.
pub fn buffer_snapshot(sink: &Arc<Task>) -> Vec<StreamStat> {
    let mut seen_tasks = std::collections::HashSet::new();
    let mut seen_streams = std::collections::HashSet::new();
    let mut stats = Vec::new();
    let mut stack = vec![sink.clone()];

    while let Some(task) = stack.pop() {
        if !seen_tasks.insert(task.id()) {
            continue;
        }
        for stream in task.outputs().iter().chain(task.inputs()) {
            let key = Arc::as_ptr(stream) as *const () as usize;
            if !seen_streams.insert(key) {
                continue;
            }
            stats.push(StreamStat {
                label: stream.label(),
                pending: stream.pending(),
                at: Utc::now(),
            });
        }
        for upstream in task.requires() {
            stack.push(upstream.clone());
        }
    }
    stats
}
