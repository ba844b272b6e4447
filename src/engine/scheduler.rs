//! Scheduler: the engine entry point.
//!
//! [`Engine::run`] walks the graph from the sink, then launches one
//! supervisor per non-skipped task. Each supervisor waits for the task's
//! inputs to become ready, records wall-clock timing around the task's
//! worker pool, and installs a fault barrier: a processor error or panic is
//! logged, converted into a `destroy()` of that task's outputs, and
//! annotated in the report. Supervisors are independent; one branch failing
//! or stalling never stops the others.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;

use crate::config::RunConfig;
use crate::core::task::{Task, TaskId};
use crate::engine::report::{Report, TaskOutcome};
use crate::engine::walker::walk;
use crate::error::Result;
use crate::{wlog, wlog_fail, wlog_sched};

type TaskOutcomeMap = Arc<Mutex<HashMap<TaskId, TaskOutcome>>>;

/// Lifecycle events emitted by the engine during a run.
///
/// These let external components observe task transitions without polling.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum RunEvent {
    /// A task's inputs became ready and its workers launched.
    TaskStarted { task: String },
    /// A task's outputs were all pre-materialized; the processor was
    /// bypassed.
    TaskSkipped { task: String },
    /// A task completed normally.
    TaskCompleted { task: String, elapsed: Duration },
    /// A task failed; its outputs were destroyed.
    TaskFailed { task: String, error: String },
    /// Every task reached a terminal state.
    RunFinished,
}

/// The execution engine.
pub struct Engine {
    config: RunConfig,
    events: Option<mpsc::Sender<RunEvent>>,
}

impl Engine {
    pub fn new() -> Self {
        Self::with_config(RunConfig::default())
    }

    pub fn with_config(config: RunConfig) -> Self {
        Self {
            config,
            events: None,
        }
    }

    /// Emit lifecycle events on the given channel during runs.
    pub fn events(mut self, tx: mpsc::Sender<RunEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// The configuration this engine runs with. Backends constructed by the
    /// caller read their poll interval and combine capacity from here.
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    async fn emit(events: &Option<mpsc::Sender<RunEvent>>, event: RunEvent) {
        if let Some(tx) = events {
            let _ = tx.send(event).await;
        }
    }

    /// Resolve the dependency graph of `sink` and execute every reachable
    /// task.
    ///
    /// Returns an error only for graph-construction faults (duplicate edge,
    /// cycle). Processor failures never fail the run; they appear in the
    /// report annotations and in the log.
    pub async fn run(&self, sink: Arc<Task>) -> Result<Report> {
        let run_graph = walk(&sink)?;
        wlog!(
            "run '{}': {} tasks, {} edges",
            self.config.graph_name,
            run_graph.task_count(),
            run_graph.edge_count()
        );

        let tasks: Vec<Arc<Task>> = run_graph.tasks().cloned().collect();
        let outcomes: TaskOutcomeMap = Arc::new(Mutex::new(HashMap::new()));
        let mut supervisors = JoinSet::new();

        for task in tasks {
            if !task.mark_visited() {
                continue;
            }

            if task.is_skipped() {
                wlog!("task '{}' is already done, skip this", task.name());
                task.mark_skipped();
                task.close_outputs().await;
                outcomes
                    .lock()
                    .await
                    .insert(task.id(), TaskOutcome::Skipped);
                Self::emit(
                    &self.events,
                    RunEvent::TaskSkipped {
                        task: task.name().to_string(),
                    },
                )
                .await;
                continue;
            }

            let outcomes = outcomes.clone();
            let events = self.events.clone();
            supervisors.spawn(async move {
                supervise(task, outcomes, events).await;
            });
        }

        while let Some(joined) = supervisors.join_next().await {
            if let Err(err) = joined {
                wlog_fail!("supervisor join error: {}", err);
            }
        }
        Self::emit(&self.events, RunEvent::RunFinished).await;

        let outcomes = outcomes.lock().await.clone();
        Ok(Report::assemble(&self.config.graph_name, &run_graph, &outcomes))
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-task supervisor: await readiness, time the run, convert any failure
/// into `destroy()` on the task's outputs.
async fn supervise(
    task: Arc<Task>,
    outcomes: TaskOutcomeMap,
    events: Option<mpsc::Sender<RunEvent>>,
) {
    wlog_sched!(
        "task '{}' waiting on {} inputs",
        task.name(),
        task.inputs().len()
    );
    task.ready().await;

    wlog!("task '{}' is started", task.name());
    Engine::emit(
        &events,
        RunEvent::TaskStarted {
            task: task.name().to_string(),
        },
    )
    .await;

    let started = Instant::now();
    let result = task.clone().run().await;
    let elapsed = started.elapsed();

    let (outcome, event) = match result {
        Ok(()) => {
            wlog!("task '{}' finished in {}", task.name(), fmt_ms(elapsed));
            (
                TaskOutcome::Done { elapsed },
                RunEvent::TaskCompleted {
                    task: task.name().to_string(),
                    elapsed,
                },
            )
        }
        Err(err) => {
            wlog_fail!("task '{}' got an error: {}", task.name(), err);
            task.destroy_outputs().await;
            (
                TaskOutcome::Failed {
                    elapsed,
                    error: err.to_string(),
                },
                RunEvent::TaskFailed {
                    task: task.name().to_string(),
                    error: err.to_string(),
                },
            )
        }
    };

    outcomes.lock().await.insert(task.id(), outcome);
    Engine::emit(&events, event).await;
}

fn fmt_ms(elapsed: Duration) -> String {
    format!("{:.1}ms", elapsed.as_secs_f64() * 1000.0)
}

/// Resolve and execute the graph behind `sink` with the default
/// configuration.
pub async fn run(sink: Arc<Task>) -> Result<Report> {
    Engine::new().run(sink).await
}
