//! Task node: a named unit of work with inputs, outputs, a processor, and a
//! worker pool.
//!
//! Tasks are built bottom-up: a producer is constructed first, its output
//! streams are handed to downstream builders as inputs, and the dependency
//! set (`requires`) falls out of the producer identities those streams carry.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::stream::Stream;
use crate::{wlog_sched, wlog_stream};

/// Unique identifier for a task within a run.
///
/// Identity, not name, is the engine's deduplication key: visit-once
/// scheduling and graph caches are keyed by `TaskId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First 8 characters of the UUID, for compact log lines.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Constructed, not yet scheduled or waiting on inputs.
    Pending,
    /// Workers are executing the processor.
    Running,
    /// All outputs were already materialized; the processor never ran.
    Skipped,
    /// All workers completed and outputs are closed.
    Done,
    /// A worker returned an error or panicked; outputs were destroyed.
    Failed,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::Running => write!(f, "running"),
            TaskState::Skipped => write!(f, "skipped"),
            TaskState::Done => write!(f, "done"),
            TaskState::Failed => write!(f, "failed"),
        }
    }
}

/// The user function a task executes, once per worker.
///
/// Each invocation receives the task handle and competes with its peers for
/// reads on the shared inputs.
pub type Processor = Arc<dyn Fn(Arc<Task>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A named node in the dataflow graph.
pub struct Task {
    id: TaskId,
    name: String,
    inputs: Vec<Arc<dyn Stream>>,
    outputs: Vec<Arc<dyn Stream>>,
    processor: Processor,
    workers: usize,
    requires: Vec<Arc<Task>>,
    visited: AtomicBool,
    started: AtomicBool,
    state: Mutex<TaskState>,
}

impl Task {
    /// Start building a task with the given name.
    pub fn builder(name: &str) -> TaskBuilder {
        TaskBuilder::new(name)
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inputs(&self) -> &[Arc<dyn Stream>] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[Arc<dyn Stream>] {
        &self.outputs
    }

    /// Input stream by index. Panics if the index is out of range; inside a
    /// processor the panic is caught by the worker fault barrier.
    pub fn input(&self, idx: usize) -> Arc<dyn Stream> {
        self.inputs[idx].clone()
    }

    /// Output stream by index. Panics if the index is out of range.
    pub fn output(&self, idx: usize) -> Arc<dyn Stream> {
        self.outputs[idx].clone()
    }

    /// Upstream tasks this task depends on, deduplicated by identity.
    pub fn requires(&self) -> &[Arc<Task>] {
        &self.requires
    }

    pub fn state(&self) -> TaskState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(TaskState::Pending)
    }

    fn set_state(&self, next: TaskState) {
        if let Ok(mut state) = self.state.lock() {
            *state = next;
        }
    }

    /// True iff the task has outputs and every output reports skip.
    ///
    /// A task with no outputs is never considered pre-satisfied.
    pub fn is_skipped(&self) -> bool {
        !self.outputs.is_empty() && self.outputs.iter().all(|out| out.is_skip())
    }

    /// Atomically claim this task for scheduling. Returns true on the first
    /// call only; a second consumer referencing the task may not reschedule
    /// it.
    pub(crate) fn mark_visited(&self) -> bool {
        !self.visited.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn mark_skipped(&self) {
        self.set_state(TaskState::Skipped);
    }

    /// Resolve when every input stream is ready. The waits run in parallel
    /// so the aggregate latency is the maximum, not the sum.
    pub async fn ready(&self) {
        join_all(self.inputs.iter().map(|input| input.ready())).await;
    }

    /// Execute the task: launch the worker pool, wait for every worker, and
    /// close all outputs. Runs at most once per task.
    ///
    /// On success the outputs are closed here; on failure the caller is
    /// expected to destroy them (which also closes them for downstream
    /// readers).
    pub(crate) async fn run(self: Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.set_state(TaskState::Running);
        wlog_sched!("task '{}' launching {} workers", self.name, self.workers);

        let mut workers = JoinSet::new();
        for worker in 0..self.workers {
            let task = self.clone();
            let processor = self.processor.clone();
            workers.spawn(async move {
                wlog_stream!("task '{}' worker {} started", task.name, worker);
                (processor)(task).await
            });
        }

        let mut failure: Option<Error> = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    failure.get_or_insert(Error::Processor {
                        task: self.name.clone(),
                        message: err.to_string(),
                    });
                }
                Err(join_err) => {
                    let message = if join_err.is_panic() {
                        format!("worker panicked: {}", join_err)
                    } else {
                        join_err.to_string()
                    };
                    failure.get_or_insert(Error::Processor {
                        task: self.name.clone(),
                        message,
                    });
                }
            }
        }

        match failure {
            None => {
                self.close_outputs().await;
                self.set_state(TaskState::Done);
                Ok(())
            }
            Some(err) => {
                self.set_state(TaskState::Failed);
                Err(err)
            }
        }
    }

    /// Close every output exactly once, so downstream readers observe
    /// end-of-stream.
    pub(crate) async fn close_outputs(&self) {
        for out in &self.outputs {
            if let Err(err) = out.close().await {
                wlog_sched!("task '{}': close {}: {}", self.name, out.label(), err);
            }
        }
    }

    /// Destroy every output, removing persisted artifacts.
    pub(crate) async fn destroy_outputs(&self) {
        for out in &self.outputs {
            out.destroy().await;
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id.short())
            .field("name", &self.name)
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.outputs.len())
            .field("workers", &self.workers)
            .field("state", &self.state())
            .finish()
    }
}

/// Builder for [`Task`].
pub struct TaskBuilder {
    name: String,
    inputs: Vec<Arc<dyn Stream>>,
    outputs: Vec<Arc<dyn Stream>>,
    processor: Option<Processor>,
    workers: usize,
}

impl TaskBuilder {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            processor: None,
            workers: 1,
        }
    }

    pub fn input(mut self, stream: Arc<dyn Stream>) -> Self {
        self.inputs.push(stream);
        self
    }

    pub fn inputs<I>(mut self, streams: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn Stream>>,
    {
        self.inputs.extend(streams);
        self
    }

    pub fn output(mut self, stream: Arc<dyn Stream>) -> Self {
        self.outputs.push(stream);
        self
    }

    pub fn outputs<I>(mut self, streams: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn Stream>>,
    {
        self.outputs.extend(streams);
        self
    }

    /// Number of concurrent processor invocations. Clamped to at least 1.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// The user function each worker runs.
    pub fn processor<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<Task>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.processor = Some(Arc::new(move |task| f(task).boxed()));
        self
    }

    /// Finalize the task: derive `requires` from the input streams'
    /// producers and bind this task as the producer of its outputs.
    pub fn build(self) -> Arc<Task> {
        let mut seen = HashSet::new();
        let mut requires = Vec::new();
        for input in &self.inputs {
            for producer in input.producers() {
                if seen.insert(producer.id()) {
                    requires.push(producer);
                }
            }
        }

        let processor: Processor = self
            .processor
            .unwrap_or_else(|| Arc::new(|_| async { Ok(()) }.boxed()));

        let task = Arc::new(Task {
            id: TaskId::new(),
            name: self.name,
            inputs: self.inputs,
            outputs: self.outputs,
            processor,
            workers: self.workers,
            requires,
            visited: AtomicBool::new(false),
            started: AtomicBool::new(false),
            state: Mutex::new(TaskState::Pending),
        });
        for out in task.outputs.iter() {
            out.bind_producer(&task);
        }
        task
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::channel::ChannelStream;
    use crate::value::Value;

    // TaskId tests

    #[test]
    fn test_task_id_unique() {
        assert_ne!(TaskId::new(), TaskId::new());
    }

    #[test]
    fn test_task_id_short() {
        assert_eq!(TaskId::new().short().len(), 8);
    }

    // TaskState tests

    #[test]
    fn test_task_state_display() {
        assert_eq!(format!("{}", TaskState::Pending), "pending");
        assert_eq!(format!("{}", TaskState::Running), "running");
        assert_eq!(format!("{}", TaskState::Skipped), "skipped");
        assert_eq!(format!("{}", TaskState::Done), "done");
        assert_eq!(format!("{}", TaskState::Failed), "failed");
    }

    // Construction tests

    #[test]
    fn test_builder_defaults() {
        let task = Task::builder("noop").build();
        assert_eq!(task.name(), "noop");
        assert!(task.inputs().is_empty());
        assert!(task.outputs().is_empty());
        assert!(task.requires().is_empty());
        assert_eq!(task.state(), TaskState::Pending);
    }

    #[test]
    fn test_builder_workers_clamped() {
        let task = Task::builder("w").workers(0).build();
        assert_eq!(task.workers, 1);
    }

    #[test]
    fn test_build_binds_producer() {
        let out = ChannelStream::new("out", 1);
        let task = Task::builder("producer").output(out.clone()).build();

        let producers = out.producers();
        assert_eq!(producers.len(), 1);
        assert_eq!(producers[0].id(), task.id());
    }

    #[test]
    fn test_requires_derived_from_inputs() {
        let out = ChannelStream::new("out", 1);
        let producer = Task::builder("producer").output(out.clone()).build();
        let consumer = Task::builder("consumer").input(out).build();

        assert_eq!(consumer.requires().len(), 1);
        assert_eq!(consumer.requires()[0].id(), producer.id());
    }

    #[test]
    fn test_requires_deduplicates_by_identity() {
        let out_a = ChannelStream::new("a", 1);
        let out_b = ChannelStream::new("b", 1);
        let producer = Task::builder("producer")
            .output(out_a.clone())
            .output(out_b.clone())
            .build();

        // Two distinct streams from the same producer: one dependency.
        let consumer = Task::builder("consumer")
            .input(out_a)
            .input(out_b)
            .build();
        assert_eq!(consumer.requires().len(), 1);
        assert_eq!(consumer.requires()[0].id(), producer.id());
    }

    // Skip-detection tests

    #[test]
    fn test_task_without_outputs_never_skipped() {
        let task = Task::builder("sink").build();
        assert!(!task.is_skipped());
    }

    #[test]
    fn test_task_with_active_outputs_not_skipped() {
        let task = Task::builder("producer")
            .output(ChannelStream::new("out", 1))
            .build();
        assert!(!task.is_skipped());
    }

    // Visit-once tests

    #[test]
    fn test_mark_visited_first_call_only() {
        let task = Task::builder("once").build();
        assert!(task.mark_visited());
        assert!(!task.mark_visited());
    }

    // Readiness tests

    #[tokio::test]
    async fn test_ready_with_no_inputs_is_immediate() {
        let task = Task::builder("source").build();
        task.ready().await;
    }

    #[tokio::test]
    async fn test_ready_waits_for_all_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let gated = crate::stream::file::FileStream::buffered_with(
            dir.path().join("gate.txt"),
            crate::codec::Codec::text(),
            std::time::Duration::from_millis(10),
        )
        .unwrap();
        let open = ChannelStream::new("open", 1);
        let task = Task::builder("consumer")
            .input(open)
            .input(gated.clone())
            .build();

        let waiter = {
            let task = task.clone();
            tokio::spawn(async move { task.ready().await })
        };
        assert!(!waiter.is_finished());

        gated.close().await.unwrap();
        waiter.await.unwrap();
    }

    // Execution tests

    #[tokio::test]
    async fn test_run_executes_workers_and_closes_outputs() {
        let out = ChannelStream::new("out", 16);
        let task = Task::builder("producer")
            .output(out.clone())
            .workers(3)
            .processor(|task| async move {
                task.output(0).write(Value::Int(1)).await?;
                Ok(())
            })
            .build();

        task.clone().run().await.unwrap();
        assert_eq!(task.state(), TaskState::Done);

        // One value per worker, then end-of-stream from the close.
        let mut count = 0;
        while out.read().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn test_run_is_once() {
        let out = ChannelStream::new("out", 16);
        let task = Task::builder("producer")
            .output(out.clone())
            .processor(|task| async move {
                task.output(0).write(Value::Int(7)).await?;
                Ok(())
            })
            .build();

        task.clone().run().await.unwrap();
        task.clone().run().await.unwrap();

        let mut count = 0;
        while out.read().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_run_processor_error_marks_failed() {
        let out = ChannelStream::new("out", 1);
        let task = Task::builder("broken")
            .output(out)
            .processor(|_| async {
                Err(crate::Error::Backend {
                    label: "x".to_string(),
                    message: "boom".to_string(),
                })
            })
            .build();

        let err = task.clone().run().await.unwrap_err();
        assert!(matches!(err, Error::Processor { .. }));
        assert_eq!(task.state(), TaskState::Failed);
    }

    #[tokio::test]
    async fn test_run_processor_panic_is_caught() {
        let task = Task::builder("panicky")
            .processor(|_| async { panic!("worker exploded") })
            .build();

        let err = task.clone().run().await.unwrap_err();
        match err {
            Error::Processor { task, message } => {
                assert_eq!(task, "panicky");
                assert!(message.contains("panic"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_workers_compete_for_shared_input() {
        let input = ChannelStream::new("in", 16);
        for n in 0..10 {
            input.write(Value::Int(n)).await.unwrap();
        }
        input.close().await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = seen.clone();
            Task::builder("sink")
                .input(input)
                .workers(3)
                .processor(move |task| {
                    let seen = seen.clone();
                    async move {
                        while let Some(value) = task.input(0).read().await? {
                            if let Ok(mut seen) = seen.lock() {
                                seen.push(value.as_int().unwrap_or(-1));
                            }
                        }
                        Ok(())
                    }
                })
                .build()
        };

        sink.clone().run().await.unwrap();

        let mut got = seen.lock().unwrap().clone();
        got.sort_unstable();
        assert_eq!(got, (0..10).collect::<Vec<i64>>());
    }
}
