//! weir: an in-process dataflow execution engine.
//!
//! A computation is described as a directed acyclic graph of named tasks
//! connected by streams. The engine resolves the dependency order from a
//! sink task, wires stream readiness, launches a worker pool per task,
//! isolates per-task failures, and emits a dot-language report of the graph
//! that actually ran.
//!
//! Streams decide their own readiness discipline: in-memory channels let
//! producer and consumer overlap, while persistent backends (files, object
//! stores) can gate consumers until the producer has closed. A stream whose
//! backing artifact already exists reports skip, and a task whose every
//! output is in skip state is bypassed entirely, which makes reruns of a
//! materialized pipeline cheap.
//!
//! ```ignore
//! use weir::{ChannelStream, Task, Value};
//!
//! #[tokio::main]
//! async fn main() -> weir::Result<()> {
//!     let numbers = ChannelStream::new("numbers", 1);
//!     let _producer = Task::builder("producer")
//!         .output(numbers.clone())
//!         .processor(|task| async move {
//!             for n in 0..10 {
//!                 task.output(0).write(Value::Int(n)).await?;
//!             }
//!             Ok(())
//!         })
//!         .build();
//!     let sink = Task::builder("sink")
//!         .input(numbers)
//!         .workers(3)
//!         .processor(|task| async move {
//!             while let Some(value) = task.input(0).read().await? {
//!                 println!("{}", value);
//!             }
//!             Ok(())
//!         })
//!         .build();
//!
//!     let report = weir::run(sink).await?;
//!     println!("{}", report.to_dot());
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod log;
pub mod stream;
pub(crate) mod util;
pub mod value;

pub use crate::core::task::{Processor, Task, TaskBuilder, TaskId, TaskState};
pub use codec::Codec;
pub use config::RunConfig;
pub use engine::report::{buffer_snapshot, Report, ReportNode, StreamStat, TaskOutcome};
pub use engine::scheduler::{run, Engine, RunEvent};
pub use error::{Error, Result};
pub use stream::channel::ChannelStream;
pub use stream::combine::{combine, combine_with_capacity};
pub use stream::file::FileStream;
pub use stream::object::{FsObjectStore, ObjectStore, ObjectStream};
pub use stream::{EmptyStream, Stream};
pub use value::Value;
