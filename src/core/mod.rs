//! Core domain model of the engine.
//!
//! This module contains the task node: the named unit of work that owns its
//! input and output streams, a processor, and a worker pool.

pub mod task;

pub use task::{Processor, Task, TaskBuilder, TaskId, TaskState};
