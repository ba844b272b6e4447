//! Stream contract and shared stream machinery.
//!
//! A stream is a one-directional buffered conduit of [`Value`]s between a
//! producer task and one or more consumer-side readers. Every backend
//! implements the [`Stream`] trait and one of two readiness disciplines:
//!
//! - **streaming**: readiness fires at construction, producer and consumer
//!   overlap;
//! - **buffered**: readiness fires at producer close, gating consumers until
//!   the backend has flushed durable storage.
//!
//! Streams report the task that produces them through a weak back-reference
//! ([`ProducerCell`]) so the dependency walker can traverse the graph
//! backwards without ownership cycles.

pub mod channel;
pub mod combine;
pub mod file;
pub mod object;

use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tokio::sync::watch;

use crate::core::task::Task;
use crate::error::{Error, Result};
use crate::value::Value;

/// The stream contract every backend implements.
///
/// Reads block until a value is available or the stream closes; writes block
/// while the buffer is full and fail once the stream is closed or in skip
/// state. `close` is idempotent from the producer side; `destroy` releases
/// backend resources and, for persistent backends, removes the artifact.
#[async_trait]
pub trait Stream: Send + Sync {
    /// Stable human-readable description, used as the edge label in the
    /// execution graph.
    fn label(&self) -> String;

    /// True iff the backend found a prior materialization of this stream's
    /// content at construction.
    fn is_skip(&self) -> bool;

    /// Number of values currently buffered, for operational snapshots.
    fn pending(&self) -> usize {
        0
    }

    /// The tasks that produce this stream. Empty for externally seeded
    /// streams; more than one for a combined stream.
    fn producers(&self) -> Vec<Arc<Task>>;

    /// Record the producing task. Called once, at task construction.
    fn bind_producer(&self, task: &Arc<Task>);

    /// Resolve when downstream consumers may begin reading.
    async fn ready(&self);

    /// Append a value. Blocks while the buffer is full.
    async fn write(&self, value: Value) -> Result<()>;

    /// Take the next value; `Ok(None)` signals end-of-stream.
    async fn read(&self) -> Result<Option<Value>>;

    /// Close the producer side. Further writes fail.
    async fn close(&self) -> Result<()>;

    /// Release backend resources; persistent backends remove their artifact.
    async fn destroy(&self);
}

/// One-shot readiness signal shared by all backends.
///
/// Built on a watch channel so any number of waiters observe the transition,
/// including waiters that subscribe after it fired.
#[derive(Debug)]
pub struct ReadySignal {
    tx: watch::Sender<bool>,
}

impl ReadySignal {
    /// A signal that has not fired yet (buffered discipline).
    pub fn armed() -> Self {
        Self {
            tx: watch::channel(false).0,
        }
    }

    /// A signal that fired at construction (streaming discipline).
    pub fn fired() -> Self {
        Self {
            tx: watch::channel(true).0,
        }
    }

    /// Fire the signal. Idempotent.
    pub fn fire(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the signal has fired.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as self, so wait_for cannot fail while
        // a waiter holds the stream.
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

/// Weak back-reference from a stream to its producing task.
#[derive(Debug, Default)]
pub struct ProducerCell(Mutex<Option<Weak<Task>>>);

impl ProducerCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, task: &Arc<Task>) {
        if let Ok(mut slot) = self.0.lock() {
            *slot = Some(Arc::downgrade(task));
        }
    }

    pub fn get(&self) -> Option<Arc<Task>> {
        self.0
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().and_then(Weak::upgrade))
    }
}

/// A stream with no producer: permanently ready and permanently closed.
///
/// Used for externally seeded inputs and for combining over zero streams.
#[derive(Debug, Default)]
pub struct EmptyStream;

impl EmptyStream {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

#[async_trait]
impl Stream for EmptyStream {
    fn label(&self) -> String {
        "empty".to_string()
    }

    fn is_skip(&self) -> bool {
        false
    }

    fn producers(&self) -> Vec<Arc<Task>> {
        Vec::new()
    }

    fn bind_producer(&self, _task: &Arc<Task>) {}

    async fn ready(&self) {}

    async fn write(&self, _value: Value) -> Result<()> {
        Err(Error::WriteToClosed(self.label()))
    }

    async fn read(&self) -> Result<Option<Value>> {
        Ok(None)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn destroy(&self) {}
}
