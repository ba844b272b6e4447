//! Multi-source fan-in.
//!
//! [`combine`] merges N upstream streams into one: a forwarder task per
//! upstream moves values into a shared channel, so the combined sequence is a
//! non-deterministic interleaving that preserves order within each upstream.
//! When every upstream has closed, the combined stream closes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::{mpsc, Mutex};

use crate::config::DEFAULT_COMBINE_CAPACITY;
use crate::core::task::Task;
use crate::error::{Error, Result};
use crate::stream::{EmptyStream, Stream};
use crate::value::Value;
use crate::wlog_fail;

/// Combine multiple streams into a single fan-in stream.
///
/// Combining zero streams yields an [`EmptyStream`]. Must be called from
/// within a tokio runtime: the forwarders are spawned immediately.
pub fn combine(streams: Vec<Arc<dyn Stream>>) -> Arc<dyn Stream> {
    combine_with_capacity(streams, DEFAULT_COMBINE_CAPACITY)
}

/// [`combine`] with an explicit buffer capacity for the merged channel.
pub fn combine_with_capacity(streams: Vec<Arc<dyn Stream>>, capacity: usize) -> Arc<dyn Stream> {
    if streams.is_empty() {
        return EmptyStream::new();
    }
    Arc::new(CombinedStream::new(streams, capacity))
}

/// A stream whose sequence interleaves N upstream sequences.
///
/// The producer set is the union of the upstreams' producer sets; readiness
/// is the readiness of all upstreams.
pub struct CombinedStream {
    upstreams: Vec<Arc<dyn Stream>>,
    rx: Mutex<mpsc::Receiver<Value>>,
    depth: Arc<AtomicUsize>,
}

impl CombinedStream {
    fn new(upstreams: Vec<Arc<dyn Stream>>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let depth = Arc::new(AtomicUsize::new(0));

        for upstream in &upstreams {
            let upstream = upstream.clone();
            let tx = tx.clone();
            let depth = depth.clone();
            tokio::spawn(async move {
                loop {
                    match upstream.read().await {
                        Ok(Some(value)) => {
                            depth.fetch_add(1, Ordering::Relaxed);
                            if tx.send(value).await.is_err() {
                                depth.fetch_sub(1, Ordering::Relaxed);
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            wlog_fail!(
                                "combined input '{}' read error: {}",
                                upstream.label(),
                                err
                            );
                            break;
                        }
                    }
                }
            });
        }
        // The forwarders hold the only senders; when all upstreams close,
        // the merged channel closes.
        drop(tx);

        Self {
            upstreams,
            rx: Mutex::new(rx),
            depth,
        }
    }
}

impl std::fmt::Debug for CombinedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CombinedStream")
            .field("upstreams", &self.upstreams.len())
            .field("pending", &self.pending())
            .finish()
    }
}

#[async_trait]
impl Stream for CombinedStream {
    fn label(&self) -> String {
        let labels: Vec<String> = self.upstreams.iter().map(|s| s.label()).collect();
        format!("combine({})", labels.join(","))
    }

    fn is_skip(&self) -> bool {
        self.upstreams.iter().all(|s| s.is_skip())
    }

    fn pending(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    fn producers(&self) -> Vec<Arc<Task>> {
        let mut seen = std::collections::HashSet::new();
        let mut producers = Vec::new();
        for upstream in &self.upstreams {
            for task in upstream.producers() {
                if seen.insert(task.id()) {
                    producers.push(task);
                }
            }
        }
        producers
    }

    fn bind_producer(&self, _task: &Arc<Task>) {}

    async fn ready(&self) {
        join_all(self.upstreams.iter().map(|s| s.ready())).await;
    }

    async fn write(&self, _value: Value) -> Result<()> {
        Err(Error::WriteToClosed(self.label()))
    }

    async fn read(&self) -> Result<Option<Value>> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(value) => {
                self.depth.fetch_sub(1, Ordering::Relaxed);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn destroy(&self) {}
}
