//! In-memory channel stream.
//!
//! The simplest backend: a bounded channel with the streaming discipline.
//! Readiness fires at construction, skip is always false, and close drops the
//! sender so readers drain the buffer and then observe end-of-stream.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::core::task::Task;
use crate::error::{Error, Result};
use crate::stream::{ProducerCell, ReadySignal, Stream};
use crate::value::Value;

/// A bounded in-memory stream.
///
/// Multiple workers of the producing task may write concurrently (writes are
/// serialized by the write-side lock) and multiple workers of a consuming
/// task may read concurrently, each value delivered to exactly one reader.
pub struct ChannelStream {
    name: String,
    tx: Mutex<Option<mpsc::Sender<Value>>>,
    rx: Mutex<mpsc::Receiver<Value>>,
    depth: AtomicUsize,
    ready: ReadySignal,
    producer: ProducerCell,
}

impl ChannelStream {
    /// Create a channel stream with the given display name and buffer
    /// capacity (clamped to at least 1).
    pub fn new(name: &str, capacity: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Arc::new(Self {
            name: name.to_string(),
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(rx),
            depth: AtomicUsize::new(0),
            ready: ReadySignal::fired(),
            producer: ProducerCell::new(),
        })
    }
}

impl std::fmt::Debug for ChannelStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelStream")
            .field("name", &self.name)
            .field("pending", &self.pending())
            .finish()
    }
}

#[async_trait]
impl Stream for ChannelStream {
    fn label(&self) -> String {
        format!("chan:{}", self.name)
    }

    fn is_skip(&self) -> bool {
        false
    }

    fn pending(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    fn producers(&self) -> Vec<Arc<Task>> {
        self.producer.get().into_iter().collect()
    }

    fn bind_producer(&self, task: &Arc<Task>) {
        self.producer.bind(task);
    }

    async fn ready(&self) {
        self.ready.wait().await;
    }

    async fn write(&self, value: Value) -> Result<()> {
        // The lock is held across the send so writes stay serialized and a
        // concurrent close cannot slip a value past a drained receiver.
        let guard = self.tx.lock().await;
        let tx = guard
            .as_ref()
            .ok_or_else(|| Error::WriteToClosed(self.label()))?;
        self.depth.fetch_add(1, Ordering::Relaxed);
        if tx.send(value).await.is_err() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
            return Err(Error::WriteToClosed(self.label()));
        }
        Ok(())
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
        self.tx.lock().await.take();
        Ok(())
    }

    async fn destroy(&self) {
        let _ = self.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_write_then_read() {
        let stream = ChannelStream::new("numbers", 4);
        stream.write(Value::Int(1)).await.unwrap();
        stream.write(Value::Int(2)).await.unwrap();

        assert_eq!(stream.pending(), 2);
        assert_eq!(stream.read().await.unwrap(), Some(Value::Int(1)));
        assert_eq!(stream.read().await.unwrap(), Some(Value::Int(2)));
        assert_eq!(stream.pending(), 0);
    }

    #[tokio::test]
    async fn test_channel_close_ends_stream() {
        let stream = ChannelStream::new("numbers", 4);
        stream.write(Value::Int(1)).await.unwrap();
        stream.close().await.unwrap();

        // Buffered value drains first, then end-of-stream.
        assert_eq!(stream.read().await.unwrap(), Some(Value::Int(1)));
        assert_eq!(stream.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_channel_write_after_close_fails() {
        let stream = ChannelStream::new("numbers", 4);
        stream.close().await.unwrap();
        assert!(matches!(
            stream.write(Value::Int(1)).await.unwrap_err(),
            Error::WriteToClosed(_)
        ));
    }

    #[tokio::test]
    async fn test_channel_close_is_idempotent() {
        let stream = ChannelStream::new("numbers", 4);
        stream.close().await.unwrap();
        stream.close().await.unwrap();
        assert_eq!(stream.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_channel_is_ready_immediately() {
        let stream = ChannelStream::new("numbers", 1);
        stream.ready().await;
        assert!(!stream.is_skip());
    }

    #[tokio::test]
    async fn test_channel_blocked_write_resumes_after_read() {
        let stream = ChannelStream::new("tight", 1);
        stream.write(Value::Int(1)).await.unwrap();

        let writer = {
            let stream = stream.clone();
            tokio::spawn(async move { stream.write(Value::Int(2)).await })
        };

        assert_eq!(stream.read().await.unwrap(), Some(Value::Int(1)));
        writer.await.unwrap().unwrap();
        assert_eq!(stream.read().await.unwrap(), Some(Value::Int(2)));
    }

    #[tokio::test]
    async fn test_channel_label() {
        let stream = ChannelStream::new("numbers", 1);
        assert_eq!(stream.label(), "chan:numbers");
    }
}
