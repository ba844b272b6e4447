//! Line-oriented file streams.
//!
//! Records are encoded by a [`Codec`] and written one per newline-terminated
//! line. A blocking tail thread follows the file, polling on end-of-file
//! until the writer signals done, so a consumer can start reading while the
//! producer is still appending.
//!
//! Two disciplines share the implementation:
//!
//! - [`FileStream::streaming`]: readiness fires at construction; producer
//!   and consumer overlap.
//! - [`FileStream::buffered`]: readiness fires at close; consumers are
//!   gated until the file has been fully written and flushed.
//!
//! If the path already exists at construction the stream enters skip state:
//! no writer is opened, writes fail, and the existing content is served to
//! readers untouched.
//!
//! Concurrent workers writing to one file stream are serialized by the
//! write-side lock, but a record is not transactional against a crash
//! mid-write: a partially written final line is possible.

use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::codec::Codec;
use crate::config::DEFAULT_POLL_INTERVAL_MS;
use crate::core::task::Task;
use crate::error::{Error, Result};
use crate::stream::{ProducerCell, ReadySignal, Stream};
use crate::util::blocking;
use crate::value::Value;
use crate::{wlog_fail, wlog_sched};

const TAIL_CHANNEL_CAPACITY: usize = 64;

/// Which readiness discipline a file stream follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Discipline {
    Streaming,
    Buffered,
}

/// Reader side of a tailed file: decoded records arrive on a channel fed by
/// a blocking thread that polls past end-of-file until `done` is set.
struct Tail {
    rx: Mutex<mpsc::Receiver<Value>>,
    done: Arc<AtomicBool>,
    depth: Arc<AtomicUsize>,
}

fn spawn_tail(file: File, codec: Codec, poll: Duration, label: String) -> Tail {
    let (tx, rx) = mpsc::channel(TAIL_CHANNEL_CAPACITY);
    let done = Arc::new(AtomicBool::new(false));
    let depth = Arc::new(AtomicUsize::new(0));

    let thread_done = done.clone();
    let thread_depth = depth.clone();
    tokio::task::spawn_blocking(move || {
        let mut reader = BufReader::new(file);
        // Accumulates one logical line across polls; a line without its
        // terminator is still being written and must not be delivered yet.
        let mut line = String::new();

        let deliver = |raw: &str| -> bool {
            match codec.decode(raw.as_bytes()) {
                Ok(value) => {
                    thread_depth.fetch_add(1, Ordering::Relaxed);
                    if tx.blocking_send(value).is_err() {
                        thread_depth.fetch_sub(1, Ordering::Relaxed);
                        return false;
                    }
                    true
                }
                Err(err) => {
                    wlog_fail!("tail {}: decode error: {}", label, err);
                    true
                }
            }
        };

        loop {
            match reader.read_line(&mut line) {
                Ok(0) => {
                    if thread_done.load(Ordering::SeqCst) {
                        // Writer is gone; one more read to catch a final
                        // flush that raced the done flag.
                        match reader.read_line(&mut line) {
                            Ok(0) | Err(_) => {
                                if !line.is_empty() {
                                    deliver(line.trim_end_matches('\n'));
                                }
                                break;
                            }
                            Ok(_) => {}
                        }
                    } else {
                        // No reader left means nobody can ever observe a
                        // value; stop tailing instead of polling forever.
                        if tx.is_closed() {
                            break;
                        }
                        std::thread::sleep(poll);
                        continue;
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    wlog_fail!("tail {}: read error: {}", label, err);
                    break;
                }
            }
            if line.ends_with('\n') {
                if !deliver(line.trim_end_matches('\n')) {
                    break;
                }
                line.clear();
            }
        }
        wlog_sched!("tail {} finished", label);
    });

    Tail { rx: Mutex::new(rx), done, depth }
}

/// A stream persisted as a newline-delimited local file.
pub struct FileStream {
    path: PathBuf,
    writer: Mutex<Option<File>>,
    tail: Tail,
    codec: Codec,
    skip: bool,
    discipline: Discipline,
    ready: ReadySignal,
    producer: ProducerCell,
}

impl FileStream {
    /// Streaming-discipline file stream with the default codec and poll
    /// interval. Ready immediately; producer and consumer overlap.
    pub fn streaming(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        Self::streaming_with(path, Codec::default(), default_poll())
    }

    /// [`FileStream::streaming`] with an explicit codec and poll interval.
    pub fn streaming_with(
        path: impl AsRef<Path>,
        codec: Codec,
        poll: Duration,
    ) -> Result<Arc<Self>> {
        Self::open(path.as_ref(), codec, poll, Discipline::Streaming)
    }

    /// Buffered-discipline file stream: readiness fires at close, gating
    /// consumers until the producer has completed.
    pub fn buffered(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        Self::buffered_with(path, Codec::default(), default_poll())
    }

    /// [`FileStream::buffered`] with an explicit codec and poll interval.
    pub fn buffered_with(
        path: impl AsRef<Path>,
        codec: Codec,
        poll: Duration,
    ) -> Result<Arc<Self>> {
        Self::open(path.as_ref(), codec, poll, Discipline::Buffered)
    }

    fn open(path: &Path, codec: Codec, poll: Duration, discipline: Discipline) -> Result<Arc<Self>> {
        let skip = path.exists();
        let writer = if skip { None } else { Some(File::create(path)?) };
        let reader = File::open(path)?;

        let label = match discipline {
            Discipline::Streaming => format!("file:{}", path.display()),
            Discipline::Buffered => format!("file-buffer:{}", path.display()),
        };
        let tail = spawn_tail(reader, codec.clone(), poll, label);

        let ready = match discipline {
            Discipline::Streaming => ReadySignal::fired(),
            Discipline::Buffered => ReadySignal::armed(),
        };

        Ok(Arc::new(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(writer),
            tail,
            codec,
            skip,
            discipline,
            ready,
            producer: ProducerCell::new(),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn default_poll() -> Duration {
    Duration::from_millis(DEFAULT_POLL_INTERVAL_MS)
}

impl std::fmt::Debug for FileStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStream")
            .field("path", &self.path)
            .field("discipline", &self.discipline)
            .field("skip", &self.skip)
            .finish()
    }
}

#[async_trait]
impl Stream for FileStream {
    fn label(&self) -> String {
        match self.discipline {
            Discipline::Streaming => format!("file:{}", self.path.display()),
            Discipline::Buffered => format!("file-buffer:{}", self.path.display()),
        }
    }

    fn is_skip(&self) -> bool {
        self.skip
    }

    fn pending(&self) -> usize {
        self.tail.depth.load(Ordering::Relaxed)
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
        let mut encoded = self.codec.encode(&value)?;
        encoded.push(b'\n');

        // The guard is held across the write so concurrent workers stay
        // serialized; the file handle travels through the worker thread and
        // comes back.
        let mut guard = self.writer.lock().await;
        let mut file = guard
            .take()
            .ok_or_else(|| Error::WriteToClosed(self.label()))?;
        let (file, written) = blocking(move || {
            let written = file.write_all(&encoded);
            Ok((file, written))
        })
        .await?;
        *guard = Some(file);
        written?;
        Ok(())
    }

    async fn read(&self) -> Result<Option<Value>> {
        let mut rx = self.tail.rx.lock().await;
        match rx.recv().await {
            Some(value) => {
                self.tail.depth.fetch_sub(1, Ordering::Relaxed);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn close(&self) -> Result<()> {
        // Dropping the writer flushes and closes the handle; the done flag
        // lets the tail drain whatever is left and then end the sequence.
        self.writer.lock().await.take();
        self.tail.done.store(true, Ordering::SeqCst);
        if self.discipline == Discipline::Buffered {
            self.ready.fire();
        }
        Ok(())
    }

    async fn destroy(&self) {
        let _ = self.close().await;
        let path = self.path.clone();
        if let Err(err) = blocking(move || Ok(std::fs::remove_file(&path)?)).await {
            wlog_sched!("destroy {}: {}", self.label(), err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fast_poll() -> Duration {
        Duration::from_millis(10)
    }

    #[tokio::test]
    async fn test_streaming_file_roundtrip_in_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lines.txt");
        let stream =
            FileStream::streaming_with(&path, Codec::text(), fast_poll()).unwrap();

        for text in ["a", "b", "c"] {
            stream.write(Value::from(text)).await.unwrap();
        }
        stream.close().await.unwrap();

        let mut got = Vec::new();
        while let Some(value) = stream.read().await.unwrap() {
            got.push(value.as_text());
        }
        assert_eq!(got, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_streaming_file_reader_overlaps_writer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("overlap.txt");
        let stream =
            FileStream::streaming_with(&path, Codec::text(), fast_poll()).unwrap();

        stream.ready().await;
        stream.write(Value::from("first")).await.unwrap();

        // Read before close: the tail delivers the line while the writer is
        // still open.
        assert_eq!(
            stream.read().await.unwrap(),
            Some(Value::from("first"))
        );
        stream.close().await.unwrap();
        assert_eq!(stream.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_buffered_file_ready_fires_on_close() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gated.txt");
        let stream =
            FileStream::buffered_with(&path, Codec::text(), fast_poll()).unwrap();

        let waiter = {
            let stream = stream.clone();
            tokio::spawn(async move {
                stream.ready().await;
            })
        };
        stream.write(Value::from("payload")).await.unwrap();
        assert!(!waiter.is_finished());

        stream.close().await.unwrap();
        waiter.await.unwrap();

        assert_eq!(stream.read().await.unwrap(), Some(Value::from("payload")));
        assert_eq!(stream.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_existing_file_sets_skip_and_rejects_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("done.txt");
        std::fs::write(&path, "kept\n").unwrap();

        let stream =
            FileStream::streaming_with(&path, Codec::text(), fast_poll()).unwrap();
        assert!(stream.is_skip());
        assert!(matches!(
            stream.write(Value::from("new")).await.unwrap_err(),
            Error::WriteToClosed(_)
        ));

        // Existing content is served untouched once the stream is closed.
        stream.close().await.unwrap();
        assert_eq!(stream.read().await.unwrap(), Some(Value::from("kept")));
        assert_eq!(stream.read().await.unwrap(), None);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "kept\n");
    }

    #[tokio::test]
    async fn test_destroy_removes_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doomed.txt");
        let stream =
            FileStream::buffered_with(&path, Codec::text(), fast_poll()).unwrap();
        stream.write(Value::from("gone")).await.unwrap();
        assert!(path.exists());

        stream.destroy().await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_default_codec_yields_bytes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("raw.txt");
        let stream = FileStream::streaming_with(&path, Codec::default(), fast_poll()).unwrap();
        stream.write(Value::from("abc")).await.unwrap();
        stream.close().await.unwrap();

        assert_eq!(
            stream.read().await.unwrap(),
            Some(Value::Bytes(b"abc".to_vec()))
        );
    }

    #[tokio::test]
    async fn test_file_labels() {
        let dir = tempdir().unwrap();
        let streaming = FileStream::streaming(dir.path().join("s.txt")).unwrap();
        let buffered = FileStream::buffered(dir.path().join("b.txt")).unwrap();
        assert!(streaming.label().starts_with("file:"));
        assert!(buffered.label().starts_with("file-buffer:"));
    }
}
