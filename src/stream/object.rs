//! Object-store streams.
//!
//! An [`ObjectStream`] persists a stream as a single object under a
//! bucket/key. Writes accumulate into a local staging file and the whole
//! object is uploaded in one shot at close (buffered discipline); reads
//! download the object and deliver its newline-separated records. If the
//! object already exists at construction, the stream enters skip state and
//! is never overwritten.
//!
//! The store itself sits behind the [`ObjectStore`] trait so the engine does
//! not care whether objects live in a cloud bucket or, as with
//! [`FsObjectStore`], in a local directory tree.

use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::sync::Mutex;

use crate::codec::Codec;
use crate::core::task::Task;
use crate::error::{Error, Result};
use crate::stream::{ProducerCell, ReadySignal, Stream};
use crate::util::blocking;
use crate::value::Value;
use crate::{wlog_fail, wlog_sched};

/// Minimal object-store surface the stream needs.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn exists(&self, bucket: &str, key: &str) -> Result<bool>;
    async fn download(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;
    async fn upload(&self, bucket: &str, key: &str, body: &[u8]) -> Result<()>;
    async fn delete(&self, bucket: &str, key: &str) -> Result<()>;
}

/// Filesystem-backed object store: buckets are directories under a root.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.root.join(bucket).join(key.trim_start_matches('/'))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        let path = self.object_path(bucket, key);
        blocking(move || Ok(path.exists())).await
    }

    async fn download(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let path = self.object_path(bucket, key);
        let label = format!("object:{}/{}", bucket, key);
        blocking(move || {
            std::fs::read(&path).map_err(|err| Error::Backend {
                label,
                message: err.to_string(),
            })
        })
        .await
    }

    async fn upload(&self, bucket: &str, key: &str, body: &[u8]) -> Result<()> {
        let path = self.object_path(bucket, key);
        let body = body.to_vec();
        blocking(move || {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, &body)?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        let path = self.object_path(bucket, key);
        blocking(move || match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        })
        .await
    }
}

/// Reader side of an object stream: records are fetched lazily on the first
/// read, after the producer has closed.
enum ReaderState {
    Unfetched,
    Draining(VecDeque<Value>),
}

/// A stream persisted as one object under `bucket/key`.
pub struct ObjectStream {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    key: String,
    codec: Codec,
    staging: Mutex<Option<NamedTempFile>>,
    reader: Mutex<ReaderState>,
    skip: bool,
    closed: AtomicBool,
    ready: ReadySignal,
    producer: ProducerCell,
}

impl ObjectStream {
    /// Probe the object and set up staging. Existence implies skip.
    pub async fn new(
        store: Arc<dyn ObjectStore>,
        bucket: &str,
        key: &str,
    ) -> Result<Arc<Self>> {
        Self::with_codec(store, bucket, key, Codec::default()).await
    }

    /// [`ObjectStream::new`] with an explicit codec.
    pub async fn with_codec(
        store: Arc<dyn ObjectStore>,
        bucket: &str,
        key: &str,
        codec: Codec,
    ) -> Result<Arc<Self>> {
        let skip = store.exists(bucket, key).await?;
        let staging = if skip {
            None
        } else {
            Some(blocking(|| Ok(NamedTempFile::new()?)).await?)
        };
        Ok(Arc::new(Self {
            store,
            bucket: bucket.to_string(),
            key: key.to_string(),
            codec,
            staging: Mutex::new(staging),
            reader: Mutex::new(ReaderState::Unfetched),
            skip,
            closed: AtomicBool::new(false),
            ready: ReadySignal::armed(),
            producer: ProducerCell::new(),
        }))
    }

    fn decode_body(&self, body: &[u8]) -> VecDeque<Value> {
        let mut records = VecDeque::new();
        for line in body.split(|b| *b == b'\n') {
            if line.is_empty() {
                continue;
            }
            match self.codec.decode(line) {
                Ok(value) => records.push_back(value),
                Err(err) => {
                    wlog_fail!("{}: decode error: {}", self.label(), err);
                }
            }
        }
        records
    }
}

impl std::fmt::Debug for ObjectStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStream")
            .field("bucket", &self.bucket)
            .field("key", &self.key)
            .field("skip", &self.skip)
            .finish()
    }
}

#[async_trait]
impl Stream for ObjectStream {
    fn label(&self) -> String {
        format!("object:{}/{}", self.bucket, self.key)
    }

    fn is_skip(&self) -> bool {
        self.skip
    }

    fn pending(&self) -> usize {
        match self.reader.try_lock() {
            Ok(state) => match &*state {
                ReaderState::Draining(records) => records.len(),
                ReaderState::Unfetched => 0,
            },
            Err(_) => 0,
        }
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
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::WriteToClosed(self.label()));
        }
        let mut encoded = self.codec.encode(&value)?;
        encoded.push(b'\n');

        // The guard is held across the write so concurrent workers stay
        // serialized; the staging file travels through the worker thread
        // and comes back.
        let mut guard = self.staging.lock().await;
        let mut file = guard
            .take()
            .ok_or_else(|| Error::WriteToClosed(self.label()))?;
        let (file, written) = blocking(move || {
            let written = file.as_file_mut().write_all(&encoded);
            Ok((file, written))
        })
        .await?;
        *guard = Some(file);
        written?;
        Ok(())
    }

    async fn read(&self) -> Result<Option<Value>> {
        let mut state = self.reader.lock().await;
        if let ReaderState::Unfetched = &*state {
            let body = self.store.download(&self.bucket, &self.key).await?;
            *state = ReaderState::Draining(self.decode_body(&body));
        }
        match &mut *state {
            ReaderState::Draining(records) => Ok(records.pop_front()),
            ReaderState::Unfetched => Ok(None),
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(file) = self.staging.lock().await.take() {
            // Reading the staging file also drops it, unlinking the temp
            // file from the worker thread.
            let body = blocking(move || Ok(std::fs::read(file.path())?)).await?;
            self.store.upload(&self.bucket, &self.key, &body).await?;
        }
        self.ready.fire();
        Ok(())
    }

    async fn destroy(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // Drop the staging file without uploading, forget the object, and
        // leave readers an empty sequence so they drain promptly.
        if let Some(file) = self.staging.lock().await.take() {
            let _ = blocking(move || {
                drop(file);
                Ok(())
            })
            .await;
        }
        *self.reader.lock().await = ReaderState::Draining(VecDeque::new());
        if let Err(err) = self.store.delete(&self.bucket, &self.key).await {
            wlog_sched!("destroy {}: {}", self.label(), err);
        }
        self.ready.fire();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn text_stream(
        store: Arc<dyn ObjectStore>,
        bucket: &str,
        key: &str,
    ) -> Arc<ObjectStream> {
        ObjectStream::with_codec(store, bucket, key, Codec::text())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_object_roundtrip_in_order() {
        let dir = tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(dir.path()));
        let stream = text_stream(store, "results", "run-1/out.txt").await;

        for text in ["v1", "v2", "v3"] {
            stream.write(Value::from(text)).await.unwrap();
        }
        stream.close().await.unwrap();

        let mut got = Vec::new();
        while let Some(value) = stream.read().await.unwrap() {
            got.push(value.as_text());
        }
        assert_eq!(got, vec!["v1", "v2", "v3"]);
    }

    #[tokio::test]
    async fn test_object_ready_fires_on_close() {
        let dir = tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(dir.path()));
        let stream = text_stream(store, "results", "gated.txt").await;

        let waiter = {
            let stream = stream.clone();
            tokio::spawn(async move { stream.ready().await })
        };
        stream.write(Value::from("x")).await.unwrap();
        assert!(!waiter.is_finished());

        stream.close().await.unwrap();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_object_upload_happens_at_close_only() {
        let dir = tempdir().unwrap();
        let fs_store = FsObjectStore::new(dir.path());
        let store: Arc<dyn ObjectStore> = Arc::new(fs_store.clone());
        let stream = text_stream(store, "results", "late.txt").await;

        stream.write(Value::from("staged")).await.unwrap();
        assert!(!fs_store.exists("results", "late.txt").await.unwrap());

        stream.close().await.unwrap();
        assert!(fs_store.exists("results", "late.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_existing_object_sets_skip() {
        let dir = tempdir().unwrap();
        let fs_store = FsObjectStore::new(dir.path());
        fs_store
            .upload("results", "prior.txt", b"old\n")
            .await
            .unwrap();

        let store: Arc<dyn ObjectStore> = Arc::new(fs_store);
        let stream = text_stream(store, "results", "prior.txt").await;
        assert!(stream.is_skip());
        assert!(matches!(
            stream.write(Value::from("new")).await.unwrap_err(),
            Error::WriteToClosed(_)
        ));

        stream.close().await.unwrap();
        assert_eq!(stream.read().await.unwrap(), Some(Value::from("old")));
        assert_eq!(stream.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_object_destroy_removes_artifact() {
        let dir = tempdir().unwrap();
        let fs_store = FsObjectStore::new(dir.path());
        let store: Arc<dyn ObjectStore> = Arc::new(fs_store.clone());
        let stream = text_stream(store, "results", "doomed.txt").await;

        stream.write(Value::from("x")).await.unwrap();
        stream.close().await.unwrap();
        assert!(fs_store.exists("results", "doomed.txt").await.unwrap());

        stream.destroy().await;
        assert!(!fs_store.exists("results", "doomed.txt").await.unwrap());
        assert_eq!(stream.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_fs_store_key_with_leading_slash() {
        let dir = tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        store.upload("b", "/nested/key", b"data").await.unwrap();
        assert!(store.exists("b", "/nested/key").await.unwrap());
        assert_eq!(store.download("b", "/nested/key").await.unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_object_label() {
        let dir = tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(dir.path()));
        let stream = text_stream(store, "bkt", "k.txt").await;
        assert_eq!(stream.label(), "object:bkt/k.txt");
    }
}
