//! Object-storage backend
//!
//! The network protocol is out of scope here: the engine only sees the
//! [`ObjectStore`] boundary trait. [`ObjectFiler`] adapts the filer
//! contract on top of whole-object get/put, emulating offset writes by
//! read-modify-write of the full object.

use crate::filer::{bounded, Filer};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use crystal_common::{BytePool, Error, FileLocation, PooledBuffer, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Default wait bound for object-storage operations
pub const OBJECT_DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Largest object the read-modify-write emulation will handle
pub const MAX_OBJECT_SIZE: u64 = 64 * 1024 * 1024;

/// Boundary trait for an object-storage client
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch a whole object; a missing key is [`Error::NotFound`]
    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes>;

    /// Store a whole object, replacing any previous content
    async fn put(&self, bucket: &str, key: &str, data: Bytes) -> Result<()>;

    /// Remove an object; a missing key is not an error
    async fn delete(&self, bucket: &str, key: &str) -> Result<()>;

    /// Verify the bucket is reachable
    async fn check_bucket(&self, bucket: &str) -> Result<()>;
}

/// In-memory object store for tests and embedded use
#[derive(Default)]
pub struct MemoryObjectStore {
    buckets: RwLock<HashMap<String, HashMap<String, Bytes>>>,
}

impl MemoryObjectStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store with one pre-existing bucket
    #[must_use]
    pub fn with_bucket(bucket: impl Into<String>) -> Self {
        let store = Self::new();
        store.create_bucket(bucket);
        store
    }

    /// Create a bucket (idempotent)
    pub fn create_bucket(&self, bucket: impl Into<String>) {
        self.buckets.write().entry(bucket.into()).or_default();
    }

    /// Number of objects in a bucket
    #[must_use]
    pub fn object_count(&self, bucket: &str) -> usize {
        self.buckets.read().get(bucket).map_or(0, HashMap::len)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes> {
        let buckets = self.buckets.read();
        buckets
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .cloned()
            .ok_or_else(|| Error::not_found(format!("{bucket}/{key}")))
    }

    async fn put(&self, bucket: &str, key: &str, data: Bytes) -> Result<()> {
        let mut buckets = self.buckets.write();
        let objects = buckets
            .get_mut(bucket)
            .ok_or_else(|| Error::backend(format!("bucket {bucket} does not exist")))?;
        objects.insert(key.to_string(), data);
        Ok(())
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        if let Some(objects) = self.buckets.write().get_mut(bucket) {
            objects.remove(key);
        }
        Ok(())
    }

    async fn check_bucket(&self, bucket: &str) -> Result<()> {
        if self.buckets.read().contains_key(bucket) {
            Ok(())
        } else {
            Err(Error::backend(format!("bucket {bucket} unreachable")))
        }
    }
}

/// Filer over one object in a bucket
pub struct ObjectFiler {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    key: String,
    pool: BytePool,
}

impl ObjectFiler {
    /// Create a filer bound to `bucket`/`key`
    pub fn new(
        store: Arc<dyn ObjectStore>,
        bucket: impl Into<String>,
        key: impl Into<String>,
        pool: BytePool,
    ) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            key: key.into(),
            pool,
        }
    }

    /// Current object content, or empty if the object does not exist
    async fn current(&self) -> Result<Bytes> {
        match self.store.get(&self.bucket, &self.key).await {
            Ok(data) => Ok(data),
            Err(e) if e.is_not_found() => Ok(Bytes::new()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Filer for ObjectFiler {
    async fn prepare_and_check(&self, new_storage: bool) -> Result<()> {
        self.store.check_bucket(&self.bucket).await?;
        if new_storage {
            debug!(bucket = %self.bucket, key = %self.key, "clearing object for new storage");
            self.store.delete(&self.bucket, &self.key).await?;
        }
        Ok(())
    }

    async fn write(&self, offset: u64, data: Bytes, timeout: Option<Duration>) -> Result<()> {
        let end = offset + data.len() as u64;
        if end > MAX_OBJECT_SIZE {
            return Err(Error::OverSizeLimit {
                size: end,
                limit: MAX_OBJECT_SIZE,
            });
        }
        bounded(timeout, OBJECT_DEFAULT_TIMEOUT, async {
            // Offset emulation: patch the whole object and rewrite it
            let current = self.current().await?;
            let mut body = BytesMut::with_capacity(current.len().max(end as usize));
            body.extend_from_slice(&current);
            if body.len() < end as usize {
                body.resize(end as usize, 0);
            }
            body[offset as usize..end as usize].copy_from_slice(&data);
            self.store.put(&self.bucket, &self.key, body.freeze()).await
        })
        .await
    }

    async fn replace(&self, data: Bytes, timeout: Option<Duration>) -> Result<()> {
        if data.len() as u64 > MAX_OBJECT_SIZE {
            return Err(Error::OverSizeLimit {
                size: data.len() as u64,
                limit: MAX_OBJECT_SIZE,
            });
        }
        // A whole-object put swaps content in one step
        bounded(
            timeout,
            OBJECT_DEFAULT_TIMEOUT,
            self.store.put(&self.bucket, &self.key, data),
        )
        .await
    }

    async fn read(
        &self,
        offset: u64,
        length: usize,
        timeout: Option<Duration>,
    ) -> Result<PooledBuffer> {
        bounded(timeout, OBJECT_DEFAULT_TIMEOUT, async {
            let data = self.store.get(&self.bucket, &self.key).await?;
            let end = offset as usize + length;
            if end > data.len() {
                return Err(Error::not_found(format!(
                    "{}/{}: short read at offset {offset}",
                    self.bucket, self.key
                )));
            }
            let mut buf = self.pool.rent(length);
            buf.copy_from(&data[offset as usize..end]);
            Ok(buf)
        })
        .await
    }

    async fn size(&self) -> Result<u64> {
        let data = self.store.get(&self.bucket, &self.key).await?;
        Ok(data.len() as u64)
    }

    async fn delete(&self) -> Result<()> {
        self.store.delete(&self.bucket, &self.key).await
    }

    fn location(&self) -> FileLocation {
        FileLocation::object_store(self.bucket.clone(), self.key.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_filer() -> ObjectFiler {
        let store = Arc::new(MemoryObjectStore::with_bucket("b"));
        ObjectFiler::new(store, "b", "root/data.bin", BytePool::new())
    }

    #[tokio::test]
    async fn test_write_read_round_trip() {
        let filer = test_filer();
        filer.prepare_and_check(true).await.unwrap();

        filer
            .write(0, Bytes::from_static(b"object body"), None)
            .await
            .unwrap();
        let buf = filer.read(7, 4, None).await.unwrap();
        assert_eq!(buf.as_slice(), b"body");
    }

    #[tokio::test]
    async fn test_offset_write_patches_in_place() {
        let filer = test_filer();
        filer.prepare_and_check(true).await.unwrap();

        filer
            .write(0, Bytes::from_static(b"aaaaaaaa"), None)
            .await
            .unwrap();
        filer.write(2, Bytes::from_static(b"BB"), None).await.unwrap();

        let buf = filer.read(0, 8, None).await.unwrap();
        assert_eq!(buf.as_slice(), b"aaBBaaaa");
    }

    #[tokio::test]
    async fn test_write_past_end_zero_fills() {
        let filer = test_filer();
        filer.prepare_and_check(true).await.unwrap();

        filer.write(4, Bytes::from_static(b"xy"), None).await.unwrap();
        let buf = filer.read(0, 6, None).await.unwrap();
        assert_eq!(buf.as_slice(), b"\0\0\0\0xy");
    }

    #[tokio::test]
    async fn test_replace_drops_previous_content() {
        let filer = test_filer();
        filer.prepare_and_check(true).await.unwrap();

        filer
            .write(0, Bytes::from_static(b"12345678"), None)
            .await
            .unwrap();
        filer.replace(Bytes::from_static(b"xy"), None).await.unwrap();

        assert_eq!(filer.size().await.unwrap(), 2);
        let buf = filer.read(0, 2, None).await.unwrap();
        assert_eq!(buf.as_slice(), b"xy");
    }

    #[tokio::test]
    async fn test_missing_bucket_fails_prepare() {
        let store = Arc::new(MemoryObjectStore::new());
        let filer = ObjectFiler::new(store, "nope", "k", BytePool::new());
        let result = filer.prepare_and_check(false).await;
        assert!(matches!(result, Err(Error::Backend(_))));
    }

    #[tokio::test]
    async fn test_over_size_limit() {
        let filer = test_filer();
        let result = filer
            .write(MAX_OBJECT_SIZE, Bytes::from_static(b"x"), None)
            .await;
        assert!(matches!(result, Err(Error::OverSizeLimit { .. })));
    }

    #[tokio::test]
    async fn test_delete_then_read_not_found() {
        let filer = test_filer();
        filer.prepare_and_check(true).await.unwrap();
        filer.write(0, Bytes::from_static(b"data"), None).await.unwrap();

        filer.delete().await.unwrap();
        assert!(filer.read(0, 4, None).await.unwrap_err().is_not_found());
        // Deleting again is fine
        filer.delete().await.unwrap();
    }
}
