//! Raw filers: one backend, many logical files
//!
//! A raw filer exposes the same operations as [`Filer`] keyed by an
//! extra logical filename, so a single backend resource (one root
//! directory, one bucket client) can serve many logical filers that
//! differ only by name. [`RawFilerToFiler`] binds a raw filer plus a
//! fixed filename back into the plain [`Filer`] contract.

use crate::filer::{bounded, Filer};
use crate::local;
use crate::object::{ObjectStore, OBJECT_DEFAULT_TIMEOUT};
use crate::LOCAL_DEFAULT_TIMEOUT;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use crystal_common::{BytePool, Error, FileLocation, PooledBuffer, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// A raw byte backend shared by many logical files
#[async_trait]
pub trait RawFiler: Send + Sync {
    /// Validate or create the named resource
    async fn prepare(&self, name: &str, new_storage: bool) -> Result<()>;

    /// Write at an offset within the named resource
    async fn write(
        &self,
        name: &str,
        offset: u64,
        data: Bytes,
        timeout: Option<Duration>,
    ) -> Result<()>;

    /// Read exactly `length` bytes from the named resource
    async fn read(
        &self,
        name: &str,
        offset: u64,
        length: usize,
        timeout: Option<Duration>,
    ) -> Result<PooledBuffer>;

    /// Size of the named resource
    async fn size(&self, name: &str) -> Result<u64>;

    /// Delete the named resource; missing is not an error
    async fn delete(&self, name: &str) -> Result<()>;

    /// Location a name resolves to (for logging)
    fn location_of(&self, name: &str) -> FileLocation;
}

/// Raw filer over a local root directory
pub struct LocalRawFiler {
    root: PathBuf,
    pool: BytePool,
    semaphore: Option<Arc<Semaphore>>,
}

impl LocalRawFiler {
    /// Create a raw filer rooted at `root`
    pub fn new(root: impl Into<PathBuf>, pool: BytePool, max_parallel: Option<usize>) -> Self {
        Self {
            root: root.into(),
            pool,
            semaphore: max_parallel.map(|n| Arc::new(Semaphore::new(n.max(1)))),
        }
    }

    fn resolve(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    async fn acquire(&self) -> Result<Option<tokio::sync::OwnedSemaphorePermit>> {
        match &self.semaphore {
            Some(sem) => sem
                .clone()
                .acquire_owned()
                .await
                .map(Some)
                .map_err(|_| Error::Internal("I/O semaphore closed".into())),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl RawFiler for LocalRawFiler {
    async fn prepare(&self, name: &str, new_storage: bool) -> Result<()> {
        local::prepare_path(&self.resolve(name), new_storage).await
    }

    async fn write(
        &self,
        name: &str,
        offset: u64,
        data: Bytes,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let _permit = self.acquire().await?;
        bounded(
            timeout,
            LOCAL_DEFAULT_TIMEOUT,
            local::write_at(self.resolve(name), offset, data),
        )
        .await
    }

    async fn read(
        &self,
        name: &str,
        offset: u64,
        length: usize,
        timeout: Option<Duration>,
    ) -> Result<PooledBuffer> {
        let _permit = self.acquire().await?;
        let buf = self.pool.rent(length);
        bounded(
            timeout,
            LOCAL_DEFAULT_TIMEOUT,
            local::read_exact_at(self.resolve(name), offset, buf),
        )
        .await
    }

    async fn size(&self, name: &str) -> Result<u64> {
        local::file_size(&self.resolve(name)).await
    }

    async fn delete(&self, name: &str) -> Result<()> {
        local::delete_path(&self.resolve(name)).await
    }

    fn location_of(&self, name: &str) -> FileLocation {
        FileLocation::local(self.resolve(name).to_string_lossy())
    }
}

/// Raw filer over a bucket and key prefix
pub struct ObjectRawFiler {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    prefix: String,
    pool: BytePool,
}

impl ObjectRawFiler {
    /// Create a raw filer over `bucket` with the given key prefix
    pub fn new(
        store: Arc<dyn ObjectStore>,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        pool: BytePool,
    ) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            prefix: prefix.into(),
            pool,
        }
    }

    fn key_of(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else if self.prefix.ends_with('/') {
            format!("{}{name}", self.prefix)
        } else {
            format!("{}/{name}", self.prefix)
        }
    }

    async fn current(&self, key: &str) -> Result<Bytes> {
        match self.store.get(&self.bucket, key).await {
            Ok(data) => Ok(data),
            Err(e) if e.is_not_found() => Ok(Bytes::new()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl RawFiler for ObjectRawFiler {
    async fn prepare(&self, name: &str, new_storage: bool) -> Result<()> {
        self.store.check_bucket(&self.bucket).await?;
        if new_storage {
            self.store.delete(&self.bucket, &self.key_of(name)).await?;
        }
        Ok(())
    }

    async fn write(
        &self,
        name: &str,
        offset: u64,
        data: Bytes,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let key = self.key_of(name);
        bounded(timeout, OBJECT_DEFAULT_TIMEOUT, async {
            let current = self.current(&key).await?;
            let end = offset as usize + data.len();
            let mut body = BytesMut::with_capacity(current.len().max(end));
            body.extend_from_slice(&current);
            if body.len() < end {
                body.resize(end, 0);
            }
            body[offset as usize..end].copy_from_slice(&data);
            self.store.put(&self.bucket, &key, body.freeze()).await
        })
        .await
    }

    async fn read(
        &self,
        name: &str,
        offset: u64,
        length: usize,
        timeout: Option<Duration>,
    ) -> Result<PooledBuffer> {
        let key = self.key_of(name);
        bounded(timeout, OBJECT_DEFAULT_TIMEOUT, async {
            let data = self.store.get(&self.bucket, &key).await?;
            let end = offset as usize + length;
            if end > data.len() {
                return Err(Error::not_found(format!(
                    "{}/{key}: short read at offset {offset}",
                    self.bucket
                )));
            }
            let mut buf = self.pool.rent(length);
            buf.copy_from(&data[offset as usize..end]);
            Ok(buf)
        })
        .await
    }

    async fn size(&self, name: &str) -> Result<u64> {
        let data = self.store.get(&self.bucket, &self.key_of(name)).await?;
        Ok(data.len() as u64)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.store.delete(&self.bucket, &self.key_of(name)).await
    }

    fn location_of(&self, name: &str) -> FileLocation {
        FileLocation::object_store(self.bucket.clone(), self.key_of(name))
    }
}

/// Adapter binding a raw filer plus a fixed filename into a [`Filer`]
pub struct RawFilerToFiler {
    raw: Arc<dyn RawFiler>,
    name: String,
}

impl RawFilerToFiler {
    /// Bind `raw` to one logical filename
    pub fn new(raw: Arc<dyn RawFiler>, name: impl Into<String>) -> Self {
        Self {
            raw,
            name: name.into(),
        }
    }

    /// The logical filename this adapter is bound to
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Filer for RawFilerToFiler {
    async fn prepare_and_check(&self, new_storage: bool) -> Result<()> {
        self.raw.prepare(&self.name, new_storage).await
    }

    async fn write(&self, offset: u64, data: Bytes, timeout: Option<Duration>) -> Result<()> {
        self.raw.write(&self.name, offset, data, timeout).await
    }

    async fn read(
        &self,
        offset: u64,
        length: usize,
        timeout: Option<Duration>,
    ) -> Result<PooledBuffer> {
        self.raw.read(&self.name, offset, length, timeout).await
    }

    async fn size(&self) -> Result<u64> {
        self.raw.size(&self.name).await
    }

    async fn delete(&self) -> Result<()> {
        self.raw.delete(&self.name).await
    }

    fn location(&self) -> FileLocation {
        self.raw.location_of(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::MemoryObjectStore;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_local_raw_filer_many_names() {
        let dir = tempdir().unwrap();
        let raw: Arc<dyn RawFiler> =
            Arc::new(LocalRawFiler::new(dir.path(), BytePool::new(), Some(4)));

        for name in ["a.bin", "b.bin"] {
            raw.prepare(name, true).await.unwrap();
            raw.write(name, 0, Bytes::copy_from_slice(name.as_bytes()), None)
                .await
                .unwrap();
        }

        let a = raw.read("a.bin", 0, 5, None).await.unwrap();
        let b = raw.read("b.bin", 0, 5, None).await.unwrap();
        assert_eq!(a.as_slice(), b"a.bin");
        assert_eq!(b.as_slice(), b"b.bin");
    }

    #[tokio::test]
    async fn test_adapter_binds_one_name() {
        let dir = tempdir().unwrap();
        let raw: Arc<dyn RawFiler> =
            Arc::new(LocalRawFiler::new(dir.path(), BytePool::new(), None));
        let filer = RawFilerToFiler::new(raw.clone(), "bound.bin");

        filer.prepare_and_check(true).await.unwrap();
        filer.write(0, Bytes::from_static(b"data"), None).await.unwrap();
        assert_eq!(filer.size().await.unwrap(), 4);

        // The same bytes are visible through the raw interface
        let buf = raw.read("bound.bin", 0, 4, None).await.unwrap();
        assert_eq!(buf.as_slice(), b"data");
    }

    #[tokio::test]
    async fn test_object_raw_filer_prefix() {
        let store = Arc::new(MemoryObjectStore::with_bucket("b"));
        let raw = ObjectRawFiler::new(store.clone(), "b", "frags", BytePool::new());

        raw.prepare("1.frag", false).await.unwrap();
        raw.write("1.frag", 0, Bytes::from_static(b"frag"), None)
            .await
            .unwrap();

        assert_eq!(
            raw.location_of("1.frag"),
            FileLocation::object_store("b", "frags/1.frag")
        );
        let buf = raw.read("1.frag", 0, 4, None).await.unwrap();
        assert_eq!(buf.as_slice(), b"frag");

        raw.delete("1.frag").await.unwrap();
        assert_eq!(store.object_count("b"), 0);
    }
}
