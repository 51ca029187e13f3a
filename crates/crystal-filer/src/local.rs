//! Local filesystem backend
//!
//! Positioned reads and writes on a named path. Blocking file calls run
//! on the tokio blocking pool; an optional semaphore bounds how many run
//! at once (the `max_parallel` concurrency hint).

use crate::filer::{bounded, Filer};
use async_trait::async_trait;
use bytes::Bytes;
use crystal_common::{BytePool, Error, FileLocation, PooledBuffer, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::debug;

/// Default wait bound for local file operations
pub const LOCAL_DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Filer over one local file
pub struct LocalFiler {
    path: PathBuf,
    pool: BytePool,
    semaphore: Option<Arc<Semaphore>>,
}

impl LocalFiler {
    /// Create a filer bound to `path`
    pub fn new(path: impl Into<PathBuf>, pool: BytePool, max_parallel: Option<usize>) -> Self {
        Self {
            path: path.into(),
            pool,
            semaphore: max_parallel.map(|n| Arc::new(Semaphore::new(n.max(1)))),
        }
    }

    /// The path this filer is bound to
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Filer for LocalFiler {
    async fn prepare_and_check(&self, new_storage: bool) -> Result<()> {
        prepare_path(&self.path, new_storage).await
    }

    async fn write(&self, offset: u64, data: Bytes, timeout: Option<Duration>) -> Result<()> {
        let _permit = acquire(&self.semaphore).await?;
        bounded(
            timeout,
            LOCAL_DEFAULT_TIMEOUT,
            write_at(self.path.clone(), offset, data),
        )
        .await
    }

    async fn replace(&self, data: Bytes, timeout: Option<Duration>) -> Result<()> {
        let _permit = acquire(&self.semaphore).await?;
        bounded(
            timeout,
            LOCAL_DEFAULT_TIMEOUT,
            replace_file(self.path.clone(), data),
        )
        .await
    }

    async fn read(
        &self,
        offset: u64,
        length: usize,
        timeout: Option<Duration>,
    ) -> Result<PooledBuffer> {
        let _permit = acquire(&self.semaphore).await?;
        let buf = self.pool.rent(length);
        bounded(
            timeout,
            LOCAL_DEFAULT_TIMEOUT,
            read_exact_at(self.path.clone(), offset, buf),
        )
        .await
    }

    async fn size(&self) -> Result<u64> {
        file_size(&self.path).await
    }

    async fn delete(&self) -> Result<()> {
        delete_path(&self.path).await
    }

    fn location(&self) -> FileLocation {
        FileLocation::local(self.path.to_string_lossy())
    }
}

async fn acquire(
    semaphore: &Option<Arc<Semaphore>>,
) -> Result<Option<tokio::sync::OwnedSemaphorePermit>> {
    match semaphore {
        Some(sem) => sem
            .clone()
            .acquire_owned()
            .await
            .map(Some)
            .map_err(|_| Error::Internal("I/O semaphore closed".into())),
        None => Ok(None),
    }
}

pub(crate) async fn prepare_path(path: &Path, new_storage: bool) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if new_storage {
        debug!(path = %path.display(), "creating new backing file");
        tokio::fs::File::create(path).await?;
    }
    Ok(())
}

pub(crate) async fn write_at(path: PathBuf, offset: u64, data: Bytes) -> Result<()> {
    tokio::task::spawn_blocking(move || -> Result<()> {
        let file = OpenOptions::new().write(true).create(true).open(&path)?;
        file.write_all_at(&data, offset)?;
        Ok(())
    })
    .await
    .map_err(|e| Error::Internal(format!("blocking write task failed: {e}")))?
}

pub(crate) async fn read_exact_at(
    path: PathBuf,
    offset: u64,
    mut buf: PooledBuffer,
) -> Result<PooledBuffer> {
    tokio::task::spawn_blocking(move || -> Result<PooledBuffer> {
        let file = std::fs::File::open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::not_found(path.to_string_lossy())
            } else {
                Error::Io(e)
            }
        })?;
        let slice = buf
            .as_mut_slice()
            .ok_or_else(|| Error::Internal("rented buffer unexpectedly shared".into()))?;
        file.read_exact_at(slice, offset).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::not_found(format!(
                    "{}: short read at offset {offset}",
                    path.to_string_lossy()
                ))
            } else {
                Error::Io(e)
            }
        })?;
        Ok(buf)
    })
    .await
    .map_err(|e| Error::Internal(format!("blocking read task failed: {e}")))?
}

/// Write to a staging sibling, sync, then rename over the target, so a
/// crash leaves either the old or the new content, never a truncated mix
pub(crate) async fn replace_file(path: PathBuf, data: Bytes) -> Result<()> {
    tokio::task::spawn_blocking(move || -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let staging = staging_path(&path);
        let mut file = std::fs::File::create(&staging)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&staging, &path)?;
        Ok(())
    })
    .await
    .map_err(|e| Error::Internal(format!("blocking replace task failed: {e}")))?
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(std::ffi::OsStr::to_os_string)
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

pub(crate) async fn file_size(path: &Path) -> Result<u64> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(Error::not_found(path.to_string_lossy()))
        }
        Err(e) => Err(Error::Io(e)),
    }
}

pub(crate) async fn delete_path(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_write_read_round_trip() {
        let dir = tempdir().unwrap();
        let filer = LocalFiler::new(dir.path().join("data.bin"), BytePool::new(), None);

        filer.prepare_and_check(true).await.unwrap();
        filer
            .write(0, Bytes::from_static(b"hello world"), None)
            .await
            .unwrap();

        let buf = filer.read(6, 5, None).await.unwrap();
        assert_eq!(buf.as_slice(), b"world");
        assert_eq!(filer.size().await.unwrap(), 11);
    }

    #[tokio::test]
    async fn test_offset_write_extends_file() {
        let dir = tempdir().unwrap();
        let filer = LocalFiler::new(dir.path().join("sparse.bin"), BytePool::new(), Some(2));

        filer.prepare_and_check(true).await.unwrap();
        filer
            .write(100, Bytes::from_static(b"tail"), None)
            .await
            .unwrap();

        assert_eq!(filer.size().await.unwrap(), 104);
        let buf = filer.read(100, 4, None).await.unwrap();
        assert_eq!(buf.as_slice(), b"tail");
    }

    #[tokio::test]
    async fn test_replace_swaps_whole_file() {
        let dir = tempdir().unwrap();
        let filer = LocalFiler::new(dir.path().join("data.bin"), BytePool::new(), None);

        filer.prepare_and_check(true).await.unwrap();
        filer
            .write(0, Bytes::from_static(b"a much longer first version"), None)
            .await
            .unwrap();

        filer.replace(Bytes::from_static(b"short"), None).await.unwrap();

        // No stale tail from the longer predecessor, and the staging
        // sibling was renamed away
        assert_eq!(filer.size().await.unwrap(), 5);
        let buf = filer.read(0, 5, None).await.unwrap();
        assert_eq!(buf.as_slice(), b"short");
        assert!(!dir.path().join("data.bin.tmp").exists());
    }

    #[tokio::test]
    async fn test_short_read_is_not_found() {
        let dir = tempdir().unwrap();
        let filer = LocalFiler::new(dir.path().join("short.bin"), BytePool::new(), None);

        filer.prepare_and_check(true).await.unwrap();
        filer.write(0, Bytes::from_static(b"abc"), None).await.unwrap();

        let result = filer.read(0, 10, None).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_missing_file_read_and_size() {
        let dir = tempdir().unwrap();
        let filer = LocalFiler::new(dir.path().join("missing.bin"), BytePool::new(), None);

        filer.prepare_and_check(false).await.unwrap();
        assert!(filer.read(0, 1, None).await.unwrap_err().is_not_found());
        assert!(filer.size().await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_delete_tolerates_missing() {
        let dir = tempdir().unwrap();
        let filer = LocalFiler::new(dir.path().join("gone.bin"), BytePool::new(), None);

        filer.prepare_and_check(true).await.unwrap();
        filer.delete().await.unwrap();
        // Second delete: missing resource is not an error
        filer.delete().await.unwrap();
    }
}
