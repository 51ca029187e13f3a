//! The filer contract
//!
//! A filer is the backend-agnostic raw byte store behind one crystal: it
//! answers offset-addressable reads and writes, bounded by explicit wait
//! limits, and reports failures as result values rather than panics.

use crate::local::LocalFiler;
use crate::object::{ObjectFiler, ObjectStore};
use async_trait::async_trait;
use bytes::Bytes;
use crystal_common::{BytePool, Error, FileLocation, FilerConfig, PooledBuffer, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Backend-agnostic raw byte store
///
/// `timeout` semantics: `Some(d)` bounds the wait to `d`; `None` applies
/// the backend's default bound. An unbounded wait must be spelled as an
/// explicit large duration. Exceeding the bound yields [`Error::Timeout`],
/// which callers must treat as retryable.
#[async_trait]
pub trait Filer: Send + Sync {
    /// Validate or create the backing resource. Must be called before
    /// any read or write; `new_storage` truncates/creates it fresh.
    async fn prepare_and_check(&self, new_storage: bool) -> Result<()>;

    /// Write `data` at the given byte offset, extending the backing
    /// resource if necessary.
    async fn write(&self, offset: u64, data: Bytes, timeout: Option<Duration>) -> Result<()>;

    /// Replace the whole backing resource with `data`
    ///
    /// The default implementation truncates then writes, which leaves a
    /// window where a crash loses the previous content; backends that
    /// can swap content in one step override it.
    async fn replace(&self, data: Bytes, timeout: Option<Duration>) -> Result<()> {
        self.prepare_and_check(true).await?;
        self.write(0, data, timeout).await
    }

    /// Read exactly `length` bytes starting at `offset` into a pooled
    /// buffer. A short read is [`Error::NotFound`].
    async fn read(
        &self,
        offset: u64,
        length: usize,
        timeout: Option<Duration>,
    ) -> Result<PooledBuffer>;

    /// Current size of the backing resource in bytes
    async fn size(&self) -> Result<u64>;

    /// Remove the backing resource; a missing resource is not an error
    async fn delete(&self) -> Result<()>;

    /// The location this filer is bound to (for logging)
    fn location(&self) -> FileLocation;
}

/// Resolve a concrete filer from configuration
///
/// `ObjectStore` configurations need a store client; passing none for
/// one is an [`Error::InvalidConfiguration`], as is the `Empty` tag.
pub fn resolve_filer(
    config: &FilerConfig,
    pool: &BytePool,
    store: Option<Arc<dyn ObjectStore>>,
) -> Result<Arc<dyn Filer>> {
    match config {
        FilerConfig::Empty => Err(Error::invalid_configuration(
            "cannot resolve a filer from an empty configuration",
        )),
        FilerConfig::Local {
            directory,
            file,
            max_parallel,
        } => Ok(Arc::new(LocalFiler::new(
            std::path::Path::new(directory).join(file),
            pool.clone(),
            *max_parallel,
        ))),
        FilerConfig::ObjectStore {
            bucket,
            directory: _,
            file: _,
        } => {
            let store = store.ok_or_else(|| {
                Error::invalid_configuration(format!(
                    "bucket {bucket} configured but no object store client supplied"
                ))
            })?;
            let FileLocation::ObjectStore { bucket, path } = config.file_location() else {
                return Err(Error::invalid_configuration("empty object-store file name"));
            };
            Ok(Arc::new(ObjectFiler::new(store, bucket, path, pool.clone())))
        }
    }
}

/// Run `fut` under the effective wait bound for this backend
pub(crate) async fn bounded<T, F>(
    timeout: Option<Duration>,
    default: Duration,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>> + Send,
{
    match tokio::time::timeout(timeout.unwrap_or(default), fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_empty_config_fails() {
        let pool = BytePool::new();
        let result = resolve_filer(&FilerConfig::Empty, &pool, None);
        assert!(matches!(result, Err(Error::InvalidConfiguration(_))));
    }

    #[tokio::test]
    async fn test_resolve_object_store_requires_client() {
        let pool = BytePool::new();
        let config = FilerConfig::object_store("b", "a", "x.bin");
        let result = resolve_filer(&config, &pool, None);
        assert!(matches!(result, Err(Error::InvalidConfiguration(_))));
    }

    #[tokio::test]
    async fn test_bounded_times_out() {
        let result: Result<()> = bounded(
            Some(Duration::from_millis(10)),
            Duration::from_secs(30),
            async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            },
        )
        .await;
        assert!(matches!(result, Err(Error::Timeout)));
    }
}
