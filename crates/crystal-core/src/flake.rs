//! Flake containers
//!
//! A flake owns a set of memory-resident fragments of a crystal's data,
//! each backed by its own file within a raw-filer namespace. Reading or
//! writing a fragment registers a himo in the shared cache; eviction
//! calls back into [`Flake::save_data`], which writes the fragment
//! through the raw filer and drops the resident copy.

use crate::himo::{HimoCache, HimoKey, HimoOwner};
use async_trait::async_trait;
use bytes::Bytes;
use crystal_common::{Error, Result};
use crystal_filer::RawFiler;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::debug;

/// Identifier of a flake container
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct FlakeId(pub u64);

impl fmt::Display for FlakeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a fragment within a flake
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct FragmentId(pub u64);

impl fmt::Display for FragmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct FragmentState {
    data: Bytes,
    dirty: bool,
    /// Bumped on every rewrite; guards the unlocked save window
    generation: u64,
}

/// Container owning memory-resident fragments
pub struct Flake {
    id: FlakeId,
    raw: Arc<dyn RawFiler>,
    cache: Arc<HimoCache>,
    fragments: Mutex<HashMap<FragmentId, FragmentState>>,
}

impl Flake {
    /// Create a flake over a raw-filer namespace
    pub fn new(id: FlakeId, raw: Arc<dyn RawFiler>, cache: Arc<HimoCache>) -> Arc<Self> {
        Arc::new(Self {
            id,
            raw,
            cache,
            fragments: Mutex::new(HashMap::new()),
        })
    }

    /// This flake's identifier
    #[must_use]
    pub fn id(&self) -> FlakeId {
        self.id
    }

    /// Number of memory-resident fragments
    #[must_use]
    pub fn resident_count(&self) -> usize {
        self.fragments.lock().len()
    }

    fn file_name(fragment: FragmentId) -> String {
        format!("{fragment}.frag")
    }

    fn as_owner(self: &Arc<Self>) -> Weak<dyn HimoOwner> {
        let strong: Arc<dyn HimoOwner> = self.clone();
        Arc::downgrade(&strong)
    }

    /// Write a fragment, making it resident and dirty
    pub async fn write_fragment(self: &Arc<Self>, fragment: FragmentId, data: Bytes) {
        let size = data.len() as i64;
        {
            let mut fragments = self.fragments.lock();
            let generation = fragments.get(&fragment).map_or(0, |s| s.generation) + 1;
            fragments.insert(
                fragment,
                FragmentState {
                    data,
                    dirty: true,
                    generation,
                },
            );
        }
        self.cache
            .touch(self.as_owner(), HimoKey::new(self.id, fragment), size)
            .await;
    }

    /// Read a fragment, loading it through the raw filer if it is not
    /// resident
    pub async fn read_fragment(self: &Arc<Self>, fragment: FragmentId) -> Result<Bytes> {
        let resident = self.fragments.lock().get(&fragment).map(|s| s.data.clone());
        if let Some(data) = resident {
            let size = data.len() as i64;
            self.cache
                .touch(self.as_owner(), HimoKey::new(self.id, fragment), size)
                .await;
            return Ok(data);
        }

        let name = Self::file_name(fragment);
        let len = self.raw.size(&name).await? as usize;
        let buf = self.raw.read(&name, 0, len, None).await?;
        let data = Bytes::copy_from_slice(buf.as_slice());

        {
            let mut fragments = self.fragments.lock();
            let generation = fragments.get(&fragment).map_or(0, |s| s.generation) + 1;
            fragments.insert(
                fragment,
                FragmentState {
                    data: data.clone(),
                    dirty: false,
                    generation,
                },
            );
        }
        self.cache
            .touch(self.as_owner(), HimoKey::new(self.id, fragment), data.len() as i64)
            .await;
        Ok(data)
    }

    /// Write one fragment through the raw filer
    ///
    /// `forced` (the eviction path) additionally drops the resident copy
    /// once the write lands; a plain save keeps it resident and marks it
    /// clean. Returns `false` when the fragment was rewritten while the
    /// write was in flight: the newer resident copy stays (still dirty)
    /// and the cache entry must not be detached.
    pub async fn save_fragment(&self, fragment: FragmentId, forced: bool) -> Result<bool> {
        let (data, generation) = {
            let fragments = self.fragments.lock();
            match fragments.get(&fragment) {
                Some(state) => (
                    state.dirty.then(|| state.data.clone()),
                    state.generation,
                ),
                None => {
                    return Err(Error::not_found(format!(
                        "fragment {fragment} not resident in flake {}",
                        self.id
                    )))
                }
            }
        };

        if let Some(data) = data {
            let name = Self::file_name(fragment);
            self.raw.prepare(&name, false).await?;
            self.raw.write(&name, 0, data, None).await?;
        }

        let mut fragments = self.fragments.lock();
        match fragments.get(&fragment).map(|s| s.generation) {
            Some(current) if current == generation => {
                if forced {
                    debug!(flake = %self.id, %fragment, "fragment paged out");
                    fragments.remove(&fragment);
                } else if let Some(state) = fragments.get_mut(&fragment) {
                    state.dirty = false;
                }
                Ok(true)
            }
            Some(_) => {
                // The written snapshot is already stale; the rewrite
                // stays resident and dirty for a later save
                debug!(flake = %self.id, %fragment, "fragment rewritten during save");
                Ok(false)
            }
            // Deleted concurrently: nothing left to keep resident
            None => Ok(true),
        }
    }

    /// Flush every dirty resident fragment, keeping them resident
    pub async fn save_all(&self) -> Result<()> {
        let dirty: Vec<FragmentId> = {
            let fragments = self.fragments.lock();
            fragments
                .iter()
                .filter(|(_, state)| state.dirty)
                .map(|(id, _)| *id)
                .collect()
        };
        for fragment in dirty {
            self.save_fragment(fragment, false).await?;
        }
        Ok(())
    }

    /// Drop all resident fragments without saving (discard semantics)
    pub fn unload(&self) {
        self.fragments.lock().clear();
        self.cache.remove_flake(self.id);
    }

    /// Remove one fragment from memory and delete its backing file
    pub async fn delete_fragment(&self, fragment: FragmentId) -> Result<()> {
        self.fragments.lock().remove(&fragment);
        self.cache.remove(HimoKey::new(self.id, fragment));
        self.raw.delete(&Self::file_name(fragment)).await
    }
}

#[async_trait]
impl HimoOwner for Flake {
    async fn save_data(&self, fragment: FragmentId, forced: bool) -> Result<bool> {
        self.save_fragment(fragment, forced).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::himo::HimoCache;
    use crystal_common::BytePool;
    use crystal_filer::LocalRawFiler;
    use tempfile::tempdir;

    fn test_flake(
        dir: &std::path::Path,
        cache: Arc<HimoCache>,
    ) -> Arc<Flake> {
        let raw: Arc<dyn RawFiler> = Arc::new(LocalRawFiler::new(dir, BytePool::new(), None));
        Flake::new(FlakeId(7), raw, cache)
    }

    /// Wraps a raw filer so a test can hold a write in flight:
    /// `entered` gains a permit when a write starts, and the write
    /// blocks until `release` has one.
    struct GatedRawFiler {
        inner: Arc<dyn RawFiler>,
        entered: tokio::sync::Semaphore,
        release: tokio::sync::Semaphore,
    }

    impl GatedRawFiler {
        fn new(inner: Arc<dyn RawFiler>) -> Self {
            Self {
                inner,
                entered: tokio::sync::Semaphore::new(0),
                release: tokio::sync::Semaphore::new(0),
            }
        }
    }

    #[async_trait]
    impl RawFiler for GatedRawFiler {
        async fn prepare(&self, name: &str, new_storage: bool) -> Result<()> {
            self.inner.prepare(name, new_storage).await
        }

        async fn write(
            &self,
            name: &str,
            offset: u64,
            data: Bytes,
            timeout: Option<std::time::Duration>,
        ) -> Result<()> {
            self.entered.add_permits(1);
            let _permit = self
                .release
                .acquire()
                .await
                .map_err(|_| Error::Internal("write gate closed".into()))?;
            self.inner.write(name, offset, data, timeout).await
        }

        async fn read(
            &self,
            name: &str,
            offset: u64,
            length: usize,
            timeout: Option<std::time::Duration>,
        ) -> Result<crystal_common::PooledBuffer> {
            self.inner.read(name, offset, length, timeout).await
        }

        async fn size(&self, name: &str) -> Result<u64> {
            self.inner.size(name).await
        }

        async fn delete(&self, name: &str) -> Result<()> {
            self.inner.delete(name).await
        }

        fn location_of(&self, name: &str) -> crystal_common::FileLocation {
            self.inner.location_of(name)
        }
    }

    #[tokio::test]
    async fn test_write_then_read_resident() {
        let dir = tempdir().unwrap();
        let cache = Arc::new(HimoCache::with_margin(1 << 20, 100));
        let flake = test_flake(dir.path(), cache.clone());

        flake
            .write_fragment(FragmentId(1), Bytes::from_static(b"fragment one"))
            .await;
        let data = flake.read_fragment(FragmentId(1)).await.unwrap();
        assert_eq!(data, Bytes::from_static(b"fragment one"));
        assert_eq!(cache.memory_usage(), 12);
    }

    #[tokio::test]
    async fn test_forced_save_pages_out_and_reloads() {
        let dir = tempdir().unwrap();
        let cache = Arc::new(HimoCache::with_margin(1 << 20, 100));
        let flake = test_flake(dir.path(), cache.clone());

        flake
            .write_fragment(FragmentId(2), Bytes::from_static(b"payload"))
            .await;
        flake.save_fragment(FragmentId(2), true).await.unwrap();
        cache.remove(HimoKey::new(flake.id(), FragmentId(2)));
        assert_eq!(flake.resident_count(), 0);

        // Not resident: the read goes through the raw filer
        let data = flake.read_fragment(FragmentId(2)).await.unwrap();
        assert_eq!(data, Bytes::from_static(b"payload"));
        assert_eq!(flake.resident_count(), 1);
    }

    #[tokio::test]
    async fn test_eviction_flushes_through_flake() {
        let dir = tempdir().unwrap();
        // Tiny limit: the second write must evict the first fragment
        let cache = Arc::new(HimoCache::with_margin(10, 4));
        let flake = test_flake(dir.path(), cache.clone());

        flake
            .write_fragment(FragmentId(1), Bytes::from_static(b"aaaaaaaa"))
            .await;
        flake
            .write_fragment(FragmentId(2), Bytes::from_static(b"bbbbbbbb"))
            .await;

        // Fragment 1 was paged out by eviction and persists on disk
        assert!(dir.path().join("1.frag").exists());
        let data = flake.read_fragment(FragmentId(1)).await.unwrap();
        assert_eq!(data, Bytes::from_static(b"aaaaaaaa"));
    }

    #[tokio::test]
    async fn test_rewrite_during_forced_save_stays_resident() {
        let dir = tempdir().unwrap();
        let cache = Arc::new(HimoCache::with_margin(1 << 20, 100));
        let local: Arc<dyn RawFiler> =
            Arc::new(LocalRawFiler::new(dir.path(), BytePool::new(), None));
        let gated = Arc::new(GatedRawFiler::new(local));
        let raw: Arc<dyn RawFiler> = gated.clone();
        let flake = Flake::new(FlakeId(7), raw, cache);

        flake
            .write_fragment(FragmentId(1), Bytes::from_static(b"old"))
            .await;

        let saver = {
            let flake = flake.clone();
            tokio::spawn(async move { flake.save_fragment(FragmentId(1), true).await })
        };

        // Once the forced save's write is in flight, rewrite the
        // fragment, then let the write land
        gated.entered.acquire().await.unwrap().forget();
        flake
            .write_fragment(FragmentId(1), Bytes::from_static(b"NEW"))
            .await;
        gated.release.add_permits(16);

        let paged_out = saver.await.unwrap().unwrap();
        assert!(!paged_out);

        // The rewrite survives in memory and reads back
        assert_eq!(flake.resident_count(), 1);
        assert_eq!(
            flake.read_fragment(FragmentId(1)).await.unwrap(),
            Bytes::from_static(b"NEW")
        );

        // It is still dirty: the next save lands it on disk
        assert!(flake.save_fragment(FragmentId(1), false).await.unwrap());
        assert_eq!(
            std::fs::read(dir.path().join("1.frag")).unwrap(),
            b"NEW"
        );
    }

    #[tokio::test]
    async fn test_unload_discards_without_saving() {
        let dir = tempdir().unwrap();
        let cache = Arc::new(HimoCache::with_margin(1 << 20, 100));
        let flake = test_flake(dir.path(), cache.clone());

        flake
            .write_fragment(FragmentId(9), Bytes::from_static(b"volatile"))
            .await;
        flake.unload();

        assert_eq!(flake.resident_count(), 0);
        assert_eq!(cache.memory_usage(), 0);
        // Discard means no backing file was written
        assert!(!dir.path().join("9.frag").exists());
    }

    #[tokio::test]
    async fn test_save_all_keeps_resident() {
        let dir = tempdir().unwrap();
        let cache = Arc::new(HimoCache::with_margin(1 << 20, 100));
        let flake = test_flake(dir.path(), cache.clone());

        flake
            .write_fragment(FragmentId(1), Bytes::from_static(b"one"))
            .await;
        flake
            .write_fragment(FragmentId(2), Bytes::from_static(b"two"))
            .await;
        flake.save_all().await.unwrap();

        assert_eq!(flake.resident_count(), 2);
        assert!(dir.path().join("1.frag").exists());
        assert!(dir.path().join("2.frag").exists());
    }

    #[tokio::test]
    async fn test_delete_fragment_removes_backing_file() {
        let dir = tempdir().unwrap();
        let cache = Arc::new(HimoCache::with_margin(1 << 20, 100));
        let flake = test_flake(dir.path(), cache.clone());

        flake
            .write_fragment(FragmentId(5), Bytes::from_static(b"doomed"))
            .await;
        flake.save_all().await.unwrap();
        assert!(dir.path().join("5.frag").exists());

        flake.delete_fragment(FragmentId(5)).await.unwrap();
        assert!(!dir.path().join("5.frag").exists());
        assert_eq!(cache.memory_usage(), 0);
        assert!(flake.read_fragment(FragmentId(5)).await.unwrap_err().is_not_found());
    }
}
