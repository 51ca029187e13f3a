//! Size-classed pooled buffer allocator
//!
//! All I/O paths rent buffers from a process-wide pool instead of
//! allocating per operation. Buffers are reference counted so they can
//! cross thread boundaries (e.g. handed to an I/O completion) and only
//! cycle back to their size class once the last owner lets go.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Smallest pooled size class
const MIN_CLASS_SIZE: usize = 1024;

/// Largest pooled size class; bigger requests get direct allocations
pub const MAX_BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// The standard class that gets pre-warmed at pool creation
const STANDARD_CLASS_SIZE: usize = 32 * 1024;

/// Number of pre-warmed buffers in the standard class
const STANDARD_PREWARM_COUNT: usize = 500;

/// Upper bound on idle bytes retained per size class
const CLASS_RETAIN_BYTES: usize = 16 * 1024 * 1024;

struct SizeClass {
    size: usize,
    free: Mutex<Vec<Vec<u8>>>,
    outstanding: AtomicUsize,
    retain_count: usize,
}

struct PoolInner {
    classes: Vec<SizeClass>,
}

impl PoolInner {
    /// Index of the smallest class that can hold `min_len`, or None if
    /// the request exceeds the largest pooled class.
    fn class_for(&self, min_len: usize) -> Option<usize> {
        self.classes.iter().position(|c| c.size >= min_len)
    }

    fn recycle(&self, class: usize, mut buf: Vec<u8>) {
        let class = &self.classes[class];
        class.outstanding.fetch_sub(1, Ordering::Relaxed);
        let mut free = class.free.lock();
        if free.len() < class.retain_count {
            buf.clear();
            buf.resize(class.size, 0);
            free.push(buf);
        }
    }
}

/// Process-wide size-classed buffer pool
#[derive(Clone)]
pub struct BytePool {
    inner: Arc<PoolInner>,
}

impl Default for BytePool {
    fn default() -> Self {
        Self::new()
    }
}

impl BytePool {
    /// Create a pool with power-of-two classes from 1 KiB to 4 MiB,
    /// pre-warming the standard 32 KiB class.
    #[must_use]
    pub fn new() -> Self {
        let mut classes = Vec::new();
        let mut size = MIN_CLASS_SIZE;
        while size <= MAX_BLOCK_SIZE {
            let retain_count = (CLASS_RETAIN_BYTES / size).max(4);
            let free = if size == STANDARD_CLASS_SIZE {
                (0..STANDARD_PREWARM_COUNT.min(retain_count))
                    .map(|_| vec![0u8; size])
                    .collect()
            } else {
                Vec::new()
            };
            classes.push(SizeClass {
                size,
                free: Mutex::new(free),
                outstanding: AtomicUsize::new(0),
                retain_count,
            });
            size *= 2;
        }
        Self {
            inner: Arc::new(PoolInner { classes }),
        }
    }

    /// Rent a buffer with at least `min_len` usable bytes
    ///
    /// Requests above [`MAX_BLOCK_SIZE`] are allocated directly and not
    /// returned to any class.
    #[must_use]
    pub fn rent(&self, min_len: usize) -> PooledBuffer {
        match self.inner.class_for(min_len) {
            Some(idx) => {
                let class = &self.inner.classes[idx];
                let buf = class
                    .free
                    .lock()
                    .pop()
                    .unwrap_or_else(|| vec![0u8; class.size]);
                class.outstanding.fetch_add(1, Ordering::Relaxed);
                PooledBuffer {
                    data: Some(Arc::new(buf)),
                    len: min_len,
                    class: Some(idx),
                    pool: Arc::downgrade(&self.inner),
                }
            }
            None => PooledBuffer {
                data: Some(Arc::new(vec![0u8; min_len])),
                len: min_len,
                class: None,
                pool: Weak::new(),
            },
        }
    }

    /// Per-class diagnostics
    #[must_use]
    pub fn stats(&self) -> Vec<PoolStats> {
        self.inner
            .classes
            .iter()
            .map(|c| PoolStats {
                class_size: c.size,
                pooled: c.free.lock().len(),
                outstanding: c.outstanding.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Log the per-class state of the pool
    pub fn dump(&self) {
        for stat in self.stats() {
            debug!(
                class_size = stat.class_size,
                pooled = stat.pooled,
                outstanding = stat.outstanding,
                "byte pool class"
            );
        }
    }
}

/// Snapshot of one size class
#[derive(Clone, Copy, Debug)]
pub struct PoolStats {
    pub class_size: usize,
    pub pooled: usize,
    pub outstanding: usize,
}

/// A rented buffer
///
/// Cloning shares the same backing storage; the buffer returns to its
/// size class only when the last owner drops or releases it. `release`
/// is idempotent.
pub struct PooledBuffer {
    data: Option<Arc<Vec<u8>>>,
    len: usize,
    class: Option<usize>,
    pool: Weak<PoolInner>,
}

impl PooledBuffer {
    /// Usable length of the buffer
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the usable length is zero
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Shrink the usable length (e.g. after a short read)
    pub fn truncate(&mut self, len: usize) {
        self.len = self.len.min(len);
    }

    /// The usable bytes
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        match &self.data {
            Some(data) => &data[..self.len],
            None => &[],
        }
    }

    /// Mutable access to the usable bytes
    ///
    /// Only available while this owner is the sole holder, i.e. before
    /// any clone has been handed out.
    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        let len = self.len;
        self.data
            .as_mut()
            .and_then(Arc::get_mut)
            .map(|data| &mut data[..len])
    }

    /// Copy `src` into the front of the buffer
    ///
    /// Writes through even when the buffer is shared (the backing
    /// storage is cloned first in that case).
    pub fn copy_from(&mut self, src: &[u8]) {
        debug_assert!(src.len() <= self.len);
        if let Some(data) = self.data.as_mut() {
            Arc::make_mut(data)[..src.len()].copy_from_slice(src);
        }
    }

    /// Return the buffer to the pool
    ///
    /// Idempotent; the underlying storage is recycled once every owner
    /// has released or dropped.
    pub fn release(&mut self) {
        let Some(data) = self.data.take() else {
            return;
        };
        if let Ok(buf) = Arc::try_unwrap(data) {
            // Last owner: cycle back to the class, if pooled
            if let (Some(class), Some(pool)) = (self.class, self.pool.upgrade()) {
                pool.recycle(class, buf);
            }
        }
    }
}

impl Clone for PooledBuffer {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            len: self.len,
            class: self.class,
            pool: self.pool.clone(),
        }
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::ops::Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.len)
            .field("class", &self.class)
            .field("released", &self.data.is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rent_rounds_up_to_class() {
        let pool = BytePool::new();
        let buf = pool.rent(1000);
        assert_eq!(buf.len(), 1000);
        assert_eq!(buf.as_slice().len(), 1000);

        let stats = pool.stats();
        assert_eq!(stats[0].class_size, 1024);
        assert_eq!(stats[0].outstanding, 1);
    }

    #[test]
    fn test_standard_class_prewarmed() {
        let pool = BytePool::new();
        let stats = pool.stats();
        let standard = stats
            .iter()
            .find(|s| s.class_size == STANDARD_CLASS_SIZE)
            .unwrap();
        assert!(standard.pooled > 0);
    }

    #[test]
    fn test_return_and_reuse() {
        let pool = BytePool::new();
        {
            let mut buf = pool.rent(2048);
            buf.as_mut_slice().unwrap()[0] = 0xAB;
        }
        // Dropped buffer is back in its class and zeroed for reuse
        let stats = pool.stats();
        let class = stats.iter().find(|s| s.class_size == 2048).unwrap();
        assert_eq!(class.outstanding, 0);
        assert_eq!(class.pooled, 1);

        let buf = pool.rent(2048);
        assert_eq!(buf.as_slice()[0], 0);
    }

    #[test]
    fn test_shared_owner_refcount() {
        let pool = BytePool::new();
        let mut buf = pool.rent(512);
        buf.copy_from(b"hello");
        let shared = buf.clone();

        // First owner releases; storage must stay alive for the clone
        buf.release();
        buf.release(); // idempotent
        assert_eq!(&shared.as_slice()[..5], b"hello");

        drop(shared);
        let stats = pool.stats();
        assert_eq!(stats[0].outstanding, 0);
        assert_eq!(stats[0].pooled, 1);
    }

    #[test]
    fn test_oversized_direct_allocation() {
        let pool = BytePool::new();
        let before: usize = pool.stats().iter().map(|s| s.outstanding).sum();

        let buf = pool.rent(MAX_BLOCK_SIZE + 1);
        assert_eq!(buf.len(), MAX_BLOCK_SIZE + 1);
        drop(buf);

        // Direct allocations never touch the classes
        let after: usize = pool.stats().iter().map(|s| s.outstanding).sum();
        assert_eq!(before, after);
    }

    #[test]
    fn test_mut_slice_unavailable_when_shared() {
        let pool = BytePool::new();
        let mut buf = pool.rent(128);
        let _shared = buf.clone();
        assert!(buf.as_mut_slice().is_none());
    }
}
