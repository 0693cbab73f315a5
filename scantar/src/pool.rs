//! Pooled byte buffers for small-object downloads.
//!
//! Objects at or below the in-memory threshold are downloaded straight into a pooled buffer
//! instead of a fresh allocation, so a run over millions of small objects recycles a handful of
//! buffers instead of hammering the allocator.  Two fixed tiers are kept: one for objects up to
//! 32 KiB and one for objects up to the configured `max_in_mem` threshold.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

pub(crate) const SMALL_TIER_CAPACITY: usize = 32 * 1024;

/// Two-tier pool of reusable byte buffers.
///
/// Buffers handed out by [`acquire`](Self::acquire) are sliced to the requested length; when the
/// [`PooledBuf`] is dropped the buffer is restored to its full tier capacity before going back in
/// the pool, so capacity never erodes across reuses.
pub struct BufferPool {
    small: Tier,
    large: Tier,
}

struct Tier {
    capacity: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl Tier {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            free: Mutex::new(Vec::new()),
        }
    }

    fn take(&self) -> Vec<u8> {
        let mut free = self.free.lock().unwrap();
        free.pop().unwrap_or_else(|| vec![0u8; self.capacity])
    }

    fn put(&self, mut buf: Vec<u8>) {
        // Restore the full tier length before the buffer is reused; callers hold it truncated to
        // their object size.
        buf.resize(self.capacity, 0);
        self.free.lock().unwrap().push(buf);
    }
}

impl BufferPool {
    /// Create a pool whose large tier holds buffers of `max_in_mem` bytes.
    pub fn new(max_in_mem: usize) -> Arc<Self> {
        Arc::new(Self {
            small: Tier::new(SMALL_TIER_CAPACITY),
            large: Tier::new(max_in_mem.max(SMALL_TIER_CAPACITY)),
        })
    }

    /// Take a buffer from the smallest tier that fits `len` bytes, sliced to exactly `len`.
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds the large tier capacity; the caller is responsible for routing
    /// anything bigger than `max_in_mem` to the spill path instead.
    pub fn acquire(self: &Arc<Self>, len: usize) -> PooledBuf {
        assert!(
            len <= self.large.capacity,
            "requested {len} bytes from a pool capped at {}",
            self.large.capacity
        );

        let small = len <= self.small.capacity;
        let mut buf = if small {
            self.small.take()
        } else {
            self.large.take()
        };
        buf.truncate(len);

        PooledBuf {
            buf: Some(buf),
            small,
            pool: Arc::clone(self),
        }
    }
}

/// A buffer checked out of a [`BufferPool`]; returns itself to the pool on drop.
pub struct PooledBuf {
    buf: Option<Vec<u8>>,
    small: bool,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().expect("buffer already released")
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().expect("buffer already released")
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            let tier = if self.small {
                &self.pool.small
            } else {
                &self.pool.large
            };
            tier.put(buf);
        }
    }
}

impl std::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuf")
            .field("len", &self.buf.as_ref().map(|b| b.len()))
            .field("small", &self.small)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_to_the_right_tier() {
        let pool = BufferPool::new(96 * 1024);

        let small = pool.acquire(100);
        assert!(small.small);
        assert_eq!(small.len(), 100);

        let boundary = pool.acquire(SMALL_TIER_CAPACITY);
        assert!(boundary.small);

        let large = pool.acquire(SMALL_TIER_CAPACITY + 1);
        assert!(!large.small);
        assert_eq!(large.len(), SMALL_TIER_CAPACITY + 1);
    }

    #[test]
    fn capacity_survives_truncated_release() {
        let pool = BufferPool::new(96 * 1024);

        let first = pool.acquire(10);
        assert_eq!(first.len(), 10);
        drop(first);

        // The buffer goes back at full tier length, so a bigger follow-up acquisition can reuse
        // it without reallocating
        let second = pool.acquire(SMALL_TIER_CAPACITY);
        assert_eq!(second.len(), SMALL_TIER_CAPACITY);
    }

    #[test]
    fn reuses_released_buffers() {
        let pool = BufferPool::new(96 * 1024);

        let mut buf = pool.acquire(4);
        buf.copy_from_slice(b"abcd");
        let ptr = buf.as_ptr();
        drop(buf);

        let again = pool.acquire(4);
        assert_eq!(again.as_ptr(), ptr, "expected the pooled buffer back");
    }

    #[test]
    fn zero_length_acquisition() {
        let pool = BufferPool::new(96 * 1024);
        let buf = pool.acquire(0);
        assert_eq!(buf.len(), 0);
    }

    #[test]
    #[should_panic(expected = "requested")]
    fn oversized_acquisition_panics() {
        let pool = BufferPool::new(96 * 1024);
        let _ = pool.acquire(96 * 1024 + 1);
    }
}
