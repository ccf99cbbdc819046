//! Size-bucketed sample buffer pool
//!
//! Buffers are bucketed by length, rounded up to the next power of two.
//! `rent` hands out a zero-filled `Vec<f32>` (reused when the bucket has one,
//! freshly allocated otherwise) and `recycle` takes it back by value, so a
//! buffer cannot be returned twice or used after it was returned.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Default per-bucket ceiling
pub const DEFAULT_BUCKET_CAPACITY: usize = 32;

type Bucket = Arc<Mutex<Vec<Vec<f32>>>>;

/// Hit/miss counters for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub hits: u64,
    pub misses: u64,
    pub discarded: u64,
}

/// Thread-safe pool of `f32` sample buffers
pub struct BufferPool {
    buckets: RwLock<HashMap<usize, Bucket>>,
    bucket_capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    discarded: AtomicU64,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUCKET_CAPACITY)
    }
}

impl BufferPool {
    /// Create a pool that keeps at most `bucket_capacity` buffers per size
    pub fn new(bucket_capacity: usize) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            bucket_capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    /// Bucket size for a request of `min_size` samples
    #[inline]
    pub fn bucket_size(min_size: usize) -> usize {
        min_size.max(1).next_power_of_two()
    }

    fn bucket(&self, size: usize) -> Bucket {
        if let Some(bucket) = self.buckets.read().get(&size) {
            return bucket.clone();
        }
        self.buckets
            .write()
            .entry(size)
            .or_insert_with(|| Arc::new(Mutex::new(Vec::with_capacity(self.bucket_capacity))))
            .clone()
    }

    /// Check out a zero-filled buffer of length `bucket_size(min_size)`
    pub fn rent(&self, min_size: usize) -> Vec<f32> {
        let size = Self::bucket_size(min_size);
        let pooled = self.bucket(size).lock().pop();
        match pooled {
            Some(buffer) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                buffer
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                vec![0.0; size]
            }
        }
    }

    /// Give a rented buffer back to the pool.
    ///
    /// The buffer is zero-filled before it is stored. Buffers whose length is
    /// not a bucket size, and buffers arriving at a full bucket, are dropped.
    pub fn recycle(&self, mut buffer: Vec<f32>) {
        let size = buffer.len();
        if size == 0 || !size.is_power_of_two() {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }

        buffer.fill(0.0);
        let bucket = self.bucket(size);
        let mut available = bucket.lock();
        if available.len() < self.bucket_capacity {
            available.push(buffer);
        } else {
            self.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Number of idle buffers currently held for `size`
    pub fn available(&self, size: usize) -> usize {
        self.buckets
            .read()
            .get(&Self::bucket_size(size))
            .map(|b| b.lock().len())
            .unwrap_or(0)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }

    pub fn bucket_capacity(&self) -> usize {
        self.bucket_capacity
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("buckets", &self.buckets.read().len())
            .field("bucket_capacity", &self.bucket_capacity)
            .field("stats", &self.stats())
            .finish()
    }
}
