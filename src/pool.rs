//! Memory pool: reusable buffers keyed by shape category (frame-sized
//! grayscale buffers, per-target descriptor scratch space, float point
//! buffers) so the hot per-frame path stops allocating once warmed up.
//!
//! Acquisition is scoped: [`Loaned`] releases its buffer back to the free
//! list on drop, on every exit path including an early `?` return. The
//! lock only ever guards the free list bookkeeping, never buffer contents,
//! per the fine-grained-locking note in the concurrency model.

use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::types::Descriptor;

struct Inner<T> {
    free: Vec<Vec<T>>,
    slot_len: usize,
    cap: usize,
    created: usize,
    in_use: usize,
}

/// A pool of same-shaped buffers (`Vec<T>` of fixed length `slot_len`).
/// Grows on demand up to `cap` pooled slots; acquisitions beyond the cap
/// allocate a non-pooled buffer that is simply dropped on release rather
/// than recycled.
///
/// Reference-counted internally (per the data model's ownership note):
/// cloning a `BufferPool` shares the same backing bookkeeping, so a
/// [`Loaned`] buffer can hold an owned handle back to its pool instead of
/// borrowing it, and outlive the call that acquired it.
pub struct BufferPool<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for BufferPool<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T: Clone + Default> BufferPool<T> {
    pub fn new(slot_len: usize, cap: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                free: Vec::new(),
                slot_len,
                cap,
                created: 0,
                in_use: 0,
            })),
        }
    }

    /// Acquire a buffer, growing the pool if under `cap` and no buffer is
    /// free. Beyond `cap`, still succeeds with a non-pooled allocation so
    /// a momentary spike doesn't stall the caller, per "beyond the cap,
    /// acquisition allocates a non-pooled buffer".
    pub fn acquire(&self) -> Result<Loaned<T>> {
        let mut inner = self.inner.lock().expect("memory pool mutex poisoned");
        let (buf, pooled) = if let Some(b) = inner.free.pop() {
            (b, true)
        } else if inner.created < inner.cap {
            let b = try_alloc(inner.slot_len)?;
            inner.created += 1;
            (b, true)
        } else {
            (try_alloc(inner.slot_len)?, false)
        };
        inner.in_use += 1;
        drop(inner);
        Ok(Loaned {
            buf: Some(buf),
            pool: self.clone(),
            pooled,
        })
    }

    /// Snapshot of this bucket's capacity and current usage.
    pub fn bucket_info(&self) -> BucketInfo {
        let inner = self.inner.lock().expect("memory pool mutex poisoned");
        BucketInfo {
            capacity: inner.cap,
            in_use: inner.in_use,
        }
    }

    /// Bytes actually allocated for this bucket so far (pooled slots
    /// created, not the theoretical cap).
    pub fn heap_bytes(&self) -> usize {
        let inner = self.inner.lock().expect("memory pool mutex poisoned");
        inner.created * inner.slot_len * std::mem::size_of::<T>()
    }

    fn release(&self, buf: Vec<T>, pooled: bool) {
        let mut inner = self.inner.lock().expect("memory pool mutex poisoned");
        inner.in_use -= 1;
        if pooled {
            inner.free.push(buf);
        }
    }
}

fn try_alloc<T: Clone + Default>(len: usize) -> Result<Vec<T>> {
    let mut v: Vec<T> = Vec::new();
    v.try_reserve_exact(len)
        .map_err(|e| Error::OutOfMemory(e.to_string()))?;
    v.resize(len, T::default());
    Ok(v)
}

/// A scoped acquisition from a [`BufferPool`]. Buffer contents are zeroed
/// only the first time a slot is created; reuse does not re-zero. Holds an
/// owned (reference-counted) handle to its pool, so it may be stored
/// long-term — e.g. as a target's previous-frame buffer — rather than only
/// within the call that acquired it.
pub struct Loaned<T> {
    buf: Option<Vec<T>>,
    pool: BufferPool<T>,
    pooled: bool,
}

impl<T> std::ops::Deref for Loaned<T> {
    type Target = [T];
    fn deref(&self) -> &[T] {
        self.buf.as_deref().expect("loaned buffer taken")
    }
}

impl<T> std::ops::DerefMut for Loaned<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        self.buf.as_deref_mut().expect("loaned buffer taken")
    }
}

impl<T: Clone + Default> Drop for Loaned<T> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf, self.pooled);
        }
    }
}

/// Per-bucket capacity/usage, as surfaced by `get_memory_info`.
#[derive(Debug, Clone, Copy)]
pub struct BucketInfo {
    pub capacity: usize,
    pub in_use: usize,
}

/// One named bucket's info, as surfaced by `get_memory_info`.
#[derive(Debug, Clone)]
pub struct PoolBucketInfo {
    pub name: &'static str,
    pub capacity: usize,
    pub in_use: usize,
}

/// Aggregate memory info across all buckets, matching the `get_memory_info`
/// wire shape `{ heap_size, in_use, pool_buckets }`.
#[derive(Debug, Clone)]
pub struct MemoryInfo {
    pub heap_size: usize,
    pub in_use: usize,
    pub pool_buckets: Vec<PoolBucketInfo>,
}

/// The three buffer shapes the pipeline needs: previous-frame grayscale
/// buffers (one per tracked target), per-extraction descriptor scratch
/// space, and float point buffers for tracked-point coordinates.
pub struct MemoryPool {
    pub frame_buffers: BufferPool<u8>,
    pub descriptor_buffers: BufferPool<Descriptor>,
    pub point_buffers: BufferPool<f32>,
}

impl MemoryPool {
    pub fn new(frame_len: usize, descriptor_cap: usize, point_cap: usize, bucket_cap: usize) -> Self {
        Self {
            frame_buffers: BufferPool::new(frame_len, bucket_cap),
            descriptor_buffers: BufferPool::new(descriptor_cap, bucket_cap),
            point_buffers: BufferPool::new(point_cap, bucket_cap),
        }
    }

    pub fn memory_info(&self) -> MemoryInfo {
        let frame = self.frame_buffers.bucket_info();
        let descriptors = self.descriptor_buffers.bucket_info();
        let points = self.point_buffers.bucket_info();
        MemoryInfo {
            heap_size: self.frame_buffers.heap_bytes()
                + self.descriptor_buffers.heap_bytes()
                + self.point_buffers.heap_bytes(),
            in_use: frame.in_use + descriptors.in_use + points.in_use,
            pool_buckets: vec![
                PoolBucketInfo { name: "frame", capacity: frame.capacity, in_use: frame.in_use },
                PoolBucketInfo { name: "descriptors", capacity: descriptors.capacity, in_use: descriptors.in_use },
                PoolBucketInfo { name: "points", capacity: points.capacity, in_use: points.in_use },
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_zeroes_on_first_use_only() {
        let pool: BufferPool<u8> = BufferPool::new(8, 2);
        {
            let mut buf = pool.acquire().unwrap();
            assert_eq!(&*buf, &[0u8; 8]);
            buf[0] = 0xFF;
        }
        // Reacquire: same slot recycled, not zeroed.
        let buf2 = pool.acquire().unwrap();
        assert_eq!(buf2[0], 0xFF);
    }

    #[test]
    fn release_restores_in_use_count() {
        let pool: BufferPool<u8> = BufferPool::new(4, 2);
        assert_eq!(pool.bucket_info().in_use, 0);
        {
            let _a = pool.acquire().unwrap();
            let _b = pool.acquire().unwrap();
            assert_eq!(pool.bucket_info().in_use, 2);
        }
        assert_eq!(pool.bucket_info().in_use, 0);
    }

    #[test]
    fn grows_up_to_cap_then_falls_back_to_non_pooled() {
        let pool: BufferPool<u8> = BufferPool::new(4, 1);
        let a = pool.acquire().unwrap();
        assert_eq!(pool.bucket_info().capacity, 1);
        // second acquire exceeds cap but still succeeds (non-pooled)
        let b = pool.acquire().unwrap();
        assert_eq!(pool.bucket_info().in_use, 2);
        drop(a);
        drop(b);
        assert_eq!(pool.bucket_info().in_use, 0);
        // only one slot was ever pooled
        let _c = pool.acquire().unwrap();
        let _d = pool.acquire().unwrap();
        assert_eq!(pool.bucket_info().in_use, 2);
    }

    #[test]
    fn memory_pool_info_aggregates_buckets() {
        let pool = MemoryPool::new(16, 4, 8, 2);
        let _loan = pool.frame_buffers.acquire().unwrap();
        let info = pool.memory_info();
        assert_eq!(info.in_use, 1);
        assert_eq!(info.pool_buckets.len(), 3);
    }
}
