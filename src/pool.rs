// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
A free list of same-shaped backing buffers for discard rotation.

Every buffer in one pool has the same length and allocation options, so any
free entry satisfies any acquire. Retired allocations do not come back
immediately: rotation wraps them in a [`PoolReturn`] guard and parks the
guard in the chunk that last referenced the buffer, so the buffer rejoins
the free list only when that chunk resets, which happens strictly after the
GPU finished with it.
*/

use crate::imp;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

struct PoolInner {
    device: imp::Device,
    len: u64,
    options: imp::BufferOptions,
    label: String,
    free: Mutex<VecDeque<imp::Buffer>>,
}

/// A bucket of interchangeable backing buffers. Clones share the bucket.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    pub fn new(device: &imp::Device, len: u64, options: imp::BufferOptions, label: &str) -> Self {
        BufferPool {
            inner: Arc::new(PoolInner {
                device: device.clone(),
                len,
                options,
                label: label.to_string(),
                free: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /**
    Takes a free buffer, or allocates a fresh one if the free list is empty.

    The pool never blocks waiting for a retired buffer to come back; steady
    state is reached once enough buffers exist to cover the frames in flight.
    */
    pub fn acquire(&self) -> Result<imp::Buffer, imp::Error> {
        if let Some(buffer) = self.inner.free.lock().unwrap().pop_front() {
            return Ok(buffer);
        }
        logwise::trace_sync!(
            "pool {label} growing: new buffer of {len} bytes",
            label = logwise::privacy::LogIt(&self.inner.label),
            len = self.inner.len
        );
        self.inner
            .device
            .new_buffer(self.inner.len, self.inner.options, &self.inner.label)
    }

    /**
    Wraps a retired buffer in a guard that returns it to the free list when
    dropped. The caller parks the guard wherever "safe to reuse" is reached;
    for rotation that is the retiring chunk's operation chain.
    */
    pub fn recycle_guard(&self, buffer: imp::Buffer) -> PoolReturn {
        debug_assert_eq!(buffer.len(), self.inner.len);
        debug_assert_eq!(buffer.options(), self.inner.options);
        PoolReturn {
            buffer: Some(buffer),
            pool: Arc::downgrade(&self.inner),
        }
    }

    pub fn free_count(&self) -> usize {
        self.inner.free.lock().unwrap().len()
    }
}

/**
Returns one buffer to its pool on drop.

Holds the pool weakly; if the pool itself is gone by the time the guard
drops, the buffer is simply freed.
*/
pub struct PoolReturn {
    buffer: Option<imp::Buffer>,
    pool: Weak<PoolInner>,
}

impl Drop for PoolReturn {
    fn drop(&mut self) {
        let buffer = self.buffer.take().expect("guard dropped once");
        if let Some(pool) = self.pool.upgrade() {
            pool.free.lock().unwrap().push_back(buffer);
        }
    }
}

#[cfg(all(test, not(feature = "backend_wgpu")))]
mod tests {
    use super::*;

    #[test]
    fn acquire_allocates_then_reuses() {
        let device = imp::Device::new();
        let pool = BufferPool::new(&device, 256, imp::BufferOptions::default(), "reuse");
        let first = pool.acquire().unwrap();
        let first_id = first.id();
        assert_eq!(pool.free_count(), 0);

        drop(pool.recycle_guard(first));
        assert_eq!(pool.free_count(), 1);

        let again = pool.acquire().unwrap();
        assert_eq!(again.id(), first_id);
    }

    #[test]
    fn held_guard_forces_a_fresh_allocation() {
        let device = imp::Device::new();
        let pool = BufferPool::new(&device, 256, imp::BufferOptions::default(), "held");
        let first = pool.acquire().unwrap();
        let first_id = first.id();
        let guard = pool.recycle_guard(first);
        //the retired buffer is not observable until the guard drops
        let second = pool.acquire().unwrap();
        assert_ne!(second.id(), first_id);
        drop(guard);
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn guard_outliving_the_pool_frees_the_buffer() {
        let device = imp::Device::new();
        let pool = BufferPool::new(&device, 64, imp::BufferOptions::default(), "orphan");
        let buffer = pool.acquire().unwrap();
        let guard = pool.recycle_guard(buffer);
        drop(pool);
        //no pool left to return to; dropping the guard must not panic
        drop(guard);
    }
}
