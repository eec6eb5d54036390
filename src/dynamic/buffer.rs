// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
A discard-rotated byte buffer.

The write path for per-frame constants and streamed vertex data: rotate to a
fresh backing allocation, fill it, bind it. Reads never happen; the backing
memory is write-combined.
*/

use super::{BufferExchange, RotateError, ViewError};
use crate::bindable::{ArgumentData, BindingRef, DynamicBinding, ObserverRegistry};
use crate::imp;
use crate::pool::BufferPool;
use std::sync::{Arc, Mutex};

struct BufferState {
    current: imp::Buffer,
    generation: u64,
}

struct Inner {
    len: u64,
    pool: BufferPool,
    registry: Arc<ObserverRegistry>,
    state: Mutex<BufferState>,
}

/**
One logical buffer over a rotating set of backing allocations.

Clones share the logical buffer. Rotation and writing belong to the frame
producer; the recorded operations resolve through [`bindable`](Self::bindable)
handles and see whichever allocation is current when they encode.
*/
#[derive(Clone)]
pub struct DynamicBuffer {
    inner: Arc<Inner>,
}

impl DynamicBuffer {
    pub fn new(
        device: &imp::Device,
        len: u64,
        options: imp::BufferOptions,
        label: &str,
    ) -> Result<Self, imp::Error> {
        let pool = BufferPool::new(device, len, options, label);
        let current = pool.acquire()?;
        Ok(DynamicBuffer {
            inner: Arc::new(Inner {
                len,
                pool,
                registry: ObserverRegistry::new(),
                state: Mutex::new(BufferState {
                    current,
                    generation: 0,
                }),
            }),
        })
    }

    /// Creates the buffer and fills the first backing allocation.
    pub fn with_initial_data(
        device: &imp::Device,
        data: &[u8],
        options: imp::BufferOptions,
        label: &str,
    ) -> Result<Self, imp::Error> {
        let buffer = Self::new(device, data.len() as u64, options, label)?;
        buffer.write(0, data);
        Ok(buffer)
    }

    pub fn len(&self) -> u64 {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    /// Handle to the current backing allocation. Stale after the next rotate.
    pub fn current(&self) -> imp::Buffer {
        self.inner.state.lock().unwrap().current.clone()
    }

    /**
    The CPU-writable pointer into the current backing allocation, the
    map-discard return value. Stale after the next rotate; same discard
    contract as [`write`](Self::write).
    */
    pub fn mapped_memory(&self) -> std::ptr::NonNull<u8> {
        self.inner.state.lock().unwrap().current.contents()
    }

    /// Number of completed rotations.
    pub fn generation(&self) -> u64 {
        self.inner.state.lock().unwrap().generation
    }

    /**
    Copies `data` into the current backing allocation at `offset`.

    Discard contract: between two commits, a write must be preceded by a
    [`rotate`](Self::rotate) (or target a range no in-flight operation
    binds). The rotation protocol is what makes this single-writer.
    */
    pub fn write(&self, offset: usize, data: &[u8]) {
        let current = self.current();
        //safety: per the discard contract above, no submission in flight
        //references this allocation and the producer is the only writer
        unsafe { current.write_bytes(offset, data) };
    }

    /**
    Swaps in a fresh backing allocation and retires the old one through
    `exchange`. Bindings created from this buffer resolve to the new
    allocation from now on; operations already encoded keep reading the
    retired allocation, which stays out of the pool until coherence
    passes every submission that could reference it.
    */
    pub fn rotate(&self, exchange: &mut impl BufferExchange) -> Result<(), RotateError> {
        let next = self.inner.pool.acquire()?;
        let retired = {
            let mut state = self.inner.state.lock().unwrap();
            let retired = std::mem::replace(&mut state.current, next.clone());
            state.generation += 1;
            retired
        };
        exchange.retire(self.inner.pool.recycle_guard(retired))?;
        self.inner.registry.notify_all(&next);
        Ok(())
    }

    /**
    A binding handle that resolves to whichever backing allocation is
    current at resolution time. Registered for rotation notifications until
    dropped.
    */
    pub fn bindable(&self) -> Arc<DynamicBinding> {
        self.bindable_observing(|_buffer| {})
    }

    /**
    Like [`bindable`](Self::bindable), with a callback invoked after every
    rotation with the replacement allocation. Encoder-side state that keys
    on the backing buffer (residency sets, argument-buffer patches) hooks
    in here.
    */
    pub fn bindable_observing(
        &self,
        on_rotate: impl Fn(&imp::Buffer) + Send + Sync + 'static,
    ) -> Arc<DynamicBinding> {
        let resolve_inner = self.inner.clone();
        let argument_inner = self.inner.clone();
        self.inner.registry.register(move |id, registry| {
            DynamicBinding::new(
                id,
                registry,
                Box::new(move |_coherent_seq| BindingRef::Buffer {
                    buffer: resolve_inner.state.lock().unwrap().current.clone(),
                    offset: 0,
                }),
                Box::new(move || ArgumentData {
                    handle: argument_inner.state.lock().unwrap().current.gpu_address(),
                }),
                Box::new(on_rotate),
            )
        })
    }

    /// Raw buffers do not offer shader resource views.
    pub fn shader_resource_view(&self) -> Result<std::convert::Infallible, ViewError> {
        Err(ViewError::Unsupported)
    }

    #[cfg(test)]
    fn observer_count(&self) -> usize {
        self.inner.registry.len()
    }

    #[cfg(test)]
    fn pool_free_count(&self) -> usize {
        self.inner.pool.free_count()
    }
}

impl std::fmt::Debug for DynamicBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicBuffer")
            .field("len", &self.inner.len)
            .field("generation", &self.generation())
            .finish()
    }
}
