// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Discard-rotated resources.

A dynamic resource presents one stable identity to callers while cycling
through pooled backing buffers underneath. Each discard swaps in a fresh
backing allocation; the retired one is held on the queue, keyed by the
sequence being recorded, and rejoins the pool only once that sequence is
coherent and every submission that could reference it has finished. The
CPU therefore always writes memory the GPU has never been promised.

Bindings resolve lazily. An operation recorded before a rotation but
encoded after it sees the post-rotation backing; this is correct because
binding objects promise "the current allocation at encode time", not a
snapshot.
*/

use crate::chunk::ChunkError;
use crate::imp;
use crate::pool::PoolReturn;
use crate::queue::Recorder;

pub mod buffer;
pub mod texture;

pub use buffer::DynamicBuffer;
pub use texture::{
    DynamicTexture2D, ShaderResourceView, TextureDescriptor, ViewDescriptor, ViewDimension,
};

#[derive(thiserror::Error, Debug)]
pub enum RotateError {
    #[error("could not allocate a replacement backing buffer: {0}")]
    Allocation(#[from] imp::Error),
    #[error("could not park the retired buffer in the current chunk: {0}")]
    Record(#[from] ChunkError),
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewError {
    /// Shader resource views over rotating raw buffers are not offered;
    /// a view would need re-creation every rotation with nothing cached.
    #[error("shader resource views over dynamic buffers are not supported")]
    Unsupported,
    #[error("view format has a different texel size than the texture format")]
    FormatMismatch,
    #[error("dynamic textures only support 2D views")]
    UnsupportedDimension,
    #[error("dynamic textures have a single subresource; mip {mip} slice {slice} requested")]
    SubresourceOutOfRange { mip: u32, slice: u32 },
}

/**
Where a rotation parks its retired buffer.

Implemented by [`Recorder`]: the guard is held keyed by the recording
sequence and drops back to its pool once that sequence is coherent. A
chunk reset is not a release point; a poisoned chunk resets without
submitting, while older submissions may still read the retired buffer.
Tests substitute their own implementations to hold retirements open.
*/
pub trait BufferExchange {
    fn retire(&mut self, guard: PoolReturn) -> Result<(), ChunkError>;
}

impl BufferExchange for Recorder {
    fn retire(&mut self, guard: PoolReturn) -> Result<(), ChunkError> {
        self.release_at_coherence(guard);
        Ok(())
    }
}

#[cfg(all(test, not(feature = "backend_wgpu")))]
pub(crate) mod testing {
    use super::*;

    /// Holds retirements open, standing in for chunks the GPU still owns.
    pub(crate) struct HeldExchange {
        pub(crate) parked: Vec<PoolReturn>,
    }

    impl HeldExchange {
        pub(crate) fn new() -> Self {
            HeldExchange { parked: Vec::new() }
        }
    }

    impl BufferExchange for HeldExchange {
        fn retire(&mut self, guard: PoolReturn) -> Result<(), ChunkError> {
            self.parked.push(guard);
            Ok(())
        }
    }
}
