// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
causeway is a threaded GPU command pipeline with discard-rotated dynamic
resources, the submission core for translation layers that must accept
immediate-mode recording from one thread while keeping a GPU several
frames deep in work.

# Architecture

Recording is cheap and deferred. The producer records closures into the
current [`chunk::CommandChunk`], an arena holding both the closures and a
GPU-visible argument heap. [`queue::Recorder::commit`] hands the chunk to a
dedicated encode thread, which replays the closures into a native command
buffer and submits it; a finish thread retires completions strictly in
sequence order. A fixed ring of [`queue::RING_SIZE`] chunks bounds how far
the CPU may run ahead, and [`queue::CommandQueue::wait_cpu_fence`] parks a
thread until a given submission is fully done.

Dynamic resources ([`dynamic::DynamicBuffer`], [`dynamic::DynamicTexture2D`])
solve the other half of the problem: CPU writes to memory the GPU may still
be reading. Each discard swaps in a pooled backing allocation and parks the
retired one in the current chunk, deferring its reuse until the GPU has
provably finished with it. Binding objects resolve lazily, so operations
recorded before a rotation and encoded after it see the current allocation.

# Backends

The device seam ([`imp`]) compiles to exactly one backend:

- the default in-process backend, which records what would have been
  encoded and completes submissions immediately or under manual control;
  the test suite runs against it, and so can any consumer that only needs
  the scheduling behavior, and
- `backend_wgpu`, which maps the same surface onto a `wgpu` device and
  queue supplied by the host.

# Example

```
use causeway::queue::{CommandQueue, QueueOptions};
use causeway::dynamic::{BufferExchange, DynamicBuffer};

# #[cfg(not(feature = "backend_wgpu"))]
# fn demo() -> Result<(), Box<dyn std::error::Error>> {
let device = causeway::imp::Device::new();
let (queue, mut recorder) = CommandQueue::new(device.clone(), QueueOptions::default())?;

let constants = DynamicBuffer::new(&device, 256, Default::default(), "frame constants")?;
let binding = constants.bindable();

for frame in 0u32..3 {
    constants.rotate(&mut recorder)?;
    constants.write(0, &frame.to_le_bytes());
    let binding = binding.clone();
    recorder.emit(move |ctx| {
        use causeway::bindable::Bindable;
        //resolved here, at encode time, against the current allocation
        let _current = binding.binding(0);
        ctx.debug_marker("frame");
    })?;
    let fence = recorder.commit()?;
    queue.wait_cpu_fence(fence, None)?;
}
# drop(recorder);
# Ok(())
# }
# #[cfg(not(feature = "backend_wgpu"))]
# fn main() { demo().unwrap() }
# #[cfg(feature = "backend_wgpu")]
# fn main() {}
```
*/

pub mod bindable;
pub mod chunk;
pub mod dynamic;
pub mod formats;
pub mod imp;
pub mod linear_heap;
pub mod pool;
pub mod queue;

pub use bindable::{ArgumentData, Bindable, BindingRef, DynamicBinding};
pub use chunk::{ChunkError, CommandChunk, EncodeContext};
pub use dynamic::{DynamicBuffer, DynamicTexture2D, RotateError, ViewError};
pub use queue::{CommandQueue, CommitError, FenceError, QueueOptions, RING_SIZE, Recorder};
