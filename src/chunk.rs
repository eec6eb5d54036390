// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
A reusable, arena-backed container for one batch of recorded GPU work.

Recording must be cheap: [`CommandChunk::emit`] places the operation's
closure and its intrusive list node in the chunk's CPU heap, O(1) append
with no per-operation heap traffic. Encoding replays the chain strictly in
insertion order against an [`EncodeContext`]; [`CommandChunk::reset`] walks
the chain once more to run destructors and is the sole reclamation path, so
captured values live until the chunk is reset, which the queue does only
after the GPU finished the submission. Rotation uses this to defer pool
returns until the old allocation is provably idle.

An allocation failure poisons the chunk: further emits fail and the commit
of a poisoned chunk fails the submission instead of proceeding with a
truncated command stream.
*/

use crate::bindable::BindingRef;
use crate::imp;
use crate::linear_heap::{HeapOverflow, LinearHeap};
use std::ptr::NonNull;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkError {
    #[error("cpu argument heap overflow: {0}")]
    CpuHeapOverflow(#[from] HeapOverflow),
    #[error("gpu argument heap overflow: {0}")]
    GpuHeapOverflow(HeapOverflow),
    #[error("chunk poisoned by an earlier allocation failure")]
    Poisoned,
}

/// Object-safe shim over the recorded closure. Invoked at most once per
/// commit cycle; dropped (with its captures) only at reset.
trait DeferredOp {
    fn invoke(&mut self, ctx: &mut EncodeContext);
}

struct OpSlot<F> {
    f: F,
}

impl<F> DeferredOp for OpSlot<F>
where
    F: FnMut(&mut EncodeContext) + Send,
{
    fn invoke(&mut self, ctx: &mut EncodeContext) {
        (self.f)(ctx)
    }
}

struct OpNode {
    op: *mut dyn DeferredOp,
    next: *mut OpNode,
}

/// A slice of the chunk's GPU-visible argument heap.
#[derive(Debug)]
pub struct GpuAllocation {
    /// Binding for the heap buffer at the allocation's offset.
    pub binding: BindingRef,
    /// CPU-writable pointer to the allocation's bytes.
    pub contents: NonNull<u8>,
}

struct GpuHeap {
    buffer: imp::Buffer,
    offset: u64,
}

impl GpuHeap {
    fn allocate(&mut self, size: u64, align: u64) -> Result<GpuAllocation, HeapOverflow> {
        debug_assert!(align.is_power_of_two());
        let capacity = self.buffer.len();
        let aligned = (self.offset + align - 1) & !(align - 1);
        let end = aligned + size;
        if end > capacity {
            return Err(HeapOverflow {
                offset: self.offset as usize,
                requested: size as usize,
                align: align as usize,
                capacity: capacity as usize,
            });
        }
        self.offset = end;
        //safety: aligned < capacity, and the buffer contents are valid for its length
        let contents = unsafe {
            NonNull::new(self.buffer.contents().as_ptr().add(aligned as usize))
                .expect("gpu heap contents non-null")
        };
        Ok(GpuAllocation {
            binding: BindingRef::Buffer {
                buffer: self.buffer.clone(),
                offset: aligned,
            },
            contents,
        })
    }
}

pub struct CommandChunk {
    cpu_heap: LinearHeap,
    gpu_heap: GpuHeap,
    head: *mut OpNode,
    tail: *mut OpNode,
    len: usize,
    failed: bool,
}

//Safety: the raw pointers point into `cpu_heap`, which the chunk owns, and
//recorded closures are `Send`. Concurrent access is excluded by the queue's
//sequence-counter handshake: exactly one of producer, encode thread, finish
//thread borrows a chunk at any instant.
unsafe impl Send for CommandChunk {}

impl CommandChunk {
    pub(crate) fn new(cpu_capacity: usize, gpu_heap: imp::Buffer) -> Self {
        CommandChunk {
            cpu_heap: LinearHeap::new(cpu_capacity),
            gpu_heap: GpuHeap {
                buffer: gpu_heap,
                offset: 0,
            },
            head: std::ptr::null_mut(),
            tail: std::ptr::null_mut(),
            len: 0,
            failed: false,
        }
    }

    /**
    Appends a deferred operation to the chain.

    The closure runs at encode time, on whichever thread encodes this chunk;
    its captures are dropped at [`reset`](Self::reset), after the GPU has
    finished the submission. This is the only way work enters a chunk.
    */
    pub fn emit<F>(&mut self, op: F) -> Result<(), ChunkError>
    where
        F: FnMut(&mut EncodeContext) + Send + 'static,
    {
        if self.failed {
            return Err(ChunkError::Poisoned);
        }
        let slot = match self.cpu_heap.allocate_uninit::<OpSlot<F>>() {
            Ok(p) => p,
            Err(e) => {
                self.fail_cpu(e);
                return Err(ChunkError::CpuHeapOverflow(e));
            }
        };
        //safety: `slot` is valid, properly aligned, uninitialized heap space
        unsafe { slot.as_ptr().write(OpSlot { f: op }) };
        let node = match self.cpu_heap.allocate_uninit::<OpNode>() {
            Ok(p) => p,
            Err(e) => {
                //the slot was initialized but will never be linked; drop it now
                unsafe { std::ptr::drop_in_place(slot.as_ptr()) };
                self.fail_cpu(e);
                return Err(ChunkError::CpuHeapOverflow(e));
            }
        };
        let op_ptr: *mut dyn DeferredOp = slot.as_ptr();
        //safety: `node` is valid, properly aligned, uninitialized heap space
        unsafe {
            node.as_ptr().write(OpNode {
                op: op_ptr,
                next: std::ptr::null_mut(),
            });
            if self.tail.is_null() {
                self.head = node.as_ptr();
            } else {
                (*self.tail).next = node.as_ptr();
            }
        }
        self.tail = node.as_ptr();
        self.len += 1;
        Ok(())
    }

    /**
    Allocates argument data the GPU itself will read, out of the chunk's
    GPU-visible heap. The returned slice is valid until the chunk resets.
    */
    pub fn allocate_gpu(&mut self, size: u64, align: u64) -> Result<GpuAllocation, ChunkError> {
        if self.failed {
            return Err(ChunkError::Poisoned);
        }
        self.gpu_heap.allocate(size, align).map_err(|e| {
            self.fail_gpu(e);
            ChunkError::GpuHeapOverflow(e)
        })
    }

    fn fail_cpu(&mut self, e: HeapOverflow) {
        logwise::error_sync!(
            "cpu argument heap overflow: {requested} bytes at offset {offset}, capacity {capacity}; chunk poisoned",
            requested = e.requested,
            offset = e.offset,
            capacity = e.capacity
        );
        self.failed = true;
    }

    fn fail_gpu(&mut self, e: HeapOverflow) {
        logwise::error_sync!(
            "gpu argument heap overflow: {requested} bytes at offset {offset}, capacity {capacity}; chunk poisoned",
            requested = e.requested,
            offset = e.offset,
            capacity = e.capacity
        );
        self.failed = true;
    }

    /// True once any heap allocation failed; commit of such a chunk fails.
    pub fn failed(&self) -> bool {
        self.failed
    }

    /// Number of operations currently recorded.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes consumed from the CPU and GPU argument heaps.
    pub fn heap_offsets(&self) -> (usize, u64) {
        (self.cpu_heap.offset(), self.gpu_heap.offset)
    }

    /**
    Replays the chain strictly in insertion order against one shared
    encoding context wrapping `cmdbuf`, closing any encoder the operations
    left open, and returns the finished command buffer for submission.
    */
    pub fn encode(&mut self, cmdbuf: imp::CommandBuffer) -> imp::CommandBuffer {
        let mut ctx = EncodeContext::new(cmdbuf);
        let mut cur = self.head;
        while !cur.is_null() {
            //safety: nodes and operations live in our cpu heap, which resets
            //only after this walk completes
            unsafe {
                debug_assert!(self.cpu_heap.contains(cur.cast()));
                debug_assert!(self.cpu_heap.contains((*cur).op.cast()));
                (*(*cur).op).invoke(&mut ctx);
                cur = (*cur).next;
            }
        }
        ctx.finish()
    }

    /**
    Destroys every recorded operation, in insertion order, and zeroes both
    heaps and the chain. The sole reclamation path; also clears a poisoned
    state.
    */
    pub fn reset(&mut self) {
        let mut cur = self.head;
        while !cur.is_null() {
            //safety: same layout invariants as `encode`
            unsafe {
                debug_assert!(self.cpu_heap.contains(cur.cast()));
                debug_assert!(self.cpu_heap.contains((*cur).op.cast()));
                std::ptr::drop_in_place((*cur).op);
                cur = (*cur).next;
            }
        }
        self.head = std::ptr::null_mut();
        self.tail = std::ptr::null_mut();
        self.len = 0;
        self.failed = false;
        self.cpu_heap.reset();
        self.gpu_heap.offset = 0;
    }
}

impl Drop for CommandChunk {
    fn drop(&mut self) {
        self.reset();
    }
}

#[derive(PartialEq, Eq)]
enum ActiveEncoder {
    None,
    Render,
    Compute,
}

/**
The shared encoding context a chunk's operations run against.

Wraps the native command buffer plus the zero-or-one currently open encoder
of each kind and the current index buffer. Operations open and close
sub-encoders as needed through this type, never on the command buffer
directly, so at most one encoder is open at a time.
*/
pub struct EncodeContext {
    cmd: imp::CommandBuffer,
    active: ActiveEncoder,
    current_index_buffer: Option<BindingRef>,
}

impl EncodeContext {
    fn new(cmd: imp::CommandBuffer) -> Self {
        EncodeContext {
            cmd,
            active: ActiveEncoder::None,
            current_index_buffer: None,
        }
    }

    fn end_active(&mut self) {
        match self.active {
            ActiveEncoder::Render => self.cmd.end_render_pass(),
            ActiveEncoder::Compute => self.cmd.end_compute_pass(),
            ActiveEncoder::None => {}
        }
        self.active = ActiveEncoder::None;
    }

    /// Opens a render encoder, closing whatever encoder was open.
    pub fn begin_render_pass(&mut self, targets: &imp::RenderTargets) {
        self.end_active();
        self.cmd.begin_render_pass(targets);
        self.active = ActiveEncoder::Render;
    }

    /// Opens a compute encoder, closing whatever encoder was open.
    pub fn begin_compute_pass(&mut self) {
        self.end_active();
        self.cmd.begin_compute_pass();
        self.active = ActiveEncoder::Compute;
    }

    /// Closes any open encoder. Copy operations do this implicitly.
    pub fn end_encoders(&mut self) {
        self.end_active();
    }

    pub fn copy_buffer_to_buffer(
        &mut self,
        src: &imp::Buffer,
        src_offset: u64,
        dst: &imp::Buffer,
        dst_offset: u64,
        len: u64,
    ) {
        self.end_active();
        self.cmd
            .copy_buffer_to_buffer(src, src_offset, dst, dst_offset, len);
    }

    pub fn set_vertex_buffer(&mut self, slot: u32, binding: &BindingRef) {
        assert!(
            self.active == ActiveEncoder::Render,
            "vertex buffer bound outside a render pass"
        );
        let buffer = binding.buffer().expect("vertex binding must be a buffer");
        let offset = match binding {
            BindingRef::Buffer { offset, .. } => *offset,
            BindingRef::Texture(_) => unreachable!(),
        };
        self.cmd.set_vertex_buffer(slot, buffer, offset);
    }

    pub fn set_texture(&mut self, slot: u32, view: &imp::TextureView) {
        assert!(
            self.active == ActiveEncoder::Render,
            "texture bound outside a render pass"
        );
        self.cmd.set_texture(slot, view);
    }

    pub fn draw(&mut self, vertices: u32, instances: u32) {
        assert!(
            self.active == ActiveEncoder::Render,
            "draw outside a render pass"
        );
        self.cmd.draw(vertices, instances);
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        assert!(
            self.active == ActiveEncoder::Compute,
            "dispatch outside a compute pass"
        );
        self.cmd.dispatch(x, y, z);
    }

    /// Records the index buffer later draw operations will read.
    pub fn set_current_index_buffer(&mut self, binding: Option<BindingRef>) {
        if let Some(b) = &binding {
            let buffer = b.buffer().expect("index binding must be a buffer");
            let offset = match b {
                BindingRef::Buffer { offset, .. } => *offset,
                BindingRef::Texture(_) => unreachable!(),
            };
            self.cmd.set_index_buffer(buffer, offset);
        }
        self.current_index_buffer = binding;
    }

    pub fn current_index_buffer(&self) -> Option<&BindingRef> {
        self.current_index_buffer.as_ref()
    }

    pub fn debug_marker(&mut self, marker: &str) {
        self.cmd.debug_marker(marker);
    }

    /// Escape hatch to the backend command buffer.
    pub fn command_buffer_mut(&mut self) -> &mut imp::CommandBuffer {
        &mut self.cmd
    }

    fn finish(mut self) -> imp::CommandBuffer {
        self.end_active();
        self.cmd
    }
}
