// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
In-process backend.

Buffers are plain heap memory, command buffers record what would have been
encoded, and submissions complete either immediately or under manual control
(`Device::paused`). The paused mode is what lets the tests hold a submission
"on the GPU" while they assert that fences block, that completion is
serialized in sequence order, and that backpressure engages.
*/

use crate::formats::TextureViewDesc;
use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    #[error("device failure: {0}")]
    Device(String),
    #[error("buffer allocation failed: {0}")]
    Allocation(String),
}

/// Invoked exactly once when the GPU (here: the noop device) finishes a submission.
pub type CompletionHandler = Box<dyn FnOnce(Result<(), Error>) + Send>;

/// Allocation options for backing buffers. One options value plus one length
/// identifies a buffer-pool bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferOptions {
    /// CPU writes are streamed, never read back. All dynamic resources use this.
    pub write_combined: bool,
}

impl Default for BufferOptions {
    fn default() -> Self {
        BufferOptions {
            write_combined: true,
        }
    }
}

struct BufferInner {
    id: u64,
    len: u64,
    label: String,
    options: BufferOptions,
    contents: UnsafeCell<Box<[u8]>>,
}

//Safety: access to `contents` is governed by the chunk/rotation protocols;
//the backend itself only touches it while executing a completed submission,
//when the protocol guarantees no CPU writer.
unsafe impl Send for BufferInner {}
unsafe impl Sync for BufferInner {}

/// A CPU-visible backing buffer. Cheap to clone; clones share storage.
#[derive(Clone)]
pub struct Buffer {
    inner: Arc<BufferInner>,
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.inner.id)
            .field("len", &self.inner.len)
            .field("label", &self.inner.label)
            .finish()
    }
}

impl Buffer {
    /// Stable identity for this allocation; survives cloning the handle.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The GPU-side addressing handle for indirect binding.
    pub fn gpu_address(&self) -> u64 {
        0x6000_0000_0000 + self.inner.id * 0x1_0000
    }

    pub fn len(&self) -> u64 {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    pub fn options(&self) -> BufferOptions {
        self.inner.options
    }

    /**
    The CPU-writable contents pointer.

    # Safety contract
    The pointer is valid for `len()` bytes for as long as any clone of this
    handle is alive. Writing through it while the GPU reads the same
    allocation is exactly the hazard the rotation protocol exists to avoid;
    callers go through [`write_bytes`](Self::write_bytes) or the dynamic
    resource types rather than juggling this directly.
    */
    pub fn contents(&self) -> NonNull<u8> {
        //safety: the box is never reallocated
        let ptr = unsafe { (*self.inner.contents.get()).as_mut_ptr() };
        NonNull::new(ptr).expect("buffer storage is non-null")
    }

    /**
    Copies `data` into the buffer at `offset`.

    # Safety
    The caller must guarantee no concurrent access to the written range: for
    dynamic resources that means the range is not being read by an in-flight
    submission (the discard/rotate protocol), and no other thread is writing.
    */
    pub unsafe fn write_bytes(&self, offset: usize, data: &[u8]) {
        assert!(
            offset + data.len() <= self.inner.len as usize,
            "write of {} bytes at {} exceeds buffer length {}",
            data.len(),
            offset,
            self.inner.len
        );
        unsafe {
            let dst = self.contents().as_ptr().add(offset);
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        }
    }

    /**
    Copies bytes out of the buffer at `offset`.

    # Safety
    Same concurrency contract as [`write_bytes`](Self::write_bytes).
    */
    pub unsafe fn read_bytes(&self, offset: usize, out: &mut [u8]) {
        assert!(offset + out.len() <= self.inner.len as usize);
        unsafe {
            let src = self.contents().as_ptr().add(offset);
            std::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), out.len());
        }
    }

    /// Builds a GPU view object interpreting this buffer as a 2D texture.
    pub fn new_texture_view(
        &self,
        device: &Device,
        desc: &TextureViewDesc,
        bytes_per_row: u32,
    ) -> TextureView {
        let _ = bytes_per_row;
        let id = device.inner.next_view_id.fetch_add(1, Ordering::Relaxed);
        TextureView {
            inner: Arc::new(TextureViewInner {
                id,
                buffer_id: self.inner.id,
                desc: desc.clone(),
            }),
        }
    }
}

#[derive(Debug)]
struct TextureViewInner {
    id: u64,
    buffer_id: u64,
    desc: TextureViewDesc,
}

/// A GPU view object over one backing buffer. Identity is per construction,
/// which is what the rotation view cache keys on.
#[derive(Clone, Debug)]
pub struct TextureView {
    inner: Arc<TextureViewInner>,
}

impl TextureView {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn buffer_id(&self) -> u64 {
        self.inner.buffer_id
    }

    /// The compact handle used for indirect (argument-data) binding.
    pub fn gpu_handle(&self) -> u64 {
        0x7000_0000_0000 + self.inner.id
    }

    pub fn desc(&self) -> &TextureViewDesc {
        &self.inner.desc
    }
}

/// What a command buffer would have encoded, for inspection by tests.
#[derive(Debug, Clone)]
pub enum Command {
    BeginRenderPass { label: String },
    EndRenderPass,
    BeginComputePass,
    EndComputePass,
    CopyBufferToBuffer {
        src: Buffer,
        src_offset: u64,
        dst: Buffer,
        dst_offset: u64,
        len: u64,
    },
    SetVertexBuffer { slot: u32, buffer_id: u64, offset: u64 },
    SetIndexBuffer { buffer_id: u64, offset: u64 },
    SetTexture { slot: u32, view_id: u64 },
    Draw { vertices: u32, instances: u32 },
    Dispatch { x: u32, y: u32, z: u32 },
    DebugMarker(String),
}

/// Render pass attachment description. The noop backend has nothing to attach.
#[derive(Debug, Clone, Default)]
pub struct RenderTargets {
    pub label: String,
}

/// A recording of GPU work, replayed (copies applied) when the submission
/// completes.
pub struct CommandBuffer {
    commands: Vec<Command>,
}

impl CommandBuffer {
    pub fn begin_render_pass(&mut self, targets: &RenderTargets) {
        self.commands.push(Command::BeginRenderPass {
            label: targets.label.clone(),
        });
    }

    pub fn end_render_pass(&mut self) {
        self.commands.push(Command::EndRenderPass);
    }

    pub fn begin_compute_pass(&mut self) {
        self.commands.push(Command::BeginComputePass);
    }

    pub fn end_compute_pass(&mut self) {
        self.commands.push(Command::EndComputePass);
    }

    pub fn copy_buffer_to_buffer(
        &mut self,
        src: &Buffer,
        src_offset: u64,
        dst: &Buffer,
        dst_offset: u64,
        len: u64,
    ) {
        self.commands.push(Command::CopyBufferToBuffer {
            src: src.clone(),
            src_offset,
            dst: dst.clone(),
            dst_offset,
            len,
        });
    }

    pub fn set_vertex_buffer(&mut self, slot: u32, buffer: &Buffer, offset: u64) {
        self.commands.push(Command::SetVertexBuffer {
            slot,
            buffer_id: buffer.id(),
            offset,
        });
    }

    pub fn set_index_buffer(&mut self, buffer: &Buffer, offset: u64) {
        self.commands.push(Command::SetIndexBuffer {
            buffer_id: buffer.id(),
            offset,
        });
    }

    pub fn set_texture(&mut self, slot: u32, view: &TextureView) {
        self.commands.push(Command::SetTexture {
            slot,
            view_id: view.id(),
        });
    }

    pub fn draw(&mut self, vertices: u32, instances: u32) {
        self.commands.push(Command::Draw {
            vertices,
            instances,
        });
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.commands.push(Command::Dispatch { x, y, z });
    }

    pub fn debug_marker(&mut self, marker: &str) {
        self.commands.push(Command::DebugMarker(marker.to_string()));
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }
}

struct Pending {
    commands: Vec<Command>,
    on_complete: CompletionHandler,
}

struct DeviceInner {
    paused: bool,
    next_buffer_id: AtomicU64,
    next_view_id: AtomicU64,
    pending: Mutex<VecDeque<Pending>>,
    submitted: AtomicU64,
    completed: Mutex<Vec<Vec<Command>>>,
}

/// The in-process device. Clones share one device.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("paused", &self.inner.paused)
            .field("submitted", &self.inner.submitted.load(Ordering::Relaxed))
            .finish()
    }
}

impl Device {
    /// A device whose submissions complete immediately.
    pub fn new() -> Self {
        Device {
            inner: Arc::new(DeviceInner {
                paused: false,
                next_buffer_id: AtomicU64::new(1),
                next_view_id: AtomicU64::new(1),
                pending: Mutex::new(VecDeque::new()),
                submitted: AtomicU64::new(0),
                completed: Mutex::new(Vec::new()),
            }),
        }
    }

    /// A device whose submissions stay outstanding until completed manually.
    pub fn paused() -> Self {
        Device {
            inner: Arc::new(DeviceInner {
                paused: true,
                next_buffer_id: AtomicU64::new(1),
                next_view_id: AtomicU64::new(1),
                pending: Mutex::new(VecDeque::new()),
                submitted: AtomicU64::new(0),
                completed: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn new_buffer(
        &self,
        len: u64,
        options: BufferOptions,
        label: &str,
    ) -> Result<Buffer, Error> {
        if len == 0 {
            return Err(Error::Allocation(format!(
                "zero-length buffer requested: {label}"
            )));
        }
        let id = self.inner.next_buffer_id.fetch_add(1, Ordering::Relaxed);
        Ok(Buffer {
            inner: Arc::new(BufferInner {
                id,
                len,
                label: label.to_string(),
                options,
                contents: UnsafeCell::new(vec![0u8; len as usize].into_boxed_slice()),
            }),
        })
    }

    pub fn new_command_buffer(&self) -> CommandBuffer {
        CommandBuffer {
            commands: Vec::new(),
        }
    }

    /**
    Submits a recorded command buffer. `on_complete` fires exactly once when
    the work finishes; on the noop device that is immediate unless paused.
    */
    pub fn submit(&self, cmd: CommandBuffer, on_complete: CompletionHandler) {
        self.inner.submitted.fetch_add(1, Ordering::Relaxed);
        if self.inner.paused {
            self.inner.pending.lock().unwrap().push_back(Pending {
                commands: cmd.commands,
                on_complete,
            });
        } else {
            self.execute(cmd.commands);
            on_complete(Ok(()));
        }
    }

    fn execute(&self, commands: Vec<Command>) {
        for command in &commands {
            if let Command::CopyBufferToBuffer {
                src,
                src_offset,
                dst,
                dst_offset,
                len,
            } = command
            {
                let mut scratch = vec![0u8; *len as usize];
                //safety: the submission protocol guarantees the GPU owns
                //these ranges until the completion handler runs
                unsafe {
                    src.read_bytes(*src_offset as usize, &mut scratch);
                    dst.write_bytes(*dst_offset as usize, &scratch);
                }
            }
        }
        self.inner.completed.lock().unwrap().push(commands);
    }

    /// Completes the oldest outstanding submission. Returns false if none.
    pub fn complete_next(&self) -> bool {
        let pending = self.inner.pending.lock().unwrap().pop_front();
        match pending {
            Some(p) => {
                self.execute(p.commands);
                (p.on_complete)(Ok(()));
                true
            }
            None => false,
        }
    }

    /// Completes the newest outstanding submission, out of order.
    pub fn complete_last(&self) -> bool {
        let pending = self.inner.pending.lock().unwrap().pop_back();
        match pending {
            Some(p) => {
                self.execute(p.commands);
                (p.on_complete)(Ok(()));
                true
            }
            None => false,
        }
    }

    /// Fails the oldest outstanding submission with a device error.
    pub fn fail_next(&self, message: &str) -> bool {
        let pending = self.inner.pending.lock().unwrap().pop_front();
        match pending {
            Some(p) => {
                (p.on_complete)(Err(Error::Device(message.to_string())));
                true
            }
            None => false,
        }
    }

    /// Completes everything outstanding, in submission order.
    pub fn drain(&self) {
        while self.complete_next() {}
    }

    pub fn submitted_count(&self) -> u64 {
        self.inner.submitted.load(Ordering::Relaxed)
    }

    pub fn outstanding_count(&self) -> usize {
        self.inner.pending.lock().unwrap().len()
    }

    /// Command lists of completed submissions, oldest first.
    pub fn completed_commands(&self) -> Vec<Vec<Command>> {
        self.inner.completed.lock().unwrap().clone()
    }
}

impl Default for Device {
    fn default() -> Self {
        Device::new()
    }
}
