// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
wgpu backend.

The host hands us a live `wgpu::Device`/`wgpu::Queue` pair. Backing buffers
carry CPU shadow storage; the rotation protocol guarantees the shadow of an
allocation the GPU can see is never written, so flushing dirty shadows with
`write_buffer`/`write_texture` right before a submit (the staged copies run
at the start of that submit) is race-free.

Submission completion is observed with `on_submitted_work_done`, driven by
a dedicated poll thread; the queue's completion callbacks fire on it.

Resource binding above the vertex/index stage goes through bind groups
built by the consumer, which knows the pipeline layouts this seam does not;
`set_texture` only records a marker here.
*/

use crate::formats::{PixelFormat, TextureViewDesc};
use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak, mpsc};

#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    #[error("device failure: {0}")]
    Device(String),
    #[error("buffer allocation failed: {0}")]
    Allocation(String),
}

/// Invoked exactly once when the GPU finishes a submission.
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

struct BufferShared {
    id: u64,
    len: u64,
    options: BufferOptions,
    buffer: wgpu::Buffer,
    shadow: UnsafeCell<Box<[u8]>>,
    dirty: AtomicBool,
}

//Safety: the shadow is written only by the producer under the rotation
//protocol and read only by the flush path, which runs strictly between a
//producer handoff (commit) and the submit that consumes it.
unsafe impl Send for BufferShared {}
unsafe impl Sync for BufferShared {}

/// A GPU buffer plus its CPU shadow. Cheap to clone; clones share storage.
#[derive(Clone)]
pub struct Buffer {
    inner: Arc<BufferShared>,
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.inner.id)
            .field("len", &self.inner.len)
            .finish()
    }
}

impl Buffer {
    /// Stable identity for this allocation; survives cloning the handle.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The GPU-side addressing handle for indirect binding. wgpu exposes no
    /// virtual addresses, so this is synthesized, but it is stable per
    /// allocation, which is all the view cache and argument data key on.
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

    /// The underlying wgpu buffer, for consumers building bind groups.
    pub fn wgpu_buffer(&self) -> &wgpu::Buffer {
        &self.inner.buffer
    }

    /**
    The CPU-writable shadow pointer. Marks the buffer dirty; the shadow is
    uploaded before the next submit.

    # Safety contract
    Same as the in-process backend: writing a range the GPU was promised is
    the hazard the rotation protocol exists to avoid.
    */
    pub fn contents(&self) -> NonNull<u8> {
        self.inner.dirty.store(true, Ordering::Release);
        //safety: the box is never reallocated
        let ptr = unsafe { (*self.inner.shadow.get()).as_mut_ptr() };
        NonNull::new(ptr).expect("buffer shadow is non-null")
    }

    /**
    Copies `data` into the shadow at `offset` and marks it for upload.

    # Safety
    The caller must guarantee no concurrent access to the written range; for
    dynamic resources that is the discard/rotate protocol.
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
    Copies bytes out of the shadow at `offset`. Reflects CPU writes, not GPU
    ones; write-combined resources are never read back.

    # Safety
    Same concurrency contract as [`write_bytes`](Self::write_bytes).
    */
    pub unsafe fn read_bytes(&self, offset: usize, out: &mut [u8]) {
        assert!(offset + out.len() <= self.inner.len as usize);
        unsafe {
            let src = (*self.inner.shadow.get()).as_ptr().add(offset);
            std::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), out.len());
        }
    }

    /// Builds a GPU view object interpreting this buffer as a 2D texture.
    /// Backed by a dedicated texture kept current from the shadow.
    pub fn new_texture_view(
        &self,
        device: &Device,
        desc: &TextureViewDesc,
        bytes_per_row: u32,
    ) -> TextureView {
        let id = device.shared.next_view_id.fetch_add(1, Ordering::Relaxed);
        let texture = device.shared.device.create_texture(&wgpu::TextureDescriptor {
            label: None,
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: map_format(desc.format),
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let shared = Arc::new(ViewShared {
            id,
            buffer: Arc::downgrade(&self.inner),
            texture,
            view,
            desc: desc.clone(),
            bytes_per_row,
        });
        //seed the texture from the current shadow contents
        device.upload_view(&shared);
        device.shared.views.lock().unwrap().push(Arc::downgrade(&shared));
        TextureView { inner: shared }
    }
}

fn map_format(format: PixelFormat) -> wgpu::TextureFormat {
    use PixelFormat::*;
    match format {
        R8Unorm => wgpu::TextureFormat::R8Unorm,
        Rg8Unorm => wgpu::TextureFormat::Rg8Unorm,
        Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        Bgra8Unorm => wgpu::TextureFormat::Bgra8Unorm,
        R32Float => wgpu::TextureFormat::R32Float,
        Rgba16Float => wgpu::TextureFormat::Rgba16Float,
        Rgba32Float => wgpu::TextureFormat::Rgba32Float,
        Bc1Unorm => wgpu::TextureFormat::Bc1RgbaUnorm,
        Bc3Unorm => wgpu::TextureFormat::Bc3RgbaUnorm,
    }
}

struct ViewShared {
    id: u64,
    buffer: Weak<BufferShared>,
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    desc: TextureViewDesc,
    bytes_per_row: u32,
}

/// A GPU view object over one backing buffer. Identity is per construction,
/// which is what the rotation view cache keys on.
#[derive(Clone)]
pub struct TextureView {
    inner: Arc<ViewShared>,
}

impl std::fmt::Debug for TextureView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextureView")
            .field("id", &self.inner.id)
            .finish()
    }
}

impl TextureView {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn buffer_id(&self) -> u64 {
        self.inner.buffer.upgrade().map(|b| b.id).unwrap_or(0)
    }

    /// The compact handle used for indirect (argument-data) binding.
    pub fn gpu_handle(&self) -> u64 {
        0x7000_0000_0000 + self.inner.id
    }

    pub fn desc(&self) -> &TextureViewDesc {
        &self.inner.desc
    }

    /// The underlying wgpu view, for consumers building bind groups.
    pub fn wgpu_view(&self) -> &wgpu::TextureView {
        &self.inner.view
    }
}

/// Render pass attachment description.
#[derive(Default)]
pub struct RenderTargets {
    pub label: String,
    pub color: Option<wgpu::TextureView>,
}

enum Command {
    BeginRenderPass { targets: RenderTargets },
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
    SetVertexBuffer { slot: u32, buffer: Buffer, offset: u64 },
    SetIndexBuffer { buffer: Buffer, offset: u64 },
    SetTexture { slot: u32, view: TextureView },
    SetRenderPipeline(wgpu::RenderPipeline),
    SetComputePipeline(wgpu::ComputePipeline),
    Draw { vertices: u32, instances: u32 },
    Dispatch { x: u32, y: u32, z: u32 },
    DebugMarker(String),
}

/**
A recording of GPU work, replayed into a `wgpu::CommandEncoder` at submit.

Recording is deferred because wgpu passes borrow their encoder; replaying
at submit keeps this type free of lifetimes, matching the in-process
backend.
*/
pub struct CommandBuffer {
    commands: Vec<Command>,
}

impl CommandBuffer {
    pub fn begin_render_pass(&mut self, targets: &RenderTargets) {
        self.commands.push(Command::BeginRenderPass {
            targets: RenderTargets {
                label: targets.label.clone(),
                color: targets.color.clone(),
            },
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
            buffer: buffer.clone(),
            offset,
        });
    }

    pub fn set_index_buffer(&mut self, buffer: &Buffer, offset: u64) {
        self.commands.push(Command::SetIndexBuffer {
            buffer: buffer.clone(),
            offset,
        });
    }

    pub fn set_texture(&mut self, slot: u32, view: &TextureView) {
        self.commands.push(Command::SetTexture {
            slot,
            view: view.clone(),
        });
    }

    pub fn set_render_pipeline(&mut self, pipeline: &wgpu::RenderPipeline) {
        self.commands.push(Command::SetRenderPipeline(pipeline.clone()));
    }

    pub fn set_compute_pipeline(&mut self, pipeline: &wgpu::ComputePipeline) {
        self.commands.push(Command::SetComputePipeline(pipeline.clone()));
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
}

struct DeviceShared {
    device: wgpu::Device,
    queue: wgpu::Queue,
    next_buffer_id: AtomicU64,
    next_view_id: AtomicU64,
    buffers: Mutex<Vec<Weak<BufferShared>>>,
    views: Mutex<Vec<Weak<ViewShared>>>,
    //each send wakes the poll thread for one PollType::Wait round
    poll_tx: mpsc::Sender<()>,
}

/// Wraps the host's wgpu device and queue. Clones share one device.
#[derive(Clone)]
pub struct Device {
    shared: Arc<DeviceShared>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device").finish_non_exhaustive()
    }
}

impl Device {
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        let (poll_tx, poll_rx) = mpsc::channel::<()>();
        let poll_device = device.clone();
        std::thread::Builder::new()
            .name("causeway poll".to_string())
            .spawn(move || {
                while poll_rx.recv().is_ok() {
                    if let Err(e) = poll_device.poll(wgpu::PollType::Wait) {
                        logwise::error_sync!(
                            "device poll failed: {error}",
                            error = logwise::privacy::LogIt(&e)
                        );
                        return;
                    }
                }
            })
            .expect("spawn poll thread");
        Device {
            shared: Arc::new(DeviceShared {
                device,
                queue,
                next_buffer_id: AtomicU64::new(1),
                next_view_id: AtomicU64::new(1),
                buffers: Mutex::new(Vec::new()),
                views: Mutex::new(Vec::new()),
                poll_tx,
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
        let id = self.shared.next_buffer_id.fetch_add(1, Ordering::Relaxed);
        let buffer = self.shared.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: len,
            usage: wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::VERTEX
                | wgpu::BufferUsages::INDEX
                | wgpu::BufferUsages::UNIFORM
                | wgpu::BufferUsages::STORAGE,
            mapped_at_creation: false,
        });
        let shared = Arc::new(BufferShared {
            id,
            len,
            options,
            buffer,
            shadow: UnsafeCell::new(vec![0u8; len as usize].into_boxed_slice()),
            dirty: AtomicBool::new(false),
        });
        self.shared.buffers.lock().unwrap().push(Arc::downgrade(&shared));
        Ok(Buffer { inner: shared })
    }

    pub fn new_command_buffer(&self) -> CommandBuffer {
        CommandBuffer {
            commands: Vec::new(),
        }
    }

    /**
    Submits a recorded command buffer. `on_complete` fires exactly once,
    on the poll thread, when the GPU finishes the work.
    */
    pub fn submit(&self, cmd: CommandBuffer, on_complete: CompletionHandler) {
        self.flush_dirty();
        let mut encoder = self
            .shared
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
        self.replay(&cmd.commands, &mut encoder);
        self.shared
            .queue
            .on_submitted_work_done(move || on_complete(Ok(())));
        self.shared.queue.submit(Some(encoder.finish()));
        let _ = self.shared.poll_tx.send(());
    }

    /// Blocks until every prior submission has completed on the GPU.
    pub fn drain(&self) {
        let (tx, rx) = mpsc::channel();
        self.shared.queue.on_submitted_work_done(move || {
            let _ = tx.send(());
        });
        self.shared.queue.submit(std::iter::empty());
        let _ = self.shared.poll_tx.send(());
        let _ = rx.recv();
    }

    //stage dirty shadows; the staged copies execute at the start of the next
    //submit, which is ordered before every command that could read them
    fn flush_dirty(&self) {
        let mut flushed = Vec::new();
        {
            let mut buffers = self.shared.buffers.lock().unwrap();
            buffers.retain(|w| w.strong_count() > 0);
            for buffer in buffers.iter().filter_map(Weak::upgrade) {
                if buffer.dirty.swap(false, Ordering::AcqRel) {
                    //safety: flush runs between producer handoff and submit;
                    //nobody writes the shadow in that window
                    let shadow = unsafe { &*buffer.shadow.get() };
                    self.shared.queue.write_buffer(&buffer.buffer, 0, shadow);
                    flushed.push(buffer.id);
                }
            }
        }
        if flushed.is_empty() {
            return;
        }
        let mut views = self.shared.views.lock().unwrap();
        views.retain(|w| w.strong_count() > 0);
        for view in views.iter().filter_map(Weak::upgrade) {
            let Some(buffer) = view.buffer.upgrade() else {
                continue;
            };
            if flushed.contains(&buffer.id) {
                self.upload_view(&view);
            }
        }
    }

    fn upload_view(&self, view: &ViewShared) {
        let Some(buffer) = view.buffer.upgrade() else {
            return;
        };
        //safety: same window as flush_dirty
        let shadow = unsafe { &*buffer.shadow.get() };
        self.shared.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &view.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            shadow,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(view.bytes_per_row),
                rows_per_image: None,
            },
            wgpu::Extent3d {
                width: view.desc.width,
                height: view.desc.height,
                depth_or_array_layers: 1,
            },
        );
    }

    fn replay(&self, commands: &[Command], encoder: &mut wgpu::CommandEncoder) {
        let mut render: Option<wgpu::RenderPass<'static>> = None;
        let mut compute: Option<wgpu::ComputePass<'static>> = None;
        for command in commands {
            match command {
                Command::BeginRenderPass { targets } => {
                    let color = targets.color.as_ref().map(|view| {
                        Some(wgpu::RenderPassColorAttachment {
                            view,
                            depth_slice: None,
                            resolve_target: None,
                            ops: Default::default(),
                        })
                    });
                    let attachments: Vec<_> = color.into_iter().collect();
                    render = Some(
                        encoder
                            .begin_render_pass(&wgpu::RenderPassDescriptor {
                                label: Some(&targets.label),
                                color_attachments: &attachments,
                                depth_stencil_attachment: None,
                                timestamp_writes: None,
                                occlusion_query_set: None,
                            })
                            .forget_lifetime(),
                    );
                }
                Command::EndRenderPass => render = None,
                Command::BeginComputePass => {
                    compute = Some(
                        encoder
                            .begin_compute_pass(&wgpu::ComputePassDescriptor {
                                label: None,
                                timestamp_writes: None,
                            })
                            .forget_lifetime(),
                    );
                }
                Command::EndComputePass => compute = None,
                Command::CopyBufferToBuffer {
                    src,
                    src_offset,
                    dst,
                    dst_offset,
                    len,
                } => {
                    encoder.copy_buffer_to_buffer(
                        &src.inner.buffer,
                        *src_offset,
                        &dst.inner.buffer,
                        *dst_offset,
                        *len,
                    );
                }
                Command::SetVertexBuffer {
                    slot,
                    buffer,
                    offset,
                } => {
                    if let Some(pass) = render.as_mut() {
                        pass.set_vertex_buffer(*slot, buffer.inner.buffer.slice(*offset..));
                    }
                }
                Command::SetIndexBuffer { buffer, offset } => {
                    if let Some(pass) = render.as_mut() {
                        pass.set_index_buffer(
                            buffer.inner.buffer.slice(*offset..),
                            wgpu::IndexFormat::Uint16,
                        );
                    }
                }
                Command::SetTexture { slot, view } => {
                    //texture binding flows through consumer bind groups; keep
                    //a marker so captures still show the intent
                    if let Some(pass) = render.as_mut() {
                        pass.insert_debug_marker(&format!(
                            "set texture view {} at slot {slot}",
                            view.id()
                        ));
                    }
                }
                Command::SetRenderPipeline(pipeline) => {
                    if let Some(pass) = render.as_mut() {
                        pass.set_pipeline(pipeline);
                    }
                }
                Command::SetComputePipeline(pipeline) => {
                    if let Some(pass) = compute.as_mut() {
                        pass.set_pipeline(pipeline);
                    }
                }
                Command::Draw {
                    vertices,
                    instances,
                } => {
                    if let Some(pass) = render.as_mut() {
                        pass.draw(0..*vertices, 0..*instances);
                    }
                }
                Command::Dispatch { x, y, z } => {
                    if let Some(pass) = compute.as_mut() {
                        pass.dispatch_workgroups(*x, *y, *z);
                    }
                }
                Command::DebugMarker(marker) => {
                    if let Some(pass) = render.as_mut() {
                        pass.insert_debug_marker(marker);
                    } else if let Some(pass) = compute.as_mut() {
                        pass.insert_debug_marker(marker);
                    } else {
                        encoder.insert_debug_marker(marker);
                    }
                }
            }
        }
    }
}
