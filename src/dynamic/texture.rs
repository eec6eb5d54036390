// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
A discard-rotated 2D texture with linear (buffer-backed) storage.

The texture owns the rotation; its shader resource views follow along. A
view cannot hold one GPU view object across rotations, because a view
object is bound to a single backing buffer, so each [`ShaderResourceView`]
keeps a small LRU cache keyed by backing-buffer address. Rotating back onto
a recently used buffer reuses the cached view object, which keeps the
steady-state (ping-ponging through the pool) allocation-free.
*/

use super::{BufferExchange, RotateError, ViewError};
use crate::bindable::{ArgumentData, BindingRef, DynamicBinding, ObserverRegistry};
use crate::formats::{PixelFormat, TextureViewDesc, format_caps};
use crate::imp;
use crate::pool::BufferPool;
use std::sync::{Arc, Mutex, Weak};

/// View objects cached per view across rotations.
const VIEW_CACHE_CAP: usize = 8;

/// Rows are padded to this boundary in the backing buffer.
const ROW_ALIGN: u32 = 256;

#[derive(Debug, Clone)]
pub struct TextureDescriptor {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub label: String,
}

#[derive(thiserror::Error, Debug)]
pub enum TextureError {
    #[error("dynamic textures cannot use compressed format {0:?}")]
    Compressed(PixelFormat),
    #[error("dynamic texture extent {width}x{height} is empty")]
    ZeroExtent { width: u32, height: u32 },
    #[error("dynamic texture extent {width}x{height} overflows the row layout")]
    ExtentTooLarge { width: u32, height: u32 },
    #[error("backing allocation failed: {0}")]
    Allocation(#[from] imp::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewDimension {
    D2,
    D2Array,
}

/// How a shader resource view interprets the texture. The default views the
/// whole (single) subresource in the texture's own format.
#[derive(Debug, Clone)]
pub struct ViewDescriptor {
    /// `None` means the texture's format; `Some` reinterprets, and must
    /// preserve texel size.
    pub format: Option<PixelFormat>,
    pub dimension: ViewDimension,
    pub mip_level: u32,
    pub array_slice: u32,
}

impl Default for ViewDescriptor {
    fn default() -> Self {
        ViewDescriptor {
            format: None,
            dimension: ViewDimension::D2,
            mip_level: 0,
            array_slice: 0,
        }
    }
}

struct TexState {
    current: imp::Buffer,
    generation: u64,
}

struct TexInner {
    device: imp::Device,
    desc: TextureDescriptor,
    bytes_per_row: u32,
    pool: BufferPool,
    registry: Arc<ObserverRegistry>,
    views: Mutex<Vec<Weak<ShaderResourceView>>>,
    state: Mutex<TexState>,
}

/**
One logical 2D texture over a rotating set of backing buffers.

Clones share the logical texture. As with [`DynamicBuffer`](super::DynamicBuffer),
rotation belongs to the frame producer and bindings resolve at encode time.
*/
#[derive(Clone)]
pub struct DynamicTexture2D {
    inner: Arc<TexInner>,
}

impl DynamicTexture2D {
    pub fn new(device: &imp::Device, desc: TextureDescriptor) -> Result<Self, TextureError> {
        let caps = format_caps(desc.format);
        if caps.compressed {
            return Err(TextureError::Compressed(desc.format));
        }
        if desc.width == 0 || desc.height == 0 {
            return Err(TextureError::ZeroExtent {
                width: desc.width,
                height: desc.height,
            });
        }
        let bytes_per_row = desc
            .width
            .checked_mul(caps.bytes_per_texel)
            .and_then(|packed| packed.checked_next_multiple_of(ROW_ALIGN))
            .ok_or(TextureError::ExtentTooLarge {
                width: desc.width,
                height: desc.height,
            })?;
        let len = bytes_per_row as u64 * desc.height as u64;
        let pool = BufferPool::new(device, len, imp::BufferOptions::default(), &desc.label);
        let current = pool.acquire()?;
        Ok(DynamicTexture2D {
            inner: Arc::new(TexInner {
                device: device.clone(),
                desc,
                bytes_per_row,
                pool,
                registry: ObserverRegistry::new(),
                views: Mutex::new(Vec::new()),
                state: Mutex::new(TexState {
                    current,
                    generation: 0,
                }),
            }),
        })
    }

    /// Creates the texture and fills the first backing allocation with
    /// tightly packed texel rows.
    pub fn with_initial_data(
        device: &imp::Device,
        desc: TextureDescriptor,
        data: &[u8],
    ) -> Result<Self, TextureError> {
        let texture = Self::new(device, desc)?;
        texture.write(data);
        Ok(texture)
    }

    pub fn width(&self) -> u32 {
        self.inner.desc.width
    }

    pub fn height(&self) -> u32 {
        self.inner.desc.height
    }

    pub fn format(&self) -> PixelFormat {
        self.inner.desc.format
    }

    /// Row stride of the linear backing layout.
    pub fn bytes_per_row(&self) -> u32 {
        self.inner.bytes_per_row
    }

    /// Handle to the current backing allocation. Stale after the next rotate.
    pub fn current(&self) -> imp::Buffer {
        self.inner.state.lock().unwrap().current.clone()
    }

    /// The CPU-writable pointer into the current backing allocation, laid
    /// out at [`bytes_per_row`](Self::bytes_per_row) stride. Stale after the
    /// next rotate.
    pub fn mapped_memory(&self) -> std::ptr::NonNull<u8> {
        self.inner.state.lock().unwrap().current.contents()
    }

    pub fn generation(&self) -> u64 {
        self.inner.state.lock().unwrap().generation
    }

    /**
    Copies tightly packed texel rows (`width * bytes_per_texel` each) into
    the current backing allocation, padding each row to the backing stride.

    Same discard contract as [`DynamicBuffer::write`](super::DynamicBuffer::write).
    */
    pub fn write(&self, data: &[u8]) {
        let caps = format_caps(self.inner.desc.format);
        let packed_row = (self.inner.desc.width * caps.bytes_per_texel) as usize;
        assert_eq!(
            data.len(),
            packed_row * self.inner.desc.height as usize,
            "data must be exactly the packed texel rows"
        );
        let current = self.current();
        let stride = self.inner.bytes_per_row as usize;
        for (row, chunk) in data.chunks_exact(packed_row).enumerate() {
            //safety: discard contract; see DynamicBuffer::write
            unsafe { current.write_bytes(row * stride, chunk) };
        }
    }

    /**
    Swaps in a fresh backing allocation, re-resolves every live shader
    resource view against it, and notifies bindings. The retired allocation
    goes to `exchange` and stays out of the pool until coherence passes
    every submission that could reference it.
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
        //views first, then observers, so a binding notified of the rotation
        //already resolves to the new view object
        let live: Vec<Arc<ShaderResourceView>> = {
            let mut views = self.inner.views.lock().unwrap();
            views.retain(|w| w.strong_count() > 0);
            views.iter().filter_map(Weak::upgrade).collect()
        };
        for view in live {
            view.rotate_to(&next);
        }
        self.inner.registry.notify_all(&next);
        Ok(())
    }

    /**
    Creates a shader resource view.

    Dynamic textures have exactly one subresource, so the descriptor must
    select mip 0, slice 0, and a 2D dimension; a format override must keep
    the texel size.
    */
    pub fn shader_resource_view(
        &self,
        desc: &ViewDescriptor,
    ) -> Result<Arc<ShaderResourceView>, ViewError> {
        if desc.dimension != ViewDimension::D2 {
            return Err(ViewError::UnsupportedDimension);
        }
        if desc.mip_level != 0 || desc.array_slice != 0 {
            return Err(ViewError::SubresourceOutOfRange {
                mip: desc.mip_level,
                slice: desc.array_slice,
            });
        }
        let format = desc.format.unwrap_or(self.inner.desc.format);
        let view_caps = format_caps(format);
        let tex_caps = format_caps(self.inner.desc.format);
        if view_caps.compressed || view_caps.bytes_per_texel != tex_caps.bytes_per_texel {
            return Err(ViewError::FormatMismatch);
        }
        let resolved = TextureViewDesc {
            format,
            width: self.inner.desc.width,
            height: self.inner.desc.height,
        };
        let current = self.current();
        let view = Arc::new(ShaderResourceView::new(
            self.inner.device.clone(),
            self.inner.registry.clone(),
            resolved,
            self.inner.bytes_per_row,
            &current,
        ));
        self.inner.views.lock().unwrap().push(Arc::downgrade(&view));
        Ok(view)
    }

    #[cfg(test)]
    fn live_view_count(&self) -> usize {
        let mut views = self.inner.views.lock().unwrap();
        views.retain(|w| w.strong_count() > 0);
        views.len()
    }
}

impl std::fmt::Debug for DynamicTexture2D {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicTexture2D")
            .field("width", &self.inner.desc.width)
            .field("height", &self.inner.desc.height)
            .field("format", &self.inner.desc.format)
            .field("generation", &self.generation())
            .finish()
    }
}

#[derive(Debug)]
struct ViewCache {
    //MRU at the front, keyed by backing-buffer address
    entries: Vec<(u64, imp::TextureView)>,
}

impl ViewCache {
    fn get_or_create(
        &mut self,
        device: &imp::Device,
        buffer: &imp::Buffer,
        desc: &TextureViewDesc,
        bytes_per_row: u32,
    ) -> imp::TextureView {
        let key = buffer.gpu_address();
        if let Some(pos) = self.entries.iter().position(|(k, _)| *k == key) {
            let entry = self.entries.remove(pos);
            self.entries.insert(0, entry);
            return self.entries[0].1.clone();
        }
        let view = buffer.new_texture_view(device, desc, bytes_per_row);
        self.entries.insert(0, (key, view.clone()));
        self.entries.truncate(VIEW_CACHE_CAP);
        view
    }
}

#[derive(Debug)]
struct ViewState {
    current: imp::TextureView,
    cache: ViewCache,
}

/**
A shader resource view over a [`DynamicTexture2D`].

Tracks its texture's rotations; [`current_view`](Self::current_view) and
bindings always refer to a view object over the current backing buffer.
*/
#[derive(Debug)]
pub struct ShaderResourceView {
    device: imp::Device,
    registry: Arc<ObserverRegistry>,
    desc: TextureViewDesc,
    bytes_per_row: u32,
    state: Mutex<ViewState>,
}

impl ShaderResourceView {
    fn new(
        device: imp::Device,
        registry: Arc<ObserverRegistry>,
        desc: TextureViewDesc,
        bytes_per_row: u32,
        current: &imp::Buffer,
    ) -> Self {
        let mut cache = ViewCache {
            entries: Vec::new(),
        };
        let view = cache.get_or_create(&device, current, &desc, bytes_per_row);
        ShaderResourceView {
            device,
            registry,
            desc,
            bytes_per_row,
            state: Mutex::new(ViewState {
                current: view,
                cache,
            }),
        }
    }

    fn rotate_to(&self, buffer: &imp::Buffer) {
        let mut state = self.state.lock().unwrap();
        state.current =
            state
                .cache
                .get_or_create(&self.device, buffer, &self.desc, self.bytes_per_row);
    }

    /// The view object over the current backing buffer.
    pub fn current_view(&self) -> imp::TextureView {
        self.state.lock().unwrap().current.clone()
    }

    pub fn format(&self) -> PixelFormat {
        self.desc.format
    }

    /**
    A binding handle resolving to the view object current at resolution
    time. Registered on the owning texture for rotation notifications until
    dropped.
    */
    pub fn bindable(self: &Arc<Self>) -> Arc<DynamicBinding> {
        self.bindable_observing(|_buffer| {})
    }

    /// Like [`bindable`](Self::bindable), with a callback invoked after
    /// every rotation with the replacement backing buffer.
    pub fn bindable_observing(
        self: &Arc<Self>,
        on_rotate: impl Fn(&imp::Buffer) + Send + Sync + 'static,
    ) -> Arc<DynamicBinding> {
        let resolve_view = self.clone();
        let argument_view = self.clone();
        self.registry.register(move |id, registry| {
            DynamicBinding::new(
                id,
                registry,
                Box::new(move |_coherent_seq| {
                    BindingRef::Texture(resolve_view.current_view())
                }),
                Box::new(move || ArgumentData {
                    handle: argument_view.current_view().gpu_handle(),
                }),
                Box::new(on_rotate),
            )
        })
    }

    #[cfg(test)]
    fn cached_view_count(&self) -> usize {
        self.state.lock().unwrap().cache.entries.len()
    }
}

#[cfg(all(test, not(feature = "backend_wgpu")))]
mod tests {
    use super::*;
    use crate::bindable::Bindable;
    use crate::dynamic::testing::HeldExchange;

    fn small_texture(device: &imp::Device) -> DynamicTexture2D {
        DynamicTexture2D::new(
            device,
            TextureDescriptor {
                width: 4,
                height: 2,
                format: PixelFormat::Rgba8Unorm,
                label: "test texture".to_string(),
            },
        )
        .unwrap()
    }

    #[test]
    fn creation_validates_format_and_extent() {
        let device = imp::Device::new();
        let err = DynamicTexture2D::new(
            &device,
            TextureDescriptor {
                width: 4,
                height: 4,
                format: PixelFormat::Bc1Unorm,
                label: "compressed".to_string(),
            },
        )
        .unwrap_err();
        assert!(matches!(err, TextureError::Compressed(PixelFormat::Bc1Unorm)));

        let err = DynamicTexture2D::new(
            &device,
            TextureDescriptor {
                width: 0,
                height: 4,
                format: PixelFormat::Rgba8Unorm,
                label: "empty".to_string(),
            },
        )
        .unwrap_err();
        assert!(matches!(err, TextureError::ZeroExtent { .. }));

        //a width whose row would wrap u32 must be rejected, not truncated
        let err = DynamicTexture2D::new(
            &device,
            TextureDescriptor {
                width: u32::MAX,
                height: 1,
                format: PixelFormat::Rgba8Unorm,
                label: "huge".to_string(),
            },
        )
        .unwrap_err();
        assert!(matches!(err, TextureError::ExtentTooLarge { .. }));
    }

    #[test]
    fn rows_are_written_at_the_padded_stride() {
        let device = imp::Device::new();
        let texture = small_texture(&device);
        assert_eq!(texture.bytes_per_row(), 256);
        let mut data = vec![0u8; 4 * 4 * 2];
        data[0] = 0x11; //row 0, first byte
        data[16] = 0x22; //row 1, first byte
        texture.write(&data);

        let current = texture.current();
        let mut byte = [0u8; 1];
        unsafe { current.read_bytes(0, &mut byte) };
        assert_eq!(byte[0], 0x11);
        unsafe { current.read_bytes(256, &mut byte) };
        assert_eq!(byte[0], 0x22);
    }

    #[test]
    fn view_descriptors_are_validated() {
        let device = imp::Device::new();
        let texture = small_texture(&device);

        let err = texture
            .shader_resource_view(&ViewDescriptor {
                dimension: ViewDimension::D2Array,
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err, ViewError::UnsupportedDimension);

        let err = texture
            .shader_resource_view(&ViewDescriptor {
                mip_level: 1,
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, ViewError::SubresourceOutOfRange { mip: 1, .. }));

        //Rgba16Float is 8 bytes per texel; Rgba8Unorm is 4
        let err = texture
            .shader_resource_view(&ViewDescriptor {
                format: Some(PixelFormat::Rgba16Float),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err, ViewError::FormatMismatch);

        //same-size reinterpretation is allowed
        let view = texture
            .shader_resource_view(&ViewDescriptor {
                format: Some(PixelFormat::R32Float),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(view.format(), PixelFormat::R32Float);
    }

    #[test]
    fn views_follow_rotation() {
        let device = imp::Device::new();
        let texture = small_texture(&device);
        let view = texture.shader_resource_view(&ViewDescriptor::default()).unwrap();
        let before = view.current_view();
        assert_eq!(before.buffer_id(), texture.current().id());

        let mut exchange = HeldExchange::new();
        texture.rotate(&mut exchange).unwrap();
        let after = view.current_view();
        assert_ne!(after.id(), before.id());
        assert_eq!(after.buffer_id(), texture.current().id());
    }

    #[test]
    fn rotating_back_reuses_the_cached_view() {
        let device = imp::Device::new();
        let texture = small_texture(&device);
        let view = texture.shader_resource_view(&ViewDescriptor::default()).unwrap();
        let original_buffer = texture.current().id();
        let original_view = view.current_view().id();

        let mut exchange = HeldExchange::new();
        texture.rotate(&mut exchange).unwrap();
        assert_ne!(view.current_view().id(), original_view);

        //release the retired buffer; the next rotate ping-pongs back to it
        exchange.parked.clear();
        texture.rotate(&mut exchange).unwrap();
        assert_eq!(texture.current().id(), original_buffer);
        assert_eq!(view.current_view().id(), original_view);
        assert_eq!(view.cached_view_count(), 2);
    }

    #[test]
    fn the_view_cache_is_bounded() {
        let device = imp::Device::new();
        let texture = small_texture(&device);
        let view = texture.shader_resource_view(&ViewDescriptor::default()).unwrap();
        let original_view = view.current_view().id();

        //rotate through more fresh buffers than the cache holds
        let mut exchange = HeldExchange::new();
        for _ in 0..VIEW_CACHE_CAP + 1 {
            texture.rotate(&mut exchange).unwrap();
        }
        assert_eq!(view.cached_view_count(), VIEW_CACHE_CAP);

        //the original buffer's entry was evicted; coming back builds a new view
        exchange.parked.clear();
        texture.rotate(&mut exchange).unwrap();
        assert_ne!(view.current_view().id(), original_view);
        assert_eq!(view.cached_view_count(), VIEW_CACHE_CAP);
    }

    #[test]
    fn dropped_views_stop_following_rotation() {
        let device = imp::Device::new();
        let texture = small_texture(&device);
        let keep = texture.shader_resource_view(&ViewDescriptor::default()).unwrap();
        let dropped = texture.shader_resource_view(&ViewDescriptor::default()).unwrap();
        drop(dropped);

        let mut exchange = HeldExchange::new();
        texture.rotate(&mut exchange).unwrap();
        assert_eq!(texture.live_view_count(), 1);
        assert_eq!(keep.current_view().buffer_id(), texture.current().id());
    }

    #[test]
    fn srv_bindable_resolves_the_current_view() {
        let device = imp::Device::new();
        let texture = small_texture(&device);
        let view = texture.shader_resource_view(&ViewDescriptor::default()).unwrap();
        let binding = view.bindable();
        let first = binding.binding(0).texture().unwrap().id();
        assert_eq!(first, view.current_view().id());

        let mut exchange = HeldExchange::new();
        texture.rotate(&mut exchange).unwrap();
        let second = binding.binding(0).texture().unwrap().id();
        assert_eq!(second, view.current_view().id());
        assert_ne!(first, second);
    }
}
