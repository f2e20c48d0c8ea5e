//! Texture wrappers - render-target views and lock sizing.

use std::sync::Arc;

use crate::device::DeviceShared;
use crate::native::NativeResource;
use crate::resource::ResourceHandle;

/// Pixel format of a texture, reduced to what the binding and lock paths
/// need to know: attachment point selection and per-texel size.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8,
    Bgra8,
    Rgba16Float,
    R32Float,
    Depth32Float,
    Depth24Stencil8,
}

impl TextureFormat {
    #[inline]
    pub fn bytes_per_texel(self) -> u32 {
        match self {
            TextureFormat::Rgba8 | TextureFormat::Bgra8 => 4,
            TextureFormat::Rgba16Float => 8,
            TextureFormat::R32Float => 4,
            TextureFormat::Depth32Float => 4,
            TextureFormat::Depth24Stencil8 => 4,
        }
    }

    #[inline]
    pub fn has_depth(self) -> bool {
        matches!(self, TextureFormat::Depth32Float | TextureFormat::Depth24Stencil8)
    }

    #[inline]
    pub fn has_stencil(self) -> bool {
        matches!(self, TextureFormat::Depth24Stencil8)
    }
}

/// Texture descriptor.
#[derive(Debug, Clone)]
pub struct TextureDesc {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    /// Number of mip levels.
    pub mip_levels: u32,
    /// Number of array layers (6 for a cubemap).
    pub array_layers: u32,
}

impl Default for TextureDesc {
    fn default() -> Self {
        Self {
            name: String::new(),
            width: 1,
            height: 1,
            format: TextureFormat::Rgba8,
            mip_levels: 1,
            array_layers: 1,
        }
    }
}

impl TextureDesc {
    /// Create a color attachment descriptor.
    pub fn new_color_attachment(width: u32, height: u32, format: TextureFormat) -> Self {
        Self {
            name: String::new(),
            width,
            height,
            format,
            ..Default::default()
        }
    }

    /// Create a depth attachment descriptor.
    pub fn new_depth_attachment(width: u32, height: u32) -> Self {
        Self {
            name: String::new(),
            width,
            height,
            format: TextureFormat::Depth32Float,
            ..Default::default()
        }
    }

    /// Create a depth-stencil attachment descriptor.
    pub fn new_depth_stencil_attachment(width: u32, height: u32) -> Self {
        Self {
            name: String::new(),
            width,
            height,
            format: TextureFormat::Depth24Stencil8,
            ..Default::default()
        }
    }

    /// Create a cube map descriptor.
    pub fn new_cube(size: u32, format: TextureFormat) -> Self {
        Self {
            name: String::new(),
            width: size,
            height: size,
            format,
            array_layers: 6,
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the number of mip levels.
    pub fn with_mip_levels(mut self, levels: u32) -> Self {
        self.mip_levels = levels;
        self
    }

    /// Set the number of array layers.
    pub fn with_array_layers(mut self, layers: u32) -> Self {
        self.array_layers = layers;
        self
    }
}

/// Slice selection for a render-target view.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TargetLayer {
    /// Whole resource; for cubemaps the native layer resolves this to face 0.
    All,
    /// A specific array slice / cube face.
    Layer(u32),
}

/// Depth attachment point selection. Derived from the texture format;
/// the two points are mutually exclusive for a given framebuffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DepthAttachment {
    DepthOnly,
    Combined,
}

/// A color render-target view: resource + mip + slice selection.
#[derive(Clone, Debug)]
pub struct RenderTargetView {
    pub(crate) handle: ResourceHandle,
    pub(crate) mip: u32,
    pub(crate) layer: TargetLayer,
    pub(crate) back_buffer: bool,
}

impl RenderTargetView {
    #[inline]
    pub fn handle(&self) -> &ResourceHandle {
        &self.handle
    }

    #[inline]
    pub fn mip(&self) -> u32 {
        self.mip
    }

    #[inline]
    pub fn layer(&self) -> TargetLayer {
        self.layer
    }

    #[inline]
    pub fn is_back_buffer(&self) -> bool {
        self.back_buffer
    }
}

/// A depth/stencil view. Carries the attachment point picked from the
/// texture format at view-creation time.
#[derive(Clone, Debug)]
pub struct DepthStencilView {
    pub(crate) handle: ResourceHandle,
    pub(crate) attachment: DepthAttachment,
}

impl DepthStencilView {
    #[inline]
    pub fn handle(&self) -> &ResourceHandle {
        &self.handle
    }

    #[inline]
    pub fn attachment(&self) -> DepthAttachment {
        self.attachment
    }
}

/// A GPU texture registered with the device.
///
/// The wrapper owns the logical identity; dropping it schedules the
/// invalidation sweep on the execution thread before the native object can
/// be released by the collaborator that created it.
pub struct Texture {
    desc: TextureDesc,
    handle: ResourceHandle,
    back_buffer: bool,
    device: Arc<DeviceShared>,
}

impl Texture {
    pub(crate) fn new(
        device: Arc<DeviceShared>,
        desc: TextureDesc,
        native: NativeResource,
        back_buffer: bool,
    ) -> Self {
        Self {
            desc,
            handle: ResourceHandle::new(native),
            back_buffer,
            device,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.desc.name
    }

    #[inline]
    pub fn desc(&self) -> &TextureDesc {
        &self.desc
    }

    #[inline]
    pub fn handle(&self) -> &ResourceHandle {
        &self.handle
    }

    #[inline]
    pub fn is_back_buffer(&self) -> bool {
        self.back_buffer
    }

    /// Dimensions of `mip`, clamped to 1x1.
    pub fn mip_dimensions(&self, mip: u32) -> (u32, u32) {
        ((self.desc.width >> mip).max(1), (self.desc.height >> mip).max(1))
    }

    /// Row stride and total byte size of a CPU-visible mapping of `mip`.
    pub fn lock_size(&self, mip: u32) -> (u32, u32) {
        let (width, height) = self.mip_dimensions(mip);
        let stride = width * self.desc.format.bytes_per_texel();
        (stride, stride * height)
    }

    /// View of a whole mip level as a color target.
    pub fn target_view(&self, mip: u32) -> RenderTargetView {
        debug_assert!(mip < self.desc.mip_levels);
        RenderTargetView {
            handle: self.handle.clone(),
            mip,
            layer: TargetLayer::All,
            back_buffer: self.back_buffer,
        }
    }

    /// View of a single array slice / cube face as a color target.
    pub fn layer_view(&self, mip: u32, layer: u32) -> RenderTargetView {
        debug_assert!(mip < self.desc.mip_levels);
        debug_assert!(layer < self.desc.array_layers);
        RenderTargetView {
            handle: self.handle.clone(),
            mip,
            layer: TargetLayer::Layer(layer),
            back_buffer: self.back_buffer,
        }
    }

    /// Depth/stencil view. The attachment point follows the format: a
    /// stencil-carrying format uses the combined point, plain depth the
    /// depth-only point.
    pub fn depth_view(&self) -> DepthStencilView {
        assert!(
            self.desc.format.has_depth(),
            "depth view requested on color format {:?}",
            self.desc.format
        );
        let attachment = if self.desc.format.has_stencil() {
            DepthAttachment::Combined
        } else {
            DepthAttachment::DepthOnly
        };
        DepthStencilView {
            handle: self.handle.clone(),
            attachment,
        }
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        // Routed through the deferral queue so the sweep lands after any
        // bind still in flight that references this resource.
        self.device.notify_resource_destroyed(self.handle.id());
    }
}
