//! Collaborator seam to the native graphics layer.
//!
//! Everything below the binding cache goes through [`NativeGraphics`]: the
//! execution context owns one implementation, and only the execution thread
//! ever calls into it. The trait deliberately exposes a very small surface;
//! shader handling, swapchain management and pixel-format plumbing live with
//! the implementation, not here.

use enumflags2::{BitFlags, bitflags};

use crate::context_state::{BindingPoint, ContextId};

/// Native framebuffer object handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, derive_more::Display)]
#[display("fbo#{_0}")]
pub struct NativeFramebuffer(pub u64);

impl NativeFramebuffer {
    /// The window-system-provided default framebuffer. Never produced by
    /// [`NativeGraphics::create_framebuffer`] and never stored in the cache.
    pub const DEFAULT: Self = Self(0);

    #[inline]
    pub fn is_default(self) -> bool {
        self == Self::DEFAULT
    }
}

/// Opaque native handle for a texture or render target.
///
/// Raw values may be recycled by the driver after destruction, so this type
/// is never used as a cache key; see [`crate::resource::ResourceId`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, derive_more::Display)]
#[display("native#{_0}")]
pub struct NativeResource(pub u64);

/// Capability bits reported by the native layer.
#[bitflags]
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceCap {
    /// More than one simultaneous color attachment.
    MultipleRenderTargets,
    /// Framebuffer-to-framebuffer blit.
    FramebufferBlit,
    /// Depth-only attachment point distinct from the combined one.
    SeparateDepthStencil,
}

/// Native call surface consumed by the binding cache and state tracker.
///
/// Implementations must be callable from the execution thread only, but the
/// object itself is shared across threads while commands are recorded, hence
/// the `Send + Sync` bound.
pub trait NativeGraphics: Send + Sync {
    fn caps(&self) -> BitFlags<DeviceCap>;

    fn create_framebuffer(&self) -> NativeFramebuffer;

    /// Attach the whole resource at `mip` to color slot `slot`.
    fn attach_color_target(
        &self,
        framebuffer: NativeFramebuffer,
        slot: u32,
        target: NativeResource,
        mip: u32,
    );

    /// Attach a single array slice / cube face. A distinct native call from
    /// [`Self::attach_color_target`]; the two must not be conflated.
    fn attach_color_target_layer(
        &self,
        framebuffer: NativeFramebuffer,
        slot: u32,
        target: NativeResource,
        mip: u32,
        layer: u32,
    );

    /// Attach to the depth-only attachment point.
    fn attach_depth_target(&self, framebuffer: NativeFramebuffer, target: NativeResource);

    /// Attach to the combined depth+stencil attachment point. Mutually
    /// exclusive with [`Self::attach_depth_target`] for a given framebuffer.
    fn attach_depth_stencil_target(&self, framebuffer: NativeFramebuffer, target: NativeResource);

    fn set_read_attachment(&self, framebuffer: NativeFramebuffer, slot: u32);

    fn set_draw_attachments(&self, framebuffer: NativeFramebuffer, slots: &[u32]);

    fn check_framebuffer_complete(&self, framebuffer: NativeFramebuffer) -> bool;

    fn destroy_framebuffer(&self, framebuffer: NativeFramebuffer);

    fn bind_framebuffer(&self, context: ContextId, framebuffer: NativeFramebuffer);

    /// Rebind a single target binding point. Issued by the state tracker
    /// only when its cached value differs.
    fn bind_target(&self, context: ContextId, point: BindingPoint, target: NativeResource);
}
