//! Meridian RHI - GPU resource-binding cache and cross-thread command
//! deferral layer.
//!
//! This crate sits between logical rendering code and a native graphics
//! context owned by a single thread: it caches native framebuffer objects
//! per target configuration, elides redundant binds per context, tracks
//! outstanding CPU-visible mappings, and routes mutating operations to the
//! execution thread through an ordered deferred-command queue.

pub mod context_state;
pub mod device;
pub mod framebuffer_cache;
pub mod lock_tracker;
pub mod native;
pub mod resource;
pub mod texture;
mod command_bridge;

/// Upper bound on simultaneous color attachments considered for a
/// framebuffer configuration; the native capability query may lower it.
pub const MAX_SIMULTANEOUS_RENDER_TARGETS: usize = 8;

pub use enumflags2::BitFlags;

pub use command_bridge::CommandFault;
pub use context_state::{BindingPoint, ContextId};
pub use device::{
    DeviceDesc, DeviceDescBuilder, DeviceDescBuilderError, DeviceStats, ExecutionState,
    RenderDevice,
};
pub use framebuffer_cache::{FramebufferCache, FramebufferCacheStats, FramebufferKey};
pub use lock_tracker::{
    LockMode, LockTracker, LockTrackerStats, MappedSubresource, PendingLock,
};
pub use native::{DeviceCap, NativeFramebuffer, NativeGraphics, NativeResource};
pub use resource::{ResourceHandle, ResourceId};
pub use texture::{
    DepthAttachment, DepthStencilView, RenderTargetView, TargetLayer, Texture, TextureDesc,
    TextureFormat,
};
