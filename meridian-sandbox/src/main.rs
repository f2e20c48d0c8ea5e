//! Headless sandbox: drives the binding cache and deferral bridge from a
//! submission thread against a tracing native backend, the way a renderer
//! would, and prints the resulting statistics.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use log::{debug, info};
use meridian_core::cli::HarnessArgs;
use meridian_rhi::{
    BindingPoint, BitFlags, ContextId, DeviceCap, DeviceDesc, LockMode, NativeFramebuffer,
    NativeGraphics, NativeResource, RenderDevice, TextureDesc, TextureFormat,
};

/// Native backend that only logs what it is asked to do. Framebuffer
/// handles are handed out from a counter, like a driver would.
struct TracingBackend {
    next_framebuffer: AtomicU64,
}

impl TracingBackend {
    fn new() -> Self {
        Self {
            next_framebuffer: AtomicU64::new(1),
        }
    }
}

impl NativeGraphics for TracingBackend {
    fn caps(&self) -> BitFlags<DeviceCap> {
        DeviceCap::MultipleRenderTargets | DeviceCap::FramebufferBlit
    }

    fn create_framebuffer(&self) -> NativeFramebuffer {
        let fb = NativeFramebuffer(self.next_framebuffer.fetch_add(1, Ordering::Relaxed));
        debug!("create {fb}");
        fb
    }

    fn attach_color_target(
        &self,
        framebuffer: NativeFramebuffer,
        slot: u32,
        target: NativeResource,
        mip: u32,
    ) {
        debug!("attach {target} mip {mip} to {framebuffer} slot {slot}");
    }

    fn attach_color_target_layer(
        &self,
        framebuffer: NativeFramebuffer,
        slot: u32,
        target: NativeResource,
        mip: u32,
        layer: u32,
    ) {
        debug!("attach {target} mip {mip} layer {layer} to {framebuffer} slot {slot}");
    }

    fn attach_depth_target(&self, framebuffer: NativeFramebuffer, target: NativeResource) {
        debug!("attach depth {target} to {framebuffer}");
    }

    fn attach_depth_stencil_target(&self, framebuffer: NativeFramebuffer, target: NativeResource) {
        debug!("attach depth-stencil {target} to {framebuffer}");
    }

    fn set_read_attachment(&self, framebuffer: NativeFramebuffer, slot: u32) {
        debug!("read attachment of {framebuffer} = slot {slot}");
    }

    fn set_draw_attachments(&self, framebuffer: NativeFramebuffer, slots: &[u32]) {
        debug!("draw attachments of {framebuffer} = {slots:?}");
    }

    fn check_framebuffer_complete(&self, _framebuffer: NativeFramebuffer) -> bool {
        true
    }

    fn destroy_framebuffer(&self, framebuffer: NativeFramebuffer) {
        debug!("destroy {framebuffer}");
    }

    fn bind_framebuffer(&self, context: ContextId, framebuffer: NativeFramebuffer) {
        debug!("bind {framebuffer} in {context}");
    }

    fn bind_target(&self, context: ContextId, point: BindingPoint, target: NativeResource) {
        debug!("bind {target} to {point:?} in {context}");
    }
}

fn main() -> Result<()> {
    let args = HarnessArgs::parse_args();
    meridian_core::log::initialize(args.log_level.into())?;

    let device = RenderDevice::new(Arc::new(TracingBackend::new()), &DeviceDesc::default())?;
    let context = device.create_context();

    let scene_color = device.create_texture(
        TextureDesc::new_color_attachment(1280, 720, TextureFormat::Rgba16Float)
            .with_name("scene_color"),
        NativeResource(100),
    );
    let scene_depth = device.create_texture(
        TextureDesc::new_depth_stencil_attachment(1280, 720).with_name("scene_depth"),
        NativeResource(101),
    );
    let bloom = device.create_texture(
        TextureDesc::new_color_attachment(640, 360, TextureFormat::Rgba16Float)
            .with_name("bloom")
            .with_mip_levels(4),
        NativeResource(102),
    );
    let upload = device.create_texture(
        TextureDesc::new_color_attachment(256, 256, TextureFormat::Rgba8).with_name("upload"),
        NativeResource(103),
    );
    let back_buffer = device.acquire_back_buffer(
        TextureDesc::new_color_attachment(1280, 720, TextureFormat::Bgra8)
            .with_name("back_buffer"),
    );

    let depth_view = scene_depth.depth_view();
    for frame in 0..120u32 {
        // Main pass: identical configuration every frame, one construction.
        let scene_fb = device.framebuffer(
            context,
            &[Some(scene_color.target_view(0))],
            Some(&depth_view),
        )?;
        device.bind_framebuffer(context, scene_fb);
        device.bind_target(context, BindingPoint::Color(0), scene_color.handle());

        // Bloom downsample chain walks the mips.
        for mip in 0..4 {
            let mip_fb =
                device.framebuffer(context, &[Some(bloom.target_view(mip))], None)?;
            device.bind_framebuffer(context, mip_fb);
        }

        // Streaming upload through the lock path.
        let mapping = device.lock(&upload, 0, LockMode::WriteOnly);
        unsafe {
            std::ptr::write_bytes(mapping.ptr, (frame & 0xFF) as u8, mapping.size as usize);
        }
        let staged = device.unlock(&upload, 0);
        device.enqueue(move |_native| {
            debug!("upload of {} staged bytes resolved", staged.size());
        });

        // Present resolves to the default framebuffer, never cached.
        let present = device.framebuffer(context, &[Some(back_buffer.target_view(0))], None)?;
        assert_eq!(present, NativeFramebuffer::DEFAULT);
    }

    let mid_run = device.stats();
    info!(
        "after 120 frames: {} cached framebuffers, {} hits / {} misses",
        mid_run.framebuffer_cache.entry_count,
        mid_run.framebuffer_cache.hits,
        mid_run.framebuffer_cache.misses
    );

    // Resizing the scene drops the old targets; every framebuffer that
    // referenced them goes with them.
    drop(scene_color);
    drop(scene_depth);
    device.flush()?;

    let after_resize = device.stats();
    info!(
        "after target teardown: {} cached framebuffers remain",
        after_resize.framebuffer_cache.entry_count
    );
    info!(
        "outstanding locks: {} ({} bytes)",
        after_resize.locks.outstanding_locks, after_resize.locks.outstanding_bytes
    );

    Ok(())
}
