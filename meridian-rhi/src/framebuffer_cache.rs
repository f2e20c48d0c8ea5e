//! Framebuffer cache - reuses native framebuffer objects across identical
//! render-target configurations.
//!
//! Framebuffer objects are expensive to build and validate, and a renderer
//! re-requests the same small set of configurations every frame. The cache
//! keys on the exact combination of bound targets plus the owning context
//! (native framebuffers are not shareable across contexts), and keeps a
//! per-resource index so destruction only touches the entries that actually
//! reference the dying resource.

use meridian_core::collections::SmallVec;
use meridian_core::collections::hashmap::HashMap;
use meridian_core::log;

use crate::MAX_SIMULTANEOUS_RENDER_TARGETS;
use crate::context_state::ContextId;
use crate::native::{DeviceCap, NativeFramebuffer, NativeGraphics};
use crate::resource::ResourceId;
use crate::texture::{DepthAttachment, DepthStencilView, RenderTargetView, TargetLayer};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct ColorSlot {
    resource: Option<ResourceId>,
    mip: u32,
    layer: TargetLayer,
}

impl ColorSlot {
    const EMPTY: Self = Self {
        resource: None,
        mip: 0,
        layer: TargetLayer::All,
    };
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct DepthSlot {
    resource: ResourceId,
    attachment: DepthAttachment,
}

/// Canonical identity of a framebuffer configuration.
///
/// Two keys are equal iff they would produce the same binding configuration
/// in the same context. Built from logical resource identities, never from
/// native handle values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FramebufferKey {
    colors: [ColorSlot; MAX_SIMULTANEOUS_RENDER_TARGETS],
    depth_stencil: Option<DepthSlot>,
    context: ContextId,
}

impl FramebufferKey {
    fn new(
        context: ContextId,
        colors: &[Option<RenderTargetView>],
        depth_stencil: Option<&DepthStencilView>,
    ) -> Self {
        let mut slots = [ColorSlot::EMPTY; MAX_SIMULTANEOUS_RENDER_TARGETS];
        for (slot, view) in slots.iter_mut().zip(colors) {
            if let Some(view) = view {
                *slot = ColorSlot {
                    resource: Some(view.handle.id()),
                    mip: view.mip,
                    layer: view.layer,
                };
            }
        }
        Self {
            colors: slots,
            depth_stencil: depth_stencil.map(|view| DepthSlot {
                resource: view.handle.id(),
                attachment: view.attachment,
            }),
            context,
        }
    }

    fn resources(&self) -> impl Iterator<Item = ResourceId> + '_ {
        self.colors
            .iter()
            .filter_map(|slot| slot.resource)
            .chain(self.depth_stencil.map(|slot| slot.resource))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FramebufferCacheStats {
    pub entry_count: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Cache of native framebuffer objects keyed by target configuration.
#[derive(Default)]
pub struct FramebufferCache {
    entries: HashMap<FramebufferKey, NativeFramebuffer>,
    /// Incremental index consulted (and cleared) on invalidation, so a
    /// destroyed resource does not force a scan of the whole cache. Entries
    /// may go stale when a key is removed through another resource; stale
    /// keys are skipped because the main map no longer contains them.
    by_resource: HashMap<ResourceId, Vec<FramebufferKey>>,
    hits: u64,
    misses: u64,
}

impl FramebufferCache {
    /// Look up or build the framebuffer for the given target configuration.
    ///
    /// The back-buffer sentinel and the all-null fallback both resolve to
    /// [`NativeFramebuffer::DEFAULT`] without creating a cache entry.
    #[profiling::function]
    pub fn get_or_create(
        &mut self,
        native: &dyn NativeGraphics,
        context: ContextId,
        colors: &[Option<RenderTargetView>],
        depth_stencil: Option<&DepthStencilView>,
    ) -> NativeFramebuffer {
        assert!(
            !colors.is_empty() || depth_stencil.is_some(),
            "framebuffer requested with no target slots at all"
        );

        // The capability query bounds how many color slots take part in the
        // configuration; everything beyond it is ignored.
        let max_slots = if native.caps().contains(DeviceCap::MultipleRenderTargets) {
            MAX_SIMULTANEOUS_RENDER_TARGETS
        } else {
            1
        };
        let colors = &colors[..colors.len().min(max_slots)];

        if colors.iter().flatten().any(|view| view.back_buffer) {
            assert!(
                colors.iter().flatten().count() == 1 && depth_stencil.is_none(),
                "the back buffer cannot be combined with other attachments"
            );
            // Always "the one default target"; not cacheable.
            return NativeFramebuffer::DEFAULT;
        }

        let key = FramebufferKey::new(context, colors, depth_stencil);
        if let Some(&framebuffer) = self.entries.get(&key) {
            self.hits += 1;
            return framebuffer;
        }

        let bound: SmallVec<[u32; MAX_SIMULTANEOUS_RENDER_TARGETS]> = colors
            .iter()
            .enumerate()
            .filter_map(|(i, view)| view.as_ref().map(|_| i as u32))
            .collect();

        if bound.is_empty() && depth_stencil.is_none() {
            // An attachment-less framebuffer object is invalid in most
            // native APIs; render to the default target instead.
            log::warn!("framebuffer request resolved to zero attachments; using the default framebuffer");
            return NativeFramebuffer::DEFAULT;
        }

        self.misses += 1;

        let framebuffer = native.create_framebuffer();
        for (i, view) in colors.iter().enumerate() {
            let Some(view) = view else { continue };
            match view.layer {
                TargetLayer::All => {
                    native.attach_color_target(framebuffer, i as u32, view.handle.native(), view.mip);
                }
                TargetLayer::Layer(layer) => {
                    native.attach_color_target_layer(
                        framebuffer,
                        i as u32,
                        view.handle.native(),
                        view.mip,
                        layer,
                    );
                }
            }
        }

        if let Some(view) = depth_stencil {
            match view.attachment {
                DepthAttachment::DepthOnly => {
                    native.attach_depth_target(framebuffer, view.handle.native());
                }
                DepthAttachment::Combined => {
                    native.attach_depth_stencil_target(framebuffer, view.handle.native());
                }
            }
        }

        // Single-buffer reads go through the lowest-indexed color slot.
        if let Some(&first) = bound.first() {
            native.set_draw_attachments(framebuffer, &bound);
            native.set_read_attachment(framebuffer, first);
        }

        if !native.check_framebuffer_complete(framebuffer) {
            log::error!("{framebuffer} failed the completeness check; using the default framebuffer");
            native.destroy_framebuffer(framebuffer);
            return NativeFramebuffer::DEFAULT;
        }

        self.entries.insert(key, framebuffer);
        for resource in key.resources() {
            self.by_resource.entry(resource).or_default().push(key);
        }
        framebuffer
    }

    /// Destroy and remove every entry referencing `resource` in any slot.
    /// Returns the destroyed native handles so the caller can purge any
    /// context that still has one bound.
    pub fn invalidate(
        &mut self,
        native: &dyn NativeGraphics,
        resource: ResourceId,
    ) -> SmallVec<[NativeFramebuffer; 4]> {
        let mut destroyed = SmallVec::new();
        let Some(keys) = self.by_resource.remove(&resource) else {
            return destroyed;
        };
        for key in keys {
            if let Some(framebuffer) = self.entries.remove(&key) {
                native.destroy_framebuffer(framebuffer);
                destroyed.push(framebuffer);
            }
        }
        destroyed
    }

    /// Destroy every cached framebuffer. Device teardown only.
    pub fn clear(&mut self, native: &dyn NativeGraphics) {
        for (_, framebuffer) in self.entries.drain() {
            native.destroy_framebuffer(framebuffer);
        }
        self.by_resource.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> FramebufferCacheStats {
        FramebufferCacheStats {
            entry_count: self.entries.len(),
            hits: self.hits,
            misses: self.misses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::testing::RecordingNative;
    use crate::native::NativeResource;
    use crate::resource::ResourceHandle;

    fn color_view(native: u64) -> RenderTargetView {
        RenderTargetView {
            handle: ResourceHandle::new(NativeResource(native)),
            mip: 0,
            layer: TargetLayer::All,
            back_buffer: false,
        }
    }

    fn back_buffer_view() -> RenderTargetView {
        RenderTargetView {
            handle: ResourceHandle::new(NativeResource(0)),
            mip: 0,
            layer: TargetLayer::All,
            back_buffer: true,
        }
    }

    fn depth_view(native: u64, attachment: DepthAttachment) -> DepthStencilView {
        DepthStencilView {
            handle: ResourceHandle::new(NativeResource(native)),
            attachment,
        }
    }

    const CTX: ContextId = ContextId(0);

    #[test]
    fn second_lookup_returns_cached_handle() {
        let native = RecordingNative::new();
        let mut cache = FramebufferCache::default();
        let a = color_view(10);

        let first = cache.get_or_create(&native, CTX, &[Some(a.clone())], None);
        let second = cache.get_or_create(&native, CTX, &[Some(a)], None);

        assert_eq!(first, second);
        assert_eq!(cache.len(), 1);
        assert_eq!(native.calls.lock().created.len(), 1);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn differing_target_sets_get_distinct_framebuffers() {
        let native = RecordingNative::new();
        let mut cache = FramebufferCache::default();
        let a = color_view(10);
        let b = color_view(11);

        let h1 = cache.get_or_create(&native, CTX, &[Some(a.clone())], None);
        let h2 = cache.get_or_create(&native, CTX, &[Some(a.clone()), Some(b)], None);
        let h1_again = cache.get_or_create(&native, CTX, &[Some(a)], None);

        assert_ne!(h1, h2);
        assert_eq!(h1, h1_again);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn context_identity_is_part_of_the_key() {
        let native = RecordingNative::new();
        let mut cache = FramebufferCache::default();
        let a = color_view(10);

        let h1 = cache.get_or_create(&native, ContextId(0), &[Some(a.clone())], None);
        let h2 = cache.get_or_create(&native, ContextId(1), &[Some(a)], None);

        assert_ne!(h1, h2);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn mip_and_layer_are_part_of_the_key() {
        let native = RecordingNative::new();
        let mut cache = FramebufferCache::default();
        let handle = ResourceHandle::new(NativeResource(10));
        let whole = RenderTargetView {
            handle: handle.clone(),
            mip: 0,
            layer: TargetLayer::All,
            back_buffer: false,
        };
        let mip1 = RenderTargetView {
            handle: handle.clone(),
            mip: 1,
            layer: TargetLayer::All,
            back_buffer: false,
        };
        let face3 = RenderTargetView {
            handle,
            mip: 0,
            layer: TargetLayer::Layer(3),
            back_buffer: false,
        };

        let h0 = cache.get_or_create(&native, CTX, &[Some(whole)], None);
        let h1 = cache.get_or_create(&native, CTX, &[Some(mip1)], None);
        let h2 = cache.get_or_create(&native, CTX, &[Some(face3)], None);

        assert_ne!(h0, h1);
        assert_ne!(h0, h2);
        assert_ne!(h1, h2);
        // Slice attachment goes through the layer call.
        assert_eq!(native.calls.lock().layer_attaches, 1);
        assert_eq!(native.calls.lock().color_attaches, 2);
    }

    #[test]
    fn back_buffer_resolves_to_default_and_is_never_cached() {
        let native = RecordingNative::new();
        let mut cache = FramebufferCache::default();

        for _ in 0..3 {
            let fb = cache.get_or_create(&native, CTX, &[Some(back_buffer_view())], None);
            assert_eq!(fb, NativeFramebuffer::DEFAULT);
        }
        assert_eq!(cache.len(), 0);
        assert!(native.calls.lock().created.is_empty());
    }

    #[test]
    #[should_panic(expected = "back buffer cannot be combined")]
    fn back_buffer_combined_with_other_targets_asserts() {
        let native = RecordingNative::new();
        let mut cache = FramebufferCache::default();
        cache.get_or_create(
            &native,
            CTX,
            &[Some(back_buffer_view()), Some(color_view(10))],
            None,
        );
    }

    #[test]
    #[should_panic(expected = "no target slots")]
    fn empty_request_asserts() {
        let native = RecordingNative::new();
        let mut cache = FramebufferCache::default();
        cache.get_or_create(&native, CTX, &[], None);
    }

    #[test]
    fn all_null_slots_fall_back_to_default() {
        let native = RecordingNative::new();
        let mut cache = FramebufferCache::default();

        let fb = cache.get_or_create(&native, CTX, &[None, None], None);

        assert_eq!(fb, NativeFramebuffer::DEFAULT);
        assert_eq!(cache.len(), 0);
        assert!(native.calls.lock().created.is_empty());
    }

    #[test]
    fn invalidate_removes_every_referencing_entry() {
        let native = RecordingNative::new();
        let mut cache = FramebufferCache::default();
        let a = color_view(10);
        let b = color_view(11);

        let h_a = cache.get_or_create(&native, CTX, &[Some(a.clone())], None);
        let h_ab = cache.get_or_create(&native, CTX, &[Some(a.clone()), Some(b.clone())], None);
        let h_b = cache.get_or_create(&native, CTX, &[Some(b.clone())], None);

        let destroyed = cache.invalidate(&native, a.handle.id());

        assert_eq!(destroyed.len(), 2);
        assert!(destroyed.contains(&h_a));
        assert!(destroyed.contains(&h_ab));
        assert_eq!(cache.len(), 1);

        // The untouched entry still hits; the invalidated one rebuilds.
        assert_eq!(cache.get_or_create(&native, CTX, &[Some(b)], None), h_b);
        let rebuilt = cache.get_or_create(&native, CTX, &[Some(a)], None);
        assert_ne!(rebuilt, h_a);
    }

    #[test]
    fn invalidate_covers_depth_references() {
        let native = RecordingNative::new();
        let mut cache = FramebufferCache::default();
        let a = color_view(10);
        let d = depth_view(12, DepthAttachment::Combined);

        cache.get_or_create(&native, CTX, &[Some(a)], Some(&d));
        let destroyed = cache.invalidate(&native, d.handle.id());

        assert_eq!(destroyed.len(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn depth_attachment_point_follows_view_kind() {
        let native = RecordingNative::new();
        let mut cache = FramebufferCache::default();
        let a = color_view(10);

        cache.get_or_create(
            &native,
            CTX,
            &[Some(a.clone())],
            Some(&depth_view(12, DepthAttachment::DepthOnly)),
        );
        cache.get_or_create(
            &native,
            CTX,
            &[Some(a)],
            Some(&depth_view(13, DepthAttachment::Combined)),
        );

        let calls = native.calls.lock();
        assert_eq!(calls.depth_attaches, 1);
        assert_eq!(calls.depth_stencil_attaches, 1);
    }

    #[test]
    fn read_buffer_is_lowest_bound_slot() {
        let native = RecordingNative::new();
        let mut cache = FramebufferCache::default();
        let a = color_view(10);
        let b = color_view(11);

        cache.get_or_create(&native, CTX, &[None, Some(a), Some(b)], None);

        let calls = native.calls.lock();
        assert_eq!(calls.read_attachment, Some(1));
        assert_eq!(calls.draw_attachments, vec![1, 2]);
    }

    #[test]
    fn slots_beyond_the_capability_bound_are_ignored() {
        let native = RecordingNative::with_caps(Default::default());
        let mut cache = FramebufferCache::default();
        let a = color_view(10);
        let b = color_view(11);

        let h_pair = cache.get_or_create(&native, CTX, &[Some(a.clone()), Some(b)], None);
        let h_single = cache.get_or_create(&native, CTX, &[Some(a)], None);

        // Without multiple render targets the second slot never took part.
        assert_eq!(h_pair, h_single);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn incomplete_framebuffer_is_destroyed_and_replaced_by_default() {
        let native = RecordingNative::incomplete();
        let mut cache = FramebufferCache::default();
        let a = color_view(10);

        let fb = cache.get_or_create(&native, CTX, &[Some(a)], None);

        assert_eq!(fb, NativeFramebuffer::DEFAULT);
        assert!(cache.is_empty());
        let calls = native.calls.lock();
        assert_eq!(calls.created.len(), 1);
        assert_eq!(calls.destroyed, calls.created);
    }

    #[test]
    fn clear_destroys_all_entries() {
        let native = RecordingNative::new();
        let mut cache = FramebufferCache::default();
        let a = color_view(10);
        let b = color_view(11);

        cache.get_or_create(&native, CTX, &[Some(a)], None);
        cache.get_or_create(&native, CTX, &[Some(b)], None);
        cache.clear(&native);

        assert!(cache.is_empty());
        assert_eq!(native.calls.lock().destroyed.len(), 2);
    }
}
