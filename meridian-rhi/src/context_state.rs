//! Per-context record of what is currently bound, used to elide redundant
//! native bind calls. Binding state is per-context at the driver level, so
//! each context gets an independent instance; instances are only ever
//! touched from the execution thread.

use crate::MAX_SIMULTANEOUS_RENDER_TARGETS;
use crate::native::{NativeFramebuffer, NativeGraphics, NativeResource};
use crate::resource::ResourceId;

/// Identity of a native execution context. Two are normally live: the
/// shared resource-creation context and the rendering context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, derive_more::Display)]
#[display("ctx#{_0}")]
pub struct ContextId(pub(crate) u32);

/// A target binding point tracked per context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BindingPoint {
    Color(u32),
    DepthStencil,
}

/// Cached bindings for one context.
pub(crate) struct ContextState {
    colors: [Option<ResourceId>; MAX_SIMULTANEOUS_RENDER_TARGETS],
    depth_stencil: Option<ResourceId>,
    framebuffer: Option<NativeFramebuffer>,
    /// Set when a bound resource was destroyed out from under this context;
    /// cleared once the framebuffer binding is rebuilt.
    invalid: bool,
}

impl ContextState {
    pub fn new() -> Self {
        Self {
            colors: [None; MAX_SIMULTANEOUS_RENDER_TARGETS],
            depth_stencil: None,
            framebuffer: None,
            invalid: false,
        }
    }

    #[inline]
    pub fn needs_rebuild(&self) -> bool {
        self.invalid
    }

    fn slot(&mut self, point: BindingPoint) -> &mut Option<ResourceId> {
        match point {
            BindingPoint::Color(i) => &mut self.colors[i as usize],
            BindingPoint::DepthStencil => &mut self.depth_stencil,
        }
    }

    /// Bind `target` to `point`, skipping the native call when the cached
    /// value already matches. Returns whether a native call was issued.
    pub fn bind_target(
        &mut self,
        native: &dyn NativeGraphics,
        context: ContextId,
        point: BindingPoint,
        id: ResourceId,
        target: NativeResource,
    ) -> bool {
        if let BindingPoint::Color(i) = point {
            assert!(
                (i as usize) < MAX_SIMULTANEOUS_RENDER_TARGETS,
                "color binding point {i} out of range"
            );
        }
        let invalid = self.invalid;
        let slot = self.slot(point);
        if !invalid && *slot == Some(id) {
            return false;
        }
        *slot = Some(id);
        native.bind_target(context, point, target);
        true
    }

    /// Bind `framebuffer` as the active framebuffer, skipping the native
    /// call when it is already bound and the record is intact. A real bind
    /// clears the rebuild flag.
    pub fn bind_framebuffer(
        &mut self,
        native: &dyn NativeGraphics,
        context: ContextId,
        framebuffer: NativeFramebuffer,
    ) -> bool {
        if !self.invalid && self.framebuffer == Some(framebuffer) {
            return false;
        }
        self.framebuffer = Some(framebuffer);
        self.invalid = false;
        native.bind_framebuffer(context, framebuffer);
        true
    }

    /// Force the next bind of `point` through to the native layer. Used
    /// after a sibling subsystem changed driver binding state directly.
    pub fn invalidate_binding(&mut self, point: BindingPoint) {
        *self.slot(point) = None;
    }

    /// Drop every binding that references `id` and flag the record for
    /// rebuild. Returns whether anything referenced the resource.
    pub fn sweep_resource(&mut self, id: ResourceId) -> bool {
        let mut hit = false;
        for slot in self.colors.iter_mut().chain(std::iter::once(&mut self.depth_stencil)) {
            if *slot == Some(id) {
                *slot = None;
                hit = true;
            }
        }
        if hit {
            self.invalid = true;
        }
        hit
    }

    /// Forget a framebuffer binding after the native object was destroyed,
    /// forcing a rebuild on the next bind.
    pub fn purge_framebuffer(&mut self, framebuffer: NativeFramebuffer) {
        if self.framebuffer == Some(framebuffer) {
            self.framebuffer = None;
            self.invalid = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::testing::RecordingNative;
    use crate::resource::ResourceHandle;

    fn resource(native: u64) -> ResourceHandle {
        ResourceHandle::new(NativeResource(native))
    }

    #[test]
    fn rebind_of_same_resource_is_elided() {
        let native = RecordingNative::new();
        let mut state = ContextState::new();
        let ctx = ContextId(0);
        let res = resource(10);

        let first = state.bind_target(&native, ctx, BindingPoint::Color(0), res.id(), res.native());
        let second = state.bind_target(&native, ctx, BindingPoint::Color(0), res.id(), res.native());

        assert!(first);
        assert!(!second);
        assert_eq!(native.calls.lock().target_binds.len(), 1);
    }

    #[test]
    fn binding_a_different_resource_issues_native_call() {
        let native = RecordingNative::new();
        let mut state = ContextState::new();
        let ctx = ContextId(0);
        let a = resource(10);
        let b = resource(11);

        state.bind_target(&native, ctx, BindingPoint::Color(0), a.id(), a.native());
        let issued = state.bind_target(&native, ctx, BindingPoint::Color(0), b.id(), b.native());

        assert!(issued);
        assert_eq!(native.calls.lock().target_binds.len(), 2);
    }

    #[test]
    fn invalidate_binding_forces_rebind() {
        let native = RecordingNative::new();
        let mut state = ContextState::new();
        let ctx = ContextId(0);
        let res = resource(10);

        state.bind_target(&native, ctx, BindingPoint::DepthStencil, res.id(), res.native());
        state.invalidate_binding(BindingPoint::DepthStencil);
        let issued = state.bind_target(&native, ctx, BindingPoint::DepthStencil, res.id(), res.native());

        assert!(issued);
        assert_eq!(native.calls.lock().target_binds.len(), 2);
    }

    #[test]
    fn sweep_marks_rebuild_and_clears_slots() {
        let native = RecordingNative::new();
        let mut state = ContextState::new();
        let ctx = ContextId(1);
        let res = resource(10);

        state.bind_target(&native, ctx, BindingPoint::Color(2), res.id(), res.native());
        assert!(state.sweep_resource(res.id()));
        assert!(state.needs_rebuild());

        // An unrelated resource is untouched by the sweep.
        let other = resource(11);
        let mut untouched = ContextState::new();
        untouched.bind_target(&native, ctx, BindingPoint::Color(0), other.id(), other.native());
        assert!(!untouched.sweep_resource(res.id()));
        assert!(!untouched.needs_rebuild());
    }

    #[test]
    fn framebuffer_rebind_elided_until_purged() {
        let native = RecordingNative::new();
        let mut state = ContextState::new();
        let ctx = ContextId(0);
        let fb = NativeFramebuffer(5);

        assert!(state.bind_framebuffer(&native, ctx, fb));
        assert!(!state.bind_framebuffer(&native, ctx, fb));

        state.purge_framebuffer(fb);
        assert!(state.needs_rebuild());
        assert!(state.bind_framebuffer(&native, ctx, fb));
        assert!(!state.needs_rebuild());
        assert_eq!(native.calls.lock().framebuffer_binds.len(), 2);
    }
}
