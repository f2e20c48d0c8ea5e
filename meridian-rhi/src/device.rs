//! Render device - owns the framebuffer cache, per-context binding state,
//! the command deferral bridge and the lock tracker.
//!
//! The cache and the context states have a single logical writer: they are
//! only ever touched while holding the execution lock, either inline on the
//! thread that owns the execution context or from the worker draining the
//! deferred queue. The lock tracker is the exception and carries its own
//! critical section.

use std::cell::Cell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;

use derive_builder::Builder;
use meridian_core::collections::SmallVec;
use meridian_core::collections::hashmap::HashMap;
use meridian_core::log;
use parking_lot::Mutex;

use crate::MAX_SIMULTANEOUS_RENDER_TARGETS;
use crate::command_bridge::{CommandBridge, CommandFault, DeferredCommand};
use crate::context_state::{BindingPoint, ContextId, ContextState};
use crate::framebuffer_cache::{FramebufferCache, FramebufferCacheStats};
use crate::lock_tracker::{LockMode, LockTracker, LockTrackerStats, MappedSubresource, PendingLock};
use crate::native::{NativeFramebuffer, NativeGraphics, NativeResource};
use crate::resource::{ResourceHandle, ResourceId};
use crate::texture::{DepthStencilView, RenderTargetView, Texture, TextureDesc};

/// Device configuration.
#[derive(Debug, Clone, Builder)]
pub struct DeviceDesc {
    /// Run the execution context on a dedicated worker thread.
    #[builder(default = "true")]
    pub threaded: bool,
    /// Start with bypass active: every operation runs inline on the caller.
    #[builder(default)]
    pub bypass: bool,
}

impl Default for DeviceDesc {
    fn default() -> Self {
        Self {
            threaded: true,
            bypass: false,
        }
    }
}

/// State owned by the execution context. Deferred commands receive it
/// mutably; nothing else touches it without going through the bridge.
pub struct ExecutionState {
    pub(crate) native: Arc<dyn NativeGraphics>,
    pub(crate) framebuffer_cache: FramebufferCache,
    pub(crate) contexts: HashMap<ContextId, ContextState>,
}

impl ExecutionState {
    fn new(native: Arc<dyn NativeGraphics>) -> Self {
        Self {
            native,
            framebuffer_cache: FramebufferCache::default(),
            contexts: HashMap::new(),
        }
    }

    #[inline]
    pub fn native(&self) -> &dyn NativeGraphics {
        &*self.native
    }

    fn framebuffer(
        &mut self,
        context: ContextId,
        colors: &[Option<RenderTargetView>],
        depth_stencil: Option<&DepthStencilView>,
    ) -> NativeFramebuffer {
        let native = self.native.clone();
        self.framebuffer_cache.get_or_create(&*native, context, colors, depth_stencil)
    }

    fn context_mut(&mut self, context: ContextId) -> &mut ContextState {
        self.contexts
            .get_mut(&context)
            .unwrap_or_else(|| panic!("{context} was never registered with this device"))
    }

    /// Invalidation sweep: drop every cache entry and context binding that
    /// references `resource`, destroying the native framebuffers.
    fn sweep_resource(&mut self, resource: ResourceId) {
        let native = self.native.clone();
        let destroyed = self.framebuffer_cache.invalidate(&*native, resource);
        for state in self.contexts.values_mut() {
            state.sweep_resource(resource);
            for &framebuffer in &destroyed {
                state.purge_framebuffer(framebuffer);
            }
        }
    }
}

thread_local! {
    // True while this thread is running a deferred command; a nested
    // blocking flush here can never be satisfied and must fail loudly.
    static IN_COMMAND: Cell<bool> = const { Cell::new(false) };
}

fn with_in_command_flag<R>(f: impl FnOnce() -> R) -> R {
    struct Reset;
    impl Drop for Reset {
        fn drop(&mut self) {
            IN_COMMAND.set(false);
        }
    }

    IN_COMMAND.set(true);
    let _reset = Reset;
    f()
}

fn run_command(state: &mut ExecutionState, command: DeferredCommand) {
    with_in_command_flag(|| command(state));
}

pub(crate) struct DeviceShared {
    native: Arc<dyn NativeGraphics>,
    bridge: CommandBridge,
    exec: Mutex<ExecutionState>,
    lock_tracker: LockTracker,
    next_context: AtomicU32,
}

impl DeviceShared {
    /// Run every queued command on the calling thread. Only meaningful in
    /// the inline modes; with a live worker the queue drains over there.
    fn drain_inline(&self) {
        while let Some((ticket, command)) = self.bridge.try_pop() {
            let mut state = self.exec.lock();
            run_command(&mut state, command);
            drop(state);
            self.bridge.mark_completed(ticket);
        }
    }

    /// Fire-and-forget: run inline or enqueue, in submission order.
    pub(crate) fn submit<F>(&self, f: F)
    where
        F: FnOnce(&mut ExecutionState) + Send + 'static,
    {
        if self.bridge.runs_inline() {
            if IN_COMMAND.get() {
                // Issued from within a deferred command: order it directly
                // after the one currently running.
                self.bridge.enqueue(Box::new(f));
                return;
            }
            let mut state = self.exec.lock();
            with_in_command_flag(|| f(&mut state));
            drop(state);
            self.drain_inline();
            return;
        }
        if self.bridge.is_dead() {
            log::error!("deferred command discarded: execution thread terminated abnormally");
            return;
        }
        self.bridge.enqueue(Box::new(f));
    }

    /// Run `f` on the execution context and hand back its result,
    /// blocking on the flush when the caller is off-thread.
    pub(crate) fn execute<R, F>(&self, f: F) -> Result<R, CommandFault>
    where
        R: Send + 'static,
        F: FnOnce(&mut ExecutionState) -> R + Send + 'static,
    {
        if self.bridge.runs_inline() {
            assert!(
                !IN_COMMAND.get(),
                "blocking flush issued from within a deferred command"
            );
            let mut state = self.exec.lock();
            let result = with_in_command_flag(|| f(&mut state));
            drop(state);
            self.drain_inline();
            return Ok(result);
        }
        if self.bridge.is_dead() {
            return Err(CommandFault::ExecutionStopped);
        }

        let slot: Arc<Mutex<Option<Result<R, CommandFault>>>> = Arc::new(Mutex::new(None));
        let out = slot.clone();
        let ticket = self.bridge.enqueue(Box::new(move |state| {
            let result = catch_unwind(AssertUnwindSafe(|| f(state)));
            *out.lock() = Some(result.map_err(CommandFault::from_panic));
        }));
        self.bridge.flush_until(ticket)?;

        let result = slot
            .lock()
            .take()
            .expect("deferred command completed without storing a result");
        result
    }

    pub(crate) fn notify_resource_destroyed(&self, resource: ResourceId) {
        self.submit(move |state| state.sweep_resource(resource));
    }
}

fn worker_main(shared: &DeviceShared) {
    struct ExitGuard<'a>(&'a CommandBridge);
    impl Drop for ExitGuard<'_> {
        fn drop(&mut self) {
            self.0.mark_worker_exit(thread::panicking());
        }
    }

    shared.bridge.adopt_execution_thread();
    let _guard = ExitGuard(&shared.bridge);
    while let Some((ticket, command)) = shared.bridge.wait_next() {
        let mut state = shared.exec.lock();
        run_command(&mut state, command);
        drop(state);
        shared.bridge.mark_completed(ticket);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceStats {
    pub framebuffer_cache: FramebufferCacheStats,
    pub locks: LockTrackerStats,
    pub queued_commands: usize,
}

/// The device. Owns the cache, the binding state of every context, the
/// deferral bridge and the lock tracker; never a process-wide global.
pub struct RenderDevice {
    shared: Arc<DeviceShared>,
    worker: Option<thread::JoinHandle<()>>,
}

impl RenderDevice {
    pub fn new(native: Arc<dyn NativeGraphics>, desc: &DeviceDesc) -> anyhow::Result<Self> {
        let shared = Arc::new(DeviceShared {
            native: native.clone(),
            bridge: CommandBridge::new(desc.threaded),
            exec: Mutex::new(ExecutionState::new(native)),
            lock_tracker: LockTracker::default(),
            next_context: AtomicU32::new(0),
        });
        shared.bridge.set_bypass(desc.bypass);

        let worker = if desc.threaded {
            let worker_shared = shared.clone();
            Some(
                thread::Builder::new()
                    .name("meridian-exec".to_owned())
                    .spawn(move || worker_main(&worker_shared))?,
            )
        } else {
            // The constructing thread owns the execution context.
            shared.bridge.adopt_execution_thread();
            None
        };

        Ok(Self { shared, worker })
    }

    /// Register a new native context. Binding state lives until
    /// [`Self::destroy_context`] or device teardown.
    pub fn create_context(&self) -> ContextId {
        let context = ContextId(self.shared.next_context.fetch_add(1, Ordering::Relaxed));
        self.shared.submit(move |state| {
            state.contexts.insert(context, ContextState::new());
        });
        context
    }

    pub fn destroy_context(&self, context: ContextId) {
        self.shared.submit(move |state| {
            state.contexts.remove(&context);
        });
    }

    /// Wrap a native texture handle produced by a collaborator.
    pub fn create_texture(&self, desc: TextureDesc, native: NativeResource) -> Texture {
        Texture::new(self.shared.clone(), desc, native, false)
    }

    /// Wrap the swap-chain back buffer. Requesting a framebuffer whose sole
    /// color target is this texture resolves to the default framebuffer.
    pub fn acquire_back_buffer(&self, desc: TextureDesc) -> Texture {
        Texture::new(self.shared.clone(), desc, NativeResource(0), true)
    }

    /// Framebuffer for the given target configuration in `context`.
    /// Cache hits return the previously built native handle.
    #[profiling::function]
    pub fn framebuffer(
        &self,
        context: ContextId,
        colors: &[Option<RenderTargetView>],
        depth_stencil: Option<&DepthStencilView>,
    ) -> Result<NativeFramebuffer, CommandFault> {
        // Caller bug, not an execution fault: fail on the calling thread.
        assert!(
            !colors.is_empty() || depth_stencil.is_some(),
            "framebuffer requested with no target slots at all"
        );
        let colors: SmallVec<[Option<RenderTargetView>; MAX_SIMULTANEOUS_RENDER_TARGETS]> =
            colors.iter().cloned().collect();
        let depth_stencil = depth_stencil.cloned();
        self.shared
            .execute(move |state| state.framebuffer(context, &colors, depth_stencil.as_ref()))
    }

    /// Bind `handle` to a target binding point, eliding the native call
    /// when the context already has it bound.
    pub fn bind_target(&self, context: ContextId, point: BindingPoint, handle: &ResourceHandle) {
        let id = handle.id();
        let native_value = handle.native();
        self.shared.submit(move |state| {
            let native = state.native.clone();
            state.context_mut(context).bind_target(&*native, context, point, id, native_value);
        });
    }

    /// Bind a framebuffer as the active one for `context`.
    pub fn bind_framebuffer(&self, context: ContextId, framebuffer: NativeFramebuffer) {
        self.shared.submit(move |state| {
            let native = state.native.clone();
            state.context_mut(context).bind_framebuffer(&*native, context, framebuffer);
        });
    }

    /// Force the next bind of `point` through to the native layer, e.g.
    /// after a sibling subsystem changed driver state directly.
    pub fn invalidate_binding(&self, context: ContextId, point: BindingPoint) {
        self.shared.submit(move |state| {
            state.context_mut(context).invalidate_binding(point);
        });
    }

    /// Clear any context state that still has `framebuffer` bound, after
    /// the native object was torn down directly.
    pub fn purge_binding(&self, framebuffer: NativeFramebuffer) {
        self.shared.submit(move |state| {
            for context in state.contexts.values_mut() {
                context.purge_framebuffer(framebuffer);
            }
        });
    }

    /// Remove every cache entry and context binding referencing `handle`.
    ///
    /// Resource wrappers call this from their destructor; it is routed
    /// through the deferral queue so the sweep executes in the same ordered
    /// stream as any pending bind that still references the resource.
    pub fn notify_resource_destroyed(&self, handle: &ResourceHandle) {
        self.shared.notify_resource_destroyed(handle.id());
    }

    /// Map a mip level for CPU access. At most one lock per
    /// (texture, mip); a second one is a caller bug and fails loudly.
    /// Safe to call from either thread.
    pub fn lock(&self, texture: &Texture, mip: u32, mode: LockMode) -> MappedSubresource {
        assert!(
            mip < texture.desc().mip_levels,
            "mip {mip} out of range for '{}'",
            texture.name()
        );
        let (stride, size) = texture.lock_size(mip);
        self.shared.lock_tracker.lock(texture.handle(), mip, mode, stride, size)
    }

    /// Release a mapping taken with [`Self::lock`], returning the staging
    /// record for the native upload path.
    pub fn unlock(&self, texture: &Texture, mip: u32) -> PendingLock {
        self.shared.lock_tracker.unlock(texture.handle(), mip)
    }

    /// Run `f` on the execution thread, fire-and-forget. FIFO with every
    /// other deferred operation.
    pub fn enqueue<F>(&self, f: F)
    where
        F: FnOnce(&dyn NativeGraphics) + Send + 'static,
    {
        self.shared.submit(move |state| {
            let native = state.native.clone();
            f(&*native);
        });
    }

    /// Run `f` on the execution thread and block until its result is
    /// available.
    pub fn enqueue_and_wait<R, F>(&self, f: F) -> Result<R, CommandFault>
    where
        R: Send + 'static,
        F: FnOnce(&dyn NativeGraphics) -> R + Send + 'static,
    {
        self.shared.execute(move |state| {
            let native = state.native.clone();
            f(&*native)
        })
    }

    /// Block until every previously enqueued command has executed.
    pub fn flush(&self) -> Result<(), CommandFault> {
        self.shared.execute(|_| ())
    }

    pub fn set_bypass(&self, bypass: bool) {
        self.shared.bridge.set_bypass(bypass);
    }

    pub fn bypass(&self) -> bool {
        self.shared.bridge.bypass()
    }

    pub fn native(&self) -> &Arc<dyn NativeGraphics> {
        &self.shared.native
    }

    pub fn lock_stats(&self) -> LockTrackerStats {
        self.shared.lock_tracker.stats()
    }

    pub fn stats(&self) -> DeviceStats {
        let framebuffer_cache = self
            .shared
            .execute(|state| state.framebuffer_cache.stats())
            .expect("cache stats query failed on the execution thread");
        DeviceStats {
            framebuffer_cache,
            locks: self.shared.lock_tracker.stats(),
            queued_commands: self.shared.bridge.queue_depth(),
        }
    }
}

impl Drop for RenderDevice {
    fn drop(&mut self) {
        self.shared.bridge.stop();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("execution thread terminated abnormally during teardown");
            }
        }

        // Anything that slipped in after the worker observed the stop flag.
        self.shared.drain_inline();

        let mut state = self.shared.exec.lock();
        let native = state.native.clone();
        state.framebuffer_cache.clear(&*native);
        drop(state);

        let leaked = self.shared.lock_tracker.take_outstanding();
        if !leaked.is_empty() {
            let bytes: u64 = leaked.iter().map(|lock| u64::from(lock.size())).sum();
            log::warn!(
                "{} outstanding resource locks ({bytes} bytes) left at device teardown",
                leaked.len()
            );
        }
    }
}
