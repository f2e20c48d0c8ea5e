//! Stable resource identity and shared handles.

use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::native::NativeResource;

// Identities are never reused. A recycled native handle value can therefore
// never alias a live cache entry with one belonging to a destroyed resource.
static NEXT_RESOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// Stable logical identity of a GPU resource, used for hashing and equality
/// everywhere the native handle value must not be trusted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display)]
#[display("res#{_0}")]
pub struct ResourceId(u64);

impl ResourceId {
    pub(crate) fn allocate() -> Self {
        Self(NEXT_RESOURCE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

struct HandleInner {
    id: ResourceId,
    native: NativeResource,
}

/// Reference-counted handle to a GPU-resident object.
///
/// Clones share the same logical identity. The reference count is atomic:
/// a handle may be held by submission-thread wrapper objects and by cache
/// entries drained on the execution thread at the same time.
#[derive(Clone)]
pub struct ResourceHandle {
    inner: Arc<HandleInner>,
}

impl ResourceHandle {
    pub(crate) fn new(native: NativeResource) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id: ResourceId::allocate(),
                native,
            }),
        }
    }

    #[inline]
    pub fn id(&self) -> ResourceId {
        self.inner.id
    }

    /// The driver-level handle. Only meaningful to the native layer.
    #[inline]
    pub fn native(&self) -> NativeResource {
        self.inner.native
    }

    #[inline]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl PartialEq for ResourceHandle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for ResourceHandle {}

impl Hash for ResourceHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl std::fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("id", &self.inner.id)
            .field("native", &self.inner.native)
            .finish()
    }
}
