//! Outstanding CPU-visible mapping bookkeeping.
//!
//! Locks may be taken inline on the submission thread while the execution
//! thread resolves earlier ones, so the list lives behind its own mutex -
//! unlike the framebuffer cache, which has a single logical writer.

use meridian_core::collections::SmallVec;
use parking_lot::Mutex;

use crate::resource::{ResourceHandle, ResourceId};

/// Requested access for a CPU-visible mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

/// CPU-visible mapping of a locked sub-resource. The pointer stays valid
/// until the matching [`LockTracker::unlock`].
#[derive(Debug)]
pub struct MappedSubresource {
    pub ptr: *mut u8,
    pub stride: u32,
    pub size: u32,
}

/// One outstanding lock. Returned to the caller on unlock so the staging
/// contents can be handed to the native upload path.
pub struct PendingLock {
    resource: ResourceId,
    sub_resource: u32,
    data: Box<[u8]>,
    stride: u32,
    mode: LockMode,
}

impl PendingLock {
    #[inline]
    pub fn resource(&self) -> ResourceId {
        self.resource
    }

    #[inline]
    pub fn sub_resource(&self) -> u32 {
        self.sub_resource
    }

    #[inline]
    pub fn stride(&self) -> u32 {
        self.stride
    }

    #[inline]
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    #[inline]
    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Box<[u8]> {
        self.data
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LockTrackerStats {
    pub outstanding_locks: usize,
    pub outstanding_bytes: u64,
}

#[derive(Default)]
struct TrackerInner {
    outstanding: SmallVec<[PendingLock; 16]>,
    total_bytes: u64,
}

/// Tracks every live CPU-visible mapping and the memory they pin.
///
/// At most one lock may exist per (resource, sub-resource) pair; violating
/// that is a caller bug and fails loudly rather than corrupting the staging
/// memory of the first lock.
#[derive(Default)]
pub struct LockTracker {
    inner: Mutex<TrackerInner>,
}

impl LockTracker {
    /// Record a new lock and hand out its staging mapping.
    pub fn lock(
        &self,
        resource: &ResourceHandle,
        sub_resource: u32,
        mode: LockMode,
        stride: u32,
        size: u32,
    ) -> MappedSubresource {
        let mut inner = self.inner.lock();
        for lock in &inner.outstanding {
            assert!(
                lock.resource != resource.id() || lock.sub_resource != sub_resource,
                "sub-resource {sub_resource} of {} is already locked",
                resource.id()
            );
        }

        let mut data = vec![0u8; size as usize].into_boxed_slice();
        let ptr = data.as_mut_ptr();
        inner.outstanding.push(PendingLock {
            resource: resource.id(),
            sub_resource,
            data,
            stride,
            mode,
        });
        inner.total_bytes += u64::from(size);

        MappedSubresource { ptr, stride, size }
    }

    /// Remove and return the matching lock record.
    ///
    /// Panics on a mismatched unlock; an unlock without a lock is a caller
    /// bug, not a runtime condition to recover from.
    pub fn unlock(&self, resource: &ResourceHandle, sub_resource: u32) -> PendingLock {
        let mut inner = self.inner.lock();
        let index = inner
            .outstanding
            .iter()
            .position(|lock| lock.resource == resource.id() && lock.sub_resource == sub_resource)
            .unwrap_or_else(|| {
                panic!(
                    "mismatched unlock: sub-resource {sub_resource} of {} is not locked",
                    resource.id()
                )
            });

        // Removal order does not matter; swap keeps it O(1).
        let lock = inner.outstanding.swap_remove(index);
        inner.total_bytes -= u64::from(lock.size());
        lock
    }

    pub fn stats(&self) -> LockTrackerStats {
        let inner = self.inner.lock();
        LockTrackerStats {
            outstanding_locks: inner.outstanding.len(),
            outstanding_bytes: inner.total_bytes,
        }
    }

    /// Drain every remaining record. Device teardown uses this to report
    /// leaked locks; a non-empty result is a caller bug worth logging.
    pub(crate) fn take_outstanding(&self) -> SmallVec<[PendingLock; 16]> {
        let mut inner = self.inner.lock();
        inner.total_bytes = 0;
        std::mem::take(&mut inner.outstanding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::NativeResource;

    fn resource() -> ResourceHandle {
        ResourceHandle::new(NativeResource(1))
    }

    #[test]
    fn lock_then_unlock_roundtrip() {
        let tracker = LockTracker::default();
        let res = resource();

        let mapping = tracker.lock(&res, 0, LockMode::WriteOnly, 256, 1024);
        assert_eq!(mapping.stride, 256);
        assert_eq!(mapping.size, 1024);
        assert!(!mapping.ptr.is_null());

        let stats = tracker.stats();
        assert_eq!(stats.outstanding_locks, 1);
        assert_eq!(stats.outstanding_bytes, 1024);

        let pending = tracker.unlock(&res, 0);
        assert_eq!(pending.resource(), res.id());
        assert_eq!(pending.size(), 1024);
        assert_eq!(pending.mode(), LockMode::WriteOnly);

        let stats = tracker.stats();
        assert_eq!(stats.outstanding_locks, 0);
        assert_eq!(stats.outstanding_bytes, 0);
    }

    #[test]
    fn mapping_is_writable_and_survives_other_locks() {
        let tracker = LockTracker::default();
        let a = resource();
        let b = resource();

        let mapping_a = tracker.lock(&a, 0, LockMode::WriteOnly, 4, 16);
        // Push enough additional locks to spill the inline list.
        let others: Vec<_> = (0..20).map(|_| resource()).collect();
        for other in &others {
            tracker.lock(other, 0, LockMode::ReadOnly, 4, 4);
        }
        tracker.lock(&b, 0, LockMode::WriteOnly, 4, 16);

        unsafe {
            mapping_a.ptr.write(0xAB);
            mapping_a.ptr.add(15).write(0xCD);
        }

        let pending = tracker.unlock(&a, 0);
        assert_eq!(pending.data()[0], 0xAB);
        assert_eq!(pending.data()[15], 0xCD);
    }

    #[test]
    fn distinct_sub_resources_lock_independently() {
        let tracker = LockTracker::default();
        let res = resource();

        tracker.lock(&res, 0, LockMode::WriteOnly, 16, 64);
        tracker.lock(&res, 1, LockMode::WriteOnly, 8, 32);

        assert_eq!(tracker.stats().outstanding_locks, 2);
        assert_eq!(tracker.stats().outstanding_bytes, 96);

        tracker.unlock(&res, 1);
        tracker.unlock(&res, 0);
    }

    #[test]
    fn relock_after_unlock_succeeds() {
        let tracker = LockTracker::default();
        let res = resource();

        tracker.lock(&res, 0, LockMode::WriteOnly, 16, 64);
        tracker.unlock(&res, 0);
        tracker.lock(&res, 0, LockMode::ReadWrite, 16, 64);
        assert_eq!(tracker.stats().outstanding_locks, 1);
    }

    #[test]
    #[should_panic(expected = "already locked")]
    fn double_lock_is_fatal() {
        let tracker = LockTracker::default();
        let res = resource();

        tracker.lock(&res, 0, LockMode::WriteOnly, 16, 64);
        tracker.lock(&res, 0, LockMode::ReadOnly, 16, 64);
    }

    #[test]
    #[should_panic(expected = "mismatched unlock")]
    fn unlock_without_lock_is_fatal() {
        let tracker = LockTracker::default();
        tracker.unlock(&resource(), 0);
    }
}
