//! Buffer objects under a fixed memory budget.
//!
//! The legacy kernel has no memory manager, so the driver accounts for VRAM
//! and GART itself: [`BoManager`] debits a domain budget on open and credits
//! it back when the last handle drops. Handles are reference counted;
//! sharing across contexts goes through small global names
//! ([`BoManager::import`]).
//!
//! A buffer that a submitted stream may still reference carries a pending
//! age. Mapping such a buffer stalls until the engine's retired-dispatch
//! counter passes that age, which is the only CPU/engine synchronization the
//! legacy path has.

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use bitflags::bitflags;
use citrine_drm::{DrmDevice, Param};
use tracing::trace;

use crate::error::Result;

/// Microseconds slept between busy polls while waiting to map.
const BO_MAP_SLEEP_MICROS: u32 = 10;

bitflags! {
    /// Memory domains a buffer may be placed in.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BoDomain: u32 {
        const VRAM = 1 << 0;
        const GART = 1 << 1;
    }
}

bitflags! {
    /// Placement flags recorded on the buffer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BoFlags: u32 {
        const MACRO_TILE = 1 << 0;
        const MICRO_TILE = 1 << 1;
    }
}

/// `true` once `completed` has reached `age`, with wraparound.
fn age_reached(completed: u32, age: u32) -> bool {
    completed.wrapping_sub(age) as i32 >= 0
}

#[derive(Debug, Default)]
struct PoolInner {
    vram_size: u64,
    vram_used: u64,
    gart_size: u64,
    gart_used: u64,
    next_name: u32,
    by_name: HashMap<u32, Weak<BoInner>>,
}

#[derive(Debug)]
struct BoInner {
    name: u32,
    size: u64,
    alignment: u32,
    domain: BoDomain,
    flags: BoFlags,
    map_count: Cell<u32>,
    pending_age: Cell<Option<u32>>,
    storage: RefCell<Vec<u8>>,
    pool: Weak<RefCell<PoolInner>>,
}

impl Drop for BoInner {
    fn drop(&mut self) {
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        let mut pool = pool.borrow_mut();
        if self.domain == BoDomain::VRAM {
            pool.vram_used -= self.size;
        } else {
            pool.gart_used -= self.size;
        }
        pool.by_name.remove(&self.name);
    }
}

/// The budget keeper. Clones share one budget.
#[derive(Debug, Clone)]
pub struct BoManager {
    inner: Rc<RefCell<PoolInner>>,
}

impl BoManager {
    pub fn new(vram_size: u64, gart_size: u64) -> Self {
        Self {
            inner: Rc::new(RefCell::new(PoolInner {
                vram_size,
                gart_size,
                next_name: 1,
                ..PoolInner::default()
            })),
        }
    }

    /// Allocate a buffer, trying the requested domains in VRAM-then-GART
    /// order. `None` means neither budget can take it; callers treat that
    /// as an ordinary out-of-memory and shrink or fall back.
    pub fn open(
        &self,
        size: u64,
        alignment: u32,
        domains: BoDomain,
        flags: BoFlags,
    ) -> Option<BoHandle> {
        assert!(size > 0, "zero-sized buffer");
        let mut pool = self.inner.borrow_mut();
        let domain = if domains.contains(BoDomain::VRAM) && pool.vram_used + size <= pool.vram_size
        {
            pool.vram_used += size;
            BoDomain::VRAM
        } else if domains.contains(BoDomain::GART) && pool.gart_used + size <= pool.gart_size {
            pool.gart_used += size;
            BoDomain::GART
        } else {
            trace!(size, ?domains, "buffer allocation denied");
            return None;
        };
        let name = pool.next_name;
        pool.next_name += 1;
        let inner = Rc::new(BoInner {
            name,
            size,
            alignment,
            domain,
            flags,
            map_count: Cell::new(0),
            pending_age: Cell::new(None),
            storage: RefCell::new(vec![0; size as usize]),
            pool: Rc::downgrade(&self.inner),
        });
        pool.by_name.insert(name, Rc::downgrade(&inner));
        Some(BoHandle { inner })
    }

    /// Look up a live buffer by global name.
    pub fn import(&self, name: u32) -> Option<BoHandle> {
        let pool = self.inner.borrow();
        let inner = pool.by_name.get(&name)?.upgrade()?;
        Some(BoHandle { inner })
    }

    pub fn vram_free(&self) -> u64 {
        let pool = self.inner.borrow();
        pool.vram_size - pool.vram_used
    }

    pub fn gart_free(&self) -> u64 {
        let pool = self.inner.borrow();
        pool.gart_size - pool.gart_used
    }
}

/// A reference-counted buffer handle. The backing store and budget are
/// released when the last handle drops.
#[derive(Debug, Clone)]
pub struct BoHandle {
    inner: Rc<BoInner>,
}

impl BoHandle {
    pub fn name(&self) -> u32 {
        self.inner.name
    }

    pub fn size(&self) -> u64 {
        self.inner.size
    }

    pub fn alignment(&self) -> u32 {
        self.inner.alignment
    }

    pub fn domain(&self) -> BoDomain {
        self.inner.domain
    }

    pub fn flags(&self) -> BoFlags {
        self.inner.flags
    }

    pub fn map_count(&self) -> u32 {
        self.inner.map_count.get()
    }

    /// Same underlying buffer.
    pub fn ptr_eq(&self, other: &BoHandle) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Stamp the buffer as referenced by work retiring at `age`.
    pub fn mark_pending(&self, age: u32) {
        self.inner.pending_age.set(Some(age));
    }

    pub fn is_pending(&self) -> bool {
        self.inner.pending_age.get().is_some()
    }

    /// Whether the engine may still read or write the buffer. Clears the
    /// pending stamp once the retired-dispatch counter has passed it.
    pub fn is_busy(&self, device: &mut dyn DrmDevice) -> Result<bool> {
        let Some(age) = self.inner.pending_age.get() else {
            return Ok(false);
        };
        let completed = device.get_param(Param::LastDispatch)?;
        if age_reached(completed, age) {
            self.inner.pending_age.set(None);
            return Ok(false);
        }
        Ok(true)
    }

    /// Map the buffer for CPU access, stalling until the engine is done
    /// with it. Maps nest.
    pub fn map(&self, device: &mut dyn DrmDevice) -> Result<()> {
        while self.is_busy(device)? {
            device.usleep(BO_MAP_SLEEP_MICROS);
        }
        self.inner.map_count.set(self.inner.map_count.get() + 1);
        Ok(())
    }

    /// Drop one level of mapping. Unbalanced unmaps are a caller error.
    pub fn unmap(&self) {
        let count = self.inner.map_count.get();
        assert!(count > 0, "buffer unmapped more times than mapped");
        self.inner.map_count.set(count - 1);
    }

    /// CPU view of the contents. The buffer must be mapped.
    pub fn data(&self) -> Ref<'_, [u8]> {
        assert!(self.map_count() > 0, "buffer accessed while not mapped");
        Ref::map(self.inner.storage.borrow(), Vec::as_slice)
    }

    pub fn data_mut(&self) -> RefMut<'_, [u8]> {
        assert!(self.map_count() > 0, "buffer accessed while not mapped");
        RefMut::map(self.inner.storage.borrow_mut(), Vec::as_mut_slice)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use citrine_drm::{Sarea, SoftDevice};
    use pretty_assertions::assert_eq;

    use super::*;

    fn manager() -> BoManager {
        BoManager::new(1 << 20, 1 << 20)
    }

    #[test]
    fn budget_is_debited_and_credited() {
        let mgr = manager();
        assert_eq!(mgr.vram_free(), 1 << 20);
        let bo = mgr.open(4096, 32, BoDomain::VRAM, BoFlags::default()).unwrap();
        assert_eq!(mgr.vram_free(), (1 << 20) - 4096);
        let clone = bo.clone();
        drop(bo);
        // The budget returns only with the last handle.
        assert_eq!(mgr.vram_free(), (1 << 20) - 4096);
        drop(clone);
        assert_eq!(mgr.vram_free(), 1 << 20);
    }

    #[test]
    fn falls_back_to_gart_when_vram_is_full() {
        let mgr = BoManager::new(4096, 1 << 20);
        let _a = mgr.open(4096, 32, BoDomain::VRAM, BoFlags::default()).unwrap();
        let b = mgr
            .open(4096, 32, BoDomain::VRAM | BoDomain::GART, BoFlags::default())
            .unwrap();
        assert_eq!(b.domain(), BoDomain::GART);
        // VRAM-only with no budget left is a recoverable failure.
        assert!(mgr.open(4096, 32, BoDomain::VRAM, BoFlags::default()).is_none());
    }

    #[test]
    fn import_follows_liveness() {
        let mgr = manager();
        let bo = mgr.open(64, 4, BoDomain::GART, BoFlags::default()).unwrap();
        let name = bo.name();

        let imported = mgr.import(name).unwrap();
        assert!(imported.ptr_eq(&bo));

        drop(bo);
        drop(imported);
        assert!(mgr.import(name).is_none());
    }

    #[test]
    fn map_stalls_until_the_pending_age_retires() {
        let sarea = Arc::new(Sarea::new());
        assert!(sarea.try_lock(1));
        let mut dev = SoftDevice::new(Arc::clone(&sarea));
        let mgr = manager();
        let bo = mgr.open(64, 4, BoDomain::GART, BoFlags::default()).unwrap();

        // Pretend three streams went out; the buffer rides the last one.
        for _ in 0..3 {
            dev.submit(citrine_drm::Submission {
                stream: &[citrine_drm::cmd::packet_header(1), 0],
                cliprects: &[],
            })
            .unwrap();
        }
        bo.mark_pending(sarea.last_dispatch());

        bo.map(&mut dev).unwrap();
        assert!(!bo.is_pending());
        // Three completion polls (0, 1, 2 dispatches retired) came back
        // busy before the fourth observed age 3.
        assert_eq!(dev.counters().usleeps, 3);
        assert_eq!(dev.slept_micros(), 30);
        bo.unmap();
    }

    #[test]
    fn maps_nest() {
        let sarea = Arc::new(Sarea::new());
        let mut dev = SoftDevice::new(sarea);
        let mgr = manager();
        let bo = mgr.open(64, 4, BoDomain::GART, BoFlags::default()).unwrap();
        bo.map(&mut dev).unwrap();
        bo.map(&mut dev).unwrap();
        assert_eq!(bo.map_count(), 2);
        bo.data_mut()[0] = 7;
        bo.unmap();
        assert_eq!(bo.data()[0], 7);
        bo.unmap();
        assert_eq!(bo.map_count(), 0);
    }

    #[test]
    #[should_panic(expected = "unmapped more times")]
    fn unmap_underflow_asserts() {
        let mgr = manager();
        let bo = mgr.open(64, 4, BoDomain::GART, BoFlags::default()).unwrap();
        bo.unmap();
    }

    #[test]
    #[should_panic(expected = "not mapped")]
    fn data_access_requires_a_mapping() {
        let mgr = manager();
        let bo = mgr.open(64, 4, BoDomain::GART, BoFlags::default()).unwrap();
        let _ = bo.data();
    }

    #[test]
    fn age_comparison_wraps() {
        assert!(age_reached(5, 5));
        assert!(age_reached(6, 5));
        assert!(!age_reached(4, 5));
        // Across the wrap boundary.
        assert!(age_reached(2, u32::MAX));
        assert!(!age_reached(u32::MAX, 2));
    }
}
