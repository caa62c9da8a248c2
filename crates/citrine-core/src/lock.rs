//! The per-context view of the global hardware lock.
//!
//! Acquisition tries a compare-and-swap on the shared-area lock word first;
//! that only succeeds when this context was also the previous holder, so a
//! successful fast path additionally proves nobody else touched the chip.
//! On failure the kernel's blocking lock ioctl takes over and reports
//! whether the lock changed hands, which the caller must treat as "all
//! hardware state lost".

use std::sync::Arc;

use citrine_drm::sarea::LOCK_CONTEXT_MASK;
use citrine_drm::{DrmDevice, Sarea};

use crate::error::Result;

/// Outcome of one acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockAcquire {
    /// Another context held the lock since our last hold.
    pub changed_hands: bool,
}

#[derive(Debug)]
pub struct HardwareLock {
    context_id: u32,
    sarea: Arc<Sarea>,
    held: bool,
}

impl HardwareLock {
    /// `context_id` 0 is reserved as the never-held value of the lock word.
    pub fn new(context_id: u32, sarea: Arc<Sarea>) -> Self {
        assert!(
            context_id != 0 && context_id & !LOCK_CONTEXT_MASK == 0,
            "invalid context id {context_id:#x}"
        );
        Self {
            context_id,
            sarea,
            held: false,
        }
    }

    pub fn context_id(&self) -> u32 {
        self.context_id
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Take the lock. The lock is not recursive; acquiring while held is a
    /// caller error.
    pub fn acquire(&mut self, device: &mut dyn DrmDevice) -> Result<LockAcquire> {
        assert!(!self.held, "hardware lock is not recursive");
        if self.sarea.try_lock(self.context_id) {
            self.held = true;
            return Ok(LockAcquire {
                changed_hands: false,
            });
        }
        let grant = device.lock_wait(self.context_id)?;
        self.held = true;
        Ok(LockAcquire {
            changed_hands: grant.changed_hands,
        })
    }

    pub fn release(&mut self, device: &mut dyn DrmDevice) -> Result<()> {
        assert!(self.held, "releasing a lock that is not held");
        device.unlock(self.context_id)?;
        self.held = false;
        Ok(())
    }
}
