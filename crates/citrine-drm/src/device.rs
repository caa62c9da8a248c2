//! The kernel device interface.
//!
//! [`DrmDevice`] is the only way the driver reaches the kernel: every ioctl
//! the legacy submission path uses has one method here. Production code wraps
//! a real device node; tests use [`SoftDevice`](crate::SoftDevice), which
//! implements the same contract against an in-process model.

use bitflags::bitflags;

use crate::error::Result;
use crate::sarea::SAREA_NR_CLIPRECTS;

/// A screen-space rectangle, half-open on the right and bottom edges
/// (`x1 <= x < x2`, `y1 <= y < y2`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClipRect {
    pub x1: u16,
    pub y1: u16,
    pub x2: u16,
    pub y2: u16,
}

impl ClipRect {
    pub fn new(x1: u16, y1: u16, x2: u16, y2: u16) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> u16 {
        self.x2.saturating_sub(self.x1)
    }

    pub fn height(&self) -> u16 {
        self.y2.saturating_sub(self.y1)
    }

    pub fn is_empty(&self) -> bool {
        self.x2 <= self.x1 || self.y2 <= self.y1
    }

    /// Intersection with `other`, or `None` when the rectangles do not
    /// overlap.
    pub fn intersect(&self, other: &ClipRect) -> Option<ClipRect> {
        let out = ClipRect {
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
            x2: self.x2.min(other.x2),
            y2: self.y2.min(other.y2),
        };
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }
}

/// Retirement counters the kernel exposes through the parameter query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param {
    /// Frame sequence number the engine has finished displaying.
    LastFrame,
    /// Clear sequence number the engine has retired.
    LastClear,
    /// Age stamp of the most recently retired command stream.
    LastDispatch,
}

/// A DMA buffer leased from the kernel's pool. The lease ends when the
/// kernel parses a discard command naming `index` in a submitted stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaSlot {
    pub index: u16,
    pub size: u32,
}

/// One command-stream submission: the dwords plus the cliprects the kernel
/// replays the stream against.
#[derive(Debug, Clone, Copy)]
pub struct Submission<'a> {
    pub stream: &'a [u32],
    pub cliprects: &'a [ClipRect],
}

bitflags! {
    /// Buffers named by a clear ioctl.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClearFlags: u32 {
        const FRONT = 1 << 0;
        const BACK = 1 << 1;
        const DEPTH = 1 << 2;
        const STENCIL = 1 << 3;
    }
}

/// Arguments of the clear ioctl, applied to every box of the accompanying
/// batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClearArgs {
    pub flags: ClearFlags,
    pub clear_color: u32,
    pub clear_depth: u32,
    pub color_mask: u32,
    pub depth_mask: u32,
}

/// Outcome of a blocking lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockGrant {
    /// True when some other context held the lock since the caller's last
    /// hold. The caller must then assume all hardware state was clobbered.
    pub changed_hands: bool,
}

/// The legacy kernel driver, one method per ioctl the submission path uses.
///
/// Methods take `&mut self` because a device is private to one context; the
/// cross-process serialization point is the hardware lock, not this object.
pub trait DrmDevice {
    /// Hand a command stream to the kernel for parsing and dispatch.
    /// Requires the hardware lock. The kernel recycles any DMA buffers the
    /// stream discards even when it rejects the stream.
    fn submit(&mut self, submission: Submission<'_>) -> Result<()>;

    /// Kernel-side hint that accumulated stream state should be submitted
    /// before more commands are written.
    fn stream_needs_flush(&mut self) -> bool {
        false
    }

    /// Block until the hardware lock is granted to `context`. Only called
    /// after the uncontended fast path failed.
    fn lock_wait(&mut self, context: u32) -> Result<LockGrant>;

    /// Release the hardware lock held by `context`.
    fn unlock(&mut self, context: u32) -> Result<()>;

    /// Read a retirement counter. Each call reflects engine progress at the
    /// time of the call, so polling it in a loop observes progress.
    fn get_param(&mut self, param: Param) -> Result<u32>;

    /// Queue an interrupt at the current tail of the engine's work and
    /// return its sequence number.
    fn irq_emit(&mut self) -> Result<u32>;

    /// Sleep until the interrupt `sequence` fires. May fail with
    /// [`DrmError::Interrupted`](crate::DrmError::Interrupted), in which case
    /// the caller retries. Must not be called while holding the hardware
    /// lock.
    fn irq_wait(&mut self, sequence: u32) -> Result<()>;

    /// Poll the command processor for idleness. Fails with
    /// [`DrmError::Busy`](crate::DrmError::Busy) while work is outstanding.
    fn cp_idle(&mut self) -> Result<()>;

    /// Lease a free DMA buffer, failing with
    /// [`DrmError::NoDmaBuffer`](crate::DrmError::NoDmaBuffer) when the pool
    /// is exhausted. Requires the hardware lock.
    fn dma_acquire(&mut self) -> Result<DmaSlot>;

    /// Queue a back-to-front blit of the given boxes. At most
    /// [`SAREA_NR_CLIPRECTS`] boxes per call; requires the hardware lock.
    fn swap(&mut self, cliprects: &[ClipRect]) -> Result<()>;

    /// Queue a clear of the given boxes. At most [`SAREA_NR_CLIPRECTS`]
    /// boxes per call; requires the hardware lock.
    fn clear(&mut self, args: &ClearArgs, cliprects: &[ClipRect]) -> Result<()>;

    /// Sleep for `micros` microseconds with the hardware lock dropped.
    /// Lives on the device so tests can virtualize time.
    fn usleep(&mut self, micros: u32);
}
