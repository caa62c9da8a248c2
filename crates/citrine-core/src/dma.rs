//! The rolling DMA allocator.
//!
//! Vertex and upload data travels through kernel-owned DMA buffers. The
//! driver leases one buffer at a time and carves regions out of it front to
//! back; when a request does not fit, the context retires the current buffer
//! and leases a fresh one. A buffer returns to the kernel only after its
//! last region is gone *and* a discard command naming it has gone out in a
//! command stream, so the engine can never lose the race.
//!
//! Reference counting is the `Rc` on [`DmaBuffer`]: the pool's current
//! buffer holds one reference and every live [`DmaRegion`] holds one.
//! Whoever drops the count to one (the caller's own handle) emits the
//! discard. That decision lives in
//! [`CitrineContext::release_dma_region`](crate::context::CitrineContext::release_dma_region),
//! which owns the command buffer the discard is written into.

use std::rc::Rc;

use citrine_drm::DmaSlot;

/// Releasing more than this many buffers without a flush forces one, so
/// discards reach the kernel before the free pool runs dry.
pub const DMA_RELEASE_FLUSH_THRESHOLD: u32 = 4;

/// The write cursor re-aligns to this after every carve.
pub const DMA_CURSOR_ALIGN: u32 = 8;

fn align_up(value: u32, alignment: u32) -> u32 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// One leased kernel DMA buffer.
#[derive(Debug)]
pub struct DmaBuffer {
    slot: DmaSlot,
}

impl DmaBuffer {
    pub fn index(&self) -> u16 {
        self.slot.index
    }

    pub fn size(&self) -> u32 {
        self.slot.size
    }
}

/// A carved byte range of a DMA buffer, `[start, end)`. Holding a region
/// keeps the buffer leased.
#[derive(Debug)]
pub struct DmaRegion {
    buf: Rc<DmaBuffer>,
    start: u32,
    ptr: u32,
    end: u32,
    /// Array-of-structs vertex stride, in dwords. Set by emit paths.
    pub aos_stride: u32,
    /// Vertex size for the array, in dwords.
    pub aos_size: u32,
}

impl DmaRegion {
    pub fn buffer_index(&self) -> u16 {
        self.buf.index()
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    /// Current write cursor, `start..=end`.
    pub fn ptr(&self) -> u32 {
        self.ptr
    }

    pub fn len(&self) -> u32 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn remaining(&self) -> u32 {
        self.end - self.ptr
    }

    /// Advance the write cursor by `bytes` of freshly written data.
    pub fn advance(&mut self, bytes: u32) {
        assert!(self.ptr + bytes <= self.end, "write past the region end");
        self.ptr += bytes;
    }

    pub(crate) fn into_buffer(self) -> Rc<DmaBuffer> {
        self.buf
    }
}

#[derive(Debug)]
struct CurrentBuffer {
    buf: Rc<DmaBuffer>,
    ptr: u32,
    end: u32,
}

/// Allocator state: the current buffer plus the released-but-not-flushed
/// count.
#[derive(Debug, Default)]
pub struct DmaPool {
    current: Option<CurrentBuffer>,
    released_bufs: u32,
}

impl DmaPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_current(&self) -> bool {
        self.current.is_some()
    }

    /// Bytes still carvable from the current buffer at its present cursor.
    pub fn current_remaining(&self) -> u32 {
        self.current.as_ref().map_or(0, |c| c.end - c.ptr)
    }

    /// Buffers released since the last flush.
    pub fn released_bufs(&self) -> u32 {
        self.released_bufs
    }

    pub fn note_released(&mut self) {
        self.released_bufs += 1;
    }

    pub fn reset_released(&mut self) {
        self.released_bufs = 0;
    }

    /// Adopt a freshly leased buffer as current. The previous current must
    /// have been taken out first.
    pub fn install(&mut self, slot: DmaSlot) {
        assert!(self.current.is_none(), "current dma buffer still installed");
        self.current = Some(CurrentBuffer {
            buf: Rc::new(DmaBuffer { slot }),
            ptr: 0,
            end: slot.size,
        });
    }

    /// Remove the current buffer for retirement, keeping its reference so
    /// the caller decides whether it was the last one.
    pub fn take_current(&mut self) -> Option<Rc<DmaBuffer>> {
        self.current.take().map(|c| c.buf)
    }

    /// Carve `bytes` at `alignment` from the current buffer. `None` means
    /// there is no current buffer or the request does not fit, and the
    /// caller must refill and retry.
    pub fn carve(&mut self, bytes: u32, alignment: u32) -> Option<DmaRegion> {
        let current = self.current.as_mut()?;
        let start = align_up(current.ptr, alignment);
        if start + bytes > current.end {
            return None;
        }
        current.ptr = align_up(start + bytes, DMA_CURSOR_ALIGN);
        Some(DmaRegion {
            buf: Rc::clone(&current.buf),
            start,
            ptr: start,
            end: start + bytes,
            aos_stride: 0,
            aos_size: 0,
        })
    }
}
