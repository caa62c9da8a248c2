//! The command buffer: an in-memory dword accumulator that becomes one
//! kernel submission when flushed.
//!
//! The buffer itself is deliberately dumb. It tracks capacity, fill level,
//! and the flush-in-progress guard; the decisions about *when* to flush live
//! in [`CitrineContext`](crate::context::CitrineContext), which owns the
//! device handle. Overrunning the buffer is a caller error and asserts,
//! because every write path is required to reserve space first.

use crate::error::{Error, Result};

/// Dwords kept in reserve for commands written while a flush is being
/// prepared, e.g. engine-drain barriers.
pub const CMDBUF_SAFETY_MARGIN: u32 = 4;

/// Smallest buffer the driver will run with.
pub const CMDBUF_MIN_DWORDS: u32 = 256;

/// Hard ceiling on buffer size. Larger buffers only add latency between a
/// draw and the kernel seeing it.
pub const CMDBUF_MAX_DWORDS: u32 = 64 * 1024;

/// Extra room on top of two full state emissions when sizing from state.
const CMDBUF_STATE_SLACK: u32 = 64;

#[derive(Debug)]
pub struct CmdBuf {
    dwords: Vec<u32>,
    capacity: u32,
    flushing: bool,
}

impl CmdBuf {
    /// Size the buffer from a caller hint and the largest possible state
    /// emission. The result always fits two full emissions plus slack, and
    /// is clamped to [`CMDBUF_MIN_DWORDS`]..=[`CMDBUF_MAX_DWORDS`].
    pub fn new(hint_dwords: u32, max_state_dwords: u32) -> Self {
        let floor = 2 * max_state_dwords + CMDBUF_STATE_SLACK;
        let capacity = hint_dwords
            .max(floor)
            .clamp(CMDBUF_MIN_DWORDS, CMDBUF_MAX_DWORDS);
        Self {
            dwords: Vec::with_capacity(capacity as usize),
            capacity,
            flushing: false,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn used(&self) -> u32 {
        self.dwords.len() as u32
    }

    pub fn remaining(&self) -> u32 {
        self.capacity - self.used()
    }

    pub fn is_empty(&self) -> bool {
        self.dwords.is_empty()
    }

    pub fn dwords(&self) -> &[u32] {
        &self.dwords
    }

    pub fn push(&mut self, dword: u32) {
        assert!(self.used() < self.capacity, "command buffer overrun");
        self.dwords.push(dword);
    }

    pub fn extend_from_slice(&mut self, dwords: &[u32]) {
        assert!(
            self.used() as usize + dwords.len() <= self.capacity as usize,
            "command buffer overrun"
        );
        self.dwords.extend_from_slice(dwords);
    }

    /// Reserve `dwords` and return a writer bounded by the reservation.
    /// The caller must have ensured space; a reservation that does not fit
    /// asserts.
    pub fn begin(&mut self, dwords: u32) -> Batch<'_> {
        assert!(
            self.used() + dwords <= self.capacity,
            "batch of {dwords} dwords does not fit ({} of {} used)",
            self.used(),
            self.capacity
        );
        let limit = self.dwords.len() + dwords as usize;
        Batch { buf: self, limit }
    }

    /// Enter the flush critical section. Fails if a flush is already in
    /// progress, which would otherwise submit and reset the buffer out from
    /// under the outer flush.
    pub fn begin_flush(&mut self) -> Result<()> {
        if self.flushing {
            return Err(Error::ReentrantFlush);
        }
        self.flushing = true;
        Ok(())
    }

    pub fn end_flush(&mut self) {
        self.flushing = false;
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing
    }

    /// Drop all accumulated dwords. Capacity is unchanged.
    pub fn reset(&mut self) {
        self.dwords.clear();
    }
}

/// A bounded writer over a [`CmdBuf`] reservation. Writing past the
/// reservation asserts; writing less than reserved is fine, the unused tail
/// simply stays available.
#[derive(Debug)]
pub struct Batch<'a> {
    buf: &'a mut CmdBuf,
    limit: usize,
}

impl Batch<'_> {
    pub fn emit(&mut self, dword: u32) {
        assert!(self.buf.dwords.len() < self.limit, "batch overrun");
        self.buf.dwords.push(dword);
    }

    pub fn emit_slice(&mut self, dwords: &[u32]) {
        assert!(
            self.buf.dwords.len() + dwords.len() <= self.limit,
            "batch overrun"
        );
        self.buf.dwords.extend_from_slice(dwords);
    }

    pub fn remaining(&self) -> u32 {
        (self.limit - self.buf.dwords.len()) as u32
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn capacity_comes_from_hint_and_state_floor() {
        // Hint wins when it is the larger bound.
        assert_eq!(CmdBuf::new(2048, 100).capacity(), 2048);
        // The state floor wins over a small hint.
        assert_eq!(CmdBuf::new(256, 600).capacity(), 2 * 600 + 64);
        // Both bounds clamp to the hard limits.
        assert_eq!(CmdBuf::new(16, 0).capacity(), CMDBUF_MIN_DWORDS);
        assert_eq!(
            CmdBuf::new(10_000_000, 0).capacity(),
            CMDBUF_MAX_DWORDS
        );
        assert_eq!(
            CmdBuf::new(256, CMDBUF_MAX_DWORDS).capacity(),
            CMDBUF_MAX_DWORDS
        );
    }

    #[test]
    fn tracks_fill_level() {
        let mut buf = CmdBuf::new(256, 0);
        assert!(buf.is_empty());
        buf.push(1);
        buf.extend_from_slice(&[2, 3]);
        assert_eq!(buf.used(), 3);
        assert_eq!(buf.remaining(), 253);
        assert_eq!(buf.dwords(), &[1, 2, 3]);
        buf.reset();
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), 256);
    }

    #[test]
    fn batch_writes_are_bounded() {
        let mut buf = CmdBuf::new(256, 0);
        let mut batch = buf.begin(4);
        batch.emit(0xa);
        batch.emit_slice(&[0xb, 0xc]);
        assert_eq!(batch.remaining(), 1);
        drop(batch);
        // Writing less than reserved leaves the tail available.
        assert_eq!(buf.used(), 3);
    }

    #[test]
    #[should_panic(expected = "batch overrun")]
    fn batch_overrun_asserts() {
        let mut buf = CmdBuf::new(256, 0);
        let mut batch = buf.begin(1);
        batch.emit(1);
        batch.emit(2);
    }

    #[test]
    #[should_panic(expected = "does not fit")]
    fn oversized_reservation_asserts() {
        let mut buf = CmdBuf::new(256, 0);
        buf.begin(257);
    }

    #[test]
    fn reentrant_flush_is_an_error() {
        let mut buf = CmdBuf::new(256, 0);
        buf.begin_flush().unwrap();
        assert!(matches!(buf.begin_flush(), Err(Error::ReentrantFlush)));
        buf.end_flush();
        buf.begin_flush().unwrap();
    }
}
