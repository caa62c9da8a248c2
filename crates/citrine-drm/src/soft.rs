//! In-process software device.
//!
//! [`SoftDevice`] implements [`DrmDevice`] against a deterministic model of
//! the legacy kernel driver: a DMA buffer pool, per-engine requested and
//! completed counters, and the lock-word protocol on a shared [`Sarea`].
//! Every driver test in the workspace runs against it.
//!
//! Determinism rules:
//!
//! - Counter queries return the completed value *then* advance it one step
//!   toward the requested value (when [`SoftDeviceConfig::advance_on_poll`]
//!   is set), so spin loops always terminate and their iteration counts are
//!   exact.
//! - `irq_wait` and a successful `cp_idle` retire everything outstanding.
//! - Sleeps only advance a virtual clock.
//! - The blocking lock grants immediately; tests stage a foreign holder by
//!   writing the lock word beforehand, which is what the grant inspects to
//!   report a change of hands.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::trace;

use crate::cmd::{Cmd, CmdStreamWalker};
use crate::device::{ClearArgs, ClipRect, DmaSlot, DrmDevice, LockGrant, Param, Submission};
use crate::error::{DrmError, Result};
use crate::sarea::{Sarea, LOCK_CONTEXT_MASK, LOCK_HELD, SAREA_NR_CLIPRECTS};

/// Knobs for shaping device behavior in tests.
#[derive(Debug, Clone)]
pub struct SoftDeviceConfig {
    /// Number of DMA buffers in the kernel pool.
    pub dma_buffers: u16,
    /// Size of each DMA buffer in bytes.
    pub dma_buffer_size: u32,
    /// Advance the matching engine by one step after every counter read.
    pub advance_on_poll: bool,
    /// Number of idle polls that report a busy engine before one succeeds.
    pub cp_busy_polls: u32,
    /// Number of interrupt waits that report interruption before one
    /// completes.
    pub irq_wait_interruptions: u32,
}

impl Default for SoftDeviceConfig {
    fn default() -> Self {
        Self {
            dma_buffers: 32,
            dma_buffer_size: 0x1_0000,
            advance_on_poll: true,
            cp_busy_polls: 0,
            irq_wait_interruptions: 0,
        }
    }
}

/// Call and progress counters, for assertions about protocol traffic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SoftCounters {
    pub submissions: u64,
    pub packets: u64,
    pub discards: u64,
    pub engine_waits: u64,
    pub swaps: u64,
    pub clears: u64,
    pub irq_emits: u64,
    pub irq_waits: u64,
    pub idle_polls: u64,
    pub param_reads: u64,
    pub lock_waits: u64,
    pub unlocks: u64,
    pub usleeps: u64,
}

#[derive(Debug)]
struct SoftKernel {
    sarea: Arc<Sarea>,
    dma_buffer_size: u32,
    advance_on_poll: bool,
    cp_busy_polls_left: u32,
    irq_interruptions_left: u32,
    needs_flush_hint: bool,

    frames_requested: u32,
    frames_completed: u32,
    clears_requested: u32,
    clears_completed: u32,
    dispatch_requested: u32,
    dispatch_completed: u32,
    next_irq_seq: u32,

    free_dma: VecDeque<u16>,
    leased: Vec<bool>,

    last_stream: Vec<u32>,
    last_clear_args: Option<ClearArgs>,
    virtual_micros: u64,
    counters: SoftCounters,
}

impl SoftKernel {
    fn new(sarea: Arc<Sarea>, config: &SoftDeviceConfig) -> Self {
        Self {
            sarea,
            dma_buffer_size: config.dma_buffer_size,
            advance_on_poll: config.advance_on_poll,
            cp_busy_polls_left: config.cp_busy_polls,
            irq_interruptions_left: config.irq_wait_interruptions,
            needs_flush_hint: false,
            frames_requested: 0,
            frames_completed: 0,
            clears_requested: 0,
            clears_completed: 0,
            dispatch_requested: 0,
            dispatch_completed: 0,
            next_irq_seq: 1,
            free_dma: (0..config.dma_buffers).collect(),
            leased: vec![false; usize::from(config.dma_buffers)],
            last_stream: Vec::new(),
            last_clear_args: None,
            virtual_micros: 0,
            counters: SoftCounters::default(),
        }
    }

    fn require_lock(&self, op: &'static str) -> Result<()> {
        if self.sarea.lock_word() & LOCK_HELD == 0 {
            return Err(DrmError::LockRequired { op });
        }
        Ok(())
    }

    fn retire_all(&mut self) {
        self.frames_completed = self.frames_requested;
        self.clears_completed = self.clears_requested;
        self.dispatch_completed = self.dispatch_requested;
    }

    fn recycle_dma(&mut self, index: u16) -> Result<()> {
        let slot = self
            .leased
            .get_mut(usize::from(index))
            .ok_or(DrmError::Submission {
                reason: format!("discard of unknown dma buffer {index}"),
            })?;
        if !*slot {
            return Err(DrmError::Submission {
                reason: format!("discard of dma buffer {index} which is not leased"),
            });
        }
        *slot = false;
        self.free_dma.push_back(index);
        Ok(())
    }
}

/// A [`DrmDevice`] backed by [`SoftKernel`]. Cheap to clone; clones share
/// the kernel, which is how a test inspects the device while a context owns
/// another handle to it.
#[derive(Debug, Clone)]
pub struct SoftDevice {
    sarea: Arc<Sarea>,
    kernel: Arc<Mutex<SoftKernel>>,
}

impl SoftDevice {
    pub fn new(sarea: Arc<Sarea>) -> Self {
        Self::with_config(sarea, SoftDeviceConfig::default())
    }

    pub fn with_config(sarea: Arc<Sarea>, config: SoftDeviceConfig) -> Self {
        let kernel = SoftKernel::new(Arc::clone(&sarea), &config);
        Self {
            sarea,
            kernel: Arc::new(Mutex::new(kernel)),
        }
    }

    fn kernel(&self) -> MutexGuard<'_, SoftKernel> {
        self.kernel.lock().unwrap()
    }

    pub fn sarea(&self) -> &Arc<Sarea> {
        &self.sarea
    }

    pub fn counters(&self) -> SoftCounters {
        self.kernel().counters.clone()
    }

    /// Dwords of the most recently accepted submission.
    pub fn last_stream(&self) -> Vec<u32> {
        self.kernel().last_stream.clone()
    }

    pub fn last_clear_args(&self) -> Option<ClearArgs> {
        self.kernel().last_clear_args
    }

    pub fn free_dma_buffers(&self) -> usize {
        self.kernel().free_dma.len()
    }

    pub fn leased_dma_buffers(&self) -> usize {
        self.kernel().leased.iter().filter(|l| **l).count()
    }

    pub fn outstanding_frames(&self) -> u32 {
        let k = self.kernel();
        k.frames_requested - k.frames_completed
    }

    pub fn outstanding_clears(&self) -> u32 {
        let k = self.kernel();
        k.clears_requested - k.clears_completed
    }

    /// Microseconds of virtual time accumulated by [`DrmDevice::usleep`].
    pub fn slept_micros(&self) -> u64 {
        self.kernel().virtual_micros
    }

    pub fn set_cp_busy_polls(&self, polls: u32) {
        self.kernel().cp_busy_polls_left = polls;
    }

    pub fn set_irq_wait_interruptions(&self, waits: u32) {
        self.kernel().irq_interruptions_left = waits;
    }

    pub fn set_stream_needs_flush(&self, hint: bool) {
        self.kernel().needs_flush_hint = hint;
    }

    /// Retire every queued frame, clear, and dispatch.
    pub fn retire_all(&self) {
        self.kernel().retire_all();
    }
}

fn poll_counter(requested: u32, completed: &mut u32, advance: bool) -> u32 {
    let seen = *completed;
    if advance && *completed != requested {
        *completed = completed.wrapping_add(1);
    }
    seen
}

impl DrmDevice for SoftDevice {
    fn submit(&mut self, submission: Submission<'_>) -> Result<()> {
        let mut k = self.kernel();
        k.require_lock("submit")?;
        if submission.cliprects.len() > SAREA_NR_CLIPRECTS {
            return Err(DrmError::Submission {
                reason: format!(
                    "{} cliprects exceeds the shared-area capacity of {SAREA_NR_CLIPRECTS}",
                    submission.cliprects.len()
                ),
            });
        }
        for cmd in CmdStreamWalker::new(submission.stream) {
            match cmd? {
                Cmd::Packet(_) => k.counters.packets += 1,
                Cmd::DmaDiscard { buf_index } => {
                    k.recycle_dma(buf_index)?;
                    k.counters.discards += 1;
                }
                Cmd::Wait(_) => k.counters.engine_waits += 1,
            }
        }
        k.dispatch_requested = k.dispatch_requested.wrapping_add(1);
        k.sarea.set_last_dispatch(k.dispatch_requested);
        k.needs_flush_hint = false;
        k.last_stream = submission.stream.to_vec();
        k.counters.submissions += 1;
        trace!(
            dwords = submission.stream.len(),
            cliprects = submission.cliprects.len(),
            age = k.dispatch_requested,
            "stream accepted"
        );
        Ok(())
    }

    fn stream_needs_flush(&mut self) -> bool {
        self.kernel().needs_flush_hint
    }

    fn lock_wait(&mut self, context: u32) -> Result<LockGrant> {
        let mut k = self.kernel();
        k.counters.lock_waits += 1;
        let previous = k.sarea.grant_lock(context);
        let changed_hands = previous & LOCK_CONTEXT_MASK != context;
        trace!(context, previous, changed_hands, "lock granted");
        Ok(LockGrant { changed_hands })
    }

    fn unlock(&mut self, context: u32) -> Result<()> {
        let mut k = self.kernel();
        let word = k.sarea.lock_word();
        if word & LOCK_HELD == 0 || word & LOCK_CONTEXT_MASK != context {
            return Err(DrmError::Unlock {
                reason: format!("context {context} does not hold the lock (word {word:#x})"),
            });
        }
        k.sarea.release_lock(context);
        k.counters.unlocks += 1;
        Ok(())
    }

    fn get_param(&mut self, param: Param) -> Result<u32> {
        let mut k = self.kernel();
        k.counters.param_reads += 1;
        let advance = k.advance_on_poll;
        let k = &mut *k;
        let value = match param {
            Param::LastFrame => poll_counter(k.frames_requested, &mut k.frames_completed, advance),
            Param::LastClear => poll_counter(k.clears_requested, &mut k.clears_completed, advance),
            Param::LastDispatch => {
                poll_counter(k.dispatch_requested, &mut k.dispatch_completed, advance)
            }
        };
        Ok(value)
    }

    fn irq_emit(&mut self) -> Result<u32> {
        let mut k = self.kernel();
        k.require_lock("irq emit")?;
        let seq = k.next_irq_seq;
        k.next_irq_seq = k.next_irq_seq.wrapping_add(1);
        k.counters.irq_emits += 1;
        Ok(seq)
    }

    fn irq_wait(&mut self, sequence: u32) -> Result<()> {
        let mut k = self.kernel();
        k.counters.irq_waits += 1;
        if k.irq_interruptions_left > 0 {
            k.irq_interruptions_left -= 1;
            return Err(DrmError::Interrupted);
        }
        k.retire_all();
        trace!(sequence, "irq wait complete");
        Ok(())
    }

    fn cp_idle(&mut self) -> Result<()> {
        let mut k = self.kernel();
        k.counters.idle_polls += 1;
        if k.cp_busy_polls_left > 0 {
            k.cp_busy_polls_left -= 1;
            return Err(DrmError::Busy);
        }
        k.retire_all();
        Ok(())
    }

    fn dma_acquire(&mut self) -> Result<DmaSlot> {
        let mut k = self.kernel();
        k.require_lock("dma acquire")?;
        let index = k.free_dma.pop_front().ok_or(DrmError::NoDmaBuffer)?;
        k.leased[usize::from(index)] = true;
        Ok(DmaSlot {
            index,
            size: k.dma_buffer_size,
        })
    }

    fn swap(&mut self, cliprects: &[ClipRect]) -> Result<()> {
        let mut k = self.kernel();
        k.require_lock("swap")?;
        if cliprects.len() > SAREA_NR_CLIPRECTS {
            return Err(DrmError::Swap {
                reason: format!("{} boxes in one swap batch", cliprects.len()),
            });
        }
        k.frames_requested = k.frames_requested.wrapping_add(1);
        let seq = k.frames_requested;
        k.sarea.set_last_frame(seq);
        k.counters.swaps += 1;
        Ok(())
    }

    fn clear(&mut self, args: &ClearArgs, cliprects: &[ClipRect]) -> Result<()> {
        let mut k = self.kernel();
        k.require_lock("clear")?;
        if cliprects.len() > SAREA_NR_CLIPRECTS {
            return Err(DrmError::Clear {
                reason: format!("{} boxes in one clear batch", cliprects.len()),
            });
        }
        k.clears_requested = k.clears_requested.wrapping_add(1);
        let seq = k.clears_requested;
        k.sarea.set_last_clear(seq);
        k.last_clear_args = Some(*args);
        k.counters.clears += 1;
        Ok(())
    }

    fn usleep(&mut self, micros: u32) {
        let mut k = self.kernel();
        k.counters.usleeps += 1;
        k.virtual_micros += u64::from(micros);
    }
}
