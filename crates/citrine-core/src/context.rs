//! The rendering context: one client's view of the chip.
//!
//! Everything here follows the same discipline. CPU-side work accumulates
//! in the command buffer with no kernel involvement; any operation that
//! touches shared hardware takes the global lock, and the lock coming back
//! from another context invalidates every cached assumption (hardware
//! state, cliprects). Submission failures are not retried: a rejected
//! stream means the context's picture of the hardware is wrong, and the
//! error carries that verdict to the embedder.

use std::rc::Rc;
use std::sync::Arc;

use citrine_drm::cmd::dma_discard_header;
use citrine_drm::{
    ClearArgs, ClipRect, DmaSlot, DrmDevice, DrmError, Param, Sarea, Submission,
    SAREA_NR_CLIPRECTS,
};
use tracing::debug;

use crate::bo::{BoHandle, BoManager};
use crate::chip::HwGeneration;
use crate::cmdbuf::{Batch, CmdBuf, CMDBUF_SAFETY_MARGIN};
use crate::config::{DebugFlags, DriverOptions, ThrottleMode};
use crate::dma::{DmaBuffer, DmaPool, DmaRegion, DMA_RELEASE_FLUSH_THRESHOLD};
use crate::error::{Error, Result};
use crate::lock::HardwareLock;
use crate::state::StateList;
use crate::texture::{TexImage, TexObj};
use crate::throttle::{
    frame_behind, FrameThrottle, IRQ_EMIT_BUDGET, MAX_OUTSTANDING_CLEARS, THROTTLE_SLEEP_MICROS,
};
use crate::winsys::WindowSystem;

/// Busy polls per round while waiting for engine idle.
pub const IDLE_BUSY_RETRIES: u32 = 16;

/// Rounds of busy polls before the engine is declared unresponsive.
pub const IDLE_TIMEOUT_ROUNDS: u32 = 512;

pub struct CitrineContext {
    options: DriverOptions,
    device: Box<dyn DrmDevice>,
    sarea: Arc<Sarea>,
    winsys: Box<dyn WindowSystem>,
    generation: Box<dyn HwGeneration>,
    lock: HardwareLock,
    cmdbuf: CmdBuf,
    atoms: StateList,
    dma: DmaPool,
    throttle: FrameThrottle,
    cliprects: Vec<ClipRect>,
    drawable_stamp: u32,
    referenced: Vec<BoHandle>,
    lost_context: bool,
}

impl CitrineContext {
    pub fn new(
        context_id: u32,
        options: DriverOptions,
        device: Box<dyn DrmDevice>,
        sarea: Arc<Sarea>,
        winsys: Box<dyn WindowSystem>,
        generation: Box<dyn HwGeneration>,
    ) -> Self {
        let mut atoms = generation.build_state_list();
        // Nothing is known about the hardware yet: full emission up front.
        atoms.mark_all_dirty();
        let cmdbuf = CmdBuf::new(options.cmdbuf_dwords_hint, atoms.max_emit());
        let cliprects = winsys.cliprects();
        let drawable_stamp = sarea.drawable_stamp();
        let lock = HardwareLock::new(context_id, Arc::clone(&sarea));
        Self {
            options,
            device,
            sarea,
            winsys,
            generation,
            lock,
            cmdbuf,
            atoms,
            dma: DmaPool::new(),
            throttle: FrameThrottle::default(),
            cliprects,
            drawable_stamp,
            referenced: Vec::new(),
            lost_context: true,
        }
    }

    fn debug_enabled(&self, flag: DebugFlags) -> bool {
        self.options.debug.contains(flag)
    }

    pub fn options(&self) -> &DriverOptions {
        &self.options
    }

    pub fn cmdbuf(&self) -> &CmdBuf {
        &self.cmdbuf
    }

    pub fn atoms(&self) -> &StateList {
        &self.atoms
    }

    pub fn atoms_mut(&mut self) -> &mut StateList {
        &mut self.atoms
    }

    pub fn dma_pool(&self) -> &DmaPool {
        &self.dma
    }

    pub fn throttle_stats(&self) -> &FrameThrottle {
        &self.throttle
    }

    pub fn cliprects(&self) -> &[ClipRect] {
        &self.cliprects
    }

    /// Hardware state is unknown and will be fully re-emitted.
    pub fn context_lost(&self) -> bool {
        self.lost_context
    }

    // ------------------------------------------------------------------
    // Hardware lock
    // ------------------------------------------------------------------

    fn lock_hardware(&mut self) -> Result<()> {
        let acquire = self.lock.acquire(self.device.as_mut())?;
        if acquire.changed_hands {
            if self.debug_enabled(DebugFlags::SYNC) {
                debug!("hardware lock changed hands");
            }
            self.generation.lock_regained(&mut self.atoms);
            self.lost_context = true;
            self.refresh_cliprects();
        }
        let stamp = self.sarea.drawable_stamp();
        if stamp != self.drawable_stamp {
            self.refresh_cliprects();
        }
        Ok(())
    }

    fn unlock_hardware(&mut self) -> Result<()> {
        self.lock.release(self.device.as_mut())
    }

    fn unlock_if_held(&mut self) -> Result<()> {
        if self.lock.is_held() {
            self.unlock_hardware()
        } else {
            Ok(())
        }
    }

    fn refresh_cliprects(&mut self) {
        self.cliprects = self.winsys.cliprects();
        self.drawable_stamp = self.sarea.drawable_stamp();
    }

    // ------------------------------------------------------------------
    // Command buffer
    // ------------------------------------------------------------------

    /// Make room for a request of `dwords`, flushing first when the fill
    /// level (plus the safety margin) or the kernel's hint demands it.
    /// Returns whether a flush happened. A request that cannot fit even in
    /// an empty buffer is a caller error.
    pub fn ensure_space(&mut self, dwords: u32) -> Result<bool> {
        assert!(
            dwords + CMDBUF_SAFETY_MARGIN <= self.cmdbuf.capacity(),
            "request of {dwords} dwords exceeds the command buffer"
        );
        let overflow =
            self.cmdbuf.used() + dwords + CMDBUF_SAFETY_MARGIN > self.cmdbuf.capacity();
        if overflow || self.device.stream_needs_flush() {
            self.flush()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Reserve `dwords` for one hardware packet, flushing first if needed.
    /// With `emit_state` set and the buffer empty after the space check,
    /// dirty state atoms are replayed ahead of the reservation so the
    /// packet lands behind current state.
    pub fn begin_batch(&mut self, dwords: u32, emit_state: bool) -> Result<Batch<'_>> {
        let state_dwords = if emit_state { self.atoms.max_emit() } else { 0 };
        self.ensure_space(dwords + state_dwords)?;
        if emit_state && self.cmdbuf.is_empty() {
            self.emit_state();
        }
        Ok(self.cmdbuf.begin(dwords))
    }

    /// Replay every dirty state atom into the command buffer. The buffer
    /// is sized to always fit a full emission.
    pub fn emit_state(&mut self) {
        if !self.atoms.any_dirty() {
            return;
        }
        if self.debug_enabled(DebugFlags::STATE) {
            debug!(dwords = self.atoms.dirty_len(), "emitting state atoms");
        }
        self.atoms.emit_dirty(&mut self.cmdbuf);
        self.lost_context = false;
    }

    /// Submit the accumulated stream. Requires the hardware lock. The
    /// buffer is reset and all state pessimistically dirtied whether or not
    /// the kernel accepted the stream; a rejection is returned after the
    /// reset and is terminal for the context.
    pub fn flush_locked(&mut self) -> Result<()> {
        assert!(self.lock.is_held(), "flush requires the hardware lock");
        if self.cmdbuf.is_empty() {
            return Ok(());
        }
        self.cmdbuf.begin_flush()?;
        if self.debug_enabled(DebugFlags::IOCTL) {
            debug!(
                dwords = self.cmdbuf.used(),
                boxes = self.cliprects.len(),
                "submitting command buffer"
            );
        }
        if self.debug_enabled(DebugFlags::VERBOSE) {
            debug!(stream = ?self.cmdbuf.dwords(), "stream contents");
        }
        let boxes = self.cliprects.len().min(SAREA_NR_CLIPRECTS);
        let result = self.device.submit(Submission {
            stream: self.cmdbuf.dwords(),
            cliprects: &self.cliprects[..boxes],
        });
        if result.is_ok() {
            let age = self.sarea.last_dispatch();
            for bo in self.referenced.drain(..) {
                bo.mark_pending(age);
            }
        } else {
            self.referenced.clear();
        }
        self.cmdbuf.reset();
        self.dma.reset_released();
        self.atoms.mark_all_dirty();
        self.lost_context = true;
        self.cmdbuf.end_flush();
        result?;
        Ok(())
    }

    /// Take the lock, submit, release.
    pub fn flush(&mut self) -> Result<()> {
        self.lock_hardware()?;
        let result = self.flush_locked();
        let unlock = self.unlock_if_held();
        result?;
        unlock?;
        Ok(())
    }

    /// Submit only if something is buffered. The cheap "make it visible"
    /// barrier used before handing resources to another consumer.
    pub fn fire_vertices(&mut self) -> Result<()> {
        if !self.cmdbuf.is_empty() {
            self.flush()?;
        }
        Ok(())
    }

    /// Frontend flush: push out dirty state, then the buffer.
    pub fn flush_rendering(&mut self) -> Result<()> {
        if self.atoms.any_dirty() {
            self.ensure_space(self.atoms.dirty_len())?;
            self.emit_state();
        }
        if !self.cmdbuf.is_empty() {
            self.flush()?;
        }
        Ok(())
    }

    /// Mark a buffer as named by the stream being built. It will be
    /// stamped busy at the next flush.
    pub fn reference_bo(&mut self, bo: &BoHandle) {
        if !self.is_bo_referenced(bo) {
            self.referenced.push(bo.clone());
        }
    }

    pub fn is_bo_referenced(&self, bo: &BoHandle) -> bool {
        self.referenced.iter().any(|b| b.ptr_eq(bo))
    }

    // ------------------------------------------------------------------
    // Waits
    // ------------------------------------------------------------------

    /// Poll the engine to idle. Requires the hardware lock.
    pub fn wait_for_idle_locked(&mut self) -> Result<()> {
        debug_assert!(self.lock.is_held());
        for _ in 0..IDLE_TIMEOUT_ROUNDS {
            for _ in 0..IDLE_BUSY_RETRIES {
                match self.device.cp_idle() {
                    Ok(()) => return Ok(()),
                    Err(DrmError::Busy) => continue,
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Err(Error::EngineUnresponsive {
            polls: IDLE_TIMEOUT_ROUNDS * IDLE_BUSY_RETRIES,
        })
    }

    pub fn wait_for_idle(&mut self) -> Result<()> {
        self.lock_hardware()?;
        let result = self.wait_for_idle_locked();
        let unlock = self.unlock_if_held();
        result?;
        unlock?;
        Ok(())
    }

    fn wait_irq(&mut self, sequence: u32) -> Result<()> {
        loop {
            match self.device.irq_wait(sequence) {
                Ok(()) => return Ok(()),
                Err(DrmError::Interrupted) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn read_frame_age(&mut self) -> Result<u32> {
        Ok(self.device.get_param(Param::LastFrame)?)
    }

    fn spin_until_frame(&mut self, requested: u32) -> Result<()> {
        while frame_behind(self.read_frame_age()?, requested) {}
        Ok(())
    }

    /// Keep the CPU from racing more than a frame ahead of the display
    /// engine. Called with the lock held; in interrupt mode the lock is
    /// dropped around the blocking wait.
    fn wait_for_frame_completion(&mut self) -> Result<()> {
        debug_assert!(self.lock.is_held());
        let requested = self.sarea.last_frame();
        if self.debug_enabled(DebugFlags::SYNC) {
            debug!(requested, "waiting for frame completion");
        }
        match self.options.throttle {
            ThrottleMode::Irq => {
                if frame_behind(self.read_frame_age()?, requested) {
                    match self.throttle.pending_irq {
                        Some(sequence) if self.throttle.irqs_owed > 0 => {
                            self.unlock_hardware()?;
                            self.wait_irq(sequence)?;
                            self.lock_hardware()?;
                        }
                        _ => self.spin_until_frame(requested)?,
                    }
                    self.throttle.irqs_owed = IRQ_EMIT_BUDGET;
                }
                if self.throttle.irqs_owed > 0 {
                    let sequence = self.device.irq_emit()?;
                    self.throttle.pending_irq = Some(sequence);
                    self.throttle.irqs_owed -= 1;
                }
            }
            ThrottleMode::BusyWait => {
                while frame_behind(self.read_frame_age()?, requested) {
                    self.unlock_hardware()?;
                    self.device.usleep(THROTTLE_SLEEP_MICROS);
                    self.lock_hardware()?;
                }
            }
        }
        Ok(())
    }

    /// Drain the pipeline completely: flush, then wait for retirement by
    /// interrupt or by idle polling, per the throttle mode.
    pub fn finish(&mut self) -> Result<()> {
        self.flush_rendering()?;
        match self.options.throttle {
            ThrottleMode::Irq => {
                self.lock_hardware()?;
                let emitted = self.device.irq_emit().map_err(Error::from);
                let unlock = self.unlock_if_held();
                let sequence = emitted?;
                unlock?;
                self.wait_irq(sequence)
            }
            ThrottleMode::BusyWait => self.wait_for_idle(),
        }
    }

    // ------------------------------------------------------------------
    // Swap and clear
    // ------------------------------------------------------------------

    /// Present the back buffer: throttle, aim at the vertical blank, then
    /// blit every cliprect batch.
    pub fn swap_buffers(&mut self) -> Result<()> {
        if self.debug_enabled(DebugFlags::IOCTL) {
            debug!(frame = self.throttle.swap_count, "swap buffers");
        }
        self.fire_vertices()?;

        self.lock_hardware()?;
        let waited = self.wait_for_frame_completion();
        let unlock = self.unlock_if_held();
        waited?;
        unlock?;

        let vblank = self.winsys.wait_for_vblank();

        self.lock_hardware()?;
        let rects = self.cliprects.clone();
        let mut blit = Ok(());
        for batch in rects.chunks(SAREA_NR_CLIPRECTS) {
            blit = self.device.swap(batch);
            if blit.is_err() {
                break;
            }
        }
        let unlock = self.unlock_if_held();
        blit?;
        unlock?;

        self.throttle.swap_count += 1;
        let ust = self.winsys.ust_now();
        if vblank.missed_target {
            self.throttle.swap_missed_count += 1;
            self.throttle.swap_missed_ust = ust - self.throttle.swap_ust;
        }
        self.throttle.swap_ust = ust;
        Ok(())
    }

    /// Clear buffers over the drawable's cliprects, optionally restricted
    /// to one screen-space region.
    pub fn clear(&mut self, args: &ClearArgs, region: Option<ClipRect>) -> Result<()> {
        if args.flags.is_empty() {
            return Ok(());
        }
        if self.debug_enabled(DebugFlags::IOCTL) {
            debug!(flags = ?args.flags, "clear");
        }
        self.fire_vertices()?;
        // The kernel replays the clear against current hardware state.
        self.emit_state();

        self.lock_hardware()?;
        let result = self.clear_locked(args, region);
        let unlock = self.unlock_if_held();
        result?;
        unlock?;
        Ok(())
    }

    fn clear_locked(&mut self, args: &ClearArgs, region: Option<ClipRect>) -> Result<()> {
        loop {
            let completed = self.device.get_param(Param::LastClear)?;
            let backlog = self.sarea.last_clear().wrapping_sub(completed);
            if backlog <= MAX_OUTSTANDING_CLEARS {
                break;
            }
            self.unlock_hardware()?;
            self.device.usleep(THROTTLE_SLEEP_MICROS);
            self.lock_hardware()?;
        }
        self.flush_locked()?;
        let boxes: Vec<ClipRect> = match region {
            Some(bound) => self
                .cliprects
                .iter()
                .filter_map(|rect| rect.intersect(&bound))
                .collect(),
            None => self.cliprects.clone(),
        };
        for batch in boxes.chunks(SAREA_NR_CLIPRECTS) {
            self.device.clear(args, batch)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // DMA regions
    // ------------------------------------------------------------------

    /// Carve a region for streamed data, leasing a fresh buffer when the
    /// current one cannot take the request. A request larger than a whole
    /// buffer is a caller error.
    pub fn alloc_dma_region(&mut self, bytes: u32, alignment: u32) -> Result<DmaRegion> {
        if self.debug_enabled(DebugFlags::DMA) {
            debug!(bytes, alignment, "alloc dma region");
        }
        if let Some(region) = self.dma.carve(bytes, alignment) {
            return Ok(region);
        }
        self.refill_dma()?;
        let Some(region) = self.dma.carve(bytes, alignment) else {
            panic!("dma request of {bytes} bytes exceeds the buffer size");
        };
        Ok(region)
    }

    /// Drop a region. The last reference to a retired buffer queues the
    /// discard command that lets the kernel recycle it.
    pub fn release_dma_region(&mut self, region: DmaRegion) -> Result<()> {
        if self.debug_enabled(DebugFlags::DMA) {
            debug!(start = region.start(), end = region.end(), "release dma region");
        }
        self.release_dma_buffer(region.into_buffer())
    }

    fn release_dma_buffer(&mut self, buf: Rc<DmaBuffer>) -> Result<()> {
        if Rc::strong_count(&buf) == 1 {
            self.ensure_space(1)?;
            self.cmdbuf.push(dma_discard_header(buf.index()));
            self.dma.note_released();
        }
        Ok(())
    }

    fn refill_dma(&mut self) -> Result<()> {
        if let Some(buf) = self.dma.take_current() {
            self.release_dma_buffer(buf)?;
        }
        if self.dma.released_bufs() > DMA_RELEASE_FLUSH_THRESHOLD {
            self.flush()?;
        }
        self.lock_hardware()?;
        let leased = self.refill_dma_locked();
        let unlock = self.unlock_if_held();
        let slot = leased?;
        unlock?;
        self.dma.install(slot);
        Ok(())
    }

    /// Lease a buffer from the kernel pool, draining our own pipeline when
    /// the pool is dry: first push out pending discards, then wait for the
    /// engine to consume them.
    fn refill_dma_locked(&mut self) -> Result<DmaSlot> {
        match self.device.dma_acquire() {
            Ok(slot) => return Ok(slot),
            Err(DrmError::NoDmaBuffer) => {}
            Err(e) => return Err(e.into()),
        }
        self.flush_locked()?;
        match self.device.dma_acquire() {
            Ok(slot) => return Ok(slot),
            Err(DrmError::NoDmaBuffer) => {}
            Err(e) => return Err(e.into()),
        }
        self.wait_for_idle_locked()?;
        Ok(self.device.dma_acquire()?)
    }

    // ------------------------------------------------------------------
    // Textures
    // ------------------------------------------------------------------

    /// Install new image data, first flushing any queued commands that may
    /// still sample the storage being replaced.
    pub fn set_teximage(
        &mut self,
        tobj: &mut TexObj,
        face: u32,
        level: u32,
        image: TexImage,
    ) -> Result<()> {
        let replaced_tree = tobj
            .image(face, level)
            .and_then(TexImage::tree)
            .map(|tree| self.is_bo_referenced(tree.bo()))
            .unwrap_or(false);
        let object_tree = tobj
            .mt()
            .map(|tree| self.is_bo_referenced(tree.bo()))
            .unwrap_or(false);
        if replaced_tree || object_tree {
            if self.debug_enabled(DebugFlags::TEXTURE) {
                debug!(face, level, "texture storage is referenced, flushing");
            }
            self.fire_vertices()?;
        }
        tobj.set_image(face, level, image);
        Ok(())
    }

    /// Make a texture resident in a single miptree. `Ok(false)` is the
    /// software-fallback verdict, not an error.
    pub fn validate_texture(&mut self, manager: &BoManager, tobj: &mut TexObj) -> Result<bool> {
        let resident = crate::texture::validate_texture(self.device.as_mut(), manager, tobj)?;
        if !resident && self.debug_enabled(DebugFlags::FALLBACKS) {
            debug!("texture not resident, software rasterizer takes the draw");
        }
        Ok(resident)
    }
}
