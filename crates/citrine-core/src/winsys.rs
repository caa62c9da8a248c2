//! Window-system services the swap path depends on.
//!
//! The core does not speak to a display server; it asks this trait for the
//! drawable's cliprects, for vertical-blank waits, and for the system time
//! (UST) used in swap statistics. Cliprects come back as a snapshot because
//! the window system owns them and can change them at any moment; the
//! context re-snapshots when the shared-area drawable stamp moves.
//! [`StaticWindowSystem`] is the scriptable implementation the tests use.

use std::cell::RefCell;
use std::rc::Rc;

use citrine_drm::ClipRect;

/// Result of waiting for the next vertical blank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VblankWait {
    /// The wait returned after the frame it was aimed at had already
    /// passed.
    pub missed_target: bool,
    /// System time when the wait returned, in microseconds.
    pub ust: i64,
}

pub trait WindowSystem {
    /// Snapshot of the drawable's cliprects, in screen space.
    fn cliprects(&self) -> Vec<ClipRect>;

    /// Block until the swap's target vertical blank.
    fn wait_for_vblank(&mut self) -> VblankWait;

    /// System time in microseconds.
    fn ust_now(&mut self) -> i64;
}

#[derive(Debug)]
struct StaticInner {
    rects: Vec<ClipRect>,
    ust: i64,
    frame_micros: i64,
    miss_next: bool,
}

/// A fixed drawable with a virtual clock. One vblank advances the clock by
/// a 60 Hz frame. Clones share state, so a test keeps one handle while the
/// context owns another.
#[derive(Debug, Clone)]
pub struct StaticWindowSystem {
    inner: Rc<RefCell<StaticInner>>,
}

impl StaticWindowSystem {
    pub fn new(rects: Vec<ClipRect>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(StaticInner {
                rects,
                ust: 0,
                frame_micros: 16_667,
                miss_next: false,
            })),
        }
    }

    /// Replace the drawable's cliprects, as a window move or resize would.
    pub fn set_cliprects(&self, rects: Vec<ClipRect>) {
        self.inner.borrow_mut().rects = rects;
    }

    /// Make the next vblank wait report a missed target.
    pub fn miss_next_vblank(&self) {
        self.inner.borrow_mut().miss_next = true;
    }
}

impl WindowSystem for StaticWindowSystem {
    fn cliprects(&self) -> Vec<ClipRect> {
        self.inner.borrow().rects.clone()
    }

    fn wait_for_vblank(&mut self) -> VblankWait {
        let mut inner = self.inner.borrow_mut();
        inner.ust += inner.frame_micros;
        VblankWait {
            missed_target: std::mem::take(&mut inner.miss_next),
            ust: inner.ust,
        }
    }

    fn ust_now(&mut self) -> i64 {
        self.inner.borrow().ust
    }
}
