//! Shared-area (SAREA) model.
//!
//! The SAREA is the page the legacy kernel driver shares with the window
//! system and with every direct-rendering client. Only the fields the
//! submission path actually touches are modeled here: the hardware lock word
//! and the retirement stamps the kernel publishes as it queues and completes
//! work.

use std::sync::atomic::{AtomicU32, Ordering};

/// Set while some context holds the hardware lock.
pub const LOCK_HELD: u32 = 0x8000_0000;
/// Set by the kernel when the lock was granted through the blocking ioctl,
/// i.e. the grant was contended and the release must go back through it.
pub const LOCK_CONTENDED: u32 = 0x4000_0000;
/// Low bits carry the id of the current holder while [`LOCK_HELD`] is set,
/// or of the most recent holder once it is clear.
pub const LOCK_CONTEXT_MASK: u32 = 0x3fff_ffff;

const _: () = assert!(LOCK_HELD & LOCK_CONTENDED == 0);
const _: () = assert!((LOCK_HELD | LOCK_CONTENDED) & LOCK_CONTEXT_MASK == 0);

/// Cliprect capacity of the shared-area box array. Operations that carry
/// boxes to the kernel hand them over at most this many at a time.
pub const SAREA_NR_CLIPRECTS: usize = 12;

/// The shared page. One instance is shared (via `Arc`) between every client
/// context and the device backing them.
///
/// Lock-word protocol: the word starts at 0. While context `c` holds the
/// lock the word is `LOCK_HELD | c`; when the kernel releases on `c`'s
/// behalf it leaves plain `c` behind. The uncontended fast path is therefore
/// a compare-and-swap that only succeeds if `c` was also the *previous*
/// holder, which is exactly what makes lost-context detection work: any
/// intervening holder forces the next acquisition through the kernel.
#[derive(Debug, Default)]
pub struct Sarea {
    lock: AtomicU32,
    last_frame: AtomicU32,
    last_clear: AtomicU32,
    last_dispatch: AtomicU32,
    drawable_stamp: AtomicU32,
}

impl Sarea {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uncontended acquisition attempt for `context`. Returns `true` on
    /// success; on failure the caller must fall back to the blocking lock
    /// ioctl.
    pub fn try_lock(&self, context: u32) -> bool {
        debug_assert_eq!(context & !LOCK_CONTEXT_MASK, 0);
        let held = LOCK_HELD | context;
        // Either we were the previous holder, or nobody has held it yet.
        self.lock
            .compare_exchange(context, held, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
            || self
                .lock
                .compare_exchange(0, held, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
    }

    pub fn lock_word(&self) -> u32 {
        self.lock.load(Ordering::SeqCst)
    }

    /// Kernel side of a contended grant: records `context` as holder and
    /// returns the previous word so the caller can tell whether the lock
    /// changed hands.
    pub fn grant_lock(&self, context: u32) -> u32 {
        self.lock
            .swap(LOCK_HELD | LOCK_CONTENDED | context, Ordering::SeqCst)
    }

    /// Kernel side of release: clears the held bits but leaves the holder id
    /// behind for the fast-path compare-and-swap.
    pub fn release_lock(&self, context: u32) {
        self.lock.store(context, Ordering::SeqCst);
    }

    /// Frame sequence number most recently queued by the kernel swap path.
    pub fn last_frame(&self) -> u32 {
        self.last_frame.load(Ordering::SeqCst)
    }

    pub fn set_last_frame(&self, seq: u32) {
        self.last_frame.store(seq, Ordering::SeqCst);
    }

    /// Clear sequence number most recently queued by the kernel clear path.
    pub fn last_clear(&self) -> u32 {
        self.last_clear.load(Ordering::SeqCst)
    }

    pub fn set_last_clear(&self, seq: u32) {
        self.last_clear.store(seq, Ordering::SeqCst);
    }

    /// Age stamp of the most recently accepted command stream.
    pub fn last_dispatch(&self) -> u32 {
        self.last_dispatch.load(Ordering::SeqCst)
    }

    pub fn set_last_dispatch(&self, age: u32) {
        self.last_dispatch.store(age, Ordering::SeqCst);
    }

    /// Bumped by the window system whenever drawable geometry changes.
    /// Clients compare it against their cached value after taking the lock
    /// and refetch cliprects on mismatch.
    pub fn drawable_stamp(&self) -> u32 {
        self.drawable_stamp.load(Ordering::SeqCst)
    }

    pub fn bump_drawable_stamp(&self) {
        self.drawable_stamp.fetch_add(1, Ordering::SeqCst);
    }
}
