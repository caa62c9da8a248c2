//! Frame-throttle bookkeeping.
//!
//! The swap path keeps the CPU at most a frame or so ahead of the display
//! engine. In interrupt mode it spends one emitted interrupt per frame out
//! of a budget that refills whenever it actually has to block; the budget
//! running out means the engine is keeping up and the wait degrades to a
//! cheap poll. The loops that consume this state live in
//! [`CitrineContext`](crate::context::CitrineContext).

/// Interrupts the swap path may emit between blocking waits.
pub const IRQ_EMIT_BUDGET: u32 = 10;

/// Upper bound on clears queued ahead of the engine.
pub const MAX_OUTSTANDING_CLEARS: u32 = 256;

/// Sleep between throttle polls.
pub const THROTTLE_SLEEP_MICROS: u32 = 1;

/// `true` while the engine has not yet displayed frame `requested`.
pub fn frame_behind(completed: u32, requested: u32) -> bool {
    requested.wrapping_sub(completed) as i32 > 0
}

/// Per-context throttle state and swap statistics.
#[derive(Debug)]
pub struct FrameThrottle {
    pub(crate) irqs_owed: u32,
    pub(crate) pending_irq: Option<u32>,
    pub(crate) swap_count: u64,
    pub(crate) swap_missed_count: u64,
    pub(crate) swap_ust: i64,
    pub(crate) swap_missed_ust: i64,
}

impl Default for FrameThrottle {
    fn default() -> Self {
        Self {
            irqs_owed: IRQ_EMIT_BUDGET,
            pending_irq: None,
            swap_count: 0,
            swap_missed_count: 0,
            swap_ust: 0,
            swap_missed_ust: 0,
        }
    }
}

impl FrameThrottle {
    /// Interrupts still in the emit budget.
    pub fn irqs_owed(&self) -> u32 {
        self.irqs_owed
    }

    pub fn swap_count(&self) -> u64 {
        self.swap_count
    }

    pub fn swap_missed_count(&self) -> u64 {
        self.swap_missed_count
    }

    /// Time of the most recent swap, in microseconds of system time.
    pub fn swap_ust(&self) -> i64 {
        self.swap_ust
    }

    /// Distance from the previous swap when the last miss happened.
    pub fn swap_missed_ust(&self) -> i64 {
        self.swap_missed_ust
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_comparison_wraps() {
        assert!(frame_behind(0, 1));
        assert!(!frame_behind(1, 1));
        assert!(!frame_behind(2, 1));
        assert!(frame_behind(u32::MAX, 0));
        assert!(!frame_behind(0, u32::MAX));
    }
}
