//! Driver options and debug-channel flags.

use bitflags::bitflags;
use tracing::warn;

/// Default command buffer size hint, in dwords.
pub const DEFAULT_CMDBUF_DWORDS: u32 = 2048;

bitflags! {
    /// Debug channels. Logging in hot paths is gated on these so the cost
    /// of an unconditional log call never lands on the submission path.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DebugFlags: u32 {
        const IOCTL = 1 << 0;
        const DMA = 1 << 1;
        const STATE = 1 << 2;
        const TEXTURE = 1 << 3;
        const SYNC = 1 << 4;
        const VERBOSE = 1 << 5;
        const FALLBACKS = 1 << 6;
    }
}

impl DebugFlags {
    /// Parse a comma-separated channel list, e.g. `"ioctl,dma"`. Unknown
    /// names are skipped with a warning so a typo never disables the run.
    pub fn from_names(names: &str) -> Self {
        let mut flags = Self::empty();
        for name in names.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            match name {
                "ioctl" => flags |= Self::IOCTL,
                "dma" => flags |= Self::DMA,
                "state" => flags |= Self::STATE,
                "texture" | "tex" => flags |= Self::TEXTURE,
                "sync" => flags |= Self::SYNC,
                "verbose" => flags |= Self::VERBOSE,
                "fallbacks" | "fall" => flags |= Self::FALLBACKS,
                "all" => flags |= Self::all(),
                other => warn!(channel = other, "unknown debug channel"),
            }
        }
        flags
    }
}

/// How the swap path paces itself against the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleMode {
    /// Sleep on engine interrupts, spending one emitted interrupt per frame.
    Irq,
    /// Poll the frame counter with short sleeps. Fallback for kernels
    /// without working interrupt delivery.
    BusyWait,
}

/// Per-context configuration, fixed at creation.
#[derive(Debug, Clone)]
pub struct DriverOptions {
    /// Requested command buffer size in dwords. Clamped so that two full
    /// state emissions always fit.
    pub cmdbuf_dwords_hint: u32,
    pub throttle: ThrottleMode,
    pub debug: DebugFlags,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            cmdbuf_dwords_hint: DEFAULT_CMDBUF_DWORDS,
            throttle: ThrottleMode::Irq,
            debug: DebugFlags::empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parses_debug_channel_names() {
        assert_eq!(
            DebugFlags::from_names("ioctl, dma,tex"),
            DebugFlags::IOCTL | DebugFlags::DMA | DebugFlags::TEXTURE
        );
        assert_eq!(DebugFlags::from_names(""), DebugFlags::empty());
        assert_eq!(DebugFlags::from_names("fall"), DebugFlags::FALLBACKS);
        assert_eq!(DebugFlags::from_names("all"), DebugFlags::all());
        // Unknown names are ignored, known ones still apply.
        assert_eq!(DebugFlags::from_names("bogus,sync"), DebugFlags::SYNC);
    }
}
