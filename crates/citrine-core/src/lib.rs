//! Command submission and resource lifetime core of the Citrine driver.
//!
//! The crate models the client half of a legacy direct-rendering driver:
//! commands accumulate CPU-side in a [`CmdBuf`] and reach the kernel as one
//! stream per flush; pre-encoded state atoms ([`state`]) are replayed at
//! the head of every fresh buffer; the global hardware lock ([`lock`])
//! detects other contexts touching the chip; DMA buffers ([`dma`]) and
//! buffer objects ([`bo`]) are recycled only after the engine is provably
//! done with them; and the swap path ([`context`]) throttles the CPU to
//! stay at most one frame ahead. [`CitrineContext`] ties all of it to a
//! [`DrmDevice`](citrine_drm::DrmDevice) and a [`WindowSystem`].
//!
//! Rendering itself (vertex formats, register values, shader state) lives
//! above this crate; everything here is about *when* bytes move and *who*
//! may reuse them.

#![forbid(unsafe_code)]

pub mod bo;
pub mod chip;
pub mod cmdbuf;
pub mod config;
pub mod context;
pub mod dma;
pub mod error;
pub mod lock;
pub mod miptree;
pub mod state;
pub mod texture;
pub mod throttle;
pub mod winsys;

pub use citrine_drm as drm;

pub use crate::bo::{BoDomain, BoFlags, BoHandle, BoManager};
pub use crate::chip::{Cn100, Cn200, HwGeneration};
pub use crate::cmdbuf::{Batch, CmdBuf};
pub use crate::config::{DebugFlags, DriverOptions, ThrottleMode};
pub use crate::context::CitrineContext;
pub use crate::dma::{DmaPool, DmaRegion};
pub use crate::error::{Error, Result};
pub use crate::lock::HardwareLock;
pub use crate::miptree::Miptree;
pub use crate::state::{AtomPolicy, StateAtom, StateList};
pub use crate::texture::{TexBacking, TexImage, TexObj};
pub use crate::throttle::FrameThrottle;
pub use crate::winsys::{StaticWindowSystem, VblankWait, WindowSystem};
