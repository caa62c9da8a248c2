//! Legacy DRM kernel interface for the Citrine driver.
//!
//! This crate holds everything the driver core needs to talk to the kernel
//! and nothing above it: the shared-area model ([`Sarea`]) with the
//! hardware-lock word protocol, the command-stream framing the kernel
//! parses ([`cmd`]), the device trait covering the legacy ioctl surface
//! ([`DrmDevice`]), and a deterministic in-process device for tests
//! ([`SoftDevice`]).

#![forbid(unsafe_code)]

pub mod cmd;
pub mod device;
pub mod error;
pub mod sarea;
pub mod soft;

pub use crate::cmd::{CmdStreamError, WaitFlags};
pub use crate::device::{
    ClearArgs, ClearFlags, ClipRect, DmaSlot, DrmDevice, LockGrant, Param, Submission,
};
pub use crate::error::{DrmError, Result};
pub use crate::sarea::{Sarea, LOCK_CONTEXT_MASK, LOCK_HELD, SAREA_NR_CLIPRECTS};
pub use crate::soft::{SoftCounters, SoftDevice, SoftDeviceConfig};
