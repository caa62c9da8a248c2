use thiserror::Error;

use crate::cmd::CmdStreamError;

pub type Result<T> = std::result::Result<T, DrmError>;

/// Errors surfaced by the kernel interface.
///
/// The distinction that matters to callers is retriable vs. terminal:
/// [`DrmError::Busy`] and [`DrmError::Interrupted`] are ordinary outcomes of
/// polling primitives and are expected to be retried, [`DrmError::NoDmaBuffer`]
/// is recoverable by flushing and draining, and everything else means the
/// submission path itself failed.
#[derive(Debug, Error)]
pub enum DrmError {
    /// The command-stream submission ioctl was rejected.
    #[error("command stream rejected: {reason}")]
    Submission { reason: String },

    /// The stream handed to the kernel did not parse.
    #[error("malformed command stream: {0}")]
    MalformedStream(#[from] CmdStreamError),

    /// The blocking lock ioctl failed outright (not contention, which it
    /// waits out).
    #[error("hardware lock wait failed: {reason}")]
    LockWait { reason: String },

    /// The unlock ioctl was rejected, e.g. the caller did not hold the lock.
    #[error("hardware unlock failed: {reason}")]
    Unlock { reason: String },

    /// An ioctl that requires the hardware lock was issued without it.
    #[error("{op} requires the hardware lock")]
    LockRequired { op: &'static str },

    /// A parameter query was rejected.
    #[error("parameter query failed: {reason}")]
    Param { reason: String },

    /// The engine still has work outstanding; poll again.
    #[error("engine busy")]
    Busy,

    /// A blocking wait was interrupted before the condition was reached;
    /// retry the wait.
    #[error("wait interrupted")]
    Interrupted,

    /// The interrupt-emit ioctl failed.
    #[error("irq emit failed: {reason}")]
    IrqEmit { reason: String },

    /// No DMA buffer is free right now.
    #[error("no free dma buffer")]
    NoDmaBuffer,

    /// The swap ioctl was rejected.
    #[error("swap rejected: {reason}")]
    Swap { reason: String },

    /// The clear ioctl was rejected.
    #[error("clear rejected: {reason}")]
    Clear { reason: String },
}
