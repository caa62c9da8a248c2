use thiserror::Error;

use citrine_drm::DrmError;

pub type Result<T> = std::result::Result<T, Error>;

/// Driver-core failures.
///
/// Retriable kernel outcomes ([`DrmError::Busy`],
/// [`DrmError::Interrupted`]) are consumed inside the core's wait loops and
/// never escape. Every error that does escape a context method leaves that
/// context unfit for further rendering; the embedder decides whether to tear
/// the context down or abandon the process.
#[derive(Debug, Error)]
pub enum Error {
    /// The kernel interface failed underneath a driver operation.
    #[error("kernel interface: {0}")]
    Drm(#[from] DrmError),

    /// The engine never went idle within the polling budget. Classic causes
    /// are a wedged command processor or a stream the hardware cannot parse.
    #[error("engine unresponsive after {polls} idle polls")]
    EngineUnresponsive { polls: u32 },

    /// A flush was requested while a flush was already in progress. The
    /// command buffer cannot be submitted and reset reentrantly.
    #[error("command buffer flushed from within a flush")]
    ReentrantFlush,
}
