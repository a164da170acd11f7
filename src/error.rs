//! Error taxonomy for the VPW dialog core.

use thiserror::Error;

/// Every fallible operation in the core fails with one of these.
///
/// The query engine (`crate::query`) is the place that most often needs to
/// distinguish `Refused` (routine bus noise, worth another receive attempt)
/// from everything else (propagate to the caller).
#[derive(Debug, Error)]
pub enum ObdError {
    /// Generic failure: checksum mismatch, invariant violation, or anything
    /// that doesn't fit a more specific variant.
    #[error("{0}")]
    Error(String),

    /// Frame too short for the mode it claims to carry.
    #[error("truncated frame: {0}")]
    Truncated(String),

    /// Frame decoded but its content did not match what the caller expected.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// No matching response arrived within the timeout budget.
    #[error("timed out waiting for a response")]
    Timeout,

    /// The operation's cancellation token was observed set.
    #[error("operation cancelled")]
    Cancelled,

    /// The PCM (or another module) returned a negative response.
    #[error("request refused, code 0x{0:02X}")]
    Refused(u8),

    /// A transport-level failure bubbled up from the device port.
    #[error("transport error")]
    Io(#[source] std::io::Error),
}

impl From<std::io::Error> for ObdError {
    fn from(e: std::io::Error) -> Self {
        ObdError::Io(e)
    }
}

pub type ObdResult<T> = Result<T, ObdError>;
