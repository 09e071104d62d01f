use std::time::Duration;

use ratp_frame::FrameError;
use ratp_transport::TransportError;

/// Errors surfaced by a connection.
///
/// `Clone` so one failure can be handed to every blocked caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnError {
    /// The peer violated the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A damaged frame was received. Recovered by retransmission and only
    /// visible through the CRC error counter.
    #[error("frame corruption detected")]
    CorruptionDetected,

    /// A frame was not acknowledged within the retry bound.
    #[error("no acknowledgement after {retries} retransmissions")]
    TransportTimeout { retries: u32 },

    /// The connection was closed locally or by the peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// The peer aborted the connection.
    #[error("connection reset by peer")]
    PeerReset,

    /// The underlying link failed.
    #[error("link error: {0}")]
    Link(String),

    /// A caller-supplied deadline passed.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The message exceeds the configured maximum size.
    #[error("message too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },
}

impl From<FrameError> for ConnError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::ConnectionClosed => Self::ConnectionClosed,
            FrameError::HeaderChecksum { .. } | FrameError::ChecksumMismatch { .. } => {
                Self::CorruptionDetected
            }
            FrameError::PayloadTooLarge { size, max } => Self::PayloadTooLarge { size, max },
            other => Self::Link(other.to_string()),
        }
    }
}

impl From<TransportError> for ConnError {
    fn from(err: TransportError) -> Self {
        Self::Link(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ConnError>;
