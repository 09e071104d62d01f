use std::path::PathBuf;

use ratp_conn::ConnError;
use ratp_transport::TransportError;

use crate::packet::PacketType;

/// Errors that can occur in controller operations.
///
/// Remote failures (a non-zero command status, a missing variable) are
/// results, not errors.
#[derive(Debug, thiserror::Error)]
pub enum CtrlError {
    /// Connection-level error.
    #[error(transparent)]
    Conn(#[from] ConnError),

    /// The link could not be opened.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A packet could not be decoded.
    #[error("malformed packet: {0}")]
    Decode(String),

    /// A packet could not be encoded.
    #[error("cannot encode packet: {0}")]
    Encode(String),

    /// The remote answered with the wrong packet type.
    #[error("expected {expected:?} reply, got {actual:?}")]
    UnexpectedReply {
        expected: PacketType,
        actual: PacketType,
    },

    /// A stream consumer is already attached.
    #[error("stream consumer already attached")]
    AlreadyStarted,

    /// The export directory is unusable.
    #[error("cannot export {path}: {source}")]
    Export {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, CtrlError>;
