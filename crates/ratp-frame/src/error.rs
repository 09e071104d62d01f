/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The header check byte does not match the header.
    #[error("header check mismatch (expected 0x{expected:02x}, got 0x{actual:02x})")]
    HeaderChecksum { expected: u8, actual: u8 },

    /// The CRC-32 trailer does not match the frame contents.
    #[error("frame checksum mismatch (expected 0x{expected:08x}, got 0x{actual:08x})")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// The checksums pass but the frame is structurally invalid.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The link reached end-of-stream.
    #[error("connection closed")]
    ConnectionClosed,
}

impl FrameError {
    /// Whether this error means the bytes on the wire were damaged in transit.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::HeaderChecksum { .. } | Self::ChecksumMismatch { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
