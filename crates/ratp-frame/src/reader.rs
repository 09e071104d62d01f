use std::io::{ErrorKind, Read};
use std::time::Duration;

use bytes::BytesMut;
use ratp_transport::{ByteStream, TransportError};
use tracing::trace;

use crate::codec::{decode_frame, Frame, FrameConfig};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 4 * 1024;
const READ_CHUNK_SIZE: usize = 4 * 1024;

/// Result of one link read.
#[derive(Debug)]
pub enum ReadOutcome {
    /// A frame whose checksums and structure are valid.
    Frame(Frame),
    /// Bytes were damaged in transit; the frame was discarded.
    Corrupt(FrameError),
    /// Checksums passed but the frame is structurally invalid.
    Malformed(FrameError),
    /// No complete frame arrived before the read timeout.
    Timeout,
}

/// Reads complete frames from any `Read` stream.
///
/// Handles partial reads and resynchronization internally. A run of header
/// check failures while rescanning one damaged region is reported as a
/// single `Corrupt` outcome.
pub struct FrameReader<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
    resyncing: bool,
    applied_timeout: Option<Option<Duration>>,
}

impl<T: Read> FrameReader<T> {
    /// Create a new frame reader with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame reader with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
            resyncing: false,
            applied_timeout: None,
        }
    }

    /// Read the next frame (blocking up to the stream's read timeout).
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when EOF is reached and
    /// `Err(FrameError::Io)` for any other stream failure.
    pub fn read_frame(&mut self) -> Result<ReadOutcome> {
        loop {
            match decode_frame(&mut self.buf, self.config.max_payload_size) {
                Ok(Some(frame)) => {
                    self.resyncing = false;
                    trace!(flags = ?frame.flags, seq = frame.seq, ack = frame.ack, len = frame.payload.len(), "rx frame");
                    return Ok(ReadOutcome::Frame(frame));
                }
                Ok(None) => {}
                Err(err @ FrameError::HeaderChecksum { .. }) => {
                    if !self.resyncing {
                        self.resyncing = true;
                        return Ok(ReadOutcome::Corrupt(err));
                    }
                    trace!(%err, "still resynchronizing");
                    continue;
                }
                Err(err @ FrameError::ChecksumMismatch { .. }) => {
                    self.resyncing = false;
                    return Ok(ReadOutcome::Corrupt(err));
                }
                Err(err @ (FrameError::Malformed(_) | FrameError::PayloadTooLarge { .. })) => {
                    return Ok(ReadOutcome::Malformed(err));
                }
                Err(err) => return Err(err),
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Ok(ReadOutcome::Timeout);
                }
                Err(err) => return Err(FrameError::Io(err)),
            };

            if read == 0 {
                return Err(FrameError::ConnectionClosed);
            }

            self.buf.extend_from_slice(&chunk[..read]);
        }
    }

    /// Bytes received but not yet consumed as frames.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Update maximum payload size for subsequent frame decoding.
    pub fn set_max_payload_size(&mut self, max_payload_size: usize) {
        self.config.max_payload_size = max_payload_size;
    }

    /// Current frame reader configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl<T: ByteStream> FrameReader<T> {
    /// Create a frame reader for a link and apply the read timeout from config.
    pub fn with_config_stream(inner: T, config: FrameConfig) -> Result<Self> {
        let timeout = config.read_timeout;
        let mut reader = Self::with_config(inner, config);
        reader.apply_timeout(timeout)?;
        Ok(reader)
    }

    /// Read the next frame, waiting at most `timeout` for bytes to arrive.
    ///
    /// `None` blocks until a frame, corruption, or end-of-stream.
    pub fn read_frame_timeout(&mut self, timeout: Option<Duration>) -> Result<ReadOutcome> {
        self.apply_timeout(timeout)?;
        self.read_frame()
    }

    fn apply_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        // A zero timeout is rejected by the OS.
        let timeout = timeout.map(|t| t.max(Duration::from_millis(1)));
        if self.applied_timeout != Some(timeout) {
            self.inner
                .set_read_timeout(timeout)
                .map_err(transport_to_frame_error)?;
            self.applied_timeout = Some(timeout);
        }
        Ok(())
    }
}

pub(crate) fn transport_to_frame_error(err: TransportError) -> FrameError {
    match err {
        TransportError::Io(io) | TransportError::Accept(io) => FrameError::Io(io),
        TransportError::Bind { source, .. } | TransportError::Connect { source, .. } => {
            FrameError::Io(source)
        }
        other => FrameError::Io(std::io::Error::other(other.to_string())),
    }
}
