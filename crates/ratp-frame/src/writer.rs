use std::io::{ErrorKind, Write};

use bytes::BytesMut;
use ratp_transport::ByteStream;
use tracing::trace;

use crate::codec::{Frame, FrameConfig};
use crate::error::{FrameError, Result};
use crate::reader::transport_to_frame_error;

const INITIAL_BUFFER_CAPACITY: usize = 1024;

/// Writes complete frames to any `Write` stream.
///
/// One writer per link; the connection engine is its only user.
pub struct FrameWriter<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: Write> FrameWriter<T> {
    /// Create a new frame writer with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame writer with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Serialize and write a complete frame (blocking).
    pub fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        if frame.payload.len() > self.config.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: frame.payload.len(),
                max: self.config.max_payload_size,
            });
        }

        self.buf.clear();
        frame.encode(&mut self.buf)?;
        trace!(flags = ?frame.flags, seq = frame.seq, ack = frame.ack, len = frame.payload.len(), "tx frame");
        self.write_buffered()
    }

    /// Write raw bytes that are not a frame, such as injected line noise.
    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.buf.clear();
        self.buf.extend_from_slice(bytes);
        self.write_buffered()
    }

    fn write_buffered(&mut self) -> Result<()> {
        let mut offset = 0usize;
        while offset < self.buf.len() {
            match self.inner.write(&self.buf[offset..]) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }

        self.flush()
    }

    /// Flush the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Current frame writer configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl<T: ByteStream> FrameWriter<T> {
    /// Create a frame writer for a link and apply the write timeout from config.
    pub fn with_config_stream(inner: T, config: FrameConfig) -> Result<Self> {
        inner
            .set_write_timeout(config.write_timeout)
            .map_err(transport_to_frame_error)?;
        Ok(Self::with_config(inner, config))
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Read};

    use super::*;
    use crate::reader::{FrameReader, ReadOutcome};

    /// Writer that accepts at most `max` bytes per call.
    struct ChunkedWriter {
        out: Vec<u8>,
        max: usize,
        interrupted_once: bool,
    }

    impl Write for ChunkedWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if !self.interrupted_once {
                self.interrupted_once = true;
                return Err(ErrorKind::Interrupted.into());
            }
            let n = buf.len().min(self.max);
            self.out.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct ClosedWriter;

    impl Write for ClosedWriter {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Ok(0)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn write_then_read_back() {
        let frame = Frame::data(3, &b"getenv bootargs"[..], true);
        let mut writer = FrameWriter::new(Vec::new());
        writer.write_frame(&frame).unwrap();

        let mut reader = FrameReader::new(Cursor::new(writer.into_inner()));
        match reader.read_frame().unwrap() {
            ReadOutcome::Frame(got) => assert_eq!(got, frame),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn short_writes_and_interrupts_are_retried() {
        let frame = Frame::data(0, vec![0x5a; 100], false);
        let mut writer = FrameWriter::new(ChunkedWriter {
            out: Vec::new(),
            max: 7,
            interrupted_once: false,
        });
        writer.write_frame(&frame).unwrap();
        assert_eq!(writer.get_ref().out.len(), frame.wire_size());
    }

    #[test]
    fn zero_write_is_connection_closed() {
        let mut writer = FrameWriter::new(ClosedWriter);
        assert!(matches!(
            writer.write_frame(&Frame::ack(0)),
            Err(FrameError::ConnectionClosed)
        ));
    }

    #[test]
    fn rejects_payload_over_mtu() {
        let mut writer = FrameWriter::with_config(
            Vec::new(),
            FrameConfig {
                max_payload_size: 16,
                ..FrameConfig::default()
            },
        );
        let err = writer
            .write_frame(&Frame::data(0, vec![0u8; 17], true))
            .unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { size: 17, max: 16 }));
        assert!(writer.get_ref().is_empty());
    }

    #[test]
    fn write_raw_passes_bytes_through() {
        let mut writer = FrameWriter::new(Vec::new());
        writer.write_raw(b"\xff\x00noise").unwrap();
        let mut out = Vec::new();
        Cursor::new(writer.into_inner()).read_to_end(&mut out).unwrap();
        assert_eq!(out, b"\xff\x00noise");
    }
}
