use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use crate::error::Result;

/// A connected, bidirectional byte stream.
///
/// This is the only thing the frame and connection layers need from a link:
/// blocking reads that honour a timeout, blocking writes, and the ability to
/// split the stream into an independent reader and writer handle.
///
/// A read that times out must surface as an `io::Error` of kind
/// `WouldBlock` or `TimedOut`; the link driver treats both as "no data yet".
pub trait ByteStream: Read + Write + Send + 'static {
    /// Set the read timeout for subsequent reads. `None` blocks indefinitely.
    fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()>;

    /// Set the write timeout for subsequent writes. `None` blocks indefinitely.
    fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()>;

    /// Create an independent handle to the same underlying stream.
    fn try_clone_stream(&self) -> Result<Box<dyn ByteStream>>;

    /// Short human-readable description for diagnostics.
    fn describe(&self) -> String {
        "byte-stream".to_string()
    }
}

impl ByteStream for TcpStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        TcpStream::set_read_timeout(self, timeout).map_err(Into::into)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        TcpStream::set_write_timeout(self, timeout).map_err(Into::into)
    }

    fn try_clone_stream(&self) -> Result<Box<dyn ByteStream>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn describe(&self) -> String {
        match self.peer_addr() {
            Ok(addr) => format!("socket://{addr}"),
            Err(_) => "socket://<disconnected>".to_string(),
        }
    }
}

#[cfg(unix)]
impl ByteStream for std::os::unix::net::UnixStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        std::os::unix::net::UnixStream::set_read_timeout(self, timeout).map_err(Into::into)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        std::os::unix::net::UnixStream::set_write_timeout(self, timeout).map_err(Into::into)
    }

    fn try_clone_stream(&self) -> Result<Box<dyn ByteStream>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn describe(&self) -> String {
        match self.peer_addr().ok().and_then(|a| a.as_pathname().map(|p| p.to_path_buf())) {
            Some(path) => format!("unix://{}", path.display()),
            None => "unix://<unnamed>".to_string(),
        }
    }
}

impl ByteStream for Box<dyn ByteStream> {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        (**self).set_read_timeout(timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        (**self).set_write_timeout(timeout)
    }

    fn try_clone_stream(&self) -> Result<Box<dyn ByteStream>> {
        (**self).try_clone_stream()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::io::ErrorKind;
    use std::os::unix::net::UnixStream;

    use super::*;

    #[test]
    fn cloned_unix_handles_share_the_stream() {
        let (left, mut right) = UnixStream::pair().unwrap();
        let mut writer = left.try_clone_stream().unwrap();

        writer.write_all(b"boot").unwrap();
        let mut buf = [0u8; 4];
        right.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"boot");
    }

    #[test]
    fn read_timeout_surfaces_as_would_block() {
        let (left, _right) = UnixStream::pair().unwrap();
        let mut boxed: Box<dyn ByteStream> = Box::new(left);
        boxed
            .set_read_timeout(Some(Duration::from_millis(10)))
            .unwrap();

        let mut buf = [0u8; 1];
        let err = boxed.read(&mut buf).unwrap_err();
        assert!(matches!(
            err.kind(),
            ErrorKind::WouldBlock | ErrorKind::TimedOut
        ));
    }

    #[test]
    fn describe_unnamed_pair() {
        let (left, _right) = UnixStream::pair().unwrap();
        assert_eq!(left.describe(), "unix://<unnamed>");
    }
}
