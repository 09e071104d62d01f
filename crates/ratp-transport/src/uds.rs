use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::traits::ByteStream;

/// Unix domain socket link endpoint.
///
/// Used by emulators that expose a virtual UART as a Unix socket, and by the
/// `listen` side of the CLI. The socket file is removed on drop if it is still
/// the one this listener created.
pub struct UnixLinkListener {
    listener: UnixListener,
    path: PathBuf,
    created_inode: Option<(u64, u64)>,
}

impl UnixLinkListener {
    /// Maximum socket path length.
    /// Unix `sockaddr_un.sun_path` is 108 bytes on Linux, 104 on macOS.
    #[cfg(target_os = "linux")]
    const MAX_PATH_LEN: usize = 108;
    #[cfg(not(target_os = "linux"))]
    const MAX_PATH_LEN: usize = 104;

    /// Bind and listen on a filesystem-path Unix domain socket.
    ///
    /// A stale socket file at `path` is removed first; any other kind of file
    /// is left alone and reported as a bind error.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let target = format!("unix://{}", path.display());

        if path.as_os_str().len() >= Self::MAX_PATH_LEN {
            return Err(TransportError::Bind {
                target,
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("socket path longer than {} bytes", Self::MAX_PATH_LEN - 1),
                ),
            });
        }

        if let Ok(metadata) = std::fs::symlink_metadata(&path) {
            if metadata.file_type().is_socket() {
                debug!(?path, "removing stale socket");
                std::fs::remove_file(&path).map_err(|e| TransportError::Bind {
                    target: target.clone(),
                    source: e,
                })?;
            } else {
                return Err(TransportError::Bind {
                    target,
                    source: std::io::Error::new(
                        std::io::ErrorKind::AlreadyExists,
                        "existing path is not a unix socket",
                    ),
                });
            }
        }

        let listener = UnixListener::bind(&path).map_err(|e| TransportError::Bind {
            target: target.clone(),
            source: e,
        })?;
        let created_inode = std::fs::symlink_metadata(&path)
            .ok()
            .map(|m| (m.dev(), m.ino()));

        info!(?path, "waiting for a link on unix socket");

        Ok(Self {
            listener,
            path,
            created_inode,
        })
    }

    /// Accept one incoming link (blocking).
    pub fn accept(&self) -> Result<Box<dyn ByteStream>> {
        let (stream, _addr) = self.listener.accept().map_err(TransportError::Accept)?;
        debug!(path = ?self.path, "accepted link");
        Ok(Box::new(stream))
    }

    /// Connect to a listening Unix domain socket (blocking).
    pub fn connect(path: impl AsRef<Path>) -> Result<Box<dyn ByteStream>> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path).map_err(|e| TransportError::Connect {
            target: format!("unix://{}", path.display()),
            source: e,
        })?;
        debug!(?path, "connected to unix socket link");
        Ok(Box::new(stream))
    }

    /// The path this listener is bound to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for UnixLinkListener {
    fn drop(&mut self) {
        let Some((dev, ino)) = self.created_inode else {
            return;
        };
        if let Ok(metadata) = std::fs::symlink_metadata(&self.path) {
            if metadata.file_type().is_socket() && metadata.dev() == dev && metadata.ino() == ino
            {
                debug!(path = ?self.path, "cleaning up socket file");
                let _ = std::fs::remove_file(&self.path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use super::*;

    fn sock_path(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("ratp-uds-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join("link.sock")
    }

    #[test]
    fn bind_accept_connect() {
        let path = sock_path("accept");
        let listener = UnixLinkListener::bind(&path).unwrap();
        assert!(path.exists());

        let connect_path = path.clone();
        let client = std::thread::spawn(move || {
            let mut stream = UnixLinkListener::connect(&connect_path).unwrap();
            stream.write_all(b"hello").unwrap();
        });

        let mut server = listener.accept().unwrap();
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        client.join().unwrap();

        drop(listener);
        assert!(!path.exists(), "socket file should be removed on drop");
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn bind_rejects_regular_file() {
        let path = sock_path("regular");
        std::fs::write(&path, b"not a socket").unwrap();

        let result = UnixLinkListener::bind(&path);
        assert!(matches!(result, Err(TransportError::Bind { .. })));
        assert!(path.exists());

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn bind_rejects_overlong_path() {
        let path = format!("/tmp/{}.sock", "a".repeat(200));
        assert!(matches!(
            UnixLinkListener::bind(&path),
            Err(TransportError::Bind { .. })
        ));
    }
}
