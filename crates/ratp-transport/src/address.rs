use std::fmt;
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::str::FromStr;

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::traits::ByteStream;

/// Where a link lives.
///
/// Physical UARTs are normally exposed through a serial server (`ser2net`,
/// QEMU `-serial tcp:`) or a Unix socket (QEMU `-serial unix:`), which is
/// what these schemes cover. Opening a local tty device is the caller's job;
/// any type implementing [`ByteStream`] can be handed to the protocol layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkAddress {
    /// `socket://host:port`
    Tcp(String),
    /// `unix:///path/to/socket` or a bare path.
    Unix(PathBuf),
}

impl LinkAddress {
    /// Parse a link address.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(TransportError::InvalidAddress(input.to_string()));
        }

        if let Some(rest) = input.strip_prefix("socket://") {
            if rest.is_empty() || !rest.contains(':') {
                return Err(TransportError::InvalidAddress(input.to_string()));
            }
            return Ok(Self::Tcp(rest.to_string()));
        }

        if let Some(rest) = input.strip_prefix("unix://") {
            if rest.is_empty() {
                return Err(TransportError::InvalidAddress(input.to_string()));
            }
            return Ok(Self::Unix(PathBuf::from(rest)));
        }

        if input.contains("://") {
            return Err(TransportError::InvalidAddress(input.to_string()));
        }

        Ok(Self::Unix(PathBuf::from(input)))
    }

    /// Connect to the link (active side).
    pub fn connect(&self) -> Result<Box<dyn ByteStream>> {
        match self {
            Self::Tcp(target) => {
                let stream = TcpStream::connect(target).map_err(|e| TransportError::Connect {
                    target: self.to_string(),
                    source: e,
                })?;
                stream.set_nodelay(true)?;
                debug!(%target, "connected to serial server");
                Ok(Box::new(stream))
            }
            #[cfg(unix)]
            Self::Unix(path) => crate::uds::UnixLinkListener::connect(path),
            #[cfg(not(unix))]
            Self::Unix(_) => Err(TransportError::Unsupported(self.to_string())),
        }
    }

    /// Bind the address and accept exactly one peer (passive side).
    pub fn accept_one(&self) -> Result<Box<dyn ByteStream>> {
        match self {
            Self::Tcp(target) => {
                let listener = TcpListener::bind(target).map_err(|e| TransportError::Bind {
                    target: self.to_string(),
                    source: e,
                })?;
                info!(%target, "waiting for a link on tcp");
                let (stream, peer) = listener.accept().map_err(TransportError::Accept)?;
                stream.set_nodelay(true)?;
                debug!(%peer, "accepted link");
                Ok(Box::new(stream))
            }
            #[cfg(unix)]
            Self::Unix(path) => {
                let listener = crate::uds::UnixLinkListener::bind(path)?;
                listener.accept()
            }
            #[cfg(not(unix))]
            Self::Unix(_) => Err(TransportError::Unsupported(self.to_string())),
        }
    }
}

impl FromStr for LinkAddress {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for LinkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(target) => write!(f, "socket://{target}"),
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}
