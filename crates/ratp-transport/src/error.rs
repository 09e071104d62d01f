/// Errors that can occur at the byte-stream boundary.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to bind a listening endpoint.
    #[error("failed to bind to {target}: {source}")]
    Bind {
        target: String,
        source: std::io::Error,
    },

    /// Failed to connect to the specified endpoint.
    #[error("failed to connect to {target}: {source}")]
    Connect {
        target: String,
        source: std::io::Error,
    },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),

    /// An I/O error occurred on the stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The link address could not be parsed.
    #[error("invalid link address '{0}' (expected socket://host:port or unix:///path)")]
    InvalidAddress(String),

    /// The address scheme is not available on this platform.
    #[error("unsupported link address: {0}")]
    Unsupported(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;
