use std::fmt;
use std::io;

use bbremote_ctrl::CtrlError;
use ratp_conn::ConnError;
use ratp_transport::TransportError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;
/// The reliable link failed: establishment, retransmit exhaustion, reset or
/// a protocol violation.
pub const LINK_ERROR: i32 = 127;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => TRANSPORT_ERROR,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Bind { source, .. }
        | TransportError::Connect { source, .. }
        | TransportError::Accept(source)
        | TransportError::Io(source) => io_error(context, source),
        TransportError::InvalidAddress(_) => CliError::new(USAGE, format!("{context}: {err}")),
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn conn_error(context: &str, err: ConnError) -> CliError {
    CliError::new(LINK_ERROR, format!("{context}: link error: {err}"))
}

pub fn ctrl_error(context: &str, err: CtrlError) -> CliError {
    match err {
        CtrlError::Conn(err) => conn_error(context, err),
        CtrlError::Transport(err) => transport_error(context, err),
        CtrlError::Export { .. } => CliError::new(USAGE, format!("{context}: {err}")),
        CtrlError::Decode(_) | CtrlError::UnexpectedReply { .. } => {
            CliError::new(LINK_ERROR, format!("{context}: {err}"))
        }
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bbremote_ctrl::PacketType;

    use super::*;

    #[test]
    fn link_failures_map_to_127() {
        for err in [
            ConnError::TransportTimeout { retries: 8 },
            ConnError::PeerReset,
            ConnError::Timeout(Duration::from_secs(5)),
        ] {
            assert_eq!(ctrl_error("run", CtrlError::Conn(err)).code, LINK_ERROR);
        }
        let err = CtrlError::UnexpectedReply {
            expected: PacketType::CommandReturn,
            actual: PacketType::Pong,
        };
        assert_eq!(ctrl_error("run", err).code, LINK_ERROR);
    }

    #[test]
    fn open_failures_are_transport_errors() {
        let err = TransportError::Connect {
            target: "/tmp/missing.sock".to_string(),
            source: io::Error::from(io::ErrorKind::NotFound),
        };
        assert_eq!(transport_error("open", err).code, TRANSPORT_ERROR);
        assert_eq!(
            transport_error("open", TransportError::InvalidAddress("rfc2217://x".into())).code,
            USAGE
        );
    }
}
