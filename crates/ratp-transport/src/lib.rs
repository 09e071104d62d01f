//! Byte-stream boundary for the bbremote serial transport.
//!
//! The protocol layers above only need a blocking, bidirectional byte stream
//! with a read timeout. Device acquisition (opening a UART, configuring the
//! baud rate) is left to the caller; this crate provides:
//! - the [`ByteStream`] trait every link implements
//! - implementations for TCP streams (`socket://host:port`, the usual way to
//!   reach a serial server) and Unix domain sockets (`unix:///path`)
//! - [`LinkAddress`] parsing with `connect`/`accept` helpers

pub mod address;
pub mod error;
pub mod traits;

#[cfg(unix)]
pub mod uds;

pub use address::LinkAddress;
pub use error::{Result, TransportError};
pub use traits::ByteStream;

#[cfg(unix)]
pub use uds::UnixLinkListener;
