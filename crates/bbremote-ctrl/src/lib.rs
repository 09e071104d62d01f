//! Remote bootloader control over one reliable serial connection.
//!
//! The [`Controller`] runs synchronous remote operations (shell commands,
//! environment lookups, memory and I2C access, GPIO control) as exchanges
//! over a [`ratp_conn::Connection`] while a background service loop handles
//! everything the remote agent sends on its own:
//! - console output and pong replies are republished as [`StreamItem`]s
//! - remote pings are answered
//! - file requests are served from an exported host directory
//!
//! Messages on the wire are [`Packet`]s: a big-endian type and flags header
//! followed by a type-specific body.

pub mod controller;
pub mod error;
pub mod fs;
pub mod packet;
pub mod stream;

pub use controller::{Controller, ControllerConfig};
pub use error::{CtrlError, Result};
pub use fs::{FileKind, FsReply, FsRequest, FsServer};
pub use packet::{answers, route, GpioDirection, Message, Packet, PacketType, FLAG_EXCHANGE};
pub use stream::{Source, StreamItem};
