//! Frame codec and link driver for the bbremote serial transport.
//!
//! Every frame on the wire carries:
//! - a `0x01` delimiter used to resynchronize after line noise
//! - a 6-byte header (flags, sequence, acknowledgement, length, header check)
//! - an optional payload bounded by the link MTU
//! - a CRC-32 trailer over everything but the delimiter and header check
//!
//! The codec is pure and stateless. [`FrameReader`] and [`FrameWriter`] move
//! whole frames across a byte stream and know nothing about sequencing.

pub mod codec;
pub mod error;
pub mod flags;
pub mod reader;
pub mod tap;
pub mod writer;

pub use codec::{
    decode_frame, encode_frame, Frame, FrameConfig, DEFAULT_MTU, HEADER_SIZE, SYNC, TRAILER_SIZE,
};
pub use error::{FrameError, Result};
pub use flags::Flags;
pub use reader::{FrameReader, ReadOutcome};
pub use tap::{Action, Direction, LinkTap, TapRecord};
pub use writer::FrameWriter;
