//! Reliable transport connection over an unreliable serial byte stream.
//!
//! A [`Connection`] turns a link that may drop, damage or repeat bytes into
//! an ordered, at-most-once message channel:
//! - SYN/SYN+ACK/ACK establishment, FIN teardown, RST abort
//! - stop-and-wait delivery with one outstanding frame, a retransmit timer
//!   and a retry bound
//! - fragmentation of large messages and reassembly on receipt
//! - a request/response exchange slot next to an asynchronous event queue,
//!   with a caller-supplied [`Demux`] deciding where each message goes
//!
//! Protocol state lives on one background thread. Callers submit work over a
//! channel and block on a completion.

pub mod config;
pub mod connection;
mod engine;
pub mod error;
pub mod event;
pub mod state;

pub use config::ConnectionConfig;
pub use connection::{Connection, ConnectionStats};
pub use error::{ConnError, Result};
pub use event::{Demux, Event, Route, StreamOnly};
pub use state::{check_sequence, ConnState, SeqCheck, DUPLICATE_WINDOW, RESYNC_WINDOW};
