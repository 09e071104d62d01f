use bytes::Bytes;

use crate::state::ConnState;

/// Something that happened on a connection, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A complete inbound message routed to the stream side.
    Data(Bytes),
    /// The connection changed state. `State(Closed)` is always the last event.
    State(ConnState),
    /// The retransmit timer fired and a frame was sent again.
    Retransmit { seq: u8, attempt: u32 },
}

/// Where a delivered message goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// The synchronous response slot of the pending exchange.
    Response,
    /// The asynchronous event queue.
    Stream,
}

/// Classifies inbound messages for the connection.
pub trait Demux: Send + 'static {
    fn route(&self, message: &[u8]) -> Route;
}

impl<F> Demux for F
where
    F: Fn(&[u8]) -> Route + Send + 'static,
{
    fn route(&self, message: &[u8]) -> Route {
        self(message)
    }
}

/// Routes everything to the event queue.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamOnly;

impl Demux for StreamOnly {
    fn route(&self, _message: &[u8]) -> Route {
        Route::Stream
    }
}
