use bytes::Bytes;

/// Where a stream item came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// The remote agent.
    Remote,
    /// Local input, such as the operator's terminal.
    Local,
}

/// One item on the console multiplexing queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    /// Console output or a pong from the remote agent.
    Remote(Bytes),
    /// Input typed locally.
    Local(Bytes),
    /// A source ended; nothing more will arrive from it.
    Shutdown(Source),
}
