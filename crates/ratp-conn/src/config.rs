use std::time::Duration;

use ratp_frame::{FrameConfig, DEFAULT_MTU};

/// Configuration for a reliable connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Largest payload carried by one frame. Default: 255.
    pub mtu: usize,
    /// Time to wait for an acknowledgement before retransmitting.
    pub retransmit_timeout: Duration,
    /// Retransmissions of one frame before it is given up.
    pub max_retransmits: u32,
    /// Upper bound on active establishment.
    pub connect_timeout: Duration,
    /// Upper bound on teardown once `close` is requested.
    pub close_timeout: Duration,
    /// Link read timeout; also how quickly the reader notices shutdown.
    pub poll_interval: Duration,
    /// Write timeout on the link. `None` blocks indefinitely.
    pub write_timeout: Option<Duration>,
    /// Largest reassembled message accepted or sent.
    pub max_message_size: usize,
    /// Capacity of the inbound event queue.
    pub event_queue_depth: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            retransmit_timeout: Duration::from_millis(250),
            max_retransmits: 8,
            connect_timeout: Duration::from_secs(5),
            close_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(50),
            write_timeout: Some(Duration::from_secs(2)),
            max_message_size: 64 * 1024,
            event_queue_depth: 4096,
        }
    }
}

impl ConnectionConfig {
    /// Frame codec settings derived from this configuration.
    pub fn frame_config(&self) -> FrameConfig {
        FrameConfig {
            max_payload_size: self.mtu,
            read_timeout: Some(self.poll_interval),
            write_timeout: self.write_timeout,
        }
    }
}
