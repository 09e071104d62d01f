#![allow(dead_code)]

use std::io::Write;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use ratp_conn::{Connection, ConnectionConfig, Event, StreamOnly};
use ratp_frame::{Action, Direction, Flags, Frame, FrameReader, LinkTap, ReadOutcome};

pub const WAIT: Duration = Duration::from_secs(3);

pub fn fast_config() -> ConnectionConfig {
    ConnectionConfig {
        retransmit_timeout: Duration::from_millis(100),
        max_retransmits: 6,
        connect_timeout: Duration::from_secs(3),
        close_timeout: Duration::from_millis(500),
        poll_interval: Duration::from_millis(10),
        ..ConnectionConfig::default()
    }
}

/// A host (active) and agent (passive) connection joined through a tap.
pub struct Link {
    pub host: Connection,
    pub agent: Connection,
    pub tap: LinkTap,
}

pub fn linked<P>(policy: P) -> Link
where
    P: FnMut(Direction, &Frame) -> Action + Send + 'static,
{
    linked_with(fast_config(), policy)
}

pub fn linked_with<P>(config: ConnectionConfig, policy: P) -> Link
where
    P: FnMut(Direction, &Frame) -> Action + Send + 'static,
{
    let (host_end, tap_left) = UnixStream::pair().unwrap();
    let (tap_right, agent_end) = UnixStream::pair().unwrap();
    let tap = LinkTap::spawn(tap_left, tap_right, policy).unwrap();

    let agent = Connection::listen(agent_end, config.clone(), StreamOnly).unwrap();
    let host = Connection::connect(host_end, config, StreamOnly).unwrap();
    agent.wait_established(Some(WAIT)).unwrap();

    Link { host, agent, tap }
}

/// Next delivered message, skipping state and retransmit events.
pub fn next_data(conn: &Connection) -> Bytes {
    loop {
        match conn.wait(Some(WAIT)).unwrap() {
            Some(Event::Data(data)) => return data,
            Some(_) => continue,
            None => panic!("no data within {WAIT:?}"),
        }
    }
}

/// Drain events until the queue is idle for `quiet`; returns the data seen.
pub fn drain_data(conn: &Connection, quiet: Duration) -> Vec<Bytes> {
    let mut data = Vec::new();
    while let Ok(Some(event)) = conn.wait(Some(quiet)) {
        if let Event::Data(bytes) = event {
            data.push(bytes);
        }
    }
    data
}

/// A listening connection with a hand-driven peer on the other end.
pub struct RawPeer {
    pub stream: UnixStream,
    pub reader: FrameReader<UnixStream>,
}

pub fn listening() -> (Connection, RawPeer) {
    let (raw, agent_end) = UnixStream::pair().unwrap();
    let agent = Connection::listen(agent_end, fast_config(), StreamOnly).unwrap();
    let reader = FrameReader::new(raw.try_clone().unwrap());
    (agent, RawPeer { stream: raw, reader })
}

impl RawPeer {
    pub fn send(&mut self, frame: &Frame) {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf).unwrap();
        self.stream.write_all(&buf).unwrap();
    }

    pub fn next(&mut self) -> Frame {
        loop {
            match self.reader.read_frame_timeout(Some(WAIT)).unwrap() {
                ReadOutcome::Frame(frame) => return frame,
                ReadOutcome::Timeout => panic!("no frame within {WAIT:?}"),
                _ => continue,
            }
        }
    }

    /// Skip frames until one with exactly `flags` arrives.
    pub fn next_with(&mut self, flags: Flags) -> Frame {
        loop {
            let frame = self.next();
            if frame.flags == flags {
                return frame;
            }
        }
    }

    /// Open the connection: SYN, then the final ACK of the handshake.
    pub fn handshake(&mut self) {
        self.send(&Frame::syn(0));
        let syn_ack = self.next_with(Flags::SYN | Flags::ACK);
        self.send(&Frame::ack(syn_ack.seq));
    }
}
