use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{SendTimeoutError, Sender};
use parking_lot::{Mutex, MutexGuard};
use ratp_conn::{ConnError, ConnState, Connection, ConnectionConfig, ConnectionStats, Event};
use ratp_transport::ByteStream;
use tracing::{debug, info, trace, warn};

use crate::error::{CtrlError, Result};
use crate::fs::FsServer;
use crate::packet::{answers, route, GpioDirection, Message, Packet, PacketType};
use crate::stream::{Source, StreamItem};

/// Console bytes pushed for a pong received in answer to an async ping.
pub const PONG_NOTICE: &[u8] = b"pong\n";

/// How long one attempt to hand an item to a full consumer queue may hold
/// the sink lock.
const PUSH_SLICE: Duration = Duration::from_millis(50);

/// Configuration for a [`Controller`].
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub connection: ConnectionConfig,
    /// Keep retrying establishment instead of failing on the first attempt.
    pub wait_for_peer: bool,
    /// Pause between establishment attempts.
    pub retry_interval: Duration,
    /// Give up after this many attempts. `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Bound on each synchronous exchange. `None` relies on the transport
    /// retry limit alone.
    pub reply_timeout: Option<Duration>,
    /// How long [`Controller::ping`] waits for a pong.
    pub ping_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            wait_for_peer: false,
            retry_interval: Duration::from_secs(1),
            max_attempts: None,
            reply_timeout: None,
            ping_timeout: Duration::from_secs(2),
        }
    }
}

/// Where asynchronous traffic goes.
#[derive(Default)]
struct Sink {
    queue: Option<Sender<StreamItem>>,
    /// Bumped every time a consumer is attached.
    generation: u64,
    ended: bool,
    closing: bool,
}

impl Sink {
    /// Try to queue `item`, waiting up to `wait` for room. Hands the item
    /// back if the queue stayed full.
    fn offer(&mut self, item: StreamItem, wait: Duration) -> Option<StreamItem> {
        let Some(queue) = &self.queue else {
            debug!(?item, "no consumer attached; dropping stream item");
            return None;
        };
        match queue.send_timeout(item, wait) {
            Ok(()) => None,
            Err(SendTimeoutError::Timeout(item)) => {
                trace!("stream consumer lagging; holding item");
                Some(item)
            }
            Err(SendTimeoutError::Disconnected(_)) => {
                debug!("stream consumer went away");
                self.queue = None;
                None
            }
        }
    }
}

/// Hand `item` to the consumer, blocking while its queue is full.
///
/// The lock is released between attempts so `stop` and `close` are never
/// shut out. The item is dropped if the consumer is detached or replaced in
/// the meantime, or if the controller is closing and the queue stays full.
fn push(mut sink: MutexGuard<'_, Sink>, mut item: StreamItem) {
    let lock = MutexGuard::mutex(&sink);
    let generation = sink.generation;
    loop {
        let closing = sink.closing;
        item = match sink.offer(item, PUSH_SLICE) {
            None => return,
            Some(item) if closing => {
                warn!(?item, "consumer not draining while closing; item dropped");
                return;
            }
            Some(item) => item,
        };
        MutexGuard::unlock_fair(sink);
        sink = lock.lock();
        if sink.generation != generation {
            debug!(?item, "consumer changed; dropping stream item");
            return;
        }
    }
}

/// State shared with the service thread.
struct Service {
    conn: Arc<Connection>,
    sink: Arc<Mutex<Sink>>,
    export: Arc<Mutex<Option<FsServer>>>,
}

/// Remote bootloader control over one connection.
///
/// Synchronous operations serialize on the connection's exchange slot. A
/// service thread runs for the controller's whole life: it answers remote
/// pings and file requests and forwards console output to the consumer
/// attached with [`start`](Self::start).
pub struct Controller {
    conn: Arc<Connection>,
    sink: Arc<Mutex<Sink>>,
    export: Arc<Mutex<Option<FsServer>>>,
    service: Mutex<Option<JoinHandle<()>>>,
    config: ControllerConfig,
}

impl Controller {
    /// Establish a connection on `stream`.
    ///
    /// With `wait_for_peer` set, the handshake is retried on the same link
    /// until the agent answers or `max_attempts` is reached.
    pub fn connect<S: ByteStream>(stream: S, config: ControllerConfig) -> Result<Self> {
        Self::connect_with(|| stream.try_clone_stream(), config)
    }

    /// Establish a connection, reopening the link with `open` for every attempt.
    pub fn connect_with<F>(mut open: F, config: ControllerConfig) -> Result<Self>
    where
        F: FnMut() -> ratp_transport::Result<Box<dyn ByteStream>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = open()
                .map_err(CtrlError::from)
                .and_then(|stream| {
                    Connection::connect(stream, config.connection.clone(), route)
                        .map_err(CtrlError::from)
                });

            match result {
                Ok(conn) => {
                    info!(attempt, "connected to remote agent");
                    return Self::new(conn, config);
                }
                Err(err) => {
                    let exhausted = config.max_attempts.is_some_and(|max| attempt >= max);
                    if !config.wait_for_peer || exhausted {
                        return Err(err);
                    }
                    debug!(attempt, %err, "remote agent not answering; retrying");
                    std::thread::sleep(config.retry_interval);
                }
            }
        }
    }

    /// Wrap an open connection and start the service thread.
    ///
    /// The connection must have been opened with [`route`] as its demux.
    pub fn new(conn: Connection, config: ControllerConfig) -> Result<Self> {
        let conn = Arc::new(conn);
        let sink = Arc::new(Mutex::new(Sink::default()));
        let export = Arc::new(Mutex::new(None));

        let service = Service {
            conn: Arc::clone(&conn),
            sink: Arc::clone(&sink),
            export: Arc::clone(&export),
        };
        let handle = std::thread::Builder::new()
            .name("bbremote-service".to_string())
            .spawn(move || service.run())
            .map_err(|e| CtrlError::Conn(ConnError::Link(e.to_string())))?;

        Ok(Self {
            conn,
            sink,
            export,
            service: Mutex::new(Some(handle)),
            config,
        })
    }

    /// Run a shell command on the agent and return its exit status.
    pub fn command(&self, command: &str) -> Result<i32> {
        match self.exchange(Message::Command {
            command: command.to_string(),
        })? {
            Message::CommandReturn { status } => Ok(status),
            other => Err(unexpected(PacketType::CommandReturn, &other)),
        }
    }

    /// Look up an environment variable. `None` if it is not set.
    pub fn getenv(&self, name: &str) -> Result<Option<Bytes>> {
        match self.exchange(Message::Getenv {
            name: name.to_string(),
        })? {
            Message::GetenvReturn { value } => Ok(value),
            other => Err(unexpected(PacketType::GetenvReturn, &other)),
        }
    }

    /// Read `size` bytes of memory at `address` through device `path`.
    pub fn md(&self, path: &str, address: u32, size: u32) -> Result<(i32, Bytes)> {
        match self.exchange(Message::Md {
            path: path.to_string(),
            address,
            size,
        })? {
            Message::MdReturn { status, data } => Ok((status, data)),
            other => Err(unexpected(PacketType::MdReturn, &other)),
        }
    }

    /// Write `data` to memory at `address` through device `path`.
    pub fn mw(&self, path: &str, address: u32, data: &[u8]) -> Result<(i32, u32)> {
        match self.exchange(Message::Mw {
            path: path.to_string(),
            address,
            data: Bytes::copy_from_slice(data),
        })? {
            Message::MwReturn { status, written } => Ok((status, written)),
            other => Err(unexpected(PacketType::MwReturn, &other)),
        }
    }

    pub fn i2c_read(
        &self,
        bus: u8,
        address: u8,
        reg: u16,
        flags: u8,
        size: u16,
    ) -> Result<(i32, Bytes)> {
        match self.exchange(Message::I2cRead {
            bus,
            address,
            reg,
            flags,
            size,
        })? {
            Message::I2cReadReturn { status, data } => Ok((status, data)),
            other => Err(unexpected(PacketType::I2cReadReturn, &other)),
        }
    }

    pub fn i2c_write(
        &self,
        bus: u8,
        address: u8,
        reg: u16,
        flags: u8,
        data: &[u8],
    ) -> Result<(i32, u16)> {
        match self.exchange(Message::I2cWrite {
            bus,
            address,
            reg,
            flags,
            data: Bytes::copy_from_slice(data),
        })? {
            Message::I2cWriteReturn { status, written } => Ok((status, written)),
            other => Err(unexpected(PacketType::I2cWriteReturn, &other)),
        }
    }

    pub fn gpio_get_value(&self, gpio: u32) -> Result<u8> {
        match self.exchange(Message::GpioGetValue { gpio })? {
            Message::GpioGetValueReturn { value } => Ok(value),
            other => Err(unexpected(PacketType::GpioGetValueReturn, &other)),
        }
    }

    pub fn gpio_set_value(&self, gpio: u32, value: u8) -> Result<()> {
        match self.exchange(Message::GpioSetValue { gpio, value })? {
            Message::GpioSetValueReturn => Ok(()),
            other => Err(unexpected(PacketType::GpioSetValueReturn, &other)),
        }
    }

    pub fn gpio_set_direction(&self, gpio: u32, direction: GpioDirection, value: u8) -> Result<i32> {
        match self.exchange(Message::GpioSetDirection {
            gpio,
            direction,
            value,
        })? {
            Message::GpioSetDirectionReturn { status } => Ok(status),
            other => Err(unexpected(PacketType::GpioSetDirectionReturn, &other)),
        }
    }

    /// Ask the agent to reset the board.
    ///
    /// The agent may go away before acknowledging, so losing the link after
    /// the request is sent is not an error. Later calls fail cleanly.
    pub fn reset(&self, force: bool) -> Result<()> {
        let state = self.conn.state();
        if state != ConnState::Established {
            return Err(ConnError::Protocol(format!("cannot reset while {state}")).into());
        }
        let packet = Packet::notify(Message::Reset { force }).encode()?;
        match self.conn.send(packet) {
            Ok(()) => Ok(()),
            Err(
                err @ (ConnError::TransportTimeout { .. }
                | ConnError::PeerReset
                | ConnError::ConnectionClosed
                | ConnError::Link(_)),
            ) => {
                debug!(%err, "link lost after reset request");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Serve `path` to the agent's file requests, replacing any earlier export.
    pub fn export(&self, path: impl AsRef<Path>) -> Result<()> {
        let server = FsServer::new(path)?;
        info!(root = %server.root().display(), "export active");
        *self.export.lock() = Some(server);
        Ok(())
    }

    /// Attach the consumer queue for console output and async pongs.
    ///
    /// If the connection has already ended, the shutdown marker is pushed
    /// immediately.
    pub fn start(&self, queue: Sender<StreamItem>) -> Result<()> {
        let mut sink = self.sink.lock();
        if sink.queue.is_some() {
            return Err(CtrlError::AlreadyStarted);
        }
        sink.queue = Some(queue);
        sink.generation += 1;
        if sink.ended {
            if let Some(item) = sink.offer(StreamItem::Shutdown(Source::Remote), Duration::ZERO) {
                warn!(?item, "consumer queue already full; shutdown marker dropped");
            }
        }
        Ok(())
    }

    /// Detach the consumer queue. Nothing is pushed to it after this returns.
    ///
    /// While a consumer is attached and its queue is full, console output is
    /// held back rather than dropped, and the agent sees its frames go
    /// unacknowledged until the consumer catches up.
    pub fn stop(&self) {
        self.sink.lock().queue = None;
    }

    /// Queue console input for the agent without waiting for delivery.
    pub fn send_async_console(&self, data: &[u8]) -> Result<()> {
        let packet = Packet::notify(Message::ConsoleMsg {
            data: Bytes::copy_from_slice(data),
        })
        .encode()?;
        Ok(self.conn.send_async(packet)?)
    }

    /// Send a ping whose pong arrives on the consumer queue.
    pub fn send_async_ping(&self) -> Result<()> {
        let packet = Packet::notify(Message::Ping).encode()?;
        Ok(self.conn.send_async(packet)?)
    }

    /// Synchronous ping: 0 when the agent answers, 1 when it does not answer
    /// in time or answers with something else.
    pub fn ping(&self) -> Result<i32> {
        let packet = Packet::request(Message::Ping).encode()?;
        match self.conn.request_matching(
            packet,
            Some(self.config.ping_timeout),
            answers(PacketType::Pong),
        ) {
            Ok(reply) => match Packet::decode(&reply) {
                Ok(Packet {
                    message: Message::Pong,
                    ..
                }) => Ok(0),
                Ok(other) => {
                    warn!(reply = ?other.packet_type(), "unexpected answer to ping");
                    Ok(1)
                }
                Err(err) => {
                    warn!(%err, "undecodable answer to ping");
                    Ok(1)
                }
            },
            Err(ConnError::Timeout(waited)) => {
                debug!(?waited, "ping timed out");
                Ok(1)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Close the connection and stop the service thread.
    ///
    /// An attached consumer receives `Shutdown(Remote)` as its last item.
    pub fn close(&self) -> Result<()> {
        self.sink.lock().closing = true;
        self.conn.close()?;
        if let Some(handle) = self.service.lock().take() {
            let _ = handle.join();
        }
        Ok(())
    }

    pub fn state(&self) -> ConnState {
        self.conn.state()
    }

    pub fn total_retransmits(&self) -> u64 {
        self.conn.total_retransmits()
    }

    pub fn total_crc_errors(&self) -> u64 {
        self.conn.total_crc_errors()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.conn.stats()
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Send a request and wait for the reply of the matching type. A stale
    /// reply to an earlier, abandoned request is dropped by the connection.
    fn exchange(&self, message: Message) -> Result<Message> {
        let request = message.packet_type();
        let expected = request
            .reply_type()
            .ok_or_else(|| CtrlError::Encode(format!("{request:?} has no reply")))?;
        let packet = Packet::request(message).encode()?;
        trace!(?expected, len = packet.len(), "exchange");
        let reply = self
            .conn
            .request_matching(packet, self.config.reply_timeout, answers(expected))?;
        Ok(Packet::decode(&reply)?.message)
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn unexpected(expected: PacketType, actual: &Message) -> CtrlError {
    CtrlError::UnexpectedReply {
        expected,
        actual: actual.packet_type(),
    }
}

impl Service {
    fn run(self) {
        loop {
            match self.conn.wait(None) {
                Ok(Some(Event::Data(payload))) => self.on_message(&payload),
                Ok(Some(Event::State(state))) => debug!(%state, "connection state"),
                Ok(Some(Event::Retransmit { seq, attempt })) => trace!(seq, attempt, "retransmit"),
                Ok(None) => {}
                Err(err) => {
                    debug!(%err, "connection ended; service stopping");
                    let mut sink = self.sink.lock();
                    sink.ended = true;
                    push(sink, StreamItem::Shutdown(Source::Remote));
                    return;
                }
            }
        }
    }

    fn on_message(&self, payload: &[u8]) {
        let packet = match Packet::decode(payload) {
            Ok(packet) => packet,
            Err(err) => {
                warn!(%err, len = payload.len(), "dropping undecodable packet");
                return;
            }
        };

        match packet.message {
            Message::ConsoleMsg { data } => push(self.sink.lock(), StreamItem::Remote(data)),
            Message::Pong => push(
                self.sink.lock(),
                StreamItem::Remote(Bytes::from_static(PONG_NOTICE)),
            ),
            Message::Ping => self.reply(packet.flags, Message::Pong),
            Message::Fs(request) => {
                let reply = match self.export.lock().as_mut() {
                    Some(server) => server.handle(&request),
                    None => {
                        debug!(?request, "file request with nothing exported");
                        request.unsupported()
                    }
                };
                self.reply(packet.flags, Message::FsReturn(reply));
            }
            other => debug!(kind = ?other.packet_type(), "ignoring unsolicited packet"),
        }
    }

    fn reply(&self, request_flags: u16, message: Message) {
        let result = Packet::reply(request_flags, message)
            .encode()
            .and_then(|bytes| self.conn.send_async(bytes).map_err(CtrlError::from));
        if let Err(err) = result {
            warn!(%err, "failed to answer remote request");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Instant;

    use crossbeam::channel;

    use super::*;

    fn attached(depth: usize) -> (Arc<Mutex<Sink>>, channel::Receiver<StreamItem>) {
        let (tx, rx) = channel::bounded(depth);
        let sink = Sink {
            queue: Some(tx),
            generation: 1,
            ..Sink::default()
        };
        (Arc::new(Mutex::new(sink)), rx)
    }

    fn remote(data: &'static [u8]) -> StreamItem {
        StreamItem::Remote(Bytes::from_static(data))
    }

    #[test]
    fn sink_without_queue_drops_silently() {
        let sink = Mutex::new(Sink::default());
        push(sink.lock(), remote(b"x"));
        assert!(sink.lock().queue.is_none());
    }

    #[test]
    fn full_queue_waits_for_the_consumer() {
        let (sink, rx) = attached(1);
        push(sink.lock(), remote(b"a"));

        let pusher = thread::spawn({
            let sink = Arc::clone(&sink);
            move || push(sink.lock(), remote(b"b"))
        });
        thread::sleep(Duration::from_millis(150));
        assert!(!pusher.is_finished());

        assert_eq!(rx.try_recv().unwrap(), remote(b"a"));
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), remote(b"b"));
        pusher.join().unwrap();
    }

    #[test]
    fn detaching_releases_a_blocked_push() {
        let (sink, rx) = attached(1);
        push(sink.lock(), remote(b"a"));

        let pusher = thread::spawn({
            let sink = Arc::clone(&sink);
            move || push(sink.lock(), remote(b"b"))
        });
        thread::sleep(Duration::from_millis(100));
        sink.lock().queue = None;
        pusher.join().unwrap();

        assert_eq!(rx.try_recv().unwrap(), remote(b"a"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn closing_gives_up_on_a_stalled_consumer() {
        let (sink, rx) = attached(1);
        push(sink.lock(), remote(b"a"));
        sink.lock().closing = true;

        let started = Instant::now();
        push(sink.lock(), StreamItem::Shutdown(Source::Remote));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(rx.try_recv().unwrap(), remote(b"a"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn sink_forgets_disconnected_consumer() {
        let (sink, rx) = attached(4);
        drop(rx);
        push(sink.lock(), StreamItem::Shutdown(Source::Remote));
        assert!(sink.lock().queue.is_none());
    }

    #[test]
    fn defaults() {
        let config = ControllerConfig::default();
        assert!(!config.wait_for_peer);
        assert_eq!(config.max_attempts, None);
        assert_eq!(config.ping_timeout, Duration::from_secs(2));
    }
}
