use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use ratp_transport::ByteStream;
use serde::Serialize;
use tracing::debug;

use crate::config::ConnectionConfig;
use crate::engine::{self, Command, Role, Shared};
use crate::error::{ConnError, Result};
use crate::event::{Demux, Event};
use crate::state::ConnState;

/// Extra time allowed on top of engine-enforced bounds before a caller
/// stops waiting on its own.
const GRACE: Duration = Duration::from_millis(500);

/// Counters for one connection. All are monotonically non-decreasing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub retransmits: u64,
    pub crc_errors: u64,
    pub malformed: u64,
    pub duplicates: u64,
    pub out_of_window: u64,
    /// State and retransmit events dropped because the event queue was full.
    /// Data is never dropped; see `acks_held`.
    pub events_dropped: u64,
    /// Final fragments left unacknowledged because the event queue was full.
    pub acks_held: u64,
    /// Responses dropped because no pending exchange accepted them.
    pub stale_responses: u64,
}

/// A reliable, ordered message connection over one byte stream.
///
/// Created by [`connect`](Self::connect) or [`listen`](Self::listen) and
/// ended by [`close`](Self::close) (or drop). Every method takes `&self`, so a
/// connection can be shared between threads behind an `Arc`.
pub struct Connection {
    commands: Sender<Command>,
    events: Receiver<Event>,
    shared: Arc<Shared>,
    exchange_lock: Mutex<()>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    config: ConnectionConfig,
}

impl Connection {
    /// Open actively: send SYN and block until established.
    ///
    /// Fails with `Timeout` after `config.connect_timeout`, with
    /// `TransportTimeout` if the SYN is never answered, or with `PeerReset`.
    pub fn connect<S, D>(stream: S, config: ConnectionConfig, demux: D) -> Result<Self>
    where
        S: ByteStream,
        D: Demux,
    {
        let wait = config.connect_timeout + GRACE;
        let connection = Self::spawn(Box::new(stream), config, Box::new(demux), Role::Active)?;
        match connection.shared.wait_established(Some(wait)) {
            Ok(()) => Ok(connection),
            Err(err) => {
                connection.shutdown();
                Err(err)
            }
        }
    }

    /// Open passively: enter LISTEN and return immediately.
    ///
    /// Messages queued before a peer connects are sent once established.
    /// Use [`wait_established`](Self::wait_established) to block for a peer.
    pub fn listen<S, D>(stream: S, config: ConnectionConfig, demux: D) -> Result<Self>
    where
        S: ByteStream,
        D: Demux,
    {
        Self::spawn(Box::new(stream), config, Box::new(demux), Role::Passive)
    }

    fn spawn(
        stream: Box<dyn ByteStream>,
        config: ConnectionConfig,
        demux: Box<dyn Demux>,
        role: Role,
    ) -> Result<Self> {
        debug!(link = %stream.describe(), ?role, "opening connection");
        let handles = engine::spawn(stream, config.clone(), demux, role)?;
        Ok(Self {
            commands: handles.commands,
            events: handles.events,
            shared: handles.shared,
            exchange_lock: Mutex::new(()),
            threads: Mutex::new(handles.threads),
            config,
        })
    }

    /// Block until the connection is established. `None` waits indefinitely.
    pub fn wait_established(&self, timeout: Option<Duration>) -> Result<()> {
        self.shared.wait_established(timeout)
    }

    /// Send a message reliably and block until every fragment is acknowledged.
    pub fn send(&self, payload: impl Into<Bytes>) -> Result<()> {
        let payload = self.checked(payload.into())?;
        let (done_tx, done_rx) = channel::bounded(1);
        self.submit(Command::Send {
            payload,
            done: Some(done_tx),
        })?;
        done_rx.recv().unwrap_or_else(|_| Err(self.terminal_error()))
    }

    /// Queue a message for reliable delivery without waiting for it.
    ///
    /// Ordering relative to other sends is preserved. Failures are logged.
    pub fn send_async(&self, payload: impl Into<Bytes>) -> Result<()> {
        let payload = self.checked(payload.into())?;
        self.submit(Command::Send {
            payload,
            done: None,
        })
    }

    /// Send a request and block for the message the demux routes to the
    /// response slot.
    ///
    /// Exchanges are serialized: a second caller waits for the first to
    /// finish. `timeout` bounds the whole exchange; `None` waits until the
    /// response arrives or the request fails.
    pub fn request(&self, payload: impl Into<Bytes>, timeout: Option<Duration>) -> Result<Bytes> {
        self.request_matching(payload, timeout, |_: &[u8]| true)
    }

    /// Like [`request`](Self::request), but only a response for which
    /// `accept` returns true completes the exchange.
    ///
    /// Responses it rejects are dropped and counted in
    /// [`ConnectionStats::stale_responses`]. This keeps a reply that arrives
    /// after its own exchange timed out from answering the next one.
    pub fn request_matching<A>(
        &self,
        payload: impl Into<Bytes>,
        timeout: Option<Duration>,
        accept: A,
    ) -> Result<Bytes>
    where
        A: Fn(&[u8]) -> bool + Send + 'static,
    {
        let payload = self.checked(payload.into())?;
        let _exchange = self.exchange_lock.lock();
        let (done_tx, done_rx) = channel::bounded(1);
        self.submit(Command::Exchange {
            payload,
            timeout,
            accept: Box::new(accept),
            done: done_tx,
        })?;
        done_rx.recv().unwrap_or_else(|_| Err(self.terminal_error()))
    }

    /// Block for the next event. `None` waits indefinitely.
    ///
    /// Returns `Ok(None)` on timeout. Once the connection has closed and
    /// every queued event has been taken, returns the reason it closed.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<Option<Event>> {
        match timeout {
            None => match self.events.recv() {
                Ok(event) => Ok(Some(event)),
                Err(_) => Err(self.terminal_error()),
            },
            Some(timeout) => match self.events.recv_timeout(timeout) {
                Ok(event) => Ok(Some(event)),
                Err(RecvTimeoutError::Timeout) => Ok(None),
                Err(RecvTimeoutError::Disconnected) => Err(self.terminal_error()),
            },
        }
    }

    /// Close the connection and release its threads.
    ///
    /// Sends FIN when established and waits up to `close_timeout` for its
    /// acknowledgement. A pending exchange and any queued sends fail with
    /// `ConnectionClosed`. Calling it again is a no-op.
    pub fn close(&self) -> Result<()> {
        let (done_tx, done_rx) = channel::bounded(1);
        if self.commands.send(Command::Close { done: done_tx }).is_ok() {
            let wait = self.config.close_timeout + GRACE;
            if let Err(err) = done_rx.recv_timeout(wait) {
                debug!(?wait, %err, "engine did not confirm close; forcing shutdown");
            }
        }
        self.join_threads();
        Ok(())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnState {
        self.shared.state()
    }

    /// Frames sent again after their retransmit timer expired.
    pub fn total_retransmits(&self) -> u64 {
        self.shared.retransmits.load(Ordering::Relaxed)
    }

    /// Inbound frames dropped because a checksum failed.
    pub fn total_crc_errors(&self) -> u64 {
        self.shared.crc_errors.load(Ordering::Relaxed)
    }

    /// Snapshot of all counters.
    pub fn stats(&self) -> ConnectionStats {
        let load = |counter: &std::sync::atomic::AtomicU64| counter.load(Ordering::Relaxed);
        ConnectionStats {
            frames_sent: load(&self.shared.frames_sent),
            frames_received: load(&self.shared.frames_received),
            retransmits: load(&self.shared.retransmits),
            crc_errors: load(&self.shared.crc_errors),
            malformed: load(&self.shared.malformed),
            duplicates: load(&self.shared.duplicates),
            out_of_window: load(&self.shared.out_of_window),
            events_dropped: load(&self.shared.events_dropped),
            acks_held: load(&self.shared.acks_held),
            stale_responses: load(&self.shared.stale_responses),
        }
    }

    /// The configuration this connection was opened with.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    fn checked(&self, payload: Bytes) -> Result<Bytes> {
        if payload.len() > self.config.max_message_size {
            return Err(ConnError::PayloadTooLarge {
                size: payload.len(),
                max: self.config.max_message_size,
            });
        }
        Ok(payload)
    }

    fn submit(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| self.terminal_error())
    }

    fn terminal_error(&self) -> ConnError {
        self.shared.terminal().unwrap_or(ConnError::ConnectionClosed)
    }

    fn shutdown(&self) {
        let _ = self.close();
    }

    fn join_threads(&self) {
        let threads: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
        for handle in threads {
            let _ = handle.join();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown();
    }
}
