use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use crossbeam::channel::{self, after, never, select, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use ratp_frame::{Flags, Frame, FrameError, FrameReader, FrameWriter, ReadOutcome};
use ratp_transport::ByteStream;
use tracing::{debug, info, trace, warn};

use crate::config::ConnectionConfig;
use crate::error::{ConnError, Result};
use crate::event::{Demux, Event, Route};
use crate::state::{check_sequence, ConnState, SeqCheck};

/// Which side opens the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Active,
    Passive,
}

/// Work submitted by foreground callers.
pub(crate) enum Command {
    Send {
        payload: Bytes,
        done: Option<Sender<Result<()>>>,
    },
    Exchange {
        payload: Bytes,
        timeout: Option<Duration>,
        accept: Box<dyn Fn(&[u8]) -> bool + Send>,
        done: Sender<Result<Bytes>>,
    },
    Close {
        done: Sender<()>,
    },
}

/// What the link reader thread reports.
enum LinkEvent {
    Frame(Frame),
    Corrupt(FrameError),
    Malformed(FrameError),
    Closed(ConnError),
}

/// State visible to foreground callers.
pub(crate) struct Shared {
    state: Mutex<ConnState>,
    state_changed: Condvar,
    terminal: Mutex<Option<ConnError>>,
    pub(crate) retransmits: AtomicU64,
    pub(crate) crc_errors: AtomicU64,
    pub(crate) frames_sent: AtomicU64,
    pub(crate) frames_received: AtomicU64,
    pub(crate) malformed: AtomicU64,
    pub(crate) duplicates: AtomicU64,
    pub(crate) out_of_window: AtomicU64,
    pub(crate) events_dropped: AtomicU64,
    pub(crate) acks_held: AtomicU64,
    pub(crate) stale_responses: AtomicU64,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: Mutex::new(ConnState::Closed),
            state_changed: Condvar::new(),
            terminal: Mutex::new(None),
            retransmits: AtomicU64::new(0),
            crc_errors: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            out_of_window: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            acks_held: AtomicU64::new(0),
            stale_responses: AtomicU64::new(0),
        }
    }

    pub(crate) fn state(&self) -> ConnState {
        *self.state.lock()
    }

    /// Why the connection ended, once it has.
    pub(crate) fn terminal(&self) -> Option<ConnError> {
        self.terminal.lock().clone()
    }

    fn set_state(&self, state: ConnState) {
        *self.state.lock() = state;
        self.state_changed.notify_all();
    }

    fn set_terminal(&self, reason: ConnError) {
        let mut terminal = self.terminal.lock();
        if terminal.is_none() {
            *terminal = Some(reason);
        }
    }

    /// Block until established, terminated, or the deadline passes.
    pub(crate) fn wait_established(&self, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            if *state == ConnState::Established {
                return Ok(());
            }
            if let Some(reason) = self.terminal() {
                return Err(reason);
            }
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Err(ConnError::Timeout(timeout.unwrap_or_default()));
                    }
                    self.state_changed.wait_until(&mut state, deadline);
                }
                None => self.state_changed.wait(&mut state),
            }
        }
    }
}

/// Handles returned to the `Connection`.
pub(crate) struct EngineHandles {
    pub(crate) commands: Sender<Command>,
    pub(crate) events: Receiver<Event>,
    pub(crate) shared: Arc<Shared>,
    pub(crate) threads: Vec<JoinHandle<()>>,
}

/// Start the engine and link reader threads for `stream`.
pub(crate) fn spawn(
    stream: Box<dyn ByteStream>,
    config: ConnectionConfig,
    demux: Box<dyn Demux>,
    role: Role,
) -> Result<EngineHandles> {
    let frame_config = config.frame_config();
    let reader_stream = stream.try_clone_stream()?;
    let reader = FrameReader::with_config_stream(reader_stream, frame_config.clone())?;
    let writer = FrameWriter::with_config_stream(stream, frame_config)?;

    let (link_tx, link_rx) = channel::unbounded();
    let (cmd_tx, cmd_rx) = channel::unbounded();
    let (event_tx, event_rx) = channel::bounded(config.event_queue_depth.max(1));
    let shared = Arc::new(Shared::new());
    let reader_shutdown = Arc::new(AtomicBool::new(false));

    let poll = config.poll_interval;
    let pump_shutdown = Arc::clone(&reader_shutdown);
    let pump = std::thread::Builder::new()
        .name("ratp-link-rx".to_string())
        .spawn(move || run_link_reader(reader, link_tx, pump_shutdown, poll))
        .map_err(|e| ConnError::Link(e.to_string()))?;

    let mut engine = Engine::new(
        config,
        demux,
        role,
        writer,
        link_rx,
        cmd_rx,
        event_tx,
        Arc::clone(&shared),
        Arc::clone(&reader_shutdown),
    );
    let engine = std::thread::Builder::new()
        .name("ratp-engine".to_string())
        .spawn(move || {
            engine.start();
            engine.run();
        });
    let engine = match engine {
        Ok(handle) => handle,
        Err(err) => {
            reader_shutdown.store(true, Ordering::SeqCst);
            let _ = pump.join();
            return Err(ConnError::Link(err.to_string()));
        }
    };

    Ok(EngineHandles {
        commands: cmd_tx,
        events: event_rx,
        shared,
        threads: vec![engine, pump],
    })
}

fn run_link_reader(
    mut reader: FrameReader<Box<dyn ByteStream>>,
    tx: Sender<LinkEvent>,
    shutdown: Arc<AtomicBool>,
    poll: Duration,
) {
    while !shutdown.load(Ordering::SeqCst) {
        let event = match reader.read_frame_timeout(Some(poll)) {
            Ok(ReadOutcome::Frame(frame)) => LinkEvent::Frame(frame),
            Ok(ReadOutcome::Corrupt(err)) => LinkEvent::Corrupt(err),
            Ok(ReadOutcome::Malformed(err)) => LinkEvent::Malformed(err),
            Ok(ReadOutcome::Timeout) => continue,
            Err(err) => {
                let _ = tx.send(LinkEvent::Closed(err.into()));
                break;
            }
        };
        if tx.send(event).is_err() {
            break;
        }
    }
    trace!("link reader stopped");
}

/// Who is waiting for a message to be acknowledged.
enum Origin {
    Send(Option<Sender<Result<()>>>),
    Exchange(u64),
}

struct OutMessage {
    fragments: VecDeque<Bytes>,
    origin: Origin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlightKind {
    Syn,
    Fin,
    Data,
}

/// The single unacknowledged frame.
struct InFlight {
    frame: Frame,
    kind: FlightKind,
    deadline: Instant,
    retries: u32,
}

struct PendingExchange {
    id: u64,
    accept: Box<dyn Fn(&[u8]) -> bool + Send>,
    done: Sender<Result<Bytes>>,
    acked: bool,
    response: Option<Bytes>,
    deadline: Option<Instant>,
    timeout: Duration,
}

struct Engine {
    config: ConnectionConfig,
    demux: Box<dyn Demux>,
    role: Role,
    writer: FrameWriter<Box<dyn ByteStream>>,
    link_rx: Option<Receiver<LinkEvent>>,
    cmd_rx: Option<Receiver<Command>>,
    events: Sender<Event>,
    shared: Arc<Shared>,
    reader_shutdown: Arc<AtomicBool>,

    state: ConnState,
    tx_next: u8,
    rx_expected: u8,
    tx_queue: VecDeque<OutMessage>,
    current: Option<OutMessage>,
    in_flight: Option<InFlight>,
    rx_partial: BytesMut,
    rx_discarding: bool,
    exchange: Option<PendingExchange>,
    next_exchange_id: u64,

    connect_deadline: Option<Instant>,
    close_requested: bool,
    close_deadline: Option<Instant>,
    close_waiters: Vec<Sender<()>>,
    finished: bool,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    fn new(
        config: ConnectionConfig,
        demux: Box<dyn Demux>,
        role: Role,
        writer: FrameWriter<Box<dyn ByteStream>>,
        link_rx: Receiver<LinkEvent>,
        cmd_rx: Receiver<Command>,
        events: Sender<Event>,
        shared: Arc<Shared>,
        reader_shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            demux,
            role,
            writer,
            link_rx: Some(link_rx),
            cmd_rx: Some(cmd_rx),
            events,
            shared,
            reader_shutdown,
            state: ConnState::Closed,
            tx_next: 0,
            rx_expected: 0,
            tx_queue: VecDeque::new(),
            current: None,
            in_flight: None,
            rx_partial: BytesMut::new(),
            rx_discarding: false,
            exchange: None,
            next_exchange_id: 0,
            connect_deadline: None,
            close_requested: false,
            close_deadline: None,
            close_waiters: Vec::new(),
            finished: false,
        }
    }

    fn start(&mut self) {
        match self.role {
            Role::Active => {
                let syn = Frame::syn(0);
                self.connect_deadline = Some(Instant::now() + self.config.connect_timeout);
                self.set_state(ConnState::SynSent);
                if self.transmit(&syn) {
                    self.arm(syn, FlightKind::Syn);
                }
            }
            Role::Passive => self.set_state(ConnState::Listen),
        }
    }

    fn run(mut self) {
        while !self.finished {
            let link_rx = self.link_rx.clone().unwrap_or_else(never);
            let cmd_rx = self.cmd_rx.clone().unwrap_or_else(never);
            let timer = match self.next_deadline() {
                Some(deadline) => after(deadline.saturating_duration_since(Instant::now())),
                None => never(),
            };

            select! {
                recv(link_rx) -> event => match event {
                    Ok(event) => self.on_link(event),
                    Err(_) => {
                        self.link_rx = None;
                        self.enter_closed(ConnError::ConnectionClosed);
                    }
                },
                recv(cmd_rx) -> command => match command {
                    Ok(command) => self.on_command(command),
                    Err(_) => {
                        // Every handle is gone; nobody can observe the outcome.
                        self.cmd_rx = None;
                        self.request_close();
                    }
                },
                recv(timer) -> _ => self.on_timer(Instant::now()),
            }
        }

        self.reader_shutdown.store(true, Ordering::SeqCst);
        let reason = self.shared.terminal().unwrap_or(ConnError::ConnectionClosed);
        if let Some(cmd_rx) = self.cmd_rx.take() {
            for command in cmd_rx.try_iter() {
                reject(command, reason.clone());
            }
        }
        debug!("engine stopped");
    }

    fn next_deadline(&self) -> Option<Instant> {
        let connect = if self.state == ConnState::SynSent {
            self.connect_deadline
        } else {
            None
        };
        [
            self.in_flight.as_ref().map(|f| f.deadline),
            self.exchange.as_ref().and_then(|x| x.deadline),
            connect,
            self.close_deadline,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    // ---- outbound -------------------------------------------------------

    fn transmit(&mut self, frame: &Frame) -> bool {
        match self.writer.write_frame(frame) {
            Ok(()) => {
                self.shared.frames_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(err) => {
                warn!(%err, "link write failed");
                self.enter_closed(err.into());
                false
            }
        }
    }

    fn arm(&mut self, frame: Frame, kind: FlightKind) {
        self.in_flight = Some(InFlight {
            frame,
            kind,
            deadline: Instant::now() + self.config.retransmit_timeout,
            retries: 0,
        });
    }

    /// Put the next fragment on the wire if the transmit slot is free.
    fn pump(&mut self) {
        if self.state != ConnState::Established || self.in_flight.is_some() || self.finished {
            return;
        }

        if self.close_requested {
            if let Some(message) = self.current.take() {
                self.complete(message.origin, Err(ConnError::ConnectionClosed));
            }
            let fin = Frame::fin(self.tx_next);
            self.set_state(ConnState::Closing);
            if self.transmit(&fin) {
                self.arm(fin, FlightKind::Fin);
            }
            return;
        }

        if self.current.is_none() {
            self.current = self.tx_queue.pop_front();
        }
        let Some(message) = self.current.as_mut() else {
            return;
        };
        let Some(fragment) = message.fragments.pop_front() else {
            return;
        };
        let eor = message.fragments.is_empty();
        let frame = Frame::data(self.tx_next, fragment, eor);
        if self.transmit(&frame) {
            self.arm(frame, FlightKind::Data);
        }
    }

    fn fragment(&self, payload: Bytes) -> VecDeque<Bytes> {
        let mtu = self.config.mtu.max(1);
        if payload.is_empty() {
            return VecDeque::from([payload]);
        }
        let mut fragments = VecDeque::with_capacity(payload.len().div_ceil(mtu));
        let mut offset = 0;
        while offset < payload.len() {
            let end = (offset + mtu).min(payload.len());
            fragments.push_back(payload.slice(offset..end));
            offset = end;
        }
        fragments
    }

    fn complete(&mut self, origin: Origin, result: Result<()>) {
        match origin {
            Origin::Send(Some(done)) => {
                let _ = done.send(result);
            }
            Origin::Send(None) => {
                if let Err(err) = result {
                    warn!(%err, "async send failed");
                }
            }
            Origin::Exchange(id) => {
                let Some(exchange) = self.exchange.as_mut().filter(|x| x.id == id) else {
                    trace!(id, "request finished after its exchange ended");
                    return;
                };
                match result {
                    Ok(()) => {
                        exchange.acked = true;
                        self.finish_exchange_if_ready();
                    }
                    Err(err) => self.fail_exchange(err),
                }
            }
        }
    }

    fn finish_exchange_if_ready(&mut self) {
        let ready = self
            .exchange
            .as_ref()
            .is_some_and(|x| x.acked && x.response.is_some());
        if !ready {
            return;
        }
        if let Some(exchange) = self.exchange.take() {
            if let Some(response) = exchange.response {
                let _ = exchange.done.send(Ok(response));
            }
        }
    }

    fn fail_exchange(&mut self, err: ConnError) {
        if let Some(exchange) = self.exchange.take() {
            debug!(id = exchange.id, %err, "exchange failed");
            let _ = exchange.done.send(Err(err));
        }
    }

    /// Fail everything waiting to be sent plus the pending exchange.
    fn fail_pending(&mut self, err: &ConnError) {
        let queued: Vec<OutMessage> = self.tx_queue.drain(..).collect();
        for message in queued {
            self.complete(message.origin, Err(err.clone()));
        }
        if let Some(message) = self.current.take() {
            self.complete(message.origin, Err(err.clone()));
        }
        self.fail_exchange(err.clone());
    }

    // ---- commands -------------------------------------------------------

    fn on_command(&mut self, command: Command) {
        if self.close_requested || self.state == ConnState::Closed {
            if let Command::Close { done } = command {
                self.close_waiters.push(done);
                if self.state == ConnState::Closed {
                    self.enter_closed(ConnError::ConnectionClosed);
                }
            } else {
                let reason = self.shared.terminal().unwrap_or(ConnError::ConnectionClosed);
                reject(command, reason);
            }
            return;
        }

        match command {
            Command::Send { payload, done } => {
                let fragments = self.fragment(payload);
                self.tx_queue.push_back(OutMessage {
                    fragments,
                    origin: Origin::Send(done),
                });
                self.pump();
            }
            Command::Exchange {
                payload,
                timeout,
                accept,
                done,
            } => {
                if self.exchange.is_some() {
                    let _ = done.send(Err(ConnError::Protocol(
                        "an exchange is already pending".to_string(),
                    )));
                    return;
                }
                let id = self.next_exchange_id;
                self.next_exchange_id += 1;
                self.exchange = Some(PendingExchange {
                    id,
                    accept,
                    done,
                    acked: false,
                    response: None,
                    deadline: timeout.map(|t| Instant::now() + t),
                    timeout: timeout.unwrap_or_default(),
                });
                let fragments = self.fragment(payload);
                self.tx_queue.push_back(OutMessage {
                    fragments,
                    origin: Origin::Exchange(id),
                });
                self.pump();
            }
            Command::Close { done } => {
                self.close_waiters.push(done);
                self.request_close();
            }
        }
    }

    fn request_close(&mut self) {
        if self.close_requested || self.finished {
            return;
        }
        self.close_requested = true;
        self.close_deadline = Some(Instant::now() + self.config.close_timeout);
        debug!(state = %self.state, "close requested");

        let queued: Vec<OutMessage> = self.tx_queue.drain(..).collect();
        for message in queued {
            self.complete(message.origin, Err(ConnError::ConnectionClosed));
        }
        self.fail_exchange(ConnError::ConnectionClosed);

        match self.state {
            ConnState::Established => self.pump(),
            ConnState::Closing => {}
            _ => self.enter_closed(ConnError::ConnectionClosed),
        }
    }

    // ---- timers ---------------------------------------------------------

    fn on_timer(&mut self, now: Instant) {
        if self.state == ConnState::SynSent && self.connect_deadline.is_some_and(|d| d <= now) {
            warn!(timeout = ?self.config.connect_timeout, "connection not established in time");
            self.enter_closed(ConnError::Timeout(self.config.connect_timeout));
            return;
        }
        if self.close_deadline.is_some_and(|d| d <= now) {
            debug!("close timed out, forcing CLOSED");
            self.enter_closed(ConnError::ConnectionClosed);
            return;
        }
        if let Some(exchange) = self.exchange.as_ref() {
            if exchange.deadline.is_some_and(|d| d <= now) {
                let timeout = exchange.timeout;
                self.fail_exchange(ConnError::Timeout(timeout));
            }
        }
        if self.in_flight.as_ref().is_some_and(|f| f.deadline <= now) {
            self.retransmit(now);
        }
    }

    fn retransmit(&mut self, now: Instant) {
        let Some(flight) = self.in_flight.as_mut() else {
            return;
        };

        if flight.retries >= self.config.max_retransmits {
            let retries = flight.retries;
            let kind = flight.kind;
            let seq = flight.frame.seq;
            self.in_flight = None;
            warn!(seq, retries, ?kind, "giving up on frame");
            match kind {
                FlightKind::Syn => self.enter_closed(ConnError::TransportTimeout { retries }),
                FlightKind::Fin => self.enter_closed(ConnError::ConnectionClosed),
                FlightKind::Data => {
                    // Skip one sequence number so the receiver sees a gap and
                    // drops any partial message.
                    self.tx_next = seq.wrapping_add(2);
                    if let Some(message) = self.current.take() {
                        self.complete(message.origin, Err(ConnError::TransportTimeout { retries }));
                    }
                    self.pump();
                }
            }
            return;
        }

        flight.retries += 1;
        flight.deadline = now + self.config.retransmit_timeout;
        let frame = flight.frame.clone();
        let attempt = flight.retries;
        self.shared.retransmits.fetch_add(1, Ordering::Relaxed);
        debug!(seq = frame.seq, flags = ?frame.flags, attempt, "retransmit");
        self.emit(Event::Retransmit {
            seq: frame.seq,
            attempt,
        });
        self.transmit(&frame);
    }

    // ---- inbound --------------------------------------------------------

    fn on_link(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Frame(frame) => {
                self.shared.frames_received.fetch_add(1, Ordering::Relaxed);
                self.on_frame(frame);
            }
            LinkEvent::Corrupt(err) => {
                self.shared.crc_errors.fetch_add(1, Ordering::Relaxed);
                debug!(%err, "dropped damaged frame");
            }
            LinkEvent::Malformed(err) => {
                self.shared.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(%err, "dropped malformed frame");
            }
            LinkEvent::Closed(reason) => {
                self.link_rx = None;
                info!(%reason, "link closed");
                self.enter_closed(reason);
            }
        }
    }

    fn on_frame(&mut self, frame: Frame) {
        if frame.flags.contains(Flags::RST) {
            if self.state == ConnState::Listen {
                return;
            }
            warn!("connection reset by peer");
            self.enter_closed(ConnError::PeerReset);
            return;
        }

        match self.state {
            ConnState::Listen => {
                if frame.flags == Flags::SYN {
                    self.accept_syn(&frame);
                } else {
                    debug!(flags = ?frame.flags, "non-SYN frame while listening, sending RST");
                    self.transmit(&Frame::rst());
                }
            }
            ConnState::SynSent => {
                if frame.flags == Flags::SYN | Flags::ACK && frame.ack == 0 {
                    self.in_flight = None;
                    self.connect_deadline = None;
                    if self.transmit(&Frame::ack(frame.seq)) {
                        self.reset_sequences();
                        info!("connection established");
                        self.set_state(ConnState::Established);
                        self.pump();
                    }
                } else {
                    debug!(flags = ?frame.flags, "ignoring frame while connecting");
                }
            }
            ConnState::Established | ConnState::Closing => self.on_established_frame(frame),
            ConnState::Closed => {}
        }
    }

    fn accept_syn(&mut self, frame: &Frame) {
        if self.transmit(&Frame::syn_ack(0, frame.seq)) {
            self.reset_sequences();
            info!("connection established (passive)");
            self.set_state(ConnState::Established);
            self.pump();
        }
    }

    fn reset_sequences(&mut self) {
        self.tx_next = 0;
        self.rx_expected = 0;
        self.rx_partial.clear();
        self.rx_discarding = false;
    }

    fn on_established_frame(&mut self, frame: Frame) {
        let flags = frame.flags;

        if flags == Flags::SYN {
            if self.role == Role::Passive {
                info!("peer restarted the session");
                self.in_flight = None;
                self.fail_pending(&ConnError::PeerReset);
                self.accept_syn(&frame);
            } else {
                warn!("unexpected SYN on an active connection");
            }
            return;
        }
        if flags == Flags::SYN | Flags::ACK {
            // Our handshake ACK was lost.
            self.transmit(&Frame::ack(frame.seq));
            return;
        }
        if flags.contains(Flags::FIN) {
            self.transmit(&Frame::ack(frame.seq));
            info!("peer closed the connection");
            if self.state == ConnState::Established {
                self.set_state(ConnState::Closing);
            }
            self.enter_closed(ConnError::ConnectionClosed);
            return;
        }
        if flags.contains(Flags::DATA) {
            self.on_data(frame);
            return;
        }
        if flags.contains(Flags::ACK) {
            self.on_ack(frame.ack);
        }
    }

    fn on_ack(&mut self, ack: u8) {
        let Some(flight) = self.in_flight.as_ref() else {
            trace!(ack, "ACK with nothing in flight");
            return;
        };
        if flight.frame.seq != ack {
            trace!(ack, in_flight = flight.frame.seq, "stale ACK");
            return;
        }

        match flight.kind {
            FlightKind::Data => {
                self.in_flight = None;
                self.tx_next = self.tx_next.wrapping_add(1);
                let message_done = self
                    .current
                    .as_ref()
                    .is_some_and(|m| m.fragments.is_empty());
                if message_done {
                    if let Some(message) = self.current.take() {
                        self.complete(message.origin, Ok(()));
                    }
                }
                self.pump();
            }
            FlightKind::Fin => {
                self.in_flight = None;
                debug!("FIN acknowledged");
                self.enter_closed(ConnError::ConnectionClosed);
            }
            FlightKind::Syn => {}
        }
    }

    fn on_data(&mut self, frame: Frame) {
        let seq = frame.seq;
        match check_sequence(self.rx_expected, seq) {
            SeqCheck::Expected => {}
            SeqCheck::Skipped(gap) => {
                debug!(seq, expected = self.rx_expected, gap, "sender skipped ahead");
                self.rx_partial.clear();
                self.rx_discarding = false;
            }
            SeqCheck::Duplicate => {
                self.shared.duplicates.fetch_add(1, Ordering::Relaxed);
                trace!(seq, "duplicate frame, re-acknowledging");
                self.transmit(&Frame::ack(seq));
                return;
            }
            SeqCheck::OutOfWindow => {
                self.shared.out_of_window.fetch_add(1, Ordering::Relaxed);
                warn!(seq, expected = self.rx_expected, "sequence number out of window");
                return;
            }
        }

        let eor = frame.flags.contains(Flags::EOR);
        if eor && self.stream_backlogged(&frame.payload) {
            self.shared.acks_held.fetch_add(1, Ordering::Relaxed);
            trace!(seq, "event queue full, holding ACK");
            return;
        }

        if !self.transmit(&Frame::ack(seq)) {
            return;
        }
        self.rx_expected = seq.wrapping_add(1);

        if !self.rx_discarding {
            if self.rx_partial.len() + frame.payload.len() > self.config.max_message_size {
                warn!(
                    max = self.config.max_message_size,
                    "inbound message too large, discarding"
                );
                self.rx_partial.clear();
                self.rx_discarding = true;
            } else {
                self.rx_partial.extend_from_slice(&frame.payload);
            }
        }

        if eor {
            let discarded = std::mem::take(&mut self.rx_discarding);
            let message = self.rx_partial.split().freeze();
            if !discarded {
                self.deliver(message);
            }
        }
    }

    /// Whether completing the message with `last` would need room the event
    /// queue does not have. The frame stays unacknowledged until it does.
    fn stream_backlogged(&self, last: &[u8]) -> bool {
        if self.rx_discarding || !self.events.is_full() {
            return false;
        }
        if self.rx_partial.len() + last.len() > self.config.max_message_size {
            return false;
        }
        let mut message = BytesMut::with_capacity(self.rx_partial.len() + last.len());
        message.extend_from_slice(&self.rx_partial);
        message.extend_from_slice(last);
        self.demux.route(&message) == Route::Stream
    }

    fn deliver(&mut self, message: Bytes) {
        match self.demux.route(&message) {
            Route::Response => match self.exchange.as_mut() {
                Some(exchange) if exchange.response.is_none() && (exchange.accept)(&message) => {
                    exchange.response = Some(message);
                    self.finish_exchange_if_ready();
                }
                Some(exchange) => {
                    self.shared.stale_responses.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        id = exchange.id,
                        len = message.len(),
                        "dropping response that does not answer the pending exchange"
                    );
                }
                None => {
                    self.shared.stale_responses.fetch_add(1, Ordering::Relaxed);
                    warn!(len = message.len(), "dropping response with no pending exchange");
                }
            },
            Route::Stream => self.emit(Event::Data(message)),
        }
    }

    // ---- state ----------------------------------------------------------

    fn emit(&self, event: Event) {
        if self.events.try_send(event).is_err() {
            self.shared.events_dropped.fetch_add(1, Ordering::Relaxed);
            warn!("event queue full, dropping event");
        }
    }

    fn set_state(&mut self, state: ConnState) {
        if self.state == state {
            return;
        }
        debug!(from = %self.state, to = %state, "state change");
        self.state = state;
        self.shared.set_state(state);
        self.emit(Event::State(state));
    }

    fn enter_closed(&mut self, reason: ConnError) {
        if self.finished {
            for waiter in self.close_waiters.drain(..) {
                let _ = waiter.send(());
            }
            return;
        }
        self.shared.set_terminal(reason.clone());
        self.in_flight = None;
        self.fail_pending(&reason);
        self.set_state(ConnState::Closed);
        info!(%reason, "connection closed");
        for waiter in self.close_waiters.drain(..) {
            let _ = waiter.send(());
        }
        self.finished = true;
    }
}

fn reject(command: Command, reason: ConnError) {
    match command {
        Command::Send {
            done: Some(done), ..
        } => {
            let _ = done.send(Err(reason));
        }
        Command::Send { done: None, .. } => {}
        Command::Exchange { done, .. } => {
            let _ = done.send(Err(reason));
        }
        Command::Close { done } => {
            let _ = done.send(());
        }
    }
}
