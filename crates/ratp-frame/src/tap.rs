//! Frame-level relay between two links.
//!
//! A [`LinkTap`] sits between two byte streams, decodes the frames flowing
//! each way and asks a policy what to do with every one of them. It is used
//! to observe a session frame by frame and to inject faults (lost, damaged or
//! repeated frames) into an otherwise clean link.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use ratp_transport::ByteStream;
use tracing::{debug, trace};

use crate::codec::{Frame, FrameConfig};
use crate::error::Result;
use crate::reader::{FrameReader, ReadOutcome};
use crate::writer::FrameWriter;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Which way a frame is travelling through the tap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    LeftToRight,
    RightToLeft,
}

/// What the tap does with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Forward,
    Drop,
    /// Forward with a damaged CRC trailer.
    Corrupt,
    /// Forward twice.
    Duplicate,
}

/// One frame seen by the tap and what was done with it.
#[derive(Debug, Clone)]
pub struct TapRecord {
    pub direction: Direction,
    pub frame: Frame,
    pub action: Action,
}

type Policy = Box<dyn FnMut(Direction, &Frame) -> Action + Send>;

/// A running relay. Dropping it stops both directions.
pub struct LinkTap {
    shutdown: Arc<AtomicBool>,
    records: Arc<Mutex<Vec<TapRecord>>>,
    threads: Vec<JoinHandle<()>>,
}

impl LinkTap {
    /// Relay every frame unchanged.
    pub fn passthrough<L: ByteStream, R: ByteStream>(left: L, right: R) -> Result<Self> {
        Self::spawn(left, right, |_, _| Action::Forward)
    }

    /// Start relaying between `left` and `right`, consulting `policy` for each frame.
    ///
    /// When either side reaches end-of-stream both directions stop and every
    /// handle is released, so the far ends observe the disconnect.
    pub fn spawn<L, R, P>(left: L, right: R, policy: P) -> Result<Self>
    where
        L: ByteStream,
        R: ByteStream,
        P: FnMut(Direction, &Frame) -> Action + Send + 'static,
    {
        let left_writer = left
            .try_clone_stream()
            .map_err(crate::reader::transport_to_frame_error)?;
        let right_writer = right
            .try_clone_stream()
            .map_err(crate::reader::transport_to_frame_error)?;
        let left: Box<dyn ByteStream> = Box::new(left);
        let right: Box<dyn ByteStream> = Box::new(right);

        let shutdown = Arc::new(AtomicBool::new(false));
        let records = Arc::new(Mutex::new(Vec::new()));
        let policy: Arc<Mutex<Policy>> = Arc::new(Mutex::new(Box::new(policy)));

        let mut threads = Vec::with_capacity(2);
        for (direction, reader, writer) in [
            (Direction::LeftToRight, left, right_writer),
            (Direction::RightToLeft, right, left_writer),
        ] {
            let relay = Relay {
                direction,
                reader: FrameReader::with_config(reader, tap_config()),
                writer: FrameWriter::with_config(writer, tap_config()),
                policy: Arc::clone(&policy),
                records: Arc::clone(&records),
                shutdown: Arc::clone(&shutdown),
            };
            let handle = std::thread::Builder::new()
                .name(format!("link-tap-{direction:?}"))
                .spawn(move || relay.run())?;
            threads.push(handle);
        }

        Ok(Self {
            shutdown,
            records,
            threads,
        })
    }

    /// Every frame seen so far, in arrival order per direction.
    pub fn records(&self) -> Vec<TapRecord> {
        self.records.lock().clone()
    }

    /// Frames seen travelling in one direction, whatever was done with them.
    pub fn frames(&self, direction: Direction) -> Vec<Frame> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.direction == direction)
            .map(|r| r.frame.clone())
            .collect()
    }

    /// Stop relaying and release both links.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for LinkTap {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn tap_config() -> FrameConfig {
    FrameConfig {
        max_payload_size: u16::MAX as usize,
        ..FrameConfig::default()
    }
}

struct Relay {
    direction: Direction,
    reader: FrameReader<Box<dyn ByteStream>>,
    writer: FrameWriter<Box<dyn ByteStream>>,
    policy: Arc<Mutex<Policy>>,
    records: Arc<Mutex<Vec<TapRecord>>>,
    shutdown: Arc<AtomicBool>,
}

impl Relay {
    fn run(mut self) {
        while !self.shutdown.load(Ordering::SeqCst) {
            let frame = match self.reader.read_frame_timeout(Some(POLL_INTERVAL)) {
                Ok(ReadOutcome::Frame(frame)) => frame,
                Ok(ReadOutcome::Timeout) => continue,
                Ok(ReadOutcome::Corrupt(err) | ReadOutcome::Malformed(err)) => {
                    debug!(direction = ?self.direction, %err, "tap discarded damaged input");
                    continue;
                }
                Err(err) => {
                    debug!(direction = ?self.direction, %err, "tap input closed");
                    break;
                }
            };

            let action = {
                let mut policy = self.policy.lock();
                (*policy)(self.direction, &frame)
            };
            trace!(direction = ?self.direction, flags = ?frame.flags, seq = frame.seq, ?action, "tap");
            self.records.lock().push(TapRecord {
                direction: self.direction,
                frame: frame.clone(),
                action,
            });

            if let Err(err) = self.apply(action, &frame) {
                debug!(direction = ?self.direction, %err, "tap output closed");
                break;
            }
        }
        self.shutdown.store(true, Ordering::SeqCst);
    }

    fn apply(&mut self, action: Action, frame: &Frame) -> Result<()> {
        match action {
            Action::Forward => self.writer.write_frame(frame),
            Action::Drop => Ok(()),
            Action::Duplicate => {
                self.writer.write_frame(frame)?;
                self.writer.write_frame(frame)
            }
            Action::Corrupt => {
                let mut buf = BytesMut::new();
                frame.encode(&mut buf)?;
                if let Some(last) = buf.last_mut() {
                    *last ^= 0x5a;
                }
                self.writer.write_raw(&buf)
            }
        }
    }
}
