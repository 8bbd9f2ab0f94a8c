//! Framed request/response link to the board micro-controller.
//!
//! One task owns the read side of the UART and routes every inbound frame:
//! event frames go to the event sink, response frames complete the pending
//! request. Requests are serialised behind an async mutex; events are never
//! gated behind a pending request. A second low-frequency task polls the
//! controller so buffered events keep flowing.

pub mod frame;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::types::Key;
use frame::{decode_key, event_square, Frame, FrameType, Request};

/// Handshake attempts before `HardwareInitFailed`.
pub const INIT_ATTEMPTS: u32 = 3;

/// Per-attempt handshake deadline.
pub const INIT_DEADLINE: Duration = Duration::from_secs(10);

/// Deadline for an ordinary request/response transaction.
pub const REQUEST_DEADLINE: Duration = Duration::from_secs(2);

/// Controller poll cadence while events are enabled.
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Bound of the inbound event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Byte stream the link runs over. Satisfied by `tokio_serial::SerialStream`
/// and by `tokio::io::DuplexStream` in tests.
pub trait LinkPort: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> LinkPort for T {}

/// A hardware event as parsed off the wire. Square indices are still in the
/// sensor-matrix layout; the board layer translates them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// Bezel key press.
    Key(Key),
    /// Piece lifted; `hw` is the raw sensor index.
    Lift {
        /// Raw sensor index 0..63.
        hw: u8,
    },
    /// Piece placed; `hw` is the raw sensor index.
    Place {
        /// Raw sensor index 0..63.
        hw: u8,
    },
    /// Battery report.
    Battery {
        /// Charge percent 0..100.
        percent: u8,
        /// Whether charging.
        charging: bool,
    },
    /// Charger plugged or unplugged.
    Charger(bool),
}

type PendingKey = (FrameType, u8, u8);

struct Shared {
    pending: parking_lot::Mutex<HashMap<PendingKey, oneshot::Sender<Frame>>>,
    polling: AtomicBool,
    closed: AtomicBool,
}

/// The serial link. Cloneable handle; all clones share one wire.
pub struct Link {
    writer: Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>,
    request_gate: Arc<Mutex<()>>,
    shared: Arc<Shared>,
    reader: JoinHandle<()>,
    poller: JoinHandle<()>,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("closed", &self.shared.closed.load(Ordering::Acquire))
            .field("polling", &self.shared.polling.load(Ordering::Acquire))
            .finish()
    }
}

impl Link {
    /// Open the link over an already-connected port and spawn the pump.
    ///
    /// Parsed events are pushed into `events` in arrival order, each exactly
    /// once. The channel is bounded; a full channel applies backpressure to
    /// the pump, not to requests.
    pub fn open<P: LinkPort>(port: P, events: mpsc::Sender<LinkEvent>) -> Link {
        let (read_half, write_half) = tokio::io::split(port);
        let shared = Arc::new(Shared {
            pending: parking_lot::Mutex::new(HashMap::new()),
            polling: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        });
        let writer: Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>> =
            Arc::new(Mutex::new(Box::new(write_half)));

        let reader = tokio::spawn(read_loop(read_half, shared.clone(), events));
        let poller = tokio::spawn(poll_loop(writer.clone(), shared.clone()));

        Link {
            writer,
            request_gate: Arc::new(Mutex::new(())),
            shared,
            reader,
            poller,
        }
    }

    /// Open over a real serial device.
    pub fn open_serial(path: &str, baud: u32, events: mpsc::Sender<LinkEvent>) -> Result<Link> {
        let port = tokio_serial::SerialStream::open(&tokio_serial::new(path, baud))
            .map_err(|e| Error::HardwareInitFailed(format!("serial open {path}: {e}")))?;
        Ok(Link::open(port, events))
    }

    /// Run the firmware handshake, retrying up to [`INIT_ATTEMPTS`] times
    /// with a per-attempt deadline of [`INIT_DEADLINE`].
    pub async fn init(&self) -> Result<()> {
        let mut last = String::new();
        for attempt in 1..=INIT_ATTEMPTS {
            match tokio::time::timeout(INIT_DEADLINE, self.request(Request::init())).await {
                Ok(Ok(_ack)) => {
                    debug!(attempt, "controller handshake complete");
                    return Ok(());
                }
                Ok(Err(e)) => {
                    warn!(attempt, error = %e, "handshake attempt failed");
                    last = e.to_string();
                }
                Err(_) => {
                    warn!(attempt, "handshake attempt timed out");
                    last = format!("no ack within {INIT_DEADLINE:?}");
                }
            }
        }
        Err(Error::HardwareInitFailed(format!(
            "handshake failed after {INIT_ATTEMPTS} attempts: {last}"
        )))
    }

    /// Run one request/response transaction.
    ///
    /// The response is matched by type and address pair only; the protocol
    /// is half-duplex per request, enforced by an internal mutex. A missed
    /// deadline fails with [`Error::LinkTimeout`] and leaves the pump
    /// running.
    pub async fn request(&self, request: Request) -> Result<Frame> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "link closed",
            )));
        }
        let _gate = self.request_gate.lock().await;

        let key = request.response_key();
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(key, tx);

        if let Err(e) = self.write_frame(&request.frame).await {
            self.shared.pending.lock().remove(&key);
            return Err(e);
        }

        match tokio::time::timeout(REQUEST_DEADLINE, rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => {
                // reader dropped the sender: pump ended underneath us
                self.shared.pending.lock().remove(&key);
                Err(Error::LinkTimeout(REQUEST_DEADLINE))
            }
            Err(_) => {
                self.shared.pending.lock().remove(&key);
                Err(Error::LinkTimeout(REQUEST_DEADLINE))
            }
        }
    }

    /// Fire-and-forget command write. The controller's ack frame is consumed
    /// by the pump and dropped.
    pub async fn command(&self, frame: Frame) -> Result<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "link closed",
            )));
        }
        self.write_frame(&frame).await
    }

    /// Enable or disable the event poll. Requests keep working either way.
    pub fn set_polling(&self, enabled: bool) {
        self.shared.polling.store(enabled, Ordering::Release);
    }

    /// Whether the link is still open.
    pub fn is_open(&self) -> bool {
        !self.shared.closed.load(Ordering::Acquire)
    }

    /// Close the link and stop both tasks.
    pub async fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.poller.abort();
        self.reader.abort();
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    async fn write_frame(&self, frame: &Frame) -> Result<()> {
        let bytes = frame.encode();
        let mut writer = self.writer.lock().await;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }
}

async fn poll_loop(
    writer: Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>,
    shared: Arc<Shared>,
) {
    let mut interval = tokio::time::interval(POLL_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let poll = Frame::new(FrameType::Poll, Vec::new()).encode();
    loop {
        interval.tick().await;
        if shared.closed.load(Ordering::Acquire) {
            return;
        }
        if !shared.polling.load(Ordering::Acquire) {
            continue;
        }
        let mut w = writer.lock().await;
        if let Err(e) = w.write_all(&poll).await {
            warn!(error = %e, "event poll write failed");
        }
        let _ = w.flush().await;
    }
}

async fn read_loop<R: AsyncRead + Send + Unpin + 'static>(
    mut reader: ReadHalf<R>,
    shared: Arc<Shared>,
    events: mpsc::Sender<LinkEvent>,
) {
    let mut buf = bytes::BytesMut::with_capacity(1024);
    loop {
        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                debug!("serial read side closed");
                shared.closed.store(true, Ordering::Release);
                shared.pending.lock().clear();
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "serial read failed");
                shared.closed.store(true, Ordering::Release);
                shared.pending.lock().clear();
                return;
            }
        }

        loop {
            match Frame::parse(&buf) {
                Ok(Some((frame, used))) => {
                    let _ = buf.split_to(used);
                    route_frame(&shared, &events, frame).await;
                }
                Ok(None) => break,
                Err(e) => {
                    // bad byte at the head of the buffer: drop it and resync;
                    // the controller resends events on the next poll
                    warn!(error = %e, "discarding invalid frame byte");
                    let _ = buf.split_to(1);
                }
            }
        }
    }
}

async fn route_frame(shared: &Shared, events: &mpsc::Sender<LinkEvent>, frame: Frame) {
    if frame.frame_type.is_event() {
        if let Some(event) = decode_event(&frame) {
            if events.send(event).await.is_err() {
                debug!("event sink dropped; event discarded");
            }
        }
        return;
    }

    let key = (frame.frame_type, frame.addr1, frame.addr2);
    let sender = shared.pending.lock().remove(&key);
    match sender {
        Some(tx) => {
            let _ = tx.send(frame);
        }
        None => trace!(frame_type = ?frame.frame_type, "unsolicited response dropped"),
    }
}

fn decode_event(frame: &Frame) -> Option<LinkEvent> {
    match frame.frame_type {
        FrameType::Key => {
            let code = *frame.payload.first()?;
            match decode_key(code) {
                Some(key) => Some(LinkEvent::Key(key)),
                None => {
                    warn!(code, "unknown key code");
                    None
                }
            }
        }
        FrameType::Lift => match event_square(frame) {
            Ok(hw) => Some(LinkEvent::Lift { hw }),
            Err(e) => {
                warn!(error = %e, "bad lift event");
                None
            }
        },
        FrameType::Place => match event_square(frame) {
            Ok(hw) => Some(LinkEvent::Place { hw }),
            Err(e) => {
                warn!(error = %e, "bad place event");
                None
            }
        },
        FrameType::Battery => {
            let percent = *frame.payload.first()?;
            let charging = frame.payload.get(1).is_some_and(|b| *b != 0);
            Some(LinkEvent::Battery {
                percent: percent.min(100),
                charging,
            })
        }
        FrameType::Charger => Some(LinkEvent::Charger(
            frame.payload.first().is_some_and(|b| *b != 0),
        )),
        // nothing pending on the controller
        FrameType::Idle => None,
        _ => None,
    }
}
