//! Chess-domain view of the physical board.
//!
//! Wraps the serial link with square-indexed operations: LEDs, sounds,
//! board-state reads and per-class event subscriptions. The sensor matrix
//! addresses squares in a column-major, board-flipped layout; the
//! translation happens here and nowhere else.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::link::frame::{leds_payload, Frame, FrameType, Request};
use crate::link::{Link, LinkEvent};
use crate::types::{BoardEvent, Key, Presence, Square, Tone};

/// Seconds without any physical event before the sleep warning starts.
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(900);

/// Length of the warning countdown before the board powers down.
pub const INACTIVITY_WARNING: Duration = Duration::from_secs(120);

/// Map a chess square to its sensor-matrix index.
///
/// The matrix is column-major (files are the major axis) and flipped on
/// both axes relative to the chess orientation.
pub fn to_hw(square: Square) -> u8 {
    (7 - square.file()) * 8 + (7 - square.rank())
}

/// Inverse of [`to_hw`].
pub fn from_hw(hw: u8) -> Square {
    debug_assert!(hw < 64);
    Square::from_coords(7 - hw / 8, 7 - hw % 8)
}

/// Sound behaviour from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SoundMode {
    /// All tones muted.
    Off,
    /// Every tone plays.
    #[default]
    On,
    /// Only move feedback (correct / wrong-move) plays.
    MovesOnly,
}

impl SoundMode {
    fn allows(self, tone: Tone) -> bool {
        match self {
            SoundMode::Off => false,
            SoundMode::On => true,
            SoundMode::MovesOnly => tone.is_move_feedback(),
        }
    }
}

/// LED flash patterns the firmware understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashPattern {
    /// Slow alternation, used for move guidance.
    Guide,
    /// Fast alternation, used for warnings and spurious pieces.
    Alert,
}

impl FlashPattern {
    fn mode_byte(self) -> u8 {
        match self {
            FlashPattern::Guide => 1,
            FlashPattern::Alert => 2,
        }
    }
}

type KeyHandler = Box<dyn Fn(Key) + Send + Sync>;
type SquareHandler = Box<dyn Fn(Square) + Send + Sync>;
type BatteryHandler = Box<dyn Fn(u8, bool) + Send + Sync>;
type ChargerHandler = Box<dyn Fn(bool) + Send + Sync>;
type InactivityWarning = Box<dyn Fn(Duration) + Send + Sync>;
type InactivitySleep = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Handlers {
    keys: Option<KeyHandler>,
    lift: Option<SquareHandler>,
    place: Option<SquareHandler>,
    battery: Option<BatteryHandler>,
    charger: Option<ChargerHandler>,
    on_warning: Option<InactivityWarning>,
    on_sleep: Option<InactivitySleep>,
}

struct Inner {
    link: Link,
    handlers: RwLock<Handlers>,
    /// Piece events buffered while paused; keys always flow.
    buffered: Mutex<Vec<BoardEvent>>,
    paused: AtomicBool,
    /// 180° rotation applied when the board is used black-south.
    flipped: AtomicBool,
    sound: RwLock<SoundMode>,
    last_event: Mutex<Instant>,
}

/// Handle to the physical board. Cheap to clone.
#[derive(Clone)]
pub struct Board {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Board {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Board")
            .field("paused", &self.inner.paused.load(Ordering::Acquire))
            .field("flipped", &self.inner.flipped.load(Ordering::Acquire))
            .finish()
    }
}

/// Board plus its two background tasks (event dispatch, inactivity watch).
pub struct BoardService {
    /// The shareable handle.
    pub board: Board,
    dispatch: JoinHandle<()>,
    watchdog: JoinHandle<()>,
}

impl BoardService {
    /// Wrap an open link. `events` is the receiver paired with the sender
    /// given to [`Link::open`].
    pub fn start(
        link: Link,
        events: mpsc::Receiver<LinkEvent>,
        inactivity_timeout: Duration,
        inactivity_warning: Duration,
    ) -> BoardService {
        let inner = Arc::new(Inner {
            link,
            handlers: RwLock::new(Handlers::default()),
            buffered: Mutex::new(Vec::new()),
            paused: AtomicBool::new(false),
            flipped: AtomicBool::new(false),
            sound: RwLock::new(SoundMode::default()),
            last_event: Mutex::new(Instant::now()),
        });
        let board = Board {
            inner: inner.clone(),
        };
        let dispatch = tokio::spawn(dispatch_loop(inner.clone(), events));
        let watchdog = tokio::spawn(watchdog_loop(
            inner,
            inactivity_timeout,
            inactivity_warning,
        ));
        BoardService {
            board,
            dispatch,
            watchdog,
        }
    }

    /// Stop both background tasks. The link stays open.
    pub fn stop(&self) {
        self.dispatch.abort();
        self.watchdog.abort();
    }
}

impl Board {
    /// Light `squares` steadily at `intensity`.
    pub async fn leds(&self, squares: &[Square], intensity: u8) -> Result<()> {
        let payload = leds_payload(
            0,
            intensity,
            squares.iter().map(|s| to_hw(self.orient(*s))),
        );
        self.inner
            .link
            .command(Frame::new(FrameType::Leds, payload))
            .await
    }

    /// Flash a from→to pair in the given pattern.
    pub async fn led_flash(&self, from: Square, to: Square, pattern: FlashPattern) -> Result<()> {
        let payload = leds_payload(
            pattern.mode_byte(),
            255,
            [to_hw(self.orient(from)), to_hw(self.orient(to))],
        );
        self.inner
            .link
            .command(Frame::new(FrameType::Leds, payload))
            .await
    }

    /// Flash a single square.
    pub async fn led_flash_one(&self, square: Square, pattern: FlashPattern) -> Result<()> {
        let payload = leds_payload(pattern.mode_byte(), 255, [to_hw(self.orient(square))]);
        self.inner
            .link
            .command(Frame::new(FrameType::Leds, payload))
            .await
    }

    /// Turn every LED off.
    pub async fn leds_off(&self) -> Result<()> {
        self.inner
            .link
            .command(Frame::new(
                FrameType::Leds,
                leds_payload(0, 0, std::iter::empty()),
            ))
            .await
    }

    /// Play a buzzer tone, subject to the configured [`SoundMode`].
    pub async fn beep(&self, tone: Tone) -> Result<()> {
        if !self.inner.sound.read().allows(tone) {
            return Ok(());
        }
        self.inner
            .link
            .command(Frame::new(FrameType::Sound, vec![tone.wire_id()]))
            .await
    }

    /// Read the sensor grid as a chess-indexed presence bitmap.
    pub async fn read_board_state(&self) -> Result<Presence> {
        let reply = self.inner.link.request(Request::board_state()).await?;
        let hw_bits = reply.state_bits()?;
        let mut presence = Presence::EMPTY;
        for hw in 0..64u8 {
            if hw_bits & (1 << hw) != 0 {
                presence = presence.with(self.orient(from_hw(hw)));
            }
        }
        Ok(presence)
    }

    /// Whether the serial link is still up.
    pub fn is_link_open(&self) -> bool {
        self.inner.link.is_open()
    }

    /// Close the underlying serial link (shutdown path).
    pub async fn close_link(&self) {
        self.inner.link.close().await;
    }

    /// Ask the controller to power down after a final beep.
    pub async fn request_sleep(&self) -> Result<()> {
        let _ = self.beep(Tone::Power).await;
        self.inner
            .link
            .command(Frame::new(FrameType::Sleep, Vec::new()))
            .await
    }

    /// Register the key handler.
    pub fn subscribe_keys(&self, handler: impl Fn(Key) + Send + Sync + 'static) {
        self.inner.handlers.write().keys = Some(Box::new(handler));
    }

    /// Register the piece-lift handler.
    pub fn subscribe_lift(&self, handler: impl Fn(Square) + Send + Sync + 'static) {
        self.inner.handlers.write().lift = Some(Box::new(handler));
    }

    /// Register the piece-place handler.
    pub fn subscribe_place(&self, handler: impl Fn(Square) + Send + Sync + 'static) {
        self.inner.handlers.write().place = Some(Box::new(handler));
    }

    /// Register the battery handler.
    pub fn subscribe_battery(&self, handler: impl Fn(u8, bool) + Send + Sync + 'static) {
        self.inner.handlers.write().battery = Some(Box::new(handler));
    }

    /// Register the charger handler.
    pub fn subscribe_charger(&self, handler: impl Fn(bool) + Send + Sync + 'static) {
        self.inner.handlers.write().charger = Some(Box::new(handler));
    }

    /// Hooks for the inactivity countdown.
    pub fn set_inactivity_hooks(
        &self,
        on_warning: impl Fn(Duration) + Send + Sync + 'static,
        on_sleep: impl Fn() + Send + Sync + 'static,
    ) {
        let mut handlers = self.inner.handlers.write();
        handlers.on_warning = Some(Box::new(on_warning));
        handlers.on_sleep = Some(Box::new(on_sleep));
    }

    /// Buffer piece events until [`Board::resume_events`]. Key presses keep
    /// flowing; the promotion chooser depends on that.
    pub fn pause_events(&self) {
        self.inner.paused.store(true, Ordering::Release);
    }

    /// Deliver buffered piece events and resume normal dispatch.
    pub fn resume_events(&self) {
        self.inner.paused.store(false, Ordering::Release);
        let buffered: Vec<BoardEvent> = std::mem::take(&mut *self.inner.buffered.lock());
        let handlers = self.inner.handlers.read();
        for event in buffered {
            deliver(&handlers, event);
        }
    }

    /// Drop any piece events buffered while paused.
    pub fn discard_buffered(&self) {
        self.inner.buffered.lock().clear();
    }

    /// Set the sound mode from configuration.
    pub fn set_sound_mode(&self, mode: SoundMode) {
        *self.inner.sound.write() = mode;
    }

    /// Rotate the coordinate space 180° (black plays from the south edge).
    pub fn set_flipped(&self, flipped: bool) {
        self.inner.flipped.store(flipped, Ordering::Release);
    }

    /// Whether the board is currently rotated.
    pub fn is_flipped(&self) -> bool {
        self.inner.flipped.load(Ordering::Acquire)
    }

    fn orient(&self, square: Square) -> Square {
        if self.inner.flipped.load(Ordering::Acquire) {
            Square::new(63 - square.index())
        } else {
            square
        }
    }
}

fn deliver(handlers: &Handlers, event: BoardEvent) {
    match event {
        BoardEvent::KeyPress(key) => {
            if let Some(h) = &handlers.keys {
                h(key);
            }
        }
        BoardEvent::LiftPiece(sq) => {
            if let Some(h) = &handlers.lift {
                h(sq);
            }
        }
        BoardEvent::PlacePiece(sq) => {
            if let Some(h) = &handlers.place {
                h(sq);
            }
        }
        BoardEvent::BatteryTick { percent, charging } => {
            if let Some(h) = &handlers.battery {
                h(percent, charging);
            }
        }
        BoardEvent::ChargerState(plugged) => {
            if let Some(h) = &handlers.charger {
                h(plugged);
            }
        }
    }
}

async fn dispatch_loop(inner: Arc<Inner>, mut events: mpsc::Receiver<LinkEvent>) {
    while let Some(raw) = events.recv().await {
        *inner.last_event.lock() = Instant::now();

        let flipped = inner.flipped.load(Ordering::Acquire);
        let orient = |hw: u8| {
            let sq = from_hw(hw);
            if flipped {
                Square::new(63 - sq.index())
            } else {
                sq
            }
        };
        let event = match raw {
            LinkEvent::Key(key) => BoardEvent::KeyPress(key),
            LinkEvent::Lift { hw } => BoardEvent::LiftPiece(orient(hw)),
            LinkEvent::Place { hw } => BoardEvent::PlacePiece(orient(hw)),
            LinkEvent::Battery { percent, charging } => {
                BoardEvent::BatteryTick { percent, charging }
            }
            LinkEvent::Charger(plugged) => BoardEvent::ChargerState(plugged),
        };

        let piece_event = matches!(
            event,
            BoardEvent::LiftPiece(_) | BoardEvent::PlacePiece(_)
        );
        if piece_event && inner.paused.load(Ordering::Acquire) {
            inner.buffered.lock().push(event);
            continue;
        }
        deliver(&inner.handlers.read(), event);
    }
    debug!("link event channel closed; board dispatch ending");
}

async fn watchdog_loop(inner: Arc<Inner>, timeout: Duration, warning: Duration) {
    let mut warned_at: Option<Instant> = None;
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        interval.tick().await;
        let idle = inner.last_event.lock().elapsed();

        match warned_at {
            None if idle >= timeout => {
                info!(idle_secs = idle.as_secs(), "inactivity warning started");
                warned_at = Some(Instant::now());
                if let Some(h) = &inner.handlers.read().on_warning {
                    h(warning);
                }
            }
            Some(since) => {
                if idle < timeout {
                    // activity resumed during the countdown
                    warned_at = None;
                    continue;
                }
                let left = warning.saturating_sub(since.elapsed());
                if left.is_zero() {
                    info!("inactivity countdown elapsed; powering down");
                    if let Err(e) = inner.link.command(Frame::new(FrameType::Sleep, Vec::new())).await
                    {
                        warn!(error = %e, "sleep command failed");
                    }
                    if let Some(h) = &inner.handlers.read().on_sleep {
                        h();
                    }
                    return;
                }
                if let Some(h) = &inner.handlers.read().on_warning {
                    h(left);
                }
            }
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::EVENT_CHANNEL_CAPACITY;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn hw_transform_is_a_bijection() {
        let mut seen = [false; 64];
        for sq in Square::all() {
            let hw = to_hw(sq);
            assert!(!seen[hw as usize], "duplicate hw index {hw}");
            seen[hw as usize] = true;
            assert_eq!(from_hw(hw), sq);
        }
    }

    #[test]
    fn hw_transform_pinned_corners() {
        // a1 sits at the far corner of the flipped column-major matrix
        assert_eq!(to_hw(Square::from_coords(0, 0)), 63);
        assert_eq!(to_hw(Square::from_coords(7, 7)), 0);
        assert_eq!(to_hw(Square::from_coords(7, 0)), 7);
        assert_eq!(to_hw(Square::from_coords(0, 7)), 56);
    }

    #[test]
    fn sound_mode_gating() {
        assert!(!SoundMode::Off.allows(Tone::Correct));
        assert!(SoundMode::On.allows(Tone::General));
        assert!(SoundMode::MovesOnly.allows(Tone::WrongMove));
        assert!(!SoundMode::MovesOnly.allows(Tone::General));
    }

    async fn board_over_duplex() -> (Board, BoardService, tokio::io::DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(4096);
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let link = Link::open(ours, tx);
        link.set_polling(false);
        let service = BoardService::start(link, rx, INACTIVITY_TIMEOUT, INACTIVITY_WARNING);
        (service.board.clone(), service, theirs)
    }

    #[tokio::test]
    async fn pause_buffers_piece_events_but_not_keys(){
        let (board, _service, mut theirs) = board_over_duplex().await;

        let lifts = Arc::new(AtomicUsize::new(0));
        let keys = Arc::new(AtomicUsize::new(0));
        {
            let lifts = lifts.clone();
            board.subscribe_lift(move |_| {
                lifts.fetch_add(1, Ordering::SeqCst);
            });
            let keys = keys.clone();
            board.subscribe_keys(move |_| {
                keys.fetch_add(1, Ordering::SeqCst);
            });
        }

        board.pause_events();
        use tokio::io::AsyncWriteExt;
        theirs
            .write_all(&Frame::new(FrameType::Lift, vec![to_hw(Square::new(28))]).encode())
            .await
            .unwrap();
        theirs
            .write_all(&Frame::new(FrameType::Key, vec![4]).encode())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(lifts.load(Ordering::SeqCst), 0, "lift must be buffered");
        assert_eq!(keys.load(Ordering::SeqCst), 1, "keys must flow while paused");

        board.resume_events();
        assert_eq!(lifts.load(Ordering::SeqCst), 1, "buffered lift delivered");
    }

    #[tokio::test]
    async fn flipped_board_rotates_events() {
        let (board, _service, mut theirs) = board_over_duplex().await;
        board.set_flipped(true);

        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            board.subscribe_place(move |sq| seen.lock().push(sq));
        }

        use tokio::io::AsyncWriteExt;
        // hardware index of e4 unflipped; flipped it must arrive as d5
        let hw = to_hw(Square::from_coords(4, 3));
        theirs
            .write_all(&Frame::new(FrameType::Place, vec![hw]).encode())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(seen.lock().as_slice(), &[Square::from_coords(3, 4)]);
    }
}
