//! Observable state stores.
//!
//! Five sub-stores - game, clock, analysis, system, cast - each with typed
//! getters, invariant-preserving mutators and subscription registration.
//! Notifications are synchronous fan-out from the mutating thread: an
//! observer must return quickly and must never mutate a store from inside
//! its callback (post to your own task queue instead). Mutators run to
//! completion before the next mutation starts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::types::{
    Color, GameMove, GameResult, RecordedMove, RemoteProtocol, TerminationReason,
};

/// Handle returned by `subscribe`, used to unsubscribe.
pub type SubscriptionId = u64;

type Observer<T> = Box<dyn Fn(&T) + Send + Sync>;

/// A value with synchronous change notification.
pub struct Observable<T> {
    state: RwLock<T>,
    observers: RwLock<Vec<(SubscriptionId, Observer<T>)>>,
    next_id: AtomicU64,
}

impl<T> Observable<T> {
    fn new(initial: T) -> Self {
        Self {
            state: RwLock::new(initial),
            observers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Read access through a closure; the lock is released on return.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.state.read())
    }

    /// Snapshot the current value.
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.state.read().clone()
    }

    /// Mutate, then notify every observer with the new value.
    ///
    /// The write lock is dropped before observers run, so observers may
    /// *read* the store; reentrant mutation is a contract violation.
    pub fn mutate(&self, f: impl FnOnce(&mut T)) {
        {
            let mut state = self.state.write();
            f(&mut state);
        }
        let state = self.state.read();
        for (_, observer) in self.observers.read().iter() {
            observer(&state);
        }
    }

    /// Register an observer; it fires on every subsequent mutation.
    pub fn subscribe(&self, observer: impl Fn(&T) + Send + Sync + 'static) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.observers.write().push((id, Box::new(observer)));
        id
    }

    /// Remove an observer. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.observers.write().retain(|(oid, _)| *oid != id);
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observable")
            .field("state", &*self.state.read())
            .field("observers", &self.observers.read().len())
            .finish()
    }
}

/// Authoritative game view for widgets and emulators.
#[derive(Debug, Clone, Default)]
pub struct GameState {
    /// Database id of the unterminated game, if one is open.
    pub game_id: Option<i64>,
    /// FEN of the current position.
    pub fen: String,
    /// Side to move.
    pub turn: Option<Color>,
    /// Committed moves since the opening position.
    pub moves: Vec<RecordedMove>,
    /// Most recently committed move.
    pub last_move: Option<GameMove>,
    /// Move chosen by an engine/online opponent, awaiting physical execution.
    pub pending_move: Option<GameMove>,
    /// White player display name.
    pub white_name: String,
    /// Black player display name.
    pub black_name: String,
    /// Result once the game terminated.
    pub result: Option<GameResult>,
    /// Why the game terminated.
    pub termination: Option<TerminationReason>,
    /// Whether the engine is guiding the user through correction mode.
    pub in_correction: bool,
    /// Side to move is in check.
    pub check: bool,
}

/// Clock view; edited only by the clock service.
#[derive(Debug, Clone)]
pub struct ClockState {
    /// White's remaining (or elapsed, when untimed) milliseconds.
    pub white_ms: u64,
    /// Black's remaining (or elapsed, when untimed) milliseconds.
    pub black_ms: u64,
    /// Whose clock runs.
    pub active: Color,
    /// Whether the clock is ticking.
    pub running: bool,
    /// Timed game (count down) vs free game (count up).
    pub timed: bool,
    /// Increment applied on turn switch.
    pub increment_ms: u64,
    /// Side whose flag fell, if any.
    pub flagged: Option<Color>,
}

impl Default for ClockState {
    fn default() -> Self {
        Self {
            white_ms: 0,
            black_ms: 0,
            active: Color::White,
            running: false,
            timed: false,
            increment_ms: 0,
            flagged: None,
        }
    }
}

/// Evaluation history, append-only per ply.
#[derive(Debug, Clone, Default)]
pub struct AnalysisState {
    /// Centipawn score per ply, white-positive. Index = ply - 1.
    pub scores: Vec<i32>,
    /// Latest evaluation, if an engine is watching.
    pub current: Option<i32>,
}

/// Device-level state: battery, transport, alerts.
#[derive(Debug, Clone, Default)]
pub struct SystemState {
    /// Battery percent 0..100.
    pub battery_percent: u8,
    /// Charger feeding the battery.
    pub charging: bool,
    /// An app is connected over Bluetooth.
    pub bt_connected: bool,
    /// Protocol the remote session locked onto.
    pub remote_protocol: RemoteProtocol,
    /// Discoverability window currently open.
    pub discoverable: bool,
    /// Modal alert text to render, if any.
    pub alert: Option<String>,
    /// Persistent banner (e.g. storage outage), if any.
    pub banner: Option<String>,
}

/// Screen-cast mirroring state.
#[derive(Debug, Clone, Default)]
pub struct CastState {
    /// Friendly name of the cast target.
    pub target: Option<String>,
    /// Whether mirroring is active.
    pub active: bool,
}

/// The five sub-stores, constructed once at boot and shared by handle.
#[derive(Debug, Clone)]
pub struct Store {
    /// Game sub-store.
    pub game: Arc<Observable<GameState>>,
    /// Clock sub-store.
    pub clock: Arc<Observable<ClockState>>,
    /// Analysis sub-store.
    pub analysis: Arc<Observable<AnalysisState>>,
    /// System sub-store.
    pub system: Arc<Observable<SystemState>>,
    /// Cast sub-store.
    pub cast: Arc<Observable<CastState>>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    /// Fresh stores with default states.
    pub fn new() -> Store {
        Store {
            game: Arc::new(Observable::new(GameState::default())),
            clock: Arc::new(Observable::new(ClockState::default())),
            analysis: Arc::new(Observable::new(AnalysisState::default())),
            system: Arc::new(Observable::new(SystemState::default())),
            cast: Arc::new(Observable::new(CastState::default())),
        }
    }

    /// Record a committed move: position, stack and last-move in one
    /// mutation, so observers see a consistent game state.
    pub fn commit_move(&self, recorded: RecordedMove, mv: GameMove, fen: String, turn: Color, check: bool) {
        self.game.mutate(|g| {
            g.fen = fen.clone();
            g.turn = Some(turn);
            g.moves.push(recorded);
            g.last_move = Some(mv);
            g.pending_move = None;
            g.check = check;
        });
    }

    /// Remove the last committed move (takeback).
    pub fn pop_move(&self, fen: String, turn: Color) {
        self.game.mutate(|g| {
            g.moves.pop();
            g.fen = fen.clone();
            g.turn = Some(turn);
            g.last_move = g
                .moves
                .last()
                .and_then(|m| crate::types::GameMove::from_uci(&m.uci));
            g.check = false;
        });
    }

    /// Terminate the game. Stops the clock first so no observer ever sees
    /// a finished game with a running clock.
    pub fn finish_game(&self, result: GameResult, reason: TerminationReason) {
        self.clock.mutate(|c| c.running = false);
        self.game.mutate(|g| {
            g.result = Some(result.clone());
            g.termination = Some(reason);
            g.pending_move = None;
            g.in_correction = false;
        });
    }

    /// Reset game, clock and analysis for a fresh game.
    pub fn start_game(
        &self,
        game_id: Option<i64>,
        fen: String,
        turn: Color,
        white_name: String,
        black_name: String,
    ) {
        self.analysis.mutate(|a| {
            a.scores.clear();
            a.current = None;
        });
        self.clock.mutate(|c| {
            c.flagged = None;
            c.running = false;
        });
        self.game.mutate(|g| {
            *g = GameState {
                game_id,
                fen: fen.clone(),
                turn: Some(turn),
                white_name: white_name.clone(),
                black_name: black_name.clone(),
                ..GameState::default()
            };
        });
    }

    /// Append an evaluation for the given ply. Scores are append-only;
    /// an out-of-order ply is ignored.
    pub fn push_score(&self, ply: u32, centipawns: i32) {
        self.analysis.mutate(|a| {
            if a.scores.len() as u32 + 1 == ply {
                a.scores.push(centipawns);
                a.current = Some(centipawns);
            }
        });
    }
}
