//! The game engine: physical events in, committed moves out.
//!
//! Consumes lift/place events from the board, forms legal moves against the
//! authoritative position, and guides the user back whenever the physical
//! board diverges (correction mode). Castling is accepted king-first or
//! rook-first with the second half due inside a settle window; promotion
//! blocks piece events and waits on a key. Every committed move is
//! persisted atomically with the position update.

pub mod correction;
pub mod position;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::board::{Board, FlashPattern};
use crate::db::{Db, GameRecord};
use crate::error::{Error, Result};
use crate::store::Store;
use crate::types::{
    Color, GameMove, GameResult, Key, Presence, PromotionRole, RecordedMove, Square,
    TerminationReason, Tone,
};
use correction::CorrectionPlan;
use position::LiveGame;

/// Window for the second half of a castling gesture and for post-move
/// sensor settling.
pub const SETTLE_WINDOW: Duration = Duration::from_secs(5);

/// Holding a king off the board this long opens the resign/draw menu.
pub const KING_HOLD_RESIGN: Duration = Duration::from_secs(3);

/// Promotion chooser wait before defaulting to queen.
pub const PROMOTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Storage outage longer than this raises the persistent banner.
pub const PERSISTENCE_BANNER_AFTER: Duration = Duration::from_secs(60);

const LED_GUIDE_INTENSITY: u8 = 200;

/// d4, e4, d5, e5 - the mutual-draw gesture squares.
fn center_squares() -> [Square; 4] {
    [
        Square::from_coords(3, 3),
        Square::from_coords(4, 3),
        Square::from_coords(3, 4),
        Square::from_coords(4, 4),
    ]
}

/// Board operations the engine needs, abstracted for tests.
#[async_trait]
pub trait BoardIo: Send + Sync {
    /// Light squares steadily.
    async fn leds(&self, squares: &[Square], intensity: u8) -> Result<()>;
    /// Flash a from→to pair.
    async fn led_flash(&self, from: Square, to: Square, pattern: FlashPattern) -> Result<()>;
    /// Flash a single square.
    async fn led_flash_one(&self, square: Square, pattern: FlashPattern) -> Result<()>;
    /// All LEDs off.
    async fn leds_off(&self) -> Result<()>;
    /// Buzzer.
    async fn beep(&self, tone: Tone) -> Result<()>;
    /// Read the sensor grid.
    async fn read_board_state(&self) -> Result<Presence>;
    /// Stop delivering piece events (keys keep flowing).
    fn pause_events(&self);
    /// Resume piece event delivery.
    fn resume_events(&self);
    /// Drop piece events buffered while paused.
    fn discard_buffered(&self);
}

#[async_trait]
impl BoardIo for Board {
    async fn leds(&self, squares: &[Square], intensity: u8) -> Result<()> {
        Board::leds(self, squares, intensity).await
    }
    async fn led_flash(&self, from: Square, to: Square, pattern: FlashPattern) -> Result<()> {
        Board::led_flash(self, from, to, pattern).await
    }
    async fn led_flash_one(&self, square: Square, pattern: FlashPattern) -> Result<()> {
        Board::led_flash_one(self, square, pattern).await
    }
    async fn leds_off(&self) -> Result<()> {
        Board::leds_off(self).await
    }
    async fn beep(&self, tone: Tone) -> Result<()> {
        Board::beep(self, tone).await
    }
    async fn read_board_state(&self) -> Result<Presence> {
        Board::read_board_state(self).await
    }
    fn pause_events(&self) {
        Board::pause_events(self);
    }
    fn resume_events(&self) {
        Board::resume_events(self);
    }
    fn discard_buffered(&self) {
        Board::discard_buffered(self);
    }
}

/// Notifications the engine pushes to its observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A move was committed to the position and the record.
    MoveCommitted {
        /// The move.
        mv: GameMove,
        /// Its SAN.
        san: String,
        /// Who moved.
        by: Color,
        /// The opponent is now in check.
        check: bool,
        /// The opponent's queen is now attacked.
        queen_threat: bool,
    },
    /// The game terminated.
    GameOver {
        /// Final result.
        result: GameResult,
        /// Why.
        reason: TerminationReason,
    },
    /// The physical board diverged; guidance is on.
    CorrectionEntered,
    /// The physical board matches again.
    CorrectionExited,
    /// Promotion chooser is showing for `color`.
    PromotionChooser {
        /// Promoting side.
        color: Color,
    },
    /// The chooser timed out and queen was committed.
    PromotionTimeout,
    /// A king was held off the board; offer resign/draw for `color`.
    ResignMenu {
        /// Whose king was lifted.
        color: Color,
    },
    /// Both kings were placed in the center: mutual draw offer.
    DrawOffer,
    /// A takeback reverted the last move.
    TakebackApplied,
}

/// Move-formation state.
#[derive(Debug, Clone)]
enum Phase {
    /// Nothing in hand.
    Idle,
    /// A piece of the side to move is in hand.
    OwnLifted {
        from: Square,
        legal: Vec<Square>,
        lifted_at: Instant,
        king: Option<Color>,
    },
    /// An opponent piece is in hand (capture preparation).
    OppLifted {
        victim: Square,
        lifted_at: Instant,
        king: Option<Color>,
    },
    /// Both an own piece and its victim are in hand.
    BothLifted {
        from: Square,
        legal: Vec<Square>,
        victim: Square,
    },
    /// A castling gesture is half done.
    Castling {
        mv: GameMove,
        rook_from: Square,
        rook_to: Square,
        king_from: Square,
        king_placed: bool,
        rook_placed: bool,
        /// Plain rook move to commit if the window expires rook-only.
        fallback: Option<GameMove>,
        deadline: Instant,
    },
    /// Pawn reached the last rank; waiting on the chooser key.
    Promotion {
        from: Square,
        to: Square,
        color: Color,
        deadline: Instant,
    },
    /// Physical and logical positions diverged; guiding the user back.
    Correction { expected: Presence },
}

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Castling second-half window.
    pub settle_window: Duration,
    /// Promotion chooser wait.
    pub promotion_timeout: Duration,
    /// King-hold resign threshold.
    pub king_hold: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            settle_window: SETTLE_WINDOW,
            promotion_timeout: PROMOTION_TIMEOUT,
            king_hold: KING_HOLD_RESIGN,
        }
    }
}

#[derive(Debug, Clone)]
enum DirtyWrite {
    Append(RecordedMove),
    DeleteLast,
    Finish(GameResult),
}

type EngineObserver = Box<dyn Fn(&EngineEvent) + Send + Sync>;

/// The authoritative game state machine. Owned by the game worker task;
/// every method runs under that task's implicit game lock.
pub struct GameEngine {
    game: LiveGame,
    phase: Phase,
    board: Arc<dyn BoardIo>,
    store: Store,
    db: Db,
    config: EngineConfig,
    game_id: Option<i64>,
    observers: Vec<EngineObserver>,
    pending_move: Option<GameMove>,
    /// Kings currently believed off the board, by color.
    kings_off: [bool; 2],
    resign_menu_open: bool,
    /// Writes that failed and await retry on the next commit.
    dirty: Vec<DirtyWrite>,
    dirty_since: Option<Instant>,
    game_over: bool,
    /// Mirror mode (remote controller): track the position for the display
    /// but never fight the app over LEDs or corrections.
    mirror: bool,
}

impl std::fmt::Debug for GameEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GameEngine")
            .field("phase", &self.phase)
            .field("game_id", &self.game_id)
            .field("game_over", &self.game_over)
            .finish()
    }
}

impl GameEngine {
    /// Build an engine with no game loaded.
    pub fn new(board: Arc<dyn BoardIo>, store: Store, db: Db, config: EngineConfig) -> GameEngine {
        GameEngine {
            game: LiveGame::new(),
            phase: Phase::Idle,
            board,
            store,
            db,
            config,
            game_id: None,
            observers: Vec::new(),
            pending_move: None,
            kings_off: [false, false],
            resign_menu_open: false,
            dirty: Vec::new(),
            dirty_since: None,
            game_over: false,
            mirror: false,
        }
    }

    /// Register an observer for engine events.
    pub fn subscribe(&mut self, observer: impl Fn(&EngineEvent) + Send + Sync + 'static) {
        self.observers.push(Box::new(observer));
    }

    /// Start a fresh game from the initial position and persist its record.
    pub async fn start_game(&mut self, white: &str, black: &str, source: &str) -> Result<()> {
        self.game = LiveGame::new();
        self.phase = Phase::Idle;
        self.pending_move = None;
        self.kings_off = [false, false];
        self.resign_menu_open = false;
        self.game_over = false;
        self.game_id = Some(
            self.db
                .create_game(white, black, source, self.game.opening_fen())?,
        );
        self.store.start_game(
            self.game_id,
            self.game.fen(),
            self.game.turn(),
            white.to_string(),
            black.to_string(),
        );
        // reconcile the physical board before play starts
        let physical = self.board.read_board_state().await?;
        if physical != self.game.presence() {
            self.enter_correction().await?;
        }
        info!(game_id = ?self.game_id, "game started");
        Ok(())
    }

    /// Resume the unterminated game `record`, reconciling the physical
    /// board through correction mode.
    pub async fn resume(&mut self, record: &GameRecord) -> Result<()> {
        let moves = self.db.moves_for(record.id)?;
        let ucis: Vec<String> = moves.iter().map(|m| m.uci.clone()).collect();
        self.game = LiveGame::replay(&record.opening_fen, &ucis)?;
        self.game_id = Some(record.id);
        self.phase = Phase::Idle;
        self.pending_move = None;
        self.game_over = false;
        self.store.start_game(
            self.game_id,
            self.game.fen(),
            self.game.turn(),
            record.white.clone(),
            record.black.clone(),
        );
        self.store.game.mutate(|g| g.moves = moves);
        info!(game_id = record.id, plies = self.game.ply(), "game resumed");
        self.enter_correction().await
    }

    /// FEN of the authoritative position.
    pub fn fen(&self) -> String {
        self.game.fen()
    }

    /// Side to move.
    pub fn turn(&self) -> Color {
        self.game.turn()
    }

    /// Whether correction guidance is active.
    pub fn in_correction(&self) -> bool {
        matches!(self.phase, Phase::Correction { .. })
    }

    /// Whether the game has terminated.
    pub fn is_over(&self) -> bool {
        self.game_over
    }

    /// Show an engine/online move on the LEDs; it commits when the human
    /// physically executes it.
    pub async fn set_pending_move(&mut self, mv: GameMove) -> Result<()> {
        self.pending_move = Some(mv);
        self.store.game.mutate(|g| g.pending_move = Some(mv));
        self.board
            .led_flash(mv.from, mv.to, FlashPattern::Guide)
            .await
    }

    /// Key-initiated takeback: pop the last move and guide the board back.
    pub async fn takeback(&mut self) -> Result<()> {
        if self.game_over {
            return Ok(());
        }
        let Some(popped) = self.game.pop() else {
            return Ok(());
        };
        debug!(uci = %popped.uci, "takeback");
        self.persist(DirtyWrite::DeleteLast);
        self.store.pop_move(self.game.fen(), self.game.turn());
        self.pending_move = None;
        self.emit(&EngineEvent::TakebackApplied);
        self.enter_correction().await
    }

    /// Resignation from the menu or the king-lift gesture.
    pub async fn resign(&mut self, color: Color) -> Result<()> {
        let result = match color {
            Color::White => GameResult::BlackWins,
            Color::Black => GameResult::WhiteWins,
        };
        self.finish(result, TerminationReason::Resignation).await
    }

    /// Draw by agreement.
    pub async fn agree_draw(&mut self) -> Result<()> {
        self.finish(GameResult::Draw, TerminationReason::DrawAgreement)
            .await
    }

    /// Flag fall reported by the clock service.
    pub async fn flag(&mut self, color: Color) -> Result<()> {
        let result = match color {
            Color::White => GameResult::BlackWins,
            Color::Black => GameResult::WhiteWins,
        };
        self.finish(result, TerminationReason::FlagFall).await
    }

    /// Abort without a chess result (e.g. remote session dropped).
    pub async fn abort(&mut self, code: &str) -> Result<()> {
        self.finish(
            GameResult::Aborted(code.to_string()),
            TerminationReason::Abandoned,
        )
        .await
    }

    /// Re-enter correction mode, e.g. after a link loss was recovered.
    pub async fn reconcile(&mut self) -> Result<()> {
        self.enter_correction().await
    }

    /// Switch mirror mode. While mirrored the engine tracks the position
    /// for the display but leaves LEDs and guidance to the remote app.
    pub fn set_mirror(&mut self, mirror: bool) {
        self.mirror = mirror;
    }

    /// Start an unpersisted game for mirroring a remote session.
    pub fn start_mirror(&mut self) {
        self.game = LiveGame::new();
        self.phase = Phase::Idle;
        self.pending_move = None;
        self.kings_off = [false, false];
        self.game_id = None;
        self.game_over = false;
        self.mirror = true;
        self.store.start_game(
            None,
            self.game.fen(),
            self.game.turn(),
            "App".to_string(),
            "Board".to_string(),
        );
    }

    /// Terminate with a result decided outside the position (online game
    /// ended, remote session aborted).
    pub async fn finish_external(&mut self, result: GameResult) -> Result<()> {
        let reason = match &result {
            GameResult::Draw => TerminationReason::DrawAgreement,
            GameResult::WhiteWins | GameResult::BlackWins => TerminationReason::Resignation,
            GameResult::Aborted(_) => TerminationReason::Abandoned,
        };
        self.finish(result, reason).await
    }

    /// UCI strings of every committed move, oldest first.
    pub fn move_ucis(&self) -> Vec<String> {
        self.game.moves().iter().map(|m| m.uci.clone()).collect()
    }

    /// Feed one piece event. Key events go through [`GameEngine::handle_key`].
    pub async fn handle_event(&mut self, event: crate::types::BoardEvent) -> Result<()> {
        use crate::types::BoardEvent;
        if self.game_over {
            return Ok(());
        }
        match event {
            BoardEvent::LiftPiece(sq) => self.on_lift(sq).await,
            BoardEvent::PlacePiece(sq) => self.on_place(sq).await,
            BoardEvent::KeyPress(key) => {
                self.handle_key(key).await?;
                Ok(())
            }
            BoardEvent::BatteryTick { .. } | BoardEvent::ChargerState(_) => Ok(()),
        }
    }

    /// Feed a key press. Returns `true` when the engine consumed it
    /// (promotion chooser); the controller owns every other key.
    pub async fn handle_key(&mut self, key: Key) -> Result<bool> {
        if let Phase::Promotion { from, to, .. } = self.phase {
            let Some(role) = promotion_choice(key) else {
                return Ok(true); // swallow unrelated keys while choosing
            };
            self.board.discard_buffered();
            self.board.resume_events();
            self.phase = Phase::Idle;
            self.commit(GameMove {
                from,
                to,
                promotion: Some(role),
            })
            .await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Drive time-based transitions: castle window, promotion timeout,
    /// king-hold gesture, persistence banner. Call at a coarse cadence.
    pub async fn handle_tick(&mut self, now: Instant) -> Result<()> {
        if self.game_over {
            return Ok(());
        }
        // storage outage banner
        if let Some(since) = self.dirty_since {
            if now.duration_since(since) >= PERSISTENCE_BANNER_AFTER {
                self.store.system.mutate(|s| {
                    s.banner = Some("storage unavailable: game kept in memory".into());
                });
            }
        }

        match &self.phase {
            Phase::OwnLifted {
                lifted_at,
                king: Some(color),
                ..
            }
            | Phase::OppLifted {
                lifted_at,
                king: Some(color),
                ..
            } => {
                if !self.resign_menu_open && now.duration_since(*lifted_at) >= self.config.king_hold
                {
                    self.resign_menu_open = true;
                    let color = *color;
                    self.emit(&EngineEvent::ResignMenu { color });
                }
                Ok(())
            }
            Phase::Castling {
                deadline,
                king_placed,
                fallback,
                ..
            } if now >= *deadline => {
                if !*king_placed {
                    if let Some(plain) = *fallback {
                        // the rook move stands on its own
                        self.phase = Phase::Idle;
                        return self.commit(plain).await;
                    }
                }
                warn!("castling window expired");
                self.enter_correction().await
            }
            Phase::Promotion { from, to, deadline, .. } if now >= *deadline => {
                let (from, to) = (*from, *to);
                self.board.discard_buffered();
                self.board.resume_events();
                self.phase = Phase::Idle;
                self.emit(&EngineEvent::PromotionTimeout);
                self.commit(GameMove {
                    from,
                    to,
                    promotion: Some(PromotionRole::Queen),
                })
                .await
            }
            _ => Ok(()),
        }
    }

    async fn on_lift(&mut self, sq: Square) -> Result<()> {
        if let Some(color) = self.game.king_at(sq) {
            self.kings_off[color_index(color)] = true;
        }
        match &self.phase {
            Phase::Correction { .. } => self.refresh_correction().await,
            Phase::Idle => {
                if self.game.is_own_piece(sq) {
                    let legal = self.game.legal_destinations(sq);
                    self.phase = Phase::OwnLifted {
                        from: sq,
                        legal,
                        lifted_at: Instant::now(),
                        king: self.game.king_at(sq),
                    };
                    Ok(())
                } else if self.game.is_opponent_piece(sq) {
                    self.phase = Phase::OppLifted {
                        victim: sq,
                        lifted_at: Instant::now(),
                        king: self.game.king_at(sq),
                    };
                    Ok(())
                } else {
                    // sensor ghost on an empty square
                    warn!(square = %sq, "lift from empty square ignored");
                    Ok(())
                }
            }
            Phase::OwnLifted { from, legal, .. } => {
                let (from, legal) = (*from, legal.clone());
                if self.game.is_opponent_piece(sq) && self.can_capture(from, &legal, sq) {
                    self.phase = Phase::BothLifted {
                        from,
                        legal,
                        victim: sq,
                    };
                    Ok(())
                } else if let Some((mv, rook_from, rook_to, king_from)) =
                    self.castle_for_pieces(from, sq)
                {
                    self.phase = Phase::Castling {
                        mv,
                        rook_from,
                        rook_to,
                        king_from,
                        king_placed: false,
                        rook_placed: false,
                        fallback: None,
                        deadline: Instant::now() + self.config.settle_window,
                    };
                    Ok(())
                } else {
                    self.wrong_move().await
                }
            }
            Phase::OppLifted { victim, .. } => {
                let victim = *victim;
                if self.game.is_own_piece(sq) {
                    let legal = self.game.legal_destinations(sq);
                    if self.can_capture(sq, &legal, victim) {
                        self.phase = Phase::BothLifted {
                            from: sq,
                            legal,
                            victim,
                        };
                        return Ok(());
                    }
                }
                self.wrong_move().await
            }
            Phase::Castling {
                rook_from,
                king_from,
                ..
            } => {
                // lifting the outstanding castle piece is expected
                if sq == *rook_from || sq == *king_from {
                    Ok(())
                } else {
                    self.wrong_move().await
                }
            }
            Phase::BothLifted { .. } => self.wrong_move().await,
            // piece events are paused during promotion; anything that
            // slips through is stale
            Phase::Promotion { .. } => Ok(()),
        }
    }

    async fn on_place(&mut self, sq: Square) -> Result<()> {
        // kings-in-center mutual draw gesture
        if self.kings_off == [true, true] && center_squares().contains(&sq) {
            self.kings_off = [false, false];
            self.emit(&EngineEvent::DrawOffer);
        }

        match &self.phase {
            Phase::Correction { .. } => self.refresh_correction().await,
            Phase::Idle => {
                // a place with nothing in hand: check divergence
                let physical = self.board.read_board_state().await?;
                if physical != self.game.presence() {
                    self.enter_correction().await
                } else {
                    Ok(())
                }
            }
            Phase::OwnLifted {
                from, legal, king, ..
            } => {
                let (from, legal, king) = (*from, legal.clone(), *king);
                if sq == from {
                    // put back: no-op
                    if let Some(color) = king {
                        self.kings_off[color_index(color)] = false;
                    }
                    self.phase = Phase::Idle;
                    self.resign_menu_open = false;
                    return Ok(());
                }
                if !legal.contains(&sq) {
                    return self.wrong_move().await;
                }
                if let Some(color) = king {
                    self.kings_off[color_index(color)] = false;
                }
                if self.game.needs_promotion(from, sq) {
                    return self.open_promotion(from, sq).await;
                }
                let mv = GameMove::new(from, sq);
                if let Some((rook_from, rook_to)) = self.game.castling_rook_path(mv) {
                    self.phase = Phase::Castling {
                        mv,
                        rook_from,
                        rook_to,
                        king_from: from,
                        king_placed: true,
                        rook_placed: false,
                        fallback: None,
                        deadline: Instant::now() + self.config.settle_window,
                    };
                    // guide the rook half
                    self.board
                        .led_flash(rook_from, rook_to, FlashPattern::Guide)
                        .await?;
                    return Ok(());
                }
                if let Some((castle, rook_from, king_from, king_to)) =
                    self.rook_first_castle(from, sq)
                {
                    self.phase = Phase::Castling {
                        mv: castle,
                        rook_from,
                        rook_to: sq,
                        king_from,
                        king_placed: false,
                        rook_placed: true,
                        fallback: Some(mv),
                        deadline: Instant::now() + self.config.settle_window,
                    };
                    self.board
                        .led_flash(king_from, king_to, FlashPattern::Guide)
                        .await?;
                    return Ok(());
                }
                self.phase = Phase::Idle;
                self.commit(mv).await
            }
            Phase::OppLifted { victim, king, .. } => {
                let (victim, king) = (*victim, *king);
                if sq == victim {
                    if let Some(color) = king {
                        self.kings_off[color_index(color)] = false;
                    }
                    self.phase = Phase::Idle;
                    self.resign_menu_open = false;
                    return Ok(());
                }
                self.wrong_move().await
            }
            Phase::BothLifted {
                from,
                legal,
                victim,
            } => {
                let (from, legal, victim) = (*from, legal.clone(), *victim);
                if legal.contains(&sq) && self.capture_matches(from, sq, victim) {
                    if self.game.needs_promotion(from, sq) {
                        return self.open_promotion(from, sq).await;
                    }
                    self.phase = Phase::Idle;
                    return self.commit(GameMove::new(from, sq)).await;
                }
                if sq == from {
                    // attacker went back; the victim is still in hand
                    self.phase = Phase::OppLifted {
                        victim,
                        lifted_at: Instant::now(),
                        king: self.game.king_at(victim),
                    };
                    return Ok(());
                }
                self.wrong_move().await
            }
            Phase::Castling {
                mv,
                rook_from,
                rook_to,
                king_from,
                king_placed,
                rook_placed,
                fallback,
                deadline,
            } => {
                let (mv, rook_from, rook_to, king_from) = (*mv, *rook_from, *rook_to, *king_from);
                let (mut king_placed, mut rook_placed) = (*king_placed, *rook_placed);
                let (fallback, deadline) = (*fallback, *deadline);
                if sq == mv.to {
                    king_placed = true;
                } else if sq == rook_to {
                    rook_placed = true;
                } else {
                    return self.wrong_move().await;
                }
                if king_placed && rook_placed {
                    self.phase = Phase::Idle;
                    self.board.leds_off().await?;
                    return self.commit(mv).await;
                }
                self.phase = Phase::Castling {
                    mv,
                    rook_from,
                    rook_to,
                    king_from,
                    king_placed,
                    rook_placed,
                    fallback,
                    deadline,
                };
                Ok(())
            }
            Phase::Promotion { .. } => Ok(()),
        }
    }

    fn can_capture(&self, from: Square, legal: &[Square], victim: Square) -> bool {
        legal.iter().any(|to| self.capture_matches(from, *to, victim))
            && self.game.is_opponent_piece(victim)
    }

    /// Whether playing `from`→`to` removes the piece on `victim` - the
    /// destination square itself, or the bypassed pawn for en passant.
    fn capture_matches(&self, from: Square, to: Square, victim: Square) -> bool {
        if to == victim {
            return true;
        }
        // en passant: captured pawn sits on (to.file, from.rank)
        self.game.is_opponent_piece(victim)
            && victim == Square::from_coords(to.file(), from.rank())
            && self
                .game
                .find(GameMove::new(from, to))
                .is_some_and(|m| matches!(m, shakmaty::Move::EnPassant { .. }))
    }

    /// King+rook lifted together: the castle they describe, if legal.
    fn castle_for_pieces(
        &self,
        a: Square,
        b: Square,
    ) -> Option<(GameMove, Square, Square, Square)> {
        for (king_sq, other) in [(a, b), (b, a)] {
            if self.game.king_at(king_sq) != Some(self.game.turn()) {
                continue;
            }
            for to in self.game.legal_destinations(king_sq) {
                let mv = GameMove::new(king_sq, to);
                if let Some((rook_from, rook_to)) = self.game.castling_rook_path(mv) {
                    if rook_from == other {
                        return Some((mv, rook_from, rook_to, king_sq));
                    }
                }
            }
        }
        None
    }

    /// A rook just moved `from`→`to`; if that pair is the rook half of a
    /// legal castle, return `(castle_move, rook_from, king_from, king_to)`.
    fn rook_first_castle(
        &self,
        from: Square,
        to: Square,
    ) -> Option<(GameMove, Square, Square, Square)> {
        // find the king of the side to move
        for king_sq in Square::all() {
            if self.game.king_at(king_sq) != Some(self.game.turn()) {
                continue;
            }
            for king_to in self.game.legal_destinations(king_sq) {
                let castle = GameMove::new(king_sq, king_to);
                if let Some((rook_from, rook_to)) = self.game.castling_rook_path(castle) {
                    if rook_from == from && rook_to == to {
                        return Some((castle, rook_from, king_sq, king_to));
                    }
                }
            }
            break;
        }
        None
    }

    async fn open_promotion(&mut self, from: Square, to: Square) -> Result<()> {
        let color = self.game.turn();
        self.board.pause_events();
        self.phase = Phase::Promotion {
            from,
            to,
            color,
            deadline: Instant::now() + self.config.promotion_timeout,
        };
        self.emit(&EngineEvent::PromotionChooser { color });
        Ok(())
    }

    async fn wrong_move(&mut self) -> Result<()> {
        if self.mirror {
            // the app owns the guidance; just resync silently
            self.phase = Phase::Idle;
            return Ok(());
        }
        self.board.beep(Tone::WrongMove).await?;
        self.enter_correction().await
    }

    async fn commit(&mut self, mv: GameMove) -> Result<()> {
        let by = self.game.turn();
        let recorded = match self.game.play(mv) {
            Ok(r) => r,
            Err(Error::IllegalMove { .. }) => return self.wrong_move().await,
            Err(e) => return Err(e),
        };
        self.persist(DirtyWrite::Append(recorded.clone()));

        let check = self.game.is_check();
        let queen_threat = self.game.queen_under_threat();
        self.store.commit_move(
            recorded.clone(),
            mv,
            self.game.fen(),
            self.game.turn(),
            check,
        );
        self.pending_move = None;
        self.resign_menu_open = false;
        self.kings_off = [false, false];
        self.board.leds_off().await?;
        self.board.beep(Tone::Correct).await?;
        self.emit(&EngineEvent::MoveCommitted {
            mv,
            san: recorded.san.clone(),
            by,
            check,
            queen_threat,
        });

        if let Some(reason) = self.game.termination() {
            let result = self.game.result_for(reason);
            self.finish(result, reason).await?;
        }
        Ok(())
    }

    async fn finish(&mut self, result: GameResult, reason: TerminationReason) -> Result<()> {
        if self.game_over {
            return Ok(());
        }
        self.game_over = true;
        self.persist(DirtyWrite::Finish(result.clone()));
        self.store.finish_game(result.clone(), reason);
        self.board.leds_off().await?;
        self.board.beep(Tone::General).await?;
        info!(result = %result.as_str(), ?reason, "game over");
        self.emit(&EngineEvent::GameOver { result, reason });
        Ok(())
    }

    /// Apply a write, draining earlier dirty writes first. A failure keeps
    /// the write queued; the move stays committed in memory.
    fn persist(&mut self, write: DirtyWrite) {
        let Some(game_id) = self.game_id else {
            return;
        };
        self.dirty.push(write);
        while let Some(next) = self.dirty.first().cloned() {
            let outcome = match &next {
                DirtyWrite::Append(mv) => self.db.append_move(game_id, mv),
                DirtyWrite::DeleteLast => self.db.delete_last_move(game_id),
                DirtyWrite::Finish(result) => self.db.finish_game(game_id, result),
            };
            match outcome {
                Ok(()) => {
                    self.dirty.remove(0);
                    self.dirty_since = None;
                    self.store.system.mutate(|s| s.banner = None);
                }
                Err(e) => {
                    warn!(error = %e, queued = self.dirty.len(), "persist failed; will retry");
                    if self.dirty_since.is_none() {
                        self.dirty_since = Some(Instant::now());
                    }
                    break;
                }
            }
        }
    }

    async fn enter_correction(&mut self) -> Result<()> {
        let expected = self.game.presence();
        let entering = !matches!(self.phase, Phase::Correction { .. });
        self.phase = Phase::Correction { expected };
        if entering {
            self.store.game.mutate(|g| g.in_correction = true);
            self.emit(&EngineEvent::CorrectionEntered);
        }
        self.refresh_correction().await
    }

    async fn refresh_correction(&mut self) -> Result<()> {
        let Phase::Correction { expected } = self.phase else {
            return Ok(());
        };
        let physical = self.board.read_board_state().await?;
        let plan = correction::plan(physical, expected);
        if plan.is_settled() {
            return self.exit_correction().await;
        }
        self.light_plan(&plan).await
    }

    async fn light_plan(&mut self, plan: &CorrectionPlan) -> Result<()> {
        self.board.leds_off().await?;
        if !plan.missing.is_empty() {
            self.board.leds(&plan.missing, LED_GUIDE_INTENSITY).await?;
        }
        for sq in &plan.spurious {
            self.board.led_flash_one(*sq, FlashPattern::Alert).await?;
        }
        Ok(())
    }

    async fn exit_correction(&mut self) -> Result<()> {
        self.phase = Phase::Idle;
        self.kings_off = [false, false];
        self.resign_menu_open = false;
        self.board.leds_off().await?;
        self.board.beep(Tone::Correct).await?;
        self.board.discard_buffered();
        self.store.game.mutate(|g| g.in_correction = false);
        self.emit(&EngineEvent::CorrectionExited);
        // the engine/online move guidance is still owed to the user
        if let Some(mv) = self.pending_move {
            self.board
                .led_flash(mv.from, mv.to, FlashPattern::Guide)
                .await?;
        }
        Ok(())
    }

    fn emit(&self, event: &EngineEvent) {
        for observer in &self.observers {
            observer(event);
        }
    }
}

fn color_index(color: Color) -> usize {
    match color {
        Color::White => 0,
        Color::Black => 1,
    }
}

/// Chooser key mapping, top to bottom on the chooser screen.
fn promotion_choice(key: Key) -> Option<PromotionRole> {
    match key {
        Key::Up => Some(PromotionRole::Queen),
        Key::Tick => Some(PromotionRole::Rook),
        Key::Down => Some(PromotionRole::Bishop),
        Key::Back => Some(PromotionRole::Knight),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BoardEvent;
    use parking_lot::Mutex;

    /// In-memory board double: serves a scripted presence and records every
    /// LED/beep call.
    #[derive(Default)]
    struct FakeBoard {
        presence: Mutex<Presence>,
        led_log: Mutex<Vec<String>>,
        paused: Mutex<bool>,
    }

    impl FakeBoard {
        fn set_presence(&self, p: Presence) {
            *self.presence.lock() = p;
        }
        fn log(&self) -> Vec<String> {
            self.led_log.lock().clone()
        }
    }

    #[async_trait]
    impl BoardIo for FakeBoard {
        async fn leds(&self, squares: &[Square], intensity: u8) -> Result<()> {
            let list: Vec<String> = squares.iter().map(|s| s.to_string()).collect();
            self.led_log
                .lock()
                .push(format!("leds {} @{intensity}", list.join(",")));
            Ok(())
        }
        async fn led_flash(&self, from: Square, to: Square, _p: FlashPattern) -> Result<()> {
            self.led_log.lock().push(format!("flash {from}->{to}"));
            Ok(())
        }
        async fn led_flash_one(&self, square: Square, _p: FlashPattern) -> Result<()> {
            self.led_log.lock().push(format!("flash {square}"));
            Ok(())
        }
        async fn leds_off(&self) -> Result<()> {
            self.led_log.lock().push("off".into());
            Ok(())
        }
        async fn beep(&self, _tone: Tone) -> Result<()> {
            Ok(())
        }
        async fn read_board_state(&self) -> Result<Presence> {
            Ok(*self.presence.lock())
        }
        fn pause_events(&self) {
            *self.paused.lock() = true;
        }
        fn resume_events(&self) {
            *self.paused.lock() = false;
        }
        fn discard_buffered(&self) {}
    }

    fn sq(name: &str) -> Square {
        let b = name.as_bytes();
        Square::from_coords(b[0] - b'a', b[1] - b'1')
    }

    struct Rig {
        engine: GameEngine,
        board: Arc<FakeBoard>,
        store: Store,
        events: Arc<Mutex<Vec<EngineEvent>>>,
    }

    async fn rig() -> Rig {
        let board = Arc::new(FakeBoard::default());
        board.set_presence(Presence::INITIAL);
        let store = Store::new();
        let db = Db::open_in_memory().unwrap();
        let mut engine = GameEngine::new(
            board.clone(),
            store.clone(),
            db,
            EngineConfig::default(),
        );
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        engine.subscribe(move |e| sink.lock().push(e.clone()));
        engine.start_game("White", "Black", "local").await.unwrap();
        Rig {
            engine,
            board,
            store,
            events,
        }
    }

    /// Apply a UCI move as lift/place events, updating the fake sensors to
    /// the resulting position afterwards.
    async fn play_physical(rig: &mut Rig, from: &str, to: &str, capture: bool) {
        if capture {
            rig.engine
                .handle_event(BoardEvent::LiftPiece(sq(to)))
                .await
                .unwrap();
        }
        rig.engine
            .handle_event(BoardEvent::LiftPiece(sq(from)))
            .await
            .unwrap();
        rig.engine
            .handle_event(BoardEvent::PlacePiece(sq(to)))
            .await
            .unwrap();
        // sensors now match the logical position
        let p = rig.engine.game.presence();
        rig.board.set_presence(p);
    }

    #[tokio::test]
    async fn scholars_mate_end_to_end() {
        let mut rig = rig().await;
        for (from, to, capture) in [
            ("e2", "e4", false),
            ("e7", "e5", false),
            ("d1", "h5", false),
            ("b8", "c6", false),
            ("f1", "c4", false),
            ("g8", "f6", false),
            ("h5", "f7", true),
        ] {
            play_physical(&mut rig, from, to, capture).await;
        }
        assert_eq!(
            rig.engine.fen(),
            "r1bqkb1r/pppp1Qpp/2n2n2/4p3/2B1P3/8/PPPP1PPP/RNB1K2R b KQkq - 0 4"
        );
        assert!(rig.engine.is_over());
        let over = rig
            .events
            .lock()
            .iter()
            .find_map(|e| match e {
                EngineEvent::GameOver { result, reason } => Some((result.clone(), *reason)),
                _ => None,
            })
            .expect("game over event");
        assert_eq!(over.0, GameResult::WhiteWins);
        assert_eq!(over.1, TerminationReason::Checkmate);
        assert_eq!(
            rig.store.game.with(|g| g.result.clone()),
            Some(GameResult::WhiteWins)
        );
    }

    #[tokio::test]
    async fn lift_and_replace_on_origin_is_a_noop() {
        let mut rig = rig().await;
        rig.engine
            .handle_event(BoardEvent::LiftPiece(sq("e2")))
            .await
            .unwrap();
        rig.engine
            .handle_event(BoardEvent::PlacePiece(sq("e2")))
            .await
            .unwrap();
        assert!(!rig.engine.in_correction());
        assert_eq!(rig.engine.game.ply(), 0);
    }

    #[tokio::test]
    async fn illegal_place_enters_correction_and_recovers() {
        let mut rig = rig().await;
        // e2 pawn placed on e5: not a legal destination
        rig.engine
            .handle_event(BoardEvent::LiftPiece(sq("e2")))
            .await
            .unwrap();
        // physical board now: pawn sitting on e5 instead of e2
        rig.board.set_presence(
            Presence::INITIAL.without(sq("e2")).with(sq("e5")),
        );
        rig.engine
            .handle_event(BoardEvent::PlacePiece(sq("e5")))
            .await
            .unwrap();
        assert!(rig.engine.in_correction());
        assert!(rig.store.game.with(|g| g.in_correction));
        // guidance: e2 lit (missing), e5 flashing (spurious)
        let log = rig.board.log();
        assert!(log.iter().any(|l| l.contains("leds e2")), "{log:?}");
        assert!(log.iter().any(|l| l == "flash e5"), "{log:?}");

        // user lifts from e5 and puts the pawn back on e2
        rig.board
            .set_presence(Presence::INITIAL.without(sq("e2")));
        rig.engine
            .handle_event(BoardEvent::LiftPiece(sq("e5")))
            .await
            .unwrap();
        rig.board.set_presence(Presence::INITIAL);
        rig.engine
            .handle_event(BoardEvent::PlacePiece(sq("e2")))
            .await
            .unwrap();
        assert!(!rig.engine.in_correction());
        assert_eq!(rig.engine.game.ply(), 0, "no move was committed");
    }

    #[tokio::test]
    async fn king_first_castling_commits_after_the_rook() {
        let mut rig = rig().await;
        for (from, to, cap) in [
            ("e2", "e4", false),
            ("e7", "e5", false),
            ("g1", "f3", false),
            ("b8", "c6", false),
            ("f1", "c4", false),
            ("g8", "f6", false),
        ] {
            play_physical(&mut rig, from, to, cap).await;
        }
        // king first
        rig.engine
            .handle_event(BoardEvent::LiftPiece(sq("e1")))
            .await
            .unwrap();
        rig.engine
            .handle_event(BoardEvent::PlacePiece(sq("g1")))
            .await
            .unwrap();
        assert_eq!(rig.engine.game.ply(), 6, "castle must not commit yet");
        // rook guidance shown
        assert!(rig.board.log().iter().any(|l| l == "flash h1->f1"));

        rig.engine
            .handle_event(BoardEvent::LiftPiece(sq("h1")))
            .await
            .unwrap();
        rig.engine
            .handle_event(BoardEvent::PlacePiece(sq("f1")))
            .await
            .unwrap();
        assert_eq!(rig.engine.game.ply(), 7);
        assert_eq!(rig.engine.game.moves().last().unwrap().uci, "e1g1");
        let castling_field = rig.engine.fen();
        let castling_field = castling_field.split(' ').nth(2).unwrap();
        assert_eq!(castling_field, "kq");
    }

    #[tokio::test]
    async fn rook_first_castling_window_expiry_commits_plain_rook_move() {
        let mut rig = rig().await;
        for (from, to, cap) in [
            ("e2", "e4", false),
            ("e7", "e5", false),
            ("g1", "f3", false),
            ("b8", "c6", false),
            ("f1", "c4", false),
            ("g8", "f6", false),
        ] {
            play_physical(&mut rig, from, to, cap).await;
        }
        // rook h1→f1: ambiguous between castle half and a plain rook move
        rig.engine
            .handle_event(BoardEvent::LiftPiece(sq("h1")))
            .await
            .unwrap();
        rig.engine
            .handle_event(BoardEvent::PlacePiece(sq("f1")))
            .await
            .unwrap();
        assert_eq!(rig.engine.game.ply(), 6, "ambiguous half must wait");

        // window expires without the king: the rook move stands
        rig.engine
            .handle_tick(Instant::now() + SETTLE_WINDOW + Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(rig.engine.game.moves().last().unwrap().uci, "h1f1");
    }

    #[tokio::test]
    async fn rook_first_castling_completes_with_the_king() {
        let mut rig = rig().await;
        for (from, to, cap) in [
            ("e2", "e4", false),
            ("e7", "e5", false),
            ("g1", "f3", false),
            ("b8", "c6", false),
            ("f1", "c4", false),
            ("g8", "f6", false),
        ] {
            play_physical(&mut rig, from, to, cap).await;
        }
        rig.engine
            .handle_event(BoardEvent::LiftPiece(sq("h1")))
            .await
            .unwrap();
        rig.engine
            .handle_event(BoardEvent::PlacePiece(sq("f1")))
            .await
            .unwrap();
        rig.engine
            .handle_event(BoardEvent::LiftPiece(sq("e1")))
            .await
            .unwrap();
        rig.engine
            .handle_event(BoardEvent::PlacePiece(sq("g1")))
            .await
            .unwrap();
        assert_eq!(rig.engine.game.moves().last().unwrap().uci, "e1g1");
    }

    #[tokio::test]
    async fn promotion_timeout_defaults_to_queen() {
        let board = Arc::new(FakeBoard::default());
        let store = Store::new();
        let db = Db::open_in_memory().unwrap();
        let mut engine =
            GameEngine::new(board.clone(), store.clone(), db.clone(), EngineConfig::default());
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        engine.subscribe(move |e| sink.lock().push(e.clone()));

        // white pawn one step from promotion
        let game = LiveGame::from_fen("8/4P3/8/8/8/2k5/8/4K3 w - - 0 1").unwrap();
        board.set_presence(game.presence());
        engine.game = game;
        engine.game_id = None;
        engine.game_over = false;

        engine
            .handle_event(BoardEvent::LiftPiece(sq("e7")))
            .await
            .unwrap();
        engine
            .handle_event(BoardEvent::PlacePiece(sq("e8")))
            .await
            .unwrap();
        assert!(matches!(engine.phase, Phase::Promotion { .. }));
        assert!(*board.paused.lock(), "piece events must pause");
        assert!(events
            .lock()
            .iter()
            .any(|e| matches!(e, EngineEvent::PromotionChooser { color: Color::White })));

        engine
            .handle_tick(Instant::now() + PROMOTION_TIMEOUT + Duration::from_secs(1))
            .await
            .unwrap();
        assert!(events
            .lock()
            .iter()
            .any(|e| matches!(e, EngineEvent::PromotionTimeout)));
        assert_eq!(engine.game.moves().last().unwrap().uci, "e7e8q");
        assert!(!*board.paused.lock());
    }

    #[tokio::test]
    async fn promotion_key_selects_the_role() {
        let board = Arc::new(FakeBoard::default());
        let store = Store::new();
        let db = Db::open_in_memory().unwrap();
        let mut engine =
            GameEngine::new(board.clone(), store, db, EngineConfig::default());
        let game = LiveGame::from_fen("8/4P3/8/8/8/2k5/8/4K3 w - - 0 1").unwrap();
        board.set_presence(game.presence());
        engine.game = game;

        engine
            .handle_event(BoardEvent::LiftPiece(sq("e7")))
            .await
            .unwrap();
        engine
            .handle_event(BoardEvent::PlacePiece(sq("e8")))
            .await
            .unwrap();
        let consumed = engine.handle_key(Key::Down).await.unwrap();
        assert!(consumed);
        assert_eq!(engine.game.moves().last().unwrap().uci, "e7e8b");
    }

    #[tokio::test]
    async fn capture_with_either_lift_order() {
        let mut rig = rig().await;
        play_physical(&mut rig, "e2", "e4", false).await;
        play_physical(&mut rig, "d7", "d5", false).await;

        // victim first
        rig.engine
            .handle_event(BoardEvent::LiftPiece(sq("d5")))
            .await
            .unwrap();
        rig.engine
            .handle_event(BoardEvent::LiftPiece(sq("e4")))
            .await
            .unwrap();
        rig.engine
            .handle_event(BoardEvent::PlacePiece(sq("d5")))
            .await
            .unwrap();
        assert_eq!(rig.engine.game.moves().last().unwrap().uci, "e4d5");
    }

    #[tokio::test]
    async fn king_hold_opens_resign_menu() {
        let mut rig = rig().await;
        rig.engine
            .handle_event(BoardEvent::LiftPiece(sq("e1")))
            .await
            .unwrap();
        rig.engine
            .handle_tick(Instant::now() + KING_HOLD_RESIGN + Duration::from_secs(1))
            .await
            .unwrap();
        assert!(rig
            .events
            .lock()
            .iter()
            .any(|e| matches!(e, EngineEvent::ResignMenu { color: Color::White })));
    }

    #[tokio::test]
    async fn takeback_reverts_and_guides_restoration() {
        let mut rig = rig().await;
        play_physical(&mut rig, "e2", "e4", false).await;
        assert_eq!(rig.engine.game.ply(), 1);

        rig.engine.takeback().await.unwrap();
        assert_eq!(rig.engine.game.ply(), 0);
        assert!(rig.engine.in_correction());
        assert!(rig
            .events
            .lock()
            .iter()
            .any(|e| matches!(e, EngineEvent::TakebackApplied)));

        // physical pawn back on e2 ends the correction
        rig.board.set_presence(Presence::INITIAL);
        rig.engine
            .handle_event(BoardEvent::PlacePiece(sq("e2")))
            .await
            .unwrap();
        assert!(!rig.engine.in_correction());
    }

    #[tokio::test]
    async fn resignation_finishes_the_game() {
        let mut rig = rig().await;
        rig.engine.resign(Color::White).await.unwrap();
        assert!(rig.engine.is_over());
        assert_eq!(
            rig.store.game.with(|g| g.result.clone()),
            Some(GameResult::BlackWins)
        );
        assert!(!rig.store.clock.with(|c| c.running));
    }
}
