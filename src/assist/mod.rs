//! Assistants: hand-brain and on-demand hints.
//!
//! Both implement one `suggest` contract and borrow engine processes from
//! the shared registry, so an assistant never spawns a second copy of an
//! engine the player is already using. Hand-brain answers with the piece
//! *type* to move; hint answers with the from/to squares (or a
//! pre-registered puzzle solution).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use shakmaty::{CastlingMode, Position, Role};
use tracing::debug;

use crate::error::{Error, Result};
use crate::players::registry::EngineRegistry;
use crate::players::uci::SearchLimit;
use crate::types::{Color, GameMove, Square};

/// Piece classes as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceKind {
    /// Pawn.
    Pawn,
    /// Knight.
    Knight,
    /// Bishop.
    Bishop,
    /// Rook.
    Rook,
    /// Queen.
    Queen,
    /// King.
    King,
}

impl From<Role> for PieceKind {
    fn from(role: Role) -> Self {
        match role {
            Role::Pawn => PieceKind::Pawn,
            Role::Knight => PieceKind::Knight,
            Role::Bishop => PieceKind::Bishop,
            Role::Rook => PieceKind::Rook,
            Role::Queen => PieceKind::Queen,
            Role::King => PieceKind::King,
        }
    }
}

/// What an assistant may answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Suggestion {
    /// Move a piece of this type (hand-brain).
    PieceType(PieceKind),
    /// Play exactly this move.
    Move(GameMove),
    /// Look at these squares (drawn on the LEDs).
    Squares {
        /// Origin.
        from: Square,
        /// Destination.
        to: Square,
    },
    /// Evaluation in centipawns, white-positive.
    Eval(i32),
    /// Free-form advice.
    Text(String),
}

/// The suggestion contract shared by every assistant.
#[async_trait]
pub trait Assistant: Send + Sync {
    /// Advise `for_color` in the position `fen`.
    async fn suggest(&self, fen: &str, for_color: Color) -> Result<Suggestion>;
}

/// Hand-brain: the "brain" half names a piece type, the human picks the
/// square. Runs automatically on the player's turn.
pub struct HandBrain {
    registry: EngineRegistry,
    engine_name: String,
    movetime: Duration,
}

impl std::fmt::Debug for HandBrain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandBrain")
            .field("engine_name", &self.engine_name)
            .finish()
    }
}

impl HandBrain {
    /// Hand-brain advised by `engine_name`.
    pub fn new(registry: EngineRegistry, engine_name: impl Into<String>) -> Self {
        Self {
            registry,
            engine_name: engine_name.into(),
            movetime: Duration::from_millis(800),
        }
    }
}

#[async_trait]
impl Assistant for HandBrain {
    async fn suggest(&self, fen: &str, _for_color: Color) -> Result<Suggestion> {
        let lease = self.registry.acquire(&self.engine_name, None).await?;
        let process = lease.process();
        let outcome = {
            let mut proc = process.lock().await;
            proc.session()
                .best_move(fen, &[], SearchLimit::MoveTime(self.movetime))
                .await?
        };
        let kind = piece_kind_at(fen, outcome.best.from)?;
        debug!(?kind, mv = %outcome.best, "hand-brain suggestion");
        Ok(Suggestion::PieceType(kind))
    }
}

/// On-demand hint bound to a key press. Pre-registered puzzle solutions
/// take precedence over the engine.
pub struct HintAssistant {
    registry: EngineRegistry,
    engine_name: String,
    movetime: Duration,
    /// FEN → solution, for puzzle sets loaded from the resources dir.
    puzzles: HashMap<String, GameMove>,
}

impl std::fmt::Debug for HintAssistant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HintAssistant")
            .field("engine_name", &self.engine_name)
            .field("puzzles", &self.puzzles.len())
            .finish()
    }
}

impl HintAssistant {
    /// Engine-backed hints.
    pub fn new(registry: EngineRegistry, engine_name: impl Into<String>) -> Self {
        Self {
            registry,
            engine_name: engine_name.into(),
            movetime: Duration::from_millis(1500),
            puzzles: HashMap::new(),
        }
    }

    /// Register a puzzle solution for an exact position.
    pub fn register_puzzle(&mut self, fen: impl Into<String>, solution: GameMove) {
        self.puzzles.insert(fen.into(), solution);
    }
}

#[async_trait]
impl Assistant for HintAssistant {
    async fn suggest(&self, fen: &str, _for_color: Color) -> Result<Suggestion> {
        if let Some(solution) = self.puzzles.get(fen) {
            return Ok(Suggestion::Move(*solution));
        }
        let lease = self.registry.acquire(&self.engine_name, None).await?;
        let process = lease.process();
        let outcome = {
            let mut proc = process.lock().await;
            proc.session()
                .best_move(fen, &[], SearchLimit::MoveTime(self.movetime))
                .await?
        };
        Ok(Suggestion::Squares {
            from: outcome.best.from,
            to: outcome.best.to,
        })
    }
}

/// Piece type on `square` in the position `fen`.
fn piece_kind_at(fen: &str, square: Square) -> Result<PieceKind> {
    let position: shakmaty::Chess = fen
        .parse::<shakmaty::fen::Fen>()
        .map_err(|e| Error::InvalidFrame(format!("bad fen in suggestion: {e}")))?
        .into_position(CastlingMode::Standard)
        .map_err(|e| Error::InvalidFrame(format!("illegal position in suggestion: {e}")))?;
    position
        .board()
        .piece_at(square.into())
        .map(|p| PieceKind::from(p.role))
        .ok_or_else(|| Error::InvalidFrame(format!("suggested move from empty square {square}")))
}
