//! The authoritative chess position and its move stack.
//!
//! Wraps `shakmaty` so the rest of the engine speaks [`Square`],
//! [`GameMove`] and [`Presence`] only. Castling moves are exposed with the
//! king's origin and destination, matching what the player physically does
//! with the king.

use shakmaty::fen::Fen;
use shakmaty::san::SanPlus;
use shakmaty::zobrist::{Zobrist64, ZobristHash};
use shakmaty::{CastlingMode, CastlingSide, Chess, EnPassantMode, Move, Position, Rank, Role};

use crate::error::{Error, Result};
use crate::types::{Color, GameMove, Presence, PromotionRole, RecordedMove, Square, TerminationReason};

/// Standard initial position FEN.
pub const INITIAL_FEN: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

/// A game in progress: position, opening FEN and the committed move stack.
#[derive(Debug, Clone)]
pub struct LiveGame {
    position: Chess,
    opening_fen: String,
    moves: Vec<RecordedMove>,
    /// Zobrist hash of every position reached, opening included; used for
    /// threefold detection.
    hashes: Vec<Zobrist64>,
}

impl Default for LiveGame {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveGame {
    /// Fresh game from the standard initial position.
    pub fn new() -> LiveGame {
        let position = Chess::default();
        let hash = position.zobrist_hash(EnPassantMode::Legal);
        LiveGame {
            position,
            opening_fen: INITIAL_FEN.to_string(),
            moves: Vec::new(),
            hashes: vec![hash],
        }
    }

    /// Game starting from an arbitrary position.
    pub fn from_fen(fen: &str) -> Result<LiveGame> {
        let position = parse_fen(fen)?;
        let hash = position.zobrist_hash(EnPassantMode::Legal);
        Ok(LiveGame {
            position,
            opening_fen: fen.to_string(),
            moves: Vec::new(),
            hashes: vec![hash],
        })
    }

    /// Rebuild a game from a persisted record: opening FEN plus UCI moves.
    pub fn replay(opening_fen: &str, ucis: &[String]) -> Result<LiveGame> {
        let mut game = LiveGame::from_fen(opening_fen)?;
        for uci in ucis {
            let mv = GameMove::from_uci(uci)
                .ok_or_else(|| Error::Persistence(format!("corrupt move in record: {uci}")))?;
            game.play(mv)?;
        }
        Ok(game)
    }

    /// FEN of the current position.
    pub fn fen(&self) -> String {
        Fen::from_position(self.position.clone(), EnPassantMode::Legal).to_string()
    }

    /// FEN the game started from.
    pub fn opening_fen(&self) -> &str {
        &self.opening_fen
    }

    /// Side to move.
    pub fn turn(&self) -> Color {
        self.position.turn().into()
    }

    /// Committed moves since the opening position.
    pub fn moves(&self) -> &[RecordedMove] {
        &self.moves
    }

    /// Number of committed half-moves.
    pub fn ply(&self) -> u32 {
        self.moves.len() as u32
    }

    /// Whether the side to move is in check.
    pub fn is_check(&self) -> bool {
        self.position.is_check()
    }

    /// Whether the side to move has a queen attacked by the opponent.
    /// Surfaced as an alert after the opponent's move.
    pub fn queen_under_threat(&self) -> bool {
        let us = self.position.turn();
        let board = self.position.board();
        let queens = board.by_role(Role::Queen) & board.by_color(us);
        for sq in queens {
            if board.attacks_to(sq, !us, board.occupied()).any() {
                return true;
            }
        }
        false
    }

    /// Project the position to a piece-presence bitmap.
    pub fn presence(&self) -> Presence {
        let mut presence = Presence::EMPTY;
        for sq in self.position.board().occupied() {
            presence = presence.with(sq.into());
        }
        presence
    }

    /// Whether `square` holds a piece of the side to move.
    pub fn is_own_piece(&self, square: Square) -> bool {
        self.position
            .board()
            .piece_at(square.into())
            .is_some_and(|p| p.color == self.position.turn())
    }

    /// Whether `square` holds a piece of the side not to move.
    pub fn is_opponent_piece(&self, square: Square) -> bool {
        self.position
            .board()
            .piece_at(square.into())
            .is_some_and(|p| p.color != self.position.turn())
    }

    /// Whether `square` holds a king, and of which color.
    pub fn king_at(&self, square: Square) -> Option<Color> {
        self.position
            .board()
            .piece_at(square.into())
            .filter(|p| p.role == Role::King)
            .map(|p| p.color.into())
    }

    /// Legal destination squares for a piece on `from`, castling shown as
    /// the king's two-file hop.
    pub fn legal_destinations(&self, from: Square) -> Vec<Square> {
        let mut dests: Vec<Square> = self
            .position
            .legal_moves()
            .iter()
            .filter(|m| move_origin(m) == Some(from))
            .map(move_target)
            .collect();
        dests.sort_unstable();
        dests.dedup();
        dests
    }

    /// Whether playing `from`→`to` requires a promotion choice.
    pub fn needs_promotion(&self, from: Square, to: Square) -> bool {
        self.position.legal_moves().iter().any(|m| {
            move_origin(m) == Some(from) && move_target(m) == to && m.is_promotion()
        })
    }

    /// Find the legal move matching `mv`, if any.
    pub fn find(&self, mv: GameMove) -> Option<Move> {
        self.position
            .legal_moves()
            .iter()
            .find(|m| {
                move_origin(m) == Some(mv.from)
                    && move_target(m) == mv.to
                    && promotion_of(m) == mv.promotion
            })
            .cloned()
    }

    /// The rook half of a castling move `mv`, if `mv` castles:
    /// `(rook_from, rook_to)`.
    pub fn castling_rook_path(&self, mv: GameMove) -> Option<(Square, Square)> {
        let m = self.find(mv)?;
        if let Move::Castle { king, rook } = m {
            let side = if rook > king {
                CastlingSide::KingSide
            } else {
                CastlingSide::QueenSide
            };
            let rank = king.rank();
            let rook_to = shakmaty::Square::from_coords(side.rook_to_file(), rank);
            Some((rook.into(), rook_to.into()))
        } else {
            None
        }
    }

    /// Commit a move. Fails with [`Error::IllegalMove`] when `mv` is not
    /// legal from the current position.
    pub fn play(&mut self, mv: GameMove) -> Result<RecordedMove> {
        let m = self.find(mv).ok_or(Error::IllegalMove { from: mv.from })?;
        let san = SanPlus::from_move(self.position.clone(), &m).to_string();
        let uci = m.to_uci(CastlingMode::Standard).to_string();
        self.position.play_unchecked(&m);
        self.hashes
            .push(self.position.zobrist_hash(EnPassantMode::Legal));
        let recorded = RecordedMove {
            ply: self.moves.len() as u32 + 1,
            uci,
            san,
            fen_after: self.fen(),
        };
        self.moves.push(recorded.clone());
        Ok(recorded)
    }

    /// Remove the last committed move, rebuilding the position by replaying
    /// the stack from the opening FEN. Returns the popped move.
    pub fn pop(&mut self) -> Option<RecordedMove> {
        let popped = self.moves.pop()?;
        let remaining: Vec<String> = self.moves.iter().map(|m| m.uci.clone()).collect();
        // replay cannot fail: every move in the stack was legal when pushed
        match LiveGame::replay(&self.opening_fen, &remaining) {
            Ok(rebuilt) => {
                self.position = rebuilt.position;
                self.hashes = rebuilt.hashes;
                self.moves = rebuilt.moves;
                Some(popped)
            }
            Err(_) => {
                self.moves.push(popped);
                None
            }
        }
    }

    /// Chess termination reached by the position itself, if any. Resignation,
    /// agreement and flag-fall are decided above this layer.
    pub fn termination(&self) -> Option<TerminationReason> {
        if self.position.is_checkmate() {
            return Some(TerminationReason::Checkmate);
        }
        if self.position.is_stalemate() {
            return Some(TerminationReason::Stalemate);
        }
        if self.position.is_insufficient_material() {
            return Some(TerminationReason::InsufficientMaterial);
        }
        if self.position.halfmoves() >= 100 {
            return Some(TerminationReason::FiftyMoveRule);
        }
        let current = self.hashes.last()?;
        if self.hashes.iter().filter(|h| *h == current).count() >= 3 {
            return Some(TerminationReason::ThreefoldRepetition);
        }
        None
    }

    /// Result implied by a chess termination.
    pub fn result_for(&self, reason: TerminationReason) -> crate::types::GameResult {
        use crate::types::GameResult;
        match reason {
            TerminationReason::Checkmate => match self.turn() {
                // side to move is mated
                Color::White => GameResult::BlackWins,
                Color::Black => GameResult::WhiteWins,
            },
            _ => GameResult::Draw,
        }
    }
}

fn parse_fen(fen: &str) -> Result<Chess> {
    let parsed: Fen = fen
        .parse()
        .map_err(|e| Error::Persistence(format!("bad FEN '{fen}': {e}")))?;
    parsed
        .into_position(CastlingMode::Standard)
        .map_err(|e| Error::Persistence(format!("illegal position '{fen}': {e}")))
}

/// Origin square of a move (the king's square for castling).
fn move_origin(m: &Move) -> Option<Square> {
    match m {
        Move::Castle { king, .. } => Some((*king).into()),
        _ => m.from().map(Square::from),
    }
}

/// Destination square as the player physically plays it: the king's hop
/// for castling, the capture square otherwise.
fn move_target(m: &Move) -> Square {
    match m {
        Move::Castle { king, rook } => {
            let side = if rook > king {
                CastlingSide::KingSide
            } else {
                CastlingSide::QueenSide
            };
            shakmaty::Square::from_coords(side.king_to_file(), king.rank()).into()
        }
        _ => m.to().into(),
    }
}

fn promotion_of(m: &Move) -> Option<PromotionRole> {
    m.promotion().and_then(|role| match role {
        Role::Queen => Some(PromotionRole::Queen),
        Role::Rook => Some(PromotionRole::Rook),
        Role::Bishop => Some(PromotionRole::Bishop),
        Role::Knight => Some(PromotionRole::Knight),
        _ => None,
    })
}

/// Rank index of the last rank for `color`.
pub fn last_rank(color: Color) -> u8 {
    match color {
        Color::White => Rank::Eighth as u8,
        Color::Black => Rank::First as u8,
    }
}
