//! Protocol emulators: one per emulated commercial board.
//!
//! Each emulator translates between its vendor wire protocol and the
//! shared game state: inbound app bytes become replies plus board actions,
//! and game-store changes become unsolicited notifications. Emulators are
//! stateless with respect to the chess position - they read the store on
//! demand - but each keeps a parse buffer for partial frames.
//!
//! Auto-detect feeds the first inbound frame to every parser in a fixed
//! order (Millennium, Pegasus, Chessnut) and locks onto the first that
//! accepts it.

pub mod chessnut;
pub mod millennium;
pub mod pegasus;

use crate::error::Result;
use crate::store::Store;
use crate::types::{GameMove, Square};

pub use chessnut::Chessnut;
pub use millennium::Millennium;
pub use pegasus::Pegasus;

/// The emulated board identities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmulatorKind {
    /// Millennium ChessLink (ASCII, parity + XOR checksum).
    Millennium,
    /// DGT Pegasus (binary over Nordic UART).
    Pegasus,
    /// Chessnut Air (binary, nibble-packed board state).
    Chessnut,
}

/// Side effects an app command requests on the physical board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoardAction {
    /// Light or clear one square.
    Led {
        /// The square.
        square: Square,
        /// On or off.
        on: bool,
    },
    /// Clear every LED.
    LedsOff,
    /// Enable or disable sensor scanning.
    ScanEnable(bool),
    /// Reset the session (new game from the app's point of view).
    Reset,
}

/// What one batch of inbound bytes produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Handled {
    /// Bytes to send back to the app.
    pub reply: Vec<u8>,
    /// Actions to mirror on the physical board.
    pub actions: Vec<BoardAction>,
}

impl Handled {
    fn merge(&mut self, other: Handled) {
        self.reply.extend(other.reply);
        self.actions.extend(other.actions);
    }
}

/// A protocol emulator bound to the game store.
pub trait Emulator: Send {
    /// Which board this emulates.
    fn kind(&self) -> EmulatorKind;

    /// Feed inbound bytes. Partial frames are buffered; bytes that cannot
    /// belong to this protocol fail with `InvalidFrame` (which is how
    /// auto-detect rejects a parser).
    fn accept(&mut self, bytes: &[u8]) -> Result<Handled>;

    /// Unsolicited notification for a committed move.
    fn notify_move(&mut self, mv: GameMove) -> Vec<u8>;

    /// Unsolicited battery notification.
    fn notify_battery(&mut self, percent: u8, charging: bool) -> Vec<u8>;

    /// Encode the current position as this protocol's board-state answer.
    fn encode_board_state(&self) -> Vec<u8>;
}

/// Build the emulator for `kind` against `store`.
pub fn build(kind: EmulatorKind, store: Store) -> Box<dyn Emulator> {
    match kind {
        EmulatorKind::Millennium => Box::new(Millennium::new(store)),
        EmulatorKind::Pegasus => Box::new(Pegasus::new(store)),
        EmulatorKind::Chessnut => Box::new(Chessnut::new(store)),
    }
}

/// Try each protocol on the first inbound frame, in the fixed order
/// Millennium → Pegasus → Chessnut. The first parser that accepts wins
/// the lock-on; `None` means no parser accepted.
pub fn detect(first_frame: &[u8], store: &Store) -> Option<(EmulatorKind, Box<dyn Emulator>)> {
    for kind in [
        EmulatorKind::Millennium,
        EmulatorKind::Pegasus,
        EmulatorKind::Chessnut,
    ] {
        let mut emulator = build(kind, store.clone());
        if emulator.accept(first_frame).is_ok() {
            // rebuild clean: the probe consumed the frame already, and the
            // caller replays it against the locked emulator
            return Some((kind, build(kind, store.clone())));
        }
    }
    None
}

/// Explode a FEN board field into 64 piece characters indexed by chess
/// square (0 = a1). Empty squares become `.`.
pub fn fen_board_chars(fen: &str) -> [char; 64] {
    let mut chars = ['.'; 64];
    let board_field = fen.split_whitespace().next().unwrap_or("");
    let mut rank: i32 = 7;
    let mut file: i32 = 0;
    for c in board_field.chars() {
        match c {
            '/' => {
                rank -= 1;
                file = 0;
            }
            '1'..='8' => file += c as i32 - '0' as i32,
            piece => {
                if (0..8).contains(&rank) && (0..8).contains(&file) {
                    chars[(rank * 8 + file) as usize] = piece;
                }
                file += 1;
            }
        }
    }
    chars
}

/// The FEN currently in the game store, or the initial position before
/// any game started.
pub(crate) fn store_fen(store: &Store) -> String {
    let fen = store.game.with(|g| g.fen.clone());
    if fen.is_empty() {
        crate::engine::position::INITIAL_FEN.to_string()
    } else {
        fen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::position::INITIAL_FEN;

    #[test]
    fn fen_board_chars_initial_position() {
        let chars = fen_board_chars(INITIAL_FEN);
        let sq = |f: u8, r: u8| chars[(r * 8 + f) as usize];
        assert_eq!(sq(0, 0), 'R'); // a1
        assert_eq!(sq(4, 0), 'K'); // e1
        assert_eq!(sq(4, 7), 'k'); // e8
        assert_eq!(sq(3, 7), 'q'); // d8
        assert_eq!(sq(4, 3), '.'); // e4
        assert_eq!(chars.iter().filter(|c| **c != '.').count(), 32);
    }

    #[test]
    fn detect_locks_millennium_on_a_parity_encoded_v() {
        let store = Store::new();
        // 'V' with odd parity in the MSB plus its checksum
        let frame = millennium::encode_command("V");
        assert_eq!(frame[0], 0xD6);
        let (kind, _emulator) = detect(&frame, &store).expect("should detect");
        assert_eq!(kind, EmulatorKind::Millennium);
    }

    #[test]
    fn detect_pegasus_and_chessnut() {
        let store = Store::new();
        let (kind, _) = detect(&[pegasus::DGT_SEND_BRD], &store).unwrap();
        assert_eq!(kind, EmulatorKind::Pegasus);

        let (kind, _) = detect(&[0x21, 0x01, 0x00], &store).unwrap();
        assert_eq!(kind, EmulatorKind::Chessnut);
    }

    #[test]
    fn garbage_detects_nothing() {
        let store = Store::new();
        assert!(detect(&[0xFF, 0xFE, 0x00], &store).is_none());
    }

    #[test]
    fn locked_session_rejects_other_protocols() {
        // after locking Millennium, Pegasus-looking bytes are rejected by
        // the locked emulator
        let store = Store::new();
        let (_, mut emulator) = detect(&millennium::encode_command("V"), &store).unwrap();
        emulator.accept(&millennium::encode_command("V")).unwrap();
        assert!(emulator.accept(&[pegasus::DGT_SEND_BRD]).is_err());
    }
}
