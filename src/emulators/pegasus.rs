//! DGT Pegasus emulation.
//!
//! Binary protocol over the Nordic UART service. Inbound commands are
//! single bytes from the DGT command set (plus a framed LED command);
//! outbound messages are `[id | 0x80][len_hi][len_lo][payload…]` with the
//! length split into two 7-bit bytes, total message size included.

use tracing::debug;

use crate::error::{Error, Result};
use crate::store::Store;
use crate::types::{GameMove, Square};

use super::{BoardAction, Emulator, EmulatorKind, Handled};

/// `DGT_SEND_RESET`.
pub const DGT_SEND_RESET: u8 = 0x40;
/// `DGT_SEND_BRD`: full board dump query.
pub const DGT_SEND_BRD: u8 = 0x42;
/// `DGT_SEND_UPDATE`: stream field updates and clock messages.
pub const DGT_SEND_UPDATE: u8 = 0x43;
/// `DGT_SEND_UPDATE_BRD`: stream field updates.
pub const DGT_SEND_UPDATE_BRD: u8 = 0x44;
/// `DGT_RETURN_SERIALNR`.
pub const DGT_RETURN_SERIALNR: u8 = 0x45;
/// `DGT_SEND_TRADEMARK`.
pub const DGT_SEND_TRADEMARK: u8 = 0x47;
/// `DGT_SEND_BATTERY_STATUS`.
pub const DGT_SEND_BATTERY_STATUS: u8 = 0x4C;
/// `DGT_SEND_VERSION`.
pub const DGT_SEND_VERSION: u8 = 0x4D;
/// Pegasus LED control: framed `[0x60][len][payload…]`.
pub const DGT_SET_LEDS: u8 = 0x60;

/// Outbound id: full board dump.
pub const MSG_BOARD_DUMP: u8 = 0x06;
/// Outbound id: one field changed.
pub const MSG_FIELD_UPDATE: u8 = 0x0E;
/// Outbound id: serial number string.
pub const MSG_SERIALNR: u8 = 0x11;
/// Outbound id: trademark string.
pub const MSG_TRADEMARK: u8 = 0x12;
/// Outbound id: firmware version pair.
pub const MSG_VERSION: u8 = 0x13;
/// Outbound id: battery percent + charging flag.
pub const MSG_BATTERY_STATUS: u8 = 0x20;

/// DGT piece codes for the board dump.
#[rustfmt::skip]
mod piece {
    pub const EMPTY: u8 = 0x00;
    pub const WPAWN: u8 = 0x01; pub const WROOK: u8 = 0x02; pub const WKNIGHT: u8 = 0x03;
    pub const WBISHOP: u8 = 0x04; pub const WKING: u8 = 0x05; pub const WQUEEN: u8 = 0x06;
    pub const BPAWN: u8 = 0x07; pub const BROOK: u8 = 0x08; pub const BKNIGHT: u8 = 0x09;
    pub const BBISHOP: u8 = 0x0A; pub const BKING: u8 = 0x0B; pub const BQUEEN: u8 = 0x0C;
}

fn piece_code(c: char) -> u8 {
    match c {
        'P' => piece::WPAWN,
        'R' => piece::WROOK,
        'N' => piece::WKNIGHT,
        'B' => piece::WBISHOP,
        'K' => piece::WKING,
        'Q' => piece::WQUEEN,
        'p' => piece::BPAWN,
        'r' => piece::BROOK,
        'n' => piece::BKNIGHT,
        'b' => piece::BBISHOP,
        'k' => piece::BKING,
        'q' => piece::BQUEEN,
        _ => piece::EMPTY,
    }
}

/// DGT hardware square numbering: a8 = 0 … h1 = 63.
pub fn dgt_index(square: Square) -> usize {
    ((7 - square.rank()) * 8 + square.file()) as usize
}

/// Inverse of [`dgt_index`].
pub fn from_dgt_index(index: usize) -> Square {
    let rank = 7 - (index / 8) as u8;
    let file = (index % 8) as u8;
    Square::from_coords(file, rank)
}

/// Frame an outbound message: reply bit, 7-bit length pair, payload.
pub fn frame_message(id: u8, payload: &[u8]) -> Vec<u8> {
    let total = payload.len() + 3;
    let mut out = Vec::with_capacity(total);
    out.push(id | 0x80);
    out.push(((total >> 7) & 0x7F) as u8);
    out.push((total & 0x7F) as u8);
    out.extend_from_slice(payload);
    out
}

/// Split a framed message back into `(id, payload)`.
pub fn unframe_message(bytes: &[u8]) -> Result<(u8, &[u8])> {
    if bytes.len() < 3 || bytes[0] & 0x80 == 0 {
        return Err(Error::InvalidFrame("not a dgt reply frame".into()));
    }
    let total = ((bytes[1] as usize) << 7) | bytes[2] as usize;
    if bytes.len() != total {
        return Err(Error::InvalidFrame(format!(
            "dgt frame length {} != declared {}",
            bytes.len(),
            total
        )));
    }
    Ok((bytes[0] & 0x7F, &bytes[3..]))
}

/// The Pegasus emulator.
pub struct Pegasus {
    store: Store,
    buffer: Vec<u8>,
    updates_enabled: bool,
}

impl std::fmt::Debug for Pegasus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pegasus")
            .field("buffered", &self.buffer.len())
            .field("updates_enabled", &self.updates_enabled)
            .finish()
    }
}

/// A decoded inbound command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Session reset.
    Reset,
    /// Board dump query.
    SendBoard,
    /// Enable update streaming.
    SendUpdates,
    /// Serial number query.
    SerialNr,
    /// Trademark string query.
    Trademark,
    /// Battery query.
    Battery,
    /// Version query.
    Version,
    /// LED control payload (square indices in DGT numbering).
    SetLeds(Vec<u8>),
}

impl Pegasus {
    /// Emulator reading positions from `store`.
    pub fn new(store: Store) -> Pegasus {
        Pegasus {
            store,
            buffer: Vec::new(),
            updates_enabled: false,
        }
    }

    /// Parse buffered inbound bytes into commands.
    pub fn parse(&mut self, bytes: &[u8]) -> Result<Vec<Command>> {
        self.buffer.extend_from_slice(bytes);
        let mut commands = Vec::new();
        loop {
            let Some(&first) = self.buffer.first() else {
                break;
            };
            match first {
                DGT_SET_LEDS => {
                    if self.buffer.len() < 2 {
                        break;
                    }
                    let len = self.buffer[1] as usize;
                    if self.buffer.len() < 2 + len {
                        break;
                    }
                    let message: Vec<u8> = self.buffer.drain(..2 + len).collect();
                    commands.push(Command::SetLeds(message[2..].to_vec()));
                }
                DGT_SEND_RESET => {
                    self.buffer.remove(0);
                    commands.push(Command::Reset);
                }
                DGT_SEND_BRD => {
                    self.buffer.remove(0);
                    commands.push(Command::SendBoard);
                }
                DGT_SEND_UPDATE | DGT_SEND_UPDATE_BRD => {
                    self.buffer.remove(0);
                    commands.push(Command::SendUpdates);
                }
                DGT_RETURN_SERIALNR => {
                    self.buffer.remove(0);
                    commands.push(Command::SerialNr);
                }
                DGT_SEND_TRADEMARK => {
                    self.buffer.remove(0);
                    commands.push(Command::Trademark);
                }
                DGT_SEND_BATTERY_STATUS => {
                    self.buffer.remove(0);
                    commands.push(Command::Battery);
                }
                DGT_SEND_VERSION => {
                    self.buffer.remove(0);
                    commands.push(Command::Version);
                }
                other => {
                    return Err(Error::InvalidFrame(format!(
                        "unknown dgt command 0x{other:02x}"
                    )));
                }
            }
        }
        Ok(commands)
    }

    fn reply_for(&mut self, command: Command) -> Handled {
        match command {
            Command::Reset => Handled {
                reply: Vec::new(),
                actions: vec![BoardAction::Reset],
            },
            Command::SendBoard => Handled {
                reply: self.encode_board_state(),
                actions: Vec::new(),
            },
            Command::SendUpdates => {
                self.updates_enabled = true;
                Handled {
                    reply: Vec::new(),
                    actions: vec![BoardAction::ScanEnable(true)],
                }
            }
            Command::SerialNr => Handled {
                reply: frame_message(MSG_SERIALNR, b"PGS-0001"),
                actions: Vec::new(),
            },
            Command::Trademark => Handled {
                reply: frame_message(MSG_TRADEMARK, b"Digital Game Technology"),
                actions: Vec::new(),
            },
            Command::Battery => {
                let (percent, charging) = self
                    .store
                    .system
                    .with(|s| (s.battery_percent, s.charging));
                Handled {
                    reply: frame_message(
                        MSG_BATTERY_STATUS,
                        &[percent, u8::from(charging)],
                    ),
                    actions: Vec::new(),
                }
            }
            Command::Version => Handled {
                reply: frame_message(MSG_VERSION, &[1, 0]),
                actions: Vec::new(),
            },
            Command::SetLeds(payload) => {
                let mut actions = Vec::new();
                // payload: [mode][squares…]; mode 0 clears
                match payload.split_first() {
                    Some((0, _)) | None => actions.push(BoardAction::LedsOff),
                    Some((_, squares)) => {
                        for idx in squares {
                            if (*idx as usize) < 64 {
                                actions.push(BoardAction::Led {
                                    square: from_dgt_index(*idx as usize),
                                    on: true,
                                });
                            }
                        }
                    }
                }
                Handled {
                    reply: Vec::new(),
                    actions,
                }
            }
        }
    }
}

impl Emulator for Pegasus {
    fn kind(&self) -> EmulatorKind {
        EmulatorKind::Pegasus
    }

    fn accept(&mut self, bytes: &[u8]) -> Result<Handled> {
        let commands = self.parse(bytes)?;
        let mut handled = Handled::default();
        for command in commands {
            debug!(?command, "pegasus command");
            handled.merge(self.reply_for(command));
        }
        Ok(handled)
    }

    fn notify_move(&mut self, mv: GameMove) -> Vec<u8> {
        if !self.updates_enabled {
            return Vec::new();
        }
        // two field updates: origin emptied, destination filled
        let fen = super::store_fen(&self.store);
        let chars = super::fen_board_chars(&fen);
        let mut out = frame_message(
            MSG_FIELD_UPDATE,
            &[dgt_index(mv.from) as u8, piece::EMPTY],
        );
        out.extend(frame_message(
            MSG_FIELD_UPDATE,
            &[
                dgt_index(mv.to) as u8,
                piece_code(chars[mv.to.index() as usize]),
            ],
        ));
        out
    }

    fn notify_battery(&mut self, percent: u8, charging: bool) -> Vec<u8> {
        frame_message(MSG_BATTERY_STATUS, &[percent, u8::from(charging)])
    }

    fn encode_board_state(&self) -> Vec<u8> {
        let fen = super::store_fen(&self.store);
        let chars = super::fen_board_chars(&fen);
        let mut dump = [piece::EMPTY; 64];
        for sq in Square::all() {
            dump[dgt_index(sq)] = piece_code(chars[sq.index() as usize]);
        }
        frame_message(MSG_BOARD_DUMP, &dump)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::position::INITIAL_FEN;

    fn sq(name: &str) -> Square {
        let b = name.as_bytes();
        Square::from_coords(b[0] - b'a', b[1] - b'1')
    }

    #[test]
    fn dgt_indexing_starts_at_a8() {
        assert_eq!(dgt_index(sq("a8")), 0);
        assert_eq!(dgt_index(sq("h8")), 7);
        assert_eq!(dgt_index(sq("a1")), 56);
        assert_eq!(dgt_index(sq("h1")), 63);
        for square in Square::all() {
            assert_eq!(from_dgt_index(dgt_index(square)), square);
        }
    }

    #[test]
    fn board_dump_round_trip() {
        let store = Store::new();
        store.game.mutate(|g| g.fen = INITIAL_FEN.to_string());
        let mut emulator = Pegasus::new(store);
        let handled = emulator.accept(&[DGT_SEND_BRD]).unwrap();
        let (id, payload) = unframe_message(&handled.reply).unwrap();
        assert_eq!(id, MSG_BOARD_DUMP);
        assert_eq!(payload.len(), 64);
        // a8 rook, e8 king, e1 king, e4 empty
        assert_eq!(payload[dgt_index(sq("a8"))], piece::BROOK);
        assert_eq!(payload[dgt_index(sq("e8"))], piece::BKING);
        assert_eq!(payload[dgt_index(sq("e1"))], piece::WKING);
        assert_eq!(payload[dgt_index(sq("e4"))], piece::EMPTY);
    }

    #[test]
    fn field_updates_follow_a_committed_move() {
        let store = Store::new();
        // position after 1.e4
        store.game.mutate(|g| {
            g.fen = "rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq e3 0 1".into()
        });
        let mut emulator = Pegasus::new(store);
        emulator.accept(&[DGT_SEND_UPDATE_BRD]).unwrap();
        let bytes = emulator.notify_move(GameMove::new(sq("e2"), sq("e4")));
        // two frames: e2 cleared, e4 white pawn
        let first_len = ((bytes[1] as usize) << 7) | bytes[2] as usize;
        let (first, second) = bytes.split_at(first_len);
        let (id, payload) = unframe_message(first).unwrap();
        assert_eq!(id, MSG_FIELD_UPDATE);
        assert_eq!(payload, [dgt_index(sq("e2")) as u8, piece::EMPTY]);
        let (_, payload) = unframe_message(second).unwrap();
        assert_eq!(payload, [dgt_index(sq("e4")) as u8, piece::WPAWN]);
    }

    #[test]
    fn battery_query_reads_the_system_store() {
        let store = Store::new();
        store.system.mutate(|s| {
            s.battery_percent = 77;
            s.charging = true;
        });
        let mut emulator = Pegasus::new(store);
        let handled = emulator.accept(&[DGT_SEND_BATTERY_STATUS]).unwrap();
        let (id, payload) = unframe_message(&handled.reply).unwrap();
        assert_eq!(id, MSG_BATTERY_STATUS);
        assert_eq!(payload, [77, 1]);
    }

    #[test]
    fn led_frame_is_buffered_until_complete() {
        let mut emulator = Pegasus::new(Store::new());
        let frame = [DGT_SET_LEDS, 3, 1, dgt_index(sq("e2")) as u8, dgt_index(sq("e4")) as u8];
        let handled = emulator.accept(&frame[..2]).unwrap();
        assert!(handled.actions.is_empty());
        let handled = emulator.accept(&frame[2..]).unwrap();
        assert_eq!(handled.actions.len(), 2);
        assert!(handled
            .actions
            .contains(&BoardAction::Led { square: sq("e4"), on: true }));
    }

    #[test]
    fn unknown_command_byte_is_rejected() {
        let mut emulator = Pegasus::new(Store::new());
        assert!(emulator.accept(&[0x21]).is_err());
    }

    #[test]
    fn golden_capture_is_accepted() {
        // startup sequence from a Pegasus app: reset, serial, version,
        // board, updates on
        let capture = [
            DGT_SEND_RESET,
            DGT_RETURN_SERIALNR,
            DGT_SEND_VERSION,
            DGT_SEND_BRD,
            DGT_SEND_UPDATE_BRD,
        ];
        let mut emulator = Pegasus::new(Store::new());
        let handled = emulator.accept(&capture).unwrap();
        assert!(handled.actions.contains(&BoardAction::Reset));
        assert!(handled.actions.contains(&BoardAction::ScanEnable(true)));
        assert!(!handled.reply.is_empty());
    }
}
