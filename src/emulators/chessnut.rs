//! Chessnut Air emulation.
//!
//! Binary protocol. The advertisement must carry the vendor
//! manufacturer-data blob or apps refuse to connect. Board state travels
//! as 32 bytes of packed nibbles - each nibble indexes the vendor piece
//! table, two squares per byte, a8 first - followed by a 2-byte sequence
//! counter. Battery is a 2-byte notification.

use tracing::debug;

use crate::error::{Error, Result};
use crate::store::Store;
use crate::types::{GameMove, Square};

use super::{BoardAction, Emulator, EmulatorKind, Handled};

/// Manufacturer data required in the BLE advertisement.
pub const MANUFACTURER_ID: u16 = 0x2B0D;
/// Manufacturer payload expected by the vendor apps.
pub const MANUFACTURER_DATA: [u8; 4] = [0x00, 0x01, 0x09, 0x01];

/// Inbound: enable realtime board reporting, `[0x21, 0x01, 0x00]`.
pub const CMD_REALTIME: u8 = 0x21;
/// Inbound: battery query, `[0x29, 0x01, 0x00]`.
pub const CMD_BATTERY: u8 = 0x29;
/// Inbound: LED bitmap, `[0x0A, 0x08]` + 8 rank bytes.
pub const CMD_LEDS: u8 = 0x0A;

/// Outbound: board state header `[0x01, 0x24]` (36 payload bytes).
pub const MSG_BOARD: [u8; 2] = [0x01, 0x24];
/// Outbound: battery header `[0x2A, 0x02]`.
pub const MSG_BATTERY: [u8; 2] = [0x2A, 0x02];

/// Vendor piece table indexed by nibble value.
pub const PIECE_TABLE: [char; 13] = [
    '.', 'q', 'k', 'b', 'p', 'n', 'R', 'P', 'r', 'B', 'N', 'Q', 'K',
];

fn nibble_for(piece: char) -> u8 {
    PIECE_TABLE
        .iter()
        .position(|p| *p == piece)
        .unwrap_or(0) as u8
}

/// A decoded inbound command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Start realtime board reporting.
    EnableRealtime,
    /// Battery query.
    Battery,
    /// LED bitmap, one byte per rank, rank 8 first, bit 7 = file a.
    SetLeds([u8; 8]),
}

/// The Chessnut emulator.
pub struct Chessnut {
    store: Store,
    buffer: Vec<u8>,
    realtime: bool,
    sequence: u16,
}

impl std::fmt::Debug for Chessnut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chessnut")
            .field("buffered", &self.buffer.len())
            .field("realtime", &self.realtime)
            .finish()
    }
}

impl Chessnut {
    /// Emulator reading positions from `store`.
    pub fn new(store: Store) -> Chessnut {
        Chessnut {
            store,
            buffer: Vec::new(),
            realtime: false,
            sequence: 0,
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
                CMD_REALTIME | CMD_BATTERY => {
                    if self.buffer.len() < 3 {
                        break;
                    }
                    let message: Vec<u8> = self.buffer.drain(..3).collect();
                    if message[1] != 0x01 {
                        return Err(Error::InvalidFrame(format!(
                            "chessnut command 0x{first:02x} with length 0x{:02x}",
                            message[1]
                        )));
                    }
                    commands.push(if first == CMD_REALTIME {
                        Command::EnableRealtime
                    } else {
                        Command::Battery
                    });
                }
                CMD_LEDS => {
                    if self.buffer.len() < 2 {
                        break;
                    }
                    if self.buffer[1] != 0x08 {
                        return Err(Error::InvalidFrame(format!(
                            "chessnut led frame with length 0x{:02x}",
                            self.buffer[1]
                        )));
                    }
                    if self.buffer.len() < 10 {
                        break;
                    }
                    let message: Vec<u8> = self.buffer.drain(..10).collect();
                    let mut ranks = [0u8; 8];
                    ranks.copy_from_slice(&message[2..]);
                    commands.push(Command::SetLeds(ranks));
                }
                other => {
                    return Err(Error::InvalidFrame(format!(
                        "unknown chessnut command 0x{other:02x}"
                    )));
                }
            }
        }
        Ok(commands)
    }

    fn reply_for(&mut self, command: Command) -> Handled {
        match command {
            Command::EnableRealtime => {
                self.realtime = true;
                Handled {
                    reply: self.encode_board_state(),
                    actions: vec![BoardAction::ScanEnable(true)],
                }
            }
            Command::Battery => {
                let (percent, charging) = self
                    .store
                    .system
                    .with(|s| (s.battery_percent, s.charging));
                Handled {
                    reply: encode_battery(percent, charging),
                    actions: Vec::new(),
                }
            }
            Command::SetLeds(ranks) => {
                let mut actions = Vec::new();
                if ranks.iter().all(|b| *b == 0) {
                    actions.push(BoardAction::LedsOff);
                } else {
                    for (row, bits) in ranks.iter().enumerate() {
                        let rank = 7 - row as u8;
                        for file in 0..8u8 {
                            if bits & (0x80 >> file) != 0 {
                                actions.push(BoardAction::Led {
                                    square: Square::from_coords(file, rank),
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

/// Pack the 64 board chars into the vendor nibble encoding: a8 first,
/// two squares per byte, first square in the low nibble.
pub fn pack_board(chars: &[char; 64]) -> [u8; 32] {
    let mut packed = [0u8; 32];
    let mut cursor = 0usize;
    for rank in (0..8).rev() {
        for file in 0..8 {
            let nibble = nibble_for(chars[rank * 8 + file]);
            if cursor % 2 == 0 {
                packed[cursor / 2] = nibble;
            } else {
                packed[cursor / 2] |= nibble << 4;
            }
            cursor += 1;
        }
    }
    packed
}

/// Unpack the vendor nibble encoding back into board chars.
pub fn unpack_board(packed: &[u8; 32]) -> [char; 64] {
    let mut chars = ['.'; 64];
    let mut cursor = 0usize;
    for rank in (0..8).rev() {
        for file in 0..8 {
            let byte = packed[cursor / 2];
            let nibble = if cursor % 2 == 0 { byte & 0x0F } else { byte >> 4 };
            chars[rank * 8 + file] = PIECE_TABLE
                .get(nibble as usize)
                .copied()
                .unwrap_or('.');
            cursor += 1;
        }
    }
    chars
}

fn encode_battery(percent: u8, charging: bool) -> Vec<u8> {
    let mut out = MSG_BATTERY.to_vec();
    out.push(percent);
    out.push(u8::from(charging));
    out
}

impl Emulator for Chessnut {
    fn kind(&self) -> EmulatorKind {
        EmulatorKind::Chessnut
    }

    fn accept(&mut self, bytes: &[u8]) -> Result<Handled> {
        let commands = self.parse(bytes)?;
        let mut handled = Handled::default();
        for command in commands {
            debug!(?command, "chessnut command");
            handled.merge(self.reply_for(command));
        }
        Ok(handled)
    }

    fn notify_move(&mut self, _mv: GameMove) -> Vec<u8> {
        if !self.realtime {
            return Vec::new();
        }
        self.sequence = self.sequence.wrapping_add(1);
        self.encode_board_state()
    }

    fn notify_battery(&mut self, percent: u8, charging: bool) -> Vec<u8> {
        encode_battery(percent, charging)
    }

    fn encode_board_state(&self) -> Vec<u8> {
        let fen = super::store_fen(&self.store);
        let chars = super::fen_board_chars(&fen);
        let packed = pack_board(&chars);
        self.sequence_bytes(&packed)
    }
}

impl Chessnut {
    fn sequence_bytes(&self, packed: &[u8; 32]) -> Vec<u8> {
        let mut out = MSG_BOARD.to_vec();
        out.extend_from_slice(packed);
        out.extend_from_slice(&self.sequence.to_le_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::position::INITIAL_FEN;

    #[test]
    fn board_packing_round_trips() {
        let chars = super::super::fen_board_chars(INITIAL_FEN);
        let packed = pack_board(&chars);
        assert_eq!(unpack_board(&packed), chars);
    }

    #[test]
    fn packed_board_is_32_bytes_with_a8_first() {
        let chars = super::super::fen_board_chars(INITIAL_FEN);
        let packed = pack_board(&chars);
        // a8 = 'r' (nibble 8) in the low nibble, b8 = 'n' (5) in the high
        assert_eq!(packed[0] & 0x0F, 8);
        assert_eq!(packed[0] >> 4, 5);
    }

    #[test]
    fn realtime_enable_answers_with_the_board() {
        let store = Store::new();
        store.game.mutate(|g| g.fen = INITIAL_FEN.to_string());
        let mut emulator = Chessnut::new(store);
        let handled = emulator.accept(&[CMD_REALTIME, 0x01, 0x00]).unwrap();
        assert_eq!(&handled.reply[..2], &MSG_BOARD);
        assert_eq!(handled.reply.len(), 2 + 32 + 2);
        let mut packed = [0u8; 32];
        packed.copy_from_slice(&handled.reply[2..34]);
        let chars = unpack_board(&packed);
        assert_eq!(chars[4], 'K'); // e1
        assert_eq!(chars[60], 'k'); // e8
    }

    #[test]
    fn battery_notification_is_two_bytes_of_payload() {
        let store = Store::new();
        store.system.mutate(|s| {
            s.battery_percent = 42;
            s.charging = false;
        });
        let mut emulator = Chessnut::new(store);
        let handled = emulator.accept(&[CMD_BATTERY, 0x01, 0x00]).unwrap();
        assert_eq!(handled.reply, vec![0x2A, 0x02, 42, 0]);
    }

    #[test]
    fn led_bitmap_lights_the_right_squares() {
        let mut emulator = Chessnut::new(Store::new());
        let mut frame = vec![CMD_LEDS, 0x08];
        // rank 8 byte first; light e4: rank index 4 from the top is rank 4
        let mut ranks = [0u8; 8];
        ranks[4] = 0x80 >> 4; // file e
        frame.extend_from_slice(&ranks);
        let handled = emulator.accept(&frame).unwrap();
        assert_eq!(
            handled.actions,
            vec![BoardAction::Led {
                square: Square::from_coords(4, 3),
                on: true
            }]
        );
    }

    #[test]
    fn unknown_byte_is_rejected() {
        let mut emulator = Chessnut::new(Store::new());
        assert!(emulator.accept(&[0xFF]).is_err());
    }

    #[test]
    fn partial_led_frame_waits_for_the_rest() {
        let mut emulator = Chessnut::new(Store::new());
        let handled = emulator.accept(&[CMD_LEDS, 0x08, 0, 0]).unwrap();
        assert!(handled.actions.is_empty());
        let handled = emulator.accept(&[0, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(handled.actions, vec![BoardAction::LedsOff]);
    }
}
