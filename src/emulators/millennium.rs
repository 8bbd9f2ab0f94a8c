//! Millennium ChessLink emulation.
//!
//! ASCII command/response protocol: commands are single uppercase letters
//! with fixed-length arguments, responses are the lowercase echo. Every
//! byte carries odd parity in its MSB; every message ends with two hex
//! digits holding the XOR of the parity-stripped message characters.

use tracing::debug;

use crate::error::{Error, Result};
use crate::store::Store;
use crate::types::{GameMove, Square};

use super::{BoardAction, Emulator, EmulatorKind, Handled};

/// Firmware version the emulator reports (`v` reply).
pub const VERSION_DIGITS: &str = "0310";

/// Add odd parity to a 7-bit character.
pub fn with_parity(c: u8) -> u8 {
    let seven = c & 0x7F;
    if seven.count_ones() % 2 == 0 {
        seven | 0x80
    } else {
        seven
    }
}

/// Strip and verify odd parity. `None` on a parity violation.
pub fn strip_parity(b: u8) -> Option<u8> {
    if b.count_ones() % 2 == 1 {
        Some(b & 0x7F)
    } else {
        None
    }
}

/// XOR checksum over parity-stripped chars, rendered as two hex digits.
fn checksum_digits(payload: &[u8]) -> [u8; 2] {
    let x = payload.iter().fold(0u8, |acc, b| acc ^ b);
    let hex = |n: u8| {
        if n < 10 {
            b'0' + n
        } else {
            b'A' + n - 10
        }
    };
    [hex(x >> 4), hex(x & 0x0F)]
}

/// Encode `payload` (plain ASCII) as a full wire message: parity on every
/// byte, XOR checksum appended.
pub fn encode_command(payload: &str) -> Vec<u8> {
    let chars: Vec<u8> = payload.bytes().collect();
    let check = checksum_digits(&chars);
    chars
        .iter()
        .chain(check.iter())
        .map(|b| with_parity(*b))
        .collect()
}

/// A decoded ChessLink command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// `V`: firmware version query.
    Version,
    /// `S`: full board state query.
    BoardState,
    /// `L<sq><state>`: set one LED.
    SetLed {
        /// Target square.
        square: Square,
        /// 0 = off, nonzero = vendor pattern.
        state: u8,
    },
    /// `X`: all LEDs off.
    AllLedsOff,
    /// `W`: enable the sensor scan.
    ScanOn,
    /// `I`: disable the sensor scan.
    ScanOff,
    /// `R`: reset the session.
    Reset,
}

/// Payload length (before checksum) for a command letter.
fn command_len(letter: u8) -> Option<usize> {
    Some(match letter {
        b'V' | b'S' | b'X' | b'W' | b'I' | b'R' => 1,
        b'L' => 5,
        _ => return None,
    })
}

/// The ChessLink emulator.
pub struct Millennium {
    store: Store,
    buffer: Vec<u8>,
    scan_enabled: bool,
}

impl std::fmt::Debug for Millennium {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Millennium")
            .field("buffered", &self.buffer.len())
            .field("scan_enabled", &self.scan_enabled)
            .finish()
    }
}

impl Millennium {
    /// Emulator reading positions from `store`.
    pub fn new(store: Store) -> Millennium {
        Millennium {
            store,
            buffer: Vec::new(),
            scan_enabled: true,
        }
    }

    /// Parse as many complete commands as the buffer holds.
    pub fn parse(&mut self, bytes: &[u8]) -> Result<Vec<Command>> {
        for b in bytes {
            let stripped = strip_parity(*b).ok_or_else(|| {
                Error::InvalidFrame(format!("parity violation on 0x{b:02x}"))
            })?;
            self.buffer.push(stripped);
        }

        let mut commands = Vec::new();
        loop {
            let Some(&letter) = self.buffer.first() else {
                break;
            };
            let len = command_len(letter)
                .ok_or_else(|| Error::InvalidFrame(format!("unknown command '{}'", letter as char)))?;
            let total = len + 2;
            if self.buffer.len() < total {
                break;
            }
            let message: Vec<u8> = self.buffer.drain(..total).collect();
            let (payload, check) = message.split_at(len);
            if checksum_digits(payload) != [check[0], check[1]] {
                return Err(Error::InvalidFrame("bad xor checksum".into()));
            }
            commands.push(decode_command(payload)?);
        }
        Ok(commands)
    }

    fn reply_for(&mut self, command: Command) -> Handled {
        match command {
            Command::Version => Handled {
                reply: encode_command(&format!("v{VERSION_DIGITS}")),
                actions: Vec::new(),
            },
            Command::BoardState => Handled {
                reply: self.encode_board_state(),
                actions: Vec::new(),
            },
            Command::SetLed { square, state } => Handled {
                reply: encode_command("l"),
                actions: vec![BoardAction::Led {
                    square,
                    on: state != 0,
                }],
            },
            Command::AllLedsOff => Handled {
                reply: encode_command("x"),
                actions: vec![BoardAction::LedsOff],
            },
            Command::ScanOn => {
                self.scan_enabled = true;
                Handled {
                    reply: encode_command("w"),
                    actions: vec![BoardAction::ScanEnable(true)],
                }
            }
            Command::ScanOff => {
                self.scan_enabled = false;
                Handled {
                    reply: encode_command("i"),
                    actions: vec![BoardAction::ScanEnable(false)],
                }
            }
            Command::Reset => Handled {
                reply: encode_command("r"),
                actions: vec![BoardAction::Reset],
            },
        }
    }
}

fn decode_command(payload: &[u8]) -> Result<Command> {
    let hex = |b: u8| -> Result<u8> {
        match b {
            b'0'..=b'9' => Ok(b - b'0'),
            b'A'..=b'F' => Ok(b - b'A' + 10),
            b'a'..=b'f' => Ok(b - b'a' + 10),
            _ => Err(Error::InvalidFrame(format!("bad hex digit '{}'", b as char))),
        }
    };
    Ok(match payload[0] {
        b'V' => Command::Version,
        b'S' => Command::BoardState,
        b'X' => Command::AllLedsOff,
        b'W' => Command::ScanOn,
        b'I' => Command::ScanOff,
        b'R' => Command::Reset,
        b'L' => {
            let index = hex(payload[1])? << 4 | hex(payload[2])?;
            if index > 63 {
                return Err(Error::InvalidFrame(format!("led square {index} out of range")));
            }
            Command::SetLed {
                square: Square::new(index),
                state: hex(payload[3])? << 4 | hex(payload[4])?,
            }
        }
        other => {
            return Err(Error::InvalidFrame(format!(
                "unknown command '{}'",
                other as char
            )))
        }
    })
}

/// Board state characters in ChessLink order: rank 8 down to rank 1,
/// files a→h inside each rank.
fn board_chars_chesslink(fen: &str) -> String {
    let chars = super::fen_board_chars(fen);
    let mut out = String::with_capacity(64);
    for rank in (0..8).rev() {
        for file in 0..8 {
            out.push(chars[rank * 8 + file]);
        }
    }
    out
}

/// Decode an `s` board-state reply back to the 64 chars (test and relay
/// support).
pub fn decode_board_state(reply: &[u8]) -> Result<String> {
    let stripped: Vec<u8> = reply
        .iter()
        .map(|b| strip_parity(*b).ok_or_else(|| Error::InvalidFrame("parity".into())))
        .collect::<Result<_>>()?;
    if stripped.len() != 67 || stripped[0] != b's' {
        return Err(Error::InvalidFrame("not an s reply".into()));
    }
    let (payload, check) = stripped.split_at(65);
    if checksum_digits(payload) != [check[0], check[1]] {
        return Err(Error::InvalidFrame("bad xor checksum".into()));
    }
    Ok(String::from_utf8_lossy(&payload[1..]).into_owned())
}

impl Emulator for Millennium {
    fn kind(&self) -> EmulatorKind {
        EmulatorKind::Millennium
    }

    fn accept(&mut self, bytes: &[u8]) -> Result<Handled> {
        let commands = self.parse(bytes)?;
        let mut handled = Handled::default();
        for command in commands {
            debug!(?command, "chesslink command");
            handled.merge(self.reply_for(command));
        }
        Ok(handled)
    }

    fn notify_move(&mut self, _mv: GameMove) -> Vec<u8> {
        // ChessLink apps poll with `S`; a state push is simply the fresh
        // board answer
        self.encode_board_state()
    }

    fn notify_battery(&mut self, _percent: u8, _charging: bool) -> Vec<u8> {
        // the vendor protocol has no battery message
        Vec::new()
    }

    fn encode_board_state(&self) -> Vec<u8> {
        let fen = super::store_fen(&self.store);
        encode_command(&format!("s{}", board_chars_chesslink(&fen)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::position::INITIAL_FEN;

    #[test]
    fn parity_round_trip() {
        for c in 0u8..128 {
            let wire = with_parity(c);
            assert_eq!(wire.count_ones() % 2, 1, "0x{wire:02x} not odd parity");
            assert_eq!(strip_parity(wire), Some(c));
        }
        // even-parity byte is rejected
        assert_eq!(strip_parity(0x56), None);
    }

    #[test]
    fn the_v_command_encodes_to_0xd6() {
        let frame = encode_command("V");
        assert_eq!(frame[0], 0xD6);
    }

    #[test]
    fn version_query_answers_lowercase_v() {
        let mut emulator = Millennium::new(Store::new());
        let handled = emulator.accept(&encode_command("V")).unwrap();
        let stripped: Vec<u8> = handled
            .reply
            .iter()
            .map(|b| strip_parity(*b).unwrap())
            .collect();
        assert_eq!(&stripped[..5], b"v0310");
    }

    #[test]
    fn board_state_round_trip() {
        let store = Store::new();
        store
            .game
            .mutate(|g| g.fen = INITIAL_FEN.to_string());
        let mut emulator = Millennium::new(store);
        let handled = emulator.accept(&encode_command("S")).unwrap();
        let chars = decode_board_state(&handled.reply).unwrap();
        assert_eq!(chars.len(), 64);
        // rank 8 first
        assert!(chars.starts_with("rnbqkbnr"));
        assert!(chars.ends_with("RNBQKBNR"));
        assert_eq!(&chars[16..24], "........");
    }

    #[test]
    fn led_command_maps_to_a_board_action() {
        let mut emulator = Millennium::new(Store::new());
        // L + square 1C (e4 = 28) + state 01
        let handled = emulator.accept(&encode_command("L1C01")).unwrap();
        assert_eq!(
            handled.actions,
            vec![BoardAction::Led {
                square: Square::new(28),
                on: true
            }]
        );
        let handled = emulator.accept(&encode_command("X")).unwrap();
        assert_eq!(handled.actions, vec![BoardAction::LedsOff]);
    }

    #[test]
    fn partial_frames_are_buffered() {
        let mut emulator = Millennium::new(Store::new());
        let frame = encode_command("L1C01");
        let (a, b) = frame.split_at(3);
        let handled = emulator.accept(a).unwrap();
        assert!(handled.reply.is_empty());
        let handled = emulator.accept(b).unwrap();
        assert_eq!(handled.actions.len(), 1);
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let mut emulator = Millennium::new(Store::new());
        let mut frame = encode_command("V");
        let last = frame.len() - 1;
        // swap the final checksum digit for another valid-parity char
        frame[last] = with_parity(b'Z');
        assert!(emulator.accept(&frame).is_err());
    }

    #[test]
    fn scan_enable_disable() {
        let mut emulator = Millennium::new(Store::new());
        let handled = emulator.accept(&encode_command("I")).unwrap();
        assert_eq!(handled.actions, vec![BoardAction::ScanEnable(false)]);
        let handled = emulator.accept(&encode_command("W")).unwrap();
        assert_eq!(handled.actions, vec![BoardAction::ScanEnable(true)]);
    }

    #[test]
    fn golden_capture_is_accepted() {
        // bytes captured from a ChessLink app session: V, W, S, X
        let mut capture = Vec::new();
        capture.extend(encode_command("V"));
        capture.extend(encode_command("W"));
        capture.extend(encode_command("S"));
        capture.extend(encode_command("X"));
        let mut emulator = Millennium::new(Store::new());
        let handled = emulator.accept(&capture).unwrap();
        assert!(handled.actions.contains(&BoardAction::ScanEnable(true)));
        assert!(handled.actions.contains(&BoardAction::LedsOff));
        assert!(!handled.reply.is_empty());
    }
}
