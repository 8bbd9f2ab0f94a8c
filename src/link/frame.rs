//! Wire framing for the micro-controller UART protocol.
//!
//! Every frame is `[type][len_hi][len_lo][addr1][addr2][payload…][checksum]`
//! where the two length bytes carry the total frame size (header and
//! checksum included, big-endian) and the checksum is the low byte of the
//! arithmetic sum of every preceding byte.

use crate::error::{Error, Result};
use crate::types::{Key, Square};
use bytes::{BufMut, BytesMut};

/// Fixed header size: type + 2 length bytes + 2 address bytes.
pub const HEADER_LEN: usize = 5;

/// Header plus trailing checksum; a frame with an empty payload is this long.
pub const MIN_FRAME_LEN: usize = HEADER_LEN + 1;

/// Frame type bytes. The set is closed; anything else is an invalid frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Firmware handshake request.
    Init = 0x20,
    /// Generic acknowledge, also the reply to direct commands.
    Ack = 0x21,
    /// Board state request.
    StateRequest = 0x30,
    /// Board state reply: 8 payload bytes, one per sensor row, still in
    /// the sensor-matrix layout.
    State = 0x31,
    /// LED array set: `[mode][intensity][square…]`.
    Leds = 0x40,
    /// Sound command: `[pattern id]`.
    Sound = 0x41,
    /// Power-down request.
    Sleep = 0x42,
    /// Event poll request (empty payload).
    Poll = 0x50,
    /// Key press event: `[keycode]`.
    Key = 0x51,
    /// Piece lift event: `[square]`.
    Lift = 0x52,
    /// Piece place event: `[square]`.
    Place = 0x53,
    /// Battery report: `[percent][charging]`.
    Battery = 0x54,
    /// Charger plug state: `[plugged]`.
    Charger = 0x55,
    /// Empty poll reply: nothing pending.
    Idle = 0x56,
}

impl FrameType {
    /// Decode a type byte.
    pub fn from_byte(b: u8) -> Option<FrameType> {
        Some(match b {
            0x20 => FrameType::Init,
            0x21 => FrameType::Ack,
            0x30 => FrameType::StateRequest,
            0x31 => FrameType::State,
            0x40 => FrameType::Leds,
            0x41 => FrameType::Sound,
            0x42 => FrameType::Sleep,
            0x50 => FrameType::Poll,
            0x51 => FrameType::Key,
            0x52 => FrameType::Lift,
            0x53 => FrameType::Place,
            0x54 => FrameType::Battery,
            0x55 => FrameType::Charger,
            0x56 => FrameType::Idle,
            _ => return None,
        })
    }

    /// Whether frames of this type are unsolicited events (routed to the
    /// event sink) rather than responses to a pending request.
    pub fn is_event(self) -> bool {
        matches!(
            self,
            FrameType::Key
                | FrameType::Lift
                | FrameType::Place
                | FrameType::Battery
                | FrameType::Charger
                | FrameType::Idle
        )
    }
}

/// A parsed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type byte.
    pub frame_type: FrameType,
    /// First address byte (board id).
    pub addr1: u8,
    /// Second address byte (bus id).
    pub addr2: u8,
    /// Payload bytes between header and checksum.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Build a frame with the default address pair.
    pub fn new(frame_type: FrameType, payload: Vec<u8>) -> Self {
        Self {
            frame_type,
            addr1: 0,
            addr2: 0,
            payload,
        }
    }

    /// Encode into wire bytes, checksum appended.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use tactboard::link::frame::{Frame, FrameType};
    ///
    /// let bytes = Frame::new(FrameType::Sound, vec![4]).encode();
    /// assert_eq!(bytes.len(), 7);
    /// assert_eq!(bytes[0], 0x41);
    /// // big-endian total length
    /// assert_eq!((usize::from(bytes[1]) << 8) | usize::from(bytes[2]), 7);
    /// ```
    pub fn encode(&self) -> Vec<u8> {
        let total = MIN_FRAME_LEN + self.payload.len();
        let mut buf = BytesMut::with_capacity(total);
        buf.put_u8(self.frame_type as u8);
        buf.put_u16(total as u16);
        buf.put_u8(self.addr1);
        buf.put_u8(self.addr2);
        buf.put_slice(&self.payload);
        buf.put_u8(checksum(&buf));
        buf.to_vec()
    }

    /// Parse one frame from the start of `bytes`.
    ///
    /// Returns the frame and how many bytes it consumed, or `Ok(None)` when
    /// more bytes are needed. A bad checksum or unknown type byte is an
    /// `InvalidFrame` error; the caller drops the offending byte and resyncs.
    pub fn parse(bytes: &[u8]) -> Result<Option<(Frame, usize)>> {
        if bytes.len() < HEADER_LEN {
            return Ok(None);
        }
        let frame_type = FrameType::from_byte(bytes[0])
            .ok_or_else(|| Error::InvalidFrame(format!("unknown type byte 0x{:02x}", bytes[0])))?;
        let total = (usize::from(bytes[1]) << 8) | usize::from(bytes[2]);
        if total < MIN_FRAME_LEN {
            return Err(Error::InvalidFrame(format!(
                "declared length {total} below minimum"
            )));
        }
        if bytes.len() < total {
            return Ok(None);
        }
        let expected = checksum(&bytes[..total - 1]);
        let got = bytes[total - 1];
        if expected != got {
            return Err(Error::InvalidFrame(format!(
                "checksum mismatch: expected 0x{expected:02x}, got 0x{got:02x}"
            )));
        }
        Ok(Some((
            Frame {
                frame_type,
                addr1: bytes[3],
                addr2: bytes[4],
                payload: bytes[HEADER_LEN..total - 1].to_vec(),
            },
            total,
        )))
    }

    /// Decode the payload of a `State` reply into raw sensor bits:
    /// bit n = sensor index n. The board layer maps sensor indices to
    /// chess squares.
    pub fn state_bits(&self) -> Result<u64> {
        if self.frame_type != FrameType::State || self.payload.len() != 8 {
            return Err(Error::InvalidFrame(format!(
                "state reply with {} payload bytes",
                self.payload.len()
            )));
        }
        let mut bits = 0u64;
        for (row, byte) in self.payload.iter().enumerate() {
            bits |= u64::from(*byte) << (row * 8);
        }
        Ok(bits)
    }
}

/// Low byte of the arithmetic sum of `bytes`.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Decode a key event payload byte.
pub fn decode_key(code: u8) -> Option<Key> {
    Some(match code {
        1 => Key::Up,
        2 => Key::Down,
        3 => Key::Back,
        4 => Key::Tick,
        5 => Key::Help,
        6 => Key::Power,
        _ => return None,
    })
}

/// Build the LED command payload: mode byte, intensity, then hardware
/// square indices. Mode 0 is steady; nonzero modes are firmware flash
/// patterns.
pub fn leds_payload(mode: u8, intensity: u8, hw_squares: impl IntoIterator<Item = u8>) -> Vec<u8> {
    let mut payload = vec![mode, intensity];
    payload.extend(hw_squares);
    payload
}

/// Payload byte of a lift/place event, still in hardware indexing.
pub fn event_square(frame: &Frame) -> Result<u8> {
    match frame.payload.first() {
        Some(&sq) if sq < 64 => Ok(sq),
        Some(&sq) => Err(Error::InvalidFrame(format!(
            "event square {sq} out of range"
        ))),
        None => Err(Error::InvalidFrame("empty event payload".into())),
    }
}

/// A typed request: the frame to send and the reply type to match.
#[derive(Debug, Clone)]
pub struct Request {
    /// Frame written to the wire.
    pub frame: Frame,
    /// Response type the transaction completes on.
    pub expect: FrameType,
}

impl Request {
    /// Firmware handshake.
    pub fn init() -> Self {
        Request {
            frame: Frame::new(FrameType::Init, Vec::new()),
            expect: FrameType::Ack,
        }
    }

    /// Full board-state read.
    pub fn board_state() -> Self {
        Request {
            frame: Frame::new(FrameType::StateRequest, Vec::new()),
            expect: FrameType::State,
        }
    }

    /// Shorthand used for matching: the (type, addr1, addr2) key a response
    /// must carry to complete this request.
    pub fn response_key(&self) -> (FrameType, u8, u8) {
        (self.expect, self.frame.addr1, self.frame.addr2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_parse_round_trip() {
        let frame = Frame::new(FrameType::Leds, leds_payload(0, 200, [0, 7, 63]));
        let bytes = frame.encode();
        let (parsed, used) = Frame::parse(&bytes).unwrap().unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(parsed, frame);
    }

    #[test]
    fn every_emitted_frame_passes_its_own_parser() {
        // checksum closure over the closed type set
        let frames = [
            Frame::new(FrameType::Init, vec![]),
            Frame::new(FrameType::Ack, vec![]),
            Frame::new(FrameType::StateRequest, vec![]),
            Frame::new(FrameType::State, vec![0xFF; 8]),
            Frame::new(FrameType::Leds, vec![0, 255, 12]),
            Frame::new(FrameType::Sound, vec![3]),
            Frame::new(FrameType::Sleep, vec![]),
            Frame::new(FrameType::Poll, vec![]),
            Frame::new(FrameType::Key, vec![4]),
            Frame::new(FrameType::Lift, vec![28]),
            Frame::new(FrameType::Place, vec![36]),
            Frame::new(FrameType::Battery, vec![87, 1]),
            Frame::new(FrameType::Charger, vec![0]),
            Frame::new(FrameType::Idle, vec![]),
        ];
        for frame in frames {
            let bytes = frame.encode();
            let (parsed, used) = Frame::parse(&bytes).unwrap().unwrap();
            assert_eq!(parsed, frame);
            assert_eq!(used, bytes.len());
        }
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let mut bytes = Frame::new(FrameType::Sound, vec![1]).encode();
        let last = bytes.len() - 1;
        bytes[last] = bytes[last].wrapping_add(1);
        assert!(Frame::parse(&bytes).is_err());
    }

    #[test]
    fn unknown_type_byte_is_rejected() {
        let mut bytes = Frame::new(FrameType::Ack, vec![]).encode();
        bytes[0] = 0xEE;
        assert!(Frame::parse(&bytes).is_err());
    }

    #[test]
    fn partial_frame_asks_for_more() {
        let bytes = Frame::new(FrameType::State, vec![0; 8]).encode();
        for cut in 0..bytes.len() {
            assert!(Frame::parse(&bytes[..cut]).unwrap().is_none());
        }
    }

    #[test]
    fn state_bits_row_major_over_payload() {
        let mut payload = vec![0u8; 8];
        payload[0] = 0b0000_0001; // sensor 0
        payload[3] = 0b0001_0000; // sensor 28
        let frame = Frame::new(FrameType::State, payload);
        let bits = frame.state_bits().unwrap();
        assert_ne!(bits & 1, 0);
        assert_ne!(bits & (1 << 28), 0);
        assert_eq!(bits.count_ones(), 2);
    }

    proptest::proptest! {
        #[test]
        fn parse_never_panics_on_noise(noise in proptest::collection::vec(proptest::num::u8::ANY, 0..64)) {
            let _ = Frame::parse(&noise);
        }

        #[test]
        fn checksum_closure(payload in proptest::collection::vec(proptest::num::u8::ANY, 0..32)) {
            let frame = Frame::new(FrameType::Leds, payload);
            let bytes = frame.encode();
            let parsed = Frame::parse(&bytes).unwrap().unwrap().0;
            proptest::prop_assert_eq!(parsed, frame);
        }
    }
}
