//! Core domain types shared across the daemon.
//!
//! Everything here is plain data: squares, presence bitmaps, physical
//! events, results. Chess *rules* live behind `shakmaty` in the engine;
//! these types are what crosses module boundaries and channels.

use serde::{Deserialize, Serialize};

/// A board square, 0..63 with 0 = a1, 1 = b1, …, 8 = a2, 63 = h8.
///
/// This is the chess-side index. The hardware sensor matrix uses a
/// different layout; the board layer translates at its boundary so this
/// index is the only one the rest of the crate ever sees.
///
/// # Examples
///
/// ```rust
/// use tactboard::types::Square;
///
/// let e4 = Square::from_coords(4, 3);
/// assert_eq!(e4.index(), 28);
/// assert_eq!(e4.to_string(), "e4");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Square(u8);

impl Square {
    /// Construct from a raw 0..63 index.
    ///
    /// # Panics
    ///
    /// Panics if `index > 63`.
    pub fn new(index: u8) -> Self {
        assert!(index < 64, "square index out of range: {index}");
        Self(index)
    }

    /// Construct from file (0 = a) and rank (0 = first rank).
    pub fn from_coords(file: u8, rank: u8) -> Self {
        Self::new(rank * 8 + file)
    }

    /// Raw 0..63 index.
    pub fn index(self) -> u8 {
        self.0
    }

    /// File 0..7, 0 = a.
    pub fn file(self) -> u8 {
        self.0 % 8
    }

    /// Rank 0..7, 0 = first rank.
    pub fn rank(self) -> u8 {
        self.0 / 8
    }

    /// Chebyshev (king-move) distance to another square.
    pub fn distance(self, other: Square) -> u8 {
        let df = self.file().abs_diff(other.file());
        let dr = self.rank().abs_diff(other.rank());
        df.max(dr)
    }

    /// All 64 squares in index order.
    pub fn all() -> impl Iterator<Item = Square> {
        (0..64).map(Square)
    }
}

impl std::fmt::Display for Square {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{}",
            (b'a' + self.file()) as char,
            (b'1' + self.rank()) as char
        )
    }
}

impl From<shakmaty::Square> for Square {
    fn from(sq: shakmaty::Square) -> Self {
        Square(sq as u8)
    }
}

impl From<Square> for shakmaty::Square {
    fn from(sq: Square) -> Self {
        shakmaty::Square::new(u32::from(sq.0))
    }
}

/// 64-bit piece-presence bitmap: bit n set = square n occupied.
///
/// Piece identity is deliberately absent; this is exactly what the
/// reed-switch matrix can report, and what the logical position is
/// projected to for comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Presence(pub u64);

impl Presence {
    /// Empty board.
    pub const EMPTY: Presence = Presence(0);

    /// Both back ranks plus both pawn ranks: the initial position.
    pub const INITIAL: Presence = Presence(0xFFFF_0000_0000_FFFF);

    /// Whether `square` is occupied.
    pub fn contains(self, square: Square) -> bool {
        self.0 & (1u64 << square.index()) != 0
    }

    /// Copy with `square` set.
    #[must_use]
    pub fn with(self, square: Square) -> Self {
        Presence(self.0 | (1u64 << square.index()))
    }

    /// Copy with `square` cleared.
    #[must_use]
    pub fn without(self, square: Square) -> Self {
        Presence(self.0 & !(1u64 << square.index()))
    }

    /// Number of occupied squares.
    pub fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Squares present in exactly one of `self` and `other`.
    #[must_use]
    pub fn diff(self, other: Presence) -> Presence {
        Presence(self.0 ^ other.0)
    }

    /// Occupied squares in ascending index order.
    pub fn squares(self) -> impl Iterator<Item = Square> {
        let bits = self.0;
        (0..64u8).filter(move |i| bits & (1 << i) != 0).map(Square)
    }

    /// Squares occupied here but not in `other`.
    pub fn minus(self, other: Presence) -> Presence {
        Presence(self.0 & !other.0)
    }
}

/// Physical key on the board bezel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Key {
    /// Navigate up / previous.
    Up,
    /// Navigate down / next.
    Down,
    /// Cancel / takeback.
    Back,
    /// Confirm / hint.
    Tick,
    /// Menu / help.
    Help,
    /// Long-press power.
    Power,
}

/// Piezo buzzer pattern ids understood by the micro-controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tone {
    /// Short general-purpose beep.
    General,
    /// Factory self-test jingle.
    Factory,
    /// Power up/down chime.
    Power,
    /// Buzz for an illegal move.
    WrongMove,
    /// Confirmation for a committed move.
    Correct,
}

impl Tone {
    /// Wire id in the sound command payload.
    pub fn wire_id(self) -> u8 {
        match self {
            Tone::General => 1,
            Tone::Factory => 2,
            Tone::Power => 3,
            Tone::WrongMove => 4,
            Tone::Correct => 5,
        }
    }

    /// Whether this tone still plays under `sound = moves-only`.
    pub fn is_move_feedback(self) -> bool {
        matches!(self, Tone::WrongMove | Tone::Correct)
    }
}

/// One physical event, produced by the link layer at most once each and
/// delivered in arrival order to the active subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardEvent {
    /// A piece left a square.
    LiftPiece(Square),
    /// A piece arrived on a square.
    PlacePiece(Square),
    /// A bezel key was pressed.
    KeyPress(Key),
    /// Periodic battery report.
    BatteryTick {
        /// Charge percent 0..100.
        percent: u8,
        /// Whether the charger is currently feeding the battery.
        charging: bool,
    },
    /// The charger was plugged or unplugged.
    ChargerState(bool),
}

/// Side to move / piece color. Thin mirror of `shakmaty::Color` so channel
/// payloads stay dependency-free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Color {
    /// White pieces.
    White,
    /// Black pieces.
    Black,
}

impl Color {
    /// The opposing color.
    #[must_use]
    pub fn other(self) -> Color {
        match self {
            Color::White => Color::Black,
            Color::Black => Color::White,
        }
    }
}

impl From<shakmaty::Color> for Color {
    fn from(c: shakmaty::Color) -> Self {
        match c {
            shakmaty::Color::White => Color::White,
            shakmaty::Color::Black => Color::Black,
        }
    }
}

impl From<Color> for shakmaty::Color {
    fn from(c: Color) -> Self {
        match c {
            Color::White => shakmaty::Color::White,
            Color::Black => shakmaty::Color::Black,
        }
    }
}

/// Final result of a game as persisted in the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GameResult {
    /// White won.
    WhiteWins,
    /// Black won.
    BlackWins,
    /// Draw.
    Draw,
    /// Aborted before a chess result, qualified by the aborting source
    /// (e.g. `"remote:disconnect"`).
    Aborted(String),
}

impl GameResult {
    /// PGN-style result string (`1-0`, `0-1`, `1/2-1/2`) or the abort code.
    pub fn as_str(&self) -> &str {
        match self {
            GameResult::WhiteWins => "1-0",
            GameResult::BlackWins => "0-1",
            GameResult::Draw => "1/2-1/2",
            GameResult::Aborted(code) => code,
        }
    }

    /// Parse the persisted form back.
    pub fn parse(s: &str) -> GameResult {
        match s {
            "1-0" => GameResult::WhiteWins,
            "0-1" => GameResult::BlackWins,
            "1/2-1/2" => GameResult::Draw,
            other => GameResult::Aborted(other.to_string()),
        }
    }
}

/// Why a game ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationReason {
    /// Checkmate on the board.
    Checkmate,
    /// Side to move has no legal move and is not in check.
    Stalemate,
    /// Neither side can mate.
    InsufficientMaterial,
    /// Fifty moves without capture or pawn move.
    FiftyMoveRule,
    /// Same position three times.
    ThreefoldRepetition,
    /// A player resigned (king-lift gesture or menu).
    Resignation,
    /// Draw agreed (kings-in-center gesture or menu).
    DrawAgreement,
    /// A clock reached zero.
    FlagFall,
    /// The game was abandoned without a result.
    Abandoned,
}

/// Top-level application state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppState {
    /// Icon menu.
    Menu,
    /// Settings screens.
    Settings,
    /// A game is in progress (local or mirrored remote).
    Game,
    /// Powered but idle (inactivity warning showing).
    Idle,
    /// Shutdown sequence running.
    Shutdown,
}

/// Which controller owns the physical board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActiveController {
    /// Human + engine/online players drive the engine directly.
    Local,
    /// A chess app drives the board through an emulator.
    Remote,
}

/// Remote protocol locked by auto-detect, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RemoteProtocol {
    /// No app locked on.
    #[default]
    None,
    /// Millennium ChessLink.
    Millennium,
    /// DGT Pegasus.
    Pegasus,
    /// Chessnut Air.
    Chessnut,
    /// Online play relay.
    Lichess,
}

/// A move as it travels between players, emulators and the engine:
/// origin, destination and an optional promotion role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameMove {
    /// Origin square.
    pub from: Square,
    /// Destination square.
    pub to: Square,
    /// Promotion piece, if the move promotes.
    pub promotion: Option<PromotionRole>,
}

impl GameMove {
    /// Plain from→to move.
    pub fn new(from: Square, to: Square) -> Self {
        Self {
            from,
            to,
            promotion: None,
        }
    }

    /// UCI text (`e2e4`, `e7e8q`).
    pub fn to_uci(self) -> String {
        match self.promotion {
            Some(p) => format!("{}{}{}", self.from, self.to, p.uci_char()),
            None => format!("{}{}", self.from, self.to),
        }
    }

    /// Parse UCI text. Returns `None` on malformed input.
    pub fn from_uci(s: &str) -> Option<GameMove> {
        let b = s.as_bytes();
        if b.len() != 4 && b.len() != 5 {
            return None;
        }
        let sq = |file: u8, rank: u8| -> Option<Square> {
            if (b'a'..=b'h').contains(&file) && (b'1'..=b'8').contains(&rank) {
                Some(Square::from_coords(file - b'a', rank - b'1'))
            } else {
                None
            }
        };
        let from = sq(b[0], b[1])?;
        let to = sq(b[2], b[3])?;
        let promotion = if b.len() == 5 {
            Some(PromotionRole::from_uci_char(b[4] as char)?)
        } else {
            None
        };
        Some(GameMove {
            from,
            to,
            promotion,
        })
    }
}

impl std::fmt::Display for GameMove {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_uci())
    }
}

/// Pieces a pawn may promote to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PromotionRole {
    /// Queen.
    Queen,
    /// Rook.
    Rook,
    /// Bishop.
    Bishop,
    /// Knight.
    Knight,
}

impl PromotionRole {
    /// Lowercase UCI suffix character.
    pub fn uci_char(self) -> char {
        match self {
            PromotionRole::Queen => 'q',
            PromotionRole::Rook => 'r',
            PromotionRole::Bishop => 'b',
            PromotionRole::Knight => 'n',
        }
    }

    /// Parse a UCI suffix character.
    pub fn from_uci_char(c: char) -> Option<Self> {
        match c.to_ascii_lowercase() {
            'q' => Some(PromotionRole::Queen),
            'r' => Some(PromotionRole::Rook),
            'b' => Some(PromotionRole::Bishop),
            'n' => Some(PromotionRole::Knight),
            _ => None,
        }
    }
}

impl From<PromotionRole> for shakmaty::Role {
    fn from(p: PromotionRole) -> Self {
        match p {
            PromotionRole::Queen => shakmaty::Role::Queen,
            PromotionRole::Rook => shakmaty::Role::Rook,
            PromotionRole::Bishop => shakmaty::Role::Bishop,
            PromotionRole::Knight => shakmaty::Role::Knight,
        }
    }
}

/// One committed move as it is persisted with the game record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedMove {
    /// Half-move number, 1-based.
    pub ply: u32,
    /// UCI text of the move.
    pub uci: String,
    /// SAN text of the move.
    pub san: String,
    /// FEN of the position after the move.
    pub fen_after: String,
}
