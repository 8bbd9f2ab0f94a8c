//! Error taxonomy for the board daemon.
//!
//! The set of failure classes is closed by design: every component surfaces
//! one of these variants upward and the orchestrator decides between alert,
//! retry and exit. Transient conditions carry enough context to be retried
//! without re-parsing the message text.

use std::time::Duration;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// All failure classes the daemon can surface.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Serial open, firmware handshake or controller ack failed.
    ///
    /// Fatal at startup (exit code 70). At runtime the link retries up to
    /// its attempt budget, then the app drops to display-only mode.
    #[error("hardware initialization failed: {0}")]
    HardwareInitFailed(String),

    /// A request/response transaction on the serial link missed its deadline.
    #[error("link timeout after {0:?}")]
    LinkTimeout(Duration),

    /// A parser rejected inbound bytes (serial frame or emulator command).
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// A lift/place sequence did not form a legal move.
    ///
    /// Always recovered by correction mode; never fatal.
    #[error("illegal move from {from}")]
    IllegalMove {
        /// Square the offending sequence started from.
        from: crate::types::Square,
    },

    /// The embedded store rejected a write.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// A UCI engine process died or answered garbage.
    #[error("engine '{name}' failed: {reason}")]
    EngineFailed {
        /// Registry name of the engine.
        name: String,
        /// What went wrong.
        reason: String,
    },

    /// A Bluetooth connection failed; scoped to that connection.
    #[error("transport error: {0}")]
    Transport(String),

    /// Configuration could not be loaded or validated. Startup only (exit 64).
    #[error("config error: {0}")]
    Config(String),

    /// Cooperative shutdown was requested while an operation was in flight.
    #[error("operation cancelled")]
    Cancelled,

    /// Underlying I/O failure not covered by a more specific class.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Process exit code for errors that abort startup.
    ///
    /// Mirrors the sysexits-style contract of the orchestrator binary:
    /// 64 config, 70 hardware, 75 transient I/O, 1 everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) => 64,
            Error::HardwareInitFailed(_) => 70,
            Error::LinkTimeout(_) | Error::Io(_) | Error::Transport(_) => 75,
            _ => 1,
        }
    }

    /// Whether the orchestrator may retry the failed operation.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::LinkTimeout(_) | Error::Persistence(_) | Error::Transport(_) | Error::Io(_)
        )
    }

    /// Whether the failure is recovered inside the game engine
    /// (correction mode) rather than surfaced to the user as an error.
    pub fn is_recoverable_in_game(&self) -> bool {
        matches!(self, Error::IllegalMove { .. })
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Persistence(e.to_string())
    }
}
