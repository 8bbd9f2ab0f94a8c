//! Embedded game store.
//!
//! One SQLite database holds game records, their move lists and the engine
//! install history. Writes come from the game worker only; readers must
//! not block the writer, so every access is a short transaction behind one
//! mutex.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::error::Result;
use crate::types::{GameResult, RecordedMove};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS games (
    id          INTEGER PRIMARY KEY,
    started_at  TEXT NOT NULL,
    ended_at    TEXT,
    white       TEXT NOT NULL,
    black       TEXT NOT NULL,
    result      TEXT,
    source      TEXT NOT NULL,
    opening_fen TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS moves (
    id        INTEGER PRIMARY KEY,
    game_id   INTEGER NOT NULL REFERENCES games(id),
    ply       INTEGER NOT NULL,
    uci       TEXT NOT NULL,
    san       TEXT NOT NULL,
    fen_after TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS moves_game_ply ON moves(game_id, ply);
CREATE TABLE IF NOT EXISTS engine_installs (
    id           INTEGER PRIMARY KEY,
    name         TEXT NOT NULL,
    version      TEXT NOT NULL,
    requested_at TEXT NOT NULL,
    finished_at  TEXT,
    status       TEXT NOT NULL
);
";

/// A persisted game row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameRecord {
    /// Row id.
    pub id: i64,
    /// When the game started.
    pub started_at: DateTime<Utc>,
    /// When the game terminated; `None` marks the resumable game.
    pub ended_at: Option<DateTime<Utc>>,
    /// White player display name.
    pub white: String,
    /// Black player display name.
    pub black: String,
    /// Result once terminated.
    pub result: Option<GameResult>,
    /// Where the game came from (`local`, `lichess`, `remote:millennium`, …).
    pub source: String,
    /// FEN the game started from.
    pub opening_fen: String,
}

/// Status of an engine install job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStatus {
    /// Waiting in the queue.
    Queued,
    /// Build running.
    Building,
    /// Installed.
    Done,
    /// Build failed.
    Failed,
    /// Cancelled while queued.
    Cancelled,
}

impl InstallStatus {
    fn as_str(self) -> &'static str {
        match self {
            InstallStatus::Queued => "queued",
            InstallStatus::Building => "building",
            InstallStatus::Done => "done",
            InstallStatus::Failed => "failed",
            InstallStatus::Cancelled => "cancelled",
        }
    }
}

/// Handle to the store. Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db").finish_non_exhaustive()
    }
}

impl Db {
    /// Open (creating if needed) the database at `path` and run migrations.
    pub fn open(path: &Path) -> Result<Db> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        info!(path = %path.display(), "game store open");
        Ok(Db {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests and the simulated device.
    pub fn open_in_memory() -> Result<Db> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Db {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create a new unterminated game. Any previously unterminated game is
    /// closed as abandoned first, preserving the single-unterminated-game
    /// invariant.
    pub fn create_game(
        &self,
        white: &str,
        black: &str,
        source: &str,
        opening_fen: &str,
    ) -> Result<i64> {
        let conn = self.conn.lock();
        let now = Utc::now().to_rfc3339();
        let orphaned = conn.execute(
            "UPDATE games SET ended_at = ?1, result = ?2 WHERE ended_at IS NULL",
            params![now, "local:abandoned"],
        )?;
        if orphaned > 0 {
            debug!(orphaned, "closed stale unterminated game(s)");
        }
        conn.execute(
            "INSERT INTO games (started_at, white, black, source, opening_fen)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![now, white, black, source, opening_fen],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// The resumable game, if one exists.
    pub fn unterminated_game(&self) -> Result<Option<GameRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, started_at, ended_at, white, black, result, source, opening_fen
             FROM games WHERE ended_at IS NULL ORDER BY id DESC LIMIT 1",
            [],
            row_to_record,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Append one committed move.
    pub fn append_move(&self, game_id: i64, mv: &RecordedMove) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO moves (game_id, ply, uci, san, fen_after) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![game_id, mv.ply, mv.uci, mv.san, mv.fen_after],
        )?;
        Ok(())
    }

    /// Remove the last move of a game (takeback).
    pub fn delete_last_move(&self, game_id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM moves WHERE game_id = ?1
             AND ply = (SELECT MAX(ply) FROM moves WHERE game_id = ?1)",
            params![game_id],
        )?;
        Ok(())
    }

    /// Move list of a game in ply order.
    pub fn moves_for(&self, game_id: i64) -> Result<Vec<RecordedMove>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT ply, uci, san, fen_after FROM moves WHERE game_id = ?1 ORDER BY ply",
        )?;
        let rows = stmt.query_map(params![game_id], |row| {
            Ok(RecordedMove {
                ply: row.get(0)?,
                uci: row.get(1)?,
                san: row.get(2)?,
                fen_after: row.get(3)?,
            })
        })?;
        let mut moves = Vec::new();
        for row in rows {
            moves.push(row?);
        }
        Ok(moves)
    }

    /// Terminate a game with its result.
    pub fn finish_game(&self, game_id: i64, result: &GameResult) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE games SET ended_at = ?1, result = ?2 WHERE id = ?3",
            params![Utc::now().to_rfc3339(), result.as_str(), game_id],
        )?;
        Ok(())
    }

    /// Fetch one game row.
    pub fn game(&self, game_id: i64) -> Result<Option<GameRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, started_at, ended_at, white, black, result, source, opening_fen
             FROM games WHERE id = ?1",
            params![game_id],
            row_to_record,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Count of games with no `ended_at`; the invariant holds at ≤ 1.
    pub fn unterminated_count(&self) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COUNT(*) FROM games WHERE ended_at IS NULL",
            [],
            |row| row.get(0),
        )
        .map_err(Into::into)
    }

    /// Record an engine install request; returns its row id.
    pub fn record_install(&self, name: &str, version: &str) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO engine_installs (name, version, requested_at, status)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                name,
                version,
                Utc::now().to_rfc3339(),
                InstallStatus::Queued.as_str()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Advance an install job's status; terminal states also stamp
    /// `finished_at`.
    pub fn set_install_status(&self, install_id: i64, status: InstallStatus) -> Result<()> {
        let conn = self.conn.lock();
        let finished = matches!(
            status,
            InstallStatus::Done | InstallStatus::Failed | InstallStatus::Cancelled
        );
        if finished {
            conn.execute(
                "UPDATE engine_installs SET status = ?1, finished_at = ?2 WHERE id = ?3",
                params![status.as_str(), Utc::now().to_rfc3339(), install_id],
            )?;
        } else {
            conn.execute(
                "UPDATE engine_installs SET status = ?1 WHERE id = ?2",
                params![status.as_str(), install_id],
            )?;
        }
        Ok(())
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<GameRecord> {
    let parse_ts = |s: String| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now())
    };
    Ok(GameRecord {
        id: row.get(0)?,
        started_at: parse_ts(row.get(1)?),
        ended_at: row.get::<_, Option<String>>(2)?.map(parse_ts),
        white: row.get(3)?,
        black: row.get(4)?,
        result: row.get::<_, Option<String>>(5)?.map(|s| GameResult::parse(&s)),
        source: row.get(6)?,
        opening_fen: row.get(7)?,
    })
}
