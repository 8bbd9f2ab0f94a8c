//! UCI engine session.
//!
//! Speaks the UCI line protocol over any byte stream; production wraps a
//! spawned engine process, tests drive the session over an in-memory
//! duplex pipe. The session is strictly sequential: one `go` in flight at
//! a time, guarded by the caller.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::types::GameMove;

/// Deadline for `uciok` / `readyok` handshakes.
pub const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(10);

/// Extra grace on top of the requested think time before a search is
/// declared lost.
pub const SEARCH_GRACE: Duration = Duration::from_secs(5);

/// Search limits for one `go`.
#[derive(Debug, Clone, Copy)]
pub enum SearchLimit {
    /// Fixed time per move.
    MoveTime(Duration),
    /// Remaining clock times; the engine budgets itself.
    Clock {
        /// White remaining.
        wtime: Duration,
        /// Black remaining.
        btime: Duration,
    },
}

/// One evaluated line from the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchOutcome {
    /// The chosen move.
    pub best: GameMove,
    /// Last reported centipawn score from the engine's point of view.
    pub score_cp: Option<i32>,
}

/// A UCI conversation over arbitrary streams.
pub struct UciSession<R, W> {
    reader: BufReader<R>,
    writer: W,
    name: String,
}

impl<R, W> UciSession<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Wrap raw streams; no bytes are exchanged yet.
    pub fn new(name: impl Into<String>, reader: R, writer: W) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer,
            name: name.into(),
        }
    }

    /// Run the `uci` handshake and apply strength options.
    pub async fn handshake(&mut self, elo: Option<u32>) -> Result<()> {
        self.send("uci").await?;
        self.read_until(|line| line == "uciok", HANDSHAKE_DEADLINE)
            .await?;
        if let Some(elo) = elo {
            self.send("setoption name UCI_LimitStrength value true")
                .await?;
            self.send(&format!("setoption name UCI_Elo value {elo}"))
                .await?;
        }
        self.send("isready").await?;
        self.read_until(|line| line == "readyok", HANDSHAKE_DEADLINE)
            .await?;
        debug!(engine = %self.name, ?elo, "uci handshake complete");
        Ok(())
    }

    /// Reset engine state for a fresh game.
    pub async fn new_game(&mut self) -> Result<()> {
        self.send("ucinewgame").await?;
        self.send("isready").await?;
        self.read_until(|line| line == "readyok", HANDSHAKE_DEADLINE)
            .await?;
        Ok(())
    }

    /// Search the given position and return the best move.
    pub async fn best_move(
        &mut self,
        fen: &str,
        moves: &[String],
        limit: SearchLimit,
    ) -> Result<SearchOutcome> {
        if moves.is_empty() {
            self.send(&format!("position fen {fen}")).await?;
        } else {
            self.send(&format!("position fen {fen} moves {}", moves.join(" ")))
                .await?;
        }
        let (go, deadline) = match limit {
            SearchLimit::MoveTime(t) => (
                format!("go movetime {}", t.as_millis()),
                t + SEARCH_GRACE,
            ),
            SearchLimit::Clock { wtime, btime } => (
                format!("go wtime {} btime {}", wtime.as_millis(), btime.as_millis()),
                wtime.max(btime) + SEARCH_GRACE,
            ),
        };
        self.send(&go).await?;

        let mut score_cp = None;
        let line = self
            .read_until_collect(
                |line| line.starts_with("bestmove "),
                deadline,
                |line| {
                    if let Some(cp) = parse_score(line) {
                        score_cp = Some(cp);
                    }
                },
            )
            .await?;
        let token = line
            .split_whitespace()
            .nth(1)
            .ok_or_else(|| engine_garbage(&self.name, &line))?;
        let best = GameMove::from_uci(token).ok_or_else(|| engine_garbage(&self.name, &line))?;
        Ok(SearchOutcome { best, score_cp })
    }

    /// Ask a running search to stop early.
    pub async fn stop_search(&mut self) -> Result<()> {
        self.send("stop").await
    }

    /// Polite shutdown.
    pub async fn quit(&mut self) -> Result<()> {
        self.send("quit").await
    }

    async fn send(&mut self, line: &str) -> Result<()> {
        trace!(engine = %self.name, ">> {line}");
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn read_until(
        &mut self,
        done: impl Fn(&str) -> bool,
        deadline: Duration,
    ) -> Result<String> {
        self.read_until_collect(done, deadline, |_| {}).await
    }

    async fn read_until_collect(
        &mut self,
        done: impl Fn(&str) -> bool,
        deadline: Duration,
        mut each: impl FnMut(&str),
    ) -> Result<String> {
        let name = self.name.clone();
        let read = async {
            let mut line = String::new();
            loop {
                line.clear();
                let n = self.reader.read_line(&mut line).await?;
                if n == 0 {
                    return Err(Error::EngineFailed {
                        name: name.clone(),
                        reason: "engine closed its output".into(),
                    });
                }
                let trimmed = line.trim();
                trace!(engine = %name, "<< {trimmed}");
                each(trimmed);
                if done(trimmed) {
                    return Ok(trimmed.to_string());
                }
            }
        };
        match tokio::time::timeout(deadline, read).await {
            Ok(result) => result,
            Err(_) => Err(Error::EngineFailed {
                name: self.name.clone(),
                reason: format!("no reply within {deadline:?}"),
            }),
        }
    }
}

fn parse_score(line: &str) -> Option<i32> {
    // "info depth 12 ... score cp 35 ..." / "score mate 3"
    let mut tokens = line.split_whitespace();
    while let Some(token) = tokens.next() {
        if token == "score" {
            return match tokens.next()? {
                "cp" => tokens.next()?.parse().ok(),
                "mate" => {
                    let plies: i32 = tokens.next()?.parse().ok()?;
                    Some(if plies >= 0 { 30_000 - plies } else { -30_000 - plies })
                }
                _ => None,
            };
        }
    }
    None
}

fn engine_garbage(name: &str, line: &str) -> Error {
    Error::EngineFailed {
        name: name.to_string(),
        reason: format!("unparseable bestmove line: {line}"),
    }
}

/// A spawned engine process with its UCI session.
pub struct EngineProcess {
    child: Child,
    session: UciSession<tokio::process::ChildStdout, tokio::process::ChildStdin>,
}

impl std::fmt::Debug for EngineProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineProcess").finish_non_exhaustive()
    }
}

impl EngineProcess {
    /// Spawn `binary` and complete the handshake.
    pub async fn spawn(name: &str, binary: &Path, elo: Option<u32>) -> Result<EngineProcess> {
        let mut child = Command::new(binary)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::EngineFailed {
                name: name.to_string(),
                reason: format!("spawn {}: {e}", binary.display()),
            })?;
        let stdout = child.stdout.take().ok_or_else(|| Error::EngineFailed {
            name: name.to_string(),
            reason: "no stdout".into(),
        })?;
        let stdin = child.stdin.take().ok_or_else(|| Error::EngineFailed {
            name: name.to_string(),
            reason: "no stdin".into(),
        })?;
        let mut session = UciSession::new(name, stdout, stdin);
        session.handshake(elo).await?;
        Ok(EngineProcess { child, session })
    }

    /// The UCI conversation.
    pub fn session(
        &mut self,
    ) -> &mut UciSession<tokio::process::ChildStdout, tokio::process::ChildStdin> {
        &mut self.session
    }

    /// Quit politely, then kill after a bounded wait.
    pub async fn shutdown(&mut self) {
        let _ = self.session.quit().await;
        match tokio::time::timeout(Duration::from_secs(2), self.child.wait()).await {
            Ok(Ok(status)) => debug!(?status, "engine exited"),
            _ => {
                warn!("engine ignored quit; killing");
                let _ = self.child.kill().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader as TestBufReader};

    /// Minimal scripted engine living on the far end of a duplex pipe.
    fn scripted_engine(
        stream: tokio::io::DuplexStream,
        best: &'static str,
    ) -> tokio::task::JoinHandle<Vec<String>> {
        tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(stream);
            let mut lines = TestBufReader::new(read).lines();
            let mut received = Vec::new();
            while let Ok(Some(line)) = lines.next_line().await {
                received.push(line.clone());
                let reply: Option<String> = if line == "uci" {
                    Some("id name scripted\nuciok".into())
                } else if line == "isready" {
                    Some("readyok".into())
                } else if line.starts_with("go") {
                    Some(format!("info depth 1 score cp 42 pv {best}\nbestmove {best}"))
                } else if line == "quit" {
                    break;
                } else {
                    None
                };
                if let Some(reply) = reply {
                    write.write_all(reply.as_bytes()).await.unwrap();
                    write.write_all(b"\n").await.unwrap();
                }
            }
            received
        })
    }

    #[tokio::test]
    async fn handshake_and_search() {
        let (ours, theirs) = tokio::io::duplex(4096);
        let script = scripted_engine(theirs, "e2e4");
        let (read, write) = tokio::io::split(ours);
        let mut session = UciSession::new("scripted", read, write);

        session.handshake(Some(1500)).await.unwrap();
        let outcome = session
            .best_move(
                crate::engine::position::INITIAL_FEN,
                &[],
                SearchLimit::MoveTime(Duration::from_millis(100)),
            )
            .await
            .unwrap();
        assert_eq!(outcome.best.to_uci(), "e2e4");
        assert_eq!(outcome.score_cp, Some(42));

        session.quit().await.unwrap();
        let received = script.await.unwrap();
        assert!(received
            .iter()
            .any(|l| l == "setoption name UCI_Elo value 1500"));
        assert!(received.iter().any(|l| l.starts_with("position fen ")));
    }

    #[tokio::test]
    async fn moves_are_appended_to_the_position_command() {
        let (ours, theirs) = tokio::io::duplex(4096);
        let script = scripted_engine(theirs, "g8f6");
        let (read, write) = tokio::io::split(ours);
        let mut session = UciSession::new("scripted", read, write);
        session.handshake(None).await.unwrap();
        session
            .best_move(
                crate::engine::position::INITIAL_FEN,
                &["e2e4".into(), "e7e5".into()],
                SearchLimit::MoveTime(Duration::from_millis(50)),
            )
            .await
            .unwrap();
        session.quit().await.unwrap();
        let received = script.await.unwrap();
        assert!(received
            .iter()
            .any(|l| l.ends_with("moves e2e4 e7e5")), "{received:?}");
    }

    #[tokio::test]
    async fn closed_engine_is_reported_as_failed() {
        let (ours, theirs) = tokio::io::duplex(64);
        drop(theirs);
        let (read, write) = tokio::io::split(ours);
        let mut session = UciSession::new("dead", read, write);
        let err = session.handshake(None).await.unwrap_err();
        assert!(matches!(err, Error::EngineFailed { .. }));
    }

    #[test]
    fn score_parsing() {
        assert_eq!(parse_score("info depth 9 score cp -17 nodes 1"), Some(-17));
        assert_eq!(parse_score("info score mate 2 pv e1g1"), Some(29_998));
        assert_eq!(parse_score("info score mate -3"), Some(-29_997));
        assert_eq!(parse_score("info depth 2 nodes 5"), None);
    }
}
