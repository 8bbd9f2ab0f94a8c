//! Players: human, UCI engine, online opponent.
//!
//! Every variant answers `request_move` through the shared sink rather
//! than a return value; engine and online moves become *pending moves*
//! that the game engine shows on LEDs and commits only when physically
//! executed. Engine processes are shared through the registry, never
//! owned by a single player.

pub mod registry;
pub mod uci;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::types::{GameMove, GameResult};
use registry::{EngineLease, EngineRegistry};
use uci::SearchLimit;

/// What a player pushes back through its sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerEvent {
    /// The player proposes a move (engine/online); for the human variant
    /// the proposal *is* the physically executed move.
    Propose {
        /// The proposed move.
        mv: GameMove,
        /// Engine evaluation when one is available.
        score_cp: Option<i32>,
    },
    /// The opposing side resigned or the remote game ended.
    GameEnded {
        /// Result reported by the remote end.
        result: GameResult,
    },
    /// The player cannot continue (engine died, stream broke).
    Failed {
        /// Human-readable reason.
        reason: String,
    },
}

/// Sink every player answers through. Events are tagged with the color the
/// sink was built for, so the controller can route proposals.
#[derive(Debug, Clone)]
pub struct PlayerSink {
    color: crate::types::Color,
    tx: mpsc::UnboundedSender<(crate::types::Color, PlayerEvent)>,
}

impl PlayerSink {
    /// A sink tagging every event with `color`.
    pub fn new(
        color: crate::types::Color,
        tx: mpsc::UnboundedSender<(crate::types::Color, PlayerEvent)>,
    ) -> Self {
        Self { color, tx }
    }

    /// Push an event. Returns `false` when the receiving side is gone.
    pub fn send(&self, event: PlayerEvent) -> bool {
        self.tx.send((self.color, event)).is_ok()
    }
}

/// Uniform player contract.
#[async_trait]
pub trait Player: Send {
    /// Display name.
    fn name(&self) -> &str;
    /// Bring the player to readiness (spawn/acquire processes, open
    /// streams). An error leaves the player unusable.
    async fn start(&mut self) -> Result<()>;
    /// Cooperative stop: cancel outstanding work, release resources.
    async fn stop(&mut self);
    /// Ask for a move from `fen` after `moves`. The answer arrives through
    /// the sink; the call itself returns once the request is underway.
    async fn request_move(&mut self, fen: String, moves: Vec<String>) -> Result<()>;
    /// The opponent's move was committed.
    async fn on_opponent_move(&mut self, mv: GameMove, fen: String) -> Result<()>;
    /// A fresh game started; abandon any pending computation.
    async fn on_new_game(&mut self) -> Result<()>;
}

/// The human at the board. Moves arrive as physical events; this variant
/// only keeps the contract uniform.
#[derive(Debug)]
pub struct HumanPlayer {
    name: String,
}

impl HumanPlayer {
    /// A human with a display name.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Player for HumanPlayer {
    fn name(&self) -> &str {
        &self.name
    }
    async fn start(&mut self) -> Result<()> {
        Ok(())
    }
    async fn stop(&mut self) {}
    async fn request_move(&mut self, _fen: String, _moves: Vec<String>) -> Result<()> {
        // the board itself is the input device
        Ok(())
    }
    async fn on_opponent_move(&mut self, _mv: GameMove, _fen: String) -> Result<()> {
        Ok(())
    }
    async fn on_new_game(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Configuration for a UCI engine player.
#[derive(Debug, Clone)]
pub struct EnginePlayerConfig {
    /// Engine name; also the binary name inside the engines directory.
    pub name: String,
    /// Elo limit section, when playing below full strength.
    pub elo: Option<u32>,
    /// Think time per move.
    pub movetime: Duration,
}

/// A UCI engine behind the shared registry.
pub struct EnginePlayer {
    config: EnginePlayerConfig,
    registry: EngineRegistry,
    sink: PlayerSink,
    lease: Option<EngineLease>,
    current: Option<(tokio::task::JoinHandle<()>, CancellationToken)>,
}

impl std::fmt::Debug for EnginePlayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnginePlayer")
            .field("config", &self.config)
            .field("started", &self.lease.is_some())
            .finish()
    }
}

impl EnginePlayer {
    /// Build against the shared registry.
    pub fn new(config: EnginePlayerConfig, registry: EngineRegistry, sink: PlayerSink) -> Self {
        Self {
            config,
            registry,
            sink,
            lease: None,
            current: None,
        }
    }

    fn cancel_current(&mut self) {
        if let Some((task, cancel)) = self.current.take() {
            cancel.cancel();
            task.abort();
        }
    }
}

#[async_trait]
impl Player for EnginePlayer {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn start(&mut self) -> Result<()> {
        let lease = self
            .registry
            .acquire(&self.config.name, self.config.elo)
            .await?;
        self.lease = Some(lease);
        Ok(())
    }

    async fn stop(&mut self) {
        self.cancel_current();
        self.lease.take(); // drop releases the registry reference
    }

    async fn request_move(&mut self, fen: String, moves: Vec<String>) -> Result<()> {
        if self.lease.is_none() {
            return Err(Error::EngineFailed {
                name: self.config.name.clone(),
                reason: "player not started".into(),
            });
        };
        self.cancel_current();

        let lease = self.lease.as_ref().expect("checked above");
        let process = lease.process();
        let sink = self.sink.clone();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let name = self.config.name.clone();
        let movetime = self.config.movetime;

        // search on a short-lived task so the game worker never blocks on
        // engine I/O
        let task = tokio::spawn(async move {
            let mut proc = process.lock().await;
            let session = proc.session();
            let outcome = tokio::select! {
                outcome = session.best_move(&fen, &moves, SearchLimit::MoveTime(movetime)) => outcome,
                () = token.cancelled() => Err(Error::Cancelled),
            };
            match outcome {
                Ok(found) => {
                    let _ = sink.send(PlayerEvent::Propose {
                        mv: found.best,
                        score_cp: found.score_cp,
                    });
                }
                Err(Error::Cancelled) => {
                    // tell the engine to wind down; the stale bestmove line
                    // is skipped by the next read_until
                    let _ = session.stop_search().await;
                    debug!(engine = %name, "search cancelled");
                }
                Err(e) => {
                    warn!(engine = %name, error = %e, "search failed");
                    let _ = sink.send(PlayerEvent::Failed {
                        reason: e.to_string(),
                    });
                }
            }
        });
        self.current = Some((task, cancel));
        Ok(())
    }

    async fn on_opponent_move(&mut self, _mv: GameMove, _fen: String) -> Result<()> {
        // position is sent fresh with every request
        Ok(())
    }

    async fn on_new_game(&mut self) -> Result<()> {
        self.cancel_current();
        if let Some(lease) = &self.lease {
            let process = lease.process();
            let mut proc = process.lock().await;
            proc.session().new_game().await?;
        }
        Ok(())
    }
}

/// Inbound events from an online game stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// The remote opponent moved.
    OpponentMove(GameMove),
    /// The remote game ended.
    GameEnd(GameResult),
}

/// The two halves of an online game connection. A connector (kept outside
/// the core) produces one of these per game.
#[derive(Debug)]
pub struct OnlineChannel {
    /// Remote→board events.
    pub incoming: mpsc::UnboundedReceiver<StreamEvent>,
    /// Board→remote committed moves.
    pub outgoing: mpsc::UnboundedSender<GameMove>,
}

/// An online opponent bridged over an [`OnlineChannel`].
pub struct OnlinePlayer {
    name: String,
    channel: Option<OnlineChannel>,
    outgoing: Option<mpsc::UnboundedSender<GameMove>>,
    sink: PlayerSink,
    pump: Option<tokio::task::JoinHandle<()>>,
}

impl std::fmt::Debug for OnlinePlayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnlinePlayer")
            .field("name", &self.name)
            .field("started", &self.pump.is_some())
            .finish()
    }
}

impl OnlinePlayer {
    /// Wrap a connected channel.
    pub fn new(name: impl Into<String>, channel: OnlineChannel, sink: PlayerSink) -> Self {
        Self {
            name: name.into(),
            channel: Some(channel),
            outgoing: None,
            sink,
            pump: None,
        }
    }
}

#[async_trait]
impl Player for OnlinePlayer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&mut self) -> Result<()> {
        let Some(channel) = self.channel.take() else {
            return Err(Error::Transport("online channel already consumed".into()));
        };
        self.outgoing = Some(channel.outgoing.clone());
        let sink = self.sink.clone();
        let mut incoming = channel.incoming;
        self.pump = Some(tokio::spawn(async move {
            while let Some(event) = incoming.recv().await {
                let forwarded = match event {
                    StreamEvent::OpponentMove(mv) => PlayerEvent::Propose {
                        mv,
                        score_cp: None,
                    },
                    StreamEvent::GameEnd(result) => PlayerEvent::GameEnded { result },
                };
                if !sink.send(forwarded) {
                    return;
                }
            }
            let _ = sink.send(PlayerEvent::Failed {
                reason: "game stream closed".into(),
            });
        }));
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.outgoing = None;
    }

    async fn request_move(&mut self, _fen: String, _moves: Vec<String>) -> Result<()> {
        // the stream pushes the move when the remote side plays
        Ok(())
    }

    async fn on_opponent_move(&mut self, mv: GameMove, _fen: String) -> Result<()> {
        if let Some(outgoing) = &self.outgoing {
            outgoing
                .send(mv)
                .map_err(|_| Error::Transport("game stream closed".into()))?;
        }
        Ok(())
    }

    async fn on_new_game(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Square;

    fn mv(uci: &str) -> GameMove {
        GameMove::from_uci(uci).unwrap()
    }

    #[tokio::test]
    async fn human_player_contract_is_inert() {
        let mut human = HumanPlayer::new("Alice");
        assert_eq!(human.name(), "Alice");
        human.start().await.unwrap();
        human
            .request_move("fen".into(), Vec::new())
            .await
            .unwrap();
        human.on_opponent_move(mv("e2e4"), "fen".into()).await.unwrap();
        human.stop().await;
    }

    #[tokio::test]
    async fn online_player_forwards_stream_moves_to_the_sink() {
        use crate::types::Color;
        let (sink_tx, mut sink_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let mut player = OnlinePlayer::new(
            "lichess",
            OnlineChannel {
                incoming: in_rx,
                outgoing: out_tx,
            },
            PlayerSink::new(Color::Black, sink_tx),
        );
        player.start().await.unwrap();

        in_tx.send(StreamEvent::OpponentMove(mv("e7e5"))).unwrap();
        assert_eq!(
            sink_rx.recv().await,
            Some((
                Color::Black,
                PlayerEvent::Propose {
                    mv: mv("e7e5"),
                    score_cp: None
                }
            ))
        );

        // our committed move goes out over the stream
        player
            .on_opponent_move(mv("g1f3"), "fen".into())
            .await
            .unwrap();
        assert_eq!(out_rx.recv().await, Some(mv("g1f3")));

        in_tx
            .send(StreamEvent::GameEnd(GameResult::Draw))
            .unwrap();
        assert_eq!(
            sink_rx.recv().await,
            Some((
                Color::Black,
                PlayerEvent::GameEnded {
                    result: GameResult::Draw
                }
            ))
        );
        player.stop().await;
    }

    #[tokio::test]
    async fn dropped_stream_reports_failure() {
        use crate::types::Color;
        let (sink_tx, mut sink_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<StreamEvent>();
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let mut player = OnlinePlayer::new(
            "lichess",
            OnlineChannel {
                incoming: in_rx,
                outgoing: out_tx,
            },
            PlayerSink::new(Color::Black, sink_tx),
        );
        player.start().await.unwrap();
        drop(in_tx);
        assert!(matches!(
            sink_rx.recv().await,
            Some((_, PlayerEvent::Failed { .. }))
        ));
    }

    #[test]
    fn player_event_carries_square_typed_moves() {
        let event = PlayerEvent::Propose {
            mv: GameMove::new(Square::new(12), Square::new(28)),
            score_cp: Some(34),
        };
        match event {
            PlayerEvent::Propose { mv, score_cp } => {
                assert_eq!(mv.to_uci(), "e2e4");
                assert_eq!(score_cp, Some(34));
            }
            _ => unreachable!(),
        }
    }
}
