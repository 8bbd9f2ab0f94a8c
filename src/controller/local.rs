//! Local play session: two players over one physical board.
//!
//! Routes committed moves to the opposing player and asks the side to move
//! for its move. Human players are inert (the board is their input);
//! engine and online players answer through the tagged sink.

use tracing::warn;

use crate::error::Result;
use crate::players::Player;
use crate::types::{Color, GameMove};

/// The two seats of a local game.
pub struct LocalSession {
    white: Box<dyn Player>,
    black: Box<dyn Player>,
}

impl std::fmt::Debug for LocalSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSession")
            .field("white", &self.white.name())
            .field("black", &self.black.name())
            .finish()
    }
}

impl LocalSession {
    /// Seat the two players.
    pub fn new(white: Box<dyn Player>, black: Box<dyn Player>) -> LocalSession {
        LocalSession { white, black }
    }

    /// Player display names `(white, black)`.
    pub fn names(&self) -> (String, String) {
        (self.white.name().to_string(), self.black.name().to_string())
    }

    /// Bring both players up. A failing player surfaces as an error so the
    /// app can offer a retry.
    pub async fn start(&mut self) -> Result<()> {
        self.white.start().await?;
        self.black.start().await?;
        Ok(())
    }

    /// Cooperative stop of both seats.
    pub async fn stop(&mut self) {
        self.white.stop().await;
        self.black.stop().await;
    }

    /// Reset both players for a fresh game, then solicit the first move.
    pub async fn new_game(&mut self, turn: Color, fen: String, moves: Vec<String>) -> Result<()> {
        self.white.on_new_game().await?;
        self.black.on_new_game().await?;
        self.request_move(turn, fen, moves).await
    }

    /// A move by `by` was committed: tell the opponent and ask it to move.
    pub async fn after_commit(
        &mut self,
        by: Color,
        mv: GameMove,
        fen: String,
        moves: Vec<String>,
    ) -> Result<()> {
        let opponent = self.seat_mut(by.other());
        if let Err(e) = opponent.on_opponent_move(mv, fen.clone()).await {
            warn!(error = %e, "opponent notification failed");
        }
        self.request_move(by.other(), fen, moves).await
    }

    /// Ask the seat holding `turn` for its move.
    pub async fn request_move(
        &mut self,
        turn: Color,
        fen: String,
        moves: Vec<String>,
    ) -> Result<()> {
        self.seat_mut(turn).request_move(fen, moves).await
    }

    fn seat_mut(&mut self, color: Color) -> &mut Box<dyn Player> {
        match color {
            Color::White => &mut self.white,
            Color::Black => &mut self.black,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::players::HumanPlayer;

    #[tokio::test]
    async fn two_humans_start_and_stop_cleanly() {
        let mut session = LocalSession::new(
            Box::new(HumanPlayer::new("Alice")),
            Box::new(HumanPlayer::new("Bob")),
        );
        assert_eq!(session.names(), ("Alice".to_string(), "Bob".to_string()));
        session.start().await.unwrap();
        session
            .after_commit(
                Color::White,
                GameMove::from_uci("e2e4").unwrap(),
                "fen".into(),
                vec!["e2e4".into()],
            )
            .await
            .unwrap();
        session.stop().await;
    }
}
