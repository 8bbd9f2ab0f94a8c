//! Remote play session: an app drives the board through an emulator.
//!
//! Holds the locked emulator for one transport connection, turns inbound
//! app bytes into replies and board actions, and mirrors game-store
//! changes back to the app as protocol notifications.

use tracing::{debug, info, warn};

use crate::emulators::{BoardAction, Emulator, EmulatorKind};
use crate::error::Result;
use crate::types::{GameMove, RemoteProtocol};

use super::relay::RelayProbe;
use super::ConnId;

/// One locked remote session.
pub struct RemoteSession {
    /// Stable id for correlating a session's log lines.
    session_id: uuid::Uuid,
    conn: ConnId,
    emulator: Box<dyn Emulator>,
    relay: Option<RelayProbe>,
}

impl std::fmt::Debug for RemoteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSession")
            .field("session_id", &self.session_id)
            .field("conn", &self.conn)
            .field("kind", &self.emulator.kind())
            .field("relay", &self.relay.is_some())
            .finish()
    }
}

impl RemoteSession {
    /// Lock `emulator` onto connection `conn`.
    pub fn new(conn: ConnId, emulator: Box<dyn Emulator>) -> RemoteSession {
        let session_id = uuid::Uuid::new_v4();
        info!(%session_id, conn, kind = ?emulator.kind(), "remote session locked");
        RemoteSession {
            session_id,
            conn,
            emulator,
            relay: None,
        }
    }

    /// Attach a relay probe (protocol debugging).
    pub fn with_relay(mut self, relay: RelayProbe) -> RemoteSession {
        self.relay = Some(relay);
        self
    }

    /// The locked connection.
    pub fn conn(&self) -> ConnId {
        self.conn
    }

    /// The locked protocol.
    pub fn kind(&self) -> EmulatorKind {
        self.emulator.kind()
    }

    /// The store-facing protocol tag.
    pub fn protocol(&self) -> RemoteProtocol {
        match self.emulator.kind() {
            EmulatorKind::Millennium => RemoteProtocol::Millennium,
            EmulatorKind::Pegasus => RemoteProtocol::Pegasus,
            EmulatorKind::Chessnut => RemoteProtocol::Chessnut,
        }
    }

    /// Feed inbound app bytes to the locked emulator. Returns reply bytes
    /// and board actions; a parse error is logged and produces nothing
    /// (the app's serial stream is idempotent for events).
    pub fn handle_data(&mut self, bytes: &[u8]) -> (Vec<u8>, Vec<BoardAction>) {
        if let Some(relay) = &self.relay {
            relay.forward(bytes);
        }
        match self.emulator.accept(bytes) {
            Ok(handled) => {
                if let Some(relay) = &self.relay {
                    relay.expect(&handled.reply);
                }
                (handled.reply, handled.actions)
            }
            Err(e) => {
                warn!(conn = self.conn, error = %e, "locked emulator rejected bytes");
                (Vec::new(), Vec::new())
            }
        }
    }

    /// A move was committed on the physical board: produce the protocol
    /// notification for the app.
    pub fn notify_move(&mut self, mv: GameMove) -> Vec<u8> {
        debug!(conn = self.conn, mv = %mv, "mirroring move to app");
        self.emulator.notify_move(mv)
    }

    /// Battery telemetry for the app.
    pub fn notify_battery(&mut self, percent: u8, charging: bool) -> Vec<u8> {
        self.emulator.notify_battery(percent, charging)
    }

    /// Tear down (drops the relay probe with it).
    pub fn close(self) -> Result<()> {
        if let Some(relay) = &self.relay {
            relay.stop();
        }
        info!(session_id = %self.session_id, conn = self.conn, "remote session closed");
        Ok(())
    }
}
