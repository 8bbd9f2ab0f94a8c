//! Controller arbitration: local play vs remote app control.
//!
//! One worker task owns the game engine and every store mutation driven by
//! physical events (the game lock of the concurrency model). The manager
//! switches between the local session (players drive the engine) and a
//! remote session (a chess app drives the board through the locked
//! emulator) on app connect, first valid frame, and disconnect.

pub mod local;
pub mod relay;
pub mod remote;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::assist::{Assistant, Suggestion};
use crate::board::FlashPattern;
use crate::clock::ClockService;
use crate::emulators::{self, BoardAction};
use crate::engine::{BoardIo, EngineEvent, GameEngine};
use crate::error::Result;
use crate::players::PlayerEvent;
use crate::store::Store;
use crate::types::{BoardEvent, Color, GameMove, Key, RemoteProtocol, Square};
use local::LocalSession;
use remote::RemoteSession;

/// Transport connection identifier.
pub type ConnId = u64;

/// Engine tick cadence (castle windows, promotion timeout, king-hold).
const TICK_INTERVAL: Duration = Duration::from_millis(250);

/// Outbound side of the transport, as the controller sees it.
pub trait RemoteSender: Send + Sync {
    /// Push bytes to the app on `conn`.
    fn send(&self, conn: ConnId, bytes: &[u8]);
    /// Drop the connection.
    fn close(&self, conn: ConnId);
}

/// Everything the worker loop reacts to.
pub enum ControlMsg {
    /// A physical board event.
    Board(BoardEvent),
    /// A player answered through its sink.
    Player(Color, PlayerEvent),
    /// The engine emitted an event.
    Engine(EngineEvent),
    /// The clock flagged `color`.
    Flag(Color),
    /// Inbound app bytes.
    RemoteData {
        /// Connection the bytes arrived on.
        conn: ConnId,
        /// The bytes.
        bytes: Vec<u8>,
    },
    /// An app connection dropped.
    RemoteDisconnected(ConnId),
    /// The user picked local play from the menu.
    SelectLocal,
    /// Replace the seated players (menu picked a different opponent).
    ReplaceSeats(LocalSession),
    /// Start a fresh local game with the seated players.
    NewLocalGame,
    /// An assistant finished computing a suggestion.
    Hint(Suggestion),
    /// Enable or disable the hand-brain assistant.
    SetHandBrain(Option<std::sync::Arc<dyn Assistant>>),
    /// The user confirmed resignation for `color`.
    Resign(Color),
    /// The user accepted a draw.
    AgreeDraw,
    /// Stop the worker.
    Shutdown,
}

/// Events the worker surfaces to the app layer (menus, dialogs).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    /// A key the game did not consume.
    Key(Key),
    /// Offer resign/draw for `color` (king-hold gesture).
    ResignMenu(Color),
    /// Mutual draw offer (kings in the center).
    DrawOffer,
    /// Promotion chooser for `color` is open.
    PromotionChooser(Color),
    /// The active controller changed.
    ControllerChanged(RemoteProtocol),
    /// A player reported an unrecoverable failure.
    PlayerFailed(String),
}

/// Cloneable feeder into the worker loop.
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    tx: mpsc::UnboundedSender<ControlMsg>,
}

impl ControllerHandle {
    /// Feed a physical event.
    pub fn board_event(&self, event: BoardEvent) {
        let _ = self.tx.send(ControlMsg::Board(event));
    }

    /// Feed inbound app bytes.
    pub fn remote_data(&self, conn: ConnId, bytes: Vec<u8>) {
        let _ = self.tx.send(ControlMsg::RemoteData { conn, bytes });
    }

    /// An app connection dropped.
    pub fn remote_disconnected(&self, conn: ConnId) {
        let _ = self.tx.send(ControlMsg::RemoteDisconnected(conn));
    }

    /// The clock flagged `color`.
    pub fn flag(&self, color: Color) {
        let _ = self.tx.send(ControlMsg::Flag(color));
    }

    /// User picked local play.
    pub fn select_local(&self) {
        let _ = self.tx.send(ControlMsg::SelectLocal);
    }

    /// Start a fresh local game.
    pub fn new_local_game(&self) {
        let _ = self.tx.send(ControlMsg::NewLocalGame);
    }

    /// Replace the seated players.
    pub fn replace_seats(&self, session: LocalSession) {
        let _ = self.tx.send(ControlMsg::ReplaceSeats(session));
    }

    /// Resign on behalf of `color`.
    pub fn resign(&self, color: Color) {
        let _ = self.tx.send(ControlMsg::Resign(color));
    }

    /// Accept a draw.
    pub fn agree_draw(&self) {
        let _ = self.tx.send(ControlMsg::AgreeDraw);
    }

    /// Enable or disable the hand-brain assistant.
    pub fn set_hand_brain(&self, assistant: Option<Arc<dyn Assistant>>) {
        let _ = self.tx.send(ControlMsg::SetHandBrain(assistant));
    }

    /// Stop the worker loop.
    pub fn shutdown(&self) {
        let _ = self.tx.send(ControlMsg::Shutdown);
    }

    /// Raw sender for wiring engine/player callbacks.
    pub fn sender(&self) -> mpsc::UnboundedSender<ControlMsg> {
        self.tx.clone()
    }
}

/// The worker owning engine, players and the remote lock.
pub struct ControllerManager {
    engine: GameEngine,
    store: Store,
    clock: Arc<ClockService>,
    board: Arc<dyn BoardIo>,
    local: LocalSession,
    remote: Option<RemoteSession>,
    sender: Arc<dyn RemoteSender>,
    hint: Option<Arc<dyn Assistant>>,
    hand_brain: Option<Arc<dyn Assistant>>,
    ui: mpsc::UnboundedSender<UiEvent>,
    rx: mpsc::UnboundedReceiver<ControlMsg>,
    handle: ControllerHandle,
    /// Squares currently lit on behalf of the remote app.
    app_leds: BTreeSet<Square>,
}

impl std::fmt::Debug for ControllerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerManager")
            .field("remote", &self.remote)
            .finish()
    }
}

impl ControllerManager {
    /// Assemble the worker. The engine must already be subscribed to
    /// `handle.sender()` by [`ControllerManager::wire_engine`].
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: GameEngine,
        store: Store,
        clock: Arc<ClockService>,
        board: Arc<dyn BoardIo>,
        local: LocalSession,
        sender: Arc<dyn RemoteSender>,
        hint: Option<Arc<dyn Assistant>>,
        ui: mpsc::UnboundedSender<UiEvent>,
        rx: mpsc::UnboundedReceiver<ControlMsg>,
        handle: ControllerHandle,
    ) -> ControllerManager {
        ControllerManager {
            engine,
            store,
            clock,
            board,
            local,
            remote: None,
            sender,
            hint,
            hand_brain: None,
            ui,
            rx,
            handle,
            app_leds: BTreeSet::new(),
        }
    }

    /// Create the control channel pair.
    pub fn channel() -> (ControllerHandle, mpsc::UnboundedReceiver<ControlMsg>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ControllerHandle { tx }, rx)
    }

    /// Swap in the real transport sender once the mux exists.
    pub fn set_remote_sender(&mut self, sender: Arc<dyn RemoteSender>) {
        self.sender = sender;
    }

    /// Subscribe `engine` so its events land in the worker loop.
    pub fn wire_engine(engine: &mut GameEngine, handle: &ControllerHandle) {
        let tx = handle.sender();
        engine.subscribe(move |event| {
            let _ = tx.send(ControlMsg::Engine(event.clone()));
        });
    }

    /// Run until [`ControlMsg::Shutdown`].
    pub async fn run(mut self) {
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                msg = self.rx.recv() => {
                    let Some(msg) = msg else { break };
                    if matches!(msg, ControlMsg::Shutdown) {
                        break;
                    }
                    if let Err(e) = self.handle_msg(msg).await {
                        warn!(error = %e, "control message failed");
                    }
                }
                _ = tick.tick() => {
                    if let Err(e) = self.engine.handle_tick(Instant::now()).await {
                        warn!(error = %e, "engine tick failed");
                    }
                }
            }
        }
        self.local.stop().await;
        if let Some(remote) = self.remote.take() {
            let _ = remote.close();
        }
        info!("controller worker stopped");
    }

    async fn handle_msg(&mut self, msg: ControlMsg) -> Result<()> {
        match msg {
            ControlMsg::Board(event) => self.on_board(event).await,
            ControlMsg::Player(color, event) => self.on_player(color, event).await,
            ControlMsg::Engine(event) => self.on_engine(event).await,
            ControlMsg::Flag(color) => self.engine.flag(color).await,
            ControlMsg::RemoteData { conn, bytes } => self.on_remote_data(conn, &bytes).await,
            ControlMsg::RemoteDisconnected(conn) => self.on_remote_gone(conn).await,
            ControlMsg::SelectLocal => {
                let conn = self.remote.as_ref().map(|s| s.conn());
                if let Some(conn) = conn {
                    self.sender.close(conn);
                    self.on_remote_gone(conn).await?;
                }
                Ok(())
            }
            ControlMsg::ReplaceSeats(session) => {
                self.local.stop().await;
                self.local = session;
                if let Err(e) = self.local.start().await {
                    warn!(error = %e, "new seats failed to start");
                    let _ = self.ui.send(UiEvent::PlayerFailed(e.to_string()));
                }
                Ok(())
            }
            ControlMsg::NewLocalGame => self.start_local_game().await,
            ControlMsg::Hint(suggestion) => self.on_hint(suggestion).await,
            ControlMsg::SetHandBrain(assistant) => {
                self.hand_brain = assistant;
                Ok(())
            }
            ControlMsg::Resign(color) => self.engine.resign(color).await,
            ControlMsg::AgreeDraw => self.engine.agree_draw().await,
            ControlMsg::Shutdown => Ok(()),
        }
    }

    async fn start_local_game(&mut self) -> Result<()> {
        let (white, black) = self.local.names();
        self.engine.set_mirror(false);
        self.engine.start_game(&white, &black, "local").await?;
        self.local
            .new_game(
                self.engine.turn(),
                self.engine.fen(),
                self.engine.move_ucis(),
            )
            .await
    }

    async fn on_board(&mut self, event: BoardEvent) -> Result<()> {
        if let BoardEvent::BatteryTick { percent, charging } = event {
            self.store.system.mutate(|s| {
                s.battery_percent = percent;
                s.charging = charging;
                if percent < 10 && !charging {
                    s.alert = Some(format!("battery low: {percent}%"));
                }
            });
            if let Some(session) = &mut self.remote {
                let bytes = session.notify_battery(percent, charging);
                if !bytes.is_empty() {
                    self.sender.send(session.conn(), &bytes);
                }
            }
            return Ok(());
        }
        if let BoardEvent::ChargerState(plugged) = event {
            self.store.system.mutate(|s| s.charging = plugged);
            return Ok(());
        }

        if let BoardEvent::KeyPress(key) = event {
            if self.engine.handle_key(key).await? {
                return Ok(());
            }
            if self.remote.is_none() {
                match key {
                    Key::Back => return self.engine.takeback().await,
                    Key::Tick => return self.spawn_hint(),
                    _ => {}
                }
            }
            let _ = self.ui.send(UiEvent::Key(key));
            return Ok(());
        }

        // lift/place: local play drives the engine; remote mirrors it
        self.engine.handle_event(event).await
    }

    fn spawn_hint(&mut self) -> Result<()> {
        let Some(hint) = self.hint.clone() else {
            return Ok(());
        };
        let fen = self.engine.fen();
        let color = self.engine.turn();
        let tx = self.handle.sender();
        tokio::spawn(async move {
            match hint.suggest(&fen, color).await {
                Ok(suggestion) => {
                    let _ = tx.send(ControlMsg::Hint(suggestion));
                }
                Err(e) => warn!(error = %e, "hint failed"),
            }
        });
        Ok(())
    }

    async fn on_hint(&mut self, suggestion: Suggestion) -> Result<()> {
        match suggestion {
            Suggestion::Squares { from, to } | Suggestion::Move(GameMove { from, to, .. }) => {
                self.board
                    .led_flash(from, to, FlashPattern::Guide)
                    .await
            }
            Suggestion::PieceType(kind) => {
                self.store
                    .system
                    .mutate(|s| s.alert = Some(format!("move a {kind:?}")));
                Ok(())
            }
            Suggestion::Eval(cp) => {
                self.store
                    .push_score(self.engine.move_ucis().len() as u32 + 1, cp);
                Ok(())
            }
            Suggestion::Text(text) => {
                self.store.system.mutate(|s| s.alert = Some(text));
                Ok(())
            }
        }
    }

    /// Hand-brain runs automatically once it is the human's turn.
    fn spawn_hand_brain(&mut self) {
        let Some(brain) = self.hand_brain.clone() else {
            return;
        };
        let fen = self.engine.fen();
        let color = self.engine.turn();
        let tx = self.handle.sender();
        tokio::spawn(async move {
            match brain.suggest(&fen, color).await {
                Ok(suggestion) => {
                    let _ = tx.send(ControlMsg::Hint(suggestion));
                }
                Err(e) => warn!(error = %e, "hand-brain failed"),
            }
        });
    }

    async fn on_player(&mut self, color: Color, event: PlayerEvent) -> Result<()> {
        match event {
            PlayerEvent::Propose { mv, score_cp } => {
                if self.engine.is_over() || color != self.engine.turn() {
                    debug!(?color, mv = %mv, "stale proposal dropped");
                    return Ok(());
                }
                if let Some(cp) = score_cp {
                    let white_cp = match color {
                        Color::White => cp,
                        Color::Black => -cp,
                    };
                    self.store
                        .push_score(self.engine.move_ucis().len() as u32 + 1, white_cp);
                }
                self.engine.set_pending_move(mv).await
            }
            PlayerEvent::GameEnded { result } => self.engine.finish_external(result).await,
            PlayerEvent::Failed { reason } => {
                warn!(?color, %reason, "player failed");
                self.store
                    .system
                    .mutate(|s| s.alert = Some(format!("player error: {reason}")));
                let _ = self.ui.send(UiEvent::PlayerFailed(reason));
                Ok(())
            }
        }
    }

    async fn on_engine(&mut self, event: EngineEvent) -> Result<()> {
        match event {
            EngineEvent::MoveCommitted { mv, by, .. } => {
                self.clock.switch_turn(by);
                if let Some(session) = &mut self.remote {
                    let bytes = session.notify_move(mv);
                    if !bytes.is_empty() {
                        self.sender.send(session.conn(), &bytes);
                    }
                    Ok(())
                } else {
                    self.local
                        .after_commit(by, mv, self.engine.fen(), self.engine.move_ucis())
                        .await?;
                    self.spawn_hand_brain();
                    Ok(())
                }
            }
            EngineEvent::GameOver { .. } => {
                self.clock.pause();
                Ok(())
            }
            EngineEvent::ResignMenu { color } => {
                let _ = self.ui.send(UiEvent::ResignMenu(color));
                Ok(())
            }
            EngineEvent::DrawOffer => {
                let _ = self.ui.send(UiEvent::DrawOffer);
                Ok(())
            }
            EngineEvent::PromotionChooser { color } => {
                let _ = self.ui.send(UiEvent::PromotionChooser(color));
                Ok(())
            }
            EngineEvent::CorrectionEntered
            | EngineEvent::CorrectionExited
            | EngineEvent::PromotionTimeout
            | EngineEvent::TakebackApplied => Ok(()),
        }
    }

    async fn on_remote_data(&mut self, conn: ConnId, bytes: &[u8]) -> Result<()> {
        if self.remote.is_none() {
            let Some((kind, emulator)) = emulators::detect(bytes, &self.store) else {
                debug!(conn, "no protocol accepted the first frame");
                return Ok(());
            };
            info!(conn, ?kind, "protocol locked on");
            self.switch_to_remote(RemoteSession::new(conn, emulator))
                .await?;
        }

        let Some(session) = &mut self.remote else {
            return Ok(());
        };
        if session.conn() != conn {
            // one app at a time; the lock belongs to the first connection
            warn!(conn, locked = session.conn(), "second app rejected");
            self.sender.close(conn);
            return Ok(());
        }
        let (reply, actions) = session.handle_data(bytes);
        if !reply.is_empty() {
            self.sender.send(conn, &reply);
        }
        for action in actions {
            self.apply_action(action).await?;
        }
        Ok(())
    }

    async fn switch_to_remote(&mut self, session: RemoteSession) -> Result<()> {
        self.clock.pause();
        self.board.discard_buffered();
        self.drain_stale_board_events();
        self.local.stop().await;
        let protocol = session.protocol();
        self.store.system.mutate(|s| {
            s.bt_connected = true;
            s.remote_protocol = protocol;
        });
        self.engine.set_mirror(true);
        self.remote = Some(session);
        let _ = self.ui.send(UiEvent::ControllerChanged(protocol));
        Ok(())
    }

    async fn on_remote_gone(&mut self, conn: ConnId) -> Result<()> {
        if self.remote.as_ref().map(RemoteSession::conn) != Some(conn) {
            return Ok(());
        }
        let Some(session) = self.remote.take() else {
            return Ok(());
        };
        let _ = session.close();
        self.app_leds.clear();
        self.board.leds_off().await?;
        self.drain_stale_board_events();
        self.store.system.mutate(|s| {
            s.bt_connected = false;
            s.remote_protocol = RemoteProtocol::None;
        });
        self.engine.set_mirror(false);
        if let Err(e) = self.local.start().await {
            warn!(error = %e, "local players failed to restart");
        }
        let _ = self.ui.send(UiEvent::ControllerChanged(RemoteProtocol::None));
        Ok(())
    }

    /// Drop queued physical events across a controller switch.
    fn drain_stale_board_events(&mut self) {
        let mut kept = Vec::new();
        while let Ok(msg) = self.rx.try_recv() {
            match msg {
                ControlMsg::Board(_) => {}
                other => kept.push(other),
            }
        }
        for msg in kept {
            let _ = self.handle.sender().send(msg);
        }
    }

    async fn apply_action(&mut self, action: BoardAction) -> Result<()> {
        match action {
            BoardAction::Led { square, on } => {
                if on {
                    self.app_leds.insert(square);
                } else {
                    self.app_leds.remove(&square);
                }
                let lit: Vec<Square> = self.app_leds.iter().copied().collect();
                if lit.is_empty() {
                    self.board.leds_off().await
                } else {
                    self.board.leds(&lit, 255).await
                }
            }
            BoardAction::LedsOff => {
                self.app_leds.clear();
                self.board.leds_off().await
            }
            BoardAction::ScanEnable(enabled) => {
                if enabled {
                    self.board.resume_events();
                } else {
                    self.board.pause_events();
                }
                Ok(())
            }
            BoardAction::Reset => {
                self.engine.start_mirror();
                Ok(())
            }
        }
    }
}
