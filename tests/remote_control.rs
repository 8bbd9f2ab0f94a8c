//! End-to-end remote control: a chess app connects over the loopback
//! transport, locks a protocol, drives the board, disconnects.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use tactboard::board::FlashPattern;
use tactboard::clock::ClockService;
use tactboard::controller::{local::LocalSession, ControllerManager};
use tactboard::db::Db;
use tactboard::emulators::millennium;
use tactboard::engine::{BoardIo, EngineConfig, GameEngine};
use tactboard::error::Result;
use tactboard::players::HumanPlayer;
use tactboard::store::Store;
use tactboard::transport::reconnect::ReconnectConfig;
use tactboard::transport::{Endpoint, LoopbackBackend, TransportMux};
use tactboard::types::{Presence, RemoteProtocol, Square, Tone};

/// Board double recording LED traffic.
#[derive(Default)]
struct GhostBoard {
    leds: Mutex<Vec<Vec<Square>>>,
}

#[async_trait]
impl BoardIo for GhostBoard {
    async fn leds(&self, squares: &[Square], _intensity: u8) -> Result<()> {
        self.leds.lock().push(squares.to_vec());
        Ok(())
    }
    async fn led_flash(&self, _f: Square, _t: Square, _p: FlashPattern) -> Result<()> {
        Ok(())
    }
    async fn led_flash_one(&self, _s: Square, _p: FlashPattern) -> Result<()> {
        Ok(())
    }
    async fn leds_off(&self) -> Result<()> {
        Ok(())
    }
    async fn beep(&self, _tone: Tone) -> Result<()> {
        Ok(())
    }
    async fn read_board_state(&self) -> Result<Presence> {
        Ok(Presence::INITIAL)
    }
    fn pause_events(&self) {}
    fn resume_events(&self) {}
    fn discard_buffered(&self) {}
}

struct World {
    backend: Arc<LoopbackBackend>,
    store: Store,
    worker: tokio::task::JoinHandle<()>,
    handle: tactboard::controller::ControllerHandle,
}

async fn world() -> World {
    let store = Store::new();
    let db = Db::open_in_memory().unwrap();
    let board = Arc::new(GhostBoard::default());
    let clock = Arc::new(ClockService::start(store.clone()));
    let (handle, rx) = ControllerManager::channel();
    let mut engine = GameEngine::new(
        board.clone(),
        store.clone(),
        db,
        EngineConfig::default(),
    );
    ControllerManager::wire_engine(&mut engine, &handle);

    let backend = Arc::new(LoopbackBackend::new());
    let mux = TransportMux::start(
        backend.clone(),
        handle.clone(),
        store.clone(),
        ReconnectConfig::default(),
    );
    let (ui_tx, _ui_rx) = mpsc::unbounded_channel();
    let manager = ControllerManager::new(
        engine,
        store.clone(),
        clock,
        board,
        LocalSession::new(
            Box::new(HumanPlayer::new("White")),
            Box::new(HumanPlayer::new("Black")),
        ),
        mux.sender(),
        None,
        ui_tx,
        rx,
        handle.clone(),
    );
    let worker = tokio::spawn(manager.run());
    tokio::time::sleep(Duration::from_millis(30)).await;
    World {
        backend,
        store,
        worker,
        handle,
    }
}

#[tokio::test]
async fn app_locks_on_and_receives_replies() {
    let world = world().await;
    let conn = world.backend.connect(Endpoint::MillenniumGatt);
    world.backend.inject(conn, &millennium::encode_command("V"));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(
        world.store.system.with(|s| s.remote_protocol),
        RemoteProtocol::Millennium
    );
    let sent = world.backend.sent();
    assert!(!sent.is_empty(), "v reply expected");
    assert_eq!(sent[0].0, conn);
    // lowercase 'v' with odd parity
    assert_eq!(sent[0].1[0] & 0x7F, b'v');

    world.handle.shutdown();
    let _ = world.worker.await;
}

#[tokio::test]
async fn disconnect_clears_the_lock() {
    let world = world().await;
    let conn = world.backend.connect(Endpoint::MillenniumGatt);
    world.backend.inject(conn, &millennium::encode_command("V"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    world.backend.drop_conn(conn);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(
        world.store.system.with(|s| s.remote_protocol),
        RemoteProtocol::None
    );
    assert!(!world.store.system.with(|s| s.bt_connected));

    world.handle.shutdown();
    let _ = world.worker.await;
}

#[tokio::test]
async fn board_state_query_reflects_the_mirrored_game() {
    let world = world().await;
    let conn = world.backend.connect(Endpoint::MillenniumGatt);
    world.backend.inject(conn, &millennium::encode_command("V"));
    tokio::time::sleep(Duration::from_millis(50)).await;

    // app resets the session, then asks for the board
    world.backend.inject(conn, &millennium::encode_command("R"));
    world.backend.inject(conn, &millennium::encode_command("S"));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let sent = world.backend.sent();
    let state_reply = sent
        .iter()
        .map(|(_, bytes)| bytes)
        .find(|bytes| bytes.first().map(|b| b & 0x7F) == Some(b's'))
        .expect("board state reply");
    let chars = millennium::decode_board_state(state_reply).unwrap();
    assert!(chars.starts_with("rnbqkbnr"), "mirror shows the start position");

    world.handle.shutdown();
    let _ = world.worker.await;
}
