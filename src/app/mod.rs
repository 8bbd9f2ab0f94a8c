//! Top-level orchestration: boot, screens, shutdown.
//!
//! Boot order: display + splash, link with retry, event subscriptions,
//! services, then either resume into a game or land in the menu. A signal
//! (or the inactivity watchdog) gates the clean shutdown: stop the clock,
//! flush the record, send sleep to the controller, close transports,
//! close the display.

pub mod menu;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::board::{Board, BoardService};
use crate::clock::ClockService;
use crate::config::{Config, Orientation};
use crate::controller::{
    local::LocalSession, ControllerHandle, ControllerManager, RemoteSender, UiEvent,
};
use crate::db::Db;
use crate::display::driver::{DisplayDriver, SimulatedDriver};
use crate::display::scheduler::SchedulerConfig;
use crate::display::widgets::{
    AlertWidget, AnalysisWidget, BoardWidget, ClockWidget, GameOverWidget, IconMenu, MenuModel,
    SplashWidget, StatusBar,
};
use crate::display::{DisplayService, Rect, SharedScreen, PANEL_HEIGHT, PANEL_WIDTH};
use crate::engine::{EngineConfig, GameEngine};
use crate::error::Result;
use crate::link::frame::{Frame, FrameType};
use crate::link::{Link, LinkEvent, EVENT_CHANNEL_CAPACITY};
use crate::players::registry::{EngineRegistry, InstallQueue};
use crate::players::{EnginePlayer, EnginePlayerConfig, HumanPlayer, PlayerSink};
use crate::store::Store;
use crate::transport::reconnect::ReconnectConfig;
use crate::transport::{LoopbackBackend, TransportBackend, TransportMux};
use crate::types::{AppState, Color, Key};
use menu::{main_menu_items, MenuAction, MenuController};

/// Crate version string shown on the splash and the about card.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Command-line switches that shape the boot.
#[derive(Debug, Clone, Default)]
pub struct BootOptions {
    /// `Some(true)` forces resume, `Some(false)` forbids it, `None` resumes
    /// when an unterminated game exists.
    pub resume: Option<bool>,
    /// Skip the Bluetooth transport entirely.
    pub no_bt: bool,
    /// Run against the simulated display (and a simulated controller when
    /// the serial port is absent).
    pub simulated_display: bool,
}

/// Modal question currently on screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialog {
    /// Tick = resign, Down = offer draw, Back = cancel.
    Resign(Color),
    /// Tick = accept the mutual draw, Back = decline.
    DrawOffer,
}

struct NullSender;

impl RemoteSender for NullSender {
    fn send(&self, _conn: crate::controller::ConnId, _bytes: &[u8]) {}
    fn close(&self, _conn: crate::controller::ConnId) {}
}

/// Run the whole application. `panel` injects a real e-paper driver;
/// `None` uses the simulated driver.
pub async fn run(
    config: Config,
    opts: BootOptions,
    panel: Option<Box<dyn DisplayDriver>>,
) -> Result<()> {
    // 1. display first, so the splash shows while the link retries
    let driver: Box<dyn DisplayDriver> = match panel {
        Some(driver) => driver,
        None => {
            if !opts.simulated_display {
                info!("no panel driver injected; using the simulated display");
            }
            Box::new(SimulatedDriver::new())
        }
    };
    let (screen, wake) = DisplayService::make_screen("splash");
    {
        let mut s = screen.lock();
        let dirty = s.dirty_handle();
        s.push(Box::new(SplashWidget::new(
            Rect::new(0, 0, PANEL_WIDTH, PANEL_HEIGHT),
            dirty,
            VERSION,
        )));
    }
    let display = DisplayService::start(driver, screen.clone(), wake, SchedulerConfig::default())
        .await?;

    // 2. stores and persistence; a broken database degrades to memory
    let store = Store::new();
    let db = match Db::open(&config.database_path()?) {
        Ok(db) => db,
        Err(e) => {
            warn!(error = %e, "database unavailable; games stay in memory");
            store
                .system
                .mutate(|s| s.banner = Some("storage unavailable".into()));
            Db::open_in_memory()?
        }
    };

    // 3. board link, with the simulated fallback for development
    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let link = match Link::open_serial(&config.serial_port()?, config.baud()?, event_tx.clone()) {
        Ok(link) => link,
        Err(e) if opts.simulated_display => {
            info!(error = %e, "serial unavailable; starting the simulated controller");
            simulated_link(event_tx)
        }
        Err(e) => return Err(e),
    };
    link.init().await?;

    let board_service = BoardService::start(
        link,
        event_rx,
        config.inactivity_timeout()?,
        config.inactivity_warning()?,
    );
    let board = board_service.board.clone();
    board.set_sound_mode(config.sound()?);
    if config.board_orientation()? == Orientation::BlackSouth {
        board.set_flipped(true);
    }

    // 4. services
    let clock = Arc::new(ClockService::start(store.clone()));
    let registry = EngineRegistry::new(config.engines_dir()?);
    let install_queue = InstallQueue::start(db.clone(), config.engines_dir()?);

    // 5. controller worker
    let (handle, control_rx) = ControllerManager::channel();
    let mut engine = GameEngine::new(
        Arc::new(board.clone()),
        store.clone(),
        db.clone(),
        EngineConfig::default(),
    );
    ControllerManager::wire_engine(&mut engine, &handle);
    {
        let handle = handle.clone();
        clock.on_flag(move |color| handle.flag(color));
    }

    let resumable = db.unterminated_game()?;
    let want_resume = opts.resume.unwrap_or(resumable.is_some());
    let mut state = AppState::Menu;
    if want_resume {
        if let Some(record) = &resumable {
            engine.resume(record).await?;
            state = AppState::Game;
        }
    }

    let (ui_tx, ui_rx) = mpsc::unbounded_channel();
    let hint: Option<Arc<dyn crate::assist::Assistant>> = default_engine(&config, &registry)
        .map(|name| {
            Arc::new(crate::assist::HintAssistant::new(registry.clone(), name))
                as Arc<dyn crate::assist::Assistant>
        });
    // the real sender is wired in once the mux exists
    let sender: Arc<dyn RemoteSender> = Arc::new(NullSender);
    let mut manager = ControllerManager::new(
        engine,
        store.clone(),
        clock.clone(),
        Arc::new(board.clone()),
        LocalSession::new(
            Box::new(HumanPlayer::new("White")),
            Box::new(HumanPlayer::new("Black")),
        ),
        sender,
        hint,
        ui_tx,
        control_rx,
        handle.clone(),
    );

    // 6. transport
    let mux = if opts.no_bt {
        None
    } else {
        let backend = make_backend().await;
        let mux = TransportMux::start(
            backend,
            handle.clone(),
            store.clone(),
            ReconnectConfig::default(),
        );
        manager.set_remote_sender(mux.sender());
        Some(mux)
    };
    let worker = tokio::spawn(manager.run());

    // 7. board event subscriptions feed the worker
    wire_board(&board, &handle);
    let shutdown = Arc::new(tokio::sync::Notify::new());
    {
        let store = store.clone();
        let display_handle = display.handle();
        let notify = shutdown.clone();
        board.set_inactivity_hooks(
            move |left| {
                store.system.mutate(|s| {
                    s.alert = Some(format!("sleeping in {}s", left.as_secs()))
                });
                display_handle.wake();
            },
            move || notify.notify_one(),
        );
    }

    // 8. store changes repaint the current screen (the framebuffer diff
    // keeps the actual panel traffic minimal)
    wire_display_wake(&store, &screen, &display);

    // a dead link degrades to display-only instead of killing the app;
    // the pump keeps its side and this banner tells the user
    let link_monitor = {
        let board = board.clone();
        let store = store.clone();
        tokio::spawn(async move {
            let mut was_open = true;
            loop {
                tokio::time::sleep(Duration::from_secs(5)).await;
                let open = board.is_link_open();
                if was_open && !open {
                    warn!("board link lost; display-only mode");
                    store.system.mutate(|s| {
                        s.banner = Some("board link lost: display-only mode".into())
                    });
                }
                was_open = open;
            }
        })
    };

    // 9. screens + UI loop until a signal or the watchdog fires
    let mut app = AppUi {
        config,
        store: store.clone(),
        screen,
        display_handle: display.handle(),
        handle: handle.clone(),
        registry,
        mux,
        state,
        dialog: None,
        menu: None,
        resumable: resumable.is_some(),
    };
    app.enter_state(state);

    let mut ui_rx = ui_rx;
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .map_err(crate::error::Error::Io)?;
    loop {
        tokio::select! {
            event = ui_rx.recv() => {
                let Some(event) = event else { break };
                app.on_ui_event(event).await;
                if app.state == AppState::Shutdown {
                    break;
                }
            }
            _ = shutdown.notified() => {
                info!("inactivity watchdog requested shutdown");
                break;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM");
                break;
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "signal handler failed");
                }
                info!("interrupt");
                break;
            }
        }
    }

    // 10. clean shutdown: clock, record, sleep, transports, display
    link_monitor.abort();
    clock.pause();
    clock.shutdown();
    handle.shutdown();
    let _ = worker.await;
    install_queue.shutdown();
    if let Some(mux) = &app.mux {
        mux.shutdown().await;
    }
    if let Err(e) = board.request_sleep().await {
        warn!(error = %e, "sleep command failed");
    }
    board.close_link().await;
    board_service.stop();
    display.shutdown().await;
    info!("clean shutdown complete");
    Ok(())
}

async fn make_backend() -> Arc<dyn TransportBackend> {
    #[cfg(feature = "bluetooth")]
    {
        match crate::transport::ble::BleBackend::new().await {
            Ok(backend) => return Arc::new(backend),
            Err(e) => {
                warn!(error = %e, "bluetooth unavailable; falling back to loopback");
            }
        }
    }
    Arc::new(LoopbackBackend::new())
}

/// First executable in the engines directory, the default UCI opponent.
fn default_engine(config: &Config, _registry: &EngineRegistry) -> Option<String> {
    let dir = config.engines_dir().ok()?;
    let entries = std::fs::read_dir(dir).ok()?;
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_file())
        .filter_map(|e| e.file_name().into_string().ok())
        .collect();
    names.sort();
    names.into_iter().next()
}

fn wire_board(board: &Board, handle: &ControllerHandle) {
    use crate::types::BoardEvent;
    {
        let handle = handle.clone();
        board.subscribe_lift(move |sq| handle.board_event(BoardEvent::LiftPiece(sq)));
    }
    {
        let handle = handle.clone();
        board.subscribe_place(move |sq| handle.board_event(BoardEvent::PlacePiece(sq)));
    }
    {
        let handle = handle.clone();
        board.subscribe_keys(move |key| handle.board_event(BoardEvent::KeyPress(key)));
    }
    {
        let handle = handle.clone();
        board.subscribe_battery(move |percent, charging| {
            handle.board_event(BoardEvent::BatteryTick { percent, charging })
        });
    }
    {
        let handle = handle.clone();
        board.subscribe_charger(move |plugged| {
            handle.board_event(BoardEvent::ChargerState(plugged))
        });
    }
}

fn wire_display_wake(store: &Store, screen: &SharedScreen, display: &DisplayService) {
    let repaint = {
        let screen = screen.clone();
        let wake = display.handle();
        move || {
            screen.lock().mark_all_dirty();
            wake.wake();
        }
    };
    store.game.subscribe({
        let repaint = repaint.clone();
        move |_| repaint()
    });
    store.clock.subscribe({
        let repaint = repaint.clone();
        move |_| repaint()
    });
    store.analysis.subscribe({
        let repaint = repaint.clone();
        move |_| repaint()
    });
    store.system.subscribe(move |_| repaint());
}

/// A fake micro-controller over an in-memory duplex: acks the handshake,
/// reports the pieces set up for a new game, answers polls with idle
/// frames. Lets the full stack run on a workstation.
fn simulated_link(events: mpsc::Sender<LinkEvent>) -> Link {
    let (ours, mut theirs) = tokio::io::duplex(4096);
    tokio::spawn(async move {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut buf = bytes::BytesMut::new();
        loop {
            match theirs.read_buf(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
            while let Ok(Some((frame, used))) = Frame::parse(&buf) {
                let _ = buf.split_to(used);
                let reply = match frame.frame_type {
                    FrameType::Init => Some(Frame::new(FrameType::Ack, Vec::new())),
                    FrameType::StateRequest => {
                        // sensor rows are files; ranks 1/2/7/8 land on the
                        // low and high bits of every row
                        Some(Frame::new(FrameType::State, vec![0xC3; 8]))
                    }
                    FrameType::Poll => Some(Frame::new(FrameType::Idle, Vec::new())),
                    _ => Some(Frame::new(FrameType::Ack, Vec::new())),
                };
                if let Some(reply) = reply {
                    if theirs.write_all(&reply.encode()).await.is_err() {
                        return;
                    }
                }
            }
        }
    });
    Link::open(ours, events)
}

/// Screen construction and key routing after boot.
struct AppUi {
    config: Config,
    store: Store,
    screen: SharedScreen,
    display_handle: crate::display::DisplayHandle,
    handle: ControllerHandle,
    registry: EngineRegistry,
    mux: Option<TransportMux>,
    state: AppState,
    dialog: Option<Dialog>,
    menu: Option<MenuController>,
    resumable: bool,
}

impl AppUi {
    fn enter_state(&mut self, state: AppState) {
        self.state = state;
        self.dialog = None;
        match state {
            AppState::Menu => self.show_menu(),
            AppState::Game => self.show_game(),
            AppState::Settings => self.show_settings(),
            AppState::Idle | AppState::Shutdown => {}
        }
        self.display_handle.request_full();
    }

    fn show_menu(&mut self) {
        let mut screen = self.screen.lock();
        screen.reset("menu");
        let status_dirty = screen.dirty_handle();
        screen.push(Box::new(StatusBar::new(
            Rect::new(0, 0, PANEL_WIDTH, 16),
            status_dirty,
            self.store.clone(),
        )));
        let model = Arc::new(Mutex::new(MenuModel::default()));
        let menu_dirty = screen.dirty_handle();
        screen.push(Box::new(IconMenu::new(
            Rect::new(0, 16, PANEL_WIDTH, PANEL_HEIGHT - 56),
            menu_dirty.clone(),
            model.clone(),
        )));
        let alert_dirty = screen.dirty_handle();
        screen.push(Box::new(AlertWidget::new(
            Rect::new(0, PANEL_HEIGHT - 40, PANEL_WIDTH, 40),
            alert_dirty,
            self.store.clone(),
        )));
        drop(screen);

        let controller = MenuController::new(model, menu_dirty);
        controller.set_items(main_menu_items(
            &self.config.menu_visibility(),
            self.resumable,
        ));
        self.menu = Some(controller);
    }

    fn show_game(&mut self) {
        let mut screen = self.screen.lock();
        screen.reset("game");
        let d = screen.dirty_handle();
        screen.push(Box::new(StatusBar::new(
            Rect::new(0, 0, PANEL_WIDTH, 16),
            d,
            self.store.clone(),
        )));
        let d = screen.dirty_handle();
        let mut board = BoardWidget::new(
            Rect::new(0, 16, PANEL_WIDTH, 128),
            d,
            self.store.clone(),
        );
        if let Ok(Orientation::BlackSouth) = self.config.board_orientation() {
            board.set_flipped(true);
        }
        if let Ok(dir) = self.config.resources_dir() {
            if let Ok(sprites) =
                crate::display::widgets::PieceSprites::load(&dir.join("pieces.bin"))
            {
                board = board.with_sprites(Arc::new(sprites));
            }
        }
        screen.push(Box::new(board));
        let d = screen.dirty_handle();
        screen.push(Box::new(ClockWidget::new(
            Rect::new(0, 144, PANEL_WIDTH, 24),
            d,
            self.store.clone(),
        )));
        let d = screen.dirty_handle();
        screen.push(Box::new(AnalysisWidget::new(
            Rect::new(0, 168, PANEL_WIDTH, 40),
            d,
            self.store.clone(),
        )));
        let d = screen.dirty_handle();
        screen.push(Box::new(GameOverWidget::new(
            Rect::new(0, 208, PANEL_WIDTH, 48),
            d,
            self.store.clone(),
        )));
        let d = screen.dirty_handle();
        screen.push(Box::new(AlertWidget::new(
            Rect::new(0, PANEL_HEIGHT - 40, PANEL_WIDTH, 40),
            d,
            self.store.clone(),
        )));
        drop(screen);
        self.menu = None;
    }

    fn show_settings(&mut self) {
        let mut screen = self.screen.lock();
        screen.reset("settings");
        let model = Arc::new(Mutex::new(MenuModel::default()));
        let dirty = screen.dirty_handle();
        screen.push(Box::new(IconMenu::new(
            Rect::new(0, 16, PANEL_WIDTH, PANEL_HEIGHT - 16),
            dirty.clone(),
            model.clone(),
        )));
        drop(screen);

        let controller = MenuController::new(model, dirty);
        controller.set_items(settings_items(&self.config));
        self.menu = Some(controller);
    }

    async fn on_ui_event(&mut self, event: UiEvent) {
        match event {
            UiEvent::Key(key) => self.on_key(key).await,
            UiEvent::ResignMenu(color) => {
                self.dialog = Some(Dialog::Resign(color));
                self.store.system.mutate(|s| {
                    s.alert = Some("resign? tick=yes down=offer draw back=no".into())
                });
            }
            UiEvent::DrawOffer => {
                self.dialog = Some(Dialog::DrawOffer);
                self.store
                    .system
                    .mutate(|s| s.alert = Some("draw offered: tick=accept back=decline".into()));
            }
            UiEvent::PromotionChooser(_) => {
                self.store.system.mutate(|s| {
                    s.alert = Some("promote: up=Q tick=R down=B back=N".into())
                });
            }
            UiEvent::ControllerChanged(protocol) => {
                if protocol == crate::types::RemoteProtocol::None {
                    self.enter_state(AppState::Menu);
                } else {
                    // mirror the app-driven game on screen
                    self.enter_state(AppState::Game);
                }
            }
            UiEvent::PlayerFailed(reason) => {
                self.store
                    .system
                    .mutate(|s| s.alert = Some(format!("{reason} (tick to retry)")));
            }
        }
    }

    async fn on_key(&mut self, key: Key) {
        // modal dialogs swallow keys first
        if let Some(dialog) = self.dialog {
            match (dialog, key) {
                (Dialog::Resign(color), Key::Tick) => self.handle.resign(color),
                (Dialog::Resign(_), Key::Down) | (Dialog::DrawOffer, Key::Tick) => {
                    self.handle.agree_draw()
                }
                _ => {}
            }
            self.dialog = None;
            self.store.system.mutate(|s| s.alert = None);
            return;
        }

        match self.state {
            AppState::Menu => {
                let action = self.menu.as_ref().and_then(|m| m.handle_key(key));
                if let Some(action) = action {
                    self.on_menu_action(action).await;
                }
            }
            AppState::Settings => match key {
                Key::Back => self.enter_state(AppState::Menu),
                Key::Tick => self.apply_setting(),
                other => {
                    if let Some(menu) = &self.menu {
                        let _ = menu.handle_key(other);
                    }
                }
            },
            AppState::Game => match key {
                Key::Help => {
                    self.enter_state(AppState::Menu);
                }
                // any key clears a dismissable alert
                _ => {
                    self.store.system.mutate(|s| s.alert = None);
                }
            },
            AppState::Idle | AppState::Shutdown => {}
        }
    }

    async fn on_menu_action(&mut self, action: MenuAction) {
        match action {
            MenuAction::PlayHuman => {
                self.handle.set_hand_brain(None);
                self.handle.replace_seats(LocalSession::new(
                    Box::new(HumanPlayer::new("White")),
                    Box::new(HumanPlayer::new("Black")),
                ));
                self.handle.new_local_game();
                self.resumable = false;
                self.enter_state(AppState::Game);
            }
            MenuAction::PlayHandBrain => {
                let Some(name) = default_engine(&self.config, &self.registry) else {
                    self.store
                        .system
                        .mutate(|s| s.alert = Some("no engine installed".into()));
                    return;
                };
                self.handle.set_hand_brain(Some(Arc::new(
                    crate::assist::HandBrain::new(self.registry.clone(), name),
                )));
                self.handle.replace_seats(LocalSession::new(
                    Box::new(HumanPlayer::new("White")),
                    Box::new(HumanPlayer::new("Black")),
                ));
                self.handle.new_local_game();
                self.resumable = false;
                self.enter_state(AppState::Game);
            }
            MenuAction::PlayEngine => {
                self.handle.set_hand_brain(None);
                let Some(name) = default_engine(&self.config, &self.registry) else {
                    self.store
                        .system
                        .mutate(|s| s.alert = Some("no engine installed".into()));
                    return;
                };
                let (tx, rx) = mpsc::unbounded_channel();
                {
                    // player events flow into the controller
                    let handle = self.handle.clone();
                    let mut rx = rx;
                    tokio::spawn(async move {
                        while let Some((color, event)) = rx.recv().await {
                            let _ = handle
                                .sender()
                                .send(crate::controller::ControlMsg::Player(color, event));
                        }
                    });
                }
                let engine_seat = EnginePlayer::new(
                    EnginePlayerConfig {
                        name: name.clone(),
                        elo: None,
                        movetime: Duration::from_secs(2),
                    },
                    self.registry.clone(),
                    PlayerSink::new(Color::Black, tx),
                );
                self.handle.replace_seats(LocalSession::new(
                    Box::new(HumanPlayer::new("Human")),
                    Box::new(engine_seat),
                ));
                self.handle.new_local_game();
                self.resumable = false;
                self.enter_state(AppState::Game);
            }
            MenuAction::Emulators => {
                if let Some(mux) = &self.mux {
                    let window = self
                        .config
                        .discoverability_window()
                        .unwrap_or(crate::transport::DISCOVERABILITY_WINDOW);
                    mux.make_discoverable(window);
                    self.store.system.mutate(|s| {
                        s.alert = Some("discoverable: connect your chess app".into())
                    });
                } else {
                    self.store
                        .system
                        .mutate(|s| s.alert = Some("bluetooth disabled".into()));
                }
            }
            MenuAction::Settings => self.enter_state(AppState::Settings),
            MenuAction::About => {
                self.store
                    .system
                    .mutate(|s| s.alert = Some(format!("tactboard {VERSION}")));
            }
            MenuAction::Resume => {
                // the engine already resumed during boot; just show it
                self.enter_state(AppState::Game);
            }
            MenuAction::Back => {
                self.store.system.mutate(|s| s.alert = None);
            }
            MenuAction::Shutdown => {
                self.state = AppState::Shutdown;
            }
        }
    }

    fn apply_setting(&mut self) {
        let Some(selected) = self.menu.as_ref().and_then(MenuController::selected_id) else {
            return;
        };
        match selected {
            "sound" => {
                // off → on → moves-only → off
                let next = match self.config.sound().unwrap_or_default() {
                    crate::board::SoundMode::Off => "on",
                    crate::board::SoundMode::On => "moves-only",
                    crate::board::SoundMode::MovesOnly => "off",
                };
                self.config
                    .set("system", "sound", toml::Value::String(next.into()));
                self.save_config();
                self.store
                    .system
                    .mutate(|s| s.alert = Some(format!("sound: {next}")));
            }
            "orientation" => {
                let next = match self.config.board_orientation().unwrap_or(Orientation::Auto) {
                    Orientation::Auto => "white-south",
                    Orientation::WhiteSouth => "black-south",
                    Orientation::BlackSouth => "auto",
                };
                self.config
                    .set("system", "board_orientation", toml::Value::String(next.into()));
                self.save_config();
                self.store
                    .system
                    .mutate(|s| s.alert = Some(format!("orientation: {next}")));
            }
            "discoverability" => {
                if let Some(mux) = &self.mux {
                    let window = self
                        .config
                        .discoverability_window()
                        .unwrap_or(crate::transport::DISCOVERABILITY_WINDOW);
                    mux.make_discoverable(window);
                }
            }
            _ => {}
        }
        if let Some(menu) = &self.menu {
            menu.set_items(settings_items(&self.config));
        }
    }

    fn save_config(&self) {
        if let Err(e) = self.config.save() {
            warn!(error = %e, "config save failed");
        }
    }
}

fn settings_items(config: &Config) -> Vec<crate::display::widgets::MenuItem> {
    use crate::display::widgets::MenuItem;
    let sound = config
        .sound()
        .map(|m| format!("{m:?}"))
        .unwrap_or_default();
    vec![
        MenuItem {
            id: "sound",
            label: format!("Sound: {sound}"),
        },
        MenuItem {
            id: "orientation",
            label: "Orientation".into(),
        },
        MenuItem {
            id: "discoverability",
            label: "Pairing window".into(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_options_default_to_auto_resume() {
        let opts = BootOptions::default();
        assert_eq!(opts.resume, None);
        assert!(!opts.no_bt);
    }

    #[test]
    fn menu_items_respect_config_visibility() {
        let config = Config::builtin();
        let items = main_menu_items(&config.menu_visibility(), false);
        let ids: Vec<&str> = items.iter().map(|i| i.id).collect();
        assert!(ids.contains(&"play"));
        assert!(ids.contains(&"emulators"));
        assert!(ids.contains(&"shutdown"));
        assert!(!ids.contains(&"resume"));
    }

    #[tokio::test]
    async fn simulated_link_completes_the_handshake() {
        let (tx, _rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let link = simulated_link(tx);
        link.init().await.unwrap();
        link.close().await;
    }
}
