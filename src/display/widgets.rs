//! The widget catalogue.
//!
//! Store-driven widgets (status bar, board, clock, analysis, alert,
//! game-over) read the observable stores at render time; the app only
//! wires store subscriptions to their dirty handles. Menu and keyboard
//! carry their own models, shared with the app through `Arc<Mutex<_>>`.

use std::sync::Arc;

use embedded_graphics::image::{Image, ImageRaw};
use embedded_graphics::mono_font::ascii::{FONT_10X20, FONT_6X10, FONT_9X15};
use embedded_graphics::mono_font::MonoTextStyle;
use embedded_graphics::pixelcolor::BinaryColor;
use embedded_graphics::prelude::{Point, Size};
use embedded_graphics::primitives::{Line, Primitive, PrimitiveStyle, Rectangle};
use embedded_graphics::text::Text;
use embedded_graphics::Drawable;
use parking_lot::Mutex;

use crate::store::Store;
use crate::types::{Color, GameResult, Square, TerminationReason};

use super::framebuffer::Canvas;
use super::widget::{Dirty, Widget};
use super::Rect;

fn text_style() -> MonoTextStyle<'static, BinaryColor> {
    MonoTextStyle::new(&FONT_6X10, BinaryColor::On)
}

fn big_style() -> MonoTextStyle<'static, BinaryColor> {
    MonoTextStyle::new(&FONT_10X20, BinaryColor::On)
}

/// Status bar: battery, charger, Bluetooth and lock state.
pub struct StatusBar {
    bounds: Rect,
    dirty: Dirty,
    store: Store,
}

impl StatusBar {
    /// Standard strip at the top of the panel.
    pub fn new(bounds: Rect, dirty: Dirty, store: Store) -> StatusBar {
        StatusBar {
            bounds,
            dirty,
            store,
        }
    }
}

impl Widget for StatusBar {
    fn bounds(&self) -> Rect {
        self.bounds
    }
    fn dirty(&self) -> &Dirty {
        &self.dirty
    }
    fn render(&mut self, canvas: &mut Canvas<'_>) {
        canvas.clear_background();
        let (percent, charging, bt, protocol, discoverable) = self.store.system.with(|s| {
            (
                s.battery_percent,
                s.charging,
                s.bt_connected,
                s.remote_protocol,
                s.discoverable,
            )
        });

        // battery: outline, fill by percent, nub
        let _ = Rectangle::new(Point::new(2, 3), Size::new(20, 9))
            .into_styled(PrimitiveStyle::with_stroke(BinaryColor::On, 1))
            .draw(canvas);
        let fill = (18 * u32::from(percent.min(100))) / 100;
        if fill > 0 {
            let _ = Rectangle::new(Point::new(3, 4), Size::new(fill, 7))
                .into_styled(PrimitiveStyle::with_fill(BinaryColor::On))
                .draw(canvas);
        }
        let _ = Rectangle::new(Point::new(22, 5), Size::new(2, 5))
            .into_styled(PrimitiveStyle::with_fill(BinaryColor::On))
            .draw(canvas);

        let mut flags = String::new();
        if charging {
            flags.push('+');
        }
        if bt {
            flags.push('B');
        }
        if discoverable {
            flags.push('?');
        }
        let label = match protocol {
            crate::types::RemoteProtocol::None => String::new(),
            other => format!("{other:?}"),
        };
        let _ = Text::new(&flags, Point::new(28, 11), text_style()).draw(canvas);
        let _ = Text::new(&label, Point::new(52, 11), text_style()).draw(canvas);
    }
}

/// Pre-rendered 16×16 piece sprites, 1bpp, order `PNBRQKpnbrqk`.
pub struct PieceSprites {
    data: Vec<u8>,
}

impl PieceSprites {
    /// Bytes per sprite: 16 rows of 2 bytes.
    pub const SPRITE_BYTES: usize = 32;

    /// Load from the resources directory.
    pub fn load(path: &std::path::Path) -> crate::error::Result<PieceSprites> {
        let data = std::fs::read(path)?;
        if data.len() != Self::SPRITE_BYTES * 12 {
            return Err(crate::error::Error::Config(format!(
                "piece sprite file {} has {} bytes, expected {}",
                path.display(),
                data.len(),
                Self::SPRITE_BYTES * 12
            )));
        }
        Ok(PieceSprites { data })
    }

    fn sprite(&self, piece: char) -> Option<&[u8]> {
        const ORDER: &str = "PNBRQKpnbrqk";
        let index = ORDER.find(piece)?;
        let start = index * Self::SPRITE_BYTES;
        Some(&self.data[start..start + Self::SPRITE_BYTES])
    }
}

/// The chess board: 16px squares, optional flip, highlight layer for the
/// last move and correction guidance.
pub struct BoardWidget {
    bounds: Rect,
    dirty: Dirty,
    store: Store,
    sprites: Option<Arc<PieceSprites>>,
    flipped: bool,
}

impl BoardWidget {
    /// A 128×128 board area.
    pub fn new(bounds: Rect, dirty: Dirty, store: Store) -> BoardWidget {
        BoardWidget {
            bounds,
            dirty,
            store,
            sprites: None,
            flipped: false,
        }
    }

    /// Use pre-rendered sprites instead of font glyphs.
    pub fn with_sprites(mut self, sprites: Arc<PieceSprites>) -> BoardWidget {
        self.sprites = Some(sprites);
        self
    }

    /// Render from black's side.
    pub fn set_flipped(&mut self, flipped: bool) {
        if self.flipped != flipped {
            self.flipped = flipped;
            self.dirty.mark();
        }
    }

    /// Panel-local top-left corner of a square.
    fn square_origin(&self, square: Square) -> Point {
        let (file, rank) = if self.flipped {
            (7 - square.file(), square.rank())
        } else {
            (square.file(), 7 - square.rank())
        };
        Point::new(i32::from(file) * 16, i32::from(rank) * 16)
    }
}

impl Widget for BoardWidget {
    fn bounds(&self) -> Rect {
        self.bounds
    }
    fn dirty(&self) -> &Dirty {
        &self.dirty
    }
    fn render(&mut self, canvas: &mut Canvas<'_>) {
        canvas.clear_background();
        let (fen, last_move, in_correction) = self
            .store
            .game
            .with(|g| (g.fen.clone(), g.last_move, g.in_correction));
        let chars = crate::emulators::fen_board_chars(&fen);

        for square in Square::all() {
            let origin = self.square_origin(square);
            let dark = (square.file() + square.rank()) % 2 == 0;
            if dark {
                // sparse dither keeps dark squares distinguishable in 1-bit
                for dy in (0..16).step_by(4) {
                    for dx in (0..16).step_by(4) {
                        canvas.set_local(origin.x + dx, origin.y + dy, true);
                    }
                }
            }
            let piece = chars[square.index() as usize];
            if piece != '.' {
                match self.sprites.as_ref().and_then(|s| s.sprite(piece)) {
                    Some(bytes) => {
                        let raw: ImageRaw<'_, BinaryColor> = ImageRaw::new(bytes, 16);
                        let _ = Image::new(&raw, origin).draw(canvas);
                    }
                    None => {
                        let mut buf = [0u8; 4];
                        let glyph: &str = piece.encode_utf8(&mut buf);
                        let _ = Text::new(
                            glyph,
                            Point::new(origin.x + 4, origin.y + 12),
                            MonoTextStyle::new(&FONT_9X15, BinaryColor::On),
                        )
                        .draw(canvas);
                    }
                }
            }
        }

        // highlight layer: last move outline, correction marker
        if let Some(mv) = last_move {
            for square in [mv.from, mv.to] {
                let origin = self.square_origin(square);
                let _ = Rectangle::new(origin, Size::new(16, 16))
                    .into_styled(PrimitiveStyle::with_stroke(BinaryColor::On, 1))
                    .draw(canvas);
            }
        }
        if in_correction {
            let _ = Text::new("!", Point::new(120, 10), text_style()).draw(canvas);
        }
    }
}

/// Chess clock strip. Requests the fast partial waveform.
pub struct ClockWidget {
    bounds: Rect,
    dirty: Dirty,
    store: Store,
}

impl ClockWidget {
    /// Standard clock strip.
    pub fn new(bounds: Rect, dirty: Dirty, store: Store) -> ClockWidget {
        ClockWidget {
            bounds,
            dirty,
            store,
        }
    }
}

fn format_ms(ms: u64) -> String {
    let total = ms / 1000;
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{h}:{m:02}:{s:02}")
    } else {
        format!("{m:02}:{s:02}")
    }
}

impl Widget for ClockWidget {
    fn bounds(&self) -> Rect {
        self.bounds
    }
    fn dirty(&self) -> &Dirty {
        &self.dirty
    }
    fn wants_fast(&self) -> bool {
        true
    }
    fn render(&mut self, canvas: &mut Canvas<'_>) {
        canvas.clear_background();
        let clock = self.store.clock.get();
        let white = format_ms(clock.white_ms);
        let black = format_ms(clock.black_ms);
        let _ = Text::new(&white, Point::new(4, 16), big_style()).draw(canvas);
        let black_x = self.bounds.w as i32 - 10 * black.len() as i32 - 4;
        let _ = Text::new(&black, Point::new(black_x, 16), big_style()).draw(canvas);
        // marker under the running side
        if clock.running {
            let y = self.bounds.h as i32 - 2;
            let (x0, x1) = match clock.active {
                Color::White => (4, 4 + 10 * white.len() as i32),
                Color::Black => (black_x, black_x + 10 * black.len() as i32),
            };
            let _ = Line::new(Point::new(x0, y), Point::new(x1, y))
                .into_styled(PrimitiveStyle::with_stroke(BinaryColor::On, 2))
                .draw(canvas);
        }
        if let Some(flagged) = clock.flagged {
            let label = match flagged {
                Color::White => "white flag",
                Color::Black => "black flag",
            };
            let _ = Text::new(label, Point::new(34, 8), text_style()).draw(canvas);
        }
    }
}

/// Evaluation bar plus score-over-ply sparkline.
pub struct AnalysisWidget {
    bounds: Rect,
    dirty: Dirty,
    store: Store,
}

impl AnalysisWidget {
    /// Standard analysis strip.
    pub fn new(bounds: Rect, dirty: Dirty, store: Store) -> AnalysisWidget {
        AnalysisWidget {
            bounds,
            dirty,
            store,
        }
    }
}

impl Widget for AnalysisWidget {
    fn bounds(&self) -> Rect {
        self.bounds
    }
    fn dirty(&self) -> &Dirty {
        &self.dirty
    }
    fn render(&mut self, canvas: &mut Canvas<'_>) {
        canvas.clear_background();
        let analysis = self.store.analysis.get();
        let width = self.bounds.w as i32;

        // eval bar: white's share of the width, current score clamped
        let cp = analysis.current.unwrap_or(0).clamp(-800, 800);
        let share = ((cp + 800) as u32 * self.bounds.w) / 1600;
        let _ = Rectangle::new(Point::new(0, 0), Size::new(self.bounds.w, 8))
            .into_styled(PrimitiveStyle::with_stroke(BinaryColor::On, 1))
            .draw(canvas);
        if share > 0 {
            let _ = Rectangle::new(Point::new(0, 0), Size::new(share, 8))
                .into_styled(PrimitiveStyle::with_fill(BinaryColor::On))
                .draw(canvas);
        }

        // sparkline over plies
        let graph_h = self.bounds.h as i32 - 10;
        if graph_h > 4 && !analysis.scores.is_empty() {
            let mid = 10 + graph_h / 2;
            let step = (width / analysis.scores.len().max(1) as i32).max(1);
            let mut prev: Option<Point> = None;
            for (i, score) in analysis.scores.iter().enumerate() {
                let clamped = (*score).clamp(-800, 800);
                let y = mid - (clamped * (graph_h / 2)) / 800;
                let point = Point::new(i as i32 * step, y);
                if let Some(prev) = prev {
                    let _ = Line::new(prev, point)
                        .into_styled(PrimitiveStyle::with_stroke(BinaryColor::On, 1))
                        .draw(canvas);
                }
                prev = Some(point);
            }
        }
    }
}

/// One entry of the icon menu.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuItem {
    /// Stable id the app reacts to.
    pub id: &'static str,
    /// Label shown on the panel.
    pub label: String,
}

/// Shared model of the menu widget.
#[derive(Debug, Default)]
pub struct MenuModel {
    /// Entries in display order.
    pub items: Vec<MenuItem>,
    /// Selected index.
    pub selected: usize,
}

impl MenuModel {
    /// Move the selection, wrapping.
    pub fn step(&mut self, down: bool) {
        if self.items.is_empty() {
            return;
        }
        self.selected = if down {
            (self.selected + 1) % self.items.len()
        } else {
            (self.selected + self.items.len() - 1) % self.items.len()
        };
    }

    /// Id of the selected entry.
    pub fn selected_id(&self) -> Option<&'static str> {
        self.items.get(self.selected).map(|i| i.id)
    }
}

/// Scrolling icon menu.
pub struct IconMenu {
    bounds: Rect,
    dirty: Dirty,
    model: Arc<Mutex<MenuModel>>,
}

impl IconMenu {
    /// Menu over a shared model.
    pub fn new(bounds: Rect, dirty: Dirty, model: Arc<Mutex<MenuModel>>) -> IconMenu {
        IconMenu {
            bounds,
            dirty,
            model,
        }
    }
}

impl Widget for IconMenu {
    fn bounds(&self) -> Rect {
        self.bounds
    }
    fn dirty(&self) -> &Dirty {
        &self.dirty
    }
    fn render(&mut self, canvas: &mut Canvas<'_>) {
        canvas.clear_background();
        let model = self.model.lock();
        let row_h = 18;
        let visible = (self.bounds.h as usize / row_h).max(1);
        let top = model.selected.saturating_sub(visible - 1);
        for (row, item) in model.items.iter().skip(top).take(visible).enumerate() {
            let y = (row * row_h) as i32;
            let index = top + row;
            if index == model.selected {
                let _ = Rectangle::new(Point::new(0, y), Size::new(self.bounds.w, row_h as u32))
                    .into_styled(PrimitiveStyle::with_stroke(BinaryColor::On, 1))
                    .draw(canvas);
                let _ = Text::new(">", Point::new(2, y + 13), text_style()).draw(canvas);
            }
            let _ = Text::new(&item.label, Point::new(12, y + 13), text_style()).draw(canvas);
        }
    }
}

/// Shared model of the on-screen keyboard.
#[derive(Debug)]
pub struct KeyboardModel {
    /// Key rows.
    pub rows: Vec<Vec<char>>,
    /// Cursor position (row, column).
    pub cursor: (usize, usize),
    /// Text entered so far.
    pub entered: String,
}

impl Default for KeyboardModel {
    fn default() -> Self {
        Self {
            rows: vec![
                "abcdefghij".chars().collect(),
                "klmnopqrst".chars().collect(),
                "uvwxyz0123".chars().collect(),
                "456789-_. ".chars().collect(),
            ],
            cursor: (0, 0),
            entered: String::new(),
        }
    }
}

impl KeyboardModel {
    /// Character under the cursor.
    pub fn current(&self) -> Option<char> {
        self.rows
            .get(self.cursor.0)
            .and_then(|row| row.get(self.cursor.1))
            .copied()
    }

    /// Move the cursor one step in reading order, wrapping.
    pub fn step(&mut self, forward: bool) {
        let cols = self.rows.first().map_or(1, Vec::len);
        let total = cols * self.rows.len();
        let flat = self.cursor.0 * cols + self.cursor.1;
        let flat = if forward {
            (flat + 1) % total
        } else {
            (flat + total - 1) % total
        };
        self.cursor = (flat / cols, flat % cols);
    }

    /// Accept the character under the cursor.
    pub fn accept(&mut self) {
        if let Some(c) = self.current() {
            self.entered.push(c);
        }
    }
}

/// On-screen keyboard for token entry.
pub struct KeyboardWidget {
    bounds: Rect,
    dirty: Dirty,
    model: Arc<Mutex<KeyboardModel>>,
}

impl KeyboardWidget {
    /// Keyboard over a shared model.
    pub fn new(bounds: Rect, dirty: Dirty, model: Arc<Mutex<KeyboardModel>>) -> KeyboardWidget {
        KeyboardWidget {
            bounds,
            dirty,
            model,
        }
    }
}

impl Widget for KeyboardWidget {
    fn bounds(&self) -> Rect {
        self.bounds
    }
    fn dirty(&self) -> &Dirty {
        &self.dirty
    }
    fn render(&mut self, canvas: &mut Canvas<'_>) {
        canvas.clear_background();
        let model = self.model.lock();
        let shown: String = if model.entered.len() > 20 {
            format!("..{}", &model.entered[model.entered.len() - 18..])
        } else {
            model.entered.clone()
        };
        let _ = Text::new(&shown, Point::new(2, 10), text_style()).draw(canvas);

        for (r, row) in model.rows.iter().enumerate() {
            for (c, ch) in row.iter().enumerate() {
                let x = 4 + c as i32 * 12;
                let y = 26 + r as i32 * 14;
                let mut buf = [0u8; 4];
                let _ = Text::new(ch.encode_utf8(&mut buf), Point::new(x, y), text_style())
                    .draw(canvas);
                if model.cursor == (r, c) {
                    let _ = Rectangle::new(Point::new(x - 2, y - 10), Size::new(11, 13))
                        .into_styled(PrimitiveStyle::with_stroke(BinaryColor::On, 1))
                        .draw(canvas);
                }
            }
        }
    }
}

/// Boot splash.
pub struct SplashWidget {
    bounds: Rect,
    dirty: Dirty,
    version: String,
}

impl SplashWidget {
    /// Full-panel splash.
    pub fn new(bounds: Rect, dirty: Dirty, version: impl Into<String>) -> SplashWidget {
        SplashWidget {
            bounds,
            dirty,
            version: version.into(),
        }
    }
}

impl Widget for SplashWidget {
    fn bounds(&self) -> Rect {
        self.bounds
    }
    fn dirty(&self) -> &Dirty {
        &self.dirty
    }
    fn render(&mut self, canvas: &mut Canvas<'_>) {
        canvas.clear_background();
        let _ = Text::new("tactboard", Point::new(14, 140), big_style()).draw(canvas);
        let _ = Text::new(&self.version, Point::new(40, 160), text_style()).draw(canvas);
        let _ = Rectangle::new(Point::new(10, 120), Size::new(108, 56))
            .into_styled(PrimitiveStyle::with_stroke(BinaryColor::On, 1))
            .draw(canvas);
    }
}

/// Modal alert (dismissable) and the persistent banner.
pub struct AlertWidget {
    bounds: Rect,
    dirty: Dirty,
    store: Store,
}

impl AlertWidget {
    /// Alert strip.
    pub fn new(bounds: Rect, dirty: Dirty, store: Store) -> AlertWidget {
        AlertWidget {
            bounds,
            dirty,
            store,
        }
    }
}

impl Widget for AlertWidget {
    fn bounds(&self) -> Rect {
        self.bounds
    }
    fn dirty(&self) -> &Dirty {
        &self.dirty
    }
    fn render(&mut self, canvas: &mut Canvas<'_>) {
        canvas.clear_background();
        let (alert, banner) = self.store.system.with(|s| (s.alert.clone(), s.banner.clone()));
        let Some(text) = alert.or(banner) else {
            return;
        };
        let _ = Rectangle::new(Point::zero(), Size::new(self.bounds.w, self.bounds.h))
            .into_styled(PrimitiveStyle::with_stroke(BinaryColor::On, 1))
            .draw(canvas);
        // crude wrap at 20 chars per line
        for (i, chunk) in text
            .as_bytes()
            .chunks(20)
            .take((self.bounds.h as usize - 4) / 12)
            .enumerate()
        {
            let line = String::from_utf8_lossy(chunk);
            let _ = Text::new(&line, Point::new(4, 12 + i as i32 * 12), text_style()).draw(canvas);
        }
    }
}

/// End-of-game card.
pub struct GameOverWidget {
    bounds: Rect,
    dirty: Dirty,
    store: Store,
}

impl GameOverWidget {
    /// Result card.
    pub fn new(bounds: Rect, dirty: Dirty, store: Store) -> GameOverWidget {
        GameOverWidget {
            bounds,
            dirty,
            store,
        }
    }
}

fn reason_label(reason: TerminationReason) -> &'static str {
    match reason {
        TerminationReason::Checkmate => "checkmate",
        TerminationReason::Stalemate => "stalemate",
        TerminationReason::InsufficientMaterial => "insufficient material",
        TerminationReason::FiftyMoveRule => "fifty-move rule",
        TerminationReason::ThreefoldRepetition => "threefold repetition",
        TerminationReason::Resignation => "resignation",
        TerminationReason::DrawAgreement => "draw agreed",
        TerminationReason::FlagFall => "flag fell",
        TerminationReason::Abandoned => "abandoned",
    }
}

impl Widget for GameOverWidget {
    fn bounds(&self) -> Rect {
        self.bounds
    }
    fn dirty(&self) -> &Dirty {
        &self.dirty
    }
    fn render(&mut self, canvas: &mut Canvas<'_>) {
        canvas.clear_background();
        let (result, reason) = self.store.game.with(|g| (g.result.clone(), g.termination));
        let Some(result) = result else {
            return;
        };
        let headline = match &result {
            GameResult::WhiteWins => "1-0",
            GameResult::BlackWins => "0-1",
            GameResult::Draw => "1/2-1/2",
            GameResult::Aborted(_) => "aborted",
        };
        let _ = Text::new(headline, Point::new(30, 20), big_style()).draw(canvas);
        if let Some(reason) = reason {
            let _ = Text::new(reason_label(reason), Point::new(8, 36), text_style()).draw(canvas);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::framebuffer::Framebuffer;
    use crate::display::widget::Screen;
    use crate::engine::position::INITIAL_FEN;
    use tokio::sync::Notify;

    fn harness() -> (Arc<Notify>, Store, Framebuffer) {
        (
            Arc::new(Notify::new()),
            Store::new(),
            Framebuffer::new(crate::display::PANEL_WIDTH, crate::display::PANEL_HEIGHT),
        )
    }

    #[test]
    fn widgets_stay_inside_their_bounds() {
        // the framebuffer-diff-minimality property at widget level: a
        // widget's damage is a subset of its rectangle
        let (wake, store, mut fb) = harness();
        store.game.mutate(|g| g.fen = INITIAL_FEN.to_string());
        store.system.mutate(|s| s.battery_percent = 50);
        store.clock.mutate(|c| {
            c.white_ms = 65_000;
            c.black_ms = 300_000;
            c.running = true;
        });
        let screen = Screen::new("test", wake);

        let cases: Vec<(Rect, Box<dyn Widget>)> = vec![
            (
                Rect::new(0, 0, 128, 16),
                Box::new(StatusBar::new(
                    Rect::new(0, 0, 128, 16),
                    screen.dirty_handle(),
                    store.clone(),
                )),
            ),
            (
                Rect::new(0, 16, 128, 128),
                Box::new(BoardWidget::new(
                    Rect::new(0, 16, 128, 128),
                    screen.dirty_handle(),
                    store.clone(),
                )),
            ),
            (
                Rect::new(0, 144, 128, 24),
                Box::new(ClockWidget::new(
                    Rect::new(0, 144, 128, 24),
                    screen.dirty_handle(),
                    store.clone(),
                )),
            ),
        ];

        for (bounds, mut widget) in cases {
            let before = fb.clone();
            {
                let mut canvas = fb.canvas(bounds);
                widget.render(&mut canvas);
            }
            for offset in fb.changed_bytes(&before) {
                let y = (offset / fb.stride()) as u32;
                let x_byte = (offset % fb.stride()) as u32;
                let damage = Rect::new(x_byte * 8, y, 8, 1);
                assert!(
                    bounds.union(damage) == bounds,
                    "widget {bounds:?} damaged {damage:?}"
                );
            }
        }
    }

    #[test]
    fn board_renders_32_pieces_and_flip_moves_them() {
        let (wake, store, mut fb) = harness();
        store.game.mutate(|g| g.fen = INITIAL_FEN.to_string());
        let screen = Screen::new("test", wake);
        let bounds = Rect::new(0, 0, 128, 128);
        let mut board = BoardWidget::new(bounds, screen.dirty_handle(), store.clone());

        {
            let mut canvas = fb.canvas(bounds);
            board.render(&mut canvas);
        }
        let unflipped = fb.clone();

        board.set_flipped(true);
        {
            let mut canvas = fb.canvas(bounds);
            board.render(&mut canvas);
        }
        assert_ne!(
            unflipped.bytes(),
            fb.bytes(),
            "flip must change the rendering"
        );
    }

    #[test]
    fn clock_formatting() {
        assert_eq!(format_ms(0), "00:00");
        assert_eq!(format_ms(65_000), "01:05");
        assert_eq!(format_ms(3_700_000), "1:01:40");
    }

    #[test]
    fn menu_model_wraps_and_reports_ids() {
        let mut model = MenuModel {
            items: vec![
                MenuItem {
                    id: "play",
                    label: "Play".into(),
                },
                MenuItem {
                    id: "settings",
                    label: "Settings".into(),
                },
            ],
            selected: 0,
        };
        assert_eq!(model.selected_id(), Some("play"));
        model.step(true);
        assert_eq!(model.selected_id(), Some("settings"));
        model.step(true);
        assert_eq!(model.selected_id(), Some("play"));
        model.step(false);
        assert_eq!(model.selected_id(), Some("settings"));
    }

    #[test]
    fn keyboard_model_steps_and_accepts() {
        let mut model = KeyboardModel::default();
        assert_eq!(model.current(), Some('a'));
        model.step(true);
        assert_eq!(model.current(), Some('b'));
        model.accept();
        assert_eq!(model.entered, "b");
        model.step(false);
        model.step(false);
        // wrapped to the last key of the grid
        assert_eq!(model.current(), Some(' '));
    }

    #[test]
    fn alert_widget_is_empty_without_an_alert() {
        let (wake, store, mut fb) = harness();
        let screen = Screen::new("test", wake);
        let bounds = Rect::new(0, 200, 128, 40);
        let mut alert = AlertWidget::new(bounds, screen.dirty_handle(), store.clone());
        let before = fb.clone();
        {
            let mut canvas = fb.canvas(bounds);
            alert.render(&mut canvas);
        }
        assert!(fb.changed_bytes(&before).is_empty());

        store
            .system
            .mutate(|s| s.alert = Some("engine died".into()));
        {
            let mut canvas = fb.canvas(bounds);
            alert.render(&mut canvas);
        }
        assert!(!fb.changed_bytes(&before).is_empty());
    }
}
