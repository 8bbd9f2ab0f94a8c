//! Menu state machine for the bezel keys.
//!
//! The menu widget renders a shared [`MenuModel`]; this controller moves
//! the selection on key presses and maps a confirmed entry to an app
//! action. Which entries appear is governed by the `menu_visibility`
//! configuration.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::display::widget::Dirty;
use crate::display::widgets::{MenuItem, MenuModel};
use crate::types::Key;

/// What a confirmed menu entry asks the app to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuAction {
    /// Start a local human-vs-human game.
    PlayHuman,
    /// Start a local game against the UCI engine.
    PlayEngine,
    /// Start a hand-brain game (the engine names the piece type).
    PlayHandBrain,
    /// Open the discoverability window for chess apps.
    Emulators,
    /// Enter the settings screen.
    Settings,
    /// Show the about card.
    About,
    /// Resume the persisted game.
    Resume,
    /// Leave the current screen.
    Back,
    /// Power down.
    Shutdown,
}

fn action_for(id: &str) -> Option<MenuAction> {
    Some(match id {
        "play" => MenuAction::PlayHuman,
        "engine" => MenuAction::PlayEngine,
        "handbrain" => MenuAction::PlayHandBrain,
        "emulators" => MenuAction::Emulators,
        "settings" => MenuAction::Settings,
        "about" => MenuAction::About,
        "resume" => MenuAction::Resume,
        "shutdown" => MenuAction::Shutdown,
        _ => return None,
    })
}

fn label_for(id: &'static str) -> String {
    match id {
        "play" => "Play",
        "engine" => "Engine game",
        "handbrain" => "Hand-brain",
        "emulators" => "Chess apps",
        "settings" => "Settings",
        "about" => "About",
        "resume" => "Resume game",
        "shutdown" => "Power off",
        other => other,
    }
    .to_string()
}

/// Entries for the top-level menu, honoring `menu_visibility` and whether
/// a resumable game exists.
pub fn main_menu_items(visibility: &[String], resumable: bool) -> Vec<MenuItem> {
    const ORDER: [&str; 8] = [
        "resume",
        "play",
        "engine",
        "handbrain",
        "emulators",
        "settings",
        "about",
        "shutdown",
    ];
    ORDER
        .iter()
        .filter(|id| match **id {
            "resume" => resumable,
            // shutdown is always reachable
            "shutdown" => true,
            id => visibility.iter().any(|v| v == id),
        })
        .map(|id| MenuItem {
            id,
            label: label_for(id),
        })
        .collect()
}

/// Key-driven navigation over a shared menu model.
pub struct MenuController {
    model: Arc<Mutex<MenuModel>>,
    dirty: Dirty,
}

impl std::fmt::Debug for MenuController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MenuController")
            .field("selected", &self.model.lock().selected)
            .finish()
    }
}

impl MenuController {
    /// Controller over the widget's model and dirty handle.
    pub fn new(model: Arc<Mutex<MenuModel>>, dirty: Dirty) -> MenuController {
        MenuController { model, dirty }
    }

    /// Replace the entries and reset the selection.
    pub fn set_items(&self, items: Vec<MenuItem>) {
        let mut model = self.model.lock();
        model.items = items;
        model.selected = 0;
        drop(model);
        self.dirty.mark();
    }

    /// Id of the selected entry (settings screens act on it directly).
    pub fn selected_id(&self) -> Option<&'static str> {
        self.model.lock().selected_id()
    }

    /// Process a key. `Some(action)` when an entry was confirmed.
    pub fn handle_key(&self, key: Key) -> Option<MenuAction> {
        match key {
            Key::Up => {
                self.model.lock().step(false);
                self.dirty.mark();
                None
            }
            Key::Down => {
                self.model.lock().step(true);
                self.dirty.mark();
                None
            }
            Key::Tick => {
                let id = self.model.lock().selected_id()?;
                action_for(id)
            }
            Key::Back => Some(MenuAction::Back),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::widget::Screen;
    use tokio::sync::Notify;

    fn controller(items: Vec<MenuItem>) -> MenuController {
        let screen = Screen::new("menu", Arc::new(Notify::new()));
        let model = Arc::new(Mutex::new(MenuModel {
            items,
            selected: 0,
        }));
        MenuController::new(model, screen.dirty_handle())
    }

    #[test]
    fn visibility_filters_entries_and_resume_leads() {
        let visibility = vec!["play".to_string(), "settings".to_string()];
        let items = main_menu_items(&visibility, true);
        let ids: Vec<&str> = items.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["resume", "play", "settings", "shutdown"]);

        let items = main_menu_items(&visibility, false);
        assert!(!items.iter().any(|i| i.id == "resume"));
    }

    #[test]
    fn keys_navigate_and_confirm() {
        let visibility: Vec<String> =
            ["play", "emulators", "settings", "about"].map(String::from).to_vec();
        let menu = controller(main_menu_items(&visibility, false));

        assert_eq!(menu.handle_key(Key::Tick), Some(MenuAction::PlayHuman));
        assert_eq!(menu.handle_key(Key::Down), None);
        assert_eq!(menu.handle_key(Key::Tick), Some(MenuAction::Emulators));
        assert_eq!(menu.handle_key(Key::Up), None);
        assert_eq!(menu.handle_key(Key::Tick), Some(MenuAction::PlayHuman));
        assert_eq!(menu.handle_key(Key::Back), Some(MenuAction::Back));
        assert_eq!(menu.handle_key(Key::Help), None);
    }
}
