//! Configuration: a TOML file of `(section, key, value)` entries over
//! built-in defaults.
//!
//! The user file is kept as a raw table so keys this build does not know
//! about survive a round-trip untouched. Typed accessors validate the
//! enumerated options at load time; a bad file is fatal at startup only.

use std::path::{Path, PathBuf};
use std::time::Duration;

use toml::{Table, Value};
use tracing::debug;

use crate::board::SoundMode;
use crate::error::{Error, Result};

const DEFAULTS: &str = include_str!("defaults.toml");

/// Release channel for self-update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateChannel {
    /// Tagged releases.
    Stable,
    /// Nightly builds.
    Nightly,
}

/// How the board is oriented on the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    /// Decide from the active game.
    Auto,
    /// White plays from the south edge.
    WhiteSouth,
    /// Black plays from the south edge.
    BlackSouth,
}

/// Loaded configuration: user table over defaults.
#[derive(Debug, Clone)]
pub struct Config {
    path: Option<PathBuf>,
    user: Table,
    defaults: Table,
}

impl Config {
    /// Only the built-in defaults.
    pub fn builtin() -> Config {
        let defaults: Table = DEFAULTS.parse().expect("defaults.toml must parse");
        Config {
            path: None,
            user: Table::new(),
            defaults,
        }
    }

    /// Load `path` over the defaults. A missing file is fine (defaults
    /// apply); an unparsable file or invalid option is a `ConfigError`.
    pub fn load(path: &Path) -> Result<Config> {
        let mut config = Config::builtin();
        config.path = Some(path.to_path_buf());
        if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| Error::Config(format!("read {}: {e}", path.display())))?;
            config.user = text
                .parse()
                .map_err(|e| Error::Config(format!("parse {}: {e}", path.display())))?;
        }
        config.validate()?;
        debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Write the user table back (unknown keys intact). No-op for the
    /// builtin configuration.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let text = toml::to_string_pretty(&self.user)
            .map_err(|e| Error::Config(format!("serialize config: {e}")))?;
        std::fs::write(path, text)
            .map_err(|e| Error::Config(format!("write {}: {e}", path.display())))?;
        Ok(())
    }

    /// Raw lookup: user value first, then default.
    pub fn get(&self, section: &str, key: &str) -> Option<&Value> {
        fn from<'a>(table: &'a Table, section: &str, key: &str) -> Option<&'a Value> {
            table
                .get(section)
                .and_then(Value::as_table)
                .and_then(|s| s.get(key))
        }
        // borrow gymnastics: try user, fall back to defaults
        if from(&self.user, section, key).is_some() {
            return from(&self.user, section, key);
        }
        from(&self.defaults, section, key)
    }

    /// Set a value in the user table (created sections as needed).
    pub fn set(&mut self, section: &str, key: &str, value: Value) {
        let entry = self
            .user
            .entry(section.to_string())
            .or_insert_with(|| Value::Table(Table::new()));
        if let Value::Table(table) = entry {
            table.insert(key.to_string(), value);
        }
    }

    fn str_value(&self, section: &str, key: &str) -> Result<String> {
        self.get(section, key)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::Config(format!("[{section}] {key} must be a string")))
    }

    fn int_value(&self, section: &str, key: &str) -> Result<i64> {
        self.get(section, key)
            .and_then(Value::as_integer)
            .ok_or_else(|| Error::Config(format!("[{section}] {key} must be an integer")))
    }

    /// `sound = off | on | moves-only`.
    pub fn sound(&self) -> Result<SoundMode> {
        match self.str_value("system", "sound")?.as_str() {
            "off" => Ok(SoundMode::Off),
            "on" => Ok(SoundMode::On),
            "moves-only" => Ok(SoundMode::MovesOnly),
            other => Err(Error::Config(format!("unknown sound mode '{other}'"))),
        }
    }

    /// Idle time before the sleep warning.
    pub fn inactivity_timeout(&self) -> Result<Duration> {
        Ok(Duration::from_secs(
            self.int_value("system", "inactivity_timeout_s")?.max(0) as u64,
        ))
    }

    /// Warning countdown length.
    pub fn inactivity_warning(&self) -> Result<Duration> {
        Ok(Duration::from_secs(
            self.int_value("system", "inactivity_warning_s")?.max(0) as u64,
        ))
    }

    /// `board_orientation = auto | white-south | black-south`.
    pub fn board_orientation(&self) -> Result<Orientation> {
        match self.str_value("system", "board_orientation")?.as_str() {
            "auto" => Ok(Orientation::Auto),
            "white-south" => Ok(Orientation::WhiteSouth),
            "black-south" => Ok(Orientation::BlackSouth),
            other => Err(Error::Config(format!("unknown orientation '{other}'"))),
        }
    }

    /// `update_channel = stable | nightly`.
    pub fn update_channel(&self) -> Result<UpdateChannel> {
        match self.str_value("system", "update_channel")?.as_str() {
            "stable" => Ok(UpdateChannel::Stable),
            "nightly" => Ok(UpdateChannel::Nightly),
            other => Err(Error::Config(format!("unknown update channel '{other}'"))),
        }
    }

    /// Discoverability window length.
    pub fn discoverability_window(&self) -> Result<Duration> {
        Ok(Duration::from_secs(
            self.int_value("bluetooth", "discoverability_window_s")?
                .max(0) as u64,
        ))
    }

    /// Lichess API token, when configured.
    pub fn lichess_api_token(&self) -> Option<String> {
        self.str_value("lichess", "api_token")
            .ok()
            .filter(|t| !t.is_empty())
    }

    /// Acceptable opponent rating band.
    pub fn lichess_elo_range(&self) -> Result<(u32, u32)> {
        let values = self
            .get("lichess", "elo_range")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::Config("[lichess] elo_range must be a pair".into()))?;
        match values.as_slice() {
            [Value::Integer(low), Value::Integer(high)] if low <= high => {
                Ok((*low as u32, *high as u32))
            }
            _ => Err(Error::Config(
                "[lichess] elo_range must be [low, high]".into(),
            )),
        }
    }

    /// Menu ids the user wants shown.
    pub fn menu_visibility(&self) -> Vec<String> {
        self.get("menu", "visibility")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Fonts and sprite resources.
    pub fn resources_dir(&self) -> Result<PathBuf> {
        Ok(PathBuf::from(self.str_value("paths", "resources_dir")?))
    }

    /// UCI engine binaries.
    pub fn engines_dir(&self) -> Result<PathBuf> {
        Ok(PathBuf::from(self.str_value("paths", "engines_dir")?))
    }

    /// Game database file.
    pub fn database_path(&self) -> Result<PathBuf> {
        Ok(PathBuf::from(self.str_value("paths", "database_path")?))
    }

    /// Scratch space.
    pub fn tmp_dir(&self) -> Result<PathBuf> {
        Ok(PathBuf::from(self.str_value("paths", "tmp_dir")?))
    }

    /// Micro-controller serial device.
    pub fn serial_port(&self) -> Result<String> {
        self.str_value("board", "serial_port")
    }

    /// Serial baud rate.
    pub fn baud(&self) -> Result<u32> {
        Ok(self.int_value("board", "baud")?.max(0) as u32)
    }

    /// Eagerly check every enumerated option so a bad file fails at boot.
    fn validate(&self) -> Result<()> {
        self.sound()?;
        self.inactivity_timeout()?;
        self.inactivity_warning()?;
        self.board_orientation()?;
        self.update_channel()?;
        self.discoverability_window()?;
        self.lichess_elo_range()?;
        self.serial_port()?;
        self.baud()?;
        Ok(())
    }
}
