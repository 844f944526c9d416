use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::lifecycle::InitStrategy;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_SERVER_URL: &str = "ws://localhost:3000/ws";

/// Game settings loaded from `game.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub init_strategy: InitStrategy,
    /// Maximum players admitted to a room; `None` admits everyone.
    pub capacity: Option<usize>,
    /// Cadence of elapsed-time republishing.
    pub tick_millis: u64,
    pub request_timeout_millis: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            init_strategy: InitStrategy::Seeded,
            capacity: None,
            tick_millis: 500,
            request_timeout_millis: 5000,
        }
    }
}

/// Resolves a path relative to the config directory.
fn config_path(sub: &str) -> PathBuf {
    let base = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config".to_string());
    Path::new(&base).join(sub)
}

/// Initialize the config directory with defaults if missing.
pub fn init() -> Result<()> {
    let base = config_path("");
    if !base.exists() {
        fs::create_dir_all(&base)?;
    }

    let game_path = config_path("game.json");
    if !game_path.exists() {
        let defaults = serde_json::to_string_pretty(&Settings::default())?;
        fs::write(&game_path, defaults)?;
        tracing::info!("Wrote default settings to {}", game_path.display());
    }

    Ok(())
}

/// Load the game settings.
pub fn load_settings() -> Result<Settings> {
    load_settings_from(&config_path("game.json"))
}

pub fn load_settings_from(path: &Path) -> Result<Settings> {
    let data = fs::read_to_string(path)?;
    let settings: Settings = serde_json::from_str(&data)?;
    if settings.tick_millis == 0 {
        return Err(Error::Config("tickMillis must be greater than zero".to_string()));
    }
    if settings.capacity == Some(0) {
        return Err(Error::Config("capacity must be at least 1".to_string()));
    }
    Ok(settings)
}

/// Port for the relay server, from `PORT`.
pub fn port() -> Result<u16> {
    match std::env::var("PORT") {
        Ok(raw) => raw
            .parse()
            .map_err(|_| Error::Config(format!("invalid PORT: {raw}"))),
        Err(_) => Ok(DEFAULT_PORT),
    }
}

/// Relay URL for clients, from `HEARTGRID_SERVER`.
pub fn server_url() -> String {
    std::env::var("HEARTGRID_SERVER").unwrap_or_else(|_| DEFAULT_SERVER_URL.to_string())
}
