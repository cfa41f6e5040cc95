//! Configuration module - environment variables and the game settings file

pub mod watch;

use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::game::food::{default_food_table, FoodKind, FoodTable, FruitSettings};
use crate::game::GridSize;

/// Settings file picked up from the working directory when `SETTINGS_PATH` is unset
const DEFAULT_SETTINGS_FILE: &str = "server-settings.json";

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// JSON game settings file, watched for changes
    pub settings_path: Option<PathBuf>,
    /// Command used to start a bot process, e.g. `python copperbot.py`
    pub bot_command: Option<String>,
    /// WebSocket URL bots connect back to
    pub public_ws_url: String,
    /// Allowed client origin for CORS; any origin when unset
    pub client_origin: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let server_addr = if let Ok(port) = env::var("PORT") {
            format!("0.0.0.0:{}", port)
        } else {
            env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8765".to_string())
        };
        let server_addr: SocketAddr = server_addr
            .parse()
            .map_err(|_| ConfigError::InvalidAddress)?;

        let settings_path = match env::var("SETTINGS_PATH") {
            Ok(path) => Some(PathBuf::from(path)),
            Err(_) => Some(PathBuf::from(DEFAULT_SETTINGS_FILE)).filter(|p| p.exists()),
        };

        let public_ws_url = env::var("PUBLIC_WS_URL")
            .unwrap_or_else(|_| format!("ws://localhost:{}/ws/", server_addr.port()));

        Ok(Self {
            server_addr,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            settings_path,
            bot_command: env::var("BOT_COMMAND").ok().filter(|c| !c.trim().is_empty()),
            public_ws_url,
            client_origin: env::var("CLIENT_ORIGIN").ok(),
        })
    }
}

/// Tunable game and competition settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GameSettings {
    /// Matches in round one; the competition needs twice as many players
    pub arenas: u32,
    pub points_to_win: u32,
    /// Seconds between a champion being crowned and the next competition
    pub reset_delay: u64,
    #[serde(serialize_with = "grid_to_str", deserialize_with = "grid_from_str")]
    pub grid_size: GridSize,
    /// Seconds per tick
    pub speed: f64,
    /// Bots launched whenever the competition opens
    pub bots: u32,
    /// Food lifetime is revealed to clients within this many ticks of expiry
    pub fruit_warning: u32,
    pub max_fruits: usize,
    /// Minimum ticks between spawns
    pub fruit_interval: u32,
    #[serde(deserialize_with = "merge_fruits")]
    pub fruits: FoodTable,
    /// Seconds between the end of a round and the next round's rooms opening
    pub round_delay: f64,
    /// Seconds a room holds the game-over screen
    pub game_over_pause: f64,
}

impl Default for GameSettings {
    fn default() -> Self {
        Self {
            arenas: 1,
            points_to_win: 5,
            reset_delay: 10,
            grid_size: GridSize::default(),
            speed: 0.15,
            bots: 0,
            fruit_warning: 20,
            max_fruits: 1,
            fruit_interval: 40,
            fruits: default_food_table(),
            round_delay: 5.0,
            game_over_pause: 3.0,
        }
    }
}

impl GameSettings {
    /// Defaults, then the settings file, then environment overrides
    pub fn resolve(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut settings = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        settings.apply_env()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        override_from_env("ARENAS", &mut self.arenas)?;
        override_from_env("POINTS_TO_WIN", &mut self.points_to_win)?;
        override_from_env("RESET_DELAY", &mut self.reset_delay)?;
        override_from_env("GRID_SIZE", &mut self.grid_size)?;
        override_from_env("SPEED", &mut self.speed)?;
        override_from_env("BOTS", &mut self.bots)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.arenas < 1 {
            return Err(ConfigError::Invalid("arenas must be at least 1"));
        }
        if self.points_to_win < 1 {
            return Err(ConfigError::Invalid("points_to_win must be at least 1"));
        }
        if !self.speed.is_finite() || self.speed <= 0.0 {
            return Err(ConfigError::Invalid("speed must be a positive number"));
        }
        if self.grid_size.width < 5 || self.grid_size.height < 5 {
            return Err(ConfigError::Invalid("grid dimensions must be at least 5x5"));
        }
        for (value, msg) in [
            (self.round_delay, "round_delay must be a non-negative number"),
            (self.game_over_pause, "game_over_pause must be a non-negative number"),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Invalid(msg));
            }
        }
        Ok(())
    }

    pub fn required_players(&self) -> usize {
        self.arenas as usize * 2
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(self.speed)
    }

    pub fn reset_delay(&self) -> Duration {
        Duration::from_secs(self.reset_delay)
    }

    pub fn round_delay(&self) -> Duration {
        Duration::from_secs_f64(self.round_delay)
    }

    pub fn game_over_pause(&self) -> Duration {
        Duration::from_secs_f64(self.game_over_pause)
    }
}

fn override_from_env<T: FromStr>(key: &'static str, target: &mut T) -> Result<(), ConfigError> {
    if let Ok(raw) = env::var(key) {
        *target = raw.trim().parse().map_err(|_| ConfigError::InvalidEnv(key))?;
    }
    Ok(())
}

fn grid_to_str<S: Serializer>(grid: &GridSize, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(grid)
}

fn grid_from_str<'de, D: Deserializer<'de>>(deserializer: D) -> Result<GridSize, D::Error> {
    let raw = String::deserialize(deserializer)?;
    raw.parse().map_err(serde::de::Error::custom)
}

/// Listed fruits replace their defaults; unlisted ones keep them
fn merge_fruits<'de, D: Deserializer<'de>>(deserializer: D) -> Result<FoodTable, D::Error> {
    let listed = std::collections::BTreeMap::<FoodKind, FruitSettings>::deserialize(deserializer)?;
    let mut table = default_food_table();
    table.extend(listed);
    Ok(table)
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid server address format")]
    InvalidAddress,

    #[error("Invalid value in environment variable {0}")]
    InvalidEnv(&'static str),

    #[error("Cannot read settings file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Malformed settings: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid settings: {0}")]
    Invalid(&'static str),
}
