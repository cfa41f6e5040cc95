//! Application state shared across routes

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;

use crate::bots::{BotLauncher, NoBots, ProcessBotLauncher};
use crate::competition::Competition;
use crate::config::{Config, GameSettings};
use crate::game::RoomEvent;
use crate::matchmaking::RoomManager;
use crate::ws::connection::ConnectionRegistry;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub connections: Arc<ConnectionRegistry>,
    pub rooms: Arc<RoomManager>,
    pub competition: Arc<Competition>,
}

impl AppState {
    /// Wire up the services. The receiver carries match results from the
    /// rooms and must be handed to [`Competition::run`].
    pub fn new(config: Config, settings: GameSettings) -> (Self, mpsc::UnboundedReceiver<RoomEvent>) {
        let bots: Arc<dyn BotLauncher> = match config
            .bot_command
            .as_deref()
            .and_then(|cmd| ProcessBotLauncher::new(cmd, config.public_ws_url.clone()))
        {
            Some(launcher) => {
                info!(server = %config.public_ws_url, "Bot launcher configured");
                Arc::new(launcher)
            }
            None => Arc::new(NoBots),
        };
        Self::with_bots(config, settings, bots)
    }

    pub fn with_bots(
        config: Config,
        settings: GameSettings,
        bots: Arc<dyn BotLauncher>,
    ) -> (Self, mpsc::UnboundedReceiver<RoomEvent>) {
        let config = Arc::new(config);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let rooms = Arc::new(RoomManager::new(events_tx));
        let connections = Arc::new(ConnectionRegistry::new());

        let competition = Arc::new(Competition::new(
            settings,
            rooms.clone(),
            connections.clone(),
            bots,
        ));

        let state = Self {
            config,
            connections,
            rooms,
            competition,
        };
        (state, events_rx)
    }
}
