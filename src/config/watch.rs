//! Settings file watcher - polls for changes and hot-reloads the competition

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use crate::competition::Competition;

use super::{ConfigError, GameSettings};

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Watch `path` and reload the competition whenever it changes.
/// Invalid files are rejected and the running settings stay in place.
pub fn spawn_settings_watcher(path: PathBuf, competition: Arc<Competition>) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(path = %path.display(), "Watching settings file for changes");

        let mut last_seen = modified(&path);
        let mut ticker = interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let current = modified(&path);
            if current.is_none() || current <= last_seen {
                continue;
            }
            last_seen = current;

            info!(path = %path.display(), "Settings file changed, reloading");
            if let Err(e) = apply_change(&path, &competition).await {
                warn!(error = %e, "Rejected settings change, keeping current settings");
            }
        }
    })
}

/// Re-read `path` and hand the result to the competition. Nothing is touched
/// unless the file resolves to valid settings.
pub async fn apply_change(path: &Path, competition: &Arc<Competition>) -> Result<(), ConfigError> {
    let settings = GameSettings::resolve(Some(path))?;
    info!(
        arenas = settings.arenas,
        points_to_win = settings.points_to_win,
        grid = %settings.grid_size,
        "Settings reloaded"
    );
    competition.reload(settings).await;
    Ok(())
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
