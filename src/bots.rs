//! Bot processes that fill empty competition slots

use std::ops::RangeInclusive;
use std::process::Stdio;

use parking_lot::Mutex;
use rand::Rng;
use tokio::process::{Child, Command};
use tracing::{info, warn};

/// Bot skill levels accepted by the bot client
pub const DIFFICULTY_RANGE: RangeInclusive<u32> = 1..=10;

/// Starts and stops bot opponents
pub trait BotLauncher: Send + Sync {
    /// Launch one bot. Out-of-range or missing difficulties are randomized.
    /// Returns the difficulty used, or `None` if nothing was started.
    fn launch_one(&self, difficulty: Option<u32>) -> Option<u32>;

    fn launch(&self, count: u32) {
        for _ in 0..count {
            self.launch_one(None);
        }
    }

    fn terminate_all(&self);
}

/// Keep a requested difficulty if it is in range, otherwise roll one
pub fn pick_difficulty(requested: Option<u32>, rng: &mut impl Rng) -> u32 {
    requested
        .filter(|d| DIFFICULTY_RANGE.contains(d))
        .unwrap_or_else(|| rng.gen_range(DIFFICULTY_RANGE))
}

/// Runs each bot as a child process pointed back at this server
pub struct ProcessBotLauncher {
    program: String,
    args: Vec<String>,
    server_url: String,
    children: Mutex<Vec<Child>>,
}

impl ProcessBotLauncher {
    /// `command` is split on whitespace, e.g. `python copperbot.py`
    pub fn new(command: &str, server_url: impl Into<String>) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
            server_url: server_url.into(),
            children: Mutex::new(Vec::new()),
        })
    }

    fn spawn_one(&self, difficulty: u32) -> std::io::Result<Child> {
        Command::new(&self.program)
            .args(&self.args)
            .arg("--server")
            .arg(&self.server_url)
            .arg("--difficulty")
            .arg(difficulty.to_string())
            .arg("--quiet")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(true)
            .spawn()
    }
}

impl BotLauncher for ProcessBotLauncher {
    fn launch_one(&self, difficulty: Option<u32>) -> Option<u32> {
        let difficulty = pick_difficulty(difficulty, &mut rand::thread_rng());
        match self.spawn_one(difficulty) {
            Ok(child) => {
                info!(pid = ?child.id(), difficulty, "Bot launched");
                self.children.lock().push(child);
                Some(difficulty)
            }
            Err(e) => {
                warn!(error = %e, program = %self.program, "Failed to launch bot");
                None
            }
        }
    }

    fn terminate_all(&self) {
        let children = std::mem::take(&mut *self.children.lock());
        if children.is_empty() {
            return;
        }
        info!(count = children.len(), "Terminating bots");
        for mut child in children {
            if let Err(e) = child.start_kill() {
                warn!(error = %e, "Failed to stop bot");
            }
        }
    }
}

/// Launcher used when no bot command is configured
pub struct NoBots;

impl BotLauncher for NoBots {
    fn launch_one(&self, _difficulty: Option<u32>) -> Option<u32> {
        warn!("Bot requested but BOT_COMMAND is not set");
        None
    }

    fn launch(&self, count: u32) {
        if count > 0 {
            warn!(count, "Bots requested but BOT_COMMAND is not set");
        }
    }

    fn terminate_all(&self) {}
}
