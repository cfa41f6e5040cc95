//! Match room: two seats, best-of-N scoring, and the authoritative tick loop

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::competition::PlayerId;
use crate::config::GameSettings;
use crate::ws::connection::ConnectionHandle;
use crate::ws::protocol::{GameSnapshot, SeatRef, ServerMsg};

use super::food::{FoodSpawner, FoodTable};
use super::snapshot::SnapshotBuilder;
use super::{Direction, Game, GridSize, Names, Outcome, PerSlot, Scores, Slot};

/// Observer broadcast depth
const UPDATE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub u64);

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomPhase {
    AwaitingReady,
    Running,
    GameOver,
    MatchComplete,
}

/// Per-room copy of the settings that govern play
#[derive(Debug, Clone)]
pub struct RoomConfig {
    pub grid: GridSize,
    pub tick_interval: Duration,
    pub points_to_win: u32,
    pub game_over_pause: Duration,
    pub fruit_warning: u32,
    pub max_fruits: usize,
    pub fruit_interval: u32,
    pub fruits: FoodTable,
    pub seed: u64,
}

impl RoomConfig {
    pub fn from_settings(settings: &GameSettings, seed: u64) -> Self {
        Self {
            grid: settings.grid_size,
            tick_interval: settings.tick_interval(),
            points_to_win: settings.points_to_win,
            game_over_pause: settings.game_over_pause(),
            fruit_warning: settings.fruit_warning,
            max_fruits: settings.max_fruits,
            fruit_interval: settings.fruit_interval,
            fruits: settings.fruits.clone(),
            seed,
        }
    }
}

/// A seated competitor
#[derive(Debug, Clone)]
pub struct Occupant {
    pub player: PlayerId,
    pub name: String,
    pub conn: ConnectionHandle,
    /// Ready signal carried over from the lobby
    pub ready: bool,
}

#[derive(Debug, Clone)]
pub enum RoomCommand {
    Ready(Slot),
    Move(Slot, Direction),
    Leave(Slot),
}

/// Final result of a match, sent to the competition
#[derive(Debug, Clone)]
pub struct MatchReport {
    pub room_id: RoomId,
    pub players: PerSlot<PlayerId>,
    pub winner: Slot,
    pub scores: Scores,
    pub forfeit: bool,
    pub finished_at: Instant,
}

impl MatchReport {
    pub fn winner_id(&self) -> PlayerId {
        *self.players.get(self.winner)
    }

    pub fn loser_id(&self) -> PlayerId {
        *self.players.get(self.winner.opponent())
    }
}

#[derive(Debug, Clone)]
pub enum RoomEvent {
    MatchComplete(MatchReport),
}

/// Published view of a room for queries and observers
#[derive(Debug, Clone, Serialize)]
pub struct RoomSummary {
    pub room_id: RoomId,
    pub arena: u32,
    pub names: Names,
    pub wins: Scores,
    pub phase: RoomPhase,
    pub game_running: bool,
    pub match_complete: bool,
    pub tick: u64,
    #[serde(skip)]
    pub latest: Option<GameSnapshot>,
}

/// Handle for routing commands into a running room
#[derive(Clone)]
pub struct RoomHandle {
    pub id: RoomId,
    pub arena: u32,
    pub players: PerSlot<PlayerId>,
    commands: mpsc::UnboundedSender<RoomCommand>,
    updates: broadcast::Sender<ServerMsg>,
    summary: Arc<RwLock<RoomSummary>>,
}

impl RoomHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<ServerMsg> {
        self.updates.subscribe()
    }

    pub fn summary(&self) -> RoomSummary {
        self.summary.read().clone()
    }

    pub fn is_active(&self) -> bool {
        !self.summary.read().match_complete
    }

    pub fn seat(&self, slot: Slot) -> Seat {
        Seat {
            room_id: self.id,
            slot,
            commands: self.commands.clone(),
            summary: self.summary.clone(),
        }
    }
}

/// A player's place in a room
#[derive(Debug, Clone)]
pub struct Seat {
    pub room_id: RoomId,
    pub slot: Slot,
    commands: mpsc::UnboundedSender<RoomCommand>,
    summary: Arc<RwLock<RoomSummary>>,
}

impl Seat {
    pub fn send(&self, cmd: RoomCommand) -> bool {
        self.commands.send(cmd).is_ok()
    }

    pub fn match_complete(&self) -> bool {
        self.summary.read().match_complete
    }
}

/// What the run loop should do with its timers after handling an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Schedule {
    Unchanged,
    Tick,
    Pause(Duration),
    Halt,
}

/// The authoritative match room
pub struct MatchRoom {
    id: RoomId,
    arena: u32,
    config: RoomConfig,
    occupants: PerSlot<Occupant>,
    connected: PerSlot<bool>,
    ready: HashSet<Slot>,
    phase: RoomPhase,
    scores: Scores,
    game: Option<Game>,
    pending: BTreeMap<Slot, Direction>,
    spawner: FoodSpawner,
    snapshots: SnapshotBuilder,
    commands: mpsc::UnboundedReceiver<RoomCommand>,
    updates: broadcast::Sender<ServerMsg>,
    events: mpsc::UnboundedSender<RoomEvent>,
    summary: Arc<RwLock<RoomSummary>>,
    reported: bool,
}

impl MatchRoom {
    /// Create a new room
    pub fn new(
        id: RoomId,
        arena: u32,
        occupants: PerSlot<Occupant>,
        config: RoomConfig,
        events: mpsc::UnboundedSender<RoomEvent>,
    ) -> (Self, RoomHandle) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);

        let names = occupants.map(|o| o.name.clone());
        let summary = Arc::new(RwLock::new(RoomSummary {
            room_id: id,
            arena,
            names,
            wins: Scores::default(),
            phase: RoomPhase::AwaitingReady,
            game_running: false,
            match_complete: false,
            tick: 0,
            latest: None,
        }));

        let handle = RoomHandle {
            id,
            arena,
            players: occupants.map(|o| o.player),
            commands: commands_tx,
            updates: updates.clone(),
            summary: summary.clone(),
        };

        let ready = Slot::BOTH
            .into_iter()
            .filter(|s| occupants.get(*s).ready)
            .collect();

        let room = Self {
            id,
            arena,
            spawner: FoodSpawner::new(
                config.seed,
                config.max_fruits,
                config.fruit_interval,
                &config.fruits,
            ),
            snapshots: SnapshotBuilder::new(config.fruit_warning),
            config,
            occupants,
            connected: PerSlot::new(true, true),
            ready,
            phase: RoomPhase::AwaitingReady,
            scores: Scores::default(),
            game: None,
            pending: BTreeMap::new(),
            commands,
            updates,
            events,
            summary,
            reported: false,
        };

        (room, handle)
    }

    /// Run the room until every command sender is gone
    pub async fn run(mut self) {
        info!(room_id = %self.id, arena = self.arena, "Match room opened");

        let mut ticker: Option<Interval> = None;
        let mut pause: Option<Instant> = None;

        self.announce();
        let first = self.try_start_game();
        self.apply(first, &mut ticker, &mut pause);

        loop {
            let schedule = tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                _ = next_tick(&mut ticker) => self.on_tick(),
                _ = pause_elapsed(pause) => self.on_pause_elapsed(),
            };
            self.apply(schedule, &mut ticker, &mut pause);
        }

        debug!(room_id = %self.id, "Match room closed");
    }

    fn apply(&self, schedule: Schedule, ticker: &mut Option<Interval>, pause: &mut Option<Instant>) {
        match schedule {
            Schedule::Unchanged => {}
            Schedule::Tick => {
                *pause = None;
                if ticker.is_none() {
                    let period = self.config.tick_interval;
                    let mut interval = interval_at(Instant::now() + period, period);
                    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    *ticker = Some(interval);
                }
            }
            Schedule::Pause(delay) => {
                *ticker = None;
                *pause = Some(Instant::now() + delay);
            }
            Schedule::Halt => {
                *ticker = None;
                *pause = None;
            }
        }
    }

    fn handle_command(&mut self, cmd: RoomCommand) -> Schedule {
        match cmd {
            RoomCommand::Ready(slot) => self.on_ready(slot),
            RoomCommand::Move(slot, direction) => {
                if self.phase == RoomPhase::Running && *self.connected.get(slot) {
                    self.pending.insert(slot, direction);
                }
                Schedule::Unchanged
            }
            RoomCommand::Leave(slot) => self.on_leave(slot),
        }
    }

    fn on_ready(&mut self, slot: Slot) -> Schedule {
        if !*self.connected.get(slot) {
            return Schedule::Unchanged;
        }
        match self.phase {
            RoomPhase::Running | RoomPhase::MatchComplete => {
                debug!(room_id = %self.id, slot = %slot, phase = ?self.phase, "Ready ignored");
                Schedule::Unchanged
            }
            RoomPhase::GameOver => {
                self.ready.insert(slot);
                Schedule::Unchanged
            }
            RoomPhase::AwaitingReady => {
                self.ready.insert(slot);
                if self.ready.len() < 2 {
                    self.occupants
                        .get(slot)
                        .conn
                        .send(ServerMsg::waiting("Waiting for opponent to be ready..."));
                    Schedule::Unchanged
                } else {
                    self.try_start_game()
                }
            }
        }
    }

    fn try_start_game(&mut self) -> Schedule {
        match self.phase {
            RoomPhase::AwaitingReady => {}
            RoomPhase::Running => {
                warn!(room_id = %self.id, "Start requested while a game is running, ignoring");
                return Schedule::Unchanged;
            }
            RoomPhase::GameOver | RoomPhase::MatchComplete => {
                debug!(room_id = %self.id, phase = ?self.phase, "Start ignored");
                return Schedule::Unchanged;
            }
        }
        if let Some(leader) = self.scores.leader(self.config.points_to_win) {
            warn!(room_id = %self.id, slot = %leader, "Match already decided, not starting");
            return Schedule::Unchanged;
        }
        if self.ready.len() < 2 {
            return Schedule::Unchanged;
        }

        self.ready.clear();
        self.pending.clear();
        self.spawner.restart();
        self.game = Some(Game::new(self.config.grid));
        self.phase = RoomPhase::Running;

        info!(
            room_id = %self.id,
            wins_1 = self.scores.one,
            wins_2 = self.scores.two,
            "Game started"
        );
        self.broadcast(ServerMsg::Start {
            room_id: self.id,
            mode: "two_player".to_string(),
            wins: self.scores,
            names: self.names(),
            points_to_win: self.config.points_to_win,
        });
        self.publish(None);
        Schedule::Tick
    }

    fn on_tick(&mut self) -> Schedule {
        if self.phase != RoomPhase::Running {
            error!(room_id = %self.id, phase = ?self.phase, "Tick fired while not running");
            return Schedule::Halt;
        }
        let Some(game) = self.game.as_mut() else {
            error!(room_id = %self.id, "Tick fired without a game");
            return Schedule::Halt;
        };

        let pending = std::mem::take(&mut self.pending);
        let outcome = game.step(&pending);
        if !outcome.is_over() {
            let occupied: Vec<_> = game.occupied().collect();
            self.spawner.tick(game.grid, occupied, &mut game.foods);
        }
        let snapshot = self.snapshots.build(game);

        self.broadcast(ServerMsg::State {
            room_id: self.id,
            game: snapshot.clone(),
            wins: self.scores,
            names: self.names(),
        });
        self.publish(Some(snapshot));

        match outcome {
            Outcome::Continue => Schedule::Unchanged,
            _ => self.finish_game(outcome.winner()),
        }
    }

    fn finish_game(&mut self, winner: Option<Slot>) -> Schedule {
        if let Some(slot) = winner {
            let score = self.scores.get_mut(slot);
            if *score >= self.config.points_to_win {
                error!(room_id = %self.id, slot = %slot, "Score already at target, not incrementing");
            } else {
                *score += 1;
            }
        }

        self.phase = RoomPhase::GameOver;
        self.ready.clear();
        self.pending.clear();

        info!(
            room_id = %self.id,
            winner = ?winner.map(Slot::number),
            wins_1 = self.scores.one,
            wins_2 = self.scores.two,
            "Game over"
        );
        self.broadcast(ServerMsg::GameOver {
            room_id: self.id,
            winner,
            wins: self.scores,
            names: self.names(),
            points_to_win: self.config.points_to_win,
        });

        if let Some(champion) = self.scores.leader(self.config.points_to_win) {
            return self.complete_match(champion, false);
        }
        self.publish_current();
        Schedule::Pause(self.config.game_over_pause)
    }

    fn on_pause_elapsed(&mut self) -> Schedule {
        if self.phase != RoomPhase::GameOver {
            return Schedule::Halt;
        }
        self.phase = RoomPhase::AwaitingReady;
        self.publish_current();
        match self.try_start_game() {
            Schedule::Tick => Schedule::Tick,
            _ => Schedule::Halt,
        }
    }

    fn on_leave(&mut self, slot: Slot) -> Schedule {
        if !*self.connected.get(slot) {
            return Schedule::Unchanged;
        }
        *self.connected.get_mut(slot) = false;
        self.ready.remove(&slot);
        info!(room_id = %self.id, slot = %slot, "Player left the room");

        if self.phase == RoomPhase::MatchComplete {
            return Schedule::Unchanged;
        }

        let winner = slot.opponent();
        *self.scores.get_mut(winner) = self.config.points_to_win;

        if self.phase == RoomPhase::Running {
            if let Some(game) = self.game.as_mut() {
                game.forfeit(winner);
            }
            self.broadcast(ServerMsg::GameOver {
                room_id: self.id,
                winner: Some(winner),
                wins: self.scores,
                names: self.names(),
                points_to_win: self.config.points_to_win,
            });
        }
        self.complete_match(winner, true)
    }

    fn complete_match(&mut self, winner: Slot, forfeit: bool) -> Schedule {
        self.phase = RoomPhase::MatchComplete;
        self.game = None;
        self.pending.clear();
        self.ready.clear();

        let name = self.occupants.get(winner).name.clone();
        info!(
            room_id = %self.id,
            winner = %name,
            wins_1 = self.scores.one,
            wins_2 = self.scores.two,
            forfeit,
            "Match complete"
        );
        self.broadcast(ServerMsg::MatchComplete {
            room_id: self.id,
            winner: SeatRef {
                player_id: winner,
                name,
            },
            final_score: self.scores,
            forfeit,
        });
        self.publish_current();

        if !self.reported {
            self.reported = true;
            let report = MatchReport {
                room_id: self.id,
                players: self.occupants.map(|o| o.player),
                winner,
                scores: self.scores,
                forfeit,
                finished_at: Instant::now(),
            };
            if self.events.send(RoomEvent::MatchComplete(report)).is_err() {
                warn!(room_id = %self.id, "Competition is gone, match result dropped");
            }
        }
        Schedule::Halt
    }

    /// Tell each occupant who they are facing
    fn announce(&self) {
        for slot in Slot::BOTH {
            let opponent = self.occupants.get(slot.opponent()).name.clone();
            self.occupants.get(slot).conn.send(ServerMsg::MatchAssigned {
                room_id: self.id,
                arena: self.arena,
                player_id: slot,
                opponent,
                points_to_win: self.config.points_to_win,
            });
        }
    }

    fn broadcast(&self, msg: ServerMsg) {
        for slot in Slot::BOTH {
            if *self.connected.get(slot) {
                self.occupants.get(slot).conn.send(msg.clone());
            }
        }
        // no observers is fine
        let _ = self.updates.send(msg);
    }

    fn names(&self) -> Names {
        self.occupants.map(|o| o.name.clone())
    }

    fn publish_current(&self) {
        let latest = self.summary.read().latest.clone();
        self.publish(latest);
    }

    fn publish(&self, latest: Option<GameSnapshot>) {
        let mut summary = self.summary.write();
        summary.wins = self.scores;
        summary.phase = self.phase;
        summary.game_running = self.phase == RoomPhase::Running;
        summary.match_complete = self.phase == RoomPhase::MatchComplete;
        summary.tick = self.game.as_ref().map_or(summary.tick, |g| g.tick);
        summary.latest = latest;
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn pause_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
