//! Knockout competition: registration, bracket rounds, byes, champion, reset
//!
//! All roster and round state lives behind one async mutex. Anything that
//! also touches the room table takes this lock first.

pub mod bracket;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::bots::BotLauncher;
use crate::config::GameSettings;
use crate::game::{MatchReport, Occupant, RoomConfig, RoomEvent, RoomId, RoomSummary, Scores};
use crate::matchmaking::{Intent, RoomError, RoomManager, RouteError};
use crate::ws::connection::{
    ConnectionHandle, ConnectionId, ConnectionRegistry, CLOSE_ELIMINATED, CLOSE_RESET,
};
use crate::ws::protocol::{PairingInfo, PlayerRef, ServerMsg};

use bracket::ByeCandidate;

/// Names starting with this are treated as bots
const BOT_NAME_PREFIX: &str = "CopperBot";

/// Competitor id, shown as `P<n>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(into = "String")]
pub struct PlayerId(pub u32);

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

impl From<PlayerId> for String {
    fn from(id: PlayerId) -> Self {
        id.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompetitionState {
    WaitingForPlayers,
    InProgress,
    Complete,
    Resetting,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("Competition not accepting players (in progress)")]
    NotAccepting,

    #[error("Competition is full")]
    Full,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AddBotError {
    #[error("Competition not accepting players (in progress)")]
    NotAccepting,

    #[error("All player slots filled")]
    Full,

    #[error("Bot could not be launched")]
    LaunchFailed,
}

#[derive(Debug, thiserror::Error)]
pub enum CompetitionError {
    #[error("player {0} missing from roster")]
    MissingPlayer(PlayerId),

    #[error("odd survivors but no bye candidate")]
    NoByeCandidate,

    #[error("no round in progress")]
    NoRound,

    #[error(transparent)]
    Room(#[from] RoomError),
}

/// A registered competitor
#[derive(Debug, Clone)]
pub struct Player {
    pub id: PlayerId,
    pub name: String,
    pub conn: ConnectionHandle,
    pub is_bot: bool,
    pub match_wins: u32,
    /// Points scored in this round's match
    pub round_points: u32,
    /// When this round's match finished
    pub completed_at: Option<Instant>,
    pub room: Option<RoomId>,
}

impl Player {
    fn new(id: PlayerId, name: String, conn: ConnectionHandle) -> Self {
        Self {
            id,
            is_bot: name.starts_with(BOT_NAME_PREFIX),
            name,
            conn,
            match_wins: 0,
            round_points: 0,
            completed_at: None,
            room: None,
        }
    }

    fn reference(&self) -> PlayerRef {
        PlayerRef {
            uid: self.id,
            name: self.name.clone(),
        }
    }

    fn occupant(&self) -> Occupant {
        Occupant {
            player: self.id,
            name: self.name.clone(),
            conn: self.conn.clone(),
            ready: false,
        }
    }
}

#[derive(Debug, Clone)]
struct PairingOutcome {
    winner: Option<PlayerId>,
}

#[derive(Debug, Clone)]
struct Pairing {
    arena: u32,
    players: [PlayerRef; 2],
    room: Option<RoomId>,
    outcome: Option<PairingOutcome>,
}

#[derive(Debug, Clone)]
struct Round {
    number: u32,
    pairings: Vec<Pairing>,
    bye: Option<PlayerRef>,
}

impl Round {
    fn decided(&self) -> bool {
        self.pairings.iter().all(|p| p.outcome.is_some())
    }

    fn winners(&self) -> impl Iterator<Item = PlayerId> + '_ {
        self.pairings
            .iter()
            .filter_map(|p| p.outcome.as_ref().and_then(|o| o.winner))
            .chain(self.bye.as_ref().map(|b| b.uid))
    }

    fn info(&self) -> Vec<PairingInfo> {
        self.pairings
            .iter()
            .map(|p| PairingInfo {
                arena: p.arena,
                players: p.players.clone(),
                room_id: p.room,
                winner: p.outcome.as_ref().and_then(|o| o.winner),
            })
            .collect()
    }
}

/// A past champion, kept for the life of the process
#[derive(Debug, Clone, Serialize)]
pub struct ChampionRecord {
    pub champion: String,
    pub players: usize,
    pub timestamp: DateTime<Utc>,
}

/// Point-in-time view for queries
#[derive(Debug, Clone, Serialize)]
pub struct CompetitionStatus {
    pub state: CompetitionState,
    pub round: u32,
    pub total_rounds: u32,
    pub players: usize,
    pub required: usize,
    pub connected: usize,
    pub champion: Option<String>,
    pub points_to_win: u32,
    pub bye_player: Option<String>,
    /// Seconds until the next competition opens
    pub reset_in: Option<u64>,
    pub pairings: Vec<PairingInfo>,
    pub rooms: Vec<RoomSummary>,
}

struct Inner {
    state: CompetitionState,
    roster: BTreeMap<PlayerId, Player>,
    rounds: Vec<Round>,
    champion: Option<PlayerRef>,
    entrants: usize,
    /// Ids are never reused, so late events from old connections cannot hit new players
    next_uid: u32,
    /// Bumped on every reset; timers from an older epoch do nothing
    epoch: u64,
    reset_at: Option<Instant>,
}

/// The competition service
pub struct Competition {
    inner: Mutex<Inner>,
    settings: RwLock<Arc<GameSettings>>,
    rooms: Arc<RoomManager>,
    connections: Arc<ConnectionRegistry>,
    bots: Arc<dyn BotLauncher>,
    history: RwLock<Vec<ChampionRecord>>,
    rng: parking_lot::Mutex<ChaCha8Rng>,
}

impl Competition {
    pub fn new(
        settings: GameSettings,
        rooms: Arc<RoomManager>,
        connections: Arc<ConnectionRegistry>,
        bots: Arc<dyn BotLauncher>,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: CompetitionState::WaitingForPlayers,
                roster: BTreeMap::new(),
                rounds: Vec::new(),
                champion: None,
                entrants: 0,
                next_uid: 0,
                epoch: 0,
                reset_at: None,
            }),
            settings: RwLock::new(Arc::new(settings)),
            rooms,
            connections,
            bots,
            history: RwLock::new(Vec::new()),
            rng: parking_lot::Mutex::new(ChaCha8Rng::from_entropy()),
        }
    }

    pub fn settings(&self) -> Arc<GameSettings> {
        self.settings.read().clone()
    }

    /// Open registration and launch the configured bots
    pub fn open(&self) {
        let settings = self.settings();
        info!(
            arenas = settings.arenas,
            required = settings.required_players(),
            points_to_win = settings.points_to_win,
            "Competition waiting for players"
        );
        self.bots.launch(settings.bots);
    }

    /// Stop bot processes on the way out
    pub fn shutdown(&self) {
        self.bots.terminate_all();
    }

    /// Drain match results from the rooms
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<RoomEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                RoomEvent::MatchComplete(report) => self.record_result(report).await,
            }
        }
        info!("Room event channel closed");
    }

    // ========================================================================
    // Connection-facing operations
    // ========================================================================

    pub async fn register(
        self: &Arc<Self>,
        name: Option<String>,
        conn: ConnectionHandle,
    ) -> Result<PlayerId, RegistrationError> {
        let settings = self.settings();
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        if inner.state != CompetitionState::WaitingForPlayers {
            return Err(RegistrationError::NotAccepting);
        }
        let required = settings.required_players();
        if inner.roster.len() >= required {
            return Err(RegistrationError::Full);
        }

        inner.next_uid += 1;
        let id = PlayerId(inner.next_uid);
        let name = clean_name(name).unwrap_or_else(|| format!("Player {}", id.0));
        let player = Player::new(id, name.clone(), conn.clone());
        let is_bot = player.is_bot;
        inner.roster.insert(id, player);

        conn.send(ServerMsg::Joined {
            uid: id,
            name: name.clone(),
        });
        info!(
            player = %id,
            name = %name,
            bot = is_bot,
            registered = inner.roster.len(),
            required,
            "Player registered"
        );
        self.broadcast_lobby(inner, required);

        if inner.roster.len() == required {
            if let Err(e) = self.start(inner, &settings).await {
                self.recover(inner, e).await;
            }
        }
        Ok(id)
    }

    /// Ready signal from a registered player. Optionally renames them while in the lobby.
    pub async fn ready(self: &Arc<Self>, player: PlayerId, name: Option<String>, conn: &ConnectionHandle) {
        let settings = self.settings();
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        if let Some(name) = clean_name(name) {
            if inner.state == CompetitionState::WaitingForPlayers {
                if let Some(entry) = inner.roster.get_mut(&player) {
                    if entry.name != name {
                        info!(player = %player, old = %entry.name, new = %name, "Player renamed");
                        entry.is_bot = name.starts_with(BOT_NAME_PREFIX);
                        entry.name = name;
                        self.broadcast_lobby(inner, settings.required_players());
                    }
                }
            }
        }

        match self.rooms.route(conn, Intent::Ready(player)).await {
            Ok(room_id) => debug!(player = %player, room_id = %room_id, "Ready forwarded"),
            Err(RouteError::NotSeated) => {
                let message = match inner.state {
                    CompetitionState::WaitingForPlayers => format!(
                        "Waiting for players ({}/{})",
                        inner.roster.len(),
                        settings.required_players()
                    ),
                    CompetitionState::InProgress => "Waiting for your next match...".to_string(),
                    _ => "Waiting for the next competition...".to_string(),
                };
                conn.send(ServerMsg::waiting(message));
            }
            Err(e) => {
                conn.send(ServerMsg::error(e.to_string()));
            }
        }
    }

    /// A player's connection closed
    pub async fn disconnect(self: &Arc<Self>, player: PlayerId, conn_id: ConnectionId) {
        let settings = self.settings();
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        let Some(entry) = inner.roster.get(&player) else {
            return;
        };
        if entry.conn.id() != conn_id {
            return;
        }
        let conn = entry.conn.clone();

        match inner.state {
            CompetitionState::InProgress => {
                match self.rooms.route(&conn, Intent::Leave(player)).await {
                    Ok(room_id) => {
                        info!(player = %player, room_id = %room_id, "Player disconnected mid-match, forfeiting")
                    }
                    Err(_) => info!(player = %player, "Player disconnected between matches, leaving bracket"),
                }
                inner.roster.remove(&player);
                self.rooms.release_player(player);
            }
            CompetitionState::WaitingForPlayers => {
                inner.roster.remove(&player);
                self.rooms.release_player(player);
                info!(player = %player, registered = inner.roster.len(), "Player left the lobby");
                self.broadcast_lobby(inner, settings.required_players());
            }
            CompetitionState::Complete | CompetitionState::Resetting => {
                inner.roster.remove(&player);
                self.rooms.release_player(player);
                debug!(player = %player, "Player disconnected after the competition");
            }
        }
    }

    /// Swap in new settings and restart the competition
    /// Launch one bot into an open lobby slot. Returns the difficulty used.
    pub async fn add_bot(&self, difficulty: Option<u32>) -> Result<u32, AddBotError> {
        let required = self.settings().required_players();
        {
            let inner = self.inner.lock().await;
            if inner.state != CompetitionState::WaitingForPlayers {
                return Err(AddBotError::NotAccepting);
            }
            if inner.roster.len() >= required {
                return Err(AddBotError::Full);
            }
        }

        let difficulty = self
            .bots
            .launch_one(difficulty)
            .ok_or(AddBotError::LaunchFailed)?;
        info!(difficulty, "Bot added on request");
        Ok(difficulty)
    }

    pub async fn reload(self: &Arc<Self>, settings: GameSettings) {
        let mut guard = self.inner.lock().await;
        self.replace_settings(settings);
        self.reset_locked(&mut guard, "settings reloaded").await;
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn status(&self) -> CompetitionStatus {
        let settings = self.settings();
        let inner = self.inner.lock().await;
        let rooms = self.rooms.active_rooms().await;

        let current = inner.rounds.last();
        let bracket_size = if inner.entrants > 0 {
            inner.entrants
        } else {
            settings.required_players()
        };

        CompetitionStatus {
            state: inner.state,
            round: current.map_or(0, |r| r.number),
            total_rounds: bracket::total_rounds(bracket_size),
            players: inner.roster.len(),
            required: settings.required_players(),
            connected: inner.roster.values().filter(|p| !p.conn.is_closed()).count(),
            champion: inner.champion.as_ref().map(|c| c.name.clone()),
            points_to_win: settings.points_to_win,
            bye_player: current.and_then(|r| r.bye.as_ref()).map(|b| b.name.clone()),
            reset_in: inner
                .reset_at
                .map(|at| at.saturating_duration_since(Instant::now()).as_secs()),
            pairings: current.map(Round::info).unwrap_or_default(),
            rooms,
        }
    }

    pub fn history(&self) -> Vec<ChampionRecord> {
        self.history.read().clone()
    }

    // ========================================================================
    // Bracket progression
    // ========================================================================

    async fn start(self: &Arc<Self>, inner: &mut Inner, settings: &GameSettings) -> Result<(), CompetitionError> {
        inner.state = CompetitionState::InProgress;
        inner.entrants = inner.roster.len();

        let ids: Vec<PlayerId> = inner.roster.keys().copied().collect();
        let pairs = self.shuffle_pairs(ids);
        let round = build_round(inner, 1, &pairs, None)?;

        info!(
            players = inner.entrants,
            total_rounds = bracket::total_rounds(inner.entrants),
            "Competition started"
        );
        for pairing in &round.pairings {
            info!(
                round = 1,
                arena = pairing.arena,
                player_1 = %pairing.players[0].name,
                player_2 = %pairing.players[1].name,
                "Pairing"
            );
        }
        inner.rounds.push(round);
        self.broadcast_status(inner);

        self.open_rooms(inner, settings).await?;
        self.settle(inner, settings).await
    }

    /// Record a finished match and move the bracket on if the round is done
    async fn record_result(self: &Arc<Self>, report: MatchReport) {
        let settings = self.settings();
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        if inner.state != CompetitionState::InProgress {
            debug!(room_id = %report.room_id, "Match result outside a running competition, ignoring");
            return;
        }
        let Some(round) = inner.rounds.last_mut() else {
            return;
        };
        let round_number = round.number;
        let Some(pairing) = round
            .pairings
            .iter_mut()
            .find(|p| p.room == Some(report.room_id) && p.outcome.is_none())
        else {
            debug!(room_id = %report.room_id, "Stale match result, ignoring");
            return;
        };

        let winner = report.winner_id();
        let loser = report.loser_id();
        let winner_present = inner.roster.contains_key(&winner);
        pairing.outcome = Some(PairingOutcome {
            winner: winner_present.then_some(winner),
        });

        if let Some(entry) = inner.roster.get_mut(&winner) {
            entry.match_wins += 1;
            entry.round_points = *report.scores.get(report.winner);
            entry.completed_at = Some(report.finished_at);
            entry.room = None;
            info!(
                round = round_number,
                room_id = %report.room_id,
                winner = %entry.name,
                score = %format_score(&report.scores),
                forfeit = report.forfeit,
                "Match decided"
            );
        } else {
            warn!(room_id = %report.room_id, player = %winner, "Match winner already left");
        }

        if let Some(eliminated) = inner.roster.remove(&loser) {
            info!(player = %loser, name = %eliminated.name, "Player eliminated");
            eliminated
                .conn
                .close(CLOSE_ELIMINATED, "Eliminated from competition");
        }
        self.rooms.release_player(loser);
        self.rooms.finish_room(report.room_id).await;
        self.broadcast_status(inner);

        if let Err(e) = self.settle(inner, &settings).await {
            self.recover(inner, e).await;
        }
    }

    /// Advance through every round that is already decided
    async fn settle(self: &Arc<Self>, inner: &mut Inner, settings: &GameSettings) -> Result<(), CompetitionError> {
        loop {
            if inner.state != CompetitionState::InProgress {
                return Ok(());
            }
            match inner.rounds.last() {
                Some(round) if round.decided() => {}
                _ => return Ok(()),
            }
            if !self.advance_round(inner, settings).await? {
                return Ok(());
            }

            let delay = settings.round_delay();
            if delay.is_zero() {
                self.open_rooms(inner, settings).await?;
            } else {
                let round = inner.rounds.last().map_or(0, |r| r.number);
                self.schedule_round_open(inner.epoch, round, delay);
                return Ok(());
            }
        }
    }

    /// Close out a decided round. Returns false once a champion is crowned.
    async fn advance_round(self: &Arc<Self>, inner: &mut Inner, settings: &GameSettings) -> Result<bool, CompetitionError> {
        let finished = inner.rounds.last().ok_or(CompetitionError::NoRound)?;
        let number = finished.number;
        let survivors: Vec<PlayerId> = finished
            .winners()
            .filter(|id| inner.roster.contains_key(id))
            .collect();

        self.rooms.clear_all().await;
        info!(round = number, survivors = survivors.len(), "Round complete");

        if survivors.len() <= 1 {
            self.crown(inner, settings, survivors.first().copied());
            return Ok(false);
        }

        let (contenders, bye) = if survivors.len() % 2 == 1 {
            let candidates: Vec<ByeCandidate> = survivors
                .iter()
                .filter_map(|id| inner.roster.get(id))
                .map(|p| ByeCandidate {
                    player: p.id,
                    points: p.round_points,
                    completed_at: p.completed_at,
                })
                .collect();
            let bye = self.pick_bye(&candidates).ok_or(CompetitionError::NoByeCandidate)?;
            let rest = survivors.into_iter().filter(|id| *id != bye).collect();
            (rest, Some(bye))
        } else {
            (survivors, None)
        };

        for player in inner.roster.values_mut() {
            player.round_points = 0;
            player.completed_at = None;
            player.room = None;
        }

        let pairs = self.shuffle_pairs(contenders);
        let round = build_round(inner, number + 1, &pairs, bye)?;
        if let Some(bye) = &round.bye {
            info!(round = round.number, player = %bye.name, "Bye awarded");
            self.connections.broadcast(&ServerMsg::ByePlayer {
                round: round.number,
                player: bye.clone(),
            });
        }
        info!(round = round.number, matches = round.pairings.len(), "Next round drawn");
        inner.rounds.push(round);
        self.broadcast_status(inner);
        Ok(true)
    }

    /// Create rooms for the current round. Pairings missing a player become walkovers.
    async fn open_rooms(&self, inner: &mut Inner, settings: &GameSettings) -> Result<(), CompetitionError> {
        let Some(round) = inner.rounds.last() else {
            return Ok(());
        };
        let number = round.number;
        let waiting: Vec<(usize, u32, PlayerId, PlayerId)> = round
            .pairings
            .iter()
            .enumerate()
            .filter(|(_, p)| p.room.is_none() && p.outcome.is_none())
            .map(|(i, p)| (i, p.arena, p.players[0].uid, p.players[1].uid))
            .collect();

        for (index, arena, first, second) in waiting {
            let occupants = (
                inner.roster.get(&first).map(Player::occupant),
                inner.roster.get(&second).map(Player::occupant),
            );
            let walkover = match occupants {
                (Some(a), Some(b)) => {
                    let config = RoomConfig::from_settings(settings, self.next_seed());
                    let room_id = self.rooms.create_room(arena, a, b, config).await?;
                    for id in [first, second] {
                        if let Some(player) = inner.roster.get_mut(&id) {
                            player.room = Some(room_id);
                        }
                    }
                    if let Some(pairing) = pairing_mut(inner, index) {
                        pairing.room = Some(room_id);
                    }
                    continue;
                }
                (Some(_), None) => Some(first),
                (None, Some(_)) => Some(second),
                (None, None) => None,
            };

            if let Some(id) = walkover {
                if let Some(player) = inner.roster.get_mut(&id) {
                    player.match_wins += 1;
                    player.round_points = 0;
                    player.completed_at = Some(Instant::now());
                }
            }
            info!(round = number, arena, winner = ?walkover.map(|id| id.to_string()), "Walkover");
            if let Some(pairing) = pairing_mut(inner, index) {
                pairing.outcome = Some(PairingOutcome { winner: walkover });
            }
        }
        Ok(())
    }

    fn crown(self: &Arc<Self>, inner: &mut Inner, settings: &GameSettings, champion: Option<PlayerId>) {
        inner.state = CompetitionState::Complete;
        let delay = settings.reset_delay();
        inner.reset_at = Some(Instant::now() + delay);

        let champion = champion.and_then(|id| inner.roster.get(&id)).map(Player::reference);
        match &champion {
            Some(winner) => {
                info!(champion = %winner.name, entrants = inner.entrants, "Champion crowned");
                self.history.write().push(ChampionRecord {
                    champion: winner.name.clone(),
                    players: inner.entrants,
                    timestamp: Utc::now(),
                });
            }
            None => warn!("Competition ended without a champion"),
        }
        inner.champion = champion.clone();

        self.connections.broadcast(&ServerMsg::CompetitionComplete {
            champion,
            reset_in: settings.reset_delay,
        });
        self.schedule_reset(inner.epoch, delay);
    }

    // ========================================================================
    // Reset and timers
    // ========================================================================

    async fn reset_locked(&self, inner: &mut Inner, reason: &str) {
        info!(reason, epoch = inner.epoch, "Resetting competition");
        inner.state = CompetitionState::Resetting;
        inner.epoch += 1;

        self.rooms.reset().await;
        for player in std::mem::take(&mut inner.roster).into_values() {
            player.conn.close(CLOSE_RESET, "Competition reset");
        }
        inner.rounds.clear();
        inner.champion = None;
        inner.entrants = 0;
        inner.reset_at = None;
        inner.state = CompetitionState::WaitingForPlayers;

        self.bots.terminate_all();
        self.open();
    }

    async fn recover(&self, inner: &mut Inner, err: CompetitionError) {
        error!(error = %err, "Competition invariant violated, forcing reset");
        self.reset_locked(inner, "invariant violation").await;
    }

    fn schedule_reset(self: &Arc<Self>, epoch: u64, delay: Duration) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            sleep(delay).await;
            let mut guard = this.inner.lock().await;
            if guard.epoch != epoch {
                debug!(epoch, "Stale reset timer");
                return;
            }
            this.reset_locked(&mut guard, "reset delay elapsed").await;
        });
    }

    fn schedule_round_open(self: &Arc<Self>, epoch: u64, round: u32, delay: Duration) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            sleep(delay).await;
            let settings = this.settings();
            let mut guard = this.inner.lock().await;
            let inner = &mut *guard;

            let current = inner.rounds.last().map(|r| r.number);
            if inner.epoch != epoch
                || inner.state != CompetitionState::InProgress
                || current != Some(round)
            {
                debug!(epoch, round, "Stale round timer");
                return;
            }

            info!(round, "Opening round");
            let opened = match this.open_rooms(inner, &settings).await {
                Ok(()) => this.settle(inner, &settings).await,
                Err(e) => Err(e),
            };
            if let Err(e) = opened {
                this.recover(inner, e).await;
            }
        });
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn replace_settings(&self, settings: GameSettings) {
        *self.settings.write() = Arc::new(settings);
    }

    fn next_seed(&self) -> u64 {
        self.rng.lock().gen()
    }

    fn shuffle_pairs(&self, players: Vec<PlayerId>) -> Vec<(PlayerId, PlayerId)> {
        let (pairs, leftover) = bracket::pair_shuffled(players, &mut *self.rng.lock());
        if let Some(id) = leftover {
            error!(player = %id, "Odd player left unpaired");
        }
        pairs
    }

    fn pick_bye(&self, candidates: &[ByeCandidate]) -> Option<PlayerId> {
        bracket::select_bye(candidates, &mut *self.rng.lock())
    }

    fn broadcast_lobby(&self, inner: &Inner, required: usize) {
        let msg = ServerMsg::LobbyStatus {
            players: inner.roster.values().map(Player::reference).collect(),
            current: inner.roster.len(),
            required,
        };
        for player in inner.roster.values() {
            player.conn.send(msg.clone());
        }
    }

    fn broadcast_status(&self, inner: &Inner) {
        let Some(round) = inner.rounds.last() else {
            return;
        };
        self.connections.broadcast(&ServerMsg::CompetitionStatus {
            state: inner.state,
            round: round.number,
            total_rounds: bracket::total_rounds(inner.entrants),
            pairings: round.info(),
            bye: round.bye.clone(),
        });
    }

    #[cfg(test)]
    fn with_seed(self, seed: u64) -> Self {
        *self.rng.lock() = ChaCha8Rng::seed_from_u64(seed);
        self
    }
}

fn build_round(
    inner: &Inner,
    number: u32,
    pairs: &[(PlayerId, PlayerId)],
    bye: Option<PlayerId>,
) -> Result<Round, CompetitionError> {
    let reference = |id: PlayerId| {
        inner
            .roster
            .get(&id)
            .map(Player::reference)
            .ok_or(CompetitionError::MissingPlayer(id))
    };

    let pairings = pairs
        .iter()
        .zip(1u32..)
        .map(|((a, b), arena)| {
            Ok(Pairing {
                arena,
                players: [reference(*a)?, reference(*b)?],
                room: None,
                outcome: None,
            })
        })
        .collect::<Result<Vec<_>, CompetitionError>>()?;

    Ok(Round {
        number,
        pairings,
        bye: bye.map(reference).transpose()?,
    })
}

fn pairing_mut(inner: &mut Inner, index: usize) -> Option<&mut Pairing> {
    inner.rounds.last_mut().and_then(|r| r.pairings.get_mut(index))
}

fn clean_name(name: Option<String>) -> Option<String> {
    name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty())
}

fn format_score(scores: &Scores) -> String {
    format!("{}-{}", scores.one, scores.two)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bots::NoBots;
    use crate::game::{PerSlot, Slot};
    use crate::ws::connection::{Outbound, Outbox};

    struct Entrant {
        id: PlayerId,
        conn: ConnectionHandle,
        rx: Outbox,
    }

    fn settings(arenas: u32) -> GameSettings {
        GameSettings {
            arenas,
            points_to_win: 3,
            round_delay: 0.0,
            reset_delay: 10,
            max_fruits: 0,
            ..GameSettings::default()
        }
    }

    fn competition(settings: GameSettings) -> (Arc<Competition>, mpsc::UnboundedReceiver<RoomEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let rooms = Arc::new(RoomManager::new(tx));
        let connections = Arc::new(ConnectionRegistry::new());
        let competition = Competition::new(settings, rooms, connections, Arc::new(NoBots)).with_seed(3);
        (Arc::new(competition), rx)
    }

    async fn join(competition: &Arc<Competition>, name: &str) -> Entrant {
        let (conn, rx) = ConnectionHandle::new(1024);
        competition.connections.insert(conn.clone());
        let id = competition
            .register(Some(name.to_string()), conn.clone())
            .await
            .expect("registration accepted");
        Entrant { id, conn, rx }
    }

    fn report(pairing: &PairingInfo, winner: Slot, winner_points: u32) -> MatchReport {
        let mut scores = Scores::default();
        *scores.get_mut(winner) = winner_points;
        MatchReport {
            room_id: pairing.room_id.expect("room opened"),
            players: PerSlot::new(pairing.players[0].uid, pairing.players[1].uid),
            winner,
            scores,
            forfeit: false,
            finished_at: Instant::now(),
        }
    }

    fn received(rx: &mut Outbox) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_until_bracket_is_full() {
        let (competition, _events) = competition(settings(4));
        let mut first = join(&competition, "Ada").await;
        for name in ["Bo", "Cy", "Di", "Ed"] {
            join(&competition, name).await;
        }

        let status = competition.status().await;
        assert_eq!(status.state, CompetitionState::WaitingForPlayers);
        assert_eq!(status.players, 5);
        assert_eq!(status.required, 8);
        assert_eq!(status.total_rounds, 3);
        assert!(status.rooms.is_empty());

        let messages = received(&mut first.rx);
        assert!(matches!(
            messages.first(),
            Some(Outbound::Msg(ServerMsg::Joined { uid, .. })) if *uid == first.id
        ));
        assert!(matches!(
            messages.last(),
            Some(Outbound::Msg(ServerMsg::LobbyStatus { current: 5, required: 8, .. }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_bracket_starts_and_rejects_latecomers() {
        let (competition, _events) = competition(settings(1));
        let mut a = join(&competition, "Ada").await;
        join(&competition, "Bo").await;

        let status = competition.status().await;
        assert_eq!(status.state, CompetitionState::InProgress);
        assert_eq!(status.round, 1);
        assert_eq!(status.pairings.len(), 1);
        assert!(status.pairings[0].room_id.is_some());
        assert_eq!(status.rooms.len(), 1);

        let (late, _rx) = ConnectionHandle::new(16);
        assert_eq!(
            competition.register(Some("Late".into()), late).await,
            Err(RegistrationError::NotAccepting)
        );

        let messages = received(&mut a.rx);
        assert!(messages
            .iter()
            .any(|m| matches!(m, Outbound::Msg(ServerMsg::CompetitionStatus { round: 1, .. }))));
    }

    #[derive(Default)]
    struct RecordingBots {
        requested: parking_lot::Mutex<Vec<Option<u32>>>,
    }

    impl BotLauncher for RecordingBots {
        fn launch_one(&self, difficulty: Option<u32>) -> Option<u32> {
            self.requested.lock().push(difficulty);
            Some(difficulty.unwrap_or(7))
        }

        fn terminate_all(&self) {}
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_bot_only_while_lobby_has_room() {
        let (tx, _events) = mpsc::unbounded_channel();
        let bots = Arc::new(RecordingBots::default());
        let competition = Arc::new(Competition::new(
            settings(1),
            Arc::new(RoomManager::new(tx)),
            Arc::new(ConnectionRegistry::new()),
            bots.clone(),
        ));

        assert_eq!(competition.add_bot(Some(3)).await, Ok(3));
        assert_eq!(competition.add_bot(None).await, Ok(7));
        assert_eq!(*bots.requested.lock(), vec![Some(3), None]);

        join(&competition, "Ada").await;
        join(&competition, "Bo").await;
        assert_eq!(competition.add_bot(Some(5)).await, Err(AddBotError::NotAccepting));
        assert_eq!(bots.requested.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_bot_without_launcher_fails() {
        let (competition, _events) = competition(settings(2));
        assert_eq!(competition.add_bot(None).await, Err(AddBotError::LaunchFailed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_odd_survivors_get_one_bye() {
        let (competition, _events) = competition(settings(5));
        let mut entrants = Vec::new();
        for n in 0..10 {
            entrants.push(join(&competition, &format!("Player{n}")).await);
        }
        let round_one = competition.status().await;
        assert_eq!(round_one.pairings.len(), 5);
        assert_eq!(round_one.total_rounds, 4);

        // the arena 3 winner scores most and earns the bye
        for pairing in &round_one.pairings {
            let points = if pairing.arena == 3 { 3 } else { 2 };
            competition.record_result(report(pairing, Slot::One, points)).await;
        }
        let expected_bye = round_one.pairings[2].players[0].name.clone();

        let round_two = competition.status().await;
        assert_eq!(round_two.state, CompetitionState::InProgress);
        assert_eq!(round_two.round, 2);
        assert_eq!(round_two.pairings.len(), 2);
        assert!(round_two.pairings.iter().all(|p| p.room_id.is_some()));
        assert_eq!(round_two.bye_player, Some(expected_bye));
        assert_eq!(round_two.players, 5);

        // losers are closed out
        let loser = round_one.pairings[0].players[1].uid;
        let loser_rx = &mut entrants.iter_mut().find(|e| e.id == loser).unwrap().rx;
        assert!(received(loser_rx)
            .iter()
            .any(|m| matches!(m, Outbound::Close { code: CLOSE_ELIMINATED, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bye_tie_goes_to_earliest_finish() {
        let (competition, _events) = competition(settings(3));
        for n in 0..6 {
            join(&competition, &format!("Player{n}")).await;
        }
        let round_one = competition.status().await;

        // equal points; arena 2 finishes first
        let order = [1usize, 0, 2];
        for index in order {
            competition
                .record_result(report(&round_one.pairings[index], Slot::Two, 3))
                .await;
            tokio::time::advance(Duration::from_secs(1)).await;
        }

        let round_two = competition.status().await;
        assert_eq!(
            round_two.bye_player,
            Some(round_one.pairings[1].players[1].name.clone())
        );
        assert_eq!(round_two.pairings.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_champion_then_reset() {
        let (competition, _events) = competition(settings(1));
        let mut a = join(&competition, "Ada").await;
        let mut b = join(&competition, "Bo").await;

        let status = competition.status().await;
        let pairing = &status.pairings[0];
        let winner_slot = if pairing.players[0].uid == a.id { Slot::One } else { Slot::Two };
        competition.record_result(report(pairing, winner_slot, 3)).await;

        let status = competition.status().await;
        assert_eq!(status.state, CompetitionState::Complete);
        assert_eq!(status.champion.as_deref(), Some("Ada"));
        assert_eq!(status.reset_in, Some(10));
        let history = competition.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].champion, "Ada");
        assert_eq!(history[0].players, 2);

        assert!(received(&mut a.rx).iter().any(|m| matches!(
            m,
            Outbound::Msg(ServerMsg::CompetitionComplete { champion: Some(c), reset_in: 10 }) if c.name == "Ada"
        )));
        assert!(received(&mut b.rx)
            .iter()
            .any(|m| matches!(m, Outbound::Close { code: CLOSE_ELIMINATED, .. })));

        tokio::time::sleep(Duration::from_secs(11)).await;

        let status = competition.status().await;
        assert_eq!(status.state, CompetitionState::WaitingForPlayers);
        assert_eq!(status.players, 0);
        assert_eq!(status.round, 0);
        assert!(received(&mut a.rx)
            .iter()
            .any(|m| matches!(m, Outbound::Close { code: CLOSE_RESET, .. })));
        assert_eq!(competition.history().len(), 1);

        // ids keep counting after a reset
        let next = join(&competition, "Cy").await;
        assert_eq!(next.id, PlayerId(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_results_are_ignored() {
        let (competition, _events) = competition(settings(2));
        for name in ["Ada", "Bo", "Cy", "Di"] {
            join(&competition, name).await;
        }
        let status = competition.status().await;
        let mut stale = report(&status.pairings[0], Slot::One, 3);
        stale.room_id = RoomId(999);
        competition.record_result(stale).await;

        let after = competition.status().await;
        assert_eq!(after.round, 1);
        assert!(after.pairings.iter().all(|p| p.winner.is_none()));
        assert_eq!(after.players, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lobby_disconnect_frees_slot() {
        let (competition, _events) = competition(settings(2));
        let a = join(&competition, "Ada").await;
        let mut b = join(&competition, "Bo").await;

        // a stale connection id for the same player does nothing
        let (other, _rx) = ConnectionHandle::new(4);
        competition.disconnect(a.id, other.id()).await;
        assert_eq!(competition.status().await.players, 2);

        competition.disconnect(a.id, a.conn.id()).await;
        assert_eq!(competition.status().await.players, 1);
        assert!(matches!(
            received(&mut b.rx).last(),
            Some(Outbound::Msg(ServerMsg::LobbyStatus { current: 1, .. }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_mid_match_forfeits() {
        let (competition, mut events) = competition(settings(1));
        let a = join(&competition, "Ada").await;
        let _b = join(&competition, "Bo").await;
        tokio::task::yield_now().await;

        competition.disconnect(a.id, a.conn.id()).await;

        let Some(RoomEvent::MatchComplete(result)) = events.recv().await else {
            panic!("expected forfeit report");
        };
        assert!(result.forfeit);
        assert_eq!(result.loser_id(), a.id);

        competition.record_result(result).await;
        let status = competition.status().await;
        assert_eq!(status.state, CompetitionState::Complete);
        assert_eq!(status.champion.as_deref(), Some("Bo"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_resets_with_new_settings() {
        let (competition, _events) = competition(settings(1));
        let mut a = join(&competition, "Ada").await;

        competition.reload(settings(3)).await;

        let status = competition.status().await;
        assert_eq!(status.state, CompetitionState::WaitingForPlayers);
        assert_eq!(status.players, 0);
        assert_eq!(status.required, 6);
        assert!(received(&mut a.rx)
            .iter()
            .any(|m| matches!(m, Outbound::Close { code: CLOSE_RESET, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_delay_defers_next_round() {
        let mut slow = settings(2);
        slow.round_delay = 5.0;
        let (competition, _events) = competition(slow);
        for name in ["Ada", "Bo", "Cy", "Di"] {
            join(&competition, name).await;
        }
        let round_one = competition.status().await;
        for pairing in &round_one.pairings {
            competition.record_result(report(pairing, Slot::One, 3)).await;
        }

        let drawn = competition.status().await;
        assert_eq!(drawn.round, 2);
        assert!(drawn.pairings[0].room_id.is_none());

        tokio::time::sleep(Duration::from_secs(6)).await;
        let opened = competition.status().await;
        assert!(opened.pairings[0].room_id.is_some());
        assert_eq!(opened.rooms.len(), 1);
    }
}
