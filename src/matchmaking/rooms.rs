//! Room manager - room table, seat routing, and observer subscriptions

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::{DashMap, DashSet};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::competition::PlayerId;
use crate::game::room::MatchRoom;
use crate::game::{
    Direction, Occupant, PerSlot, RoomCommand, RoomConfig, RoomEvent, RoomHandle, RoomId,
    RoomSummary, Seat,
};
use crate::ws::connection::{ConnectionHandle, ConnectionId};
use crate::ws::protocol::ServerMsg;

#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    #[error("player {0} is already seated in room {1}")]
    PlayerBusy(PlayerId, RoomId),

    #[error("a player cannot be paired with themselves")]
    SamePlayer,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("not seated in a room")]
    NotSeated,

    #[error("room {0} is closed")]
    RoomClosed(RoomId),

    #[error("room {0} not available")]
    UnknownRoom(RoomId),

    #[error("no active room to observe")]
    NoActiveRoom,
}

/// What a connection wants done
#[derive(Debug, Clone)]
pub enum Intent {
    Ready(PlayerId),
    Move(PlayerId, Direction),
    Leave(PlayerId),
    Observe(Option<RoomId>),
    SwitchRoom(RoomId),
}

struct RoomEntry {
    handle: RoomHandle,
    task: JoinHandle<()>,
}

impl Drop for RoomEntry {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Observer {
    conn: ConnectionHandle,
    room: Option<RoomId>,
    forwarder: Option<JoinHandle<()>>,
}

impl Observer {
    fn detach(&mut self) {
        self.room = None;
        if let Some(task) = self.forwarder.take() {
            task.abort();
        }
    }
}

impl Drop for Observer {
    fn drop(&mut self) {
        self.detach();
    }
}

#[derive(Default)]
struct RoomTable {
    rooms: BTreeMap<RoomId, RoomEntry>,
    observers: HashMap<ConnectionId, Observer>,
}

impl RoomTable {
    fn summaries(&self) -> Vec<RoomSummary> {
        self.rooms.values().map(|r| r.handle.summary()).collect()
    }

    fn first_active(&self, except: Option<RoomId>) -> Option<RoomId> {
        self.rooms
            .values()
            .find(|r| Some(r.handle.id) != except && r.handle.is_active())
            .map(|r| r.handle.id)
    }

    /// Subscribe `conn` to a room's broadcasts, replacing any previous subscription
    fn attach(&mut self, conn: ConnectionHandle, room_id: RoomId) -> Result<(), RouteError> {
        let room = self
            .rooms
            .get(&room_id)
            .ok_or(RouteError::UnknownRoom(room_id))?;

        let mut updates = room.handle.subscribe();
        let summary = room.handle.summary();
        conn.send(ServerMsg::ObserverJoined {
            room_id,
            game: summary.latest,
            wins: summary.wins,
            names: summary.names,
        });
        conn.send(ServerMsg::RoomList {
            rooms: self.summaries(),
            current_room: Some(room_id),
        });

        let target = conn.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                match updates.recv().await {
                    Ok(msg) => {
                        if !target.send(msg) && target.is_closed() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!(conn_id = %target.id(), lagged = n, "Observer lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        debug!(conn_id = %conn.id(), room_id = %room_id, "Observer attached");
        self.observers.insert(
            conn.id(),
            Observer {
                conn,
                room: Some(room_id),
                forwarder: Some(forwarder),
            },
        );
        Ok(())
    }

    fn park(&mut self, conn: ConnectionHandle) {
        conn.send(ServerMsg::ObserverLobby {
            message: "Waiting for a match to start...".to_string(),
        });
        let observer = self.observers.entry(conn.id()).or_insert(Observer {
            conn,
            room: None,
            forwarder: None,
        });
        observer.detach();
    }

    fn watchers_of(&self, room: Option<RoomId>) -> Vec<ConnectionHandle> {
        self.observers
            .values()
            .filter(|o| o.room == room)
            .map(|o| o.conn.clone())
            .collect()
    }
}

/// Creates, routes to, and tears down match rooms
pub struct RoomManager {
    table: Mutex<RoomTable>,
    seats: DashMap<PlayerId, Seat>,
    /// Players who signalled ready while unseated
    carried_ready: DashSet<PlayerId>,
    next_room: AtomicU64,
    events: mpsc::UnboundedSender<RoomEvent>,
}

impl RoomManager {
    pub fn new(events: mpsc::UnboundedSender<RoomEvent>) -> Self {
        Self {
            table: Mutex::new(RoomTable::default()),
            seats: DashMap::new(),
            carried_ready: DashSet::new(),
            next_room: AtomicU64::new(0),
            events,
        }
    }

    /// Open a room for two players.
    ///
    /// Returns the existing room when the same pairing is already live, and
    /// refuses if either player sits in some other live room.
    pub async fn create_room(
        &self,
        arena: u32,
        mut first: Occupant,
        mut second: Occupant,
        config: RoomConfig,
    ) -> Result<RoomId, RoomError> {
        if first.player == second.player {
            return Err(RoomError::SamePlayer);
        }

        let mut table = self.table.lock().await;

        for entry in table.rooms.values().filter(|r| r.handle.is_active()) {
            let seated = entry.handle.players;
            if seated.slot_of(&first.player).is_some() && seated.slot_of(&second.player).is_some() {
                debug!(room_id = %entry.handle.id, "Pairing already has a room");
                return Ok(entry.handle.id);
            }
            for player in [first.player, second.player] {
                if seated.slot_of(&player).is_some() {
                    return Err(RoomError::PlayerBusy(player, entry.handle.id));
                }
            }
        }

        first.ready |= self.carried_ready.remove(&first.player).is_some();
        second.ready |= self.carried_ready.remove(&second.player).is_some();

        let id = RoomId(self.next_room.fetch_add(1, Ordering::Relaxed) + 1);
        let names = (first.name.clone(), second.name.clone());
        let (room, handle) = MatchRoom::new(
            id,
            arena,
            PerSlot::new(first, second),
            config,
            self.events.clone(),
        );
        let task = tokio::spawn(room.run());

        for slot in crate::game::Slot::BOTH {
            self.seats.insert(*handle.players.get(slot), handle.seat(slot));
        }
        table.rooms.insert(id, RoomEntry { handle, task });

        for conn in table.watchers_of(None) {
            let _ = table.attach(conn, id);
        }

        info!(room_id = %id, arena, player_1 = %names.0, player_2 = %names.1, "Room created");
        Ok(id)
    }

    /// Route a player or observer intent to the right room
    pub async fn route(&self, conn: &ConnectionHandle, intent: Intent) -> Result<RoomId, RouteError> {
        match intent {
            Intent::Ready(player) => match self.live_seat(player) {
                Some(seat) => self.forward(&seat, RoomCommand::Ready(seat.slot)),
                None => {
                    self.carried_ready.insert(player);
                    Err(RouteError::NotSeated)
                }
            },
            Intent::Move(player, direction) => {
                let seat = self.live_seat(player).ok_or(RouteError::NotSeated)?;
                self.forward(&seat, RoomCommand::Move(seat.slot, direction))
            }
            Intent::Leave(player) => {
                self.carried_ready.remove(&player);
                let (_, seat) = self.seats.remove(&player).ok_or(RouteError::NotSeated)?;
                self.forward(&seat, RoomCommand::Leave(seat.slot))
            }
            Intent::Observe(target) => self.observe(conn, target, false).await,
            Intent::SwitchRoom(target) => self.observe(conn, Some(target), true).await,
        }
    }

    fn live_seat(&self, player: PlayerId) -> Option<Seat> {
        self.seats
            .get(&player)
            .map(|s| s.value().clone())
            .filter(|s| !s.match_complete())
    }

    fn forward(&self, seat: &Seat, cmd: RoomCommand) -> Result<RoomId, RouteError> {
        if seat.send(cmd) {
            Ok(seat.room_id)
        } else {
            Err(RouteError::RoomClosed(seat.room_id))
        }
    }

    async fn observe(
        &self,
        conn: &ConnectionHandle,
        target: Option<RoomId>,
        strict: bool,
    ) -> Result<RoomId, RouteError> {
        let mut table = self.table.lock().await;

        let room_id = match target {
            Some(id) if table.rooms.contains_key(&id) => id,
            Some(id) if strict => return Err(RouteError::UnknownRoom(id)),
            _ => match table.first_active(None).or_else(|| table.rooms.keys().next().copied()) {
                Some(id) => id,
                None => {
                    table.park(conn.clone());
                    return Err(RouteError::NoActiveRoom);
                }
            },
        };

        table.attach(conn.clone(), room_id)?;
        info!(conn_id = %conn.id(), room_id = %room_id, "Observer watching room");
        Ok(room_id)
    }

    /// Called once a room's match has been recorded. Moves its observers on
    /// and frees its seats.
    pub async fn finish_room(&self, room_id: RoomId) {
        self.seats.retain(|_, seat| seat.room_id != room_id);

        let mut table = self.table.lock().await;
        let Some(next) = table.first_active(Some(room_id)) else {
            return;
        };
        for conn in table.watchers_of(Some(room_id)) {
            let _ = table.attach(conn, next);
        }
    }

    /// Tear down every room. Observers go back to the lobby.
    pub async fn clear_all(&self) {
        let mut table = self.table.lock().await;
        let closed = std::mem::take(&mut table.rooms);
        self.seats.clear();

        let watching: Vec<ConnectionHandle> = table
            .observers
            .values()
            .filter(|o| o.room.is_some())
            .map(|o| o.conn.clone())
            .collect();
        for conn in watching {
            table.park(conn);
        }

        if !closed.is_empty() {
            info!(rooms = closed.len(), "All rooms cleared");
        }
        drop(closed);
    }

    /// Full reset: rooms, seats, and carried ready signals
    pub async fn reset(&self) {
        self.clear_all().await;
        self.carried_ready.clear();
    }

    /// Forget a player who left the competition
    pub fn release_player(&self, player: PlayerId) {
        self.seats.remove(&player);
        self.carried_ready.remove(&player);
    }

    pub async fn remove_observer(&self, conn_id: ConnectionId) {
        let mut table = self.table.lock().await;
        if table.observers.remove(&conn_id).is_some() {
            debug!(conn_id = %conn_id, "Observer removed");
        }
    }

    pub async fn observed_room(&self, conn_id: ConnectionId) -> Option<RoomId> {
        let table = self.table.lock().await;
        table.observers.get(&conn_id).and_then(|o| o.room)
    }

    pub async fn summaries(&self) -> Vec<RoomSummary> {
        self.table.lock().await.summaries()
    }

    pub async fn active_rooms(&self) -> Vec<RoomSummary> {
        let table = self.table.lock().await;
        table
            .rooms
            .values()
            .filter(|r| r.handle.is_active())
            .map(|r| r.handle.summary())
            .collect()
    }

    pub async fn room(&self, id: RoomId) -> Option<RoomSummary> {
        let table = self.table.lock().await;
        table.rooms.get(&id).map(|r| r.handle.summary())
    }

    pub async fn observer_count(&self) -> usize {
        self.table.lock().await.observers.len()
    }

    pub fn seated_players(&self) -> usize {
        self.seats.len()
    }
}
