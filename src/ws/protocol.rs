//! WebSocket protocol message definitions
//! These are the wire types for client-server communication

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::competition::{CompetitionState, PlayerId};
use crate::game::food::FoodKind;
use crate::game::grid::Buff;
use crate::game::{Direction, GridSize, Names, Position, RoomId, RoomSummary, Scores, Slot};

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientMsg {
    /// Enter the competition lobby
    Join {
        #[serde(default)]
        name: Option<String>,
    },

    /// Watch a room, or whichever room is active
    Observe {
        #[serde(default)]
        room_id: Option<RoomId>,
    },

    /// Ready for the next game. Registers the sender if it has not joined yet.
    Ready {
        #[serde(default)]
        mode: Option<String>,
        #[serde(default)]
        name: Option<String>,
    },

    /// Steer the snake
    Move { direction: Direction },

    /// Observer moves to another room
    SwitchRoom { room_id: RoomId },

    /// Request the room list
    GetRooms,
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("{0}")]
    OutOfSequence(&'static str),
}

impl ClientMsg {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    /// Registration accepted
    Joined { uid: PlayerId, name: String },

    Waiting { message: String },

    /// Sent to everyone in the lobby whenever the roster changes
    LobbyStatus {
        players: Vec<PlayerRef>,
        current: usize,
        required: usize,
    },

    /// Seat assignment for a new match
    MatchAssigned {
        room_id: RoomId,
        arena: u32,
        player_id: Slot,
        opponent: String,
        points_to_win: u32,
    },

    /// A game has started
    Start {
        room_id: RoomId,
        mode: String,
        wins: Scores,
        names: Names,
        points_to_win: u32,
    },

    /// Per-tick game state
    State {
        room_id: RoomId,
        game: GameSnapshot,
        wins: Scores,
        names: Names,
    },

    #[serde(rename = "gameover")]
    GameOver {
        room_id: RoomId,
        winner: Option<Slot>,
        wins: Scores,
        names: Names,
        points_to_win: u32,
    },

    MatchComplete {
        room_id: RoomId,
        winner: SeatRef,
        final_score: Scores,
        forfeit: bool,
    },

    CompetitionStatus {
        state: CompetitionState,
        round: u32,
        total_rounds: u32,
        pairings: Vec<PairingInfo>,
        bye: Option<PlayerRef>,
    },

    CompetitionComplete {
        champion: Option<PlayerRef>,
        /// Seconds until the next competition opens
        reset_in: u64,
    },

    ByePlayer { round: u32, player: PlayerRef },

    ObserverJoined {
        room_id: RoomId,
        game: Option<GameSnapshot>,
        wins: Scores,
        names: Names,
    },

    /// No room to watch yet
    ObserverLobby { message: String },

    RoomList {
        rooms: Vec<RoomSummary>,
        current_room: Option<RoomId>,
    },

    Error { message: String },
}

impl ServerMsg {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMsg::Error {
            message: message.into(),
        }
    }

    pub fn waiting(message: impl Into<String>) -> Self {
        ServerMsg::Waiting {
            message: message.into(),
        }
    }
}

/// Competitor reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlayerRef {
    pub uid: PlayerId,
    pub name: String,
}

/// Seat reference inside a room
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeatRef {
    pub player_id: Slot,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PairingInfo {
    pub arena: u32,
    pub players: [PlayerRef; 2],
    pub room_id: Option<RoomId>,
    pub winner: Option<PlayerId>,
}

/// Game state in a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameSnapshot {
    pub tick: u64,
    pub grid: GridSize,
    pub snakes: BTreeMap<Slot, SnakeSnapshot>,
    pub foods: Vec<FoodSnapshot>,
    pub running: bool,
    pub winner: Option<Slot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnakeSnapshot {
    pub player_id: Slot,
    /// Head first
    pub body: Vec<Position>,
    pub direction: Direction,
    pub alive: bool,
    pub buff: Buff,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoodSnapshot {
    pub x: i32,
    pub y: i32,
    #[serde(rename = "type")]
    pub kind: FoodKind,
    /// Null until close to expiring
    #[serde(default)]
    pub lifetime: Option<u32>,
}
