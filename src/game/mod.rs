//! Game simulation modules

pub mod food;
pub mod grid;
pub mod room;
pub mod snapshot;

pub use grid::{Game, Outcome};
pub use room::{
    MatchReport, Occupant, RoomCommand, RoomConfig, RoomEvent, RoomHandle, RoomId, RoomSummary,
    Seat,
};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Movement direction on the grid (y grows downwards)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
            Direction::Left => Direction::Right,
            Direction::Right => Direction::Left,
        }
    }

    fn delta(self) -> (i32, i32) {
        match self {
            Direction::Up => (0, -1),
            Direction::Down => (0, 1),
            Direction::Left => (-1, 0),
            Direction::Right => (1, 0),
        }
    }
}

/// A grid cell. Serialized as an `[x, y]` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "(i32, i32)", into = "(i32, i32)")]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

impl Position {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    pub fn step(self, direction: Direction) -> Self {
        let (dx, dy) = direction.delta();
        Self::new(self.x + dx, self.y + dy)
    }
}

impl From<(i32, i32)> for Position {
    fn from((x, y): (i32, i32)) -> Self {
        Self::new(x, y)
    }
}

impl From<Position> for (i32, i32) {
    fn from(p: Position) -> Self {
        (p.x, p.y)
    }
}

/// Playing field dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridSize {
    pub width: i32,
    pub height: i32,
}

impl GridSize {
    pub const fn new(width: i32, height: i32) -> Self {
        Self { width, height }
    }

    pub fn contains(&self, p: Position) -> bool {
        p.x >= 0 && p.x < self.width && p.y >= 0 && p.y < self.height
    }

    pub fn cells(&self) -> impl Iterator<Item = Position> + '_ {
        (0..self.width).flat_map(move |x| (0..self.height).map(move |y| Position::new(x, y)))
    }
}

impl Default for GridSize {
    fn default() -> Self {
        Self::new(30, 20)
    }
}

impl fmt::Display for GridSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for GridSize {
    type Err = String;

    /// Parses `WIDTHxHEIGHT`, e.g. `30x20`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        let (w, h) = lower
            .split_once('x')
            .ok_or_else(|| format!("grid size '{s}' must be WIDTHxHEIGHT"))?;
        let width = w.trim().parse::<i32>().map_err(|e| e.to_string())?;
        let height = h.trim().parse::<i32>().map_err(|e| e.to_string())?;
        Ok(Self::new(width, height))
    }
}

/// One of the two seats in a room. Serialized as `1` or `2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Slot {
    One,
    Two,
}

impl Slot {
    pub const BOTH: [Slot; 2] = [Slot::One, Slot::Two];

    pub fn opponent(self) -> Self {
        match self {
            Slot::One => Slot::Two,
            Slot::Two => Slot::One,
        }
    }

    pub fn number(self) -> u8 {
        match self {
            Slot::One => 1,
            Slot::Two => 2,
        }
    }
}

impl From<Slot> for u8 {
    fn from(slot: Slot) -> Self {
        slot.number()
    }
}

impl TryFrom<u8> for Slot {
    type Error = String;

    fn try_from(n: u8) -> Result<Self, Self::Error> {
        match n {
            1 => Ok(Slot::One),
            2 => Ok(Slot::Two),
            other => Err(format!("invalid player slot {other}")),
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

/// A value per seat, serialized as `{"1": .., "2": ..}`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerSlot<T> {
    #[serde(rename = "1")]
    pub one: T,
    #[serde(rename = "2")]
    pub two: T,
}

impl<T> PerSlot<T> {
    pub fn new(one: T, two: T) -> Self {
        Self { one, two }
    }

    pub fn get(&self, slot: Slot) -> &T {
        match slot {
            Slot::One => &self.one,
            Slot::Two => &self.two,
        }
    }

    pub fn get_mut(&mut self, slot: Slot) -> &mut T {
        match slot {
            Slot::One => &mut self.one,
            Slot::Two => &mut self.two,
        }
    }

    pub fn map<U>(&self, mut f: impl FnMut(&T) -> U) -> PerSlot<U> {
        PerSlot::new(f(&self.one), f(&self.two))
    }
}

impl<T: PartialEq> PerSlot<T> {
    pub fn slot_of(&self, value: &T) -> Option<Slot> {
        Slot::BOTH.into_iter().find(|s| self.get(*s) == value)
    }
}

/// Games won per seat in the current match
pub type Scores = PerSlot<u32>;

impl Scores {
    /// The seat that has reached `target`, if any
    pub fn leader(&self, target: u32) -> Option<Slot> {
        Slot::BOTH.into_iter().find(|s| *self.get(*s) >= target)
    }
}

/// Display names per seat
pub type Names = PerSlot<String>;
