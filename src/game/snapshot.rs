//! Snapshot building for network transmission

use crate::ws::protocol::{FoodSnapshot, GameSnapshot, SnakeSnapshot};

use super::Game;

/// Builds the per-tick `state` payload
#[derive(Debug, Clone, Copy)]
pub struct SnapshotBuilder {
    /// Food lifetime is only revealed within this many ticks of expiry
    fruit_warning: u32,
}

impl SnapshotBuilder {
    pub fn new(fruit_warning: u32) -> Self {
        Self { fruit_warning }
    }

    pub fn build(&self, game: &Game) -> GameSnapshot {
        let snakes = game
            .snakes
            .iter()
            .map(|(slot, snake)| {
                (
                    *slot,
                    SnakeSnapshot {
                        player_id: *slot,
                        body: snake.body.clone(),
                        direction: snake.direction,
                        alive: snake.alive,
                        buff: snake.buff,
                    },
                )
            })
            .collect();

        let foods = game
            .foods
            .iter()
            .map(|food| FoodSnapshot {
                x: food.position.x,
                y: food.position.y,
                kind: food.kind,
                lifetime: food.lifetime.filter(|left| *left <= self.fruit_warning),
            })
            .collect();

        GameSnapshot {
            tick: game.tick,
            grid: game.grid,
            snakes,
            foods,
            running: game.running,
            winner: game.winner,
        }
    }
}
