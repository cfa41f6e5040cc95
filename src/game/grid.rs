//! Grid simulation: the pure per-tick state transition

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use super::food::{Food, FoodEffect};
use super::{Direction, GridSize, Position, Slot};

/// Snake modifier. Only the neutral buff exists today.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Buff {
    #[default]
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snake {
    /// Cells, head first
    pub body: Vec<Position>,
    pub direction: Direction,
    pub alive: bool,
    pub buff: Buff,
    /// Tick on which the direction last changed
    pub last_turn: Option<u64>,
}

impl Snake {
    pub fn new(head: Position, direction: Direction) -> Self {
        Self::with_body(vec![head], direction)
    }

    pub fn with_body(body: Vec<Position>, direction: Direction) -> Self {
        Self {
            body,
            direction,
            alive: true,
            buff: Buff::Default,
            last_turn: None,
        }
    }

    pub fn head(&self) -> Position {
        self.body[0]
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Continue,
    PlayerOneWins,
    PlayerTwoWins,
    Draw,
}

impl Outcome {
    pub fn won_by(slot: Slot) -> Self {
        match slot {
            Slot::One => Outcome::PlayerOneWins,
            Slot::Two => Outcome::PlayerTwoWins,
        }
    }

    pub fn winner(self) -> Option<Slot> {
        match self {
            Outcome::PlayerOneWins => Some(Slot::One),
            Outcome::PlayerTwoWins => Some(Slot::Two),
            _ => None,
        }
    }

    pub fn is_over(self) -> bool {
        self != Outcome::Continue
    }
}

/// Result of one simulation step
#[derive(Debug, Clone)]
pub struct Advance {
    pub snakes: BTreeMap<Slot, Snake>,
    pub foods: Vec<Food>,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeathCause {
    Wall,
    Body,
    HeadToHead,
}

/// Advances the game by one tick.
///
/// All snakes move at once and collisions are judged against everyone's
/// resulting cells, so the result never depends on iteration order.
pub fn advance(
    grid: GridSize,
    tick: u64,
    snakes: &BTreeMap<Slot, Snake>,
    foods: &[Food],
    pending: &BTreeMap<Slot, Direction>,
) -> Advance {
    let mut next = snakes.clone();

    for (slot, snake) in next.iter_mut().filter(|(_, s)| s.alive) {
        if let Some(&wanted) = pending.get(slot) {
            if wanted != snake.direction && wanted != snake.direction.opposite() {
                snake.direction = wanted;
                snake.last_turn = Some(tick);
            }
        }
    }

    let heads: BTreeMap<Slot, Position> = next
        .iter()
        .filter(|(_, s)| s.alive)
        .map(|(slot, s)| (*slot, s.head().step(s.direction)))
        .collect();

    let mut growing = HashSet::new();
    let mut shrinking = Vec::new();
    for (slot, head) in &heads {
        let Some(food) = foods.iter().find(|f| f.position == *head) else {
            continue;
        };
        match food.kind.effect() {
            FoodEffect::Grow => {
                growing.insert(*slot);
            }
            FoodEffect::GrowAndShrinkOpponent => {
                growing.insert(*slot);
                shrinking.push(slot.opponent());
            }
            FoodEffect::None => {}
        }
    }

    for (slot, head) in &heads {
        if let Some(snake) = next.get_mut(slot) {
            snake.body.insert(0, *head);
            if !growing.contains(slot) {
                snake.body.pop();
            }
        }
    }
    for slot in shrinking {
        if let Some(snake) = next.get_mut(&slot) {
            if snake.len() > 1 {
                snake.body.pop();
            }
        }
    }

    // Cells a head may not enter: every non-head cell, plus whole bodies of
    // snakes that did not move this tick.
    let blocked: HashSet<Position> = next
        .iter()
        .flat_map(|(slot, s)| {
            let skip = usize::from(heads.contains_key(slot));
            s.body.iter().skip(skip).copied()
        })
        .collect();

    let mut deaths: BTreeMap<Slot, DeathCause> = BTreeMap::new();
    for (slot, head) in &heads {
        let head_on = heads.iter().any(|(other, other_head)| {
            other != slot
                && (other_head == head
                    || (*other_head == snakes[slot].head() && snakes[other].head() == *head))
        });
        let cause = if !grid.contains(*head) {
            Some(DeathCause::Wall)
        } else if head_on {
            Some(DeathCause::HeadToHead)
        } else if blocked.contains(head) {
            Some(DeathCause::Body)
        } else {
            None
        };
        if let Some(cause) = cause {
            deaths.insert(*slot, cause);
        }
    }
    for slot in deaths.keys() {
        if let Some(snake) = next.get_mut(slot) {
            snake.alive = false;
        }
    }

    let remaining = foods
        .iter()
        .filter(|f| !heads.values().any(|h| *h == f.position))
        .filter_map(|f| match f.lifetime {
            Some(1) | Some(0) => None,
            Some(n) => Some(Food::new(f.position, f.kind, Some(n - 1))),
            None => Some(f.clone()),
        })
        .collect();

    let outcome = resolve(&next, &deaths);

    Advance {
        snakes: next,
        foods: remaining,
        outcome,
    }
}

fn resolve(snakes: &BTreeMap<Slot, Snake>, deaths: &BTreeMap<Slot, DeathCause>) -> Outcome {
    let alive: Vec<Slot> = snakes
        .iter()
        .filter(|(_, s)| s.alive)
        .map(|(slot, _)| *slot)
        .collect();

    match alive.as_slice() {
        [] => {}
        [survivor] => return Outcome::won_by(*survivor),
        _ => return Outcome::Continue,
    }

    let (Some(one), Some(two)) = (snakes.get(&Slot::One), snakes.get(&Slot::Two)) else {
        return Outcome::Draw;
    };
    match one.len().cmp(&two.len()) {
        std::cmp::Ordering::Greater => Outcome::PlayerOneWins,
        std::cmp::Ordering::Less => Outcome::PlayerTwoWins,
        std::cmp::Ordering::Equal => {
            if !deaths.values().any(|c| *c == DeathCause::HeadToHead) {
                return Outcome::Draw;
            }
            // the more recent turn loses
            match one.last_turn.cmp(&two.last_turn) {
                std::cmp::Ordering::Greater => Outcome::PlayerTwoWins,
                std::cmp::Ordering::Less => Outcome::PlayerOneWins,
                std::cmp::Ordering::Equal => Outcome::Draw,
            }
        }
    }
}

/// Distance of each starting head from its side wall
const START_INSET: i32 = 5;

/// A single game between two snakes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Game {
    pub grid: GridSize,
    pub tick: u64,
    pub snakes: BTreeMap<Slot, Snake>,
    pub foods: Vec<Food>,
    pub running: bool,
    pub winner: Option<Slot>,
}

impl Game {
    /// Standard starting layout: two length-1 snakes facing each other on
    /// adjacent rows, five cells in from the side walls. Narrow grids pull
    /// both heads toward the middle column.
    pub fn new(grid: GridSize) -> Self {
        let mid = grid.height / 2;
        let inset = START_INSET.min((grid.width - 1) / 2);
        let mut snakes = BTreeMap::new();
        snakes.insert(Slot::One, Snake::new(Position::new(inset, mid), Direction::Right));
        snakes.insert(
            Slot::Two,
            Snake::new(
                Position::new(grid.width - 1 - inset, mid + 1),
                Direction::Left,
            ),
        );
        Self::with_snakes(grid, snakes)
    }

    pub fn with_snakes(grid: GridSize, snakes: BTreeMap<Slot, Snake>) -> Self {
        Self {
            grid,
            tick: 0,
            snakes,
            foods: Vec::new(),
            running: true,
            winner: None,
        }
    }

    pub fn step(&mut self, pending: &BTreeMap<Slot, Direction>) -> Outcome {
        self.tick += 1;
        let Advance {
            snakes,
            foods,
            outcome,
            ..
        } = advance(self.grid, self.tick, &self.snakes, &self.foods, pending);
        self.snakes = snakes;
        self.foods = foods;
        if outcome.is_over() {
            self.running = false;
            self.winner = outcome.winner();
        }
        outcome
    }

    /// Ends the game in favour of `winner`, killing the other snake
    pub fn forfeit(&mut self, winner: Slot) {
        if let Some(snake) = self.snakes.get_mut(&winner.opponent()) {
            snake.alive = false;
        }
        self.running = false;
        self.winner = Some(winner);
    }

    pub fn occupied(&self) -> impl Iterator<Item = Position> + '_ {
        self.snakes.values().flat_map(|s| s.body.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::food::FoodKind;

    fn pos(x: i32, y: i32) -> Position {
        Position::new(x, y)
    }

    fn snake(cells: &[(i32, i32)], direction: Direction) -> Snake {
        Snake::with_body(cells.iter().map(|(x, y)| pos(*x, *y)).collect(), direction)
    }

    fn pair(one: Snake, two: Snake) -> BTreeMap<Slot, Snake> {
        BTreeMap::from([(Slot::One, one), (Slot::Two, two)])
    }

    fn no_moves() -> BTreeMap<Slot, Direction> {
        BTreeMap::new()
    }

    #[test]
    fn test_parallel_snakes_pass_without_collision() {
        let grid = GridSize::new(10, 10);
        let snakes = pair(
            snake(&[(2, 2), (1, 2), (0, 2)], Direction::Right),
            snake(&[(7, 5), (8, 5), (9, 5)], Direction::Left),
        );

        let step = advance(grid, 1, &snakes, &[], &no_moves());

        assert_eq!(step.outcome, Outcome::Continue);
        assert_eq!(step.snakes[&Slot::One].body, vec![pos(3, 2), pos(2, 2), pos(1, 2)]);
        assert_eq!(step.snakes[&Slot::Two].body, vec![pos(6, 5), pos(7, 5), pos(8, 5)]);
        assert!(step.snakes.values().all(|s| s.alive));
    }

    #[test]
    fn test_adjacent_rows_pass_without_collision() {
        let grid = GridSize::new(10, 10);
        let snakes = pair(
            snake(&[(5, 5), (4, 5), (3, 5)], Direction::Right),
            snake(&[(5, 6), (6, 6), (7, 6)], Direction::Left),
        );

        let step = advance(grid, 1, &snakes, &[], &no_moves());

        assert_eq!(step.outcome, Outcome::Continue);
        assert_eq!(step.snakes[&Slot::One].head(), pos(6, 5));
        assert_eq!(step.snakes[&Slot::Two].head(), pos(4, 6));
        assert!(step.snakes.values().all(|s| s.alive));
    }

    #[test]
    fn test_longer_snake_wins_simultaneous_wall_deaths() {
        let grid = GridSize::new(10, 10);
        let snakes = pair(
            snake(&[(9, 1), (8, 1), (7, 1)], Direction::Right),
            snake(&[(9, 5), (8, 5), (7, 5), (6, 5), (5, 5)], Direction::Right),
        );

        let step = advance(grid, 4, &snakes, &[], &no_moves());

        assert!(step.snakes.values().all(|s| !s.alive));
        assert_eq!(step.outcome, Outcome::PlayerTwoWins);
    }

    #[test]
    fn test_head_to_head_more_recent_turn_loses() {
        let grid = GridSize::new(10, 10);
        // both heads enter (5, 5); slot 1 turns into it this tick
        let snakes = pair(
            snake(&[(5, 4), (4, 4), (3, 4)], Direction::Right),
            snake(&[(6, 5), (7, 5), (8, 5)], Direction::Left),
        );
        let moves = BTreeMap::from([(Slot::One, Direction::Down)]);

        let step = advance(grid, 12, &snakes, &[], &moves);

        assert_eq!(step.snakes[&Slot::One].last_turn, Some(12));
        assert!(step.snakes.values().all(|s| !s.alive));
        assert_eq!(step.outcome, Outcome::PlayerTwoWins);
    }

    #[test]
    fn test_head_to_head_without_turns_is_draw() {
        let grid = GridSize::new(10, 10);
        let snakes = pair(
            snake(&[(4, 5), (3, 5)], Direction::Right),
            snake(&[(6, 5), (7, 5)], Direction::Left),
        );

        let step = advance(grid, 1, &snakes, &[], &no_moves());

        assert_eq!(step.outcome, Outcome::Draw);
    }

    #[test]
    fn test_swapping_cells_is_head_to_head() {
        let grid = GridSize::new(10, 10);
        let snakes = pair(snake(&[(4, 5)], Direction::Right), snake(&[(5, 5)], Direction::Left));

        let step = advance(grid, 1, &snakes, &[], &no_moves());

        assert!(step.snakes.values().all(|s| !s.alive));
        assert_eq!(step.outcome, Outcome::Draw);
    }

    #[test]
    fn test_result_independent_of_slot_order() {
        let grid = GridSize::new(10, 10);
        let a = snake(&[(3, 3), (3, 4), (3, 5)], Direction::Up);
        let b = snake(&[(2, 2), (1, 2)], Direction::Right);
        let moves = BTreeMap::from([(Slot::One, Direction::Left)]);
        let swapped_moves = BTreeMap::from([(Slot::Two, Direction::Left)]);

        let forward = advance(grid, 3, &pair(a.clone(), b.clone()), &[], &moves);
        let mirrored = advance(grid, 3, &pair(b, a), &[], &swapped_moves);

        assert_eq!(forward.snakes[&Slot::One], mirrored.snakes[&Slot::Two]);
        assert_eq!(forward.snakes[&Slot::Two], mirrored.snakes[&Slot::One]);
        assert_eq!(forward.outcome.winner(), mirrored.outcome.winner().map(Slot::opponent));
    }

    #[test]
    fn test_running_into_body_kills() {
        let grid = GridSize::new(10, 10);
        let snakes = pair(
            snake(&[(4, 3), (3, 3)], Direction::Down),
            snake(&[(2, 4), (3, 4), (4, 4), (5, 4)], Direction::Left),
        );

        let step = advance(grid, 1, &snakes, &[], &no_moves());

        assert!(!step.snakes[&Slot::One].alive);
        assert!(step.snakes[&Slot::Two].alive);
        assert_eq!(step.outcome, Outcome::PlayerTwoWins);
    }

    #[test]
    fn test_chasing_a_moving_tail_is_safe() {
        let grid = GridSize::new(10, 10);
        let snakes = pair(
            snake(&[(4, 4), (4, 5), (5, 5), (5, 4)], Direction::Up),
            snake(&[(8, 8)], Direction::Up),
        );
        let moves = BTreeMap::from([(Slot::One, Direction::Right)]);

        let step = advance(grid, 1, &snakes, &[], &moves);

        assert!(step.snakes[&Slot::One].alive);
        assert_eq!(step.outcome, Outcome::Continue);
    }

    #[test]
    fn test_reversal_is_ignored() {
        let grid = GridSize::new(10, 10);
        let snakes = pair(
            snake(&[(4, 4), (3, 4)], Direction::Right),
            snake(&[(8, 8)], Direction::Up),
        );
        let moves = BTreeMap::from([(Slot::One, Direction::Left)]);

        let step = advance(grid, 1, &snakes, &[], &moves);

        let one = &step.snakes[&Slot::One];
        assert_eq!(one.direction, Direction::Right);
        assert_eq!(one.last_turn, None);
        assert_eq!(one.head(), pos(5, 4));
    }

    #[test]
    fn test_apple_grows_and_is_consumed() {
        let grid = GridSize::new(10, 10);
        let snakes = pair(snake(&[(4, 4)], Direction::Right), snake(&[(8, 8)], Direction::Up));
        let foods = vec![Food::new(pos(5, 4), FoodKind::Apple, None)];

        let step = advance(grid, 1, &snakes, &foods, &no_moves());

        assert_eq!(step.snakes[&Slot::One].body, vec![pos(5, 4), pos(4, 4)]);
        assert!(step.foods.is_empty());
    }

    #[test]
    fn test_grapes_shrink_opponent_longer_than_one() {
        let grid = GridSize::new(10, 10);
        let foods = vec![Food::new(pos(5, 4), FoodKind::Grapes, None)];

        let long = pair(
            snake(&[(4, 4)], Direction::Right),
            snake(&[(8, 6), (8, 7), (8, 8)], Direction::Up),
        );
        let step = advance(grid, 1, &long, &foods, &no_moves());
        assert_eq!(step.snakes[&Slot::One].len(), 2);
        assert_eq!(step.snakes[&Slot::Two].body, vec![pos(8, 5), pos(8, 6)]);

        let short = pair(snake(&[(4, 4)], Direction::Right), snake(&[(8, 8)], Direction::Up));
        let step = advance(grid, 1, &short, &foods, &no_moves());
        assert_eq!(step.snakes[&Slot::Two].len(), 1);
    }

    #[test]
    fn test_other_fruit_is_eaten_without_effect() {
        let grid = GridSize::new(10, 10);
        let snakes = pair(snake(&[(4, 4)], Direction::Right), snake(&[(8, 8)], Direction::Up));
        let foods = vec![Food::new(pos(5, 4), FoodKind::Kiwi, None)];

        let step = advance(grid, 1, &snakes, &foods, &no_moves());

        assert_eq!(step.snakes[&Slot::One].len(), 1);
        assert!(step.foods.is_empty());
    }

    #[test]
    fn test_food_lifetime_expires() {
        let grid = GridSize::new(10, 10);
        let snakes = pair(snake(&[(1, 1)], Direction::Right), snake(&[(8, 8)], Direction::Up));
        let foods = vec![
            Food::new(pos(5, 5), FoodKind::Cherry, Some(2)),
            Food::new(pos(6, 6), FoodKind::Apple, None),
        ];

        let first = advance(grid, 1, &snakes, &foods, &no_moves());
        assert_eq!(first.foods[0].lifetime, Some(1));

        let second = advance(grid, 2, &first.snakes, &first.foods, &no_moves());
        assert_eq!(second.foods, vec![Food::new(pos(6, 6), FoodKind::Apple, None)]);
    }

    #[test]
    fn test_game_step_records_winner() {
        let mut game = Game::new(GridSize::new(12, 10));
        assert_eq!(game.snakes[&Slot::One].head(), pos(5, 5));
        assert_eq!(game.snakes[&Slot::Two].head(), pos(6, 6));

        let up = BTreeMap::from([(Slot::One, Direction::Up)]);
        let mut outcome = game.step(&up);
        while outcome == Outcome::Continue {
            outcome = game.step(&no_moves());
        }

        assert!(!game.running);
        assert_eq!(game.winner, outcome.winner());
        assert_eq!(outcome, Outcome::PlayerTwoWins);
    }

    #[test]
    fn test_smallest_grid_starts_inside_and_plays() {
        for width in [5, 6, 7] {
            let grid = GridSize::new(width, 5);
            let mut game = Game::new(grid);
            for snake in game.snakes.values() {
                assert!(grid.contains(snake.head()), "{width}x5 start {:?}", snake.head());
            }
            assert_ne!(
                game.snakes[&Slot::One].head(),
                game.snakes[&Slot::Two].head()
            );

            assert_eq!(game.step(&no_moves()), Outcome::Continue, "{width}x5");
            assert!(game.running);
        }
    }

    #[test]
    fn test_full_size_start_is_five_from_the_walls() {
        let game = Game::new(GridSize::new(30, 20));
        assert_eq!(game.snakes[&Slot::One].head(), pos(5, 10));
        assert_eq!(game.snakes[&Slot::Two].head(), pos(24, 11));
    }

    #[test]
    fn test_serialized_state_replays_identically() {
        let mut game = Game::new(GridSize::new(15, 10));
        game.foods.push(Food::new(pos(8, 5), FoodKind::Apple, None));
        game.foods.push(Food::new(pos(3, 2), FoodKind::Grapes, Some(9)));
        let turn = BTreeMap::from([(Slot::Two, Direction::Up)]);
        game.step(&turn);

        let json = serde_json::to_string(&game).expect("serialize");
        let mut replica: Game = serde_json::from_str(&json).expect("deserialize");

        let script = [
            BTreeMap::from([(Slot::One, Direction::Down)]),
            no_moves(),
            BTreeMap::from([(Slot::Two, Direction::Left), (Slot::One, Direction::Right)]),
            no_moves(),
        ];
        for moves in &script {
            let a = game.step(moves);
            let b = replica.step(moves);
            assert_eq!(a, b);
            assert_eq!(game.snakes, replica.snakes);
            assert_eq!(game.foods, replica.foods);
        }
        assert_eq!(game.tick, replica.tick);
    }
}
