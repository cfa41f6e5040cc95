//! Food types, their effects, and the seeded spawner

use std::collections::{BTreeMap, HashSet};

use rand::distributions::{Distribution, WeightedIndex};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use super::{GridSize, Position};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FoodKind {
    Apple,
    Orange,
    Lemon,
    Grapes,
    Strawberry,
    Banana,
    Peach,
    Cherry,
    Watermelon,
    Kiwi,
}

/// What eating a food does to the snakes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoodEffect {
    Grow,
    GrowAndShrinkOpponent,
    None,
}

impl FoodKind {
    pub const ALL: [FoodKind; 10] = [
        FoodKind::Apple,
        FoodKind::Orange,
        FoodKind::Lemon,
        FoodKind::Grapes,
        FoodKind::Strawberry,
        FoodKind::Banana,
        FoodKind::Peach,
        FoodKind::Cherry,
        FoodKind::Watermelon,
        FoodKind::Kiwi,
    ];

    pub fn effect(self) -> FoodEffect {
        match self {
            FoodKind::Apple => FoodEffect::Grow,
            FoodKind::Grapes => FoodEffect::GrowAndShrinkOpponent,
            _ => FoodEffect::None,
        }
    }
}

/// A food item on the grid
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Food {
    pub position: Position,
    pub kind: FoodKind,
    /// Ticks left before it disappears; `None` never expires
    pub lifetime: Option<u32>,
}

impl Food {
    pub fn new(position: Position, kind: FoodKind, lifetime: Option<u32>) -> Self {
        Self {
            position,
            kind,
            lifetime,
        }
    }
}

/// Spawn weight and lifetime for one food kind. A lifetime of 0 never expires.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FruitSettings {
    pub propensity: u32,
    pub lifetime: u32,
}

pub type FoodTable = BTreeMap<FoodKind, FruitSettings>;

/// Apples only, never expiring
pub fn default_food_table() -> FoodTable {
    FoodKind::ALL
        .into_iter()
        .map(|kind| {
            let propensity = u32::from(kind == FoodKind::Apple);
            (kind, FruitSettings { propensity, lifetime: 0 })
        })
        .collect()
}

/// Places food on free cells, weighted by propensity
pub struct FoodSpawner {
    rng: ChaCha8Rng,
    max_fruits: usize,
    interval: u32,
    ticks_since_spawn: u32,
    kinds: Vec<(FoodKind, Option<u32>)>,
    weights: Option<WeightedIndex<u32>>,
}

impl FoodSpawner {
    pub fn new(seed: u64, max_fruits: usize, interval: u32, table: &FoodTable) -> Self {
        let active: Vec<(FoodKind, FruitSettings)> = table
            .iter()
            .filter(|(_, s)| s.propensity > 0)
            .map(|(k, s)| (*k, *s))
            .collect();
        let weights = WeightedIndex::new(active.iter().map(|(_, s)| s.propensity)).ok();
        let kinds = active
            .iter()
            .map(|(k, s)| (*k, (s.lifetime > 0).then_some(s.lifetime)))
            .collect();

        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            max_fruits,
            interval,
            // first spawn happens on the first tick
            ticks_since_spawn: interval,
            kinds,
            weights,
        }
    }

    /// Run once per tick after the grid has advanced. Returns the spawned food, if any.
    pub fn tick(
        &mut self,
        grid: GridSize,
        occupied: impl IntoIterator<Item = Position>,
        foods: &mut Vec<Food>,
    ) -> Option<Food> {
        self.ticks_since_spawn = self.ticks_since_spawn.saturating_add(1);
        if foods.len() >= self.max_fruits || self.ticks_since_spawn < self.interval {
            return None;
        }
        let weights = self.weights.as_ref()?;

        let mut blocked: HashSet<Position> = occupied.into_iter().collect();
        blocked.extend(foods.iter().map(|f| f.position));
        let free: Vec<Position> = grid.cells().filter(|c| !blocked.contains(c)).collect();
        let position = *free.choose(&mut self.rng)?;

        let (kind, lifetime) = self.kinds[weights.sample(&mut self.rng)];
        let food = Food::new(position, kind, lifetime);
        foods.push(food.clone());
        self.ticks_since_spawn = 0;
        Some(food)
    }

    /// Resets the spawn timer for a new game
    pub fn restart(&mut self) {
        self.ticks_since_spawn = self.interval;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(entries: &[(FoodKind, u32, u32)]) -> FoodTable {
        let mut table: FoodTable = FoodKind::ALL
            .into_iter()
            .map(|k| (k, FruitSettings::default()))
            .collect();
        for (kind, propensity, lifetime) in entries {
            table.insert(*kind, FruitSettings { propensity: *propensity, lifetime: *lifetime });
        }
        table
    }

    #[test]
    fn test_default_table_is_apples_only() {
        let table = default_food_table();
        assert_eq!(table[&FoodKind::Apple].propensity, 1);
        assert!(FoodKind::ALL
            .iter()
            .filter(|k| **k != FoodKind::Apple)
            .all(|k| table[k].propensity == 0));
    }

    #[test]
    fn test_spawns_on_first_tick_and_respects_max() {
        let grid = GridSize::new(10, 10);
        let mut spawner = FoodSpawner::new(7, 1, 5, &default_food_table());
        let mut foods = Vec::new();

        let food = spawner.tick(grid, [], &mut foods).expect("first tick spawns");
        assert_eq!(food.kind, FoodKind::Apple);
        assert_eq!(food.lifetime, None);
        assert!(grid.contains(food.position));

        for _ in 0..20 {
            assert!(spawner.tick(grid, [], &mut foods).is_none());
        }
        assert_eq!(foods.len(), 1);
    }

    #[test]
    fn test_waits_for_interval_between_spawns() {
        let grid = GridSize::new(10, 10);
        let mut spawner = FoodSpawner::new(1, 5, 3, &default_food_table());
        let mut foods = Vec::new();

        assert!(spawner.tick(grid, [], &mut foods).is_some());
        assert!(spawner.tick(grid, [], &mut foods).is_none());
        assert!(spawner.tick(grid, [], &mut foods).is_none());
        assert!(spawner.tick(grid, [], &mut foods).is_some());
        assert_eq!(foods.len(), 2);
    }

    #[test]
    fn test_never_spawns_on_occupied_cells() {
        let grid = GridSize::new(5, 5);
        let occupied: Vec<Position> = grid.cells().filter(|c| *c != Position::new(2, 3)).collect();
        let mut spawner = FoodSpawner::new(99, 1, 1, &default_food_table());
        let mut foods = Vec::new();

        let food = spawner.tick(grid, occupied.clone(), &mut foods).expect("one free cell");
        assert_eq!(food.position, Position::new(2, 3));

        let mut spawner = FoodSpawner::new(99, 2, 1, &default_food_table());
        let mut full = vec![food];
        assert!(spawner.tick(grid, occupied, &mut full).is_none());
    }

    #[test]
    fn test_zero_propensity_never_spawns() {
        let grid = GridSize::new(10, 10);
        let mut spawner = FoodSpawner::new(3, 1, 1, &table(&[]));
        let mut foods = Vec::new();
        assert!(spawner.tick(grid, [], &mut foods).is_none());

        let mut spawner = FoodSpawner::new(3, 50, 1, &table(&[(FoodKind::Grapes, 2, 12)]));
        for _ in 0..30 {
            spawner.tick(grid, [], &mut foods);
        }
        assert_eq!(foods.len(), 30);
        assert!(foods.iter().all(|f| f.kind == FoodKind::Grapes && f.lifetime == Some(12)));
    }

    #[test]
    fn test_same_seed_same_sequence() {
        let grid = GridSize::new(20, 15);
        let t = table(&[(FoodKind::Apple, 3, 0), (FoodKind::Cherry, 1, 40)]);
        let run = |seed| {
            let mut spawner = FoodSpawner::new(seed, 100, 1, &t);
            let mut foods = Vec::new();
            for _ in 0..25 {
                spawner.tick(grid, [], &mut foods);
            }
            foods
        };
        assert_eq!(run(42), run(42));
        assert_ne!(run(42), run(43));
    }
}
