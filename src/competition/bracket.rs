//! Bracket arithmetic: pairing, bye selection, round counts

use std::cmp::Ordering;

use rand::seq::SliceRandom;
use rand::Rng;
use tokio::time::Instant;

use super::PlayerId;

/// Shuffle and pair up sequentially. An odd player out is returned separately.
pub fn pair_shuffled<R: Rng + ?Sized>(
    mut players: Vec<PlayerId>,
    rng: &mut R,
) -> (Vec<(PlayerId, PlayerId)>, Option<PlayerId>) {
    players.shuffle(rng);
    let leftover = if players.len() % 2 == 1 {
        players.pop()
    } else {
        None
    };
    let pairs = players.chunks_exact(2).map(|c| (c[0], c[1])).collect();
    (pairs, leftover)
}

/// A survivor's standing from the round just played
#[derive(Debug, Clone, Copy)]
pub struct ByeCandidate {
    pub player: PlayerId,
    pub points: u32,
    /// When their match in that round finished; `None` if they played no match
    pub completed_at: Option<Instant>,
}

/// Most points, then earliest finish, then a coin flip
pub fn select_bye<R: Rng + ?Sized>(candidates: &[ByeCandidate], rng: &mut R) -> Option<PlayerId> {
    let best = candidates.iter().map(|c| c.points).max()?;
    let top: Vec<&ByeCandidate> = candidates.iter().filter(|c| c.points == best).collect();

    let earliest = top
        .iter()
        .map(|c| c.completed_at)
        .min_by(|a, b| finish_order(*a, *b))?;
    let tied: Vec<PlayerId> = top
        .iter()
        .filter(|c| finish_order(c.completed_at, earliest) == Ordering::Equal)
        .map(|c| c.player)
        .collect();

    tied.choose(rng).copied()
}

/// Finished matches sort before players with no finish this round
fn finish_order(a: Option<Instant>, b: Option<Instant>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Rounds needed to reduce `players` entrants to one champion
pub fn total_rounds(players: usize) -> u32 {
    let mut remaining = players;
    let mut rounds = 0;
    while remaining > 1 {
        remaining = remaining.div_ceil(2);
        rounds += 1;
    }
    rounds.max(1)
}
