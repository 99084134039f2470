use std::collections::BTreeSet;

use rand::seq::SliceRandom;
use rand::Rng;

/// Point totals that unlock a one-time reward, ascending.
pub const MILESTONES: [u32; 5] = [25, 50, 100, 500, 5000];

/// A mechanical or cosmetic effect granted by a milestone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reward {
    HintToken,
    FireTrailMove,
    Shield,
    HighlightBestMove { seconds: u32 },
    TimeBonus { seconds: u32 },
    FreezeOpponent,
    DoubleMoveToken,
    Theme,
}

impl Reward {
    pub fn label(&self) -> &'static str {
        match self {
            Reward::HintToken => "+10s hint token",
            Reward::FireTrailMove => "1 fire-trail cosmetic move",
            Reward::Shield => "1 shield (undo)",
            Reward::HighlightBestMove { seconds: 1 } => "highlight best move 1s",
            Reward::HighlightBestMove { .. } => "2s best-move highlight",
            Reward::TimeBonus { seconds: 5 } => "+5s",
            Reward::TimeBonus { .. } => "+20s",
            Reward::FreezeOpponent => "freeze opponent 1s",
            Reward::DoubleMoveToken => "double-move token",
            Reward::Theme => "10–20s cosmetic theme",
        }
    }
}

const HUNDRED_POOL: [Reward; 4] = [
    Reward::HintToken,
    Reward::FireTrailMove,
    Reward::Shield,
    Reward::HighlightBestMove { seconds: 1 },
];
const FIVE_HUNDRED_POOL: [Reward; 2] = [Reward::TimeBonus { seconds: 5 }, Reward::FreezeOpponent];
const FIVE_THOUSAND_POOL: [Reward; 4] = [
    Reward::TimeBonus { seconds: 20 },
    Reward::DoubleMoveToken,
    Reward::HighlightBestMove { seconds: 2 },
    Reward::Theme,
];

/// Rewards one milestone draws from; empty for the cosmetic-only ones.
pub fn reward_pool(milestone: u32) -> &'static [Reward] {
    match milestone {
        100 => &HUNDRED_POOL,
        500 => &FIVE_HUNDRED_POOL,
        5000 => &FIVE_THOUSAND_POOL,
        _ => &[],
    }
}

pub fn roll_reward<G: Rng + ?Sized>(milestone: u32, rng: &mut G) -> Option<Reward> {
    reward_pool(milestone).choose(rng).copied()
}

/// Milestones crossed going from `previous` to `total` that were not reached
/// before, highest first.
pub fn newly_crossed(previous: u64, total: u64, reached: &BTreeSet<u32>) -> Vec<u32> {
    MILESTONES
        .iter()
        .rev()
        .copied()
        .filter(|m| previous < u64::from(*m) && u64::from(*m) <= total)
        .filter(|m| !reached.contains(m))
        .collect()
}
