use std::collections::{BTreeSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::game_state::{PieceKind, Side};

/// Number of arena event fingerprints remembered for duplicate suppression.
pub const APPLIED_EVENT_MEMORY: usize = 64;
/// Number of monitor entries kept in the shared blob.
pub const MONITOR_EVENT_LIMIT: usize = 50;

/// Counters and flags owned by one side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SidePerks {
    pub shield_uses: u32,
    pub fire_trail_moves: u32,
    pub hint_token: bool,
    /// Seconds granted while the clocks were not running yet.
    pub time_bonus_pending: u32,
    pub freeze_opponent_until: Option<DateTime<Utc>>,
    pub best_move_highlight_until: Option<DateTime<Utc>>,
    pub theme_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PieceSwap {
    pub target: Side,
    /// Swap mode is live: the target must swap before moving.
    pub armed: bool,
    pub nonce: u64,
    /// Last nonce that was activated; a drop activates at most once.
    pub consumed_nonce: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoubleMove {
    pub target: Side,
    /// Zero while the grant waits for the target's turn.
    pub moves_remaining_in_turn: u8,
}

impl DoubleMove {
    pub fn is_active(&self) -> bool {
        self.moves_remaining_in_turn > 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmpoweredPiece {
    pub square: String,
    pub owner: Side,
    pub piece_type: PieceKind,
}

/// All perk state of one session, merged as a single value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerkState {
    pub white: SidePerks,
    pub black: SidePerks,
    pub piece_swap: Option<PieceSwap>,
    #[serde(default)]
    pub swap_nonce: u64,
    pub double_move: Option<DoubleMove>,
    pub empowered_piece: Option<EmpoweredPiece>,
    #[serde(default)]
    pub total_points: u64,
    #[serde(default)]
    pub reached_milestones: BTreeSet<u32>,
    #[serde(default)]
    pub applied_events: VecDeque<String>,
}

impl PerkState {
    pub fn side(&self, side: Side) -> &SidePerks {
        match side {
            Side::White => &self.white,
            Side::Black => &self.black,
        }
    }

    pub fn side_mut(&mut self, side: Side) -> &mut SidePerks {
        match side {
            Side::White => &mut self.white,
            Side::Black => &mut self.black,
        }
    }

    /// True while the opponent of `side` holds an unexpired freeze.
    pub fn is_frozen(&self, side: Side, now: DateTime<Utc>) -> bool {
        self.side(side.opponent())
            .freeze_opponent_until
            .map_or(false, |until| until > now)
    }

    pub fn swap_armed_for(&self, side: Side) -> bool {
        self.piece_swap
            .as_ref()
            .map_or(false, |swap| swap.armed && swap.target == side)
    }

    pub fn double_move_active_for(&self, side: Side) -> bool {
        self.double_move
            .as_ref()
            .map_or(false, |grant| grant.target == side && grant.is_active())
    }

    /// Activates deferred grants whose target has just been handed the move.
    /// Returns true if anything changed.
    pub fn activate_for_turn(&mut self, side_to_move: Side) -> bool {
        let mut changed = false;
        if let Some(swap) = self.piece_swap.as_mut() {
            if swap.target == side_to_move && swap.consumed_nonce != Some(swap.nonce) {
                swap.armed = true;
                swap.consumed_nonce = Some(swap.nonce);
                changed = true;
            }
        }
        if let Some(grant) = self.double_move.as_mut() {
            if grant.target == side_to_move && !grant.is_active() {
                grant.moves_remaining_in_turn = 2;
                changed = true;
            }
        }
        changed
    }

    /// Drops every armed or deferred effect. Used when the game ends.
    pub fn cancel_pending(&mut self) {
        self.piece_swap = None;
        self.double_move = None;
        self.empowered_piece = None;
        for side in [Side::White, Side::Black] {
            let perks = self.side_mut(side);
            perks.freeze_opponent_until = None;
            perks.best_move_highlight_until = None;
        }
    }

    pub fn has_applied(&self, fingerprint: &str) -> bool {
        self.applied_events.iter().any(|seen| seen == fingerprint)
    }

    pub fn remember_event(&mut self, fingerprint: String) {
        self.applied_events.push_back(fingerprint);
        while self.applied_events.len() > APPLIED_EVENT_MEMORY {
            self.applied_events.pop_front();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArenaStatus {
    Pending,
    Live,
    Completed,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoostInfo {
    pub booster_name: String,
    pub amount: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropInfo {
    pub item_name: String,
    pub target_player_name: String,
    pub purchaser_name: String,
    pub cost: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageInfo {
    pub package_name: String,
    pub player_name: String,
    pub cost: u64,
    pub move_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MilestoneNotice {
    pub milestone: u32,
    pub points: u64,
    pub beneficiary: Side,
    pub reward: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorEntry {
    pub kind: String,
    pub summary: String,
    pub at: DateTime<Utc>,
}

/// Viewer-facing arena sub-state mirrored to both peers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArenaMonitor {
    pub status_label: Option<ArenaStatus>,
    pub countdown: Option<u32>,
    pub arena_active: bool,
    pub last_boost: Option<BoostInfo>,
    pub last_drop: Option<DropInfo>,
    pub last_package: Option<PackageInfo>,
    pub last_milestone: Option<MilestoneNotice>,
    #[serde(default)]
    pub events: VecDeque<MonitorEntry>,
}

impl ArenaMonitor {
    pub fn log(&mut self, kind: &str, summary: String, at: DateTime<Utc>) {
        self.events.push_back(MonitorEntry {
            kind: kind.to_string(),
            summary,
            at,
        });
        while self.events.len() > MONITOR_EVENT_LIMIT {
            self.events.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn deferred_swap_activates_once_per_nonce() {
        let mut perks = PerkState {
            piece_swap: Some(PieceSwap {
                target: Side::Black,
                armed: false,
                nonce: 1,
                consumed_nonce: None,
            }),
            ..PerkState::default()
        };

        assert!(!perks.activate_for_turn(Side::White));
        assert!(perks.activate_for_turn(Side::Black));
        assert!(perks.swap_armed_for(Side::Black));

        perks.piece_swap.as_mut().unwrap().armed = false;
        assert!(!perks.activate_for_turn(Side::Black));
    }

    #[test]
    fn freeze_belongs_to_the_opponent() {
        let now = Utc::now();
        let mut perks = PerkState::default();
        perks.white.freeze_opponent_until = Some(now + Duration::seconds(1));

        assert!(perks.is_frozen(Side::Black, now));
        assert!(!perks.is_frozen(Side::White, now));
        assert!(!perks.is_frozen(Side::Black, now + Duration::seconds(2)));
    }

    #[test]
    fn event_memory_is_bounded() {
        let mut perks = PerkState::default();
        for n in 0..(APPLIED_EVENT_MEMORY + 5) {
            perks.remember_event(format!("evt-{n}"));
        }
        assert_eq!(perks.applied_events.len(), APPLIED_EVENT_MEMORY);
        assert!(!perks.has_applied("evt-0"));
        assert!(perks.has_applied(&format!("evt-{}", APPLIED_EVENT_MEMORY + 4)));
    }
}
