use chess::Square;
use chrono::{DateTime, Utc};

use crate::game::position::Position;
use crate::game::rules::MoveOutcome;
use crate::models::{GameSession, MoveRecord, SessionPatch, SessionStatus, Side, Winner};
use crate::perks::engine::{follow_swap, relocate_empowered, settle_time_bonuses, track_empowered};

/// A perk-state change made by a local operation.
#[derive(Debug, Clone, PartialEq)]
pub enum PerkOp {
    UseFireTrail(Side),
    UseShield(Side),
    UseHint(Side),
    /// First ply of a double move kept the turn, or the grant is spent.
    DoubleMoveStep { kept: bool },
    ConsumeSwap,
    ActivateTurn(Side),
    TrackMove(Box<MoveOutcome>),
    /// A piece swap exchanged these two squares.
    FollowSwap(Square, Square),
    Relocate(Position),
    SettleBonuses,
}

/// One replayable step of a local write.
///
/// Deltas (clock charges, credits, counter decrements) are kept as deltas so
/// the write can be rebuilt against a freshly read record.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOp {
    SetBoard { position: String, side_to_move: Side },
    ChargeClock { side: Side, seconds: u32 },
    StartTurn(DateTime<Utc>),
    Finish { winner: Winner, resigned: Option<Side> },
    SetDrawOffer(Option<Side>),
    Perk(PerkOp),
}

impl RecordOp {
    pub fn changes_board(&self) -> bool {
        matches!(self, RecordOp::SetBoard { .. })
    }
}

fn apply_perk(next: &mut GameSession, op: &PerkOp) {
    match op {
        PerkOp::UseFireTrail(side) => {
            let perks = next.perks.side_mut(*side);
            perks.fire_trail_moves = perks.fire_trail_moves.saturating_sub(1);
        }
        PerkOp::UseShield(side) => {
            let perks = next.perks.side_mut(*side);
            perks.shield_uses = perks.shield_uses.saturating_sub(1);
        }
        PerkOp::UseHint(side) => next.perks.side_mut(*side).hint_token = false,
        PerkOp::DoubleMoveStep { kept } => {
            if *kept {
                if let Some(grant) = next.perks.double_move.as_mut() {
                    grant.moves_remaining_in_turn = 1;
                }
            } else {
                next.perks.double_move = None;
            }
        }
        PerkOp::ConsumeSwap => {
            if let Some(swap) = next.perks.piece_swap.as_mut() {
                swap.armed = false;
                swap.consumed_nonce = Some(swap.nonce);
            }
        }
        PerkOp::ActivateTurn(side) => {
            next.perks.activate_for_turn(*side);
        }
        PerkOp::TrackMove(outcome) => {
            track_empowered(next, outcome);
        }
        PerkOp::FollowSwap(a, b) => follow_swap(&mut next.perks, *a, *b),
        PerkOp::Relocate(position) => relocate_empowered(&mut next.perks, position),
        PerkOp::SettleBonuses => settle_time_bonuses(next),
    }
}

/// Replays `ops` on top of `base`.
pub fn apply_ops(base: &GameSession, ops: &[RecordOp]) -> GameSession {
    let mut next = base.clone();
    for op in ops {
        match op {
            RecordOp::SetBoard { position, side_to_move } => {
                next.position = position.clone();
                next.side_to_move = *side_to_move;
            }
            RecordOp::ChargeClock { side, seconds } => {
                let remaining = next.time_remaining(*side);
                next.set_time_remaining(*side, remaining.saturating_sub(*seconds));
            }
            RecordOp::StartTurn(at) => next.turn_started_at = Some(*at),
            RecordOp::Finish { winner, resigned } => {
                next.status = SessionStatus::Finished;
                next.winner = Some(*winner);
                next.resignation_by = *resigned;
                next.turn_started_at = None;
                next.draw_offered_by = None;
                next.perks.cancel_pending();
            }
            RecordOp::SetDrawOffer(offer) => next.draw_offered_by = *offer,
            RecordOp::Perk(op) => apply_perk(&mut next, op),
        }
    }
    next
}

/// A local mutation on its way to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingWrite {
    pub write_id: u64,
    /// Revision of the record `patch` was computed against.
    pub base_revision: u64,
    /// Board the write was validated on.
    pub base_position: String,
    pub base_side_to_move: Side,
    pub ops: Vec<RecordOp>,
    pub patch: SessionPatch,
    pub move_record: Option<MoveRecord>,
    /// Most recent move records to delete once the patch is stored.
    pub undo_moves: usize,
}

impl PendingWrite {
    pub fn new(write_id: u64, base: &GameSession, ops: Vec<RecordOp>) -> Self {
        let next = apply_ops(base, &ops);
        PendingWrite {
            write_id,
            base_revision: base.revision,
            base_position: base.position.clone(),
            base_side_to_move: base.side_to_move,
            patch: SessionPatch::between(base, &next),
            ops,
            move_record: None,
            undo_moves: 0,
        }
    }

    pub fn with_move(mut self, record: MoveRecord) -> Self {
        self.move_record = Some(record);
        self
    }

    pub fn undoing(mut self, moves: usize) -> Self {
        self.undo_moves = moves;
        self
    }

    pub fn changes_board(&self) -> bool {
        self.ops.iter().any(RecordOp::changes_board)
    }

    /// Whether `fresh` holds a different board than the one this write moved from.
    /// Such a write must not be replayed on top of it.
    pub fn board_moved_under(&self, fresh: &GameSession) -> bool {
        self.changes_board()
            && (fresh.position != self.base_position || fresh.side_to_move != self.base_side_to_move)
    }

    /// Recomputes the patch against a newer copy of the record.
    pub fn rebase(&mut self, fresh: &GameSession) {
        if fresh.revision == self.base_revision {
            return;
        }
        let next = apply_ops(fresh, &self.ops);
        self.patch = SessionPatch::between(fresh, &next);
        self.base_revision = fresh.revision;
    }
}
