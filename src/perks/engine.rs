use chess::Square;
use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::game::position::{parse_square, Position};
use crate::game::rules::MoveOutcome;
use crate::models::{
    ArenaStatus, BoostInfo, DoubleMove, DropInfo, EmpoweredPiece, GameSession, MilestoneNotice, PerkState, PieceKind,
    PieceSwap, SessionPatch, SessionStatus, Side,
};
use crate::perks::events::{ArenaEnvelope, ArenaEvent, ItemKind};
use crate::perks::milestones::{newly_crossed, roll_reward, Reward};

pub const CHRONO_CHIP_SECONDS: u32 = 10;
pub const FREEZE_ENEMY_CLOCK_SECONDS: u32 = 10;
pub const EMPOWER_CAPTURE_BONUS: u32 = 20;
pub const FREEZE_OPPONENT_SECONDS: i64 = 1;
pub const COUNTDOWN_START: u32 = 60;

/// What merging one arena event produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeOutcome {
    /// Absolute writes against the record the merge was computed from.
    pub patch: SessionPatch,
    pub milestone: Option<MilestoneNotice>,
    pub duplicate: bool,
}

/// Folds one arena event into a freshly read session record.
///
/// Every value in the returned patch is absolute, so writing it twice, or
/// writing it and then receiving its echo, has no further effect.
pub fn merge_event<G: Rng + ?Sized>(
    fresh: &GameSession,
    envelope: &ArenaEnvelope,
    rng: &mut G,
    now: DateTime<Utc>,
) -> MergeOutcome {
    if fresh.perks.has_applied(&envelope.fingerprint) {
        debug!("arena event {} already applied to {}", envelope.fingerprint, fresh.id);
        return MergeOutcome {
            duplicate: true,
            ..MergeOutcome::default()
        };
    }

    let mut next = fresh.clone();
    next.perks.remember_event(envelope.fingerprint.clone());
    let finished = fresh.is_finished();
    let mut milestone = None;

    match &envelope.event {
        ArenaEvent::CountdownStarted => {
            next.arena.status_label = Some(ArenaStatus::Pending);
            next.arena.countdown = Some(COUNTDOWN_START);
            next.arena.log("countdown_started", "arena countdown started".to_string(), now);
        }
        ArenaEvent::CountdownUpdate { seconds_remaining } => {
            next.arena.countdown = Some(*seconds_remaining);
            next.arena.log("countdown_update", format!("{seconds_remaining}s until the arena opens"), now);
        }
        ArenaEvent::ArenaBegins => {
            next.arena.status_label = Some(ArenaStatus::Live);
            next.arena.arena_active = true;
            next.arena.log("arena_begins", "arena is live".to_string(), now);
        }
        ArenaEvent::GameCompleted => {
            next.arena.status_label = Some(ArenaStatus::Completed);
            next.arena.arena_active = false;
            next.arena.log("game_completed", "arena completed".to_string(), now);
        }
        ArenaEvent::GameStopped => {
            next.arena.status_label = Some(ArenaStatus::Stopped);
            next.arena.arena_active = false;
            next.arena.log("game_stopped", "arena stopped".to_string(), now);
        }
        ArenaEvent::PackageDrop(package) => match package {
            Some(package) => {
                next.arena.log(
                    "package_drop",
                    format!("{} earned {}", package.player_name, package.package_name),
                    now,
                );
                next.arena.last_package = Some(package.clone());
            }
            None => debug!("package drop without an eligible package"),
        },
        ArenaEvent::PlayerBoost {
            booster_name,
            amount,
            beneficiary,
        } => {
            next.arena.last_boost = Some(BoostInfo {
                booster_name: booster_name.clone(),
                amount: *amount,
            });
            next.arena.log("player_boost_activated", format!("{booster_name} boosted {amount}"), now);
            if finished {
                info!("ignoring boost points for finished game {}", fresh.id);
            } else {
                milestone = add_points(&mut next, *amount, beneficiary.unwrap_or(Side::White), rng, now);
            }
        }
        ArenaEvent::ItemDrop {
            item,
            item_name,
            target,
            purchaser,
            cost,
        } => {
            next.arena.last_drop = Some(DropInfo {
                item_name: item_name.clone(),
                target_player_name: target_label(*target).to_string(),
                purchaser_name: purchaser.clone(),
                cost: *cost,
            });
            next.arena.log(
                "immediate_item_drop",
                format!("{purchaser} dropped {item_name} on {}", target_label(*target)),
                now,
            );
            if finished {
                info!("ignoring {} for finished game {}", item_name, fresh.id);
            } else {
                apply_item(&mut next, item, *target, rng);
            }
        }
    }

    settle_time_bonuses(&mut next);
    MergeOutcome {
        patch: diff(fresh, &next),
        milestone,
        duplicate: false,
    }
}

fn target_label(side: Side) -> &'static str {
    match side {
        Side::White => "white",
        Side::Black => "black",
    }
}

/// Only fields the merge can touch are compared.
fn diff(fresh: &GameSession, next: &GameSession) -> SessionPatch {
    let mut patch = SessionPatch {
        perks: Some(next.perks.clone()),
        ..SessionPatch::default()
    };
    if next.arena != fresh.arena {
        patch.arena = Some(next.arena.clone());
    }
    if next.white_time_remaining != fresh.white_time_remaining {
        patch.white_time_remaining = Some(next.white_time_remaining);
    }
    if next.black_time_remaining != fresh.black_time_remaining {
        patch.black_time_remaining = Some(next.black_time_remaining);
    }
    patch
}

fn add_points<G: Rng + ?Sized>(
    next: &mut GameSession,
    amount: u64,
    beneficiary: Side,
    rng: &mut G,
    now: DateTime<Utc>,
) -> Option<MilestoneNotice> {
    let previous = next.perks.total_points;
    let total = previous.saturating_add(amount);
    next.perks.total_points = total;

    let crossed = newly_crossed(previous, total, &next.perks.reached_milestones);
    next.perks.reached_milestones.extend(crossed.iter().copied());
    let highest = *crossed.first()?;

    let reward = roll_reward(highest, rng);
    if let Some(reward) = reward {
        apply_reward(next, beneficiary, reward, rng, now);
    }
    info!(
        "game {} reached milestone {} at {} points (reward {:?})",
        next.id,
        highest,
        total,
        reward.map(|r| r.label())
    );
    let notice = MilestoneNotice {
        milestone: highest,
        points: total,
        beneficiary,
        reward: reward.map(|r| r.label().to_string()),
        at: now,
    };
    next.arena.log("milestone", format!("{highest} points reached"), now);
    next.arena.last_milestone = Some(notice.clone());
    Some(notice)
}

/// Grants a milestone reward to `side`.
pub fn apply_reward<G: Rng + ?Sized>(next: &mut GameSession, side: Side, reward: Reward, rng: &mut G, now: DateTime<Utc>) {
    match reward {
        Reward::HintToken => next.perks.side_mut(side).hint_token = true,
        Reward::FireTrailMove => next.perks.side_mut(side).fire_trail_moves += 1,
        Reward::Shield => next.perks.side_mut(side).shield_uses += 1,
        Reward::HighlightBestMove { seconds } => {
            next.perks.side_mut(side).best_move_highlight_until = Some(now + Duration::seconds(i64::from(seconds)));
        }
        Reward::TimeBonus { seconds } => {
            if next.status == SessionStatus::Playing {
                let remaining = next.time_remaining(side);
                next.set_time_remaining(side, remaining.saturating_add(seconds));
            } else {
                next.perks.side_mut(side).time_bonus_pending += seconds;
            }
        }
        Reward::FreezeOpponent => {
            next.perks.side_mut(side).freeze_opponent_until = Some(now + Duration::seconds(FREEZE_OPPONENT_SECONDS));
        }
        Reward::DoubleMoveToken => arm_double_move(next, side),
        Reward::Theme => {
            let seconds = rng.gen_range(10..=20);
            next.perks.side_mut(side).theme_until = Some(now + Duration::seconds(seconds));
        }
    }
}

/// Applies a purchased item aimed at `target`.
pub fn apply_item<G: Rng + ?Sized>(next: &mut GameSession, item: &ItemKind, target: Side, rng: &mut G) {
    match item {
        ItemKind::ShieldMove => next.perks.side_mut(target).shield_uses += 1,
        ItemKind::ChronoChip => {
            let remaining = next.time_remaining(target);
            next.set_time_remaining(target, remaining.saturating_add(CHRONO_CHIP_SECONDS));
        }
        ItemKind::FreezeEnemyClock => {
            let remaining = next.time_remaining(target);
            next.set_time_remaining(target, remaining.saturating_sub(FREEZE_ENEMY_CLOCK_SECONDS));
        }
        ItemKind::PieceSwap => arm_piece_swap(next, target),
        ItemKind::DoubleMove => arm_double_move(next, target),
        ItemKind::PieceEmpower => empower_enemy_piece(next, target, rng),
        ItemKind::Other(name) => debug!("item {} has no effect on the board", name),
    }
}

fn arm_piece_swap(next: &mut GameSession, target: Side) {
    next.perks.swap_nonce += 1;
    next.perks.piece_swap = Some(PieceSwap {
        target,
        armed: false,
        nonce: next.perks.swap_nonce,
        consumed_nonce: None,
    });
    if next.side_to_move == target {
        next.perks.activate_for_turn(target);
    }
}

fn arm_double_move(next: &mut GameSession, target: Side) {
    if next.perks.double_move_active_for(target) {
        debug!("double move already running for {:?}", target);
        return;
    }
    next.perks.double_move = Some(DoubleMove {
        target,
        moves_remaining_in_turn: 0,
    });
    if next.side_to_move == target {
        next.perks.activate_for_turn(target);
    }
}

/// Flags a random non-king piece of the side opposite `target`.
fn empower_enemy_piece<G: Rng + ?Sized>(next: &mut GameSession, target: Side, rng: &mut G) {
    let owner = target.opponent();
    let position = match Position::from_fen(&next.position) {
        Ok(position) => position,
        Err(e) => {
            warn!("cannot empower a piece in game {}: {}", next.id, e);
            return;
        }
    };
    let candidates: Vec<_> = position
        .pieces_of(owner)
        .into_iter()
        .filter(|(_, kind)| *kind != PieceKind::King)
        .collect();
    match candidates.choose(rng) {
        Some((square, kind)) => {
            info!("empowered {:?} {:?} on {} in game {}", owner, kind, square, next.id);
            next.perks.empowered_piece = Some(EmpoweredPiece {
                square: square.to_string(),
                owner,
                piece_type: *kind,
            });
        }
        None => warn!("{:?} has no piece to empower in game {}", owner, next.id),
    }
}

/// Moves pending time bonuses onto the clocks once they are running.
pub fn settle_time_bonuses(next: &mut GameSession) {
    if next.status != SessionStatus::Playing {
        return;
    }
    for side in [Side::White, Side::Black] {
        let pending = std::mem::take(&mut next.perks.side_mut(side).time_bonus_pending);
        if pending > 0 {
            let remaining = next.time_remaining(side);
            next.set_time_remaining(side, remaining.saturating_add(pending));
        }
    }
}

/// Follows the empowered piece through a committed move.
///
/// Returns the side to credit with the capture bonus when the flagged piece
/// was just taken.
pub fn track_empowered(next: &mut GameSession, outcome: &MoveOutcome) -> Option<Side> {
    let tracked = next.perks.empowered_piece.clone()?;
    let captured_here = outcome
        .captured_square
        .map_or(false, |square| square.to_string() == tracked.square);
    if captured_here {
        next.perks.empowered_piece = None;
        let remaining = next.time_remaining(outcome.mover);
        next.set_time_remaining(outcome.mover, remaining.saturating_add(EMPOWER_CAPTURE_BONUS));
        info!(
            "{:?} captured the empowered {:?} in game {}",
            outcome.mover, tracked.piece_type, next.id
        );
        return Some(outcome.mover);
    }
    if outcome.from.to_string() == tracked.square {
        // a promoted pawn stays flagged as its new piece
        let kind = outcome
            .position
            .piece_at(outcome.to)
            .map_or(outcome.moved_piece, |(kind, _)| kind);
        if let Some(piece) = next.perks.empowered_piece.as_mut() {
            piece.square = outcome.to.to_string();
            piece.piece_type = kind;
        }
    }
    relocate_empowered(&mut next.perks, &outcome.position);
    None
}

/// Carries the empowered flag across a piece swap that moved the flagged piece.
pub fn follow_swap(perks: &mut PerkState, a: Square, b: Square) {
    let Some(piece) = perks.empowered_piece.as_mut() else {
        return;
    };
    if piece.square == a.to_string() {
        piece.square = b.to_string();
    } else if piece.square == b.to_string() {
        piece.square = a.to_string();
    }
}

/// Re-finds the empowered piece by owner and type when it is no longer on its
/// square, clearing it when it is gone.
pub fn relocate_empowered(perks: &mut PerkState, position: &Position) {
    let Some(tracked) = perks.empowered_piece.clone() else {
        return;
    };
    let on_square = parse_square(&tracked.square)
        .ok()
        .and_then(|square| position.piece_at(square));
    if on_square == Some((tracked.piece_type, tracked.owner)) {
        return;
    }
    match position.find_piece(tracked.owner, tracked.piece_type) {
        Some(square) => {
            debug!("empowered piece relocated from {} to {}", tracked.square, square);
            if let Some(piece) = perks.empowered_piece.as_mut() {
                piece.square = square.to_string();
            }
        }
        None => {
            debug!("empowered piece is gone, clearing it");
            perks.empowered_piece = None;
        }
    }
}
