use chess::{MoveGen, Piece, Square};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::{PersistError, SessionError, SessionResult};
use crate::game::board_machine::{BoardStateMachine, MoveStep, TurnOverride};
use crate::game::clock::{turn_charge, ClockView};
use crate::game::notation::san;
use crate::game::position::Position;
use crate::game::rules::{MoveOutcome, MoveRequest, Rules, StandardRules};
use crate::game::snapshot_store::{Snapshot, SnapshotMirror, SnapshotStore};
use crate::models::{GameSession, MoveRecord, PieceKind, SessionStatus, Side, Winner};
use crate::sync::evaluation::{Evaluation, EvaluationTracker};
use crate::sync::write::{apply_ops, PendingWrite, PerkOp, RecordOp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    AwaitingRemoteAck { write_id: u64 },
}

/// Local multi-step operations that produce the next canonical state
/// themselves. Remote records are held back while one runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InFlight {
    PieceSwap,
    DoubleMove,
    ShieldUndo,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MoveAttempt {
    NeedsPromotion(MoveRequest),
    Committed(PendingWrite),
}

/// How a remote record's board relates to the local one.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteChange {
    NoBoardChange,
    OpponentMove { mover: Side, notation: String },
    /// Two plies by the same side (double move).
    ExtraPly { mover: Side, notations: [String; 2] },
    PieceSwap { mover: Side },
    /// The board went back to the snapshot at `index` (shield).
    Rewind { index: usize },
    Unexplained,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RemoteOutcome {
    /// Older than or equal to what is already known.
    Ignored,
    /// Held until the local operation in flight is stored.
    Deferred,
    Adopted(RemoteChange),
    /// The frozen opponent moved anyway; the write puts the board back.
    RejectedFrozen(PendingWrite),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckOutcome {
    /// A remote change was held back; re-read the record.
    pub refetch: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Abandon {
    Delete,
    Write(PendingWrite),
}

#[derive(Debug, Clone)]
struct Checkpoint {
    record: GameSession,
    snapshots: Vec<Snapshot>,
}

/// Board part of a FEN: placement and side to move.
fn board_key(position: &Position) -> String {
    position.to_fen().split_whitespace().take(2).collect::<Vec<_>>().join(" ")
}

fn placement(position: &Position) -> String {
    position.to_fen().split_whitespace().next().unwrap_or_default().to_string()
}

fn snapshot_key(snapshot: &Snapshot) -> Option<String> {
    snapshot.to_position().ok().map(|position| board_key(&position))
}

/// The position a record describes, with its stored side to move.
pub fn position_of(record: &GameSession) -> SessionResult<Position> {
    Position::from_fen(&record.position)?
        .with_side_to_move(record.side_to_move)
        .ok_or_else(|| SessionError::InvalidPosition(record.position.clone()))
}

/// One player's view of a shared session.
///
/// Every local operation is applied optimistically and returns the
/// [`PendingWrite`] the caller must persist, then report back with
/// [`ack_write`](Self::ack_write) or [`fail_write`](Self::fail_write).
pub struct ClientSession<R: Rules = StandardRules> {
    seat: Side,
    machine: BoardStateMachine<R>,
    record: GameSession,
    snapshots: SnapshotStore,
    phase: SyncPhase,
    in_flight: Option<InFlight>,
    /// Write whose ack ends the operation in flight.
    closing_write: Option<u64>,
    deferred: Option<GameSession>,
    checkpoint: Option<Checkpoint>,
    pending_swap: Option<(Square, Square, Position)>,
    next_write_id: u64,
    evaluations: EvaluationTracker,
}

impl ClientSession<StandardRules> {
    /// Opens a session with the standard rules, mirroring snapshots when configured.
    pub fn open(record: GameSession, seat: Side, config: &SessionConfig, now: DateTime<Utc>) -> SessionResult<Self> {
        let position = position_of(&record)?;
        let initial = Snapshot::of(&position, now);
        let snapshots = match &config.snapshot_dir {
            Some(dir) => SnapshotStore::with_mirror(record.id.clone(), initial, SnapshotMirror::new(dir)),
            None => SnapshotStore::new(record.id.clone(), initial),
        };
        ClientSession::new(StandardRules, record, seat, snapshots)
    }
}

impl<R: Rules> ClientSession<R> {
    pub fn new(rules: R, record: GameSession, seat: Side, snapshots: SnapshotStore) -> SessionResult<Self> {
        let position = position_of(&record)?;
        info!("Opened game {} as {:?} at revision {}", record.id, seat, record.revision);
        Ok(ClientSession {
            seat,
            machine: BoardStateMachine::new(rules, position),
            record,
            snapshots,
            phase: SyncPhase::Idle,
            in_flight: None,
            closing_write: None,
            deferred: None,
            checkpoint: None,
            pending_swap: None,
            next_write_id: 1,
            evaluations: EvaluationTracker::default(),
        })
    }

    pub fn seat(&self) -> Side {
        self.seat
    }

    pub fn record(&self) -> &GameSession {
        &self.record
    }

    pub fn position(&self) -> &Position {
        self.machine.position()
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn in_flight(&self) -> Option<InFlight> {
        self.in_flight
    }

    pub fn has_deferred(&self) -> bool {
        self.deferred.is_some()
    }

    pub fn clock(&self) -> ClockView {
        ClockView::from_session(&self.record)
    }

    pub fn machine(&self) -> &BoardStateMachine<R> {
        &self.machine
    }

    pub fn select(&mut self, square: Square) -> SessionResult<Vec<Square>> {
        self.guard_playing()?;
        self.machine.select(self.seat, square).map(<[Square]>::to_vec)
    }

    fn guard_playing(&self) -> SessionResult<()> {
        match self.record.status {
            SessionStatus::Finished => Err(SessionError::GameFinished),
            SessionStatus::Waiting => Err(SessionError::GameNotStarted),
            SessionStatus::Playing => Ok(()),
        }
    }

    fn guard_idle(&self) -> SessionResult<()> {
        match self.in_flight {
            Some(_) => Err(SessionError::MutationInFlight),
            None => Ok(()),
        }
    }

    fn take_checkpoint(&self) -> Checkpoint {
        Checkpoint {
            record: self.record.clone(),
            snapshots: self.snapshots.entries().to_vec(),
        }
    }

    /// Keeps the oldest checkpoint while writes are outstanding.
    fn hold(&mut self, checkpoint: Checkpoint) {
        if self.checkpoint.is_none() {
            self.checkpoint = Some(checkpoint);
        }
    }

    fn stage(&mut self, ops: Vec<RecordOp>) -> PendingWrite {
        let write_id = self.next_write_id;
        self.next_write_id += 1;
        let write = PendingWrite::new(write_id, &self.record, ops);
        self.record = apply_ops(&self.record, &write.ops);
        self.phase = SyncPhase::AwaitingRemoteAck { write_id };
        debug!("staged write {} for game {}", write_id, self.record.id);
        write
    }

    fn move_record(&self, notation: String, position_after: &Position, explanation: Option<String>) -> MoveRecord {
        MoveRecord {
            number: u32::try_from(self.snapshots.len().saturating_sub(1)).unwrap_or(u32::MAX),
            notation,
            position_after: position_after.to_fen(),
            player_color: self.seat,
            explanation,
        }
    }

    /// Validates and, unless a promotion choice is needed, commits a local move.
    pub fn attempt_move(
        &mut self,
        from: Square,
        to: Square,
        promotion: Option<Piece>,
        now: DateTime<Utc>,
    ) -> SessionResult<MoveAttempt> {
        self.guard_playing()?;
        if self.in_flight.is_some() && self.in_flight != Some(InFlight::DoubleMove) {
            return Err(SessionError::MutationInFlight);
        }
        if self.record.side_to_move != self.seat {
            return Err(SessionError::NotYourTurn(self.seat));
        }
        if self.record.perks.is_frozen(self.seat, now) {
            return Err(SessionError::Frozen(self.seat));
        }
        if self.record.perks.swap_armed_for(self.seat) {
            return Err(SessionError::SwapPending);
        }
        let request = MoveRequest { from, to, promotion };
        match self.machine.request_move(self.seat, request)? {
            MoveStep::NeedsPromotion(request) => Ok(MoveAttempt::NeedsPromotion(request)),
            MoveStep::Ready(outcome) => self.commit_outcome(outcome, now).map(MoveAttempt::Committed),
        }
    }

    pub fn choose_promotion(&mut self, piece: Piece, now: DateTime<Utc>) -> SessionResult<PendingWrite> {
        self.guard_playing()?;
        let outcome = self.machine.choose_promotion(piece)?;
        self.commit_outcome(outcome, now)
    }

    pub fn cancel_promotion(&mut self) {
        self.machine.cancel_pending();
    }

    fn commit_outcome(&mut self, outcome: MoveOutcome, now: DateTime<Utc>) -> SessionResult<PendingWrite> {
        let grant = self
            .record
            .perks
            .double_move
            .as_ref()
            .filter(|grant| grant.target == self.seat && grant.is_active())
            .map(|grant| grant.moves_remaining_in_turn);
        let turn = match grant {
            Some(remaining) if remaining >= 2 => TurnOverride::Keep,
            _ => TurnOverride::Alternate,
        };

        let checkpoint = self.take_checkpoint();
        let committed = self.machine.commit(&outcome, turn)?;
        self.hold(checkpoint);
        self.snapshots
            .record(Snapshot::of(&outcome.before, now).before_move(self.seat, outcome.notation.clone()));

        let next_side = committed.position.side_to_move();
        let mut ops = vec![RecordOp::ChargeClock {
            side: self.seat,
            seconds: turn_charge(&self.record, self.seat, now),
        }];
        if self.record.perks.side(self.seat).fire_trail_moves > 0 {
            ops.push(RecordOp::Perk(PerkOp::UseFireTrail(self.seat)));
        }
        ops.push(RecordOp::Perk(PerkOp::TrackMove(Box::new(outcome.clone()))));
        if grant.is_some() {
            ops.push(RecordOp::Perk(PerkOp::DoubleMoveStep {
                kept: committed.turn_kept,
            }));
        }
        ops.push(RecordOp::SetBoard {
            position: committed.position.to_fen(),
            side_to_move: next_side,
        });
        ops.push(RecordOp::StartTurn(now));
        if !committed.turn_kept {
            ops.push(RecordOp::Perk(PerkOp::ActivateTurn(next_side)));
            ops.push(RecordOp::Perk(PerkOp::SettleBonuses));
        }
        if let Some(reason) = self.machine.game_over() {
            info!("game {} is over: {:?}", self.record.id, reason);
            ops.push(RecordOp::Finish {
                winner: reason.winner(),
                resigned: None,
            });
        }

        let record = self.move_record(outcome.notation.clone(), &committed.position, None);
        let write = self.stage(ops).with_move(record);
        if committed.turn_kept {
            debug!("{:?} keeps the turn for the second ply", self.seat);
            self.in_flight = Some(InFlight::DoubleMove);
        } else if self.in_flight == Some(InFlight::DoubleMove) {
            self.closing_write = Some(write.write_id);
        }
        Ok(write)
    }

    /// Starts an armed piece swap. Returns the swapped position for the
    /// animation; [`finish_piece_swap`](Self::finish_piece_swap) makes it canonical.
    pub fn begin_piece_swap(&mut self, a: Square, b: Square) -> SessionResult<Position> {
        self.guard_playing()?;
        self.guard_idle()?;
        if !self.record.perks.swap_armed_for(self.seat) {
            return Err(SessionError::NoSwapAvailable);
        }
        if self.record.side_to_move != self.seat {
            return Err(SessionError::NotYourTurn(self.seat));
        }
        let position = *self.machine.position();
        for square in [a, b] {
            match position.piece_at(square) {
                Some((kind, owner)) if owner == self.seat && kind != PieceKind::King => {}
                _ => {
                    return Err(SessionError::InvalidSwap(format!(
                        "{square} does not hold a non-king piece of {:?}",
                        self.seat
                    )))
                }
            }
        }
        let swapped = position.swap_pieces(a, b, self.seat.opponent())?;
        self.in_flight = Some(InFlight::PieceSwap);
        self.pending_swap = Some((a, b, swapped));
        info!("{:?} swapping {} and {} in game {}", self.seat, a, b, self.record.id);
        Ok(swapped)
    }

    pub fn cancel_piece_swap(&mut self) {
        if self.pending_swap.take().is_some() && self.in_flight == Some(InFlight::PieceSwap) {
            self.in_flight = None;
        }
    }

    pub fn finish_piece_swap(&mut self, now: DateTime<Utc>) -> SessionResult<PendingWrite> {
        let (a, b, swapped) = self.pending_swap.take().ok_or(SessionError::NoSwapAvailable)?;
        if let Err(e) = self.guard_playing() {
            self.in_flight = None;
            return Err(e);
        }
        let checkpoint = self.take_checkpoint();
        let before = *self.machine.position();
        let notation = format!("{a}<>{b}");
        self.snapshots
            .record(Snapshot::of(&before, now).before_move(self.seat, notation.clone()));
        self.machine.load(swapped);
        self.hold(checkpoint);

        let next_side = self.seat.opponent();
        let mut ops = vec![
            RecordOp::ChargeClock {
                side: self.seat,
                seconds: turn_charge(&self.record, self.seat, now),
            },
            RecordOp::Perk(PerkOp::ConsumeSwap),
            RecordOp::Perk(PerkOp::FollowSwap(a, b)),
            RecordOp::Perk(PerkOp::Relocate(swapped)),
            RecordOp::SetBoard {
                position: swapped.to_fen(),
                side_to_move: next_side,
            },
            RecordOp::StartTurn(now),
            RecordOp::Perk(PerkOp::ActivateTurn(next_side)),
            RecordOp::Perk(PerkOp::SettleBonuses),
        ];
        if let Some(reason) = self.machine.game_over() {
            ops.push(RecordOp::Finish {
                winner: reason.winner(),
                resigned: None,
            });
        }
        let record = self.move_record(notation, &swapped, Some("piece swap".to_string()));
        let write = self.stage(ops).with_move(record);
        self.closing_write = Some(write.write_id);
        Ok(write)
    }

    /// Rewinds to the player's last decision point and spends a shield.
    pub fn use_shield(&mut self, now: DateTime<Utc>) -> SessionResult<PendingWrite> {
        self.guard_playing()?;
        self.guard_idle()?;
        if self.record.perks.side(self.seat).shield_uses == 0 {
            return Err(SessionError::NoShields(self.seat));
        }
        let side_to_move = self.record.side_to_move;
        let plies = SnapshotStore::rewind_depth(side_to_move);
        let restored = self.snapshots.target_for(plies)?.to_position()?;

        let checkpoint = self.take_checkpoint();
        self.snapshots.undo(side_to_move)?;
        self.machine.reset(restored);
        self.hold(checkpoint);

        let mut ops = vec![
            RecordOp::Perk(PerkOp::UseShield(self.seat)),
            RecordOp::SetBoard {
                position: restored.to_fen(),
                side_to_move: restored.side_to_move(),
            },
            RecordOp::StartTurn(now),
            RecordOp::SetDrawOffer(None),
            RecordOp::Perk(PerkOp::Relocate(restored)),
        ];
        if self.record.perks.double_move.is_some() {
            ops.push(RecordOp::Perk(PerkOp::DoubleMoveStep { kept: false }));
        }
        info!("{:?} used a shield in game {}, undoing {} ply", self.seat, self.record.id, plies);
        let write = self.stage(ops).undoing(plies);
        self.in_flight = Some(InFlight::ShieldUndo);
        self.closing_write = Some(write.write_id);
        Ok(write)
    }

    pub fn resign(&mut self, now: DateTime<Utc>) -> SessionResult<PendingWrite> {
        self.guard_playing()?;
        self.clear_local_operations();
        let checkpoint = self.take_checkpoint();
        self.hold(checkpoint);
        let ops = vec![
            RecordOp::ChargeClock {
                side: self.seat,
                seconds: turn_charge(&self.record, self.seat, now),
            },
            RecordOp::Finish {
                winner: self.seat.opponent().into(),
                resigned: Some(self.seat),
            },
        ];
        info!("{:?} resigned game {}", self.seat, self.record.id);
        Ok(self.stage(ops))
    }

    pub fn offer_draw(&mut self) -> SessionResult<PendingWrite> {
        self.guard_playing()?;
        let checkpoint = self.take_checkpoint();
        self.hold(checkpoint);
        Ok(self.stage(vec![RecordOp::SetDrawOffer(Some(self.seat))]))
    }

    pub fn accept_draw(&mut self, now: DateTime<Utc>) -> SessionResult<PendingWrite> {
        self.guard_playing()?;
        if self.record.draw_offered_by != Some(self.seat.opponent()) {
            return Err(SessionError::NoDrawOffer);
        }
        self.clear_local_operations();
        let checkpoint = self.take_checkpoint();
        self.hold(checkpoint);
        let mover = self.record.side_to_move;
        let ops = vec![
            RecordOp::ChargeClock {
                side: mover,
                seconds: turn_charge(&self.record, mover, now),
            },
            RecordOp::Finish {
                winner: Winner::Draw,
                resigned: None,
            },
        ];
        Ok(self.stage(ops))
    }

    pub fn decline_draw(&mut self) -> SessionResult<PendingWrite> {
        self.guard_playing()?;
        if self.record.draw_offered_by != Some(self.seat.opponent()) {
            return Err(SessionError::NoDrawOffer);
        }
        let checkpoint = self.take_checkpoint();
        self.hold(checkpoint);
        Ok(self.stage(vec![RecordOp::SetDrawOffer(None)]))
    }

    /// Leaving before an opponent joined deletes the game; leaving a running
    /// game resigns it.
    pub fn abandon(&mut self, now: DateTime<Utc>) -> SessionResult<Abandon> {
        match self.record.status {
            SessionStatus::Waiting => Ok(Abandon::Delete),
            SessionStatus::Finished => Err(SessionError::GameFinished),
            SessionStatus::Playing => self.resign(now).map(Abandon::Write),
        }
    }

    /// Ends the game on flag fall. Does nothing while a write is outstanding.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Option<PendingWrite> {
        if self.record.status != SessionStatus::Playing || self.phase != SyncPhase::Idle {
            return None;
        }
        let flagged = self.clock().flagged(now)?;
        info!("{:?} ran out of time in game {}", flagged, self.record.id);
        self.clear_local_operations();
        let checkpoint = self.take_checkpoint();
        self.hold(checkpoint);
        let ops = vec![
            RecordOp::ChargeClock {
                side: flagged,
                seconds: self.record.time_remaining(flagged),
            },
            RecordOp::Finish {
                winner: flagged.opponent().into(),
                resigned: None,
            },
        ];
        Some(self.stage(ops))
    }

    /// Spends the hint token. Returns the position to evaluate.
    pub fn request_hint(&mut self) -> SessionResult<(String, PendingWrite)> {
        self.guard_playing()?;
        if !self.record.perks.side(self.seat).hint_token {
            return Err(SessionError::NoHintToken(self.seat));
        }
        let fen = self.evaluations.request(&self.machine.position().to_fen());
        let checkpoint = self.take_checkpoint();
        self.hold(checkpoint);
        let write = self.stage(vec![RecordOp::Perk(PerkOp::UseHint(self.seat))]);
        Ok((fen, write))
    }

    /// Keeps `evaluation` if the board has not moved on since it was requested.
    pub fn accept_evaluation(&mut self, requested_for: &str, evaluation: Evaluation) -> SessionResult<&Evaluation> {
        let current = self.machine.position().to_fen();
        self.evaluations.accept(requested_for, &current, evaluation)
    }

    pub fn best_move_highlight_active(&self, now: DateTime<Utc>) -> bool {
        self.record
            .perks
            .side(self.seat)
            .best_move_highlight_until
            .map_or(false, |until| until > now)
    }

    /// Whether the seat's board theme perk is still showing.
    pub fn theme_active(&self, now: DateTime<Utc>) -> bool {
        self.record.perks.side(self.seat).theme_until.map_or(false, |until| until > now)
    }

    fn clear_local_operations(&mut self) {
        self.machine.cancel_pending();
        self.pending_swap = None;
        self.in_flight = None;
        self.closing_write = None;
    }

    /// The store accepted a write; `stored` is the record it now holds.
    pub fn ack_write(&mut self, write_id: u64, stored: GameSession) -> AckOutcome {
        let latest = self.phase == SyncPhase::AwaitingRemoteAck { write_id };
        if !latest {
            debug!("ack for superseded write {}", write_id);
            self.record.revision = self.record.revision.max(stored.revision);
        } else {
            if let Ok(position) = position_of(&stored) {
                if board_key(&position) != board_key(self.machine.position()) {
                    warn!(
                        "{}",
                        SessionError::DivergenceDetected {
                            local: self.machine.position().to_fen(),
                            remote: stored.position.clone(),
                        }
                    );
                    self.machine.reset(position);
                }
            }
            self.record = stored;
            self.phase = SyncPhase::Idle;
            self.checkpoint = None;
        }
        if self.closing_write == Some(write_id) {
            self.closing_write = None;
            self.in_flight = None;
        }
        let refetch = self.in_flight.is_none() && self.deferred.take().is_some();
        AckOutcome { refetch }
    }

    /// The store rejected a write: roll back to the last state it confirmed.
    pub fn fail_write(&mut self, write_id: u64, error: PersistError) -> SessionError {
        warn!("write {} for game {} failed: {}", write_id, self.record.id, error);
        if let Some(checkpoint) = self.checkpoint.take() {
            self.record = checkpoint.record;
            self.snapshots.replace(checkpoint.snapshots);
            match position_of(&self.record) {
                Ok(position) => self.machine.reset(position),
                Err(e) => warn!("cannot restore the board of game {}: {}", self.record.id, e),
            }
        }
        self.phase = SyncPhase::Idle;
        self.clear_local_operations();
        SessionError::Persist(error)
    }

    /// Reconciles a record pushed by the change feed or re-read from the store.
    pub fn on_remote_change(&mut self, remote: GameSession, now: DateTime<Utc>) -> SessionResult<RemoteOutcome> {
        if remote.id != self.record.id {
            return Err(SessionError::MalformedRemotePayload(format!(
                "record {} delivered to game {}",
                remote.id, self.record.id
            )));
        }
        if remote.revision <= self.record.revision {
            debug!("ignoring revision {} of game {}", remote.revision, remote.id);
            return Ok(RemoteOutcome::Ignored);
        }
        if self.phase != SyncPhase::Idle || self.in_flight.is_some() {
            debug!("deferring revision {} of game {}", remote.revision, remote.id);
            if self.deferred.as_ref().map_or(true, |held| held.revision < remote.revision) {
                self.deferred = Some(remote);
            }
            return Ok(RemoteOutcome::Deferred);
        }
        self.ingest(remote, now)
    }

    fn ingest(&mut self, remote: GameSession, now: DateTime<Utc>) -> SessionResult<RemoteOutcome> {
        let local = *self.machine.position();
        let incoming = position_of(&remote).map_err(|e| SessionError::MalformedRemotePayload(e.to_string()))?;
        let board_changed = board_key(&local) != board_key(&incoming);
        let opponent = self.seat.opponent();

        if board_changed
            && remote.status != SessionStatus::Finished
            && local.side_to_move() == opponent
            && self.record.perks.is_frozen(opponent, now)
        {
            warn!("{:?} moved while frozen in game {}, restoring the board", opponent, remote.id);
            let undo = match self.classify(&local, &incoming) {
                RemoteChange::OpponentMove { .. } => 1,
                _ => 0,
            };
            self.record = remote;
            let write = self
                .stage(vec![RecordOp::SetBoard {
                    position: local.to_fen(),
                    side_to_move: local.side_to_move(),
                }])
                .undoing(undo);
            return Ok(RemoteOutcome::RejectedFrozen(write));
        }

        let change = if board_changed {
            self.classify(&local, &incoming)
        } else {
            RemoteChange::NoBoardChange
        };
        match &change {
            RemoteChange::NoBoardChange => {}
            RemoteChange::OpponentMove { mover, notation } => {
                self.snapshots
                    .record(Snapshot::of(&local, now).before_move(*mover, notation.clone()));
                self.machine.load(incoming);
            }
            RemoteChange::ExtraPly { mover, notations } => {
                self.snapshots
                    .record(Snapshot::of(&local, now).before_move(*mover, notations[0].clone()));
                if let Some(middle) = self.middle_of_extra_ply(&local, &incoming) {
                    self.snapshots
                        .record(Snapshot::of(&middle, now).before_move(*mover, notations[1].clone()));
                }
                self.machine.load(incoming);
            }
            RemoteChange::PieceSwap { mover } => {
                self.snapshots
                    .record(Snapshot::of(&local, now).before_move(*mover, "swap"));
                self.machine.load(incoming);
            }
            RemoteChange::Rewind { index } => {
                self.snapshots.truncate_after(index.saturating_sub(1));
                self.machine.reset(incoming);
            }
            RemoteChange::Unexplained => {
                warn!(
                    "{}",
                    SessionError::DivergenceDetected {
                        local: local.to_fen(),
                        remote: remote.position.clone(),
                    }
                );
                self.snapshots
                    .record(Snapshot::of(&local, now).before_move(local.side_to_move(), "?"));
                self.machine.reset(incoming);
            }
        }
        if remote.is_finished() {
            self.clear_local_operations();
        }
        self.record = remote;
        Ok(RemoteOutcome::Adopted(change))
    }

    /// Explains how `incoming` could follow from `local`.
    fn classify(&self, local: &Position, incoming: &Position) -> RemoteChange {
        let target = placement(incoming);
        let mover = local.side_to_move();
        let board = local.board();

        for mv in MoveGen::new_legal(board) {
            if placement(&local.after_move(mv)) == target {
                return RemoteChange::OpponentMove {
                    mover,
                    notation: san(board, mv),
                };
            }
        }
        if incoming.side_to_move() == mover.opponent() {
            for first in MoveGen::new_legal(board) {
                let Some(middle) = local.after_move(first).with_side_to_move(mover) else {
                    continue;
                };
                for second in MoveGen::new_legal(middle.board()) {
                    if placement(&middle.after_move(second)) == target {
                        return RemoteChange::ExtraPly {
                            mover,
                            notations: [san(board, first), san(middle.board(), second)],
                        };
                    }
                }
            }
        }
        let differing: Vec<Square> = chess::ALL_SQUARES
            .iter()
            .copied()
            .filter(|sq| local.piece_at(*sq) != incoming.piece_at(*sq))
            .collect();
        if let [a, b] = differing.as_slice() {
            if local.piece_at(*a) == incoming.piece_at(*b) && local.piece_at(*b) == incoming.piece_at(*a) {
                return RemoteChange::PieceSwap { mover };
            }
        }
        let key = board_key(incoming);
        let entries = self.snapshots.entries();
        if let Some(index) = (1..entries.len())
            .rev()
            .find(|i| snapshot_key(&entries[*i]).as_deref() == Some(key.as_str()))
        {
            return RemoteChange::Rewind { index };
        }
        RemoteChange::Unexplained
    }

    fn middle_of_extra_ply(&self, local: &Position, incoming: &Position) -> Option<Position> {
        let target = placement(incoming);
        let mover = local.side_to_move();
        MoveGen::new_legal(local.board()).find_map(|first| {
            let middle = local.after_move(first).with_side_to_move(mover)?;
            MoveGen::new_legal(middle.board())
                .any(|second| placement(&middle.after_move(second)) == target)
                .then_some(middle)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DoubleMove, EmpoweredPiece, PieceSwap};
    use chess::ChessMove;
    use chrono::Duration;

    fn playing(now: DateTime<Utc>) -> GameSession {
        let mut record = GameSession::new_waiting("g1", "ABCDEF", 300, now);
        record.status = SessionStatus::Playing;
        record.turn_started_at = Some(now);
        record.revision = 2;
        record
    }

    fn client(record: GameSession, seat: Side) -> ClientSession {
        ClientSession::open(record, seat, &SessionConfig::default(), Utc::now()).unwrap()
    }

    fn mv(from: Square, to: Square) -> ChessMove {
        ChessMove::new(from, to, None)
    }

    fn remote_with(base: &GameSession, position: &Position) -> GameSession {
        let mut remote = base.clone();
        remote.position = position.to_fen();
        remote.side_to_move = position.side_to_move();
        remote.revision = base.revision + 1;
        remote
    }

    fn play(session: &mut ClientSession, from: Square, to: Square, now: DateTime<Utc>) -> PendingWrite {
        match session.attempt_move(from, to, None, now).unwrap() {
            MoveAttempt::Committed(write) => write,
            MoveAttempt::NeedsPromotion(_) => panic!("unexpected promotion"),
        }
    }

    fn store(session: &mut ClientSession, write: &PendingWrite) -> AckOutcome {
        let mut stored = session.record().clone();
        stored.revision = write.base_revision + 1;
        session.ack_write(write.write_id, stored)
    }

    #[test]
    fn shield_after_e4_restores_the_start() {
        let now = Utc::now();
        let mut record = playing(now);
        record.perks.white.shield_uses = 1;
        let mut session = client(record, Side::White);

        let write = play(&mut session, Square::E2, Square::E4, now);
        assert_eq!(write.move_record.as_ref().map(|m| m.notation.as_str()), Some("e4"));
        store(&mut session, &write);
        assert_eq!(session.snapshots().len(), 2);

        let undo = session.use_shield(now).unwrap();
        assert_eq!(undo.undo_moves, 1);
        assert!(session.position().same_placement(&Position::start()));
        assert_eq!(session.record().side_to_move, Side::White);
        assert_eq!(session.record().perks.white.shield_uses, 0);
        assert_eq!(session.snapshots().len(), 1);
        assert_eq!(session.in_flight(), Some(InFlight::ShieldUndo));

        store(&mut session, &undo);
        assert_eq!(session.in_flight(), None);
        assert_eq!(session.use_shield(now), Err(SessionError::NoShields(Side::White)));
    }

    #[test]
    fn shield_without_history_is_rejected() {
        let now = Utc::now();
        let mut record = playing(now);
        record.perks.white.shield_uses = 1;
        let mut session = client(record, Side::White);
        assert!(matches!(
            session.use_shield(now),
            Err(SessionError::InsufficientHistory { .. })
        ));
        assert_eq!(session.record().perks.white.shield_uses, 1);
    }

    #[test]
    fn notifications_during_a_swap_wait_for_its_write() {
        let now = Utc::now();
        let mut record = playing(now);
        record.perks.piece_swap = Some(PieceSwap {
            target: Side::White,
            armed: true,
            nonce: 1,
            consumed_nonce: Some(1),
        });
        let mut session = client(record.clone(), Side::White);
        assert_eq!(
            session.attempt_move(Square::E2, Square::E4, None, now),
            Err(SessionError::SwapPending)
        );

        let swapped = session.begin_piece_swap(Square::B1, Square::C1).unwrap();
        let black_reply = Position::start().with_side_to_move(Side::Black).unwrap().after_move(mv(Square::E7, Square::E5));
        let first = remote_with(&record, &black_reply);
        let mut second = remote_with(&first, &Position::start());
        second.perks.black.hint_token = true;

        assert_eq!(session.on_remote_change(first, now), Ok(RemoteOutcome::Deferred));
        assert_eq!(session.on_remote_change(second, now), Ok(RemoteOutcome::Deferred));
        assert!(session.position().same_placement(&Position::start()));

        let write = session.finish_piece_swap(now).unwrap();
        assert_eq!(session.position(), &swapped);
        assert_eq!(session.record().side_to_move, Side::Black);
        assert!(!session.record().perks.swap_armed_for(Side::White));

        let ack = store(&mut session, &write);
        assert!(ack.refetch);
        assert_eq!(session.in_flight(), None);
        assert_eq!(session.position(), &swapped);
    }

    #[test]
    fn swapping_the_empowered_piece_carries_its_flag() {
        let now = Utc::now();
        let black_to_move = Position::start().with_side_to_move(Side::Black).unwrap();
        let mut record = remote_with(&playing(now), &black_to_move);
        record.perks.piece_swap = Some(PieceSwap {
            target: Side::Black,
            armed: true,
            nonce: 1,
            consumed_nonce: None,
        });
        record.perks.empowered_piece = Some(EmpoweredPiece {
            square: "g8".to_string(),
            owner: Side::Black,
            piece_type: PieceKind::Knight,
        });
        let mut session = client(record, Side::Black);

        session.begin_piece_swap(Square::G8, Square::F8).unwrap();
        let write = session.finish_piece_swap(now).unwrap();
        let flagged = write.patch.perks.and_then(|perks| perks.empowered_piece).unwrap();
        assert_eq!(flagged.square, "f8");
        assert_eq!(flagged.piece_type, PieceKind::Knight);
    }

    #[test]
    fn notifications_during_a_double_move_wait_for_the_second_ply() {
        let now = Utc::now();
        let mut record = playing(now);
        record.perks.double_move = Some(DoubleMove {
            target: Side::White,
            moves_remaining_in_turn: 2,
        });
        let mut session = client(record, Side::White);

        let first = play(&mut session, Square::E2, Square::E4, now);
        store(&mut session, &first);
        assert_eq!(session.in_flight(), Some(InFlight::DoubleMove));
        let after_first = *session.position();

        let mut remote = session.record().clone();
        remote.revision += 1;
        remote.perks.black.hint_token = true;
        assert_eq!(session.on_remote_change(remote, now), Ok(RemoteOutcome::Deferred));
        assert_eq!(session.position(), &after_first);
        assert!(session.has_deferred());

        let second = play(&mut session, Square::D2, Square::D4, now);
        let ack = store(&mut session, &second);
        assert!(ack.refetch);
        assert_eq!(session.in_flight(), None);
        assert!(!session.has_deferred());
    }

    #[test]
    fn notifications_during_a_shield_undo_wait_for_its_write() {
        let now = Utc::now();
        let mut record = playing(now);
        record.perks.white.shield_uses = 1;
        let mut session = client(record, Side::White);
        let e4 = play(&mut session, Square::E2, Square::E4, now);
        store(&mut session, &e4);

        let undo = session.use_shield(now).unwrap();
        assert_eq!(session.in_flight(), Some(InFlight::ShieldUndo));

        let after_e4 = Position::start().after_move(mv(Square::E2, Square::E4));
        let black_reply = remote_with(session.record(), &after_e4.after_move(mv(Square::E7, Square::E5)));
        assert_eq!(session.on_remote_change(black_reply, now), Ok(RemoteOutcome::Deferred));
        assert!(session.position().same_placement(&Position::start()));

        let ack = store(&mut session, &undo);
        assert!(ack.refetch);
        assert_eq!(session.in_flight(), None);
        assert!(session.position().same_placement(&Position::start()));
    }

    #[test]
    fn frozen_opponent_move_is_put_back() {
        let now = Utc::now();
        let after_e4 = Position::start().after_move(mv(Square::E2, Square::E4));
        let mut record = remote_with(&playing(now), &after_e4);
        record.perks.white.freeze_opponent_until = Some(now + Duration::seconds(1));
        let mut session = client(record.clone(), Side::White);

        let after_e5 = after_e4.after_move(mv(Square::E7, Square::E5));
        match session.on_remote_change(remote_with(&record, &after_e5), now).unwrap() {
            RemoteOutcome::RejectedFrozen(write) => {
                assert_eq!(write.undo_moves, 1);
                assert_eq!(write.patch.position, Some(after_e4.to_fen()));
                assert_eq!(write.patch.side_to_move, Some(Side::Black));
            }
            other => panic!("expected a rejection, got {other:?}"),
        }
        assert_eq!(session.position(), &after_e4);
    }

    #[test]
    fn failed_write_rolls_back_the_move() {
        let now = Utc::now();
        let mut session = client(playing(now), Side::White);
        let write = play(&mut session, Square::E2, Square::E4, now);
        assert_eq!(session.record().side_to_move, Side::Black);

        let error = session.fail_write(write.write_id, PersistError::Unavailable("offline".to_string()));
        assert!(matches!(error, SessionError::Persist(_)));
        assert_eq!(session.position(), &Position::start());
        assert_eq!(session.record().side_to_move, Side::White);
        assert_eq!(session.record().revision, 2);
        assert_eq!(session.snapshots().len(), 1);
        assert_eq!(session.phase(), SyncPhase::Idle);
    }

    #[test]
    fn double_move_keeps_the_turn_for_one_extra_ply() {
        let now = Utc::now();
        let mut record = playing(now);
        record.perks.double_move = Some(DoubleMove {
            target: Side::White,
            moves_remaining_in_turn: 2,
        });
        let mut session = client(record, Side::White);

        let first = play(&mut session, Square::E2, Square::E4, now);
        assert_eq!(session.record().side_to_move, Side::White);
        assert_eq!(session.in_flight(), Some(InFlight::DoubleMove));
        store(&mut session, &first);
        assert_eq!(session.in_flight(), Some(InFlight::DoubleMove));

        let second = play(&mut session, Square::D2, Square::D4, now);
        assert_eq!(session.record().side_to_move, Side::Black);
        assert_eq!(second.patch.perks.as_ref().and_then(|p| p.double_move.clone()), None);
        store(&mut session, &second);
        assert_eq!(session.in_flight(), None);
        assert_eq!(
            session.attempt_move(Square::G1, Square::F3, None, now),
            Err(SessionError::NotYourTurn(Side::White))
        );
    }

    #[test]
    fn deferred_swap_arms_when_the_turn_passes() {
        let now = Utc::now();
        let mut record = playing(now);
        record.perks.piece_swap = Some(PieceSwap {
            target: Side::Black,
            armed: false,
            nonce: 1,
            consumed_nonce: None,
        });
        let mut session = client(record, Side::White);
        play(&mut session, Square::E2, Square::E4, now);
        assert!(session.record().perks.swap_armed_for(Side::Black));
    }

    #[test]
    fn opponent_moves_and_rewinds_are_recognised() {
        let now = Utc::now();
        let record = playing(now);
        let mut session = client(record.clone(), Side::Black);

        let after_e4 = Position::start().after_move(mv(Square::E2, Square::E4));
        let moved = remote_with(&record, &after_e4);
        assert_eq!(
            session.on_remote_change(moved.clone(), now),
            Ok(RemoteOutcome::Adopted(RemoteChange::OpponentMove {
                mover: Side::White,
                notation: "e4".to_string(),
            }))
        );
        assert_eq!(session.snapshots().len(), 2);
        assert_eq!(session.on_remote_change(moved.clone(), now), Ok(RemoteOutcome::Ignored));

        let rewound = remote_with(&moved, &Position::start());
        assert_eq!(
            session.on_remote_change(rewound, now),
            Ok(RemoteOutcome::Adopted(RemoteChange::Rewind { index: 1 }))
        );
        assert_eq!(session.snapshots().len(), 1);
        assert_eq!(session.position(), &Position::start());
    }

    #[test]
    fn unexplained_positions_are_adopted() {
        let now = Utc::now();
        let record = playing(now);
        let mut session = client(record.clone(), Side::Black);
        let bare = Position::from_fen("4k3/8/8/8/8/8/8/4K3 w - - 0 1").unwrap();

        let outcome = session.on_remote_change(remote_with(&record, &bare), now).unwrap();
        assert_eq!(outcome, RemoteOutcome::Adopted(RemoteChange::Unexplained));
        assert_eq!(session.position(), &bare);
    }

    #[test]
    fn finished_games_reject_moves() {
        let now = Utc::now();
        let mut record = playing(now);
        record.status = SessionStatus::Finished;
        let mut session = client(record, Side::White);
        assert_eq!(
            session.attempt_move(Square::E2, Square::E4, None, now),
            Err(SessionError::GameFinished)
        );
    }

    #[test]
    fn draws_need_an_offer_from_the_opponent() {
        let now = Utc::now();
        let mut session = client(playing(now), Side::Black);
        assert_eq!(session.accept_draw(now), Err(SessionError::NoDrawOffer));

        let mut offered = session.record().clone();
        offered.draw_offered_by = Some(Side::White);
        offered.revision += 1;
        session.on_remote_change(offered, now).unwrap();

        let write = session.accept_draw(now).unwrap();
        assert_eq!(write.patch.winner, Some(Some(Winner::Draw)));
        assert!(session.record().is_finished());
    }

    #[test]
    fn cosmetic_windows_expire() {
        let now = Utc::now();
        let mut record = playing(now);
        record.perks.white.best_move_highlight_until = Some(now + Duration::seconds(30));
        record.perks.white.theme_until = Some(now + Duration::seconds(60));
        let session = client(record, Side::White);

        assert!(session.best_move_highlight_active(now));
        assert!(session.theme_active(now + Duration::seconds(45)));
        assert!(!session.best_move_highlight_active(now + Duration::seconds(45)));
        assert!(!session.theme_active(now + Duration::seconds(61)));
    }
}
