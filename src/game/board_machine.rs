use chess::{Piece, Square};
use log::debug;

use crate::error::{SessionError, SessionResult};
use crate::game::position::Position;
use crate::game::rules::{GameOverReason, MoveOutcome, MoveRequest, Rules, StandardRules};
use crate::models::Side;

/// Where the local move pipeline currently stands.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    Idle,
    Selected { square: Square, targets: Vec<Square> },
    /// A pawn move to the last rank waiting for the promotion piece.
    AwaitingPromotion(MoveRequest),
}

#[derive(Debug, Clone, PartialEq)]
pub enum MoveStep {
    NeedsPromotion(MoveRequest),
    Ready(MoveOutcome),
}

/// Who moves after a committed ply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOverride {
    Alternate,
    /// The mover keeps the turn (first ply of a double move).
    Keep,
}

/// Result of [`BoardStateMachine::commit`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Committed {
    pub position: Position,
    /// False when a requested `Keep` could not be honoured because the move gave check.
    pub turn_kept: bool,
}

/// Owns the canonical position and validates local moves against it.
pub struct BoardStateMachine<R: Rules = StandardRules> {
    rules: R,
    position: Position,
    selection: Selection,
    seen: Vec<u64>,
}

impl Default for BoardStateMachine<StandardRules> {
    fn default() -> Self {
        BoardStateMachine::new(StandardRules, Position::start())
    }
}

impl<R: Rules> BoardStateMachine<R> {
    pub fn new(rules: R, position: Position) -> Self {
        BoardStateMachine {
            rules,
            seen: vec![position.hash()],
            position,
            selection: Selection::Idle,
        }
    }

    pub fn position(&self) -> &Position {
        &self.position
    }

    pub fn side_to_move(&self) -> Side {
        self.position.side_to_move()
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    pub fn rules(&self) -> &R {
        &self.rules
    }

    /// Selects one of the mover's pieces and lists where it may go.
    pub fn select(&mut self, side: Side, square: Square) -> SessionResult<&[Square]> {
        if self.side_to_move() != side {
            return Err(SessionError::NotYourTurn(side));
        }
        match self.position.piece_at(square) {
            Some((_, owner)) if owner == side => {}
            _ => return Err(SessionError::IllegalMove(format!("nothing of {side:?} on {square}"))),
        }
        let targets = self.rules.legal_targets(&self.position, square);
        self.selection = Selection::Selected { square, targets };
        match &self.selection {
            Selection::Selected { targets, .. } => Ok(targets),
            _ => Ok(&[]),
        }
    }

    /// Validates a move without committing it. A pawn reaching the last rank
    /// without a promotion piece suspends the pipeline until
    /// [`choose_promotion`](Self::choose_promotion) is called.
    pub fn request_move(&mut self, side: Side, request: MoveRequest) -> SessionResult<MoveStep> {
        match self.rules.apply_move(&self.position, side, request) {
            Ok(outcome) => {
                self.selection = Selection::Idle;
                Ok(MoveStep::Ready(outcome))
            }
            Err(SessionError::PromotionRequired { .. }) => {
                debug!("awaiting promotion choice for {}{}", request.from, request.to);
                self.selection = Selection::AwaitingPromotion(request);
                Ok(MoveStep::NeedsPromotion(request))
            }
            Err(e) => {
                self.selection = Selection::Idle;
                Err(e)
            }
        }
    }

    pub fn choose_promotion(&mut self, piece: Piece) -> SessionResult<MoveOutcome> {
        let request = match &self.selection {
            Selection::AwaitingPromotion(request) => *request,
            _ => return Err(SessionError::IllegalMove("no promotion is pending".to_string())),
        };
        let side = self.side_to_move();
        let outcome = self.rules.apply_move(&self.position, side, request.promoting(piece))?;
        self.selection = Selection::Idle;
        Ok(outcome)
    }

    pub fn cancel_pending(&mut self) {
        self.selection = Selection::Idle;
    }

    /// Makes a validated move canonical. The outcome must have been computed
    /// against the current position.
    pub fn commit(&mut self, outcome: &MoveOutcome, turn: TurnOverride) -> SessionResult<Committed> {
        if outcome.before != self.position {
            return Err(SessionError::IllegalMove(
                "the position changed since the move was validated".to_string(),
            ));
        }
        let (position, turn_kept) = match turn {
            TurnOverride::Alternate => (outcome.position, false),
            TurnOverride::Keep => match outcome.position.with_side_to_move(outcome.mover) {
                Some(kept) => (kept, true),
                None => (outcome.position, false),
            },
        };
        self.position = position;
        self.selection = Selection::Idle;
        self.seen.push(position.hash());
        Ok(Committed { position, turn_kept })
    }

    /// Adopts a position produced outside normal play (remote move, swap, undo).
    pub fn load(&mut self, position: Position) {
        if position != self.position {
            self.seen.push(position.hash());
        }
        self.position = position;
        self.selection = Selection::Idle;
    }

    /// Forgets repetition history, for rewinds.
    pub fn reset(&mut self, position: Position) {
        self.position = position;
        self.selection = Selection::Idle;
        self.seen = vec![position.hash()];
    }

    pub fn game_over(&self) -> Option<GameOverReason> {
        let current = self.position.hash();
        let repetitions = self.seen.iter().filter(|hash| **hash == current).count();
        self.rules.game_over(&self.position, repetitions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn play(machine: &mut BoardStateMachine, from: &str, to: &str, turn: TurnOverride) -> Committed {
        let side = machine.side_to_move();
        let step = machine
            .request_move(side, MoveRequest::parse(from, to, None).unwrap())
            .unwrap();
        match step {
            MoveStep::Ready(outcome) => machine.commit(&outcome, turn).unwrap(),
            MoveStep::NeedsPromotion(_) => panic!("unexpected promotion"),
        }
    }

    #[test]
    fn turns_alternate_by_default() {
        let mut machine = BoardStateMachine::default();
        play(&mut machine, "e2", "e4", TurnOverride::Alternate);
        assert_eq!(machine.side_to_move(), Side::Black);
        play(&mut machine, "e7", "e5", TurnOverride::Alternate);
        assert_eq!(machine.side_to_move(), Side::White);
    }

    #[test]
    fn keep_grants_exactly_one_extra_ply() {
        let mut machine = BoardStateMachine::default();
        let first = play(&mut machine, "e2", "e4", TurnOverride::Keep);
        assert!(first.turn_kept);
        assert_eq!(machine.side_to_move(), Side::White);
        assert_eq!(machine.position().en_passant_field(), None);

        play(&mut machine, "d2", "d4", TurnOverride::Alternate);
        assert_eq!(machine.side_to_move(), Side::Black);
    }

    #[test]
    fn keep_is_forfeited_when_the_move_gives_check() {
        let mut machine = BoardStateMachine::new(
            StandardRules,
            Position::from_fen("4k3/8/8/8/8/8/8/R3K3 w - - 0 1").unwrap(),
        );
        let committed = play(&mut machine, "a1", "a8", TurnOverride::Keep);
        assert!(!committed.turn_kept);
        assert_eq!(machine.side_to_move(), Side::Black);
    }

    #[test]
    fn promotion_suspends_the_pipeline() {
        let mut machine = BoardStateMachine::new(
            StandardRules,
            Position::from_fen("8/P7/8/8/8/8/k7/4K3 w - - 0 1").unwrap(),
        );
        let step = machine
            .request_move(Side::White, MoveRequest::parse("a7", "a8", None).unwrap())
            .unwrap();
        assert!(matches!(step, MoveStep::NeedsPromotion(_)));
        assert!(matches!(machine.selection(), Selection::AwaitingPromotion(_)));

        let outcome = machine.choose_promotion(Piece::Queen).unwrap();
        assert_eq!(outcome.notation, "a8=Q+");
        machine.commit(&outcome, TurnOverride::Alternate).unwrap();
        assert_eq!(machine.selection(), &Selection::Idle);
    }

    #[test]
    fn stale_outcomes_are_refused() {
        let mut machine = BoardStateMachine::default();
        let outcome = match machine
            .request_move(Side::White, MoveRequest::parse("e2", "e4", None).unwrap())
            .unwrap()
        {
            MoveStep::Ready(outcome) => outcome,
            MoveStep::NeedsPromotion(_) => unreachable!(),
        };
        play(&mut machine, "d2", "d4", TurnOverride::Alternate);
        assert!(machine.commit(&outcome, TurnOverride::Alternate).is_err());
    }

    #[test]
    fn selecting_lists_targets() {
        let mut machine = BoardStateMachine::default();
        let targets = machine.select(Side::White, Square::G1).unwrap().to_vec();
        assert_eq!(targets.len(), 2);
        assert!(targets.contains(&Square::F3));
        assert!(machine.select(Side::Black, Square::G8).is_err());
    }

    #[test]
    fn shuffling_knights_draws_by_repetition() {
        let mut machine = BoardStateMachine::default();
        for _ in 0..2 {
            play(&mut machine, "g1", "f3", TurnOverride::Alternate);
            play(&mut machine, "g8", "f6", TurnOverride::Alternate);
            play(&mut machine, "f3", "g1", TurnOverride::Alternate);
            play(&mut machine, "f6", "g8", TurnOverride::Alternate);
        }
        assert_eq!(machine.game_over(), Some(GameOverReason::Repetition));
    }
}
