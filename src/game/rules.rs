use chess::{BoardStatus, ChessMove, MoveGen, Piece, Rank, Square};
use serde::{Deserialize, Serialize};

use crate::error::{SessionError, SessionResult};
use crate::game::notation::san;
use crate::game::position::{parse_square, Position};
use crate::game::utils::{has_insufficient_material, piece_from_letter};
use crate::models::{PieceKind, Side, Winner};

/// Half-moves without a pawn move or capture after which the game is drawn.
pub const FIFTY_MOVE_LIMIT: u32 = 100;
/// Occurrences of the same position that end the game in a draw.
pub const REPETITION_LIMIT: usize = 3;

/// A candidate move as the player expressed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveRequest {
    pub from: Square,
    pub to: Square,
    pub promotion: Option<Piece>,
}

impl MoveRequest {
    pub fn new(from: Square, to: Square) -> Self {
        MoveRequest { from, to, promotion: None }
    }

    pub fn promoting(mut self, piece: Piece) -> Self {
        self.promotion = Some(piece);
        self
    }

    /// Parses "e2", "e4" and an optional promotion letter.
    pub fn parse(from: &str, to: &str, promotion: Option<&str>) -> SessionResult<Self> {
        let promotion = match promotion {
            Some(letter) => Some(piece_from_letter(letter).ok_or_else(|| {
                SessionError::IllegalMove(format!("invalid promotion piece {letter}"))
            })?),
            None => None,
        };
        Ok(MoveRequest {
            from: parse_square(from)?,
            to: parse_square(to)?,
            promotion,
        })
    }

    fn as_chess_move(&self) -> ChessMove {
        ChessMove::new(self.from, self.to, self.promotion)
    }
}

/// Everything a committed move changes or reveals.
#[derive(Debug, Clone, PartialEq)]
pub struct MoveOutcome {
    pub before: Position,
    pub position: Position,
    pub mover: Side,
    pub moved_piece: PieceKind,
    pub captured: Option<PieceKind>,
    pub captured_square: Option<Square>,
    pub notation: String,
    pub from: Square,
    pub to: Square,
    pub is_check: bool,
    pub is_checkmate: bool,
    pub is_stalemate: bool,
    pub is_draw: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum GameOverReason {
    Checkmate { winner: Side },
    Stalemate,
    InsufficientMaterial,
    FiftyMoveRule,
    Repetition,
}

impl GameOverReason {
    pub fn winner(&self) -> Winner {
        match self {
            GameOverReason::Checkmate { winner } => (*winner).into(),
            _ => Winner::Draw,
        }
    }
}

/// The chess rules capability the board state machine is built on.
pub trait Rules {
    fn apply_move(&self, position: &Position, side: Side, request: MoveRequest) -> SessionResult<MoveOutcome>;

    /// `repetitions` is how often the current position has occurred, itself included.
    fn game_over(&self, position: &Position, repetitions: usize) -> Option<GameOverReason>;

    fn legal_targets(&self, position: &Position, from: Square) -> Vec<Square>;

    fn needs_promotion(&self, position: &Position, request: &MoveRequest) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StandardRules;

impl Rules for StandardRules {
    fn apply_move(&self, position: &Position, side: Side, request: MoveRequest) -> SessionResult<MoveOutcome> {
        if position.side_to_move() != side {
            return Err(SessionError::NotYourTurn(side));
        }
        let board = position.board();
        let moved = board
            .piece_on(request.from)
            .ok_or_else(|| SessionError::IllegalMove(format!("no piece on {}", request.from)))?;
        if board.color_on(request.from) != Some(side.into()) {
            return Err(SessionError::IllegalMove(format!(
                "the piece on {} does not belong to {:?}",
                request.from, side
            )));
        }
        if request.promotion.is_none() && self.needs_promotion(position, &request) {
            return Err(SessionError::PromotionRequired {
                from: request.from.to_string(),
                to: request.to.to_string(),
            });
        }

        let mv = request.as_chess_move();
        if !board.legal(mv) {
            return Err(SessionError::IllegalMove(format!("{}{} is not legal", request.from, request.to)));
        }

        let (captured, captured_square) = match board.piece_on(request.to) {
            Some(piece) => (Some(piece.into()), Some(request.to)),
            None if moved == Piece::Pawn && request.from.get_file() != request.to.get_file() => {
                // en passant: the captured pawn sits beside the mover's origin
                let square = Square::make_square(request.from.get_rank(), request.to.get_file());
                (Some(PieceKind::Pawn), Some(square))
            }
            None => (None, None),
        };

        let notation = san(board, mv);
        let after = position.after_move(mv);
        let status = after.board().status();
        let is_checkmate = status == BoardStatus::Checkmate;
        let is_stalemate = status == BoardStatus::Stalemate;
        let is_draw = is_stalemate
            || has_insufficient_material(after.board())
            || after.halfmove_clock() >= FIFTY_MOVE_LIMIT;

        Ok(MoveOutcome {
            before: *position,
            position: after,
            mover: side,
            moved_piece: moved.into(),
            captured,
            captured_square,
            notation,
            from: request.from,
            to: request.to,
            is_check: after.board().checkers().popcnt() > 0,
            is_checkmate,
            is_stalemate,
            is_draw,
        })
    }

    fn game_over(&self, position: &Position, repetitions: usize) -> Option<GameOverReason> {
        match position.board().status() {
            BoardStatus::Checkmate => {
                return Some(GameOverReason::Checkmate {
                    winner: position.side_to_move().opponent(),
                })
            }
            BoardStatus::Stalemate => return Some(GameOverReason::Stalemate),
            BoardStatus::Ongoing => {}
        }
        if has_insufficient_material(position.board()) {
            Some(GameOverReason::InsufficientMaterial)
        } else if repetitions >= REPETITION_LIMIT {
            Some(GameOverReason::Repetition)
        } else if position.halfmove_clock() >= FIFTY_MOVE_LIMIT {
            Some(GameOverReason::FiftyMoveRule)
        } else {
            None
        }
    }

    fn legal_targets(&self, position: &Position, from: Square) -> Vec<Square> {
        let mut targets: Vec<Square> = MoveGen::new_legal(position.board())
            .filter(|mv| mv.get_source() == from)
            .map(|mv| mv.get_dest())
            .collect();
        targets.dedup();
        targets
    }

    fn needs_promotion(&self, position: &Position, request: &MoveRequest) -> bool {
        let board = position.board();
        if board.piece_on(request.from) != Some(Piece::Pawn) {
            return false;
        }
        let last_rank = match position.side_to_move() {
            Side::White => Rank::Eighth,
            Side::Black => Rank::First,
        };
        request.to.get_rank() == last_rank
            && MoveGen::new_legal(board).any(|mv| mv.get_source() == request.from && mv.get_dest() == request.to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn applies_a_legal_opening_move() {
        let outcome = StandardRules
            .apply_move(&Position::start(), Side::White, MoveRequest::parse("e2", "e4", None).unwrap())
            .unwrap();

        assert_eq!(outcome.notation, "e4");
        assert_eq!(outcome.position.side_to_move(), Side::Black);
        assert_eq!(outcome.captured, None);
        assert!(!outcome.is_check);
    }

    #[test]
    fn rejects_wrong_side_and_illegal_moves() {
        let start = Position::start();
        let rules = StandardRules;
        assert_eq!(
            rules.apply_move(&start, Side::Black, MoveRequest::parse("e7", "e5", None).unwrap()),
            Err(SessionError::NotYourTurn(Side::Black))
        );
        assert!(matches!(
            rules.apply_move(&start, Side::White, MoveRequest::parse("e2", "e5", None).unwrap()),
            Err(SessionError::IllegalMove(_))
        ));
        assert!(matches!(
            rules.apply_move(&start, Side::White, MoveRequest::parse("e7", "e5", None).unwrap()),
            Err(SessionError::IllegalMove(_))
        ));
    }

    #[test]
    fn pawn_on_the_last_rank_needs_a_promotion_choice() {
        let position = Position::from_fen("8/P7/8/8/8/8/k7/4K3 w - - 0 1").unwrap();
        let request = MoveRequest::parse("a7", "a8", None).unwrap();

        assert_eq!(
            StandardRules.apply_move(&position, Side::White, request),
            Err(SessionError::PromotionRequired {
                from: "a7".to_string(),
                to: "a8".to_string()
            })
        );
        let outcome = StandardRules
            .apply_move(&position, Side::White, request.promoting(Piece::Knight))
            .unwrap();
        assert_eq!(outcome.notation, "a8=N");
    }

    #[test]
    fn en_passant_reports_the_captured_pawn_square() {
        let position = Position::from_fen("4k3/8/8/3pP3/8/8/8/4K3 w - d6 0 2").unwrap();
        let outcome = StandardRules
            .apply_move(&position, Side::White, MoveRequest::parse("e5", "d6", None).unwrap())
            .unwrap();

        assert_eq!(outcome.captured, Some(PieceKind::Pawn));
        assert_eq!(outcome.captured_square, Some(Square::D5));
        assert_eq!(outcome.notation, "exd6");
    }

    #[test]
    fn checkmate_names_the_side_not_to_move() {
        let rules = StandardRules;
        let start = Position::start();
        let moves = [("f2", "f3"), ("e7", "e5"), ("g2", "g4"), ("d8", "h4")];
        let mut position = start;
        let mut outcome = None;
        for (from, to) in moves {
            let side = position.side_to_move();
            let result = rules
                .apply_move(&position, side, MoveRequest::parse(from, to, None).unwrap())
                .unwrap();
            position = result.position;
            outcome = Some(result);
        }

        let outcome = outcome.unwrap();
        assert!(outcome.is_checkmate);
        assert_eq!(outcome.notation, "Qh4#");
        assert_eq!(
            rules.game_over(&position, 1),
            Some(GameOverReason::Checkmate { winner: Side::Black })
        );
        assert_eq!(rules.game_over(&position, 1).unwrap().winner(), Winner::Black);
    }

    #[test]
    fn bare_kings_and_repetition_are_draws() {
        let rules = StandardRules;
        let bare = Position::from_fen("8/8/4k3/8/8/3K4/8/8 w - - 0 1").unwrap();
        assert_eq!(rules.game_over(&bare, 1), Some(GameOverReason::InsufficientMaterial));
        assert_eq!(rules.game_over(&Position::start(), 3), Some(GameOverReason::Repetition));
        assert_eq!(rules.game_over(&Position::start(), 2), None);
    }
}
