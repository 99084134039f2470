use async_trait::async_trait;
use chess::{BoardStatus, ChessMove, Color, MoveGen, Piece};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{SessionError, SessionResult};
use crate::game::position::Position;

/// Score reported for a side that is checkmated.
pub const MATE_SCORE: f32 = 1000.0;

/// Answer of the evaluation oracle. `score` is in pawns, positive favours white;
/// `mate` is signed ply to mate, positive when white mates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub score: f32,
    pub mate: Option<i32>,
    pub best_move: Option<String>,
}

#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(&self, fen: &str, depth: u8) -> SessionResult<Evaluation>;
}

fn piece_value(piece: Piece) -> f32 {
    match piece {
        Piece::Pawn => 1.0,
        Piece::Knight | Piece::Bishop => 3.0,
        Piece::Rook => 5.0,
        Piece::Queen => 9.0,
        Piece::King => 0.0,
    }
}

/// Counts material and looks one ply ahead for mates and captures.
#[derive(Debug, Clone, Copy, Default)]
pub struct MaterialEvaluator;

impl MaterialEvaluator {
    pub fn evaluate_position(&self, position: &Position, depth: u8) -> Evaluation {
        let board = position.board();
        let white_sign = |color: Color| if color == Color::White { 1.0 } else { -1.0 };

        if board.status() == BoardStatus::Checkmate {
            let loser = white_sign(board.side_to_move());
            return Evaluation {
                score: -loser * MATE_SCORE,
                mate: Some(0),
                best_move: None,
            };
        }

        let material: f32 = [Piece::Pawn, Piece::Knight, Piece::Bishop, Piece::Rook, Piece::Queen]
            .iter()
            .map(|piece| {
                let white = (*board.pieces(*piece) & *board.color_combined(Color::White)).popcnt() as f32;
                let black = (*board.pieces(*piece) & *board.color_combined(Color::Black)).popcnt() as f32;
                (white - black) * piece_value(*piece)
            })
            .sum();

        let moves: Vec<ChessMove> = MoveGen::new_legal(board).collect();
        let mover = white_sign(board.side_to_move());
        let mating = if depth > 0 {
            moves
                .iter()
                .find(|mv| board.make_move_new(**mv).status() == BoardStatus::Checkmate)
                .copied()
        } else {
            None
        };
        let best = mating.or_else(|| {
            moves
                .iter()
                .filter_map(|mv| board.piece_on(mv.get_dest()).map(|victim| (*mv, piece_value(victim))))
                .max_by(|a, b| a.1.total_cmp(&b.1))
                .map(|(mv, _)| mv)
                .or_else(|| moves.first().copied())
        });

        Evaluation {
            score: material,
            mate: mating.map(|_| if mover > 0.0 { 1 } else { -1 }),
            best_move: best.map(|mv| mv.to_string()),
        }
    }
}

#[async_trait]
impl Evaluator for MaterialEvaluator {
    async fn evaluate(&self, fen: &str, depth: u8) -> SessionResult<Evaluation> {
        let position = Position::from_fen(fen)?;
        Ok(self.evaluate_position(&position, depth))
    }
}

/// Tags evaluation requests with the position they were made for and drops
/// answers that arrive after the position moved on.
#[derive(Debug, Clone, Default)]
pub struct EvaluationTracker {
    requested_for: Option<String>,
    latest: Option<(String, Evaluation)>,
}

impl EvaluationTracker {
    pub fn request(&mut self, fen: &str) -> String {
        self.requested_for = Some(fen.to_string());
        fen.to_string()
    }

    /// Accepts `evaluation` computed for `requested_for` if that is still `current_fen`.
    pub fn accept(&mut self, requested_for: &str, current_fen: &str, evaluation: Evaluation) -> SessionResult<&Evaluation> {
        if requested_for != current_fen {
            debug!("discarding evaluation for {}", requested_for);
            return Err(SessionError::StaleEvaluation {
                requested_for: requested_for.to_string(),
            });
        }
        if self.requested_for.as_deref() == Some(requested_for) {
            self.requested_for = None;
        }
        let (_, stored) = self.latest.insert((requested_for.to_string(), evaluation));
        Ok(stored)
    }

    pub fn pending(&self) -> Option<&str> {
        self.requested_for.as_deref()
    }

    /// Latest evaluation, if it belongs to `fen`.
    pub fn latest_for(&self, fen: &str) -> Option<&Evaluation> {
        self.latest
            .as_ref()
            .filter(|(for_fen, _)| for_fen == fen)
            .map(|(_, evaluation)| evaluation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[actix_rt::test]
    async fn start_position_is_level() {
        let evaluation = MaterialEvaluator
            .evaluate(crate::models::START_FEN, 1)
            .await
            .unwrap();
        assert_eq!(evaluation.score, 0.0);
        assert_eq!(evaluation.mate, None);
        assert!(evaluation.best_move.is_some());
    }

    #[test]
    fn prefers_the_biggest_capture_and_finds_mate_in_one() {
        let hanging_queen = Position::from_fen("4k3/8/8/3q4/8/8/3R4/4K3 w - - 0 1").unwrap();
        let evaluation = MaterialEvaluator.evaluate_position(&hanging_queen, 1);
        assert_eq!(evaluation.score, -4.0);
        assert_eq!(evaluation.best_move.as_deref(), Some("d2d5"));

        let back_rank = Position::from_fen("6k1/5ppp/8/8/8/8/8/R5K1 w - - 0 1").unwrap();
        let evaluation = MaterialEvaluator.evaluate_position(&back_rank, 1);
        assert_eq!(evaluation.mate, Some(1));
        assert_eq!(evaluation.best_move.as_deref(), Some("a1a8"));
    }

    #[test]
    fn stale_answers_are_discarded() {
        let mut tracker = EvaluationTracker::default();
        let asked = tracker.request("fen-a");
        let evaluation = Evaluation {
            score: 0.5,
            mate: None,
            best_move: None,
        };

        assert_eq!(
            tracker.accept(&asked, "fen-b", evaluation.clone()),
            Err(SessionError::StaleEvaluation {
                requested_for: "fen-a".to_string()
            })
        );
        assert!(tracker.latest_for("fen-a").is_none());

        assert!(tracker.accept(&asked, "fen-a", evaluation).is_ok());
        assert!(tracker.pending().is_none());
        assert_eq!(tracker.latest_for("fen-a").map(|e| e.score), Some(0.5));
    }
}
