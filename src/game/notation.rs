use chess::{Board, BoardStatus, ChessMove, MoveGen, Piece};

use crate::game::utils::{file_char, piece_letter, rank_char};

/// Standard algebraic notation for a legal move on `board`.
pub fn san(board: &Board, mv: ChessMove) -> String {
    let source = mv.get_source();
    let dest = mv.get_dest();
    let piece = match board.piece_on(source) {
        Some(piece) => piece,
        None => return mv.to_string(),
    };

    let mut text = String::new();
    let file_distance = (source.get_file().to_index() as i32 - dest.get_file().to_index() as i32).abs();
    if piece == Piece::King && file_distance == 2 {
        text.push_str(if dest.get_file().to_index() > source.get_file().to_index() {
            "O-O"
        } else {
            "O-O-O"
        });
    } else {
        // en passant lands a pawn diagonally on an empty square
        let is_capture = board.piece_on(dest).is_some() || (piece == Piece::Pawn && file_distance == 1);
        if piece == Piece::Pawn {
            if is_capture {
                text.push(file_char(source));
            }
        } else {
            text.push(piece_letter(piece));
            text.push_str(&disambiguation(board, mv, piece));
        }
        if is_capture {
            text.push('x');
        }
        text.push(file_char(dest));
        text.push(rank_char(dest));
        if let Some(promotion) = mv.get_promotion() {
            text.push('=');
            text.push(piece_letter(promotion));
        }
    }

    let after = board.make_move_new(mv);
    if after.status() == BoardStatus::Checkmate {
        text.push('#');
    } else if after.checkers().popcnt() > 0 {
        text.push('+');
    }
    text
}

fn disambiguation(board: &Board, mv: ChessMove, piece: Piece) -> String {
    let source = mv.get_source();
    let rivals: Vec<_> = MoveGen::new_legal(board)
        .filter(|other| {
            other.get_dest() == mv.get_dest()
                && other.get_source() != source
                && board.piece_on(other.get_source()) == Some(piece)
        })
        .map(|other| other.get_source())
        .collect();
    if rivals.is_empty() {
        return String::new();
    }
    if rivals.iter().all(|sq| sq.get_file() != source.get_file()) {
        return file_char(source).to_string();
    }
    if rivals.iter().all(|sq| sq.get_rank() != source.get_rank()) {
        return rank_char(source).to_string();
    }
    format!("{}{}", file_char(source), rank_char(source))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chess::Square;
    use std::str::FromStr;

    fn san_of(fen: &str, from: Square, to: Square, promotion: Option<Piece>) -> String {
        let board = Board::from_str(fen).unwrap();
        san(&board, ChessMove::new(from, to, promotion))
    }

    #[test]
    fn pawn_and_piece_moves() {
        let start = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";
        assert_eq!(san_of(start, Square::E2, Square::E4, None), "e4");
        assert_eq!(san_of(start, Square::G1, Square::F3, None), "Nf3");
    }

    #[test]
    fn castling_and_captures() {
        let fen = "r3k2r/8/8/3p4/4P3/8/8/R3K2R w KQkq - 0 1";
        assert_eq!(san_of(fen, Square::E1, Square::G1, None), "O-O");
        assert_eq!(san_of(fen, Square::E1, Square::C1, None), "O-O-O");
        assert_eq!(san_of(fen, Square::E4, Square::D5, None), "exd5");
    }

    #[test]
    fn knights_on_the_same_rank_are_told_apart_by_file() {
        let fen = "4k3/8/8/8/8/8/8/1N2KN2 w - - 0 1";
        assert_eq!(san_of(fen, Square::B1, Square::D2, None), "Nbd2");
    }

    #[test]
    fn promotion_and_mate_suffixes() {
        assert_eq!(
            san_of("8/P7/8/8/8/8/k7/4K3 w - - 0 1", Square::A7, Square::A8, Some(Piece::Queen)),
            "a8=Q+"
        );
        assert_eq!(
            san_of("6k1/5ppp/8/8/8/8/8/R5K1 w - - 0 1", Square::A1, Square::A8, None),
            "Ra8#"
        );
    }
}
