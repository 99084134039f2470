use chess::{BitBoard, Board, Color, Piece, Square};
use serde::{Deserialize, Serialize};

use crate::models::{PieceKind, Side};

pub fn side_name(side: Side) -> &'static str {
    match side {
        Side::White => "white",
        Side::Black => "black",
    }
}

pub fn file_char(square: Square) -> char {
    (b'a' + square.get_file().to_index() as u8) as char
}

pub fn rank_char(square: Square) -> char {
    (b'1' + square.get_rank().to_index() as u8) as char
}

/// Upper-case SAN letter of a piece
pub fn piece_letter(piece: Piece) -> char {
    match piece {
        Piece::Pawn => 'P',
        Piece::Knight => 'N',
        Piece::Bishop => 'B',
        Piece::Rook => 'R',
        Piece::Queen => 'Q',
        Piece::King => 'K',
    }
}

pub fn piece_from_letter(letter: &str) -> Option<Piece> {
    match letter.trim().to_ascii_lowercase().as_str() {
        "q" | "queen" => Some(Piece::Queen),
        "r" | "rook" => Some(Piece::Rook),
        "b" | "bishop" => Some(Piece::Bishop),
        "n" | "knight" => Some(Piece::Knight),
        _ => None,
    }
}

fn is_light_square(square: Square) -> bool {
    (square.get_rank().to_index() + square.get_file().to_index()) % 2 == 1
}

/// Check if the board has insufficient material for checkmate
pub fn has_insufficient_material(board: &Board) -> bool {
    let heavy = *board.pieces(Piece::Pawn) | *board.pieces(Piece::Rook) | *board.pieces(Piece::Queen);
    if heavy.popcnt() > 0 {
        return false;
    }

    let minors = *board.pieces(Piece::Knight) | *board.pieces(Piece::Bishop);
    let white_minors = minors & *board.color_combined(Color::White);
    let black_minors = minors & *board.color_combined(Color::Black);

    match (white_minors.popcnt(), black_minors.popcnt()) {
        // King vs King, or a lone minor piece
        (0, 0) | (1, 0) | (0, 1) => true,
        // Bishop vs bishop on the same square color
        (1, 1) => {
            let bishops = *board.pieces(Piece::Bishop);
            let white_bishop = bishops & *board.color_combined(Color::White);
            let black_bishop = bishops & *board.color_combined(Color::Black);
            white_bishop.popcnt() == 1
                && black_bishop.popcnt() == 1
                && is_light_square(white_bishop.to_square()) == is_light_square(black_bishop.to_square())
        }
        _ => false,
    }
}

/// Pieces each side has taken, derived from the material left on the board.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedPieces {
    pub white_captured: Vec<PieceKind>,
    pub black_captured: Vec<PieceKind>,
}

const STARTING_MATERIAL: [(Piece, u32); 5] = [
    (Piece::Pawn, 8),
    (Piece::Knight, 2),
    (Piece::Bishop, 2),
    (Piece::Rook, 2),
    (Piece::Queen, 1),
];

fn count(board: &Board, piece: Piece, color: Color) -> u32 {
    let set: BitBoard = *board.pieces(piece) & *board.color_combined(color);
    set.popcnt()
}

pub fn captured_pieces(board: &Board) -> CapturedPieces {
    let mut captured = CapturedPieces::default();
    for (piece, start) in STARTING_MATERIAL {
        let black_missing = start.saturating_sub(count(board, piece, Color::Black));
        let white_missing = start.saturating_sub(count(board, piece, Color::White));
        for _ in 0..black_missing {
            captured.white_captured.push(piece.into());
        }
        for _ in 0..white_missing {
            captured.black_captured.push(piece.into());
        }
    }
    captured
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn board(fen: &str) -> Board {
        Board::from_str(fen).unwrap()
    }

    #[test]
    fn bare_kings_and_single_minors_are_dead() {
        assert!(has_insufficient_material(&board("8/8/4k3/8/8/3K4/8/8 w - - 0 1")));
        assert!(has_insufficient_material(&board("8/8/4k3/8/8/3KN3/8/8 w - - 0 1")));
        assert!(has_insufficient_material(&board("8/8/4kb2/8/8/3K4/8/8 w - - 0 1")));
    }

    #[test]
    fn same_colored_bishops_are_dead_but_opposite_are_not() {
        // c1 and f8 are both dark squares
        assert!(has_insufficient_material(&board("5b2/8/4k3/8/8/3K4/8/2B5 w - - 0 1")));
        // c1 dark, c8 light
        assert!(!has_insufficient_material(&board("2b5/8/4k3/8/8/3K4/8/2B5 w - - 0 1")));
    }

    #[test]
    fn any_pawn_keeps_the_game_alive() {
        assert!(!has_insufficient_material(&board("8/8/4k3/8/8/3K4/4P3/8 w - - 0 1")));
        assert!(!has_insufficient_material(&Board::default()));
    }

    #[test]
    fn captured_pieces_count_missing_material() {
        // black queen and a white pawn are gone
        let captured = captured_pieces(&board(
            "rnb1kbnr/pppppppp/8/8/8/8/PPPP1PPP/RNBQKBNR w KQkq - 0 1",
        ));
        assert_eq!(captured.white_captured, vec![PieceKind::Queen]);
        assert_eq!(captured.black_captured, vec![PieceKind::Pawn]);
    }
}
