use std::convert::TryFrom;
use std::fmt;
use std::str::FromStr;

use chess::{Board, BoardBuilder, CastleRights, ChessMove, Color, File, Piece, Rank, Square, ALL_SQUARES};

use crate::error::{SessionError, SessionResult};
use crate::models::{PieceKind, Side};

/// A full FEN-equivalent position: the `chess` board plus the two move clocks
/// the board type does not carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    board: Board,
    halfmove_clock: u32,
    fullmove_number: u32,
}

impl Default for Position {
    fn default() -> Self {
        Position::start()
    }
}

impl Position {
    pub fn start() -> Self {
        Position {
            board: Board::default(),
            halfmove_clock: 0,
            fullmove_number: 1,
        }
    }

    pub fn from_fen(fen: &str) -> SessionResult<Self> {
        let board = Board::from_str(fen)
            .map_err(|e| SessionError::InvalidPosition(format!("{fen}: {e}")))?;
        let tokens: Vec<&str> = fen.split_whitespace().collect();
        let halfmove_clock = tokens.get(4).and_then(|t| t.parse().ok()).unwrap_or(0);
        let fullmove_number = tokens
            .get(5)
            .and_then(|t| t.parse().ok())
            .filter(|n| *n > 0)
            .unwrap_or(1);
        Ok(Position {
            board,
            halfmove_clock,
            fullmove_number,
        })
    }

    pub fn to_fen(&self) -> String {
        self.to_string()
    }

    pub fn board(&self) -> &Board {
        &self.board
    }

    pub fn side_to_move(&self) -> Side {
        self.board.side_to_move().into()
    }

    pub fn halfmove_clock(&self) -> u32 {
        self.halfmove_clock
    }

    pub fn fullmove_number(&self) -> u32 {
        self.fullmove_number
    }

    /// FEN fields 1-4 as the board renders them.
    fn board_fields(&self) -> Vec<String> {
        self.board
            .to_string()
            .split_whitespace()
            .take(4)
            .map(str::to_string)
            .collect()
    }

    pub fn castling_field(&self) -> String {
        self.board_fields().get(2).cloned().unwrap_or_else(|| "-".to_string())
    }

    pub fn en_passant_field(&self) -> Option<String> {
        self.board_fields().get(3).filter(|f| f.as_str() != "-").cloned()
    }

    /// Same board, same clocks, only compares placement and side to move.
    pub fn same_placement(&self, other: &Position) -> bool {
        self.board == other.board
    }

    pub fn hash(&self) -> u64 {
        self.board.get_hash()
    }

    pub fn piece_at(&self, square: Square) -> Option<(PieceKind, Side)> {
        let piece = self.board.piece_on(square)?;
        let color = self.board.color_on(square)?;
        Some((piece.into(), color.into()))
    }

    pub fn pieces_of(&self, side: Side) -> Vec<(Square, PieceKind)> {
        let color: Color = side.into();
        ALL_SQUARES
            .iter()
            .filter(|sq| self.board.color_on(**sq) == Some(color))
            .filter_map(|sq| self.board.piece_on(*sq).map(|p| (*sq, p.into())))
            .collect()
    }

    pub fn find_piece(&self, owner: Side, kind: PieceKind) -> Option<Square> {
        self.pieces_of(owner)
            .into_iter()
            .find(|(_, k)| *k == kind)
            .map(|(sq, _)| sq)
    }

    /// Position after a legal move, with the clocks advanced.
    pub fn after_move(&self, mv: ChessMove) -> Position {
        let mover = self.board.side_to_move();
        let is_pawn = self.board.piece_on(mv.get_source()) == Some(Piece::Pawn);
        let is_capture = self.board.piece_on(mv.get_dest()).is_some();
        Position {
            board: self.board.make_move_new(mv),
            halfmove_clock: if is_pawn || is_capture { 0 } else { self.halfmove_clock + 1 },
            fullmove_number: if mover == Color::Black {
                self.fullmove_number + 1
            } else {
                self.fullmove_number
            },
        }
    }

    /// Hands the move to `side` without touching the pieces.
    /// Fails when the side losing the move would leave a king in check.
    pub fn with_side_to_move(&self, side: Side) -> Option<Position> {
        if self.side_to_move() == side {
            return Some(*self);
        }
        let board = self.board.null_move()?;
        Some(Position { board, ..*self })
    }

    /// Exchanges the contents of two squares and hands the move to `next`.
    pub fn swap_pieces(&self, a: Square, b: Square, next: Side) -> SessionResult<Position> {
        if a == b {
            return Err(SessionError::InvalidSwap("both squares are the same".to_string()));
        }
        let mut builder = BoardBuilder::from(&self.board);
        let first = builder[a];
        let second = builder[b];
        for (square, content) in [(a, second), (b, first)] {
            if let Some((Piece::Pawn, _)) = content {
                if square.get_rank() == Rank::First || square.get_rank() == Rank::Eighth {
                    return Err(SessionError::InvalidSwap(format!(
                        "a pawn cannot stand on {square}"
                    )));
                }
            }
        }
        builder[a] = second;
        builder[b] = first;
        builder.side_to_move(next.into());
        builder.en_passant(None);
        for color in [Color::White, Color::Black] {
            let rights = surviving_castle_rights(&builder, color);
            builder.castle_rights(color, rights);
        }
        let board = Board::try_from(&builder)
            .map_err(|e| SessionError::InvalidSwap(e.to_string()))?;
        Ok(Position {
            board,
            halfmove_clock: self.halfmove_clock,
            fullmove_number: self.fullmove_number,
        })
    }
}

/// Keeps only the castle rights whose king and rook are still home.
fn surviving_castle_rights(builder: &BoardBuilder, color: Color) -> CastleRights {
    let rights = builder.get_castle_rights(color);
    let rank = match color {
        Color::White => Rank::First,
        Color::Black => Rank::Eighth,
    };
    let home = |file: File, piece: Piece| builder[Square::make_square(rank, file)] == Some((piece, color));
    let king_home = home(File::E, Piece::King);
    let kingside = rights.has_kingside() && king_home && home(File::H, Piece::Rook);
    let queenside = rights.has_queenside() && king_home && home(File::A, Piece::Rook);
    match (kingside, queenside) {
        (true, true) => CastleRights::Both,
        (true, false) => CastleRights::KingSide,
        (false, true) => CastleRights::QueenSide,
        (false, false) => CastleRights::NoRights,
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.board_fields().join(" "),
            self.halfmove_clock,
            self.fullmove_number
        )
    }
}

pub fn parse_square(text: &str) -> SessionResult<Square> {
    Square::from_str(&text.trim().to_lowercase())
        .map_err(|_| SessionError::IllegalMove(format!("invalid square {text}")))
}
