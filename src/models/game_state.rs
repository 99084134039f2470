use chess::{Color, Piece};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::models::perk_state::{ArenaMonitor, PerkState};

/// Standard start position, including clocks.
pub const START_FEN: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

/// Seconds on each clock when a game is created without an explicit limit.
pub const DEFAULT_TIME_LIMIT: u32 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    White,
    Black,
}

impl Side {
    pub fn opponent(self) -> Side {
        match self {
            Side::White => Side::Black,
            Side::Black => Side::White,
        }
    }

    /// Accepts "white", "w", "black", "b" in any case.
    pub fn parse(name: &str) -> Option<Side> {
        match name.trim().to_ascii_lowercase().as_str() {
            "white" | "w" => Some(Side::White),
            "black" | "b" => Some(Side::Black),
            _ => None,
        }
    }
}

impl From<Color> for Side {
    fn from(color: Color) -> Self {
        match color {
            Color::White => Side::White,
            Color::Black => Side::Black,
        }
    }
}

impl From<Side> for Color {
    fn from(side: Side) -> Self {
        match side {
            Side::White => Color::White,
            Side::Black => Color::Black,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PieceKind {
    Pawn,
    Knight,
    Bishop,
    Rook,
    Queen,
    King,
}

impl From<Piece> for PieceKind {
    fn from(piece: Piece) -> Self {
        match piece {
            Piece::Pawn => PieceKind::Pawn,
            Piece::Knight => PieceKind::Knight,
            Piece::Bishop => PieceKind::Bishop,
            Piece::Rook => PieceKind::Rook,
            Piece::Queen => PieceKind::Queen,
            Piece::King => PieceKind::King,
        }
    }
}

impl From<PieceKind> for Piece {
    fn from(kind: PieceKind) -> Self {
        match kind {
            PieceKind::Pawn => Piece::Pawn,
            PieceKind::Knight => Piece::Knight,
            PieceKind::Bishop => Piece::Bishop,
            PieceKind::Rook => Piece::Rook,
            PieceKind::Queen => Piece::Queen,
            PieceKind::King => Piece::King,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Waiting,
    Playing,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Winner {
    White,
    Black,
    Draw,
}

impl From<Side> for Winner {
    fn from(side: Side) -> Self {
        match side {
            Side::White => Winner::White,
            Side::Black => Winner::Black,
        }
    }
}

/// The shared, persisted record of one match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameSession {
    pub id: String,
    pub join_code: String,
    pub position: String,
    pub side_to_move: Side,
    pub status: SessionStatus,
    pub winner: Option<Winner>,
    pub time_limit: u32,
    pub white_time_remaining: u32,
    pub black_time_remaining: u32,
    pub turn_started_at: Option<DateTime<Utc>>,
    pub draw_offered_by: Option<Side>,
    pub resignation_by: Option<Side>,
    pub white_player_id: Option<String>,
    pub black_player_id: Option<String>,
    #[serde(default)]
    pub perks: PerkState,
    #[serde(default)]
    pub arena: ArenaMonitor,
    /// Bumped by the store on every write.
    #[serde(default)]
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GameSession {
    pub fn new_waiting(
        id: impl Into<String>,
        join_code: impl Into<String>,
        time_limit: u32,
        now: DateTime<Utc>,
    ) -> Self {
        GameSession {
            id: id.into(),
            join_code: join_code.into(),
            position: START_FEN.to_string(),
            side_to_move: Side::White,
            status: SessionStatus::Waiting,
            winner: None,
            time_limit,
            white_time_remaining: time_limit,
            black_time_remaining: time_limit,
            turn_started_at: None,
            draw_offered_by: None,
            resignation_by: None,
            white_player_id: None,
            black_player_id: None,
            perks: PerkState::default(),
            arena: ArenaMonitor::default(),
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn time_remaining(&self, side: Side) -> u32 {
        match side {
            Side::White => self.white_time_remaining,
            Side::Black => self.black_time_remaining,
        }
    }

    pub fn set_time_remaining(&mut self, side: Side, seconds: u32) {
        match side {
            Side::White => self.white_time_remaining = seconds,
            Side::Black => self.black_time_remaining = seconds,
        }
    }

    pub fn player_id(&self, side: Side) -> Option<&str> {
        match side {
            Side::White => self.white_player_id.as_deref(),
            Side::Black => self.black_player_id.as_deref(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status == SessionStatus::Finished
    }

    pub fn has_free_seat(&self) -> bool {
        self.white_player_id.is_none() || self.black_player_id.is_none()
    }
}

fn nullable<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// A partial write against a [`GameSession`].
///
/// `None` leaves a field untouched; for nullable fields `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side_to_move: Option<Side>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,
    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub winner: Option<Option<Winner>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub white_time_remaining: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub black_time_remaining: Option<u32>,
    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub turn_started_at: Option<Option<DateTime<Utc>>>,
    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub draw_offered_by: Option<Option<Side>>,
    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub resignation_by: Option<Option<Side>>,
    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub white_player_id: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub black_player_id: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub perks: Option<PerkState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arena: Option<ArenaMonitor>,
}

impl SessionPatch {
    pub fn is_empty(&self) -> bool {
        *self == SessionPatch::default()
    }

    pub fn set_time(&mut self, side: Side, seconds: u32) {
        match side {
            Side::White => self.white_time_remaining = Some(seconds),
            Side::Black => self.black_time_remaining = Some(seconds),
        }
    }

    pub fn apply_to(&self, session: &mut GameSession) {
        if let Some(position) = &self.position {
            session.position = position.clone();
        }
        if let Some(side) = self.side_to_move {
            session.side_to_move = side;
        }
        if let Some(status) = self.status {
            session.status = status;
        }
        if let Some(winner) = self.winner {
            session.winner = winner;
        }
        if let Some(seconds) = self.white_time_remaining {
            session.white_time_remaining = seconds;
        }
        if let Some(seconds) = self.black_time_remaining {
            session.black_time_remaining = seconds;
        }
        if let Some(started) = self.turn_started_at {
            session.turn_started_at = started;
        }
        if let Some(offer) = self.draw_offered_by {
            session.draw_offered_by = offer;
        }
        if let Some(resigned) = self.resignation_by {
            session.resignation_by = resigned;
        }
        if let Some(id) = &self.white_player_id {
            session.white_player_id = id.clone();
        }
        if let Some(id) = &self.black_player_id {
            session.black_player_id = id.clone();
        }
        if let Some(perks) = &self.perks {
            session.perks = perks.clone();
        }
        if let Some(arena) = &self.arena {
            session.arena = arena.clone();
        }
    }

    /// The write that turns `old` into `new`.
    pub fn between(old: &GameSession, new: &GameSession) -> SessionPatch {
        fn changed<T: Clone + PartialEq>(old: &T, new: &T) -> Option<T> {
            (old != new).then(|| new.clone())
        }
        SessionPatch {
            position: changed(&old.position, &new.position),
            side_to_move: changed(&old.side_to_move, &new.side_to_move),
            status: changed(&old.status, &new.status),
            winner: changed(&old.winner, &new.winner),
            white_time_remaining: changed(&old.white_time_remaining, &new.white_time_remaining),
            black_time_remaining: changed(&old.black_time_remaining, &new.black_time_remaining),
            turn_started_at: changed(&old.turn_started_at, &new.turn_started_at),
            draw_offered_by: changed(&old.draw_offered_by, &new.draw_offered_by),
            resignation_by: changed(&old.resignation_by, &new.resignation_by),
            white_player_id: changed(&old.white_player_id, &new.white_player_id),
            black_player_id: changed(&old.black_player_id, &new.black_player_id),
            perks: changed(&old.perks, &new.perks),
            arena: changed(&old.arena, &new.arena),
        }
    }

    /// Fields set in `later` win.
    pub fn merge(&mut self, later: SessionPatch) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if later.$field.is_some() { self.$field = later.$field; })*
            };
        }
        take!(
            position,
            side_to_move,
            status,
            winner,
            white_time_remaining,
            black_time_remaining,
            turn_started_at,
            draw_offered_by,
            resignation_by,
            white_player_id,
            black_player_id,
            perks,
            arena
        );
    }
}

/// One entry of the ordered move log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveRecord {
    pub number: u32,
    pub notation: String,
    pub position_after: String,
    pub player_color: Side,
    pub explanation: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_clears_nullable_fields_with_explicit_null() {
        let now = Utc::now();
        let mut session = GameSession::new_waiting("g1", "ABC123", 300, now);
        session.draw_offered_by = Some(Side::White);

        let patch: SessionPatch =
            serde_json::from_str(r#"{"draw_offered_by": null, "white_time_remaining": 12}"#)
                .unwrap();
        assert_eq!(patch.draw_offered_by, Some(None));
        patch.apply_to(&mut session);

        assert_eq!(session.draw_offered_by, None);
        assert_eq!(session.white_time_remaining, 12);
        assert_eq!(session.black_time_remaining, 300);
    }

    #[test]
    fn absent_fields_are_left_alone() {
        let patch: SessionPatch = serde_json::from_str("{}").unwrap();
        assert!(patch.is_empty());
        assert_eq!(serde_json::to_string(&patch).unwrap(), "{}");
    }

    #[test]
    fn between_only_carries_changed_fields() {
        let now = Utc::now();
        let old = GameSession::new_waiting("g1", "ABC123", 300, now);
        let mut new = old.clone();
        new.black_time_remaining = 290;
        new.draw_offered_by = Some(Side::Black);

        let patch = SessionPatch::between(&old, &new);
        assert_eq!(patch.black_time_remaining, Some(290));
        assert_eq!(patch.draw_offered_by, Some(Some(Side::Black)));
        assert_eq!(patch.white_time_remaining, None);
        assert_eq!(patch.position, None);

        let mut replayed = old.clone();
        patch.apply_to(&mut replayed);
        assert_eq!(replayed, new);
    }

    #[test]
    fn side_names_parse_loosely() {
        assert_eq!(Side::parse("White"), Some(Side::White));
        assert_eq!(Side::parse(" b "), Some(Side::Black));
        assert_eq!(Side::parse("viewer"), None);
    }
}
