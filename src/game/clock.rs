use chrono::{DateTime, Utc};

use crate::models::{GameSession, SessionStatus, Side};

/// Whole seconds since `started`, zero when the clock is not running.
pub fn elapsed_seconds(started: Option<DateTime<Utc>>, now: DateTime<Utc>) -> u32 {
    match started {
        Some(started) if now > started => {
            u32::try_from((now - started).num_seconds()).unwrap_or(u32::MAX)
        }
        _ => 0,
    }
}

/// Seconds to charge `side` for the running turn; zero unless it is theirs.
pub fn turn_charge(session: &GameSession, side: Side, now: DateTime<Utc>) -> u32 {
    if session.status != SessionStatus::Playing || session.side_to_move != side {
        return 0;
    }
    elapsed_seconds(session.turn_started_at, now)
}

/// Display countdown derived from the authoritative record.
///
/// Purely cosmetic: it never writes back, and is rebuilt from every record
/// that arrives.
#[derive(Debug, Clone, PartialEq)]
pub struct ClockView {
    white: u32,
    black: u32,
    running: Option<Side>,
    turn_started_at: Option<DateTime<Utc>>,
}

impl ClockView {
    pub fn from_session(session: &GameSession) -> Self {
        let running = match session.status {
            SessionStatus::Playing => Some(session.side_to_move),
            _ => None,
        };
        ClockView {
            white: session.white_time_remaining,
            black: session.black_time_remaining,
            running,
            turn_started_at: session.turn_started_at,
        }
    }

    pub fn running(&self) -> Option<Side> {
        self.running
    }

    pub fn remaining(&self, side: Side, now: DateTime<Utc>) -> u32 {
        let stored = match side {
            Side::White => self.white,
            Side::Black => self.black,
        };
        if self.running == Some(side) {
            stored.saturating_sub(elapsed_seconds(self.turn_started_at, now))
        } else {
            stored
        }
    }

    /// The side whose flag has fallen, if any.
    pub fn flagged(&self, now: DateTime<Utc>) -> Option<Side> {
        self.running.filter(|side| self.remaining(*side, now) == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn playing(now: DateTime<Utc>) -> GameSession {
        let mut session = GameSession::new_waiting("g1", "ABCDEF", 60, now);
        session.status = SessionStatus::Playing;
        session.turn_started_at = Some(now);
        session
    }

    #[test]
    fn only_the_side_to_move_is_charged() {
        let now = Utc::now();
        let session = playing(now);
        let later = now + Duration::milliseconds(12_700);

        assert_eq!(turn_charge(&session, Side::White, later), 12);
        assert_eq!(turn_charge(&session, Side::Black, later), 0);
    }

    #[test]
    fn view_counts_down_and_reports_flag_fall() {
        let now = Utc::now();
        let session = playing(now);
        let view = ClockView::from_session(&session);

        assert_eq!(view.remaining(Side::White, now + Duration::seconds(10)), 50);
        assert_eq!(view.remaining(Side::Black, now + Duration::seconds(10)), 60);
        assert_eq!(view.flagged(now + Duration::seconds(59)), None);
        assert_eq!(view.flagged(now + Duration::seconds(61)), Some(Side::White));
    }

    #[test]
    fn finished_games_freeze_the_clock() {
        let now = Utc::now();
        let mut session = playing(now);
        session.status = SessionStatus::Finished;
        let view = ClockView::from_session(&session);

        assert_eq!(view.running(), None);
        assert_eq!(view.remaining(Side::White, now + Duration::seconds(600)), 60);
        assert_eq!(view.flagged(now + Duration::seconds(600)), None);
    }
}
