use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{SessionError, SessionResult};
use crate::game::position::Position;
use crate::game::utils::{captured_pieces, CapturedPieces};
use crate::models::{MoveRecord, Side};

/// Full state of the board at one point of the game.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub position: String,
    pub side_to_move: Side,
    pub captured: CapturedPieces,
    pub castling_rights: String,
    pub en_passant: Option<String>,
    pub move_number: u32,
    pub half_move_clock: u32,
    pub player_who_moved: Option<Side>,
    pub move_notation: Option<String>,
    pub captured_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn of(position: &Position, captured_at: DateTime<Utc>) -> Self {
        Snapshot {
            position: position.to_fen(),
            side_to_move: position.side_to_move(),
            captured: captured_pieces(position.board()),
            castling_rights: position.castling_field(),
            en_passant: position.en_passant_field(),
            move_number: position.fullmove_number(),
            half_move_clock: position.halfmove_clock(),
            player_who_moved: None,
            move_notation: None,
            captured_at,
        }
    }

    /// Tags a pre-move snapshot with the move that is about to leave it.
    pub fn before_move(mut self, mover: Side, notation: impl Into<String>) -> Self {
        self.player_who_moved = Some(mover);
        self.move_notation = Some(notation.into());
        self
    }

    pub fn to_position(&self) -> SessionResult<Position> {
        let position = Position::from_fen(&self.position)?;
        // the stored side wins over whatever the FEN says
        position
            .with_side_to_move(self.side_to_move)
            .ok_or_else(|| SessionError::InvalidPosition(self.position.clone()))
    }
}

/// Chronological list of snapshots, used for shield rewinds.
///
/// `entries[0]` is the position the session started from; `entries[i]` for
/// `i >= 1` is the position before move number `i`.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    session_id: String,
    entries: Vec<Snapshot>,
    mirror: Option<SnapshotMirror>,
}

impl SnapshotStore {
    pub fn new(session_id: impl Into<String>, initial: Snapshot) -> Self {
        SnapshotStore {
            session_id: session_id.into(),
            entries: vec![initial],
            mirror: None,
        }
    }

    /// Restores from the mirror when it holds a usable list.
    pub fn with_mirror(session_id: impl Into<String>, initial: Snapshot, mirror: SnapshotMirror) -> Self {
        let session_id = session_id.into();
        let entries = match mirror.load(&session_id) {
            Some(entries) if !entries.is_empty() => {
                debug!("restored {} snapshots for {}", entries.len(), session_id);
                entries
            }
            _ => vec![initial],
        };
        let store = SnapshotStore {
            session_id,
            entries,
            mirror: Some(mirror),
        };
        store.sync_mirror();
        store
    }

    /// Rebuilds the list from the persisted move log.
    pub fn from_move_log(session_id: impl Into<String>, initial: &Position, moves: &[MoveRecord], at: DateTime<Utc>) -> Self {
        let mut store = SnapshotStore::new(session_id, Snapshot::of(initial, at));
        let mut previous = *initial;
        for record in moves {
            store
                .entries
                .push(Snapshot::of(&previous, at).before_move(record.player_color, record.notation.clone()));
            match Position::from_fen(&record.position_after) {
                Ok(position) => previous = position,
                Err(e) => {
                    warn!("move log entry {} is unreadable: {}", record.number, e);
                    break;
                }
            }
        }
        store
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Snapshot] {
        &self.entries
    }

    pub fn latest(&self) -> Option<&Snapshot> {
        self.entries.last()
    }

    pub fn record(&mut self, snapshot: Snapshot) {
        self.entries.push(snapshot);
        self.sync_mirror();
    }

    /// Puts back a list taken earlier, for rollbacks. An empty list is ignored.
    pub fn replace(&mut self, entries: Vec<Snapshot>) {
        if entries.is_empty() {
            return;
        }
        self.entries = entries;
        self.sync_mirror();
    }

    /// Ply to rewind so the player regains their last decision point:
    /// one while the second player of the full move is to move, else two.
    pub fn rewind_depth(side_to_move: Side) -> usize {
        match side_to_move {
            Side::Black => 1,
            Side::White => 2,
        }
    }

    /// The snapshot `plies` moves back.
    pub fn target_for(&self, plies: usize) -> SessionResult<&Snapshot> {
        if plies == 0 || self.entries.len() < plies + 1 {
            return Err(SessionError::InsufficientHistory {
                requested: plies,
                available: self.entries.len(),
            });
        }
        Ok(&self.entries[self.entries.len() - plies])
    }

    /// Discards everything after `index`, the first entry always survives.
    pub fn truncate_after(&mut self, index: usize) {
        self.entries.truncate(index.saturating_add(1).max(1));
        self.sync_mirror();
    }

    /// Rewinds according to [`rewind_depth`](Self::rewind_depth) and returns
    /// the restored snapshot with the number of ply undone.
    pub fn undo(&mut self, side_to_move: Side) -> SessionResult<(Snapshot, usize)> {
        let plies = Self::rewind_depth(side_to_move);
        let target = self.target_for(plies)?.clone();
        let keep_until = self.entries.len() - plies - 1;
        self.truncate_after(keep_until);
        Ok((target, plies))
    }

    fn sync_mirror(&self) {
        if let Some(mirror) = &self.mirror {
            mirror.save(&self.session_id, &self.entries);
        }
    }
}

/// Keeps a JSON copy of each session's snapshot list on disk.
#[derive(Debug, Clone)]
pub struct SnapshotMirror {
    dir: PathBuf,
}

impl SnapshotMirror {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        SnapshotMirror { dir: dir.into() }
    }

    pub fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("move_history_{session_id}.json"))
    }

    pub fn load(&self, session_id: &str) -> Option<Vec<Snapshot>> {
        let path = self.path_for(session_id);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("could not read snapshot mirror {}: {}", path.display(), e);
                return None;
            }
        };
        match serde_json::from_str(&text) {
            Ok(entries) => Some(entries),
            Err(e) => {
                warn!("discarding corrupt snapshot mirror {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Failures are logged and otherwise ignored.
    pub fn save(&self, session_id: &str, entries: &[Snapshot]) {
        if let Err(e) = self.write(&self.path_for(session_id), entries) {
            warn!("could not mirror snapshots for {}: {}", session_id, e);
        }
    }

    pub fn remove(&self, session_id: &str) {
        let path = self.path_for(session_id);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("could not remove snapshot mirror {}: {}", path.display(), e);
            }
        }
    }

    fn write(&self, path: &Path, entries: &[Snapshot]) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_vec(entries).map_err(io::Error::from)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::rules::{MoveRequest, Rules, StandardRules};

    fn advance(position: &Position, from: &str, to: &str) -> (Position, String) {
        let outcome = StandardRules
            .apply_move(position, position.side_to_move(), MoveRequest::parse(from, to, None).unwrap())
            .unwrap();
        (outcome.position, outcome.notation)
    }

    #[test]
    fn undo_after_a_single_white_move_restores_the_start() {
        let now = Utc::now();
        let start = Position::start();
        let mut store = SnapshotStore::new("g1", Snapshot::of(&start, now));
        assert_eq!(store.len(), 1);

        let (after, notation) = advance(&start, "e2", "e4");
        store.record(Snapshot::of(&start, now).before_move(Side::White, notation));
        assert_eq!(store.len(), 2);

        let (restored, plies) = store.undo(after.side_to_move()).unwrap();
        assert_eq!(plies, 1);
        assert_eq!(restored.side_to_move, Side::White);
        assert_eq!(restored.to_position().unwrap(), start);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn white_to_move_rewinds_a_full_move() {
        let now = Utc::now();
        let start = Position::start();
        let mut store = SnapshotStore::new("g1", Snapshot::of(&start, now));
        let mut position = start;
        for (from, to) in [("e2", "e4"), ("e7", "e5"), ("g1", "f3"), ("b8", "c6")] {
            let (next, notation) = advance(&position, from, to);
            store.record(Snapshot::of(&position, now).before_move(position.side_to_move(), notation));
            position = next;
        }
        assert_eq!(store.len(), 5);

        let (restored, plies) = store.undo(position.side_to_move()).unwrap();
        assert_eq!(plies, 2);
        assert_eq!(restored.move_notation.as_deref(), Some("Nf3"));
        assert_eq!(restored.side_to_move, Side::White);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn too_little_history_is_rejected() {
        let now = Utc::now();
        let mut store = SnapshotStore::new("g1", Snapshot::of(&Position::start(), now));
        assert_eq!(
            store.undo(Side::Black),
            Err(SessionError::InsufficientHistory { requested: 1, available: 1 })
        );
        store.record(Snapshot::of(&Position::start(), now));
        assert!(matches!(
            store.undo(Side::White),
            Err(SessionError::InsufficientHistory { requested: 2, available: 2 })
        ));
    }

    #[test]
    fn rebuilding_from_the_move_log_matches_recording() {
        let now = Utc::now();
        let start = Position::start();
        let (after_e4, e4) = advance(&start, "e2", "e4");
        let (after_e5, e5) = advance(&after_e4, "e7", "e5");
        let moves = vec![
            MoveRecord {
                number: 1,
                notation: e4,
                position_after: after_e4.to_fen(),
                player_color: Side::White,
                explanation: None,
            },
            MoveRecord {
                number: 2,
                notation: e5,
                position_after: after_e5.to_fen(),
                player_color: Side::Black,
                explanation: None,
            },
        ];

        let store = SnapshotStore::from_move_log("g1", &start, &moves, now);
        assert_eq!(store.len(), 3);
        assert_eq!(store.entries()[2].position, after_e4.to_fen());
        assert_eq!(store.entries()[2].player_who_moved, Some(Side::Black));
    }

    #[test]
    fn mirror_survives_a_reload() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let start = Position::start();
        let mirror = SnapshotMirror::new(dir.path());

        let mut store = SnapshotStore::with_mirror("g7", Snapshot::of(&start, now), mirror.clone());
        store.record(Snapshot::of(&start, now).before_move(Side::White, "e4"));
        assert!(mirror.path_for("g7").exists());

        let reloaded = SnapshotStore::with_mirror("g7", Snapshot::of(&start, now), mirror);
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.entries(), store.entries());
    }

    #[test]
    fn corrupt_mirror_falls_back_to_the_initial_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = SnapshotMirror::new(dir.path());
        fs::write(mirror.path_for("g8"), "not json").unwrap();

        let store = SnapshotStore::with_mirror("g8", Snapshot::of(&Position::start(), Utc::now()), mirror);
        assert_eq!(store.len(), 1);
    }
}
