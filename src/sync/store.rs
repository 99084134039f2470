use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use log::{debug, info};
use rand::Rng;
use uuid::Uuid;

use crate::error::PersistError;
use crate::models::{AvailableGame, GameSession, MoveRecord, SessionPatch, SessionStatus, Side};
use crate::perks::engine::settle_time_bonuses;

pub const JOIN_CODE_LENGTH: usize = 6;
const JOIN_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// The shared session record plus its change feed.
///
/// Writes are last-write-wins; there is no read-modify-write transaction.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn fetch(&self, game_id: &str) -> Result<GameSession, PersistError>;

    /// Applies a partial write and returns the record as stored.
    async fn persist(&self, game_id: &str, patch: SessionPatch) -> Result<GameSession, PersistError>;

    async fn append_move(&self, game_id: &str, record: MoveRecord) -> Result<(), PersistError>;

    /// Deletes the `count` most recent move records.
    async fn delete_recent_moves(&self, game_id: &str, count: usize) -> Result<(), PersistError>;

    async fn moves(&self, game_id: &str) -> Result<Vec<MoveRecord>, PersistError>;

    /// Removes a game nobody has started yet.
    async fn delete(&self, game_id: &str) -> Result<(), PersistError>;

    /// Full records pushed after every write. The stream ends when the feed drops.
    fn subscribe(&self, game_id: &str) -> UnboundedReceiver<GameSession>;
}

/// A seat handed out by [`MemoryStore::join`].
#[derive(Debug, Clone, PartialEq)]
pub struct Seat {
    pub game: GameSession,
    pub side: Side,
    pub player_id: String,
    pub is_creator: bool,
}

#[derive(Default)]
struct Inner {
    games: HashMap<String, GameSession>,
    moves: HashMap<String, Vec<MoveRecord>>,
    feeds: HashMap<String, Vec<UnboundedSender<GameSession>>>,
}

impl Inner {
    fn notify(&mut self, game: &GameSession) {
        if let Some(feeds) = self.feeds.get_mut(&game.id) {
            feeds.retain(|feed| feed.unbounded_send(game.clone()).is_ok());
            debug!("notified {} subscribers of game {}", feeds.len(), game.id);
        }
    }

    fn game_mut(&mut self, game_id: &str) -> Result<&mut GameSession, PersistError> {
        self.games
            .get_mut(game_id)
            .ok_or_else(|| PersistError::NotFound(game_id.to_string()))
    }
}

/// In-process store backing the relay server and the tests.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create_game(&self, time_limit: u32, now: DateTime<Utc>) -> GameSession {
        let mut inner = self.lock();
        let mut join_code = random_join_code();
        while inner.games.values().any(|game| game.join_code == join_code) {
            join_code = random_join_code();
        }
        let game = GameSession::new_waiting(Uuid::new_v4().to_string(), join_code, time_limit, now);
        info!("Created game {} with join code {}", game.id, game.join_code);
        inner.games.insert(game.id.clone(), game.clone());
        inner.moves.insert(game.id.clone(), Vec::new());
        game
    }

    /// Waiting games with a free seat, newest first.
    pub fn available_games(&self) -> Vec<AvailableGame> {
        let inner = self.lock();
        let mut games: Vec<&GameSession> = inner
            .games
            .values()
            .filter(|game| game.status == SessionStatus::Waiting && game.has_free_seat())
            .collect();
        games.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        games
            .into_iter()
            .map(|game| AvailableGame {
                id: game.id.clone(),
                join_code: game.join_code.clone(),
                created_at: game.created_at,
                time_limit: game.time_limit,
            })
            .collect()
    }

    /// First seat is white and the creator; the second is black and starts the game.
    pub fn join(&self, join_code: &str, now: DateTime<Utc>) -> Result<Seat, PersistError> {
        let code = join_code.trim().to_ascii_uppercase();
        let mut inner = self.lock();
        let game_id = inner
            .games
            .values()
            .find(|game| game.join_code == code)
            .map(|game| game.id.clone())
            .ok_or_else(|| PersistError::UnknownJoinCode(code.clone()))?;

        let player_id = Uuid::new_v4().to_string();
        let game = inner.game_mut(&game_id)?;
        if game.status != SessionStatus::Waiting {
            return Err(PersistError::GameFull(game_id));
        }
        let (side, is_creator) = if game.white_player_id.is_none() {
            game.white_player_id = Some(player_id.clone());
            (Side::White, true)
        } else if game.black_player_id.is_none() {
            game.black_player_id = Some(player_id.clone());
            game.status = SessionStatus::Playing;
            game.turn_started_at = Some(now);
            settle_time_bonuses(game);
            (Side::Black, false)
        } else {
            return Err(PersistError::GameFull(game_id));
        };
        game.revision += 1;
        game.updated_at = now;
        let game = game.clone();
        info!("Player {} joined game {} as {:?}", player_id, game.id, side);
        inner.notify(&game);
        Ok(Seat {
            game,
            side,
            player_id,
            is_creator,
        })
    }

    /// Only games nobody has started yet can be deleted.
    pub fn delete_game(&self, game_id: &str) -> Result<(), PersistError> {
        let mut inner = self.lock();
        let game = inner.game_mut(game_id)?;
        if game.status != SessionStatus::Waiting {
            return Err(PersistError::NotDeletable(game_id.to_string()));
        }
        inner.games.remove(game_id);
        inner.moves.remove(game_id);
        // dropping the senders ends every subscriber's stream
        inner.feeds.remove(game_id);
        info!("Deleted game {}", game_id);
        Ok(())
    }

    pub fn get(&self, game_id: &str) -> Result<GameSession, PersistError> {
        let inner = self.lock();
        inner
            .games
            .get(game_id)
            .cloned()
            .ok_or_else(|| PersistError::NotFound(game_id.to_string()))
    }

    pub fn apply_patch(&self, game_id: &str, patch: &SessionPatch, now: DateTime<Utc>) -> Result<GameSession, PersistError> {
        let mut inner = self.lock();
        let game = inner.game_mut(game_id)?;
        patch.apply_to(game);
        game.revision += 1;
        game.updated_at = now;
        let game = game.clone();
        inner.notify(&game);
        Ok(game)
    }

    pub fn move_log(&self, game_id: &str) -> Result<Vec<MoveRecord>, PersistError> {
        let inner = self.lock();
        inner
            .moves
            .get(game_id)
            .cloned()
            .ok_or_else(|| PersistError::NotFound(game_id.to_string()))
    }

    pub fn open_feed(&self, game_id: &str) -> UnboundedReceiver<GameSession> {
        let (sender, receiver) = unbounded();
        self.lock().feeds.entry(game_id.to_string()).or_default().push(sender);
        receiver
    }

    /// Drops every subscriber of a game, as a lost connection would.
    pub fn close_feeds(&self, game_id: &str) {
        if let Some(feeds) = self.lock().feeds.remove(game_id) {
            info!("Closed {} feeds of game {}", feeds.len(), game_id);
        }
    }

    pub fn subscriber_count(&self, game_id: &str) -> usize {
        self.lock().feeds.get(game_id).map_or(0, Vec::len)
    }
}

fn random_join_code() -> String {
    let mut rng = rand::thread_rng();
    (0..JOIN_CODE_LENGTH)
        .map(|_| JOIN_CODE_ALPHABET[rng.gen_range(0..JOIN_CODE_ALPHABET.len())] as char)
        .collect()
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn fetch(&self, game_id: &str) -> Result<GameSession, PersistError> {
        self.get(game_id)
    }

    async fn persist(&self, game_id: &str, patch: SessionPatch) -> Result<GameSession, PersistError> {
        self.apply_patch(game_id, &patch, Utc::now())
    }

    async fn append_move(&self, game_id: &str, record: MoveRecord) -> Result<(), PersistError> {
        let mut inner = self.lock();
        let moves = inner
            .moves
            .get_mut(game_id)
            .ok_or_else(|| PersistError::NotFound(game_id.to_string()))?;
        moves.push(record);
        Ok(())
    }

    async fn delete_recent_moves(&self, game_id: &str, count: usize) -> Result<(), PersistError> {
        let mut inner = self.lock();
        let moves = inner
            .moves
            .get_mut(game_id)
            .ok_or_else(|| PersistError::NotFound(game_id.to_string()))?;
        let keep = moves.len().saturating_sub(count);
        moves.truncate(keep);
        Ok(())
    }

    async fn moves(&self, game_id: &str) -> Result<Vec<MoveRecord>, PersistError> {
        self.move_log(game_id)
    }

    async fn delete(&self, game_id: &str) -> Result<(), PersistError> {
        self.delete_game(game_id)
    }

    fn subscribe(&self, game_id: &str) -> UnboundedReceiver<GameSession> {
        self.open_feed(game_id)
    }
}
