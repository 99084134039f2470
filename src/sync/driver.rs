use std::sync::Arc;

use chess::{Piece, Square};
use chrono::Utc;
use futures::channel::mpsc::UnboundedReceiver;
use futures::StreamExt;
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::Value;

use crate::config::SessionConfig;
use crate::error::{PersistError, SessionError, SessionResult};
use crate::game::position::Position;
use crate::game::rules::StandardRules;
use crate::game::snapshot_store::{Snapshot, SnapshotMirror, SnapshotStore};
use crate::models::{GameSession, Side};
use crate::perks::{merge_event, parse_event, MergeOutcome};
use crate::sync::client::{position_of, Abandon, ClientSession, MoveAttempt, RemoteOutcome};
use crate::sync::evaluation::{Evaluation, Evaluator};
use crate::sync::store::SessionStore;
use crate::sync::write::PendingWrite;

/// Runs one [`ClientSession`] against a store and its change feed.
pub struct SessionDriver<S: SessionStore, E: Evaluator> {
    store: Arc<S>,
    evaluator: E,
    client: ClientSession,
    feed: UnboundedReceiver<GameSession>,
    config: SessionConfig,
    rng: StdRng,
}

impl<S: SessionStore, E: Evaluator> SessionDriver<S, E> {
    /// Subscribes first, then reads the record, so no write falls in between.
    pub async fn connect(
        store: Arc<S>,
        evaluator: E,
        game_id: &str,
        seat: Side,
        config: SessionConfig,
    ) -> SessionResult<Self> {
        let feed = store.subscribe(game_id);
        let record = store.fetch(game_id).await?;
        let moves = store.moves(game_id).await?;
        let now = Utc::now();

        let initial = Snapshot::of(&position_of(&record)?, now);
        let snapshots = match &config.snapshot_dir {
            Some(dir) => SnapshotStore::with_mirror(game_id, initial, SnapshotMirror::new(dir)),
            None => SnapshotStore::new(game_id, initial),
        };
        let snapshots = if snapshots.len() == 1 && !moves.is_empty() {
            info!("rebuilding {} snapshots of game {} from the move log", moves.len(), game_id);
            SnapshotStore::from_move_log(game_id, &Position::start(), &moves, now)
        } else {
            snapshots
        };

        let client = ClientSession::new(StandardRules, record, seat, snapshots)?;
        Ok(SessionDriver {
            store,
            evaluator,
            client,
            feed,
            config,
            rng: StdRng::from_entropy(),
        })
    }

    /// Uses `rng` for perk rolls instead of an entropy-seeded one.
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    pub fn client(&self) -> &ClientSession {
        &self.client
    }

    pub fn game_id(&self) -> &str {
        &self.client.record().id
    }

    /// Rebases `write` onto the stored record and persists it with its move
    /// log changes. A restore write produced while re-reading is stored too.
    async fn submit(&mut self, write: PendingWrite) -> SessionResult<GameSession> {
        let mut queue = vec![write];
        let mut last = None;
        while let Some(write) = queue.pop() {
            let (stored, refetch) = self.store_write(write).await?;
            last = Some(stored);
            if refetch {
                if let RemoteOutcome::RejectedFrozen(restore) = self.reconcile().await? {
                    queue.push(restore);
                }
            }
        }
        match last {
            Some(stored) => Ok(stored),
            None => self.store.fetch(self.game_id()).await.map_err(SessionError::from),
        }
    }

    async fn store_write(&mut self, mut write: PendingWrite) -> SessionResult<(GameSession, bool)> {
        let game_id = self.game_id().to_string();
        let fresh = match self.store.fetch(&game_id).await {
            Ok(fresh) => fresh,
            Err(e) => return Err(self.client.fail_write(write.write_id, e)),
        };
        if fresh.is_finished() && write.changes_board() {
            warn!("game {} finished before write {} was stored", game_id, write.write_id);
            self.client
                .fail_write(write.write_id, PersistError::Unavailable("game already finished".to_string()));
            self.client.on_remote_change(fresh, Utc::now())?;
            return Err(SessionError::GameFinished);
        }
        if write.board_moved_under(&fresh) {
            warn!(
                "board of game {} moved to revision {} under write {}, adopting it",
                game_id, fresh.revision, write.write_id
            );
            let error = self.client.fail_write(
                write.write_id,
                PersistError::BoardChanged {
                    game_id: game_id.clone(),
                    revision: fresh.revision,
                },
            );
            self.client.on_remote_change(fresh, Utc::now())?;
            return Err(error);
        }
        write.rebase(&fresh);

        let stored = match self.store.persist(&game_id, write.patch.clone()).await {
            Ok(stored) => stored,
            Err(e) => return Err(self.client.fail_write(write.write_id, e)),
        };
        if write.undo_moves > 0 {
            if let Err(e) = self.store.delete_recent_moves(&game_id, write.undo_moves).await {
                warn!("could not trim the move log of game {}: {}", game_id, e);
            }
        }
        if let Some(record) = write.move_record.take() {
            if let Err(e) = self.store.append_move(&game_id, record).await {
                warn!("could not append to the move log of game {}: {}", game_id, e);
            }
        }
        debug!("stored write {} of game {} at revision {}", write.write_id, game_id, stored.revision);

        let ack = self.client.ack_write(write.write_id, stored.clone());
        Ok((stored, ack.refetch))
    }

    async fn reconcile(&mut self) -> SessionResult<RemoteOutcome> {
        let fresh = self.store.fetch(self.game_id()).await?;
        self.client.on_remote_change(fresh, Utc::now())
    }

    /// Re-reads the authoritative record and reconciles it.
    pub async fn refresh(&mut self) -> SessionResult<RemoteOutcome> {
        let outcome = self.reconcile().await?;
        if let RemoteOutcome::RejectedFrozen(write) = &outcome {
            self.submit(write.clone()).await?;
        }
        Ok(outcome)
    }

    /// Handles every notification already queued. A notification only says
    /// that something changed, so a burst causes a single re-read.
    pub async fn sync(&mut self) -> SessionResult<Option<RemoteOutcome>> {
        let mut signalled = false;
        loop {
            match self.feed.try_next() {
                Ok(Some(_)) => signalled = true,
                Ok(None) => {
                    self.resubscribe();
                    signalled = true;
                    break;
                }
                Err(_) => break,
            }
        }
        if !signalled {
            return Ok(None);
        }
        self.refresh().await.map(Some)
    }

    /// Waits for the next notification, resubscribing if the feed ended.
    pub async fn next_change(&mut self) -> SessionResult<RemoteOutcome> {
        if self.feed.next().await.is_none() {
            self.resubscribe();
        }
        self.refresh().await
    }

    fn resubscribe(&mut self) {
        info!("change feed of game {} ended, resubscribing", self.game_id());
        self.feed = self.store.subscribe(self.game_id());
    }

    pub async fn play(&mut self, from: Square, to: Square, promotion: Option<Piece>) -> SessionResult<MoveAttempt> {
        let attempt = self.client.attempt_move(from, to, promotion, Utc::now())?;
        if let MoveAttempt::Committed(write) = &attempt {
            self.submit(write.clone()).await?;
        }
        Ok(attempt)
    }

    pub async fn promote(&mut self, piece: Piece) -> SessionResult<GameSession> {
        let write = self.client.choose_promotion(piece, Utc::now())?;
        self.submit(write).await
    }

    /// Swaps two pieces, holding the board for the animation before persisting.
    pub async fn swap(&mut self, a: Square, b: Square) -> SessionResult<GameSession> {
        self.client.begin_piece_swap(a, b)?;
        actix_rt::time::sleep(self.config.swap_animation).await;
        let write = match self.client.finish_piece_swap(Utc::now()) {
            Ok(write) => write,
            Err(e) => {
                self.client.cancel_piece_swap();
                return Err(e);
            }
        };
        self.submit(write).await
    }

    pub async fn shield(&mut self) -> SessionResult<GameSession> {
        let write = self.client.use_shield(Utc::now())?;
        self.submit(write).await
    }

    pub async fn resign(&mut self) -> SessionResult<GameSession> {
        let write = self.client.resign(Utc::now())?;
        self.submit(write).await
    }

    pub async fn offer_draw(&mut self) -> SessionResult<GameSession> {
        let write = self.client.offer_draw()?;
        self.submit(write).await
    }

    pub async fn accept_draw(&mut self) -> SessionResult<GameSession> {
        let write = self.client.accept_draw(Utc::now())?;
        self.submit(write).await
    }

    pub async fn decline_draw(&mut self) -> SessionResult<GameSession> {
        let write = self.client.decline_draw()?;
        self.submit(write).await
    }

    /// Deletes a waiting game or resigns a running one.
    pub async fn abandon(&mut self) -> SessionResult<()> {
        match self.client.abandon(Utc::now())? {
            Abandon::Delete => {
                let game_id = self.game_id().to_string();
                self.store.delete(&game_id).await?;
                if let Some(dir) = &self.config.snapshot_dir {
                    SnapshotMirror::new(dir).remove(&game_id);
                }
                Ok(())
            }
            Abandon::Write(write) => self.submit(write).await.map(|_| ()),
        }
    }

    /// Finishes the game if the running clock has run out.
    pub async fn tick(&mut self) -> SessionResult<Option<GameSession>> {
        match self.client.tick(Utc::now()) {
            Some(write) => self.submit(write).await.map(Some),
            None => Ok(None),
        }
    }

    /// Spends the hint token and asks the evaluator about the current position.
    pub async fn hint(&mut self) -> SessionResult<Evaluation> {
        let (fen, write) = self.client.request_hint()?;
        self.submit(write).await?;
        let evaluation = self.evaluator.evaluate(&fen, self.config.hint_depth).await?;
        match self.client.accept_evaluation(&fen, evaluation) {
            Ok(evaluation) => Ok(evaluation.clone()),
            Err(e) => {
                debug!("{}", e);
                Err(e)
            }
        }
    }

    /// Merges a named arena notification into the shared record.
    pub async fn arena_event(&mut self, name: &str, payload: &Value) -> SessionResult<MergeOutcome> {
        let envelope = match parse_event(name, payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("ignoring arena event: {}", e);
                return Err(e);
            }
        };
        let game_id = self.game_id().to_string();
        let fresh = self.store.fetch(&game_id).await?;
        let outcome = merge_event(&fresh, &envelope, &mut self.rng, Utc::now());
        if outcome.duplicate || outcome.patch.is_empty() {
            return Ok(outcome);
        }
        if let Some(milestone) = &outcome.milestone {
            info!(
                "milestone {} reached in game {}: {:?}",
                milestone.milestone, game_id, milestone.reward
            );
        }
        self.store.persist(&game_id, outcome.patch.clone()).await?;
        self.sync().await?;
        Ok(outcome)
    }
}
