use actix::Recipient;
use log::info;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::config::SessionConfig;
use crate::models::messages::GameDeleted;
use crate::sync::{MaterialEvaluator, MemoryStore};

/// Application state shared between connections
pub struct AppState {
    pub store: MemoryStore,
    pub evaluator: MaterialEvaluator,
    pub sessions: Mutex<HashMap<String, Recipient<GameDeleted>>>,
    pub default_time_limit: u32,
    pub client_defaults: SessionConfig,
}

impl AppState {
    pub fn new(store: MemoryStore, default_time_limit: u32) -> Self {
        AppState {
            store,
            evaluator: MaterialEvaluator,
            sessions: Mutex::new(HashMap::new()),
            default_time_limit,
            client_defaults: SessionConfig::default(),
        }
    }

    pub fn with_client_defaults(mut self, defaults: SessionConfig) -> Self {
        self.client_defaults = defaults;
        self
    }

    pub fn sessions(&self) -> MutexGuard<'_, HashMap<String, Recipient<GameDeleted>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Tells every connected socket that `game_id` is gone. Returns how many
    /// sockets were told.
    pub fn broadcast_deleted(&self, game_id: &str) -> usize {
        let sessions = self.sessions();
        for recipient in sessions.values() {
            recipient.do_send(GameDeleted(game_id.to_string()));
        }
        info!("Told {} connections that game {} was deleted", sessions.len(), game_id);
        sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix::{Actor, Context, Handler};
    use futures::channel::mpsc::{unbounded, UnboundedSender};
    use futures::StreamExt;

    struct Listener(UnboundedSender<String>);

    impl Actor for Listener {
        type Context = Context<Self>;
    }

    impl Handler<GameDeleted> for Listener {
        type Result = ();

        fn handle(&mut self, msg: GameDeleted, _: &mut Self::Context) {
            let _ = self.0.unbounded_send(msg.0);
        }
    }

    #[actix_rt::test]
    async fn deletions_reach_every_connection() {
        let state = AppState::new(MemoryStore::new(), 600);
        let (tx, mut rx) = unbounded();
        for id in ["a", "b"] {
            let addr = Listener(tx.clone()).start();
            state.sessions().insert(id.to_string(), addr.recipient());
        }

        assert_eq!(state.broadcast_deleted("g1"), 2);
        assert_eq!(rx.next().await.as_deref(), Some("g1"));
        assert_eq!(rx.next().await.as_deref(), Some("g1"));
    }
}
