use actix::AsyncContext;
use actix_web_actors::ws;
use chrono::Utc;
use futures::StreamExt;
use log::{info, warn};

use crate::models::{ClientMessage, RecordChanged, ServerMessage};
use crate::websocket::handler::RelaySocket;

impl RelaySocket {
    /// Resolves the game a message is about, falling back to the subscribed one.
    fn target_game(&self, msg: &ClientMessage) -> Option<String> {
        msg.game_id
            .clone()
            .or_else(|| (!self.game_id.is_empty()).then(|| self.game_id.clone()))
    }

    pub fn handle_subscribe(&mut self, msg: ClientMessage, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(game_id) = msg.game_id else {
            self.send(&ServerMessage::error(None, "subscribe requires a game_id"), ctx);
            return;
        };
        if !self.game_id.is_empty() {
            warn!("Connection {} is already subscribed to {}", self.id, self.game_id);
            self.send(
                &ServerMessage::error(Some(game_id), format!("Already subscribed to {}", self.game_id)),
                ctx,
            );
            return;
        }

        // Open the feed before reading so no write is missed in between
        let feed = self.app_state.store.open_feed(&game_id);
        match self.app_state.store.get(&game_id) {
            Ok(game) => {
                info!("Connection {} subscribed to game {}", self.id, game_id);
                self.game_id = game_id;
                ctx.add_message_stream(feed.map(RecordChanged));
                self.send(&ServerMessage::game("subscribed", game), ctx);
            }
            Err(e) => {
                warn!("Cannot subscribe {} to {}: {}", self.id, game_id, e);
                self.send(&ServerMessage::error(Some(game_id), e.to_string()), ctx);
            }
        }
    }

    pub fn handle_persist(&mut self, msg: ClientMessage, ctx: &mut ws::WebsocketContext<Self>) {
        let game_id = self.target_game(&msg);
        let (Some(game_id), Some(patch)) = (game_id, msg.patch) else {
            self.send(&ServerMessage::error(msg.game_id, "persist requires a game_id and a patch"), ctx);
            return;
        };
        match self.app_state.store.apply_patch(&game_id, &patch, Utc::now()) {
            Ok(game) => {
                info!("Stored revision {} of game {} from {}", game.revision, game_id, self.id);
                self.send(&ServerMessage::game("persisted", game), ctx);
            }
            Err(e) => {
                warn!("Persist from {} failed: {}", self.id, e);
                self.send(&ServerMessage::error(Some(game_id), e.to_string()), ctx);
            }
        }
    }

    pub fn handle_fetch(&mut self, msg: ClientMessage, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(game_id) = self.target_game(&msg) else {
            self.send(&ServerMessage::error(None, "fetch requires a game_id"), ctx);
            return;
        };
        match self.app_state.store.get(&game_id) {
            Ok(game) => self.send(&ServerMessage::game("game_state", game), ctx),
            Err(e) => self.send(&ServerMessage::error(Some(game_id), e.to_string()), ctx),
        }
    }
}
