use actix::Message;
use serde::{Deserialize, Serialize};

use crate::config::SessionConfig;
use crate::models::game_state::{GameSession, SessionPatch};

/// Message sent from a peer to the relay over the websocket
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ClientMessage {
    pub message_type: String,
    pub game_id: Option<String>,
    pub patch: Option<SessionPatch>,
}

/// Message sent from the relay to a peer
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ServerMessage {
    pub message_type: String,
    pub game_id: Option<String>,
    pub game: Option<GameSession>,
    pub error: Option<String>,
}

impl ServerMessage {
    pub fn error(game_id: Option<String>, error: impl Into<String>) -> Self {
        ServerMessage {
            message_type: "error".to_string(),
            game_id,
            game: None,
            error: Some(error.into()),
        }
    }

    pub fn deleted(game_id: String) -> Self {
        ServerMessage {
            message_type: "game_deleted".to_string(),
            game_id: Some(game_id),
            ..ServerMessage::default()
        }
    }

    pub fn game(message_type: &str, game: GameSession) -> Self {
        ServerMessage {
            message_type: message_type.to_string(),
            game_id: Some(game.id.clone()),
            game: Some(game),
            error: None,
        }
    }
}

/// A record pushed by the change feed into a subscribed socket.
#[derive(Message)]
#[rtype(result = "()")]
pub struct RecordChanged(pub GameSession);

/// Sent to every connected socket when a game is deleted.
#[derive(Message, Debug, Clone)]
#[rtype(result = "()")]
pub struct GameDeleted(pub String);

/// Body of `GET /config`: client-side session defaults
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ClientDefaults {
    pub swap_animation_ms: u64,
    pub hint_depth: u8,
}

impl From<&SessionConfig> for ClientDefaults {
    fn from(config: &SessionConfig) -> Self {
        ClientDefaults {
            swap_animation_ms: u64::try_from(config.swap_animation.as_millis()).unwrap_or(u64::MAX),
            hint_depth: config.hint_depth,
        }
    }
}

/// Body of `POST /games`
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct CreateGameRequest {
    pub time_limit: Option<u32>,
}

/// Body of `POST /games/join`
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JoinGameRequest {
    pub join_code: String,
}

/// Seat handed out by a successful join
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JoinGameResponse {
    pub game: GameSession,
    pub color: String,
    pub player_id: String,
    pub is_creator: bool,
}

/// Lobby entry returned by `GET /games/available`
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AvailableGame {
    pub id: String,
    pub join_code: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub time_limit: u32,
}
