use actix::*;
use actix_web::{web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use log::{info, warn};
use uuid::Uuid;

use crate::models::*;

/// WebSocket relay between a peer and the session store
pub struct RelaySocket {
    pub id: String,
    pub app_state: web::Data<AppState>,
    pub game_id: String,
}

impl Actor for RelaySocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        // Register the actor with the application state
        let total_sessions = {
            let mut sessions = self.app_state.sessions();
            sessions.insert(self.id.clone(), ctx.address().recipient());
            sessions.len()
        };
        info!("WebSocket connection started: {}", self.id);
        info!("Total active sessions: {}", total_sessions);
    }

    fn stopping(&mut self, _: &mut Self::Context) -> Running {
        let total_sessions = {
            let mut sessions = self.app_state.sessions();
            sessions.remove(&self.id);
            sessions.len()
        };
        if !self.game_id.is_empty() {
            info!("Connection {} left game {}", self.id, self.game_id);
        }
        info!("WebSocket connection closed: {}", self.id);
        info!("Total active sessions: {}", total_sessions);

        Running::Stop
    }
}

impl Handler<RecordChanged> for RelaySocket {
    type Result = ();

    fn handle(&mut self, msg: RecordChanged, ctx: &mut Self::Context) {
        info!("Forwarding revision {} of game {} to {}", msg.0.revision, msg.0.id, self.id);
        self.send(&ServerMessage::game("game_updated", msg.0), ctx);
    }
}

impl Handler<GameDeleted> for RelaySocket {
    type Result = ();

    fn handle(&mut self, msg: GameDeleted, ctx: &mut Self::Context) {
        if self.game_id != msg.0 {
            return;
        }
        info!("Game {} was deleted, dropping the subscription of {}", msg.0, self.id);
        self.game_id.clear();
        self.send(&ServerMessage::deleted(msg.0), ctx);
    }
}

// WebSocket message handler
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RelaySocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => {
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Text(text)) => {
                info!("Received text message: {}", text);
                match serde_json::from_str::<ClientMessage>(text.as_ref()) {
                    Ok(client_msg) => self.handle_message(client_msg, ctx),
                    Err(e) => {
                        warn!("Error parsing client message: {}", e);
                        self.send(&ServerMessage::error(None, format!("Invalid message format: {}", e)), ctx);
                    }
                }
            }
            Ok(ws::Message::Binary(_)) => {
                warn!("Binary messages are not supported");
                self.send(&ServerMessage::error(None, "Binary messages are not supported"), ctx);
            }
            Ok(ws::Message::Close(reason)) => {
                info!("Connection closed: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            _ => {
                ctx.stop();
            }
        }
    }
}

impl RelaySocket {
    pub fn new(app_state: web::Data<AppState>) -> Self {
        RelaySocket {
            id: Uuid::new_v4().to_string(),
            app_state,
            game_id: String::new(),
        }
    }

    pub fn send(&self, message: &ServerMessage, ctx: &mut ws::WebsocketContext<Self>) {
        match serde_json::to_string(message) {
            Ok(text) => ctx.text(text),
            Err(e) => {
                warn!("Error serializing message: {}", e);
                ctx.text("{\"message_type\": \"error\", \"error\": \"Internal server error\"}");
            }
        }
    }

    pub fn handle_message(&mut self, msg: ClientMessage, ctx: &mut ws::WebsocketContext<Self>) {
        match msg.message_type.as_str() {
            "subscribe" => self.handle_subscribe(msg, ctx),
            "persist" => self.handle_persist(msg, ctx),
            "fetch" => self.handle_fetch(msg, ctx),
            _ => {
                warn!("Unknown message type: {}", msg.message_type);
                let game_id = msg.game_id.clone();
                self.send(
                    &ServerMessage::error(game_id, format!("Unknown message type: {}", msg.message_type)),
                    ctx,
                );
            }
        }
    }
}

/// WebSocket connection handler
pub async fn ws_index(req: HttpRequest, stream: web::Payload, app_state: web::Data<AppState>) -> Result<HttpResponse, Error> {
    info!("New WebSocket connection request");
    let socket = RelaySocket::new(app_state.clone());
    info!("Generated connection ID: {}", socket.id);

    let resp = ws::start(socket, &req, stream)?;
    info!("WebSocket connection started");

    Ok(resp)
}
