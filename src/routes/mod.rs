use actix_web::http::StatusCode;
use actix_web::{web, HttpResponse, Responder, ResponseError};
use chrono::Utc;
use log::info;

use crate::config::HINT_DEPTH;
use crate::error::{PersistError, SessionError};
use crate::game::utils::side_name;
use crate::models::{AppState, ClientDefaults, CreateGameRequest, JoinGameRequest, JoinGameResponse, ServerMessage, SessionPatch};
use crate::sync::Evaluator;

impl ResponseError for PersistError {
    fn status_code(&self) -> StatusCode {
        match self {
            PersistError::NotFound(_) | PersistError::UnknownJoinCode(_) => StatusCode::NOT_FOUND,
            PersistError::NotDeletable(_) | PersistError::GameFull(_) | PersistError::BoardChanged { .. } => {
                StatusCode::CONFLICT
            }
            PersistError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ServerMessage::error(None, self.to_string()))
    }
}

impl ResponseError for SessionError {
    fn status_code(&self) -> StatusCode {
        match self {
            SessionError::Persist(e) => e.status_code(),
            _ => StatusCode::UNPROCESSABLE_ENTITY,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ServerMessage::error(None, self.to_string()))
    }
}

/// HTTP handler for the index page
pub async fn index() -> impl Responder {
    HttpResponse::Ok().body("Arena chess relay")
}

/// Session defaults the relay was started with.
pub async fn client_config(app_state: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(ClientDefaults::from(&app_state.client_defaults))
}

pub async fn create_game(
    app_state: web::Data<AppState>,
    body: Option<web::Json<CreateGameRequest>>,
) -> impl Responder {
    let time_limit = body
        .and_then(|body| body.time_limit)
        .unwrap_or(app_state.default_time_limit);
    let game = app_state.store.create_game(time_limit, Utc::now());
    HttpResponse::Created().json(game)
}

pub async fn available_games(app_state: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(app_state.store.available_games())
}

pub async fn join_game(
    app_state: web::Data<AppState>,
    body: web::Json<JoinGameRequest>,
) -> Result<HttpResponse, PersistError> {
    let seat = app_state.store.join(&body.join_code, Utc::now())?;
    Ok(HttpResponse::Ok().json(JoinGameResponse {
        color: side_name(seat.side).to_string(),
        game: seat.game,
        player_id: seat.player_id,
        is_creator: seat.is_creator,
    }))
}

pub async fn get_game(app_state: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse, PersistError> {
    let game = app_state.store.get(&path)?;
    Ok(HttpResponse::Ok().json(game))
}

pub async fn patch_game(
    app_state: web::Data<AppState>,
    path: web::Path<String>,
    patch: web::Json<SessionPatch>,
) -> Result<HttpResponse, PersistError> {
    let game = app_state.store.apply_patch(&path, &patch, Utc::now())?;
    info!("Stored revision {} of game {} over HTTP", game.revision, game.id);
    Ok(HttpResponse::Ok().json(game))
}

pub async fn delete_game(app_state: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse, PersistError> {
    app_state.store.delete_game(&path)?;
    app_state.broadcast_deleted(&path);
    Ok(HttpResponse::NoContent().finish())
}

pub async fn game_moves(app_state: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse, PersistError> {
    let moves = app_state.store.move_log(&path)?;
    Ok(HttpResponse::Ok().json(moves))
}

pub async fn game_evaluation(
    app_state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, SessionError> {
    let game = app_state.store.get(&path)?;
    let evaluation = app_state.evaluator.evaluate(&game.position, HINT_DEPTH).await?;
    Ok(HttpResponse::Ok().json(evaluation))
}

/// Configure the HTTP routes
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/ws").route(web::get().to(crate::websocket::ws_index)))
        .service(web::resource("/").route(web::get().to(index)))
        .service(web::resource("/config").route(web::get().to(client_config)))
        .service(web::resource("/games").route(web::post().to(create_game)))
        .service(web::resource("/games/available").route(web::get().to(available_games)))
        .service(web::resource("/games/join").route(web::post().to(join_game)))
        .service(
            web::resource("/games/{id}")
                .route(web::get().to(get_game))
                .route(web::patch().to(patch_game))
                .route(web::delete().to(delete_game)),
        )
        .service(web::resource("/games/{id}/moves").route(web::get().to(game_moves)))
        .service(web::resource("/games/{id}/evaluation").route(web::get().to(game_evaluation)));
}
