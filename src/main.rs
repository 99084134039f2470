use actix_web::{web, App, HttpServer};
use clap::Parser;
use log::info;

use arena_chess::config::RelayConfig;
use arena_chess::models::AppState;
use arena_chess::routes::configure_routes;
use arena_chess::sync::MemoryStore;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = RelayConfig::parse();
    let (host, port) = config.bind_address();
    info!("Starting arena relay at http://{}:{}", host, port);
    let defaults = config.session_config();
    info!(
        "Client defaults: swap animation {:?}, hint depth {}",
        defaults.swap_animation, defaults.hint_depth
    );

    // Create shared application state
    let app_state = web::Data::new(
        AppState::new(MemoryStore::new(), config.default_time_limit).with_client_defaults(defaults),
    );

    HttpServer::new(move || App::new().app_data(app_state.clone()).configure(configure_routes))
        .bind((host, port))?
        .run()
        .await
}
