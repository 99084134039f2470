pub mod config;
pub mod error;
pub mod game;
pub mod models;
pub mod perks;
pub mod routes;
pub mod sync;
pub mod websocket;

pub use error::{PersistError, SessionError, SessionResult};
