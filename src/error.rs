use thiserror::Error;

use crate::models::Side;

/// Failures at the storage / change-feed seam.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistError {
    #[error("game {0} not found")]
    NotFound(String),
    #[error("game {0} can no longer be deleted")]
    NotDeletable(String),
    #[error("no game with join code {0}")]
    UnknownJoinCode(String),
    #[error("game {0} is full")]
    GameFull(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("board of game {game_id} changed at revision {revision} before the write was stored")]
    BoardChanged { game_id: String, revision: u64 },
}

/// Everything a single session operation can be rejected with.
///
/// None of these are fatal: the caller rejects the one operation and keeps
/// the session alive.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error("illegal move: {0}")]
    IllegalMove(String),
    #[error("a promotion piece must be chosen for {from}{to}")]
    PromotionRequired { from: String, to: String },
    #[error("not enough history to undo {requested} ply (have {available} snapshots)")]
    InsufficientHistory { requested: usize, available: usize },
    #[error("persistence failed: {0}")]
    Persist(#[from] PersistError),
    #[error("evaluation for {requested_for} is stale")]
    StaleEvaluation { requested_for: String },
    #[error("local and remote positions diverged (local {local}, remote {remote})")]
    DivergenceDetected { local: String, remote: String },
    #[error("malformed arena payload: {0}")]
    MalformedRemotePayload(String),
    #[error("it is not {0:?}'s turn")]
    NotYourTurn(Side),
    #[error("the game is already finished")]
    GameFinished,
    #[error("the game has not started")]
    GameNotStarted,
    #[error("a piece swap must be completed before moving")]
    SwapPending,
    #[error("no piece swap is available")]
    NoSwapAvailable,
    #[error("invalid piece swap: {0}")]
    InvalidSwap(String),
    #[error("{0:?} is frozen")]
    Frozen(Side),
    #[error("{0:?} has no shields left")]
    NoShields(Side),
    #[error("another local operation is still in flight")]
    MutationInFlight,
    #[error("{0:?} has no hint token")]
    NoHintToken(Side),
    #[error("no draw offer to answer")]
    NoDrawOffer,
    #[error("invalid position: {0}")]
    InvalidPosition(String),
}

pub type SessionResult<T> = Result<T, SessionError>;
