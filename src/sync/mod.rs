pub mod client;
pub mod driver;
pub mod evaluation;
pub mod store;
pub mod write;

pub use client::{AckOutcome, ClientSession, InFlight, MoveAttempt, RemoteChange, RemoteOutcome, SyncPhase};
pub use driver::SessionDriver;
pub use evaluation::{Evaluation, EvaluationTracker, Evaluator, MaterialEvaluator};
pub use store::{MemoryStore, Seat, SessionStore};
pub use write::{PendingWrite, PerkOp, RecordOp};
