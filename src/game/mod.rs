pub mod board_machine;
pub mod clock;
pub mod notation;
pub mod position;
pub mod rules;
pub mod snapshot_store;
pub mod utils;

pub use board_machine::{BoardStateMachine, Committed, MoveStep, Selection, TurnOverride};
pub use clock::ClockView;
pub use position::Position;
pub use rules::{GameOverReason, MoveOutcome, MoveRequest, Rules, StandardRules};
pub use snapshot_store::{Snapshot, SnapshotMirror, SnapshotStore};
