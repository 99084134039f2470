pub mod engine;
pub mod events;
pub mod milestones;

pub use engine::{merge_event, MergeOutcome};
pub use events::{parse_event, ArenaEnvelope, ArenaEvent, ItemKind};
pub use milestones::{Reward, MILESTONES};
