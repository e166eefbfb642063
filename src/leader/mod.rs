mod leader;
mod learner_handler;
mod sync_strategy;

pub use leader::{Leader, LeaderConfig, LeaderEvent, LeaderExit};
