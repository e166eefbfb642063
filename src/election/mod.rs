mod look_for_leader;
mod messenger;
mod tally;
mod vote;

pub use look_for_leader::ElectionConfig;
pub use look_for_leader::ElectionOutcome;
pub use look_for_leader::LookForLeader;
pub use messenger::ElectionMessenger;
pub use vote::Ballot;
pub use vote::Vote;
