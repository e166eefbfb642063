mod learner;
mod pending;

pub use learner::{Learner, LearnerConfig, LearnerExit};
