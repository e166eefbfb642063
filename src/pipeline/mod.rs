mod processor;
mod request;

pub use processor::CommitInput;
pub use processor::CommitMatcher;
pub use processor::PendingWrite;
pub use request::ClientSubmission;
pub use request::Request;
pub use request::TxnEnvelope;
pub use request::WriteError;
