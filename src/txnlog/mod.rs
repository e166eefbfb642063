mod in_memory;
mod log;

pub use in_memory::InMemoryTxnLog;
pub use log::CommittedWindow;
pub use log::Snapshot;
pub use log::TxnLog;
