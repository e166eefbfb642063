//! This mod holds the library's client-facing API.
mod commit_stream;
mod event_bus;
mod options;
mod types;
mod wiring;
mod write_handle;

pub use commit_stream::decode_snapshot;
pub use commit_stream::SnapshotDecodeError;
pub use commit_stream::ZabCommitEvent;
pub use commit_stream::ZabCommitStream;
pub use commit_stream::ZabCommittedTxn;
pub use event_bus::ZabEvent;
pub use event_bus::ZabEventListener;
pub use event_bus::ZabPeerState;
pub use event_bus::ZabRoleEvent;
pub use options::ZabOptions;
pub use types::ZabMemberInfo;
pub use types::ZabMemberRole;
pub use wiring::try_create_peer;
pub use wiring::ZabPeer;
pub use wiring::ZabPeerConfig;
pub use wiring::ZabPeerCreationError;
pub use write_handle::RevalidateSessionInput;
pub use write_handle::RevalidateSessionOutput;
pub use write_handle::SubmitWriteInput;
pub use write_handle::SubmitWriteOutput;
pub use write_handle::ZabRequestError;
pub use write_handle::ZabWriteHandle;

// So the commit pipeline can publish into the stream.
pub(crate) use commit_stream::create_commit_stream;
pub(crate) use commit_stream::CommitStreamPublisher;
