mod api;
mod cluster;
mod election;
mod leader;
mod learner;
mod peer;
mod pipeline;
mod txnlog;
mod wire;

pub use api::decode_snapshot;
pub use api::try_create_peer;
pub use api::RevalidateSessionInput;
pub use api::RevalidateSessionOutput;
pub use api::SnapshotDecodeError;
pub use api::SubmitWriteInput;
pub use api::SubmitWriteOutput;
pub use api::ZabCommitEvent;
pub use api::ZabCommitStream;
pub use api::ZabCommittedTxn;
pub use api::ZabEvent;
pub use api::ZabEventListener;
pub use api::ZabMemberInfo;
pub use api::ZabMemberRole;
pub use api::ZabOptions;
pub use api::ZabPeer;
pub use api::ZabPeerConfig;
pub use api::ZabPeerCreationError;
pub use api::ZabPeerState;
pub use api::ZabRequestError;
pub use api::ZabRoleEvent;
pub use api::ZabWriteHandle;

// Id types that appear in the API surface.
pub use peer::Epoch;
pub use peer::ShutdownHandle;
pub use peer::Zxid;
