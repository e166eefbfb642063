mod local_state;
mod peer;
mod shutdown;
mod status;
mod zxid;

pub use local_state::{InMemoryPeerState, PersistentPeerState};
pub use peer::{PeerConfig, QuorumPeer};
pub use shutdown::{shutdown_channel, ShutdownHandle, ShutdownSignal};
pub use status::{role_channel, PeerState, RoleListener, RoleNotifier, RoleSnapshot, ZxidCell};
pub use zxid::{Epoch, Zxid};
