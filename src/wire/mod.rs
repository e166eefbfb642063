mod codec;
mod packet;

pub use codec::PacketCodec;
pub use packet::decode_txn;
pub use packet::encode_txn_into;
pub use packet::PacketType;
pub use packet::QuorumPacket;
pub use packet::WireError;
