use crate::wire::packet::{QuorumPacket, WireError};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Generous enough for a snapshot in one frame.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Frames `QuorumPacket`s with a big-endian u32 length prefix. One codec
/// instance per connection, used through `tokio_util::codec::Framed`.
pub struct PacketCodec {
    max_frame_len: usize,
}

impl PacketCodec {
    pub fn new() -> Self {
        PacketCodec::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        PacketCodec { max_frame_len }
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        PacketCodec::new()
    }
}

impl Decoder for PacketCodec {
    type Item = QuorumPacket;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<QuorumPacket>, WireError> {
        if src.len() < 4 {
            return Ok(None);
        }
        let frame_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if frame_len > self.max_frame_len {
            return Err(WireError::FrameTooLarge(frame_len));
        }
        if src.len() < 4 + frame_len {
            src.reserve(4 + frame_len - src.len());
            return Ok(None);
        }
        src.advance(4);
        let frame = src.split_to(frame_len).freeze();
        QuorumPacket::decode_body(frame).map(Some)
    }
}

impl Encoder<QuorumPacket> for PacketCodec {
    type Error = WireError;

    fn encode(&mut self, packet: QuorumPacket, dst: &mut BytesMut) -> Result<(), WireError> {
        let mut body = BytesMut::with_capacity(32 + packet.data.len());
        packet.encode_body(&mut body);
        if body.len() > self.max_frame_len {
            return Err(WireError::FrameTooLarge(body.len()));
        }
        dst.reserve(4 + body.len());
        dst.put_u32(body.len() as u32);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{Epoch, Zxid};

    fn encode(codec: &mut PacketCodec, packet: QuorumPacket) -> BytesMut {
        let mut buf = BytesMut::new();
        codec.encode(packet, &mut buf).unwrap();
        buf
    }

    #[test]
    fn encode_decode_roundtrip() {
        let mut codec = PacketCodec::new();
        let packet = QuorumPacket::commit(Zxid::new(Epoch::new(1), 4));
        let mut buf = encode(&mut codec, packet.clone());

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, packet);
        assert!(buf.is_empty());
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut codec = PacketCodec::new();
        let full = encode(&mut codec, QuorumPacket::ping());

        let mut partial = BytesMut::new();
        partial.extend_from_slice(&full[..3]);
        assert_eq!(codec.decode(&mut partial).unwrap(), None);

        partial.extend_from_slice(&full[3..full.len() - 1]);
        assert_eq!(codec.decode(&mut partial).unwrap(), None);

        partial.extend_from_slice(&full[full.len() - 1..]);
        assert_eq!(codec.decode(&mut partial).unwrap(), Some(QuorumPacket::ping()));
    }

    #[test]
    fn multiple_frames_decode_in_order() {
        let mut codec = PacketCodec::new();
        let mut buf = encode(&mut codec, QuorumPacket::ack(Zxid::new(Epoch::new(1), 1)));
        buf.extend_from_slice(&encode(&mut codec, QuorumPacket::ack(Zxid::new(Epoch::new(1), 2))));

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.zxid, Zxid::new(Epoch::new(1), 1));
        assert_eq!(second.zxid, Zxid::new(Epoch::new(1), 2));
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut small = PacketCodec::with_max_frame_len(8);
        let mut buf = BytesMut::new();
        buf.put_u32(1024);
        buf.extend_from_slice(&[0u8; 16]);
        assert!(matches!(small.decode(&mut buf), Err(WireError::FrameTooLarge(1024))));
    }

    #[test]
    fn oversized_packet_refuses_to_encode() {
        let mut small = PacketCodec::with_max_frame_len(8);
        let packet = QuorumPacket::snap(Zxid::ZERO, bytes::Bytes::from(vec![0u8; 64]));
        let mut buf = BytesMut::new();
        assert!(matches!(
            small.encode(packet, &mut buf),
            Err(WireError::FrameTooLarge(_))
        ));
    }
}
