use crate::cluster::ServerId;
use crate::election::{Ballot, Vote};
use crate::peer::{Epoch, PeerState, Zxid};
use crate::pipeline::{Request, TxnEnvelope};
use bytes::{Buf, BufMut, Bytes, BytesMut};

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("Frame of {0} bytes exceeds the maximum allowed size")]
    FrameTooLarge(usize),
    #[error("Unknown packet type code {0}")]
    UnknownPacketType(i32),
    #[error("Packet is truncated")]
    Truncated,
    #[error("Malformed packet field: {0}")]
    Malformed(&'static str),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Packet type codes as they appear on the wire.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PacketType {
    /// Client write forwarded from a learner to the leader.
    Request,
    Proposal,
    Ack,
    Commit,
    Ping,
    Revalidate,
    /// Flush barrier: a learner asks the leader to answer once everything
    /// proposed so far has committed.
    Sync,
    /// Committed transaction pushed to an observer.
    Inform,
    NewLeader,
    FollowerInfo,
    UpToDate,
    Diff,
    Trunc,
    Snap,
    ObserverInfo,
    LeaderInfo,
    AckEpoch,
    /// Leader election notification.
    Ballot,
}

impl PacketType {
    pub fn code(&self) -> i32 {
        match self {
            PacketType::Request => 1,
            PacketType::Proposal => 2,
            PacketType::Ack => 3,
            PacketType::Commit => 4,
            PacketType::Ping => 5,
            PacketType::Revalidate => 6,
            PacketType::Sync => 7,
            PacketType::Inform => 8,
            PacketType::NewLeader => 10,
            PacketType::FollowerInfo => 11,
            PacketType::UpToDate => 12,
            PacketType::Diff => 13,
            PacketType::Trunc => 14,
            PacketType::Snap => 15,
            PacketType::ObserverInfo => 16,
            PacketType::LeaderInfo => 17,
            PacketType::AckEpoch => 18,
            PacketType::Ballot => 20,
        }
    }

    pub fn from_code(code: i32) -> Result<PacketType, WireError> {
        match code {
            1 => Ok(PacketType::Request),
            2 => Ok(PacketType::Proposal),
            3 => Ok(PacketType::Ack),
            4 => Ok(PacketType::Commit),
            5 => Ok(PacketType::Ping),
            6 => Ok(PacketType::Revalidate),
            7 => Ok(PacketType::Sync),
            8 => Ok(PacketType::Inform),
            10 => Ok(PacketType::NewLeader),
            11 => Ok(PacketType::FollowerInfo),
            12 => Ok(PacketType::UpToDate),
            13 => Ok(PacketType::Diff),
            14 => Ok(PacketType::Trunc),
            15 => Ok(PacketType::Snap),
            16 => Ok(PacketType::ObserverInfo),
            17 => Ok(PacketType::LeaderInfo),
            18 => Ok(PacketType::AckEpoch),
            20 => Ok(PacketType::Ballot),
            other => Err(WireError::UnknownPacketType(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuthId {
    pub scheme: String,
    pub id: String,
}

/// Every message between peers, on both the quorum and the election links.
/// The meaning of `zxid` and the layout of `data` depend on `ptype`.
#[derive(Debug, Clone, PartialEq)]
pub struct QuorumPacket {
    pub ptype: PacketType,
    pub zxid: Zxid,
    pub data: Bytes,
    pub auth: Vec<AuthId>,
}

impl QuorumPacket {
    fn bare(ptype: PacketType, zxid: Zxid) -> QuorumPacket {
        QuorumPacket {
            ptype,
            zxid,
            data: Bytes::new(),
            auth: Vec::new(),
        }
    }

    pub fn request(request: &Request, auth: Vec<AuthId>) -> QuorumPacket {
        let mut data = BytesMut::new();
        data.put_u64(request.session_id);
        data.put_u32(request.cxid);
        data.put_i32(request.op);
        put_blob(&mut data, &request.payload);
        QuorumPacket {
            ptype: PacketType::Request,
            zxid: Zxid::ZERO,
            data: data.freeze(),
            auth,
        }
    }

    pub fn proposal(txn: &TxnEnvelope) -> QuorumPacket {
        QuorumPacket {
            ptype: PacketType::Proposal,
            zxid: txn.zxid,
            data: encode_txn(txn),
            auth: Vec::new(),
        }
    }

    pub fn ack(zxid: Zxid) -> QuorumPacket {
        QuorumPacket::bare(PacketType::Ack, zxid)
    }

    pub fn commit(zxid: Zxid) -> QuorumPacket {
        QuorumPacket::bare(PacketType::Commit, zxid)
    }

    pub fn inform(txn: &TxnEnvelope) -> QuorumPacket {
        QuorumPacket {
            ptype: PacketType::Inform,
            zxid: txn.zxid,
            data: encode_txn(txn),
            auth: Vec::new(),
        }
    }

    pub fn ping() -> QuorumPacket {
        QuorumPacket::bare(PacketType::Ping, Zxid::ZERO)
    }

    pub fn revalidate(session_id: u64, timeout_ms: i32) -> QuorumPacket {
        let mut data = BytesMut::with_capacity(12);
        data.put_u64(session_id);
        data.put_i32(timeout_ms);
        QuorumPacket {
            ptype: PacketType::Revalidate,
            zxid: Zxid::ZERO,
            data: data.freeze(),
            auth: Vec::new(),
        }
    }

    pub fn revalidate_reply(session_id: u64, valid: bool) -> QuorumPacket {
        let mut data = BytesMut::with_capacity(9);
        data.put_u64(session_id);
        data.put_u8(valid as u8);
        QuorumPacket {
            ptype: PacketType::Revalidate,
            zxid: Zxid::ZERO,
            data: data.freeze(),
            auth: Vec::new(),
        }
    }

    pub fn sync(session_id: u64, cxid: u32) -> QuorumPacket {
        let mut data = BytesMut::with_capacity(12);
        data.put_u64(session_id);
        data.put_u32(cxid);
        QuorumPacket {
            ptype: PacketType::Sync,
            zxid: Zxid::ZERO,
            data: data.freeze(),
            auth: Vec::new(),
        }
    }

    pub fn follower_info(sid: ServerId, accepted_epoch: Epoch, last_zxid: Zxid) -> QuorumPacket {
        QuorumPacket {
            ptype: PacketType::FollowerInfo,
            zxid: last_zxid,
            data: encode_learner_info(sid, accepted_epoch),
            auth: Vec::new(),
        }
    }

    pub fn observer_info(sid: ServerId, accepted_epoch: Epoch, last_zxid: Zxid) -> QuorumPacket {
        QuorumPacket {
            ptype: PacketType::ObserverInfo,
            zxid: last_zxid,
            data: encode_learner_info(sid, accepted_epoch),
            auth: Vec::new(),
        }
    }

    pub fn leader_info(epoch: Epoch) -> QuorumPacket {
        QuorumPacket::bare(PacketType::LeaderInfo, Zxid::epoch_base(epoch))
    }

    pub fn ack_epoch(current_epoch: Epoch, last_zxid: Zxid) -> QuorumPacket {
        let mut data = BytesMut::with_capacity(4);
        data.put_u32(current_epoch.as_u32());
        QuorumPacket {
            ptype: PacketType::AckEpoch,
            zxid: last_zxid,
            data: data.freeze(),
            auth: Vec::new(),
        }
    }

    pub fn new_leader(epoch: Epoch) -> QuorumPacket {
        QuorumPacket::bare(PacketType::NewLeader, Zxid::epoch_base(epoch))
    }

    pub fn up_to_date() -> QuorumPacket {
        QuorumPacket::bare(PacketType::UpToDate, Zxid::ZERO)
    }

    /// `last_zxid` is the point the diff starts from; the transactions follow
    /// as separate Proposal/Commit (or Inform) packets.
    pub fn diff(last_zxid: Zxid) -> QuorumPacket {
        QuorumPacket::bare(PacketType::Diff, last_zxid)
    }

    pub fn trunc(boundary: Zxid) -> QuorumPacket {
        QuorumPacket::bare(PacketType::Trunc, boundary)
    }

    pub fn snap(last_zxid: Zxid, data: Bytes) -> QuorumPacket {
        QuorumPacket {
            ptype: PacketType::Snap,
            zxid: last_zxid,
            data,
            auth: Vec::new(),
        }
    }

    pub fn ballot(ballot: &Ballot) -> QuorumPacket {
        let mut data = BytesMut::with_capacity(37);
        data.put_u8(state_code(ballot.sender_state));
        data.put_u64(ballot.from.as_u64());
        data.put_u64(ballot.round);
        data.put_u64(ballot.vote.leader.as_u64());
        data.put_u64(ballot.vote.zxid.as_u64());
        data.put_u32(ballot.vote.epoch.as_u32());
        QuorumPacket {
            ptype: PacketType::Ballot,
            zxid: ballot.vote.zxid,
            data: data.freeze(),
            auth: Vec::new(),
        }
    }

    pub fn parse_txn(&self) -> Result<TxnEnvelope, WireError> {
        decode_txn(&mut self.data.clone())
    }

    pub fn parse_request(&self) -> Result<Request, WireError> {
        let mut src = self.data.clone();
        let session_id = get_u64(&mut src)?;
        let cxid = get_u32(&mut src)?;
        let op = get_i32(&mut src)?;
        let payload = get_blob(&mut src)?;
        Ok(Request {
            session_id,
            cxid,
            op,
            payload,
        })
    }

    /// Sender id and accepted epoch from a FollowerInfo/ObserverInfo packet.
    pub fn parse_learner_info(&self) -> Result<(ServerId, Epoch), WireError> {
        let mut src = self.data.clone();
        let sid = ServerId::new(get_u64(&mut src)?);
        let accepted_epoch = Epoch::new(get_u32(&mut src)?);
        Ok((sid, accepted_epoch))
    }

    /// Current epoch from an AckEpoch packet; the packet's zxid field carries
    /// the sender's last logged zxid.
    pub fn parse_ack_epoch(&self) -> Result<(Epoch, Zxid), WireError> {
        let mut src = self.data.clone();
        let current_epoch = Epoch::new(get_u32(&mut src)?);
        Ok((current_epoch, self.zxid))
    }

    pub fn parse_revalidate(&self) -> Result<(u64, i32), WireError> {
        let mut src = self.data.clone();
        let session_id = get_u64(&mut src)?;
        let timeout_ms = get_i32(&mut src)?;
        Ok((session_id, timeout_ms))
    }

    pub fn parse_revalidate_reply(&self) -> Result<(u64, bool), WireError> {
        let mut src = self.data.clone();
        let session_id = get_u64(&mut src)?;
        let valid = get_u8(&mut src)? != 0;
        Ok((session_id, valid))
    }

    pub fn parse_sync(&self) -> Result<(u64, u32), WireError> {
        let mut src = self.data.clone();
        let session_id = get_u64(&mut src)?;
        let cxid = get_u32(&mut src)?;
        Ok((session_id, cxid))
    }

    pub fn parse_ballot(&self) -> Result<Ballot, WireError> {
        let mut src = self.data.clone();
        let sender_state = state_from(get_u8(&mut src)?)?;
        let from = ServerId::new(get_u64(&mut src)?);
        let round = get_u64(&mut src)?;
        let leader = ServerId::new(get_u64(&mut src)?);
        let zxid = Zxid::from_u64(get_u64(&mut src)?);
        let epoch = Epoch::new(get_u32(&mut src)?);
        Ok(Ballot {
            vote: Vote { leader, zxid, epoch },
            from,
            round,
            sender_state,
        })
    }

    pub(crate) fn encode_body(&self, dst: &mut BytesMut) {
        dst.put_i32(self.ptype.code());
        dst.put_u64(self.zxid.as_u64());
        put_blob(dst, &self.data);
        dst.put_u32(self.auth.len() as u32);
        for auth in &self.auth {
            put_string(dst, &auth.scheme);
            put_string(dst, &auth.id);
        }
    }

    pub(crate) fn decode_body(mut src: Bytes) -> Result<QuorumPacket, WireError> {
        let ptype = PacketType::from_code(get_i32(&mut src)?)?;
        let zxid = Zxid::from_u64(get_u64(&mut src)?);
        let data = get_blob(&mut src)?;
        let auth_count = get_u32(&mut src)?;
        let mut auth = Vec::new();
        for _ in 0..auth_count {
            let scheme = get_string(&mut src)?;
            let id = get_string(&mut src)?;
            auth.push(AuthId { scheme, id });
        }
        Ok(QuorumPacket { ptype, zxid, data, auth })
    }
}

pub fn encode_txn(txn: &TxnEnvelope) -> Bytes {
    let mut dst = BytesMut::with_capacity(28 + txn.payload.len());
    encode_txn_into(txn, &mut dst);
    dst.freeze()
}

pub fn encode_txn_into(txn: &TxnEnvelope, dst: &mut BytesMut) {
    dst.put_u64(txn.zxid.as_u64());
    dst.put_u64(txn.session_id);
    dst.put_u32(txn.cxid);
    dst.put_i32(txn.op);
    put_blob(dst, &txn.payload);
}

pub fn decode_txn(src: &mut Bytes) -> Result<TxnEnvelope, WireError> {
    let zxid = Zxid::from_u64(get_u64(src)?);
    let session_id = get_u64(src)?;
    let cxid = get_u32(src)?;
    let op = get_i32(src)?;
    let payload = get_blob(src)?;
    Ok(TxnEnvelope {
        zxid,
        session_id,
        cxid,
        op,
        payload,
    })
}

fn encode_learner_info(sid: ServerId, accepted_epoch: Epoch) -> Bytes {
    let mut data = BytesMut::with_capacity(12);
    data.put_u64(sid.as_u64());
    data.put_u32(accepted_epoch.as_u32());
    data.freeze()
}

fn state_code(state: PeerState) -> u8 {
    match state {
        PeerState::Looking => 0,
        PeerState::Leading => 1,
        PeerState::Following => 2,
        PeerState::Observing => 3,
    }
}

fn state_from(code: u8) -> Result<PeerState, WireError> {
    match code {
        0 => Ok(PeerState::Looking),
        1 => Ok(PeerState::Leading),
        2 => Ok(PeerState::Following),
        3 => Ok(PeerState::Observing),
        _ => Err(WireError::Malformed("peer state code")),
    }
}

fn get_u8(src: &mut Bytes) -> Result<u8, WireError> {
    if src.remaining() < 1 {
        return Err(WireError::Truncated);
    }
    Ok(src.get_u8())
}

fn get_i32(src: &mut Bytes) -> Result<i32, WireError> {
    if src.remaining() < 4 {
        return Err(WireError::Truncated);
    }
    Ok(src.get_i32())
}

fn get_u32(src: &mut Bytes) -> Result<u32, WireError> {
    if src.remaining() < 4 {
        return Err(WireError::Truncated);
    }
    Ok(src.get_u32())
}

fn get_u64(src: &mut Bytes) -> Result<u64, WireError> {
    if src.remaining() < 8 {
        return Err(WireError::Truncated);
    }
    Ok(src.get_u64())
}

/// Length-prefixed byte blob; -1 encodes an empty one.
fn put_blob(dst: &mut BytesMut, blob: &Bytes) {
    if blob.is_empty() {
        dst.put_i32(-1);
    } else {
        dst.put_i32(blob.len() as i32);
        dst.extend_from_slice(blob);
    }
}

fn get_blob(src: &mut Bytes) -> Result<Bytes, WireError> {
    let len = get_i32(src)?;
    if len < 0 {
        return Ok(Bytes::new());
    }
    let len = len as usize;
    if src.remaining() < len {
        return Err(WireError::Truncated);
    }
    Ok(src.split_to(len))
}

fn put_string(dst: &mut BytesMut, value: &str) {
    dst.put_u32(value.len() as u32);
    dst.extend_from_slice(value.as_bytes());
}

fn get_string(src: &mut Bytes) -> Result<String, WireError> {
    let len = get_u32(src)? as usize;
    if src.remaining() < len {
        return Err(WireError::Truncated);
    }
    let raw = src.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| WireError::Malformed("string is not utf-8"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_txn() -> TxnEnvelope {
        TxnEnvelope {
            zxid: Zxid::new(Epoch::new(2), 9),
            session_id: 0x0100_0000_0000_00aa,
            cxid: 42,
            op: 7,
            payload: Bytes::from_static(b"set /config 1"),
        }
    }

    fn roundtrip(packet: QuorumPacket) -> QuorumPacket {
        let mut buf = BytesMut::new();
        packet.encode_body(&mut buf);
        QuorumPacket::decode_body(buf.freeze()).unwrap()
    }

    #[test]
    fn proposal_roundtrip() {
        let txn = sample_txn();
        let decoded = roundtrip(QuorumPacket::proposal(&txn));
        assert_eq!(decoded.ptype, PacketType::Proposal);
        assert_eq!(decoded.zxid, txn.zxid);
        assert_eq!(decoded.parse_txn().unwrap(), txn);
    }

    #[test]
    fn txn_with_empty_payload_roundtrips() {
        let mut txn = sample_txn();
        txn.payload = Bytes::new();
        let decoded = roundtrip(QuorumPacket::inform(&txn));
        assert_eq!(decoded.parse_txn().unwrap(), txn);
    }

    #[test]
    fn request_carries_auth() {
        let request = Request {
            session_id: 9,
            cxid: 1,
            op: 3,
            payload: Bytes::from_static(b"x"),
        };
        let auth = vec![AuthId {
            scheme: "digest".to_string(),
            id: "user:hash".to_string(),
        }];
        let decoded = roundtrip(QuorumPacket::request(&request, auth.clone()));
        assert_eq!(decoded.parse_request().unwrap(), request);
        assert_eq!(decoded.auth, auth);
    }

    #[test]
    fn registration_packets_roundtrip() {
        let info = roundtrip(QuorumPacket::follower_info(
            ServerId::new(3),
            Epoch::new(4),
            Zxid::new(Epoch::new(4), 100),
        ));
        assert_eq!(info.ptype, PacketType::FollowerInfo);
        assert_eq!(
            info.parse_learner_info().unwrap(),
            (ServerId::new(3), Epoch::new(4))
        );
        assert_eq!(info.zxid, Zxid::new(Epoch::new(4), 100));

        let leader_info = roundtrip(QuorumPacket::leader_info(Epoch::new(5)));
        assert_eq!(leader_info.zxid, Zxid::epoch_base(Epoch::new(5)));

        let ack_epoch = roundtrip(QuorumPacket::ack_epoch(Epoch::new(4), Zxid::new(Epoch::new(4), 100)));
        assert_eq!(
            ack_epoch.parse_ack_epoch().unwrap(),
            (Epoch::new(4), Zxid::new(Epoch::new(4), 100))
        );
    }

    #[test]
    fn ballot_roundtrip() {
        let ballot = Ballot {
            vote: Vote {
                leader: ServerId::new(2),
                zxid: Zxid::new(Epoch::new(1), 17),
                epoch: Epoch::new(1),
            },
            from: ServerId::new(3),
            round: 6,
            sender_state: PeerState::Looking,
        };
        let decoded = roundtrip(QuorumPacket::ballot(&ballot));
        assert_eq!(decoded.parse_ballot().unwrap(), ballot);
    }

    #[test]
    fn session_packets_roundtrip() {
        let reval = roundtrip(QuorumPacket::revalidate(88, 5000));
        assert_eq!(reval.parse_revalidate().unwrap(), (88, 5000));

        let reply = roundtrip(QuorumPacket::revalidate_reply(88, true));
        assert_eq!(reply.parse_revalidate_reply().unwrap(), (88, true));

        let sync = roundtrip(QuorumPacket::sync(70, 3));
        assert_eq!(sync.parse_sync().unwrap(), (70, 3));
    }

    #[test]
    fn truncated_packet_is_rejected() {
        let mut buf = BytesMut::new();
        QuorumPacket::proposal(&sample_txn()).encode_body(&mut buf);
        let mut bytes = buf.freeze();
        let short = bytes.split_to(bytes.len() - 3);
        assert!(matches!(
            QuorumPacket::decode_body(short),
            Err(WireError::Truncated)
        ));
    }

    #[test]
    fn unknown_type_code_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_i32(99);
        buf.put_u64(0);
        buf.put_i32(-1);
        buf.put_u32(0);
        assert!(matches!(
            QuorumPacket::decode_body(buf.freeze()),
            Err(WireError::UnknownPacketType(99))
        ));
    }

    #[test]
    fn truncated_ballot_payload_is_rejected() {
        let ballot_packet = QuorumPacket {
            ptype: PacketType::Ballot,
            zxid: Zxid::ZERO,
            data: Bytes::from_static(&[0, 1, 2]),
            auth: Vec::new(),
        };
        assert!(matches!(ballot_packet.parse_ballot(), Err(WireError::Truncated)));
    }
}
