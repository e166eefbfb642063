use std::net::Ipv4Addr;

// Three peers of a replicated key-value store running in a single process.
// A real deployment runs one peer per host with the same member list.

#[tokio::main]
async fn main() {
    let members = cluster_members(28000);

    let mut stores = Vec::with_capacity(members.len());
    for id in 1..=3 {
        let store = kv_impl::ReplicatedKv::setup(id, members.clone())
            .await
            .expect("Peer creation failed");
        stores.push(store);
    }

    // Writes are accepted at any peer; this one may or may not be the leader.
    stores[0].set("color", "teal").await.expect("Write failed");
    stores[0].set("animal", "otter").await.expect("Write failed");
    let last = stores[0].set("color", "orange").await.expect("Write failed");

    for store in stores.iter_mut() {
        store.apply_until(last).await;
        assert_eq!(store.get("color"), Some("orange"));
        assert_eq!(store.get("animal"), Some("otter"));
    }

    println!(
        "All three peers agree: color={:?}, animal={:?}",
        stores[0].get("color"),
        stores[0].get("animal"),
    );
}

fn cluster_members(port_base: u16) -> Vec<zab::ZabMemberInfo> {
    (1..=3)
        .map(|id| zab::ZabMemberInfo {
            server_id: id,
            role: zab::ZabMemberRole::Participant,
            ip_addr: Ipv4Addr::from([127, 0, 0, 1]),
            quorum_port: port_base + id as u16,
            election_port: port_base + 100 + id as u16,
        })
        .collect()
}

mod kv_impl {
    use bytes::{Buf, BufMut, Bytes, BytesMut};
    use slog::Drain;
    use std::collections::HashMap;
    use std::error::Error;

    const OP_SET: i32 = 1;

    pub struct ReplicatedKv {
        peer: zab::ZabPeer,
        state: HashMap<String, String>,
        applied: zab::Zxid,
    }

    impl ReplicatedKv {
        pub async fn setup(id: u64, cluster_members: Vec<zab::ZabMemberInfo>) -> Result<Self, Box<dyn Error>> {
            let peer = zab::try_create_peer(zab::ZabPeerConfig {
                my_server_id: id,
                cluster_members,
                info_logger: stdout_logger(id),
                options: zab::ZabOptions::default(),
            })
            .await?;

            Ok(ReplicatedKv {
                peer,
                state: HashMap::new(),
                applied: zab::Zxid::ZERO,
            })
        }

        /// Submits a set and resolves once it has committed, returning the
        /// zxid it was stamped with. Does not apply it locally; that happens
        /// through the commit stream like everyone else's writes.
        pub async fn set(&mut self, key: &str, value: &str) -> Result<zab::Zxid, Box<dyn Error>> {
            let output = self
                .peer
                .write_handle
                .submit_write(zab::SubmitWriteInput {
                    op: OP_SET,
                    data: encode_kv(key, value),
                })
                .await?;
            Ok(output.zxid)
        }

        /// Applies the commit stream up to and including `zxid`.
        pub async fn apply_until(&mut self, zxid: zab::Zxid) {
            while self.applied < zxid {
                let event = self.peer.commit_stream.next().await.expect("Commit stream closed");
                match event {
                    zab::ZabCommitEvent::Committed(txn) => {
                        self.applied = txn.zxid;
                        self.apply(txn);
                    }
                    zab::ZabCommitEvent::SnapshotInstalled { last_zxid, data } => {
                        // This peer was too far behind; rebuild from scratch.
                        self.state.clear();
                        for txn in zab::decode_snapshot(&data).expect("Corrupt snapshot") {
                            self.apply(txn);
                        }
                        self.applied = last_zxid;
                    }
                }
            }
        }

        pub fn get(&self, key: &str) -> Option<&str> {
            self.state.get(key).map(|value| value.as_str())
        }

        fn apply(&mut self, txn: zab::ZabCommittedTxn) {
            if txn.op == OP_SET {
                let (key, value) = decode_kv(txn.data);
                self.state.insert(key, value);
            }
        }
    }

    /// encode the key/value pair in the following way:
    /// | 2 bytes | key_len bytes | rest  |
    /// | key_len |      key      | value |
    fn encode_kv(key: &str, value: &str) -> Bytes {
        let mut bytes = BytesMut::with_capacity(2 + key.len() + value.len());
        bytes.put_u16(key.len() as u16);
        bytes.put_slice(key.as_bytes());
        bytes.put_slice(value.as_bytes());

        bytes.freeze()
    }

    fn decode_kv(mut bytes: Bytes) -> (String, String) {
        let key_len = bytes.get_u16() as usize;
        let key = String::from_utf8_lossy(&bytes.split_to(key_len)).into_owned();
        let value = String::from_utf8_lossy(&bytes).into_owned();

        (key, value)
    }

    fn stdout_logger(server_id: u64) -> slog::Logger {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_async::Async::new(drain).build().fuse();

        slog::Logger::root(drain, slog::o!("ServerId" => server_id))
    }
}
