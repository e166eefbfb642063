use bytes::Bytes;
use chrono::Utc;
use slog::Drain;
use std::collections::HashMap;
use std::error::Error;
use std::fs::OpenOptions;
use std::net::Ipv4Addr;
use tokio::time::{Duration, Instant};

// Each test gets its own port base so they can run in parallel. Member `id`
// listens on `port_base + id` (quorum) and `port_base + 100 + id` (election).

#[tokio::test]
async fn three_peers_elect_a_leader_and_commit_in_order() -> Result<(), Box<dyn Error>> {
    let members = participants(25000, 3);
    let mut peers = HashMap::with_capacity(members.len());
    for id in 1..=3 {
        peers.insert(id, zab::try_create_peer(config(id, members.clone())).await?);
    }

    let leader_id = discover_leader_id(&mut peers, Duration::from_secs(10)).await;
    wait_until_settled(&mut peers, Duration::from_secs(10)).await;
    println!("Leader is {}", leader_id);

    // First write, submitted at the leader.
    let data = Bytes::from_static(b"hello world");
    let first = peers
        .get(&leader_id)
        .expect("Leader missing!")
        .write_handle
        .submit_write(zab::SubmitWriteInput { op: 1, data: data.clone() })
        .await?;

    for (_, peer) in peers.iter_mut() {
        let committed = unwrap_committed(next_commit(&mut peer.commit_stream).await);
        assert_eq!(committed.zxid, first.zxid);
        assert_eq!(committed.data, data);
    }

    // Second write must land strictly after the first, everywhere.
    let data = Bytes::from_static(b"it's me again");
    let second = peers
        .get(&leader_id)
        .expect("Leader missing!")
        .write_handle
        .submit_write(zab::SubmitWriteInput { op: 1, data: data.clone() })
        .await?;
    assert!(second.zxid > first.zxid);

    for (_, peer) in peers.iter_mut() {
        let committed = unwrap_committed(next_commit(&mut peer.commit_stream).await);
        assert_eq!(committed.zxid, second.zxid);
        assert_eq!(committed.data, data);
    }

    Ok(())
}

#[tokio::test]
async fn writes_forwarded_from_a_follower_commit_everywhere() -> Result<(), Box<dyn Error>> {
    let members = participants(25200, 3);
    let mut peers = HashMap::with_capacity(members.len());
    for id in 1..=3 {
        peers.insert(id, zab::try_create_peer(config(id, members.clone())).await?);
    }

    let leader_id = discover_leader_id(&mut peers, Duration::from_secs(10)).await;
    wait_until_settled(&mut peers, Duration::from_secs(10)).await;
    let follower_id = (1..=3).find(|id| *id != leader_id).unwrap();
    println!("Leader is {}, submitting via follower {}", leader_id, follower_id);

    let follower_session = peers.get(&follower_id).unwrap().write_handle.session_id();
    let data = Bytes::from_static(b"via follower");
    let output = peers
        .get(&follower_id)
        .unwrap()
        .write_handle
        .submit_write(zab::SubmitWriteInput { op: 2, data: data.clone() })
        .await?;

    for (_, peer) in peers.iter_mut() {
        let committed = unwrap_committed(next_commit(&mut peer.commit_stream).await);
        assert_eq!(committed.zxid, output.zxid);
        assert_eq!(committed.session_id, follower_session);
        assert_eq!(committed.data, data);
    }

    Ok(())
}

#[tokio::test]
async fn observer_learns_commits_without_voting() -> Result<(), Box<dyn Error>> {
    let mut members = participants(25400, 3);
    members.push(observer_info(25400, 4));
    let mut peers = HashMap::with_capacity(members.len());
    for id in 1..=4 {
        peers.insert(id, zab::try_create_peer(config(id, members.clone())).await?);
    }

    discover_leader_id(&mut peers, Duration::from_secs(10)).await;

    // Wait for everyone, the observer included, to finish syncing before
    // submitting, so the write reaches the observer as a live INFORM rather
    // than inside the initial catch-up.
    wait_until_settled(&mut peers, Duration::from_secs(10)).await;
    let observer_role = peers.get(&4).unwrap().event_listener.current_role();
    assert_eq!(observer_role.state, zab::ZabPeerState::Observing);
    println!("Observer is following leader {:?}", observer_role.leader_id);

    // Writes submitted at the observer are forwarded like any learner's.
    let data = Bytes::from_static(b"seen by observer");
    let output = peers
        .get(&4)
        .unwrap()
        .write_handle
        .submit_write(zab::SubmitWriteInput { op: 1, data: data.clone() })
        .await?;

    for (_, peer) in peers.iter_mut() {
        let committed = unwrap_committed(next_commit(&mut peer.commit_stream).await);
        assert_eq!(committed.zxid, output.zxid);
        assert_eq!(committed.data, data);
    }

    Ok(())
}

#[tokio::test]
async fn late_joining_peer_is_brought_up_to_date() -> Result<(), Box<dyn Error>> {
    let members = participants(25600, 3);
    let mut peers = HashMap::with_capacity(members.len());
    for id in 1..=2 {
        peers.insert(id, zab::try_create_peer(config(id, members.clone())).await?);
    }

    // Two of three is a quorum; the cluster runs without peer 3.
    let leader_id = discover_leader_id(&mut peers, Duration::from_secs(10)).await;
    let data = Bytes::from_static(b"before the join");
    let first = peers
        .get(&leader_id)
        .unwrap()
        .write_handle
        .submit_write(zab::SubmitWriteInput { op: 1, data: data.clone() })
        .await?;
    for (_, peer) in peers.iter_mut() {
        let committed = unwrap_committed(next_commit(&mut peer.commit_stream).await);
        assert_eq!(committed.zxid, first.zxid);
    }

    // Now start peer 3 and let it catch up.
    let mut late_peer = zab::try_create_peer(config(3, members.clone())).await?;
    wait_for_role(&mut late_peer.event_listener, Duration::from_secs(15), |role| {
        role.state == zab::ZabPeerState::Following
    })
    .await;

    // An empty peer is behind the leader's retained window, so it is brought
    // up by snapshot rather than by replaying the diff.
    match next_commit(&mut late_peer.commit_stream).await {
        zab::ZabCommitEvent::SnapshotInstalled { last_zxid, data: blob } => {
            assert_eq!(last_zxid, first.zxid);
            let folded = zab::decode_snapshot(&blob)?;
            assert_eq!(folded.len(), 1);
            assert_eq!(folded[0].zxid, first.zxid);
            assert_eq!(folded[0].data, Bytes::from_static(b"before the join"));
        }
        other => panic!("Expected a snapshot install, got: {:?}", other),
    }

    // Live traffic resumes as ordinary commits on all three.
    let data = Bytes::from_static(b"after the join");
    let second = peers
        .get(&leader_id)
        .unwrap()
        .write_handle
        .submit_write(zab::SubmitWriteInput { op: 1, data: data.clone() })
        .await?;
    for (_, peer) in peers.iter_mut() {
        let committed = unwrap_committed(next_commit(&mut peer.commit_stream).await);
        assert_eq!(committed.zxid, second.zxid);
    }
    let committed = unwrap_committed(next_commit(&mut late_peer.commit_stream).await);
    assert_eq!(committed.zxid, second.zxid);
    assert_eq!(committed.data, data);

    Ok(())
}

#[tokio::test]
async fn surviving_peers_reelect_after_leader_shutdown() -> Result<(), Box<dyn Error>> {
    let members = participants(25800, 3);
    let mut peers = HashMap::with_capacity(members.len());
    for id in 1..=3 {
        peers.insert(id, zab::try_create_peer(config(id, members.clone())).await?);
    }

    let leader_id = discover_leader_id(&mut peers, Duration::from_secs(10)).await;
    let leader = peers.remove(&leader_id).expect("Leader missing!");
    let first_epoch = leader.event_listener.current_role().epoch;
    println!("Shutting down leader {} (epoch {})", leader_id, first_epoch);
    leader.shutdown_handle.shutdown();
    drop(leader);

    // The survivors notice the silence and re-elect under a higher epoch.
    let new_leader_id = {
        let (any_id, survivor) = peers.iter_mut().next().unwrap();
        let role = wait_for_role(&mut survivor.event_listener, Duration::from_secs(15), |role| {
            role.epoch > first_epoch
                && (role.state == zab::ZabPeerState::Leading || role.state == zab::ZabPeerState::Following)
        })
        .await;
        match role.state {
            zab::ZabPeerState::Leading => *any_id,
            _ => role.leader_id.expect("Follower must know its leader"),
        }
    };
    println!("New leader is {}", new_leader_id);
    assert_ne!(new_leader_id, leader_id);

    // The reduced cluster still commits.
    let data = Bytes::from_static(b"after failover");
    let output = peers
        .get(&new_leader_id)
        .unwrap()
        .write_handle
        .submit_write(zab::SubmitWriteInput { op: 1, data: data.clone() })
        .await?;
    assert!(output.zxid.epoch().as_u32() > first_epoch);

    for (_, peer) in peers.iter_mut() {
        let committed = unwrap_committed(next_commit(&mut peer.commit_stream).await);
        assert_eq!(committed.zxid, output.zxid);
        assert_eq!(committed.data, data);
    }

    Ok(())
}

#[tokio::test]
async fn single_peer_cluster_leads_itself() -> Result<(), Box<dyn Error>> {
    let members = participants(26000, 1);
    let mut peer = zab::try_create_peer(config(1, members)).await?;

    let role = wait_for_role(&mut peer.event_listener, Duration::from_secs(10), |role| {
        role.state == zab::ZabPeerState::Leading
    })
    .await;
    assert_eq!(role.leader_id, Some(1));

    let data = Bytes::from_static(b"alone but replicated");
    let output = peer
        .write_handle
        .submit_write(zab::SubmitWriteInput { op: 1, data: data.clone() })
        .await?;
    assert_eq!(output.zxid.counter(), 1);

    let committed = unwrap_committed(next_commit(&mut peer.commit_stream).await);
    assert_eq!(committed.zxid, output.zxid);
    assert_eq!(committed.data, data);

    Ok(())
}

#[tokio::test]
async fn sync_barrier_fences_prior_writes() -> Result<(), Box<dyn Error>> {
    let members = participants(26200, 3);
    let mut peers = HashMap::with_capacity(members.len());
    for id in 1..=3 {
        peers.insert(id, zab::try_create_peer(config(id, members.clone())).await?);
    }

    let leader_id = discover_leader_id(&mut peers, Duration::from_secs(10)).await;
    let follower_id = (1..=3).find(|id| *id != leader_id).unwrap();
    let follower = peers.get_mut(&follower_id).unwrap();

    let output = follower
        .write_handle
        .submit_write(zab::SubmitWriteInput {
            op: 1,
            data: Bytes::from_static(b"fenced"),
        })
        .await?;

    // After the barrier resolves, this peer must have applied the write.
    follower.write_handle.sync_barrier().await?;
    assert!(follower.event_listener.last_committed_zxid() >= output.zxid);

    Ok(())
}

#[tokio::test]
async fn session_revalidation_reflects_committed_history() -> Result<(), Box<dyn Error>> {
    let members = participants(26400, 3);
    let mut peers = HashMap::with_capacity(members.len());
    for id in 1..=3 {
        peers.insert(id, zab::try_create_peer(config(id, members.clone())).await?);
    }

    let leader_id = discover_leader_id(&mut peers, Duration::from_secs(10)).await;
    let follower_id = (1..=3).find(|id| *id != leader_id).unwrap();
    let follower = peers.get(&follower_id).unwrap();

    follower
        .write_handle
        .submit_write(zab::SubmitWriteInput {
            op: 1,
            data: Bytes::from_static(b"session marker"),
        })
        .await?;

    // Our session has committed history; the leader must recognize it.
    let known = follower
        .write_handle
        .revalidate_session(zab::RevalidateSessionInput {
            session_id: follower.write_handle.session_id(),
            timeout_ms: 30_000,
        })
        .await?;
    assert!(known.valid);

    let unknown = follower
        .write_handle
        .revalidate_session(zab::RevalidateSessionInput {
            session_id: 999,
            timeout_ms: 30_000,
        })
        .await?;
    assert!(!unknown.valid);

    Ok(())
}

fn config(id: u64, cluster_members: Vec<zab::ZabMemberInfo>) -> zab::ZabPeerConfig {
    zab::ZabPeerConfig {
        my_server_id: id,
        cluster_members,
        info_logger: create_root_logger_for_stdout(id),
        options: zab::ZabOptions {
            tick_time: Some(Duration::from_millis(100)),
            election_finalize_wait: Some(Duration::from_millis(200)),
            ..zab::ZabOptions::default()
        },
    }
}

fn participants(port_base: u16, num_members: u64) -> Vec<zab::ZabMemberInfo> {
    (1..=num_members).map(|id| member_info(port_base, id)).collect()
}

fn member_info(port_base: u16, id: u64) -> zab::ZabMemberInfo {
    zab::ZabMemberInfo {
        server_id: id,
        role: zab::ZabMemberRole::Participant,
        ip_addr: Ipv4Addr::from([127, 0, 0, 1]),
        quorum_port: port_base + id as u16,
        election_port: port_base + 100 + id as u16,
    }
}

fn observer_info(port_base: u16, id: u64) -> zab::ZabMemberInfo {
    zab::ZabMemberInfo {
        role: zab::ZabMemberRole::Observer,
        ..member_info(port_base, id)
    }
}

async fn discover_leader_id(peers: &mut HashMap<u64, zab::ZabPeer>, timeout: Duration) -> u64 {
    let (any_peer_id, any_peer) = peers.iter_mut().next().unwrap();

    let deadline = Instant::now() + timeout;

    loop {
        let event = tokio::time::timeout_at(deadline, any_peer.event_listener.next_event())
            .await
            .expect("Timeout waiting for leader election")
            .expect("Expected role event bus to be alive");

        let zab::ZabEvent::Role(role) = event;
        match role.state {
            zab::ZabPeerState::Leading => return *any_peer_id,
            zab::ZabPeerState::Following | zab::ZabPeerState::Observing => {
                if let Some(leader_id) = role.leader_id {
                    return leader_id;
                }
            }
            zab::ZabPeerState::Looking => { /* Continue */ }
        }
    }
}

/// Blocks until no peer is still LOOKING. Peers that are not needed for the
/// leader's startup quorum can lag behind the first role announcement.
async fn wait_until_settled(peers: &mut HashMap<u64, zab::ZabPeer>, timeout: Duration) {
    for (_, peer) in peers.iter_mut() {
        if peer.event_listener.current_role().state != zab::ZabPeerState::Looking {
            continue;
        }
        wait_for_role(&mut peer.event_listener, timeout, |role| {
            role.state != zab::ZabPeerState::Looking
        })
        .await;
    }
}

async fn wait_for_role<F>(
    listener: &mut zab::ZabEventListener,
    timeout: Duration,
    mut accept: F,
) -> zab::ZabRoleEvent
where
    F: FnMut(&zab::ZabRoleEvent) -> bool,
{
    let deadline = Instant::now() + timeout;

    loop {
        let event = tokio::time::timeout_at(deadline, listener.next_event())
            .await
            .expect("Timeout waiting for a role transition")
            .expect("Expected role event bus to be alive");

        let zab::ZabEvent::Role(role) = event;
        if accept(&role) {
            return role;
        }
    }
}

async fn next_commit(stream: &mut zab::ZabCommitStream) -> zab::ZabCommitEvent {
    tokio::time::timeout(Duration::from_secs(10), stream.next())
        .await
        .expect("Timeout waiting for a commit event")
        .expect("Expected commit stream to be alive")
}

fn unwrap_committed(event: zab::ZabCommitEvent) -> zab::ZabCommittedTxn {
    match event {
        zab::ZabCommitEvent::Committed(committed) => committed,
        other => panic!("Expected a committed txn, got: {:?}", other),
    }
}

#[allow(dead_code)]
fn create_root_logger_for_file(directory_prefix: String, server_id: u64) -> slog::Logger {
    let now = Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
    let log_path = format!("{}/info_log_server_{}/{}_info.log", directory_prefix, server_id, now);
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(log_path)
        .unwrap();

    let decorator = slog_term::PlainDecorator::new(file);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    slog::Logger::root(drain, slog::o!())
}

fn create_root_logger_for_stdout(server_id: u64) -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).use_file_location().build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    slog::Logger::root(drain, slog::o!("ServerId" => server_id))
}
