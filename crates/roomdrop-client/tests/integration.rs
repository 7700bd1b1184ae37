//! Integration tests for the roomdrop client
//!
//! These run complete sessions over the in-memory signaling hub and
//! transport, verifying the full join -> negotiate -> transfer flow without
//! any real network.

use roomdrop_client::session::{Session, SessionEvent, SessionHandle};
use roomdrop_client::store::ChunkStore;
use roomdrop_client::transfer::FlowControl;
use roomdrop_core::channel::mem::{MemConnector, MemNetwork};
use roomdrop_core::signal::mem::{MemBusClient, MemHub};
use roomdrop_core::{ConnectionState, TransferDirection, TransferStatus};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Mutex;

const CHUNK_SIZE: u32 = 131072;

struct TestPeer {
    handle: SessionHandle,
    store: Arc<Mutex<ChunkStore>>,
    task: tokio::task::JoinHandle<()>,
}

fn spawn_peer(
    hub: &Arc<MemHub>,
    network: &Arc<MemNetwork>,
    sid: &str,
    room: &str,
) -> TestPeer {
    let store = Arc::new(Mutex::new(ChunkStore::open_in_memory().unwrap()));
    let (session, handle): (Session<MemConnector, MemBusClient>, _) = Session::new(
        hub.client(sid),
        network.connector(sid),
        store.clone(),
        room,
        CHUNK_SIZE,
        FlowControl::default(),
    );
    let task = tokio::spawn(session.run());
    TestPeer {
        handle,
        store,
        task,
    }
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

async fn wait_for_members(peer: &mut TestPeer, sids: &[&str]) {
    while let Some(event) = peer.handle.next_event().await {
        if let SessionEvent::RoomClients(clients) = event {
            if sids.iter().all(|sid| clients.iter().any(|c| c == sid)) {
                return;
            }
        }
    }
    panic!("session ended before {:?} joined", sids);
}

async fn wait_for_state(peer: &mut TestPeer, sid: &str, wanted: ConnectionState) {
    wait_for_states(peer, &[sid], wanted).await;
}

/// Wait until every listed peer has reported `wanted`, in any order
async fn wait_for_states(peer: &mut TestPeer, sids: &[&str], wanted: ConnectionState) {
    let mut remaining: Vec<&str> = sids.to_vec();
    while let Some(event) = peer.handle.next_event().await {
        if let SessionEvent::ConnectionState { sid, state } = event {
            if state == wanted {
                remaining.retain(|s| *s != sid);
                if remaining.is_empty() {
                    return;
                }
            }
        }
    }
    panic!("session ended before {:?} reached {}", sids, wanted);
}

/// Collect transfer progress until the completed metadata arrives
async fn wait_for_completion(peer: &mut TestPeer) -> (Vec<f64>, roomdrop_core::TransferMetadata) {
    let mut progress = Vec::new();
    while let Some(event) = peer.handle.next_event().await {
        match event {
            SessionEvent::Transfer(ev) => {
                progress.push(ev.progress);
                if ev.metadata.status == TransferStatus::Completed {
                    return (progress, ev.metadata);
                }
            }
            SessionEvent::TransferFailed { reason, .. } => {
                panic!("transfer failed: {}", reason);
            }
            _ => {}
        }
    }
    panic!("session ended mid-transfer");
}

async fn connect(sender: &mut TestPeer, receiver: &mut TestPeer, receiver_sid: &str, sender_sid: &str) {
    wait_for_members(sender, &[receiver_sid]).await;
    sender.handle.dial(receiver_sid);
    wait_for_state(sender, receiver_sid, ConnectionState::Connected).await;
    wait_for_state(receiver, sender_sid, ConnectionState::Connected).await;
}

#[tokio::test]
async fn test_end_to_end_transfer() {
    let hub = MemHub::new();
    let network = MemNetwork::new();
    let mut alice = spawn_peer(&hub, &network, "alice", "room-e2e");
    let mut bob = spawn_peer(&hub, &network, "bob", "room-e2e");

    connect(&mut alice, &mut bob, "bob", "alice").await;

    let dir = TempDir::new().unwrap();
    let data = patterned(300000);
    let path = dir.path().join("payload.bin");
    std::fs::write(&path, &data).unwrap();

    alice.handle.send_file("bob", &path);

    let (sent_progress, sent_meta) = wait_for_completion(&mut alice).await;
    let (recv_progress, recv_meta) = wait_for_completion(&mut bob).await;

    // Progress climbs per chunk and ends at exactly 100 on both sides
    assert_eq!(sent_progress, vec![33.33, 66.67, 100.0, 100.0]);
    assert_eq!(*recv_progress.last().unwrap(), 100.0);

    assert_eq!(sent_meta.status, TransferStatus::Completed);
    assert_eq!(sent_meta.direction, TransferDirection::Sending);
    assert_eq!(sent_meta.total_chunks, 3);

    assert_eq!(recv_meta.status, TransferStatus::Completed);
    assert_eq!(recv_meta.direction, TransferDirection::Receiving);
    assert_eq!(recv_meta.sid, "alice");
    assert_eq!(recv_meta.received_chunks, 3);

    // The receiver holds three chunks of the expected sizes and can
    // reproduce the original bytes exactly
    let store = bob.store.lock().await;
    let chunks = store.get_chunks(&recv_meta.id).unwrap();
    let sizes: Vec<usize> = chunks.iter().map(|(_, c)| c.len()).collect();
    assert_eq!(sizes, vec![131072, 131072, 37856]);
    assert_eq!(store.assemble_completed(&recv_meta.id).unwrap().unwrap(), data);
    drop(store);

    alice.handle.shutdown();
    bob.handle.shutdown();
    alice.task.await.unwrap();
    bob.task.await.unwrap();
}

#[tokio::test]
async fn test_send_before_connected_rejected() {
    let hub = MemHub::new();
    let network = MemNetwork::new();
    let mut alice = spawn_peer(&hub, &network, "alice", "room-early");
    let bob = spawn_peer(&hub, &network, "bob", "room-early");

    // Bob is in the room but never dialed: the peer exists in `new` state
    wait_for_members(&mut alice, &["bob"]).await;

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("payload.bin");
    std::fs::write(&path, b"never sent").unwrap();
    alice.handle.send_file("bob", &path);

    let reason = loop {
        match alice.handle.next_event().await.unwrap() {
            SessionEvent::TransferFailed { reason, .. } => break reason,
            SessionEvent::Transfer(_) => panic!("send should have been rejected"),
            _ => {}
        }
    };
    assert!(reason.contains("channel unavailable"), "got: {}", reason);

    // Nothing was put on the wire and no pending row leaked
    assert!(alice
        .store
        .lock()
        .await
        .list_all_metadata()
        .unwrap()
        .is_empty());

    alice.handle.shutdown();
    bob.handle.shutdown();
}

#[tokio::test]
async fn test_concurrent_transfers_make_independent_progress() {
    let hub = MemHub::new();
    let network = MemNetwork::new();
    let mut alice = spawn_peer(&hub, &network, "alice", "room-multi");
    let mut bob = spawn_peer(&hub, &network, "bob", "room-multi");
    let mut carol = spawn_peer(&hub, &network, "carol", "room-multi");

    wait_for_members(&mut alice, &["bob", "carol"]).await;
    alice.handle.dial("bob");
    alice.handle.dial("carol");
    wait_for_states(&mut alice, &["bob", "carol"], ConnectionState::Connected).await;
    wait_for_state(&mut bob, "alice", ConnectionState::Connected).await;
    wait_for_state(&mut carol, "alice", ConnectionState::Connected).await;

    let dir = TempDir::new().unwrap();
    let for_bob = patterned(300000);
    let for_carol: Vec<u8> = patterned(200000).iter().map(|b| b ^ 0xff).collect();
    let bob_path = dir.path().join("bob.bin");
    let carol_path = dir.path().join("carol.bin");
    std::fs::write(&bob_path, &for_bob).unwrap();
    std::fs::write(&carol_path, &for_carol).unwrap();

    // Both transfers in flight at once, on two different peer connections
    alice.handle.send_file("bob", &bob_path);
    alice.handle.send_file("carol", &carol_path);

    let (_, bob_meta) = wait_for_completion(&mut bob).await;
    let (_, carol_meta) = wait_for_completion(&mut carol).await;

    assert_eq!(
        bob.store
            .lock()
            .await
            .assemble_completed(&bob_meta.id)
            .unwrap()
            .unwrap(),
        for_bob
    );
    assert_eq!(
        carol
            .store
            .lock()
            .await
            .assemble_completed(&carol_meta.id)
            .unwrap()
            .unwrap(),
        for_carol
    );

    alice.handle.shutdown();
    bob.handle.shutdown();
    carol.handle.shutdown();
}

#[tokio::test]
async fn test_closed_peer_reconnects_fresh() {
    let hub = MemHub::new();
    let network = MemNetwork::new();
    let mut alice = spawn_peer(&hub, &network, "alice", "room-again");
    let mut bob = spawn_peer(&hub, &network, "bob", "room-again");

    connect(&mut alice, &mut bob, "bob", "alice").await;

    alice.handle.close_peer("bob");
    wait_for_state(&mut alice, "bob", ConnectionState::Closed).await;

    // A second dial builds a brand new connection and completes a transfer
    alice.handle.dial("bob");
    wait_for_state(&mut alice, "bob", ConnectionState::Connected).await;

    let dir = TempDir::new().unwrap();
    let data = patterned(1000);
    let path = dir.path().join("small.bin");
    std::fs::write(&path, &data).unwrap();
    alice.handle.send_file("bob", &path);

    let (_, recv_meta) = wait_for_completion(&mut bob).await;
    assert_eq!(recv_meta.total_chunks, 1);
    assert_eq!(
        bob.store
            .lock()
            .await
            .assemble_completed(&recv_meta.id)
            .unwrap()
            .unwrap(),
        data
    );

    alice.handle.shutdown();
    bob.handle.shutdown();
}

#[tokio::test]
async fn test_leaving_peer_is_pruned() {
    let hub = MemHub::new();
    let network = MemNetwork::new();
    let mut alice = spawn_peer(&hub, &network, "alice", "room-prune");
    let mut bob = spawn_peer(&hub, &network, "bob", "room-prune");

    connect(&mut alice, &mut bob, "bob", "alice").await;

    // Bob shuts down, leaving the room; alice prunes the peer
    bob.handle.shutdown();
    bob.task.await.unwrap();

    wait_for_state(&mut alice, "bob", ConnectionState::Closed).await;

    alice.handle.shutdown();
    alice.task.await.unwrap();
}
