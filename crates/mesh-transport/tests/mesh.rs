//! Loopback tests with every party on its own transport

use mesh_transport::{run_party, Framing, InboundQueue, Transport, TransportConfig};
use mpc_mesh_core::engine::RoundEngine;
use mpc_mesh_core::{Message, PartyId, PeerTable};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;

const WAIT: Duration = Duration::from_secs(5);

fn init_logs() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn fast() -> TransportConfig {
    TransportConfig::default().with_retry_backoff(Duration::from_millis(50))
}

/// Start one transport per id, fully connected
async fn mesh(ids: &[&str], config: TransportConfig) -> Vec<Transport> {
    init_logs();
    let mut listeners = Vec::new();
    for _ in ids {
        listeners.push(TcpListener::bind("127.0.0.1:0").await.unwrap());
    }
    let addrs: Vec<String> = listeners
        .iter()
        .map(|l| l.local_addr().unwrap().to_string())
        .collect();

    let mut transports = Vec::new();
    for (i, listener) in listeners.into_iter().enumerate() {
        let mut peers = PeerTable::new(ids[i].into(), addrs[i].clone());
        for (j, id) in ids.iter().enumerate() {
            if j != i {
                peers.add_peer((*id).into(), addrs[j].clone()).unwrap();
            }
        }
        let transport = Transport::new(peers, config.clone()).unwrap();
        transport.serve(listener).unwrap();
        transports.push(transport);
    }

    for transport in &transports {
        transport.connect_all();
    }
    for transport in &transports {
        transport.wait_for_peers(WAIT).await.unwrap();
    }
    transports
}

/// An address nothing listens on yet
async fn reserve_addr() -> SocketAddr {
    init_logs();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

async fn bind_retrying(addr: SocketAddr) -> TcpListener {
    let deadline = Instant::now() + WAIT;
    loop {
        match TcpListener::bind(addr).await {
            Ok(listener) => return listener,
            Err(_) if Instant::now() < deadline => {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(e) => panic!("could not rebind {}: {}", addr, e),
        }
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !check() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn recv(queue: &InboundQueue) -> Message {
    tokio::time::timeout(WAIT, queue.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("queue closed")
}

/// Give stray frames a chance to arrive, then check nothing did
async fn assert_quiet(queue: &InboundQueue) {
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(queue.try_recv().is_none());
}

#[tokio::test]
async fn test_broadcast_reaches_everyone_but_sender() {
    let mesh = mesh(&["alice", "bob", "carol"], fast()).await;
    let (alice, bob, carol) = (&mesh[0], &mesh[1], &mesh[2]);

    alice
        .send(&Message::broadcast("alice".into(), 1, b"r1".to_vec()))
        .await
        .unwrap();

    for transport in [bob, carol] {
        let queue = transport.next(transport.local_id());
        let msg = recv(&queue).await;
        assert_eq!(msg.from.as_str(), "alice");
        assert_eq!(msg.round, 1);
        assert_eq!(msg.data, b"r1");
        assert!(msg.broadcast);
        assert_quiet(&queue).await;
    }
    assert_quiet(&alice.next(&"alice".into())).await;
    assert_eq!(alice.stats().frames_sent, 2);
}

#[tokio::test]
async fn test_unicast_reaches_only_recipient() {
    let mesh = mesh(&["alice", "bob", "carol"], fast()).await;

    let sent = Message::unicast("alice".into(), "bob".into(), 3, vec![0, 1, 2, 255])
        .with_session(b"sid".to_vec(), "test");
    mesh[0].send(&sent).await.unwrap();

    let bob = mesh[1].next(&"bob".into());
    let received = recv(&bob).await;
    assert_eq!(received, sent);
    assert_quiet(&bob).await;
    assert_quiet(&mesh[2].next(&"carol".into())).await;
    assert_eq!(mesh[0].stats().frames_sent, 1);
}

#[tokio::test]
async fn test_line_framing() {
    let config = fast().with_framing(Framing::Line);
    let mesh = mesh(&["alice", "bob"], config).await;

    mesh[0]
        .send(&Message::unicast("alice".into(), "bob".into(), 0, b"hello there".to_vec()))
        .await
        .unwrap();

    let msg = recv(&mesh[1].next(&"bob".into())).await;
    assert_eq!(msg.from.as_str(), "alice");
    assert_eq!(msg.to, Some(PartyId::from("bob")));
    assert_eq!(msg.data, b"hello there");
}

#[tokio::test]
async fn test_rounds_over_tcp_then_latch_closes() {
    let ids = ["alice", "bob", "carol"];
    let mesh = mesh(&ids, fast()).await;
    let parties: Vec<PartyId> = ids.iter().map(|id| PartyId::from(*id)).collect();

    let mut handles = Vec::new();
    for transport in &mesh {
        let id = transport.local_id().clone();
        let mut engine = RoundEngine::new(id.clone(), parties.clone(), 4, b"e2e".to_vec()).unwrap();
        let transport = transport.clone();
        handles.push(tokio::spawn(async move {
            run_party(&id, &mut engine, &transport).await.unwrap();
            (id, engine.result().unwrap())
        }));
    }

    for handle in handles {
        let (id, transcript) = tokio::time::timeout(Duration::from_secs(15), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(transcript.rounds.len(), 4);
        for peer in parties.iter().filter(|p| **p != id) {
            assert_eq!(
                transcript.rounds[&3].direct[peer],
                RoundEngine::direct_payload(peer, &id, 3)
            );
            assert_eq!(
                transcript.rounds[&4].broadcasts[peer],
                RoundEngine::broadcast_payload(peer, 4)
            );
        }
    }

    for transport in &mesh {
        let mut latch = transport.latch();
        for id in &parties {
            assert!(!latch.is_closed());
            transport.done(id);
        }
        tokio::time::timeout(WAIT, latch.wait()).await.unwrap();
        assert!(transport.connected_peers().is_empty());
        assert_eq!(transport.stats().dropped(), 0);
    }
}

#[tokio::test]
async fn test_dial_retries_until_peer_listens() {
    let bob_addr = reserve_addr().await;
    let alice_peers =
        PeerTable::from_specs("alice".into(), "127.0.0.1:0", [format!("bob:{}", bob_addr).as_str()])
            .unwrap();
    let alice = Transport::new(alice_peers, fast()).unwrap();
    alice.connect_all();

    eventually(|| alice.stats().dial_failures >= 2).await;
    assert!(alice.connected_peers().is_empty());

    let bob_peers = PeerTable::from_specs("bob".into(), bob_addr.to_string(), ["alice:127.0.0.1:1"]).unwrap();
    let bob = Transport::new(bob_peers, fast()).unwrap();
    bob.serve(bind_retrying(bob_addr).await).unwrap();

    alice.wait_for_peers(WAIT).await.unwrap();
    assert_eq!(alice.connected_peers(), vec![PartyId::from("bob")]);
    assert_eq!(alice.stats().connections_established, 1);
}

#[tokio::test]
async fn test_unicast_while_peer_down_is_not_delivered() {
    let bob_addr = reserve_addr().await;
    let alice_peers =
        PeerTable::from_specs("alice".into(), "127.0.0.1:0", [format!("bob:{}", bob_addr).as_str()])
            .unwrap();
    let alice = Transport::new(alice_peers, fast()).unwrap();
    alice.connect_all();

    alice
        .send(&Message::unicast("alice".into(), "bob".into(), 1, b"lost".to_vec()))
        .await
        .unwrap();
    assert_eq!(alice.stats().unsent_not_connected, 1);
    assert_eq!(alice.stats().frames_sent, 0);

    let bob_peers = PeerTable::from_specs("bob".into(), bob_addr.to_string(), ["alice:127.0.0.1:1"]).unwrap();
    let bob = Transport::new(bob_peers, fast()).unwrap();
    bob.serve(bind_retrying(bob_addr).await).unwrap();
    alice.wait_for_peers(WAIT).await.unwrap();

    // only a retransmission after the reconnect arrives, exactly once
    alice
        .send(&Message::unicast("alice".into(), "bob".into(), 1, b"again".to_vec()))
        .await
        .unwrap();
    let queue = bob.next(&"bob".into());
    assert_eq!(recv(&queue).await.data, b"again");
    assert_quiet(&queue).await;
    assert_eq!(bob.stats().delivered, 1);
}

#[tokio::test]
async fn test_redial_after_peer_restarts() {
    init_logs();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let bob_addr = listener.local_addr().unwrap();
    let bob_peers = || {
        PeerTable::from_specs("bob".into(), bob_addr.to_string(), ["alice:127.0.0.1:1"]).unwrap()
    };

    let bob = Transport::new(bob_peers(), fast()).unwrap();
    bob.serve(listener).unwrap();
    let alice_peers =
        PeerTable::from_specs("alice".into(), "127.0.0.1:0", [format!("bob:{}", bob_addr).as_str()])
            .unwrap();
    let alice = Transport::new(alice_peers, fast()).unwrap();
    alice.connect_all();
    alice.wait_for_peers(WAIT).await.unwrap();

    bob.shutdown();
    eventually(|| alice.connected_peers().is_empty()).await;

    let restarted = Transport::new(bob_peers(), fast()).unwrap();
    restarted.serve(bind_retrying(bob_addr).await).unwrap();

    // the engine retransmits until the new connection carries the message
    let queue = restarted.next(&"bob".into());
    let deadline = Instant::now() + WAIT;
    let received = loop {
        assert!(Instant::now() < deadline, "no delivery after restart");
        alice
            .send(&Message::unicast("alice".into(), "bob".into(), 2, b"after restart".to_vec()))
            .await
            .unwrap();
        if let Ok(Some(msg)) = tokio::time::timeout(Duration::from_millis(100), queue.recv()).await {
            break msg;
        }
    };
    assert_eq!(received.data, b"after restart");
    assert!(alice.stats().connections_established >= 2);
}

#[tokio::test]
async fn test_full_queue_drops_newest() {
    let mesh = mesh(&["alice", "bob"], fast().with_queue_capacity(2)).await;
    let (alice, bob) = (&mesh[0], &mesh[1]);

    for round in 1..=5 {
        alice
            .send(&Message::unicast("alice".into(), "bob".into(), round, vec![round as u8]))
            .await
            .unwrap();
    }

    eventually(|| bob.stats().frames_received == 5).await;
    let stats = bob.stats();
    assert_eq!(stats.delivered, 2);
    assert_eq!(stats.dropped_queue_full, 3);

    let queue = bob.next(&"bob".into());
    assert_eq!(recv(&queue).await.round, 1);
    assert_eq!(recv(&queue).await.round, 2);
    assert!(queue.try_recv().is_none());
}

#[tokio::test]
async fn test_quit_prunes_party() {
    let mesh = mesh(&["alice", "bob", "carol"], fast()).await;
    let (alice, bob, carol) = (&mesh[0], &mesh[1], &mesh[2]);

    alice.quit(&"carol".into());
    alice.quit(&"carol".into());
    assert_eq!(alice.connected_peers(), vec![PartyId::from("bob")]);
    let expected: Vec<PartyId> = vec!["alice".into(), "bob".into()];
    assert_eq!(alice.parties(), expected);

    carol
        .send(&Message::broadcast("carol".into(), 1, b"late".to_vec()))
        .await
        .unwrap();

    assert_eq!(recv(&bob.next(&"bob".into())).await.data, b"late");
    eventually(|| alice.stats().dropped_unknown_sender == 1).await;
    assert!(alice.next(&"alice".into()).try_recv().is_none());

    // alice no longer writes to carol
    alice
        .send(&Message::broadcast("alice".into(), 2, b"r2".to_vec()))
        .await
        .unwrap();
    assert_eq!(recv(&bob.next(&"bob".into())).await.round, 2);
    assert_quiet(&carol.next(&"carol".into())).await;
}
