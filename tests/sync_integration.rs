//! End-to-end tests: full sessions syncing over real WebRTC data
//! channels, negotiated through a real relay, everything on loopback.

use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};
use yrs::{Doc, GetString, Text, Transact};

use vellum_collab::manager::PeerConnectionManager;
use vellum_collab::peer::PeerSettings;
use vellum_collab::presence::PresenceEntry;
use vellum_collab::protocol::SignalData;
use vellum_collab::reconnect::BackoffConfig;
use vellum_collab::relay::{RelayConfig, RelayServer};
use vellum_collab::session::{Session, SessionConfig, SessionEvent};

async fn start_relay() -> String {
    let server = RelayServer::bind(RelayConfig {
        bind_addr: "127.0.0.1:0".to_string(),
    })
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    format!("ws://{addr}")
}

fn test_config(relay_url: &str, room: &str) -> SessionConfig {
    SessionConfig {
        relay_url: relay_url.to_string(),
        room: room.to_string(),
        // Loopback-only: no STUN, gather 127.0.0.1 candidates.
        ice_servers: Vec::new(),
        include_loopback: true,
        sweep_interval: Duration::from_millis(200),
        backoff: BackoffConfig {
            base: Duration::from_millis(100),
            max: Duration::from_millis(500),
        },
        ..Default::default()
    }
}

/// Poll until `predicate` holds or the deadline passes.
async fn wait_for<F: FnMut() -> bool>(mut predicate: F, what: &str) {
    let result = timeout(Duration::from_secs(20), async {
        while !predicate() {
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {what}");
}

fn insert(doc: &Doc, text: &str) {
    let root = doc.get_or_insert_text("doc");
    let mut txn = doc.transact_mut();
    let len = root.len(&txn);
    root.insert(&mut txn, len, text);
}

fn content(doc: &Doc) -> String {
    let root = doc.get_or_insert_text("doc");
    let txn = doc.transact();
    root.get_string(&txn)
}

#[tokio::test]
async fn test_two_sessions_converge() {
    let url = start_relay().await;

    let a = Session::connect(test_config(&url, "doc-1"), Doc::new()).unwrap();
    let b = Session::connect(test_config(&url, "doc-1"), Doc::new()).unwrap();

    wait_for(|| a.connected_peers() == 1 && b.connected_peers() == 1, "channel open").await;

    insert(a.doc(), "hello from a");
    wait_for(|| content(b.doc()) == "hello from a", "update to reach b").await;

    insert(b.doc(), " and b");
    wait_for(|| content(a.doc()) == "hello from a and b", "update to reach a").await;

    a.disconnect().await;
    b.disconnect().await;
}

#[tokio::test]
async fn test_late_joiner_catches_up_via_handshake() {
    let url = start_relay().await;

    // a edits alone first; the history must flow to b through the
    // state-vector handshake, not through live updates.
    let a = Session::connect(test_config(&url, "doc-2"), Doc::new()).unwrap();
    insert(a.doc(), "pre-existing state");

    let b = Session::connect(test_config(&url, "doc-2"), Doc::new()).unwrap();
    wait_for(|| content(b.doc()) == "pre-existing state", "history to reach b").await;

    a.disconnect().await;
    b.disconnect().await;
}

#[tokio::test]
async fn test_presence_propagates_and_clears() {
    let url = start_relay().await;

    let a_doc = Doc::new();
    let a_client = a_doc.client_id();
    let a = Session::connect(test_config(&url, "doc-3"), a_doc).unwrap();
    let b = Session::connect(test_config(&url, "doc-3"), Doc::new()).unwrap();

    wait_for(|| a.connected_peers() == 1 && b.connected_peers() == 1, "channel open").await;

    a.set_local_presence(Some(PresenceEntry::new("Alice", a_client)));
    wait_for(
        || b.remote_presence().iter().any(|(_, e)| e.name == "Alice"),
        "presence to reach b",
    )
    .await;

    a.set_local_presence(None);
    wait_for(|| b.remote_presence().is_empty(), "presence removal").await;

    a.disconnect().await;
    b.disconnect().await;
}

#[tokio::test]
async fn test_snapshot_on_channel_open() {
    let url = start_relay().await;

    // a publishes presence before b exists; b must get it from the
    // snapshot sent when the channel opens.
    let a_doc = Doc::new();
    let a_client = a_doc.client_id();
    let a = Session::connect(test_config(&url, "doc-4"), a_doc).unwrap();
    a.set_local_presence(Some(PresenceEntry::new("Alice", a_client)));

    let b = Session::connect(test_config(&url, "doc-4"), Doc::new()).unwrap();
    wait_for(
        || b.remote_presence().iter().any(|(_, e)| e.name == "Alice"),
        "snapshot to reach b",
    )
    .await;

    a.disconnect().await;
    b.disconnect().await;
}

#[tokio::test]
async fn test_departure_cleans_up_and_survivor_keeps_editing() {
    let url = start_relay().await;

    let a = Session::connect(test_config(&url, "doc-5"), Doc::new()).unwrap();
    let b = Session::connect(test_config(&url, "doc-5"), Doc::new()).unwrap();
    wait_for(|| a.connected_peers() == 1 && b.connected_peers() == 1, "channel open").await;

    insert(a.doc(), "shared");
    wait_for(|| content(b.doc()) == "shared", "initial sync").await;

    a.disconnect().await;
    wait_for(|| b.connected_peers() == 0, "peer cleanup on departure").await;

    // Editing after the room emptied must neither error nor block.
    insert(b.doc(), " solo");
    assert_eq!(content(b.doc()), "shared solo");

    b.disconnect().await;
}

#[tokio::test]
async fn test_relay_restart_recovers_discovery() {
    let server = RelayServer::bind(RelayConfig {
        bind_addr: "127.0.0.1:0".to_string(),
    })
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();
    let relay_task = tokio::spawn(server.run());
    let url = format!("ws://{addr}");

    let a = Session::connect(test_config(&url, "doc-7"), Doc::new()).unwrap();
    let b = Session::connect(test_config(&url, "doc-7"), Doc::new()).unwrap();
    wait_for(|| a.connected_peers() == 1 && b.connected_peers() == 1, "initial mesh").await;
    let old_id = a.local_peer_id().unwrap();

    insert(a.doc(), "before");
    wait_for(|| content(b.doc()) == "before", "initial sync").await;

    // Kill the relay. The peer channels outlive it, but both sides will
    // rejoin under fresh ids and must not end up partitioned behind
    // their stale connections.
    relay_task.abort();
    sleep(Duration::from_millis(100)).await;
    let server = RelayServer::bind(RelayConfig {
        bind_addr: addr.to_string(),
    })
    .await
    .unwrap();
    tokio::spawn(server.run());

    wait_for(
        || a.local_peer_id().is_some_and(|id| id != old_id),
        "rejoin under a fresh id",
    )
    .await;
    wait_for(
        || a.connected_peers() == 1 && b.connected_peers() == 1,
        "mesh after relay restart",
    )
    .await;

    insert(a.doc(), " after");
    wait_for(|| content(b.doc()) == "before after", "sync after relay restart").await;

    a.disconnect().await;
    b.disconnect().await;
}

#[tokio::test]
async fn test_idle_presence_survives_sweep_while_connected() {
    let url = start_relay().await;

    // Timeout far shorter than the idle period below: only the
    // keepalive on the maintenance tick can keep the entry alive.
    let config = SessionConfig {
        presence_timeout: Duration::from_millis(500),
        ..test_config(&url, "doc-8")
    };
    let a_doc = Doc::new();
    let a_client = a_doc.client_id();
    let a = Session::connect(config.clone(), a_doc).unwrap();
    let b = Session::connect(config, Doc::new()).unwrap();

    wait_for(|| a.connected_peers() == 1 && b.connected_peers() == 1, "channel open").await;

    a.set_local_presence(Some(PresenceEntry::new("Alice", a_client)));
    wait_for(
        || b.remote_presence().iter().any(|(_, e)| e.name == "Alice"),
        "presence to reach b",
    )
    .await;

    // No cursor movement for several timeout windows.
    sleep(Duration::from_millis(1500)).await;
    assert!(
        b.remote_presence().iter().any(|(_, e)| e.name == "Alice"),
        "idle but connected participant was swept"
    );

    a.disconnect().await;
    b.disconnect().await;
}

#[tokio::test]
async fn test_broadcast_survives_abrupt_peer_loss() {
    // Two managers wired directly, no relay: lets us kill one side's
    // transports without any departure notice reaching the other.
    let settings = PeerSettings {
        ice_servers: Vec::new(),
        include_loopback: true,
        ..Default::default()
    };
    let (a_tx, mut a_rx) = mpsc::unbounded_channel();
    let (b_tx, mut b_rx) = mpsc::unbounded_channel();
    let mut a = PeerConnectionManager::new(settings.clone(), a_tx);
    let mut b = PeerConnectionManager::new(settings, b_tx);

    let offer = a.ensure_offerer("b").await.unwrap();
    let answer = b.route_signal("a", offer).await.unwrap();
    a.route_signal("b", answer).await;

    // Pump candidates and channel-open events until both ends are up.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while (a.ready_count() < 1 || b.ready_count() < 1)
        && tokio::time::Instant::now() < deadline
    {
        tokio::select! {
            Some(event) = a_rx.recv() => match event {
                SessionEvent::LocalCandidate { candidate, .. } => {
                    b.route_signal("a", SignalData::Ice { candidate }).await;
                }
                SessionEvent::ChannelOpen { peer, channel } => {
                    a.handle_channel_open(&peer, channel);
                }
                _ => {}
            },
            Some(event) = b_rx.recv() => match event {
                SessionEvent::LocalCandidate { candidate, .. } => {
                    a.route_signal("b", SignalData::Ice { candidate }).await;
                }
                SessionEvent::ChannelOpen { peer, channel } => {
                    b.handle_channel_open(&peer, channel);
                }
                _ => {}
            },
            _ = sleep(Duration::from_millis(50)) => {}
        }
    }
    assert_eq!(a.ready_count(), 1, "channels never opened");
    assert_eq!(b.ready_count(), 1, "channels never opened");

    // b vanishes without a word.
    b.close_all().await;

    // a has processed no closure yet: the broadcast must return
    // immediately and must not error.
    let start = std::time::Instant::now();
    a.broadcast(b"update for a dead peer", None);
    assert!(start.elapsed() < Duration::from_secs(1));

    // The loss surfaces through the transport and the peer set empties.
    let cleaned = timeout(Duration::from_secs(20), async {
        while let Some(event) = a_rx.recv().await {
            if let SessionEvent::ChannelClosed { peer } = event {
                a.close_peer(&peer).await;
                break;
            }
        }
    })
    .await;
    assert!(cleaned.is_ok(), "never observed the abrupt departure");
    assert!(a.is_empty());
}

#[tokio::test]
async fn test_three_way_mesh() {
    let url = start_relay().await;

    let a = Session::connect(test_config(&url, "doc-6"), Doc::new()).unwrap();
    let b = Session::connect(test_config(&url, "doc-6"), Doc::new()).unwrap();
    let c = Session::connect(test_config(&url, "doc-6"), Doc::new()).unwrap();

    wait_for(
        || {
            a.connected_peers() == 2
                && b.connected_peers() == 2
                && c.connected_peers() == 2
        },
        "full mesh",
    )
    .await;

    insert(a.doc(), "a");
    insert(b.doc(), "b");
    insert(c.doc(), "c");

    wait_for(
        || {
            let a = content(a.doc());
            let b = content(b.doc());
            let c = content(c.doc());
            a.len() == 3 && a == b && b == c
        },
        "three-way convergence",
    )
    .await;

    a.disconnect().await;
    b.disconnect().await;
    c.disconnect().await;
}
