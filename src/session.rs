//! The public entry point: one [`Session`] per document per room.
//!
//! Everything that can happen — relay notifications, channel traffic,
//! local edits, presence changes, shutdown — is funneled into a single
//! event queue drained by one coordinating task. Document and peer-set
//! mutation happen only on that task, so there are no lock orderings to
//! get wrong and no callback re-entrancy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use yrs::Doc;

use crate::engine::{EngineError, SyncEngine};
use crate::manager::PeerConnectionManager;
use crate::peer::PeerSettings;
use crate::presence::{PresenceEntry, PresenceStore, PresenceUpdate};
use crate::protocol::{Envelope, SignalData};
use crate::reconnect::{BackoffConfig, ReconnectSupervisor};
use crate::signaling::{RelayEvent, SignalingClient};

/// Everything the coordinating task reacts to.
pub enum SessionEvent {
    /// Relay-side event from the signaling client.
    Relay(RelayEvent),
    /// A peer's data channel opened.
    ChannelOpen {
        peer: String,
        channel: Arc<RTCDataChannel>,
    },
    /// Bytes arrived on a peer's data channel.
    ChannelMessage { peer: String, data: Vec<u8> },
    /// A peer's channel or transport closed or failed.
    ChannelClosed { peer: String },
    /// Locally gathered ICE candidate to trickle out.
    LocalCandidate {
        peer: String,
        candidate: RTCIceCandidateInit,
    },
    /// Local document edit, already encoded as a v1 update.
    LocalUpdate(Vec<u8>),
    /// Local presence change to broadcast.
    LocalPresence(PresenceUpdate),
    /// Tear the session down.
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub relay_url: String,
    pub room: String,
    pub ice_servers: Vec<String>,
    pub channel_label: String,
    pub backoff: BackoffConfig,
    /// Gather loopback candidates (tests only).
    pub include_loopback: bool,
    /// Interval of the maintenance tick: presence sweep + reaping of
    /// peers stuck in negotiation.
    pub sweep_interval: Duration,
    /// Presence entries not refreshed within this window are dropped.
    pub presence_timeout: Duration,
    /// Peers still negotiating after this long are torn down.
    pub negotiation_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:8765".to_string(),
            room: "default".to_string(),
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            channel_label: "vellum".to_string(),
            backoff: BackoffConfig::default(),
            include_loopback: false,
            sweep_interval: Duration::from_secs(15),
            presence_timeout: Duration::from_secs(60),
            negotiation_timeout: Duration::from_secs(30),
        }
    }
}

/// Handle to a live collaboration session.
///
/// Cheap accessors live on the handle; everything that mutates shared
/// state goes through the event queue.
pub struct Session {
    events: mpsc::UnboundedSender<SessionEvent>,
    supervisor: ReconnectSupervisor,
    presence: Arc<Mutex<PresenceStore>>,
    doc: Doc,
    local_id: Arc<Mutex<Option<String>>>,
    ready_peers: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl Session {
    /// Join `config.room`, start syncing `doc`, and return the handle.
    ///
    /// The relay may be unreachable at this point; the supervisor keeps
    /// retrying in the background and local editing works throughout.
    pub fn connect(config: SessionConfig, doc: Doc) -> Result<Self, EngineError> {
        let (tx, rx) = mpsc::unbounded_channel();

        let presence = Arc::new(Mutex::new(PresenceStore::new(doc.client_id())));
        let mut engine = SyncEngine::new(doc.clone(), presence.clone(), tx.clone());
        engine.attach()?;

        let client = Arc::new(SignalingClient::new(
            config.relay_url.clone(),
            config.room.clone(),
            tx.clone(),
        ));
        let supervisor = ReconnectSupervisor::spawn(client.clone(), config.backoff);

        let manager = PeerConnectionManager::new(
            PeerSettings {
                ice_servers: config.ice_servers.clone(),
                channel_label: config.channel_label.clone(),
                include_loopback: config.include_loopback,
            },
            tx.clone(),
        );

        let local_id = Arc::new(Mutex::new(None));
        let ready_peers = Arc::new(AtomicUsize::new(0));
        let handle = tokio::spawn(run_session(
            config,
            rx,
            engine,
            manager,
            client,
            local_id.clone(),
            ready_peers.clone(),
        ));

        Ok(Self {
            events: tx,
            supervisor,
            presence,
            doc,
            local_id,
            ready_peers,
            handle,
        })
    }

    /// The replicated document. Edit it from anywhere; updates propagate
    /// automatically.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    /// Relay-assigned id, once the first `welcome` arrived.
    pub fn local_peer_id(&self) -> Option<String> {
        self.local_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Number of peers with an open data channel.
    pub fn connected_peers(&self) -> usize {
        self.ready_peers.load(Ordering::SeqCst)
    }

    /// Publish (or with `None`, retract) the local presence entry.
    pub fn set_local_presence(&self, entry: Option<PresenceEntry>) {
        let update = {
            let mut store = self.presence.lock().unwrap_or_else(|e| e.into_inner());
            match entry {
                Some(entry) => Some(store.set_local(entry)),
                None => store.clear_local(),
            }
        };
        if let Some(update) = update {
            let _ = self.events.send(SessionEvent::LocalPresence(update));
        }
    }

    /// Live remote presence entries.
    pub fn remote_presence(&self) -> Vec<(u64, PresenceEntry)> {
        self.presence
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remote_entries()
    }

    /// Leave the session: detach listeners, close every peer, stop the
    /// relay link. The document stays usable afterwards.
    pub async fn disconnect(self) {
        self.supervisor.shutdown();
        let _ = self.events.send(SessionEvent::Shutdown);
        let _ = self.handle.await;
    }
}

/// The coordinating task.
async fn run_session(
    config: SessionConfig,
    mut rx: mpsc::UnboundedReceiver<SessionEvent>,
    mut engine: SyncEngine,
    mut manager: PeerConnectionManager,
    client: Arc<SignalingClient>,
    local_id: Arc<Mutex<Option<String>>>,
    ready_peers: Arc<AtomicUsize>,
) {
    let mut sweep = tokio::time::interval(config.sweep_interval);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                match event {
                    SessionEvent::Relay(relay) => {
                        handle_relay_event(relay, &mut manager, &client, &local_id).await;
                    }
                    SessionEvent::ChannelOpen { peer, channel } => {
                        // First open triggers the sync handshake and the
                        // presence snapshot, exactly once per connection.
                        if manager.handle_channel_open(&peer, channel) {
                            log::info!("peer {} connected", peer);
                            manager.send_to(&peer, &engine.handshake());
                            if let Some(snapshot) = engine.presence_snapshot() {
                                manager.send_to(&peer, &snapshot);
                            }
                        }
                    }
                    SessionEvent::ChannelMessage { peer, data } => {
                        if let Some(reply) = engine.handle_envelope(&peer, &data) {
                            manager.send_to(&peer, &reply);
                        }
                    }
                    SessionEvent::ChannelClosed { peer } => {
                        if manager.close_peer(&peer).await {
                            log::info!("peer {} disconnected", peer);
                        }
                    }
                    SessionEvent::LocalCandidate { peer, candidate } => {
                        client.send_signal(peer, SignalData::Ice { candidate });
                    }
                    SessionEvent::LocalUpdate(update) => {
                        manager.broadcast(&engine.update_envelope(update), None);
                    }
                    SessionEvent::LocalPresence(update) => {
                        match update.encode() {
                            Ok(bytes) => {
                                manager.broadcast(&Envelope::Presence(bytes).encode(), None);
                            }
                            Err(e) => log::warn!("failed to encode presence update: {}", e),
                        }
                    }
                    SessionEvent::Shutdown => {
                        // Listeners first: nothing may fire into closing
                        // channels.
                        engine.detach();
                        manager.close_all().await;
                        client.close();
                        break;
                    }
                }
                ready_peers.store(manager.ready_count(), Ordering::SeqCst);
            }
            _ = sweep.tick() => {
                // Keepalive before the sweep: our entry must keep
                // arriving at peers faster than their timeout expires.
                if let Some(keepalive) = engine.presence_keepalive() {
                    manager.broadcast(&keepalive, None);
                }
                let removed = engine.sweep_presence(config.presence_timeout);
                if !removed.is_empty() {
                    log::debug!("swept {} idle presence entries", removed.len());
                }
                for peer in manager.stalled(config.negotiation_timeout) {
                    log::warn!("peer {} stuck in negotiation, closing", peer);
                    manager.close_peer(&peer).await;
                }
                ready_peers.store(manager.ready_count(), Ordering::SeqCst);
            }
        }
    }
    log::debug!("session task finished");
}

async fn handle_relay_event(
    event: RelayEvent,
    manager: &mut PeerConnectionManager,
    client: &SignalingClient,
    local_id: &Mutex<Option<String>>,
) {
    match event {
        RelayEvent::Connected => log::info!("relay link up"),
        RelayEvent::Disconnected => {
            // Existing peer connections keep running; only discovery of
            // new peers pauses until the supervisor reconnects.
            log::warn!("relay link down");
        }
        RelayEvent::Welcome { id, peers } => {
            log::info!("joined room as {} ({} peers present)", id, peers.len());
            *local_id.lock().unwrap_or_else(|e| e.into_inner()) = Some(id);
            // A welcome means a fresh relay session: the room knows us
            // only by the new id, and everyone saw us leave under the
            // old one. Connections from before the rejoin will never be
            // renegotiated by the remote side, even when their channel
            // is still up, so drop them all and start over from the
            // roster.
            if !manager.is_empty() {
                log::info!(
                    "dropping {} stale connections after relay rejoin",
                    manager.len()
                );
                manager.close_all().await;
            }
            // We offer toward everyone already present; later arrivals
            // will offer toward us.
            for peer in peers {
                if let Some(offer) = manager.ensure_offerer(&peer).await {
                    client.send_signal(peer, offer);
                }
            }
        }
        RelayEvent::PeerJoined(id) => {
            log::debug!("peer {} joined, awaiting their offer", id);
        }
        RelayEvent::PeerLeft(id) => {
            if manager.close_peer(&id).await {
                log::info!("peer {} left the room", id);
            }
        }
        RelayEvent::Signal { from, data } => {
            if let Some(reply) = manager.route_signal(&from, data).await {
                client.send_signal(from, reply);
            }
        }
    }
}
