//! Ownership of the full peer set and routing of negotiation signals.
//!
//! The manager is plain state driven by the session task — it spawns no
//! tasks of its own. Answerer connections are created lazily when the
//! first offer from an unknown peer arrives.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use webrtc::data_channel::RTCDataChannel;

use crate::peer::{PeerConnection, PeerRole, PeerSettings, PeerState};
use crate::protocol::SignalData;
use crate::session::SessionEvent;

pub struct PeerConnectionManager {
    peers: HashMap<String, PeerConnection>,
    settings: PeerSettings,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl PeerConnectionManager {
    pub fn new(settings: PeerSettings, events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            peers: HashMap::new(),
            settings,
            events,
        }
    }

    /// Create an offerer connection toward `id` and return the offer to
    /// relay. Idempotent: an already-known peer returns `None`.
    pub async fn ensure_offerer(&mut self, id: &str) -> Option<SignalData> {
        if self.peers.contains_key(id) {
            return None;
        }
        let mut peer = match PeerConnection::connect(
            id.to_string(),
            PeerRole::Offerer,
            &self.settings,
            self.events.clone(),
        )
        .await
        {
            Ok(peer) => peer,
            Err(e) => {
                log::warn!("failed to create connection to {}: {}", id, e);
                return None;
            }
        };
        match peer.start_offer().await {
            Ok(offer) => {
                self.peers.insert(id.to_string(), peer);
                Some(offer)
            }
            Err(e) => {
                log::warn!("offer to {} failed: {}", id, e);
                peer.close().await;
                None
            }
        }
    }

    /// Apply an inbound signal. Returns the reply to relay back to the
    /// sender, if any (an answer, for a fresh offer).
    pub async fn route_signal(&mut self, from: &str, data: SignalData) -> Option<SignalData> {
        match data {
            SignalData::Offer { sdp } => {
                if self.peers.contains_key(from) {
                    // Roles come from join order, so a second offer means
                    // a confused or stale peer. Drop it.
                    log::warn!("ignoring offer from already-known peer {}", from);
                    return None;
                }
                let mut peer = match PeerConnection::connect(
                    from.to_string(),
                    PeerRole::Answerer,
                    &self.settings,
                    self.events.clone(),
                )
                .await
                {
                    Ok(peer) => peer,
                    Err(e) => {
                        log::warn!("failed to create connection to {}: {}", from, e);
                        return None;
                    }
                };
                match peer.accept_offer(sdp).await {
                    Ok(answer) => {
                        self.peers.insert(from.to_string(), peer);
                        Some(answer)
                    }
                    Err(e) => {
                        log::warn!("answering {} failed: {}", from, e);
                        peer.close().await;
                        None
                    }
                }
            }
            SignalData::Answer { sdp } => {
                match self.peers.get_mut(from) {
                    Some(peer) => {
                        if let Err(e) = peer.accept_answer(sdp).await {
                            log::warn!("answer from {} rejected: {}", from, e);
                        }
                    }
                    None => log::debug!("answer from unknown peer {}", from),
                }
                None
            }
            SignalData::Ice { candidate } => {
                match self.peers.get_mut(from) {
                    Some(peer) => peer.add_candidate(candidate).await,
                    None => log::debug!("candidate from unknown peer {}", from),
                }
                None
            }
        }
    }

    /// Record a peer's data channel as open. Returns `true` only on the
    /// first open for that connection.
    pub fn handle_channel_open(&mut self, id: &str, channel: Arc<RTCDataChannel>) -> bool {
        match self.peers.get_mut(id) {
            Some(peer) => peer.mark_open(channel),
            None => {
                log::debug!("channel open for unknown peer {}", id);
                false
            }
        }
    }

    /// Tear down one peer. Returns whether it existed.
    pub async fn close_peer(&mut self, id: &str) -> bool {
        match self.peers.remove(id) {
            Some(mut peer) => {
                peer.close().await;
                true
            }
            None => false,
        }
    }

    /// Send to every ready peer, optionally excluding one (the peer a
    /// message came from).
    pub fn broadcast(&self, data: &[u8], exclude: Option<&str>) {
        let payload = Bytes::copy_from_slice(data);
        for (id, peer) in &self.peers {
            if exclude == Some(id.as_str()) || !peer.is_ready() {
                continue;
            }
            peer.send(payload.clone());
        }
    }

    /// Send to a single peer if it is ready.
    pub fn send_to(&self, id: &str, data: &[u8]) {
        if let Some(peer) = self.peers.get(id) {
            peer.send(Bytes::copy_from_slice(data));
        }
    }

    pub async fn close_all(&mut self) {
        for (_, mut peer) in self.peers.drain() {
            peer.close().await;
        }
    }

    /// Peers stuck in negotiation longer than `timeout`.
    pub fn stalled(&self, timeout: Duration) -> Vec<String> {
        self.peers
            .values()
            .filter(|p| p.state() == PeerState::Negotiating && p.state_age() > timeout)
            .map(|p| p.peer_id().to_string())
            .collect()
    }

    pub fn ready_count(&self) -> usize {
        self.peers.values().filter(|p| p.is_ready()).count()
    }

    pub fn ready_peers(&self) -> Vec<String> {
        self.peers
            .values()
            .filter(|p| p.is_ready())
            .map(|p| p.peer_id().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.peers.contains_key(id)
    }
}
