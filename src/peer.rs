//! One WebRTC connection to one remote peer.
//!
//! A peer is either the **offerer** (it was already in the room when the
//! remote joined, creates the data channel and the offer) or the
//! **answerer** (it joined and waits for the inbound offer). Roles come
//! from relay join order, so both sides always agree.
//!
//! Trickled candidates can arrive before the remote description does;
//! they are queued and flushed the moment the description is applied.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::protocol::SignalData;
use crate::session::SessionEvent;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("peer transport error: {0}")]
    Transport(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
}

impl From<webrtc::Error> for PeerError {
    fn from(e: webrtc::Error) -> Self {
        PeerError::Transport(e.to_string())
    }
}

/// Which side of the offer/answer exchange we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    Offerer,
    Answerer,
}

/// Connection lifecycle. `Connected` means the data channel is open,
/// not merely that ICE succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Negotiating,
    Connected,
    Closed,
}

/// Transport knobs shared by every peer in a session.
#[derive(Debug, Clone)]
pub struct PeerSettings {
    pub ice_servers: Vec<String>,
    pub channel_label: String,
    /// Gather loopback candidates. Off in production, needed for tests
    /// where both ends live on 127.0.0.1.
    pub include_loopback: bool,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            channel_label: "vellum".to_string(),
            include_loopback: false,
        }
    }
}

/// State machine for a single remote peer.
pub struct PeerConnection {
    peer_id: String,
    role: PeerRole,
    state: PeerState,
    since: Instant,
    pc: Arc<RTCPeerConnection>,
    channel: Option<Arc<RTCDataChannel>>,
    /// Candidates that arrived before the remote description.
    pending: Vec<RTCIceCandidateInit>,
    remote_set: bool,
    ready: bool,
}

impl PeerConnection {
    /// Build the underlying transport and register its callbacks. The
    /// offerer also creates the data channel here; negotiation itself
    /// starts with [`PeerConnection::start_offer`].
    pub async fn connect(
        peer_id: String,
        role: PeerRole,
        settings: &PeerSettings,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Self, PeerError> {
        let mut media = MediaEngine::default();
        media.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media)?;
        let mut setting = SettingEngine::default();
        if settings.include_loopback {
            setting.set_include_loopback_candidate(true);
        }
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: settings.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await?);

        let id = peer_id.clone();
        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            log::debug!("peer {} connection state: {}", id, state);
            if matches!(
                state,
                RTCPeerConnectionState::Failed
                    | RTCPeerConnectionState::Disconnected
                    | RTCPeerConnectionState::Closed
            ) {
                let _ = tx.send(SessionEvent::ChannelClosed { peer: id.clone() });
            }
            Box::pin(async {})
        }));

        let id = peer_id.clone();
        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(SessionEvent::LocalCandidate {
                            peer: id.clone(),
                            candidate: init,
                        });
                    }
                    Err(e) => log::debug!("skipping unserializable candidate: {}", e),
                }
            }
            Box::pin(async {})
        }));

        let channel = match role {
            PeerRole::Offerer => {
                let dc = pc
                    .create_data_channel(
                        &settings.channel_label,
                        Some(RTCDataChannelInit {
                            ordered: Some(true),
                            ..Default::default()
                        }),
                    )
                    .await?;
                Self::attach_channel(&dc, peer_id.clone(), events.clone());
                Some(dc)
            }
            PeerRole::Answerer => {
                let id = peer_id.clone();
                let tx = events.clone();
                pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                    Self::attach_channel(&dc, id.clone(), tx.clone());
                    Box::pin(async {})
                }));
                None
            }
        };

        Ok(Self {
            peer_id,
            role,
            state: PeerState::New,
            since: Instant::now(),
            pc,
            channel,
            pending: Vec::new(),
            remote_set: false,
            ready: false,
        })
    }

    /// Wire the per-channel callbacks into the session queue.
    fn attach_channel(
        dc: &Arc<RTCDataChannel>,
        peer_id: String,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) {
        let id = peer_id.clone();
        let tx = events.clone();
        let channel = dc.clone();
        dc.on_open(Box::new(move || {
            let _ = tx.send(SessionEvent::ChannelOpen {
                peer: id,
                channel,
            });
            Box::pin(async {})
        }));

        let id = peer_id.clone();
        let tx = events.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let _ = tx.send(SessionEvent::ChannelMessage {
                peer: id.clone(),
                data: msg.data.to_vec(),
            });
            Box::pin(async {})
        }));

        let id = peer_id;
        dc.on_close(Box::new(move || {
            let _ = events.send(SessionEvent::ChannelClosed { peer: id.clone() });
            Box::pin(async {})
        }));
    }

    /// Offerer: produce the offer to relay to the remote peer.
    pub async fn start_offer(&mut self) -> Result<SignalData, PeerError> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer).await?;
        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| PeerError::Negotiation("no local description".to_string()))?;
        self.transition(PeerState::Negotiating);
        Ok(SignalData::Offer { sdp: local.sdp })
    }

    /// Answerer: apply the remote offer and produce our answer.
    pub async fn accept_offer(&mut self, sdp: String) -> Result<SignalData, PeerError> {
        let offer = RTCSessionDescription::offer(sdp)
            .map_err(|e| PeerError::Negotiation(e.to_string()))?;
        self.pc.set_remote_description(offer).await?;
        self.remote_description_applied().await;

        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer).await?;
        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| PeerError::Negotiation("no local description".to_string()))?;
        self.transition(PeerState::Negotiating);
        Ok(SignalData::Answer { sdp: local.sdp })
    }

    /// Offerer: apply the remote answer.
    pub async fn accept_answer(&mut self, sdp: String) -> Result<(), PeerError> {
        let answer = RTCSessionDescription::answer(sdp)
            .map_err(|e| PeerError::Negotiation(e.to_string()))?;
        self.pc.set_remote_description(answer).await?;
        self.remote_description_applied().await;
        Ok(())
    }

    /// Add a trickled candidate, queueing it if the remote description
    /// has not been applied yet.
    pub async fn add_candidate(&mut self, candidate: RTCIceCandidateInit) {
        if !self.remote_set {
            self.pending.push(candidate);
            return;
        }
        if let Err(e) = self.pc.add_ice_candidate(candidate).await {
            log::debug!("peer {}: rejected candidate: {}", self.peer_id, e);
        }
    }

    async fn remote_description_applied(&mut self) {
        self.remote_set = true;
        for candidate in std::mem::take(&mut self.pending) {
            if let Err(e) = self.pc.add_ice_candidate(candidate).await {
                log::debug!("peer {}: rejected queued candidate: {}", self.peer_id, e);
            }
        }
    }

    /// Record the opened data channel. Returns `true` on the first open
    /// only, so the sync handshake fires exactly once per connection.
    pub fn mark_open(&mut self, channel: Arc<RTCDataChannel>) -> bool {
        if self.ready {
            return false;
        }
        self.channel = Some(channel);
        self.ready = true;
        self.transition(PeerState::Connected);
        true
    }

    /// Send bytes over the data channel. Fire-and-forget: failures close
    /// the channel and surface through its close callback.
    pub fn send(&self, data: Bytes) {
        if !self.ready {
            return;
        }
        if let Some(dc) = &self.channel {
            let dc = dc.clone();
            let id = self.peer_id.clone();
            tokio::spawn(async move {
                if let Err(e) = dc.send(&data).await {
                    log::debug!("peer {}: send failed: {}", id, e);
                }
            });
        }
    }

    pub async fn close(&mut self) {
        self.ready = false;
        if let Some(dc) = self.channel.take() {
            let _ = dc.close().await;
        }
        if let Err(e) = self.pc.close().await {
            log::debug!("peer {}: close error: {}", self.peer_id, e);
        }
        self.transition(PeerState::Closed);
    }

    fn transition(&mut self, next: PeerState) {
        if self.state != next {
            log::debug!(
                "peer {}: {:?} -> {:?}",
                self.peer_id,
                self.state,
                next
            );
            self.state = next;
            self.since = Instant::now();
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Time spent in the current state.
    pub fn state_age(&self) -> std::time::Duration {
        self.since.elapsed()
    }

    #[cfg(test)]
    pub(crate) fn pending_candidates(&self) -> usize {
        self.pending.len()
    }
}
