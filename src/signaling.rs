//! Relay client: one WebSocket to the signaling relay, scoped to a room.
//!
//! The client translates relay frames into [`RelayEvent`]s on the session
//! queue and carries outbound negotiation payloads. It holds no document
//! or peer state — losing the relay only pauses discovery of *new* peers.

use std::sync::Mutex;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::protocol::{ClientFrame, RelayFrame, SignalData};
use crate::session::SessionEvent;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("relay connect failed: {0}")]
    Connect(String),
    #[error("relay transport error: {0}")]
    Transport(String),
}

/// Relay-side happenings, delivered through the session queue.
#[derive(Debug)]
pub enum RelayEvent {
    /// The relay link came up.
    Connected,
    /// The relay link went down. Established peers are unaffected.
    Disconnected,
    /// Our assigned id plus everyone already in the room.
    Welcome { id: String, peers: Vec<String> },
    PeerJoined(String),
    PeerLeft(String),
    /// Negotiation payload from another peer.
    Signal { from: String, data: SignalData },
}

/// Client for the signaling relay.
///
/// [`SignalingClient::run_once`] drives one connection lifetime; the
/// [`crate::reconnect::ReconnectSupervisor`] calls it in a loop.
pub struct SignalingClient {
    url: String,
    room: String,
    outbound: Mutex<Option<mpsc::UnboundedSender<ClientFrame>>>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SignalingClient {
    pub fn new(url: String, room: String, events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            url,
            room,
            outbound: Mutex::new(None),
            events,
        }
    }

    /// Connect to the relay and pump frames until the connection ends.
    ///
    /// Returns `Ok(())` when an established connection closed (clean or
    /// not) and `Err` when the connection never came up.
    pub async fn run_once(&self) -> Result<(), SignalingError> {
        let url = format!("{}/{}", self.url.trim_end_matches('/'), self.room);
        let (ws, _) = connect_async(&url)
            .await
            .map_err(|e| SignalingError::Connect(e.to_string()))?;
        log::info!("connected to relay at {}", url);

        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<ClientFrame>();
        self.set_outbound(Some(tx));
        self.emit(RelayEvent::Connected);

        loop {
            tokio::select! {
                incoming = stream.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<RelayFrame>(text.as_str()) {
                                Ok(frame) => self.emit(RelayEvent::from(frame)),
                                Err(e) => {
                                    log::debug!("dropping malformed relay frame: {}", e);
                                }
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            if sink.send(Message::Pong(payload)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("relay closed the connection");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            log::warn!("relay transport error: {}", e);
                            break;
                        }
                    }
                }
                frame = rx.recv() => {
                    match frame {
                        Some(frame) => {
                            let json = match serde_json::to_string(&frame) {
                                Ok(json) => json,
                                Err(e) => {
                                    log::warn!("failed to encode relay frame: {}", e);
                                    continue;
                                }
                            };
                            if sink.send(Message::Text(json.into())).await.is_err() {
                                break;
                            }
                        }
                        // Sender side dropped: the session told us to stop.
                        None => break,
                    }
                }
            }
        }

        self.set_outbound(None);
        self.emit(RelayEvent::Disconnected);
        Ok(())
    }

    /// Send a negotiation payload to a peer through the relay.
    /// Best-effort: silently dropped while the relay link is down.
    pub fn send_signal(&self, to: String, data: SignalData) {
        let guard = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(ClientFrame::Signal { to, data });
        } else {
            log::debug!("relay link down, dropping signal to {}", to);
        }
    }

    /// Tear down the current connection, if any. `run_once` will return
    /// once the writer channel closes.
    pub fn close(&self) {
        self.set_outbound(None);
    }

    fn set_outbound(&self, tx: Option<mpsc::UnboundedSender<ClientFrame>>) {
        *self.outbound.lock().unwrap_or_else(|e| e.into_inner()) = tx;
    }

    fn emit(&self, event: RelayEvent) {
        let _ = self.events.send(SessionEvent::Relay(event));
    }
}

impl From<RelayFrame> for RelayEvent {
    fn from(frame: RelayFrame) -> Self {
        match frame {
            RelayFrame::Welcome { id, peers } => RelayEvent::Welcome { id, peers },
            RelayFrame::PeerJoined { id } => RelayEvent::PeerJoined(id),
            RelayFrame::PeerLeft { id } => RelayEvent::PeerLeft(id),
            RelayFrame::Signal { from, data, .. } => RelayEvent::Signal { from, data },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_once_fails_when_no_relay() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let client = SignalingClient::new(
            "ws://127.0.0.1:1".to_string(),
            "room".to_string(),
            tx,
        );
        assert!(matches!(
            client.run_once().await,
            Err(SignalingError::Connect(_))
        ));
    }

    #[tokio::test]
    async fn test_send_signal_while_down_is_dropped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = SignalingClient::new(
            "ws://127.0.0.1:1".to_string(),
            "room".to_string(),
            tx,
        );
        client.send_signal("peer-1".into(), SignalData::Offer { sdp: "v=0".into() });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_frame_to_event_mapping() {
        let event = RelayEvent::from(RelayFrame::Signal {
            to: "me".into(),
            from: "them".into(),
            data: SignalData::Answer { sdp: "v=0".into() },
        });
        match event {
            RelayEvent::Signal { from, data } => {
                assert_eq!(from, "them");
                assert!(matches!(data, SignalData::Answer { .. }));
            }
            _ => panic!("expected signal event"),
        }
    }
}
