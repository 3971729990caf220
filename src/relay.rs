//! Minimal signaling relay.
//!
//! Rooms are scoped by URL path. The relay mints an opaque id for each
//! connection, tells the newcomer who is already present, fans out
//! join/leave notifications, and forwards `signal` frames byte-for-byte
//! to their addressee. It never inspects negotiation payloads and never
//! carries document content.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{Sink, SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::accept_hdr_async;
use uuid::Uuid;

use crate::protocol::{ClientFrame, RelayFrame};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to bind relay listener: {0}")]
    Bind(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8765".to_string(),
        }
    }
}

type Roster = HashMap<String, mpsc::UnboundedSender<RelayFrame>>;
type Rooms = Arc<RwLock<HashMap<String, Roster>>>;

pub struct RelayServer {
    listener: TcpListener,
    rooms: Rooms,
}

impl RelayServer {
    pub async fn bind(config: RelayConfig) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        Ok(Self {
            listener,
            rooms: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Actual bound address, for `:0` binds.
    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the task is dropped.
    pub async fn run(self) {
        log::info!(
            "relay listening on {}",
            self.listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "<unknown>".to_string())
        );
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    let rooms = self.rooms.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, rooms).await {
                            log::debug!("connection from {} ended with error: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    log::warn!("accept failed: {}", e);
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    rooms: Rooms,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let mut room = String::new();
    let ws = accept_hdr_async(stream, |req: &Request, resp: Response| {
        room = req.uri().path().trim_matches('/').to_string();
        Ok(resp)
    })
    .await?;
    if room.is_empty() {
        room = "default".to_string();
    }

    let id = Uuid::new_v4().to_string();
    let (tx, mut rx) = mpsc::unbounded_channel::<RelayFrame>();

    // Register and capture the roster as it was before we joined.
    let peers: Vec<String> = {
        let mut rooms = rooms.write().await;
        let roster = rooms.entry(room.clone()).or_default();
        let present = roster.keys().cloned().collect();
        roster.insert(id.clone(), tx);
        present
    };
    log::info!("{} joined room '{}' ({} present)", id, room, peers.len());

    let (mut sink, mut stream) = ws.split();
    let welcome = RelayFrame::Welcome {
        id: id.clone(),
        peers,
    };
    if send_frame(&mut sink, &welcome).await.is_err() {
        remove_and_notify(&rooms, &room, &id).await;
        return Ok(());
    }
    fan_out(&rooms, &room, &id, RelayFrame::PeerJoined { id: id.clone() }).await;

    loop {
        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientFrame>(text.as_str()) {
                            Ok(ClientFrame::Signal { to, data }) => {
                                let target = {
                                    let rooms = rooms.read().await;
                                    rooms
                                        .get(&room)
                                        .and_then(|roster| roster.get(&to))
                                        .cloned()
                                };
                                match target {
                                    Some(target) => {
                                        let _ = target.send(RelayFrame::Signal {
                                            to,
                                            from: id.clone(),
                                            data,
                                        });
                                    }
                                    None => {
                                        log::debug!("signal from {} to unknown peer {}", id, to);
                                    }
                                }
                            }
                            Err(e) => log::debug!("dropping malformed frame from {}: {}", id, e),
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::debug!("transport error for {}: {}", id, e);
                        break;
                    }
                }
            }
            frame = rx.recv() => {
                match frame {
                    Some(frame) => {
                        if send_frame(&mut sink, &frame).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    remove_and_notify(&rooms, &room, &id).await;
    log::info!("{} left room '{}'", id, room);
    Ok(())
}

async fn send_frame<S>(
    sink: &mut S,
    frame: &RelayFrame,
) -> Result<(), tokio_tungstenite::tungstenite::Error>
where
    S: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let json = serde_json::to_string(frame)
        .map_err(|e| tokio_tungstenite::tungstenite::Error::Io(std::io::Error::other(e)))?;
    sink.send(Message::Text(json.into())).await
}

/// Send `frame` to everyone in the room except `exclude`.
async fn fan_out(rooms: &Rooms, room: &str, exclude: &str, frame: RelayFrame) {
    let rooms = rooms.read().await;
    if let Some(roster) = rooms.get(room) {
        for (peer, tx) in roster {
            if peer != exclude {
                let _ = tx.send(frame.clone());
            }
        }
    }
}

async fn remove_and_notify(rooms: &Rooms, room: &str, id: &str) {
    {
        let mut rooms = rooms.write().await;
        if let Some(roster) = rooms.get_mut(room) {
            roster.remove(id);
            if roster.is_empty() {
                rooms.remove(room);
            }
        }
    }
    fan_out(rooms, room, id, RelayFrame::PeerLeft { id: id.to_string() }).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_to_free_port() {
        let server = RelayServer::bind(RelayConfig {
            bind_addr: "127.0.0.1:0".to_string(),
        })
        .await
        .unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_error() {
        let server = RelayServer::bind(RelayConfig {
            bind_addr: "127.0.0.1:0".to_string(),
        })
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        let conflict = RelayServer::bind(RelayConfig {
            bind_addr: addr.to_string(),
        })
        .await;
        assert!(matches!(conflict, Err(RelayError::Bind(_))));
    }
}
