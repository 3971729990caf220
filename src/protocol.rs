//! Wire formats for the relay link and the peer data channel.
//!
//! Two entirely separate planes:
//!
//! - **Relay frames** — JSON over the relay WebSocket. Session discovery
//!   (`welcome`, `peer-joined`, `peer-left`) and opaque negotiation
//!   payloads (`signal`). The relay never sees document content.
//! - **Envelopes** — binary over the peer data channel:
//!   ```text
//!   ┌──────────────┬───────────────────┬───────────────────┐
//!   │ kind varint  │ sync tag varint   │ payload           │
//!   │ 0=sync 1=pres│ (sync only) 0/1/2 │ opaque, unbounded │
//!   └──────────────┴───────────────────┴───────────────────┘
//!   ```
//!   Payloads are whatever the document/presence codec produced; the
//!   channel is ordered and reliable so no sequence numbers are carried.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

/// Protocol errors. Callers on the receive path drop and log rather than
/// propagate — a hostile or buggy peer must not take a connection down.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("truncated message")]
    Truncated,
    #[error("varint overflow")]
    VarintOverflow,
    #[error("unknown envelope kind {0}")]
    UnknownKind(u64),
    #[error("unknown sync tag {0}")]
    UnknownSyncTag(u64),
    #[error("presence codec error: {0}")]
    Presence(String),
}

// ───────────────────────────────────────────────────────────────────
// Relay frames (JSON)
// ───────────────────────────────────────────────────────────────────

/// Negotiation payload relayed between two peers, byte-for-byte opaque
/// to the relay itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalData {
    /// Session description from the offering side.
    Offer { sdp: String },
    /// Session description answering an offer.
    Answer { sdp: String },
    /// Trickled network candidate.
    Ice { candidate: RTCIceCandidateInit },
}

/// Relay → client frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RelayFrame {
    /// Sent once on join: our relay-assigned id plus the current roster.
    /// We become the offerer toward every listed peer.
    Welcome { id: String, peers: Vec<String> },
    /// A new participant joined; we wait for their offer.
    PeerJoined { id: String },
    /// A participant left; tear the peer down.
    PeerLeft { id: String },
    /// Negotiation payload from another peer.
    Signal {
        to: String,
        from: String,
        data: SignalData,
    },
}

/// Client → relay frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientFrame {
    Signal { to: String, data: SignalData },
}

// ───────────────────────────────────────────────────────────────────
// Peer-channel envelopes (binary)
// ───────────────────────────────────────────────────────────────────

const KIND_SYNC: u64 = 0;
const KIND_PRESENCE: u64 = 1;

const SYNC_STATE_VECTOR: u64 = 0;
const SYNC_DIFF: u64 = 1;
const SYNC_UPDATE: u64 = 2;

/// The unit sent over a peer data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    /// Handshake step 1: our state vector, sent once when the channel
    /// opens. The receiver answers with [`Envelope::SyncStep2`].
    SyncStep1(Vec<u8>),
    /// Handshake step 2: the diff the requesting peer is missing.
    /// Returned to the originating peer only, never broadcast.
    SyncStep2(Vec<u8>),
    /// Incremental document update, broadcast to all ready peers.
    SyncUpdate(Vec<u8>),
    /// Presence update (encoded [`crate::presence::PresenceUpdate`]).
    Presence(Vec<u8>),
}

impl Envelope {
    /// Serialize to the binary channel format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + self.payload().len());
        match self {
            Envelope::SyncStep1(p) => {
                write_varint(&mut buf, KIND_SYNC);
                write_varint(&mut buf, SYNC_STATE_VECTOR);
                buf.extend_from_slice(p);
            }
            Envelope::SyncStep2(p) => {
                write_varint(&mut buf, KIND_SYNC);
                write_varint(&mut buf, SYNC_DIFF);
                buf.extend_from_slice(p);
            }
            Envelope::SyncUpdate(p) => {
                write_varint(&mut buf, KIND_SYNC);
                write_varint(&mut buf, SYNC_UPDATE);
                buf.extend_from_slice(p);
            }
            Envelope::Presence(p) => {
                write_varint(&mut buf, KIND_PRESENCE);
                buf.extend_from_slice(p);
            }
        }
        buf
    }

    /// Deserialize from the binary channel format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut pos = 0;
        let kind = read_varint(bytes, &mut pos)?;
        match kind {
            KIND_SYNC => {
                let tag = read_varint(bytes, &mut pos)?;
                let payload = bytes[pos..].to_vec();
                match tag {
                    SYNC_STATE_VECTOR => Ok(Envelope::SyncStep1(payload)),
                    SYNC_DIFF => Ok(Envelope::SyncStep2(payload)),
                    SYNC_UPDATE => Ok(Envelope::SyncUpdate(payload)),
                    other => Err(ProtocolError::UnknownSyncTag(other)),
                }
            }
            KIND_PRESENCE => Ok(Envelope::Presence(bytes[pos..].to_vec())),
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }

    fn payload(&self) -> &[u8] {
        match self {
            Envelope::SyncStep1(p)
            | Envelope::SyncStep2(p)
            | Envelope::SyncUpdate(p)
            | Envelope::Presence(p) => p,
        }
    }
}

/// LEB128 unsigned varint.
pub(crate) fn write_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

pub(crate) fn read_varint(bytes: &[u8], pos: &mut usize) -> Result<u64, ProtocolError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *bytes.get(*pos).ok_or(ProtocolError::Truncated)?;
        *pos += 1;
        if shift >= 64 {
            return Err(ProtocolError::VarintOverflow);
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}
