//! # vellum-collab — Real-time collaboration engine for Vellum
//!
//! Peer-to-peer multiplayer editing: the document replicates through a
//! CRDT (Yrs) and updates propagate over WebRTC data channels. A small
//! WebSocket relay is used only for session discovery and connection
//! negotiation — document content never touches it.
//!
//! ## Architecture
//!
//! ```text
//!                    ┌─────────────┐
//!        JSON frames │ RelayServer │ JSON frames
//!       ┌───────────►│ (signaling) │◄───────────┐
//!       │            └─────────────┘            │
//! ┌─────┴──────┐                          ┌─────┴──────┐
//! │ Session A  │   WebRTC data channel    │ Session B  │
//! │            │◄────────────────────────►│            │
//! │ Yrs Doc    │   binary envelopes       │ Yrs Doc    │
//! │ Presence   │   (sync | presence)      │ Presence   │
//! └────────────┘                          └────────────┘
//! ```
//!
//! Each [`session::Session`] drains a single event queue on one task:
//! relay notifications, channel traffic, and local document/presence
//! changes all funnel through it, so the document is only ever mutated
//! from one place.
//!
//! ## Modules
//!
//! - [`protocol`] — relay JSON frames + binary peer-channel envelope
//! - [`signaling`] — relay client (join/leave/signal routing)
//! - [`reconnect`] — exponential backoff supervision of the relay link
//! - [`peer`] — per-remote-peer WebRTC connection state machine
//! - [`manager`] — peer set ownership, signal dispatch, broadcast
//! - [`presence`] — ephemeral per-participant state with clocked merges
//! - [`engine`] — document sync: handshake, update application, fan-out
//! - [`session`] — public entry point tying everything together
//! - [`relay`] — minimal signaling relay server

pub mod engine;
pub mod manager;
pub mod peer;
pub mod presence;
pub mod protocol;
pub mod reconnect;
pub mod relay;
pub mod session;
pub mod signaling;

// Re-exports for convenience
pub use engine::{EngineError, SyncEngine};
pub use manager::PeerConnectionManager;
pub use peer::{PeerConnection, PeerRole, PeerSettings, PeerState};
pub use presence::{
    CursorRange, PresenceDiff, PresenceEntry, PresenceStore, PresenceUpdate,
};
pub use protocol::{ClientFrame, Envelope, ProtocolError, RelayFrame, SignalData};
pub use reconnect::{Backoff, BackoffConfig, ReconnectSupervisor};
pub use relay::{RelayConfig, RelayServer};
pub use session::{Session, SessionConfig, SessionEvent};
pub use signaling::{RelayEvent, SignalingClient, SignalingError};
