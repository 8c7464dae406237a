//! # Peer Connection
//!
//! Owns the transport for one call and negotiates it through the signaling
//! store.
//!
//! ## Controller States
//!
//! ```text
//!   Idle ──start()──► Negotiating(Caller | Callee) ──answer / remote track──► Connected
//!    │                        │                                                  │
//!    │                        └──────────── end() / session deleted ─────────────┤
//!    │                                                                           ▼
//!    └────────────────────────────── (end() is a no-op) ──────────────────── Closed
//! ```
//!
//! ## Negotiation
//!
//! ```text
//!   Caller                         Store                          Callee
//!     │  create_document(offer)      │                               │
//!     │ ───────────────────────────► │   get_document ◄───────────── │
//!     │                              │   update_document(answer) ◄── │
//!     │  snapshot { answer } ◄────── │                               │
//!     │  callerCandidates/+ ───────► │ ────────────────────────────► │
//!     │ ◄─────────────────────────── │ ◄──────── calleeCandidates/+  │
//! ```

#[cfg(target_arch = "wasm32")]
pub mod browser;
mod controller;
mod tracks;
mod transport;

pub use controller::PeerConnectionController;
pub use transport::{PeerTransport, RemoteTrack, TransportEvent, TransportFactory};

use crate::signaling::Role;

/// Lifecycle of a [`PeerConnectionController`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// Not started
    Idle,
    /// Offer/answer exchange in progress
    Negotiating(Role),
    /// Answer applied or remote media flowing
    Connected,
    /// Ended locally or by the peer
    Closed,
}

impl ControllerState {
    /// Whether the controller is past negotiation setup and not yet closed.
    pub fn is_active(&self) -> bool {
        matches!(self, ControllerState::Negotiating(_) | ControllerState::Connected)
    }
}

/// Media received from the remote participant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteMediaStream {
    /// Inbound tracks in arrival order
    pub tracks: Vec<RemoteTrack>,
}

/// Events raised by a controller.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// The controller moved to a new state
    StateChanged(ControllerState),
    /// The first inbound track arrived
    RemoteStreamReady(RemoteMediaStream),
    /// The session document was deleted by the other side
    PeerEnded,
}
