//! Host transport capability.
//!
//! The controller never touches a real-time media stack directly; it drives a
//! [`PeerTransport`] and listens to the [`TransportEvent`]s the transport
//! pushes into the channel it was created with.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::IceServer;
use crate::error::Result;
use crate::media::{CaptureTrack, MediaKind};
use crate::signaling::{IceCandidate, SessionDescription};

/// An inbound media track from the remote participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTrack {
    /// Transport-assigned track id
    pub id: String,
    /// Audio or video
    pub kind: MediaKind,
}

/// Events the transport raises while negotiating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A local candidate was gathered and should be published to the peer
    LocalCandidate(IceCandidate),
    /// An inbound track arrived
    RemoteTrack(RemoteTrack),
}

/// A single peer connection.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Attach a local track for sending.
    async fn add_track(&self, track: Arc<dyn CaptureTrack>) -> Result<()>;

    /// Create an offer (does not apply it).
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Create an answer to the applied remote offer (does not apply it).
    async fn create_answer(&self) -> Result<SessionDescription>;

    /// Apply a local description; candidate gathering starts here.
    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    /// Apply the peer's description.
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    /// Whether a remote description has been applied.
    fn has_remote_description(&self) -> bool;

    /// Apply a peer candidate. Candidates received before the remote
    /// description are queued by the transport.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Close the connection. Idempotent.
    async fn close(&self);
}

/// Creates transports for new calls.
pub trait TransportFactory: Send + Sync {
    /// Create a transport that reports its events on `events`.
    fn create(
        &self,
        ice_servers: &[IceServer],
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>>;
}
