//! The negotiable media connection a record drives.
//!
//! Implementations own the actual peer-to-peer transport. They buffer remote
//! ICE candidates that arrive before a remote description and apply them
//! once one is set; callers never reorder candidates themselves.

use async_trait::async_trait;
use covoice_core::{IceCandidate, ParticipantId};
use covoice_media::{LocalTrackView, RemoteAudioStream};
use tokio::sync::mpsc;

use crate::error::TransportError;

/// Asynchronous notifications from a connection
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A local candidate to trickle to the remote side
    LocalCandidate(IceCandidate),
    RemoteTrack(RemoteAudioStream),
    Connected,
    Failed(String),
}

#[async_trait]
pub trait MediaConnection: Send + Sync {
    /// Publish the shared local track on this connection
    async fn attach_local_track(&self, track: LocalTrackView) -> Result<(), TransportError>;

    /// Create an offer, set it as local description and return its SDP
    async fn create_offer(&self) -> Result<String, TransportError>;

    /// Apply a remote offer, then create, apply and return the answer SDP
    async fn accept_offer(&self, sdp: String) -> Result<String, TransportError>;

    async fn accept_answer(&self, sdp: String) -> Result<(), TransportError>;

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Release the transport. Idempotent.
    async fn close(&self);
}

/// A freshly built connection and its event stream
pub struct NewConnection {
    pub connection: Box<dyn MediaConnection>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create(&self, participant: &ParticipantId) -> Result<NewConnection, TransportError>;
}
