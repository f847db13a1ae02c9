//! Peer connections of a voice session
//!
//! A voice session keeps one negotiable media connection per remote
//! participant. This crate holds:
//!
//! - the transport seam ([`MediaConnection`], [`ConnectionFactory`]) and its
//!   webrtc-rs implementation
//! - the per-participant record state machine and the signal router
//! - [`PeerConnectionManager`], which owns the records and their tasks

pub mod error;
pub mod manager;
mod negotiation;
pub mod peer;
pub mod transport;
pub mod voice_codec;
pub mod webrtc_transport;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::{NegotiationFailure, RoutingMiss, TransportError};
pub use manager::{ManagerSettings, PeerConnectionManager, PeerEvent};
pub use peer::{
    route, GlareResolution, PeerRole, PeerSnapshot, PeerState, RecordLookup, RecordStatus, Route,
};
pub use transport::{ConnectionFactory, MediaConnection, NewConnection, TransportEvent};
pub use webrtc_transport::{WebRtcConnection, WebRtcConnectionFactory};
