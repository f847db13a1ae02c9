use covoice_core::{ParticipantId, SignalError, SignalKind};
use thiserror::Error;

use crate::peer::{PeerRole, PeerState};

/// Errors raised by a media connection implementation
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection setup failed: {0}")]
    Setup(String),

    #[error("Session description error: {0}")]
    Description(String),

    #[error("ICE candidate error: {0}")]
    Candidate(String),

    #[error("Track error: {0}")]
    Track(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Connection closed")]
    Closed,
}

/// Why a record ended up `Failed`. Never leaves the record it belongs to.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NegotiationFailure {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Signal send failed: {0}")]
    Signal(#[from] SignalError),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
}

/// A signal that could not be applied. Logged and dropped, never raised.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoutingMiss {
    #[error("Signal from local participant")]
    FromSelf,

    #[error("Participant {0} was closed")]
    Closed(ParticipantId),

    #[error("No record for {participant}, dropping {kind}")]
    UnknownParticipant {
        participant: ParticipantId,
        kind: SignalKind,
    },

    #[error("Glare with {0}: both sides offered")]
    Glare(ParticipantId),

    #[error("{kind} not valid for {role} record in state {state}")]
    InvalidForState {
        kind: SignalKind,
        role: PeerRole,
        state: PeerState,
    },

    #[error("Duplicate answer from {0}")]
    DuplicateAnswer(ParticipantId),
}
