//! Peer connection records and signal routing.

use std::fmt;

use covoice_core::config::GlarePolicy;
use covoice_core::{ParticipantId, SignalKind};
use covoice_media::RemoteAudioStream;
use serde::{Deserialize, Serialize};

use crate::error::RoutingMiss;

/// Which side initiated the negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    Offerer,
    Answerer,
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offerer => write!(f, "offerer"),
            Self::Answerer => write!(f, "answerer"),
        }
    }
}

/// Record lifecycle: `Negotiating -> Connected -> Closed`, with `Failed`
/// reachable from either of the first two
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    Negotiating,
    Connected,
    Failed,
    Closed,
}

impl PeerState {
    /// Whether the record still takes part in negotiation and audio routing
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Negotiating | Self::Connected)
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Negotiating => write!(f, "negotiating"),
            Self::Connected => write!(f, "connected"),
            Self::Failed => write!(f, "failed"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Point-in-time view of one record
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub participant_id: ParticipantId,
    pub role: PeerRole,
    pub state: PeerState,
    pub local_tracks_attached: bool,
    pub remote_stream: Option<RemoteAudioStream>,
    /// Offerer only: an answer has not been accepted yet
    pub awaiting_answer: bool,
    pub failure: Option<String>,
}

impl PeerSnapshot {
    #[must_use]
    pub fn new(participant_id: ParticipantId, role: PeerRole) -> Self {
        Self {
            participant_id,
            role,
            state: PeerState::Negotiating,
            local_tracks_attached: false,
            remote_stream: None,
            awaiting_answer: role == PeerRole::Offerer,
            failure: None,
        }
    }

    #[must_use]
    pub fn status(&self) -> RecordStatus {
        RecordStatus {
            role: self.role,
            state: self.state,
            awaiting_answer: self.awaiting_answer,
        }
    }
}

/// The routing-relevant part of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordStatus {
    pub role: PeerRole,
    pub state: PeerState,
    pub awaiting_answer: bool,
}

/// What the manager knows about the sender of a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordLookup {
    Missing,
    /// Closed earlier and not rejoined since
    Tombstoned,
    Live(RecordStatus),
}

/// How an offer crossing our own unanswered offer is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlareResolution {
    /// Drop the remote offer and keep waiting for an answer
    Ignore,
    /// Give up our offer and answer theirs
    Yield,
    /// Drop the remote offer and send ours again, in case it was lost
    Insist,
}

impl GlareResolution {
    /// Resolution for `local` receiving a crossing offer from `remote`
    /// under `policy`: the lower id keeps offering.
    #[must_use]
    pub fn for_pair(policy: GlarePolicy, local: &ParticipantId, remote: &ParticipantId) -> Self {
        match policy {
            GlarePolicy::Ignore => Self::Ignore,
            GlarePolicy::LowerIdOffers if local > remote => Self::Yield,
            GlarePolicy::LowerIdOffers => Self::Insist,
        }
    }
}

/// Routing decision for one inbound signal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Offer from a participant with no record
    CreateAnswerer,
    /// Offer that supersedes the existing record: glare we yield on, or a
    /// fresh offer after our side failed
    ReplaceWithAnswerer,
    /// Glare we win: repeat our offer and candidates
    ResendOffer,
    AcceptAnswer,
    AddCandidate,
    Drop(RoutingMiss),
}

/// Decide what to do with a signal of `kind` from `from`.
#[must_use]
pub fn route(
    lookup: &RecordLookup,
    from: &ParticipantId,
    kind: SignalKind,
    glare: GlareResolution,
) -> Route {
    let status = match lookup {
        RecordLookup::Tombstoned => return Route::Drop(RoutingMiss::Closed(from.clone())),
        RecordLookup::Missing => {
            return match kind {
                SignalKind::Offer => Route::CreateAnswerer,
                _ => Route::Drop(RoutingMiss::UnknownParticipant {
                    participant: from.clone(),
                    kind,
                }),
            };
        }
        RecordLookup::Live(status) => *status,
    };

    let invalid = || {
        Route::Drop(RoutingMiss::InvalidForState {
            kind,
            role: status.role,
            state: status.state,
        })
    };

    match (kind, status.role, status.state) {
        (SignalKind::Offer, _, PeerState::Failed) => Route::ReplaceWithAnswerer,
        (SignalKind::Offer, PeerRole::Offerer, PeerState::Negotiating)
            if status.awaiting_answer =>
        {
            match glare {
                GlareResolution::Ignore => Route::Drop(RoutingMiss::Glare(from.clone())),
                GlareResolution::Yield => Route::ReplaceWithAnswerer,
                GlareResolution::Insist => Route::ResendOffer,
            }
        }
        (SignalKind::Offer, _, _) => invalid(),

        (SignalKind::Answer, PeerRole::Offerer, PeerState::Negotiating) => {
            if status.awaiting_answer {
                Route::AcceptAnswer
            } else {
                Route::Drop(RoutingMiss::DuplicateAnswer(from.clone()))
            }
        }
        (SignalKind::Answer, _, _) => invalid(),

        (SignalKind::IceCandidate, _, state) if state.is_active() => Route::AddCandidate,
        (SignalKind::IceCandidate, _, _) => invalid(),
    }
}
