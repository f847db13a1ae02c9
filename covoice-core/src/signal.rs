//! Signal payloads and the channel that carries them between participants.
//!
//! The wire shape of a payload is `{"type": "...", "payload": {...}}` with
//! `type` one of `offer`, `answer` or `ice-candidate`. The channel guarantees
//! per-sender ordering only; it does not authenticate senders.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::SignalError;
use crate::types::ParticipantId;

/// ICE candidate as exchanged over the signal channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Negotiation message body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum SignalPayload {
    Offer { sdp: String },
    Answer { sdp: String },
    IceCandidate(IceCandidate),
}

/// Discriminant of a [`SignalPayload`], used in logs and routing errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl SignalKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice-candidate",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SignalPayload {
    #[must_use]
    pub const fn kind(&self) -> SignalKind {
        match self {
            Self::Offer { .. } => SignalKind::Offer,
            Self::Answer { .. } => SignalKind::Answer,
            Self::IceCandidate(_) => SignalKind::IceCandidate,
        }
    }
}

/// A signal addressed to one participant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundSignal {
    pub to: ParticipantId,
    pub payload: SignalPayload,
}

/// A signal delivered by the channel, tagged with its sender
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundSignal {
    pub from: ParticipantId,
    pub payload: SignalPayload,
}

/// Outbound half of the signaling bus.
///
/// Inbound signals are delivered by the embedding application calling into
/// the voice session; this trait only covers sending.
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait SignalChannel: Send + Sync {
    async fn send_signal(&self, signal: OutboundSignal) -> Result<(), SignalError>;
}

/// In-process signal bus.
///
/// Every registered participant gets an unbounded inbox; sending looks the
/// recipient up and pushes an [`InboundSignal`] tagged with the sender.
#[derive(Clone, Default)]
pub struct LocalSignalBus {
    inboxes: Arc<DashMap<ParticipantId, mpsc::UnboundedSender<InboundSignal>>>,
}

impl LocalSignalBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a participant, replacing any previous inbox under the same id
    pub fn register(
        &self,
        id: ParticipantId,
    ) -> (BusEndpoint, mpsc::UnboundedReceiver<InboundSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.inboxes.insert(id.clone(), tx).is_some() {
            debug!(participant = %id, "Replaced existing signal inbox");
        }
        let endpoint = BusEndpoint {
            local: id,
            bus: self.clone(),
        };
        (endpoint, rx)
    }

    pub fn unregister(&self, id: &ParticipantId) {
        self.inboxes.remove(id);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inboxes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inboxes.is_empty()
    }
}

/// A participant's handle onto a [`LocalSignalBus`]
#[derive(Clone)]
pub struct BusEndpoint {
    local: ParticipantId,
    bus: LocalSignalBus,
}

impl BusEndpoint {
    #[must_use]
    pub fn local_id(&self) -> &ParticipantId {
        &self.local
    }
}

#[async_trait]
impl SignalChannel for BusEndpoint {
    async fn send_signal(&self, signal: OutboundSignal) -> Result<(), SignalError> {
        let OutboundSignal { to, payload } = signal;
        let kind = payload.kind();

        let Some(inbox) = self.bus.inboxes.get(&to).map(|entry| entry.value().clone()) else {
            warn!(from = %self.local, to = %to, kind = %kind, "Signal for unknown recipient");
            return Err(SignalError::UnknownRecipient(to));
        };

        inbox
            .send(InboundSignal {
                from: self.local.clone(),
                payload,
            })
            .map_err(|_| SignalError::ChannelClosed(to.clone()))?;

        debug!(from = %self.local, to = %to, kind = %kind, "Signal delivered");
        Ok(())
    }
}
