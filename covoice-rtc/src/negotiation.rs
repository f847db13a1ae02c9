//! The task that drives one record through negotiation.

use std::sync::Arc;

use covoice_core::{
    IceCandidate, OutboundSignal, ParticipantId, SignalChannel, SignalPayload,
};
use covoice_media::LocalTrackView;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::NegotiationFailure;
use crate::manager::PeerEvent;
use crate::peer::{PeerRole, PeerSnapshot, PeerState};
use crate::transport::{ConnectionFactory, MediaConnection, TransportEvent};

/// Work routed to a record after it was created
#[derive(Debug)]
pub(crate) enum PeerCommand {
    AcceptAnswer(String),
    AddCandidate(IceCandidate),
    /// Repeat the offer and every local candidate sent so far
    ResendOffer,
}

/// How the record opens the negotiation
#[derive(Debug)]
pub(crate) enum Opening {
    SendOffer,
    AnswerOffer(String),
}

impl Opening {
    pub(crate) const fn role(&self) -> PeerRole {
        match self {
            Self::SendOffer => PeerRole::Offerer,
            Self::AnswerOffer(_) => PeerRole::Answerer,
        }
    }
}

enum Exit {
    Cancelled,
    Failed(NegotiationFailure),
}

pub(crate) struct PeerTask {
    pub participant: ParticipantId,
    pub factory: Arc<dyn ConnectionFactory>,
    pub signals: Arc<dyn SignalChannel>,
    pub local_track: LocalTrackView,
    pub status: Arc<RwLock<PeerSnapshot>>,
    pub inbox: mpsc::UnboundedReceiver<PeerCommand>,
    pub events: mpsc::UnboundedSender<PeerEvent>,
    pub cancel: CancellationToken,
    pub offer_sdp: Option<String>,
    pub sent_candidates: Vec<IceCandidate>,
}

impl PeerTask {
    pub(crate) async fn run(mut self, opening: Opening) {
        let role = opening.role();
        // Creation always runs to completion so a cancelled record still
        // closes what it built
        let new_connection = match self.factory.create(&self.participant).await {
            Ok(new_connection) => new_connection,
            Err(e) => {
                if self.cancel.is_cancelled() {
                    self.finish_closed();
                } else {
                    self.fail(e.into());
                }
                return;
            }
        };
        let connection = new_connection.connection;
        let mut transport_events = new_connection.events;
        if self.cancel.is_cancelled() {
            connection.close().await;
            debug!(participant = %self.participant, "Record closed while connecting");
            self.finish_closed();
            return;
        }
        debug!(participant = %self.participant, role = %role, "Connection created");

        let exit = self
            .drive(connection.as_ref(), &mut transport_events, opening)
            .await;
        connection.close().await;

        match exit {
            Exit::Cancelled => self.finish_closed(),
            Exit::Failed(failure) => self.fail(failure),
        }
    }

    async fn drive(
        &mut self,
        connection: &dyn MediaConnection,
        transport_events: &mut mpsc::UnboundedReceiver<TransportEvent>,
        opening: Opening,
    ) -> Exit {
        let cancel = self.cancel.clone();
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Exit::Cancelled,
            opened = self.open(connection, opening) => {
                if let Err(failure) = opened {
                    return Exit::Failed(failure);
                }
            }
        }

        let mut transport_open = true;
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Exit::Cancelled,
                command = self.inbox.recv() => {
                    let Some(command) = command else {
                        return Exit::Cancelled;
                    };
                    if let Err(failure) = self.handle_command(connection, command).await {
                        return Exit::Failed(failure);
                    }
                }
                event = transport_events.recv(), if transport_open => {
                    match event {
                        Some(event) => {
                            if let Err(failure) = self.handle_transport(event).await {
                                return Exit::Failed(failure);
                            }
                        }
                        None => transport_open = false,
                    }
                }
            }
        }
    }

    async fn open(
        &mut self,
        connection: &dyn MediaConnection,
        opening: Opening,
    ) -> Result<(), NegotiationFailure> {
        connection
            .attach_local_track(self.local_track.clone())
            .await?;
        self.status.write().local_tracks_attached = true;

        let payload = match opening {
            Opening::SendOffer => {
                let sdp = connection.create_offer().await?;
                self.offer_sdp = Some(sdp.clone());
                SignalPayload::Offer { sdp }
            }
            Opening::AnswerOffer(offer) => SignalPayload::Answer {
                sdp: connection.accept_offer(offer).await?,
            },
        };
        let kind = payload.kind();
        self.send(payload).await?;
        debug!(participant = %self.participant, kind = %kind, "Sent session description");
        Ok(())
    }

    async fn send(&self, payload: SignalPayload) -> Result<(), NegotiationFailure> {
        self.signals
            .send_signal(OutboundSignal {
                to: self.participant.clone(),
                payload,
            })
            .await?;
        Ok(())
    }

    async fn handle_command(
        &self,
        connection: &dyn MediaConnection,
        command: PeerCommand,
    ) -> Result<(), NegotiationFailure> {
        match command {
            PeerCommand::AcceptAnswer(sdp) => {
                connection.accept_answer(sdp).await?;
                debug!(participant = %self.participant, "Remote answer applied");
            }
            PeerCommand::AddCandidate(candidate) => {
                // A bad candidate only loses one path, not the connection
                if let Err(e) = connection.add_remote_candidate(candidate).await {
                    warn!(participant = %self.participant, error = %e, "Remote ICE candidate rejected");
                }
            }
            PeerCommand::ResendOffer => {
                let Some(sdp) = self.offer_sdp.clone() else {
                    return Ok(());
                };
                self.send(SignalPayload::Offer { sdp }).await?;
                for candidate in &self.sent_candidates {
                    self.send(SignalPayload::IceCandidate(candidate.clone()))
                        .await?;
                }
                info!(
                    participant = %self.participant,
                    candidates = self.sent_candidates.len(),
                    "Glare: offer sent again"
                );
            }
        }
        Ok(())
    }

    async fn handle_transport(
        &mut self,
        event: TransportEvent,
    ) -> Result<(), NegotiationFailure> {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                self.send(SignalPayload::IceCandidate(candidate.clone()))
                    .await?;
                if self.offer_sdp.is_some() {
                    self.sent_candidates.push(candidate);
                }
            }
            TransportEvent::RemoteTrack(stream) => {
                {
                    let mut status = self.status.write();
                    if let Some(previous) = status.remote_stream.replace(stream.clone()) {
                        previous.end();
                    }
                }
                self.set_state(PeerState::Connected);
                let _ = self.events.send(PeerEvent::RemoteStream {
                    participant: self.participant.clone(),
                    stream,
                });
            }
            TransportEvent::Connected => self.set_state(PeerState::Connected),
            TransportEvent::Failed(reason) => {
                return Err(NegotiationFailure::ConnectionFailed(reason));
            }
        }
        Ok(())
    }

    fn set_state(&self, state: PeerState) {
        let previous = {
            let mut status = self.status.write();
            std::mem::replace(&mut status.state, state)
        };
        if previous != state {
            info!(participant = %self.participant, from = %previous, to = %state, "Peer state changed");
            let _ = self.events.send(PeerEvent::StateChanged {
                participant: self.participant.clone(),
                state,
            });
        }
    }

    fn end_remote_stream(&self) {
        if let Some(stream) = self.status.read().remote_stream.as_ref() {
            stream.end();
        }
    }

    fn fail(&self, failure: NegotiationFailure) {
        warn!(participant = %self.participant, error = %failure, "Peer negotiation failed");
        self.end_remote_stream();
        {
            let mut status = self.status.write();
            status.failure = Some(failure.to_string());
            status.awaiting_answer = false;
        }
        self.set_state(PeerState::Failed);
    }

    fn finish_closed(&self) {
        self.end_remote_stream();
        let mut status = self.status.write();
        status.state = PeerState::Closed;
        status.awaiting_answer = false;
        debug!(participant = %self.participant, "Peer record closed");
    }
}
