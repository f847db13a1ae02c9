//! In-memory connection fakes for driving records without a network.
//!
//! A [`FakeNetwork`] hands out one [`FakeConnectionFactory`] per local
//! participant. Connections use placeholder SDP, trickle one local
//! candidate per description, and buffer remote candidates until a remote
//! description is applied. When an offerer accepts an answer and the
//! counterpart connection exists on the same network, both sides are linked:
//! each forwards its local track into the other's remote stream and reports
//! `RemoteTrack` and `Connected`. Tests can also inject events directly
//! through a [`FakeConnectionHandle`].

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use covoice_core::{IceCandidate, ParticipantId};
use covoice_media::{LocalTrackView, RemoteAudioStream};
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::transport::{ConnectionFactory, MediaConnection, NewConnection, TransportEvent};

type LinkKey = (ParticipantId, ParticipantId);

#[derive(Default)]
struct NetworkInner {
    connections: DashMap<LinkKey, Arc<ConnectionState>>,
    created: DashMap<ParticipantId, usize>,
    fail_create: DashSet<LinkKey>,
    fail_answer: DashSet<LinkKey>,
    create_delay: DashMap<LinkKey, Duration>,
}

/// Shared registry of fake connections
#[derive(Clone, Default)]
pub struct FakeNetwork {
    inner: Arc<NetworkInner>,
}

impl FakeNetwork {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory for connections owned by `local`
    #[must_use]
    pub fn factory(&self, local: impl Into<ParticipantId>) -> FakeConnectionFactory {
        FakeConnectionFactory {
            local: local.into(),
            network: self.clone(),
        }
    }

    /// Latest connection `owner` built towards `remote`
    #[must_use]
    pub fn connection(
        &self,
        owner: impl Into<ParticipantId>,
        remote: impl Into<ParticipantId>,
    ) -> Option<FakeConnectionHandle> {
        self.inner
            .connections
            .get(&(owner.into(), remote.into()))
            .map(|state| FakeConnectionHandle {
                state: Arc::clone(&state),
            })
    }

    /// Number of connections `owner` has created so far
    #[must_use]
    pub fn created_count(&self, owner: impl Into<ParticipantId>) -> usize {
        self.inner
            .created
            .get(&owner.into())
            .map_or(0, |count| *count)
    }

    /// Make every later `create` by `owner` towards `remote` fail
    pub fn fail_create(&self, owner: impl Into<ParticipantId>, remote: impl Into<ParticipantId>) {
        self.inner.fail_create.insert((owner.into(), remote.into()));
    }

    /// Make every later `create` by `owner` towards `remote` take `delay`
    pub fn delay_create(
        &self,
        owner: impl Into<ParticipantId>,
        remote: impl Into<ParticipantId>,
        delay: Duration,
    ) {
        self.inner
            .create_delay
            .insert((owner.into(), remote.into()), delay);
    }

    /// Make `owner`'s connection to `remote` reject the answer it receives
    pub fn fail_answer(&self, owner: impl Into<ParticipantId>, remote: impl Into<ParticipantId>) {
        self.inner.fail_answer.insert((owner.into(), remote.into()));
    }
}

#[derive(Clone)]
pub struct FakeConnectionFactory {
    local: ParticipantId,
    network: FakeNetwork,
}

#[async_trait]
impl ConnectionFactory for FakeConnectionFactory {
    async fn create(&self, participant: &ParticipantId) -> Result<NewConnection, TransportError> {
        let key = (self.local.clone(), participant.clone());
        let inner = &self.network.inner;
        *inner.created.entry(self.local.clone()).or_insert(0) += 1;
        let delay = inner.create_delay.get(&key).map(|delay| *delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if inner.fail_create.contains(&key) {
            return Err(TransportError::Setup(format!(
                "scripted failure towards {participant}"
            )));
        }

        let (events_tx, events) = mpsc::unbounded_channel();
        let state = Arc::new(ConnectionState {
            owner: self.local.clone(),
            remote: participant.clone(),
            local_description: Mutex::new(None),
            remote_description: Mutex::new(None),
            pending: Mutex::new(Vec::new()),
            applied: Mutex::new(Vec::new()),
            local_track: Mutex::new(None),
            inbound: RemoteAudioStream::new(),
            events: events_tx,
            linked: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            forwarded: AtomicUsize::new(0),
            cancel: CancellationToken::new(),
        });
        inner.connections.insert(key, Arc::clone(&state));

        Ok(NewConnection {
            connection: Box::new(FakeConnection {
                state,
                network: self.network.clone(),
            }),
            events,
        })
    }
}

struct ConnectionState {
    owner: ParticipantId,
    remote: ParticipantId,
    local_description: Mutex<Option<String>>,
    remote_description: Mutex<Option<String>>,
    pending: Mutex<Vec<IceCandidate>>,
    applied: Mutex<Vec<IceCandidate>>,
    local_track: Mutex<Option<LocalTrackView>>,
    /// Audio arriving from the remote side
    inbound: RemoteAudioStream,
    events: mpsc::UnboundedSender<TransportEvent>,
    linked: AtomicBool,
    closed: AtomicBool,
    forwarded: AtomicUsize,
    cancel: CancellationToken,
}

impl ConnectionState {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    fn set_local(&self, sdp: String) {
        *self.local_description.lock() = Some(sdp);
        let _ = self
            .events
            .send(TransportEvent::LocalCandidate(local_candidate(&self.owner, &self.remote)));
    }

    fn set_remote(&self, sdp: String) {
        *self.remote_description.lock() = Some(sdp);
        let buffered = std::mem::take(&mut *self.pending.lock());
        self.applied.lock().extend(buffered);
    }

    /// Start receiving `source`'s local track on this side
    fn receive_from(self: &Arc<Self>, source: &Self) {
        if self.linked.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(track) = source.local_track.lock().clone() {
            tokio::spawn(forward(track, Arc::clone(self)));
        }
        let _ = self
            .events
            .send(TransportEvent::RemoteTrack(self.inbound.clone()));
        let _ = self.events.send(TransportEvent::Connected);
    }
}

fn local_candidate(owner: &ParticipantId, remote: &ParticipantId) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{owner}-{remote} 1 udp 2122260223 127.0.0.1 50000 typ host"),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}

async fn forward(track: LocalTrackView, to: Arc<ConnectionState>) {
    let mut frames = track.subscribe();
    loop {
        tokio::select! {
            biased;
            () = to.cancel.cancelled() => break,
            () = track.ended() => break,
            frame = frames.recv() => match frame {
                Ok(frame) => {
                    to.inbound.push(frame);
                    to.forwarded.fetch_add(1, Ordering::AcqRel);
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

struct FakeConnection {
    state: Arc<ConnectionState>,
    network: FakeNetwork,
}

impl FakeConnection {
    fn counterpart(&self) -> Option<Arc<ConnectionState>> {
        self.network
            .inner
            .connections
            .get(&(self.state.remote.clone(), self.state.owner.clone()))
            .map(|state| Arc::clone(&state))
    }
}

#[async_trait]
impl MediaConnection for FakeConnection {
    async fn attach_local_track(&self, track: LocalTrackView) -> Result<(), TransportError> {
        self.state.ensure_open()?;
        *self.state.local_track.lock() = Some(track);
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, TransportError> {
        self.state.ensure_open()?;
        let sdp = format!("fake-offer {}", self.state.owner);
        self.state.set_local(sdp.clone());
        Ok(sdp)
    }

    async fn accept_offer(&self, sdp: String) -> Result<String, TransportError> {
        self.state.ensure_open()?;
        if !sdp.starts_with("fake-offer") {
            return Err(TransportError::Description(format!("not an offer: {sdp}")));
        }
        self.state.set_remote(sdp);
        let answer = format!("fake-answer {}", self.state.owner);
        self.state.set_local(answer.clone());
        Ok(answer)
    }

    async fn accept_answer(&self, sdp: String) -> Result<(), TransportError> {
        self.state.ensure_open()?;
        let key = (self.state.owner.clone(), self.state.remote.clone());
        if self.network.inner.fail_answer.contains(&key) || !sdp.starts_with("fake-answer") {
            return Err(TransportError::Description(format!("answer rejected: {sdp}")));
        }
        self.state.set_remote(sdp);

        if let Some(peer) = self.counterpart() {
            let answered = peer.remote_description.lock().is_some();
            if answered && !peer.closed.load(Ordering::Acquire) {
                self.state.receive_from(&peer);
                peer.receive_from(&self.state);
            }
        }
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.state.ensure_open()?;
        if candidate.candidate.is_empty() {
            return Err(TransportError::Candidate("empty candidate".to_string()));
        }
        if self.state.remote_description.lock().is_some() {
            self.state.applied.lock().push(candidate);
        } else {
            self.state.pending.lock().push(candidate);
        }
        Ok(())
    }

    async fn close(&self) {
        if self.state.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.state.cancel.cancel();
        self.state.inbound.end();
    }
}

/// Test-side view of one fake connection
#[derive(Clone)]
pub struct FakeConnectionHandle {
    state: Arc<ConnectionState>,
}

impl FakeConnectionHandle {
    /// Report a transport failure to the owning record
    pub fn fail(&self, reason: impl Into<String>) {
        let _ = self.state.events.send(TransportEvent::Failed(reason.into()));
    }

    /// Report the remote track without linking a counterpart
    pub fn emit_remote_track(&self) -> RemoteAudioStream {
        let stream = self.state.inbound.clone();
        let _ = self.state.events.send(TransportEvent::RemoteTrack(stream.clone()));
        stream
    }

    /// Stream carrying audio from the remote side
    #[must_use]
    pub fn inbound(&self) -> RemoteAudioStream {
        self.state.inbound.clone()
    }

    #[must_use]
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.applied.lock().clone()
    }

    #[must_use]
    pub fn buffered_candidates(&self) -> Vec<IceCandidate> {
        self.state.pending.lock().clone()
    }

    #[must_use]
    pub fn local_description(&self) -> Option<String> {
        self.state.local_description.lock().clone()
    }

    #[must_use]
    pub fn remote_description(&self) -> Option<String> {
        self.state.remote_description.lock().clone()
    }

    /// Liveness of the attached local track, if one was attached
    #[must_use]
    pub fn local_track_live(&self) -> Option<bool> {
        self.state.local_track.lock().as_ref().map(LocalTrackView::is_live)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    /// Frames forwarded into this side's inbound stream
    #[must_use]
    pub fn forwarded_frames(&self) -> usize {
        self.state.forwarded.load(Ordering::Acquire)
    }
}
