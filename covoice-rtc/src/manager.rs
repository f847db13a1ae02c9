//! Peer Connection Manager.
//!
//! Owns one record per remote participant. Each record is served by its own
//! task with an ordered inbox, so a slow or failed negotiation never holds
//! up another participant. Routing decisions are made under the record's
//! map entry, which keeps create/replace/close atomic per participant.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use covoice_core::config::GlarePolicy;
use covoice_core::{InboundSignal, ParticipantId, SignalChannel, SignalPayload};
use covoice_media::{LocalTrackView, RemoteAudioStream};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::RoutingMiss;
use crate::negotiation::{Opening, PeerCommand, PeerTask};
use crate::peer::{route, GlareResolution, PeerSnapshot, PeerState, RecordLookup, Route};
use crate::transport::ConnectionFactory;

/// Notifications for the session controller
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A usable remote stream arrived; start playing it
    RemoteStream {
        participant: ParticipantId,
        stream: RemoteAudioStream,
    },
    StateChanged {
        participant: ParticipantId,
        state: PeerState,
    },
}

/// How long a closed participant keeps dropping late signals after its
/// record task finished
pub const DEFAULT_TOMBSTONE_LINGER: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub local_id: ParticipantId,
    pub glare_policy: GlarePolicy,
    pub tombstone_linger: Duration,
}

impl ManagerSettings {
    #[must_use]
    pub fn new(local_id: ParticipantId) -> Self {
        Self {
            local_id,
            glare_policy: GlarePolicy::default(),
            tombstone_linger: DEFAULT_TOMBSTONE_LINGER,
        }
    }

    #[must_use]
    pub const fn with_glare_policy(mut self, glare_policy: GlarePolicy) -> Self {
        self.glare_policy = glare_policy;
        self
    }

    #[must_use]
    pub const fn with_tombstone_linger(mut self, linger: Duration) -> Self {
        self.tombstone_linger = linger;
        self
    }
}

struct PeerEntry {
    status: Arc<RwLock<PeerSnapshot>>,
    inbox: mpsc::UnboundedSender<PeerCommand>,
    cancel: CancellationToken,
    /// Cancelled once the record task has returned
    finished: CancellationToken,
}

impl PeerEntry {
    fn snapshot(&self) -> PeerSnapshot {
        self.status.read().clone()
    }

    fn deliver(&self, command: PeerCommand, from: &ParticipantId) -> Result<(), RoutingMiss> {
        self.inbox
            .send(command)
            .map_err(|_| RoutingMiss::Closed(from.clone()))
    }
}

pub struct PeerConnectionManager {
    settings: ManagerSettings,
    factory: Arc<dyn ConnectionFactory>,
    signals: Arc<dyn SignalChannel>,
    local_track: LocalTrackView,
    records: DashMap<ParticipantId, PeerEntry>,
    /// Closed participants, tagged with the close that created the entry
    tombstones: Arc<DashMap<ParticipantId, u64>>,
    burials: AtomicU64,
    events: mpsc::UnboundedSender<PeerEvent>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl PeerConnectionManager {
    #[must_use]
    pub fn new(
        settings: ManagerSettings,
        factory: Arc<dyn ConnectionFactory>,
        signals: Arc<dyn SignalChannel>,
        local_track: LocalTrackView,
    ) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let manager = Self {
            settings,
            factory,
            signals,
            local_track,
            records: DashMap::new(),
            tombstones: Arc::new(DashMap::new()),
            burials: AtomicU64::new(0),
            events,
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        };
        (manager, events_rx)
    }

    #[must_use]
    pub fn local_id(&self) -> &ParticipantId {
        &self.settings.local_id
    }

    /// Start an outbound negotiation with `participant`.
    ///
    /// Returns false without doing anything when the participant is the
    /// local user, already has a record, or the manager was shut down.
    pub fn create_offerer(&self, participant: &ParticipantId) -> bool {
        if participant == &self.settings.local_id || self.cancel.is_cancelled() {
            return false;
        }
        self.tombstones.remove(participant);

        match self.records.entry(participant.clone()) {
            Entry::Occupied(_) => {
                debug!(participant = %participant, "Record exists, create ignored");
                false
            }
            Entry::Vacant(vacant) => {
                vacant.insert(self.spawn_record(participant.clone(), Opening::SendOffer));
                true
            }
        }
    }

    /// Route one inbound signal. Misses are logged and returned for the
    /// caller's information only; they never affect other records.
    pub fn handle_signal(&self, signal: InboundSignal) -> Result<(), RoutingMiss> {
        let result = self.route_signal(signal.from.clone(), signal.payload);
        if let Err(miss) = &result {
            match miss {
                RoutingMiss::Glare(_) | RoutingMiss::InvalidForState { .. } => {
                    warn!(participant = %signal.from, reason = %miss, "Signal dropped");
                }
                _ => debug!(participant = %signal.from, reason = %miss, "Signal dropped"),
            }
        }
        result
    }

    fn route_signal(&self, from: ParticipantId, payload: SignalPayload) -> Result<(), RoutingMiss> {
        if from == self.settings.local_id {
            return Err(RoutingMiss::FromSelf);
        }
        if self.cancel.is_cancelled() {
            return Err(RoutingMiss::Closed(from));
        }
        let kind = payload.kind();
        let glare =
            GlareResolution::for_pair(self.settings.glare_policy, &self.settings.local_id, &from);

        match self.records.entry(from.clone()) {
            Entry::Vacant(vacant) => {
                let lookup = if self.tombstones.contains_key(&from) {
                    RecordLookup::Tombstoned
                } else {
                    RecordLookup::Missing
                };
                match (route(&lookup, &from, kind, glare), payload) {
                    (Route::CreateAnswerer, SignalPayload::Offer { sdp }) => {
                        info!(participant = %from, "Offer received, creating answerer");
                        vacant.insert(self.spawn_record(from, Opening::AnswerOffer(sdp)));
                        Ok(())
                    }
                    (Route::Drop(miss), _) => Err(miss),
                    _ => Err(RoutingMiss::UnknownParticipant {
                        participant: from,
                        kind,
                    }),
                }
            }
            Entry::Occupied(mut occupied) => {
                let status = occupied.get().status.read().status();
                let decision = route(&RecordLookup::Live(status), &from, kind, glare);
                match (decision, payload) {
                    (Route::ReplaceWithAnswerer, SignalPayload::Offer { sdp }) => {
                        info!(
                            participant = %from,
                            previous_role = %status.role,
                            previous_state = %status.state,
                            "Offer supersedes existing record, answering"
                        );
                        let entry = self.spawn_record(from, Opening::AnswerOffer(sdp));
                        let previous = occupied.insert(entry);
                        previous.cancel.cancel();
                        Ok(())
                    }
                    (Route::ResendOffer, _) => {
                        info!(participant = %from, "Glare: keeping our offer");
                        occupied.get().deliver(PeerCommand::ResendOffer, &from)
                    }
                    (Route::AcceptAnswer, SignalPayload::Answer { sdp }) => {
                        let entry = occupied.get();
                        // Later answers must see the record as answered
                        entry.status.write().awaiting_answer = false;
                        entry.deliver(PeerCommand::AcceptAnswer(sdp), &from)
                    }
                    (Route::AddCandidate, SignalPayload::IceCandidate(candidate)) => occupied
                        .get()
                        .deliver(PeerCommand::AddCandidate(candidate), &from),
                    (Route::Drop(miss), _) => Err(miss),
                    _ => Err(RoutingMiss::InvalidForState {
                        kind,
                        role: status.role,
                        state: status.state,
                    }),
                }
            }
        }
    }

    /// Close and discard the record for `participant`. Later signals from it
    /// are dropped until it is offered to again, or until the tombstone
    /// expires `tombstone_linger` after the record task finished.
    pub fn close(&self, participant: &ParticipantId) -> bool {
        let burial = self.burials.fetch_add(1, Ordering::Relaxed);
        self.tombstones.insert(participant.clone(), burial);
        let finished = match self.records.remove(participant) {
            Some((_, entry)) => {
                entry.cancel.cancel();
                info!(participant = %participant, "Peer record closed");
                Some(entry.finished)
            }
            None => None,
        };
        let closed = finished.is_some();
        self.expire_tombstone(participant.clone(), burial, finished);
        closed
    }

    fn expire_tombstone(
        &self,
        participant: ParticipantId,
        burial: u64,
        finished: Option<CancellationToken>,
    ) {
        let tombstones = Arc::clone(&self.tombstones);
        let shutdown = self.cancel.clone();
        let linger = self.settings.tombstone_linger;
        self.tasks.spawn(async move {
            let expired = async {
                if let Some(finished) = finished {
                    finished.cancelled().await;
                }
                tokio::time::sleep(linger).await;
            };
            tokio::select! {
                () = shutdown.cancelled() => return,
                () = expired => {}
            }
            // A newer close owns the entry if the tag differs
            if tombstones
                .remove_if(&participant, |_, tag| *tag == burial)
                .is_some()
            {
                debug!(participant = %participant, "Tombstone expired");
            }
        });
    }

    /// Whether signals from `participant` are currently dropped as closed
    #[must_use]
    pub fn is_tombstoned(&self, participant: &ParticipantId) -> bool {
        self.tombstones.contains_key(participant)
    }

    /// Replace a `Failed` record with a fresh offerer. No-op otherwise.
    pub fn retry(&self, participant: &ParticipantId) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        match self.records.entry(participant.clone()) {
            Entry::Occupied(mut occupied)
                if occupied.get().status.read().state == PeerState::Failed =>
            {
                info!(participant = %participant, "Retrying failed peer");
                let entry = self.spawn_record(participant.clone(), Opening::SendOffer);
                occupied.insert(entry).cancel.cancel();
                true
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn snapshot(&self, participant: &ParticipantId) -> Option<PeerSnapshot> {
        self.records.get(participant).map(|entry| entry.snapshot())
    }

    /// Every record, ordered by participant id
    #[must_use]
    pub fn snapshots(&self) -> Vec<PeerSnapshot> {
        let mut snapshots: Vec<_> = self.records.iter().map(|entry| entry.snapshot()).collect();
        snapshots.sort_by(|a, b| a.participant_id.cmp(&b.participant_id));
        snapshots
    }

    #[must_use]
    pub fn state(&self, participant: &ParticipantId) -> Option<PeerState> {
        self.records
            .get(participant)
            .map(|entry| entry.status.read().state)
    }

    #[must_use]
    pub fn participant_ids(&self) -> Vec<ParticipantId> {
        let mut ids: Vec<_> = self.records.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Cancel every record, wait for their transports to be released and
    /// discard all records. The manager accepts no work afterwards.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        let closed = self.records.len();
        self.records.clear();
        self.tombstones.clear();
        info!(records = closed, "Peer connection manager shut down");
    }

    fn spawn_record(&self, participant: ParticipantId, opening: Opening) -> PeerEntry {
        let role = opening.role();
        let status = Arc::new(RwLock::new(PeerSnapshot::new(participant.clone(), role)));
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let cancel = self.cancel.child_token();
        let finished = CancellationToken::new();

        let task = PeerTask {
            participant: participant.clone(),
            factory: Arc::clone(&self.factory),
            signals: Arc::clone(&self.signals),
            local_track: self.local_track.clone(),
            status: Arc::clone(&status),
            inbox,
            events: self.events.clone(),
            cancel: cancel.clone(),
            offer_sdp: None,
            sent_candidates: Vec::new(),
        };
        let done = finished.clone();
        self.tasks.spawn(async move {
            let _finished = done.drop_guard();
            task.run(opening).await;
        });
        debug!(participant = %participant, role = %role, "Peer record created");
        PeerEntry {
            status,
            inbox: inbox_tx,
            cancel,
            finished,
        }
    }
}

impl Drop for PeerConnectionManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
