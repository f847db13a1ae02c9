//! Session Controller.
//!
//! [`VoiceSession`] ties the local media plane to the peer connection
//! manager. A connected session owns the microphone stream, the activity
//! detector and one manager; all of them are created by `connect()` and
//! torn down by `disconnect()`. Mute, deafen and volume live on the session
//! and survive individual peers coming and going.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use covoice_core::config::{GlarePolicy, VadConfig};
use covoice_core::{
    Config, InboundSignal, Participant, ParticipantId, Presence, PresenceEvent, SignalChannel,
};
use covoice_media::{
    spawn_detector, AudioConstraints, AudioOutput, LocalStream, MediaAccessError, MediaDevices,
    PlaybackRegistry,
};
use covoice_rtc::{
    ConnectionFactory, ManagerSettings, PeerConnectionManager, PeerEvent, PeerSnapshot, PeerState,
};
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SessionError;

/// Collaborators a session is built on
#[derive(Clone)]
pub struct SessionContext {
    pub devices: Arc<dyn MediaDevices>,
    pub connections: Arc<dyn ConnectionFactory>,
    pub signals: Arc<dyn SignalChannel>,
    pub presence: Arc<dyn Presence>,
    pub output: Arc<dyn AudioOutput>,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub constraints: AudioConstraints,
    pub vad: VadConfig,
    pub initial_volume: u8,
    pub glare_policy: GlarePolicy,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            constraints: AudioConstraints::default(),
            vad: VadConfig::default(),
            initial_volume: 100,
            glare_policy: GlarePolicy::default(),
        }
    }
}

impl From<&Config> for SessionSettings {
    fn from(config: &Config) -> Self {
        Self {
            constraints: AudioConstraints::from(&config.audio),
            vad: config.vad.clone(),
            initial_volume: config.playback.initial_volume,
            glare_policy: config.negotiation.glare_policy,
        }
    }
}

/// Everything that exists only while connected
struct LiveSession {
    stream: LocalStream,
    manager: Arc<PeerConnectionManager>,
    cancel: CancellationToken,
    detector: JoinHandle<()>,
    events: JoinHandle<()>,
}

struct Shared {
    local: ParticipantId,
    settings: SessionSettings,
    context: SessionContext,
    playback: Arc<PlaybackRegistry>,
    /// Serializes connect and disconnect
    lifecycle: Mutex<()>,
    live: RwLock<Option<LiveSession>>,
    muted: AtomicBool,
    deafened: AtomicBool,
    speaking: Arc<watch::Sender<bool>>,
}

/// A participant's voice session in one room
#[derive(Clone)]
pub struct VoiceSession {
    shared: Arc<Shared>,
}

impl VoiceSession {
    #[must_use]
    pub fn new(local: ParticipantId, settings: SessionSettings, context: SessionContext) -> Self {
        let playback = Arc::new(PlaybackRegistry::new(
            Arc::clone(&context.output),
            settings.initial_volume,
        ));
        let (speaking, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                local,
                settings,
                context,
                playback,
                lifecycle: Mutex::new(()),
                live: RwLock::new(None),
                muted: AtomicBool::new(false),
                deafened: AtomicBool::new(false),
                speaking: Arc::new(speaking),
            }),
        }
    }

    #[must_use]
    pub fn local_id(&self) -> &ParticipantId {
        &self.shared.local
    }

    /// Acquire the microphone, start activity detection and offer to every
    /// participant already in the room.
    ///
    /// # Errors
    ///
    /// [`SessionError::AlreadyConnected`] when called on a connected session,
    /// [`SessionError::MediaAccess`] when the microphone cannot be acquired.
    /// The session stays disconnected in both cases.
    pub async fn connect(&self) -> Result<(), SessionError> {
        let _lifecycle = self.shared.lifecycle.lock().await;
        if self.shared.live.read().is_some() {
            return Err(SessionError::AlreadyConnected);
        }

        let shared = &self.shared;
        let stream = shared
            .context
            .devices
            .get_user_media(&shared.settings.constraints)
            .await
            .inspect_err(|e| warn!(participant = %shared.local, error = %e, "Microphone unavailable"))?;
        let Some(track) = stream.audio_tracks().first() else {
            stream.stop();
            return Err(MediaAccessError::NoDevice.into());
        };
        track.set_enabled(!shared.muted.load(Ordering::Acquire));
        let view = track.view();

        let cancel = CancellationToken::new();
        let detector = spawn_detector(
            view.clone(),
            &shared.settings.vad,
            Arc::clone(&shared.speaking),
            cancel.child_token(),
        );

        let settings = ManagerSettings::new(shared.local.clone())
            .with_glare_policy(shared.settings.glare_policy);
        let (manager, peer_events) = PeerConnectionManager::new(
            settings,
            Arc::clone(&shared.context.connections),
            Arc::clone(&shared.context.signals),
            view,
        );
        let manager = Arc::new(manager);
        let events = tokio::spawn(play_remote_streams(
            Arc::clone(&manager),
            Arc::clone(&shared.playback),
            peer_events,
            cancel.child_token(),
        ));

        // Mute and the roster are read only after publishing
        let stream_id = stream.id().to_string();
        {
            let mut live = shared.live.write();
            let live = live.insert(LiveSession {
                stream,
                manager: Arc::clone(&manager),
                cancel,
                detector,
                events,
            });
            apply_mute(shared, &live.stream);
        }

        let participants = shared.context.presence.participants();
        for participant in &participants {
            manager.create_offerer(&participant.id);
        }
        info!(
            participant = %shared.local,
            stream = %stream_id,
            peers = manager.len(),
            "Voice session connected"
        );
        Ok(())
    }

    /// Stop the microphone, close every peer connection and reset to
    /// disconnected, unmuted and not deafened. No-op when disconnected.
    pub async fn disconnect(&self) {
        let _lifecycle = self.shared.lifecycle.lock().await;
        let live = self.shared.live.write().take();
        let Some(live) = live else {
            debug!(participant = %self.shared.local, "Disconnect while disconnected");
            return;
        };

        live.stream.stop();
        live.manager.shutdown().await;
        live.cancel.cancel();
        let _ = live.detector.await;
        let _ = live.events.await;
        self.shared.playback.clear().await;

        self.shared.playback.set_muted(false);
        self.shared.deafened.store(false, Ordering::Release);
        self.shared.muted.store(false, Ordering::Release);
        self.shared
            .speaking
            .send_if_modified(|speaking| std::mem::replace(speaking, false));
        info!(participant = %self.shared.local, "Voice session disconnected");
    }

    /// Flip the mute flag and return the new value. Muting disables the
    /// shared local track, so every peer receives silence.
    pub fn toggle_mute(&self) -> bool {
        let muted = !self.shared.muted.fetch_xor(true, Ordering::AcqRel);
        match self.shared.live.read().as_ref() {
            Some(live) => apply_mute(&self.shared, &live.stream),
            None if muted => {
                self.shared
                    .speaking
                    .send_if_modified(|speaking| std::mem::replace(speaking, false));
            }
            None => {}
        }
        info!(participant = %self.shared.local, muted, "Mute toggled");
        muted
    }

    /// Flip the deafen flag and return the new value. Only local playback
    /// is affected.
    pub fn toggle_deafen(&self) -> bool {
        let deafened = !self.shared.deafened.fetch_xor(true, Ordering::AcqRel);
        self.shared.playback.set_muted(deafened);
        info!(participant = %self.shared.local, deafened, "Deafen toggled");
        deafened
    }

    /// Set the output volume (clamped to 0..=100) for current and future
    /// playback
    pub fn set_volume(&self, level: u8) {
        let level = level.min(100);
        self.shared.playback.set_volume(level);
        debug!(participant = %self.shared.local, volume = level, "Output volume set");
    }

    /// Offer to a participant that just joined. No-op while disconnected.
    pub fn on_participant_joined(&self, participant: &Participant) -> bool {
        match self.manager() {
            Some(manager) => manager.create_offerer(&participant.id),
            None => false,
        }
    }

    /// Close the participant's connection and playback, if any
    pub fn on_participant_left(&self, participant: &ParticipantId) -> bool {
        let closed = self
            .manager()
            .is_some_and(|manager| manager.close(participant));
        let stopped = self.shared.playback.stop(participant);
        closed || stopped
    }

    /// Route a signal from the signal channel. Misses are logged by the
    /// manager and otherwise ignored.
    pub fn on_signal_received(&self, signal: InboundSignal) {
        match self.manager() {
            Some(manager) => {
                let _ = manager.handle_signal(signal);
            }
            None => {
                debug!(
                    participant = %signal.from,
                    kind = %signal.payload.kind(),
                    "Signal dropped while disconnected"
                );
            }
        }
    }

    /// Start over with a fresh offer to a participant whose connection failed
    pub fn retry_peer(&self, participant: &ParticipantId) -> bool {
        self.manager()
            .is_some_and(|manager| manager.retry(participant))
    }

    /// Bring the records back in line with the room after missed presence
    /// notifications: offer to new participants, close departed ones.
    pub fn reconcile_presence(&self) {
        let Some(manager) = self.manager() else {
            return;
        };
        let present: HashSet<ParticipantId> = self
            .shared
            .context
            .presence
            .participants()
            .into_iter()
            .map(|participant| participant.id)
            .collect();

        for id in manager.participant_ids() {
            if !present.contains(&id) {
                manager.close(&id);
                self.shared.playback.stop(&id);
            }
        }
        for id in &present {
            manager.create_offerer(id);
        }
    }

    /// Feed signals and presence notifications into this session until the
    /// signal inbox closes
    pub fn attach(
        &self,
        mut signals: mpsc::UnboundedReceiver<InboundSignal>,
        mut presence: broadcast::Receiver<PresenceEvent>,
    ) -> JoinHandle<()> {
        let session = self.clone();
        tokio::spawn(async move {
            let mut presence_open = true;
            loop {
                tokio::select! {
                    signal = signals.recv() => match signal {
                        Some(signal) => session.on_signal_received(signal),
                        None => break,
                    },
                    event = presence.recv(), if presence_open => match event {
                        Ok(PresenceEvent::Joined(participant)) => {
                            session.on_participant_joined(&participant);
                        }
                        Ok(PresenceEvent::Left(id)) => {
                            session.on_participant_left(&id);
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(participant = %session.local_id(), skipped, "Presence lagged, reconciling");
                            session.reconcile_presence();
                        }
                        Err(broadcast::error::RecvError::Closed) => presence_open = false,
                    },
                }
            }
            debug!(participant = %session.local_id(), "Session inputs closed");
        })
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.live.read().is_some()
    }

    #[must_use]
    pub fn is_muted(&self) -> bool {
        self.shared.muted.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_deafened(&self) -> bool {
        self.shared.deafened.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn volume(&self) -> u8 {
        self.shared.playback.volume()
    }

    #[must_use]
    pub fn is_speaking(&self) -> bool {
        *self.shared.speaking.borrow()
    }

    #[must_use]
    pub fn subscribe_speaking(&self) -> watch::Receiver<bool> {
        self.shared.speaking.subscribe()
    }

    /// Snapshots of every peer record, ordered by participant
    #[must_use]
    pub fn peers(&self) -> Vec<PeerSnapshot> {
        self.manager()
            .map(|manager| manager.snapshots())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn peer_state(&self, participant: &ParticipantId) -> Option<PeerState> {
        self.manager()?.state(participant)
    }

    /// Whether remote audio from `participant` is being played
    #[must_use]
    pub fn is_playing(&self, participant: &ParticipantId) -> bool {
        self.shared.playback.contains(participant)
    }

    /// Playback registry shared by every remote stream
    #[must_use]
    pub fn playback(&self) -> &PlaybackRegistry {
        &self.shared.playback
    }

    /// Whether the local microphone stream is live. False when disconnected.
    #[must_use]
    pub fn local_stream_active(&self) -> bool {
        self.shared
            .live
            .read()
            .as_ref()
            .is_some_and(|live| live.stream.is_active())
    }

    /// Whether the local track currently carries audio to peers
    #[must_use]
    pub fn local_track_enabled(&self) -> bool {
        self.shared.live.read().as_ref().is_some_and(|live| {
            live.stream
                .audio_tracks()
                .iter()
                .all(covoice_media::LocalAudioTrack::is_enabled)
        })
    }

    fn manager(&self) -> Option<Arc<PeerConnectionManager>> {
        self.shared
            .live
            .read()
            .as_ref()
            .map(|live| Arc::clone(&live.manager))
    }
}

/// Bring the stream's tracks in line with the current mute flag. Callers
/// hold the `live` lock so the last writer reads the latest flag.
fn apply_mute(shared: &Shared, stream: &LocalStream) {
    let muted = shared.muted.load(Ordering::Acquire);
    for track in stream.audio_tracks() {
        track.set_enabled(!muted);
    }
    if muted {
        shared
            .speaking
            .send_if_modified(|speaking| std::mem::replace(speaking, false));
    }
}

/// Start playback for new remote streams; stop it for peers that failed
async fn play_remote_streams(
    manager: Arc<PeerConnectionManager>,
    playback: Arc<PlaybackRegistry>,
    mut events: mpsc::UnboundedReceiver<PeerEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            PeerEvent::RemoteStream {
                participant,
                stream,
            } => {
                if manager.state(&participant).is_some_and(|state| state.is_active()) {
                    playback.start(participant, &stream);
                }
            }
            PeerEvent::StateChanged {
                participant,
                state: PeerState::Failed,
            } => {
                // The record may have been replaced since the event was sent
                if manager.state(&participant) == Some(PeerState::Failed) {
                    playback.stop(&participant);
                }
            }
            PeerEvent::StateChanged { .. } => {}
        }
    }
}
