//! webrtc-rs backed [`MediaConnection`].
//!
//! The local track is published as Opus: every 48 kHz 10 ms frame is one
//! Opus packet written as a sample. Remote Opus packets are decoded and
//! pushed into a [`RemoteAudioStream`]; short sequence gaps are filled by
//! the decoder's loss concealment.

use std::sync::Arc;

use async_trait::async_trait;
use covoice_core::config::IceServer;
use covoice_core::{generate_id, IceCandidate, ParticipantId};
use covoice_media::{LocalTrackView, RemoteAudioStream};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::voice_codec::{
    OpusDecoder, OpusEncoder, OPUS_CLOCK_RATE, OPUS_FMTP, OPUS_SDP_CHANNELS,
};
use crate::error::TransportError;
use crate::transport::{ConnectionFactory, MediaConnection, NewConnection, TransportEvent};

/// Builds one `RTCPeerConnection` per record
#[derive(Debug, Clone, Default)]
pub struct WebRtcConnectionFactory {
    ice_servers: Vec<IceServer>,
}

impl WebRtcConnectionFactory {
    #[must_use]
    pub fn new(ice_servers: Vec<IceServer>) -> Self {
        Self { ice_servers }
    }
}

#[async_trait]
impl ConnectionFactory for WebRtcConnectionFactory {
    async fn create(&self, participant: &ParticipantId) -> Result<NewConnection, TransportError> {
        let (connection, events) = WebRtcConnection::open(participant.clone(), &self.ice_servers).await?;
        Ok(NewConnection {
            connection: Box::new(connection),
            events,
        })
    }
}

pub struct WebRtcConnection {
    participant: ParticipantId,
    pc: Arc<RTCPeerConnection>,
    /// `Some` until a remote description is applied
    pending_candidates: Mutex<Option<Vec<IceCandidate>>>,
    cancel: CancellationToken,
}

impl WebRtcConnection {
    pub async fn open(
        participant: ParticipantId,
        ice_servers: &[IceServer],
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>), TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| TransportError::Setup(format!("register codecs: {e}")))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| TransportError::Setup(format!("register interceptors: {e}")))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| TransportError::Setup(format!("new peer connection: {e}")))?,
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        Self::register_handlers(&pc, &participant, &events_tx, &cancel);

        debug!(participant = %participant, "WebRTC peer connection created");
        Ok((
            Self {
                participant,
                pc,
                pending_candidates: Mutex::new(Some(Vec::new())),
                cancel,
            },
            events_rx,
        ))
    }

    fn register_handlers(
        pc: &Arc<RTCPeerConnection>,
        participant: &ParticipantId,
        events: &mpsc::UnboundedSender<TransportEvent>,
        cancel: &CancellationToken,
    ) {
        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(TransportEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => warn!(error = %e, "Failed to serialize local ICE candidate"),
                }
            })
        }));

        let tx = events.clone();
        let who = participant.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = tx.clone();
            let who = who.clone();
            Box::pin(async move {
                debug!(participant = %who, state = %state, "Peer connection state changed");
                match state {
                    RTCPeerConnectionState::Connected => {
                        let _ = tx.send(TransportEvent::Connected);
                    }
                    RTCPeerConnectionState::Failed => {
                        let _ = tx.send(TransportEvent::Failed(
                            "peer connection failed".to_string(),
                        ));
                    }
                    _ => {}
                }
            })
        }));

        let tx = events.clone();
        let who = participant.clone();
        let cancel = cancel.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let tx = tx.clone();
                let who = who.clone();
                let cancel = cancel.clone();
                Box::pin(async move {
                    let stream = RemoteAudioStream::new();
                    info!(participant = %who, stream = %stream.id(), "Remote audio track received");
                    let _ = tx.send(TransportEvent::RemoteTrack(stream.clone()));
                    match OpusDecoder::new() {
                        Ok(decoder) => {
                            tokio::spawn(read_remote_track(track, decoder, stream, cancel));
                        }
                        Err(e) => {
                            warn!(participant = %who, error = %e, "Cannot decode remote audio");
                            stream.end();
                        }
                    }
                })
            },
        ));
    }

    /// Candidates held back until a remote description exists
    #[must_use]
    pub fn buffered_candidates(&self) -> usize {
        self.pending_candidates
            .lock()
            .as_ref()
            .map_or(0, Vec::len)
    }

    async fn apply_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(|e| TransportError::Candidate(e.to_string()))
    }

    async fn set_remote(&self, description: RTCSessionDescription) -> Result<(), TransportError> {
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|e| TransportError::Description(format!("set remote description: {e}")))?;

        let buffered = self.pending_candidates.lock().take().unwrap_or_default();
        if !buffered.is_empty() {
            debug!(participant = %self.participant, count = buffered.len(), "Applying buffered ICE candidates");
        }
        for candidate in buffered {
            if let Err(e) = self.apply_candidate(candidate).await {
                warn!(participant = %self.participant, error = %e, "Buffered ICE candidate rejected");
            }
        }
        Ok(())
    }

    async fn set_local(&self, description: RTCSessionDescription) -> Result<String, TransportError> {
        self.pc
            .set_local_description(description)
            .await
            .map_err(|e| TransportError::Description(format!("set local description: {e}")))?;
        self.pc
            .local_description()
            .await
            .map(|d| d.sdp)
            .ok_or_else(|| TransportError::Description("no local description".to_string()))
    }
}

#[async_trait]
impl MediaConnection for WebRtcConnection {
    async fn attach_local_track(&self, track: LocalTrackView) -> Result<(), TransportError> {
        let encoder = OpusEncoder::new()?;
        let rtp_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: OPUS_CLOCK_RATE,
                channels: OPUS_SDP_CHANNELS,
                sdp_fmtp_line: OPUS_FMTP.to_owned(),
                rtcp_feedback: vec![],
            },
            format!("audio-{}", track.id()),
            format!("covoice-{}", generate_id()),
        ));

        let sender = self
            .pc
            .add_track(Arc::clone(&rtp_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| TransportError::Track(format!("add track: {e}")))?;

        // RTCP has to be drained for the interceptors to work
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    result = sender.read(&mut buf) => {
                        if result.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        tokio::spawn(write_local_track(
            track,
            encoder,
            rtp_track,
            self.participant.clone(),
            self.cancel.clone(),
        ));
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, TransportError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| TransportError::Description(format!("create offer: {e}")))?;
        self.set_local(offer).await
    }

    async fn accept_offer(&self, sdp: String) -> Result<String, TransportError> {
        let offer = RTCSessionDescription::offer(sdp)
            .map_err(|e| TransportError::Description(format!("parse offer: {e}")))?;
        self.set_remote(offer).await?;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| TransportError::Description(format!("create answer: {e}")))?;
        self.set_local(answer).await
    }

    async fn accept_answer(&self, sdp: String) -> Result<(), TransportError> {
        let answer = RTCSessionDescription::answer(sdp)
            .map_err(|e| TransportError::Description(format!("parse answer: {e}")))?;
        self.set_remote(answer).await
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        {
            let mut pending = self.pending_candidates.lock();
            if let Some(buffer) = pending.as_mut() {
                buffer.push(candidate);
                return Ok(());
            }
        }
        self.apply_candidate(candidate).await
    }

    async fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        if let Err(e) = self.pc.close().await {
            warn!(participant = %self.participant, error = %e, "Error closing peer connection");
        }
        debug!(participant = %self.participant, "WebRTC peer connection closed");
    }
}

async fn write_local_track(
    track: LocalTrackView,
    mut encoder: OpusEncoder,
    rtp_track: Arc<TrackLocalStaticSample>,
    participant: ParticipantId,
    cancel: CancellationToken,
) {
    let mut frames = track.subscribe();
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            () = track.ended() => break,
            frame = frames.recv() => match frame {
                Ok(frame) => frame,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        let data = match encoder.encode(&frame) {
            Ok(data) => data,
            Err(e) => {
                warn!(participant = %participant, error = %e, "Dropping local frame");
                continue;
            }
        };
        let sample = Sample {
            data,
            duration: frame.duration(),
            ..Default::default()
        };
        if let Err(e) = rtp_track.write_sample(&sample).await {
            debug!(participant = %participant, error = %e, "Local sample write failed");
        }
    }
    debug!(participant = %participant, "Local track writer stopped");
}

/// Largest sequence gap filled with concealment instead of skipped
const MAX_CONCEALED_PACKETS: u16 = 5;

async fn read_remote_track(
    track: Arc<TrackRemote>,
    mut decoder: OpusDecoder,
    stream: RemoteAudioStream,
    cancel: CancellationToken,
) {
    let mut last_sequence: Option<u16> = None;
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            result = track.read_rtp() => match result {
                Ok((packet, _)) => {
                    if packet.payload.is_empty() {
                        continue;
                    }
                    let sequence = packet.header.sequence_number;
                    if let Some(last) = last_sequence {
                        let missing = sequence.wrapping_sub(last).wrapping_sub(1);
                        if (1..=MAX_CONCEALED_PACKETS).contains(&missing) {
                            for _ in 0..missing {
                                if let Ok(frame) = decoder.conceal() {
                                    stream.push(frame);
                                }
                            }
                        }
                    }
                    last_sequence = Some(sequence);
                    match decoder.decode(&packet.payload) {
                        Ok(frame) => {
                            stream.push(frame);
                        }
                        Err(e) => debug!(error = %e, "Undecodable remote packet"),
                    }
                }
                Err(e) => {
                    debug!(error = %e, "Remote track ended");
                    break;
                }
            },
        }
    }
    stream.end();
}
