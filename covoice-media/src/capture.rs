//! Microphone capture.
//!
//! [`PushMicrophone`] is a [`MediaDevices`] implementation fed by the
//! embedder: whatever produces PCM (a sound card callback, a file, a test)
//! pushes 48 kHz mono samples into a [`MicrophoneFeed`]. Each acquisition
//! runs an [`AudioProcessor`] that frames the input into 10 ms chunks and
//! applies noise suppression and automatic gain control before the frames
//! reach the [`LocalAudioTrack`].

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use covoice_core::config::AudioConfig;
use covoice_core::generate_id;
use nnnoiseless::DenoiseState;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::MediaAccessError;
use crate::frame::{AudioFrame, FRAME_SAMPLES, SAMPLE_RATE};

const TRACK_CAPACITY: usize = 128;
const FEED_CAPACITY: usize = 256;
const I16_SCALE: f32 = 32_767.0;

/// Requested capture processing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            sample_rate: SAMPLE_RATE,
            channels: 1,
        }
    }
}

impl From<&AudioConfig> for AudioConstraints {
    fn from(config: &AudioConfig) -> Self {
        Self {
            echo_cancellation: config.echo_cancellation,
            noise_suppression: config.noise_suppression,
            auto_gain_control: config.auto_gain_control,
            sample_rate: config.sample_rate,
            channels: 1,
        }
    }
}

/// Microphone access.
///
/// Echo cancellation is never applied by the devices in this crate: a
/// request for it is accepted, logged at warn level, and the granted
/// [`LocalAudioTrack::settings`] report `echo_cancellation: false`. Callers
/// that need it must check the granted settings rather than the request.
/// Noise suppression and gain control are applied as requested.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(
        &self,
        constraints: &AudioConstraints,
    ) -> Result<LocalStream, MediaAccessError>;
}

struct TrackInner {
    id: String,
    settings: AudioConstraints,
    enabled: AtomicBool,
    frames: broadcast::Sender<AudioFrame>,
    ended: CancellationToken,
}

impl TrackInner {
    /// Disabled tracks carry silence, ended tracks carry nothing
    fn publish(&self, frame: AudioFrame) {
        if self.ended.is_cancelled() {
            return;
        }
        let frame = if self.enabled.load(Ordering::Acquire) {
            frame
        } else {
            AudioFrame::silence(frame.len())
        };
        let _ = self.frames.send(frame);
    }
}

/// Owner handle of a captured audio track
pub struct LocalAudioTrack {
    inner: Arc<TrackInner>,
}

impl LocalAudioTrack {
    fn new(settings: AudioConstraints) -> Self {
        let (frames, _) = broadcast::channel(TRACK_CAPACITY);
        Self {
            inner: Arc::new(TrackInner {
                id: generate_id(),
                settings,
                enabled: AtomicBool::new(true),
                frames,
                ended: CancellationToken::new(),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Release);
        debug!(track = %self.inner.id, enabled, "Local track enabled changed");
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.inner.ended.is_cancelled()
    }

    pub fn stop(&self) {
        if !self.inner.ended.is_cancelled() {
            self.inner.ended.cancel();
            debug!(track = %self.inner.id, "Local track stopped");
        }
    }

    /// Processing actually applied by the device
    #[must_use]
    pub fn settings(&self) -> AudioConstraints {
        self.inner.settings
    }

    #[must_use]
    pub fn view(&self) -> LocalTrackView {
        LocalTrackView {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Read-only handle given to peers and the activity detector
#[derive(Clone)]
pub struct LocalTrackView {
    inner: Arc<TrackInner>,
}

impl LocalTrackView {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AudioFrame> {
        self.inner.frames.subscribe()
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.inner.ended.is_cancelled()
    }

    pub async fn ended(&self) {
        self.inner.ended.cancelled().await;
    }
}

impl std::fmt::Debug for LocalTrackView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrackView")
            .field("id", &self.inner.id)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

/// An acquired microphone stream
pub struct LocalStream {
    id: String,
    tracks: Vec<LocalAudioTrack>,
}

impl LocalStream {
    #[must_use]
    pub fn new(tracks: Vec<LocalAudioTrack>) -> Self {
        Self {
            id: generate_id(),
            tracks,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn audio_tracks(&self) -> &[LocalAudioTrack] {
        &self.tracks
    }

    /// True while any track is live
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.tracks.iter().any(LocalAudioTrack::is_live)
    }

    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
        info!(stream = %self.id, tracks = self.tracks.len(), "Local stream stopped");
    }
}

/// Smoothed gain toward a target RMS
#[derive(Debug, Clone)]
struct AutomaticGain {
    gain: f32,
}

impl AutomaticGain {
    const TARGET_RMS: f32 = 0.1;
    const MIN_GAIN: f32 = 0.1;
    const MAX_GAIN: f32 = 10.0;
    const SMOOTHING: f32 = 0.1;
    // Below this the input is treated as silence and the gain is held
    const NOISE_FLOOR: f32 = 1e-4;

    fn new() -> Self {
        Self { gain: 1.0 }
    }

    fn apply(&mut self, samples: &mut [f32]) {
        let rms = (samples.iter().map(|s| s * s).sum::<f32>() / samples.len().max(1) as f32).sqrt();
        if rms > Self::NOISE_FLOOR {
            let desired = (Self::TARGET_RMS / rms).clamp(Self::MIN_GAIN, Self::MAX_GAIN);
            self.gain += (desired - self.gain) * Self::SMOOTHING;
        }
        for sample in samples.iter_mut() {
            *sample = (*sample * self.gain).clamp(-1.0, 1.0);
        }
    }
}

/// Frames raw capture input and applies noise suppression then gain control
pub struct AudioProcessor {
    denoise: Option<Box<DenoiseState<'static>>>,
    agc: Option<AutomaticGain>,
    pending: Vec<f32>,
    scratch_in: Vec<f32>,
    scratch_out: Vec<f32>,
}

impl AudioProcessor {
    #[must_use]
    pub fn new(constraints: &AudioConstraints) -> Self {
        Self {
            denoise: constraints.noise_suppression.then(DenoiseState::new),
            agc: constraints.auto_gain_control.then(AutomaticGain::new),
            pending: Vec::with_capacity(FRAME_SAMPLES * 2),
            scratch_in: vec![0.0; FRAME_SAMPLES],
            scratch_out: vec![0.0; FRAME_SAMPLES],
        }
    }

    /// Samples buffered until the next full frame
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Feed raw samples; returns every complete 10 ms frame
    pub fn push(&mut self, samples: &[f32]) -> Vec<AudioFrame> {
        self.pending.extend_from_slice(samples);
        let mut frames = Vec::with_capacity(self.pending.len() / FRAME_SAMPLES);
        while self.pending.len() >= FRAME_SAMPLES {
            let mut frame: Vec<f32> = self.pending.drain(..FRAME_SAMPLES).collect();
            self.process_frame(&mut frame);
            frames.push(AudioFrame::new(frame));
        }
        frames
    }

    fn process_frame(&mut self, frame: &mut [f32]) {
        if let Some(denoise) = self.denoise.as_mut() {
            // RNNoise works on i16-scaled floats
            for (dst, src) in self.scratch_in.iter_mut().zip(frame.iter()) {
                *dst = (src * I16_SCALE).clamp(-I16_SCALE, I16_SCALE);
            }
            denoise.process_frame(&mut self.scratch_out, &self.scratch_in);
            for (dst, src) in frame.iter_mut().zip(self.scratch_out.iter()) {
                *dst = src / I16_SCALE;
            }
        }
        if let Some(agc) = self.agc.as_mut() {
            agc.apply(frame);
        }
    }
}

/// Whether the user has granted microphone access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Granted,
    Denied,
}

struct MicrophoneState {
    permission: RwLock<Permission>,
    device_present: AtomicBool,
    acquisitions: AtomicUsize,
    feed: broadcast::Sender<Arc<[f32]>>,
}

/// Producer side of a [`PushMicrophone`]
#[derive(Clone)]
pub struct MicrophoneFeed {
    state: Arc<MicrophoneState>,
}

impl MicrophoneFeed {
    /// Push 48 kHz mono samples; returns the number of active captures
    pub fn push(&self, samples: &[f32]) -> usize {
        self.state.feed.send(samples.into()).unwrap_or(0)
    }
}

/// Microphone whose PCM is supplied by the embedder
#[derive(Clone)]
pub struct PushMicrophone {
    state: Arc<MicrophoneState>,
}

impl Default for PushMicrophone {
    fn default() -> Self {
        Self::new()
    }
}

impl PushMicrophone {
    #[must_use]
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            state: Arc::new(MicrophoneState {
                permission: RwLock::new(Permission::Granted),
                device_present: AtomicBool::new(true),
                acquisitions: AtomicUsize::new(0),
                feed,
            }),
        }
    }

    #[must_use]
    pub fn feed(&self) -> MicrophoneFeed {
        MicrophoneFeed {
            state: Arc::clone(&self.state),
        }
    }

    pub fn set_permission(&self, permission: Permission) {
        *self.state.permission.write() = permission;
    }

    pub fn set_device_present(&self, present: bool) {
        self.state.device_present.store(present, Ordering::Release);
    }

    /// Number of successful `get_user_media` calls
    #[must_use]
    pub fn acquisitions(&self) -> usize {
        self.state.acquisitions.load(Ordering::Acquire)
    }
}

#[async_trait]
impl MediaDevices for PushMicrophone {
    async fn get_user_media(
        &self,
        constraints: &AudioConstraints,
    ) -> Result<LocalStream, MediaAccessError> {
        if !self.state.device_present.load(Ordering::Acquire) {
            return Err(MediaAccessError::NoDevice);
        }
        if *self.state.permission.read() == Permission::Denied {
            return Err(MediaAccessError::PermissionDenied);
        }
        if constraints.sample_rate != SAMPLE_RATE || constraints.channels != 1 {
            return Err(MediaAccessError::Device(format!(
                "unsupported format {} Hz x{}",
                constraints.sample_rate, constraints.channels
            )));
        }

        let settings = AudioConstraints {
            // No playback reference is available to cancel against
            echo_cancellation: false,
            ..*constraints
        };
        if constraints.echo_cancellation {
            warn!("Echo cancellation requested but not available on this device");
        }

        let track = LocalAudioTrack::new(settings);
        let inner = Arc::clone(&track.inner);
        let mut input = self.state.feed.subscribe();
        let mut processor = AudioProcessor::new(&settings);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = inner.ended.cancelled() => break,
                    chunk = input.recv() => match chunk {
                        Ok(chunk) => {
                            for frame in processor.push(&chunk) {
                                inner.publish(frame);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(track = %inner.id, skipped, "Capture processor lagging, dropped input");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            inner.ended.cancel();
                            break;
                        }
                    },
                }
            }
            debug!(track = %inner.id, "Capture processor exited");
        });

        let count = self.state.acquisitions.fetch_add(1, Ordering::AcqRel) + 1;
        let stream = LocalStream::new(vec![track]);
        info!(
            stream = %stream.id(),
            acquisitions = count,
            noise_suppression = settings.noise_suppression,
            auto_gain_control = settings.auto_gain_control,
            "Microphone acquired"
        );
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn plain() -> AudioConstraints {
        AudioConstraints {
            echo_cancellation: false,
            noise_suppression: false,
            auto_gain_control: false,
            ..AudioConstraints::default()
        }
    }

    #[test]
    fn test_processor_frames_input() {
        let mut processor = AudioProcessor::new(&plain());
        let frames = processor.push(&[0.25; 1000]);
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.len() == FRAME_SAMPLES));
        assert_eq!(processor.pending(), 40);
        assert_eq!(frames[0].samples[0], 0.25);

        let frames = processor.push(&[0.25; 440]);
        assert_eq!(frames.len(), 1);
        assert_eq!(processor.pending(), 0);
    }

    #[test]
    fn test_agc_raises_quiet_input() {
        let constraints = AudioConstraints {
            auto_gain_control: true,
            ..plain()
        };
        let mut processor = AudioProcessor::new(&constraints);
        let mut last_rms = 0.0;
        for _ in 0..100 {
            for frame in processor.push(&[0.01; FRAME_SAMPLES]) {
                last_rms = frame.rms();
            }
        }
        assert!(last_rms > 0.05, "rms {last_rms}");
        assert!(last_rms <= 0.1 + 1e-3);
    }

    #[test]
    fn test_agc_holds_gain_on_silence() {
        let mut agc = AutomaticGain::new();
        let mut silence = [0.0_f32; FRAME_SAMPLES];
        agc.apply(&mut silence);
        assert_eq!(agc.gain, 1.0);
    }

    #[test]
    fn test_denoise_keeps_silence_silent() {
        let constraints = AudioConstraints {
            noise_suppression: true,
            ..plain()
        };
        let mut processor = AudioProcessor::new(&constraints);
        for frame in processor.push(&[0.0; FRAME_SAMPLES * 4]) {
            assert!(frame.samples.iter().all(|s| s.is_finite()));
            assert!(frame.rms() < 1e-3);
        }
    }

    #[tokio::test]
    async fn test_permission_and_device_errors() {
        let mic = PushMicrophone::new();
        mic.set_permission(Permission::Denied);
        assert_eq!(
            mic.get_user_media(&AudioConstraints::default()).await.err(),
            Some(MediaAccessError::PermissionDenied)
        );

        mic.set_device_present(false);
        assert_eq!(
            mic.get_user_media(&AudioConstraints::default()).await.err(),
            Some(MediaAccessError::NoDevice)
        );
        assert_eq!(mic.acquisitions(), 0);
    }

    #[tokio::test]
    async fn test_unsupported_format_rejected() {
        let mic = PushMicrophone::new();
        let constraints = AudioConstraints {
            sample_rate: 16_000,
            ..AudioConstraints::default()
        };
        assert!(matches!(
            mic.get_user_media(&constraints).await,
            Err(MediaAccessError::Device(_))
        ));
    }

    #[tokio::test]
    async fn test_echo_cancellation_request_is_reported_off() {
        let mic = PushMicrophone::new();
        let requested = AudioConstraints::default();
        assert!(requested.echo_cancellation);

        let stream = mic.get_user_media(&requested).await.unwrap();
        let granted = stream.audio_tracks()[0].settings();
        assert!(!granted.echo_cancellation);
        assert_eq!(granted.noise_suppression, requested.noise_suppression);
        assert_eq!(granted.auto_gain_control, requested.auto_gain_control);
        assert_eq!(granted.sample_rate, requested.sample_rate);
        stream.stop();
    }

    #[tokio::test]
    async fn test_captured_frames_reach_track() {
        let mic = PushMicrophone::new();
        let stream = mic.get_user_media(&plain()).await.unwrap();
        assert_eq!(mic.acquisitions(), 1);

        let track = &stream.audio_tracks()[0];
        assert!(!track.settings().echo_cancellation);
        let view = track.view();
        let mut rx = view.subscribe();

        mic.feed().push(&[0.5; FRAME_SAMPLES]);
        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.samples[0], 0.5);

        track.set_enabled(false);
        assert!(!view.is_enabled());
        mic.feed().push(&[0.5; FRAME_SAMPLES]);
        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.rms(), 0.0);
    }

    #[tokio::test]
    async fn test_stop_ends_every_track() {
        let mic = PushMicrophone::new();
        let stream = mic.get_user_media(&plain()).await.unwrap();
        let view = stream.audio_tracks()[0].view();
        assert!(stream.is_active());

        stream.stop();
        view.ended().await;
        assert!(!stream.is_active());
        assert!(!view.is_live());
    }
}
