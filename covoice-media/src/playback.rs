//! Remote audio playback.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use covoice_core::ParticipantId;
use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::frame::{AudioFrame, RemoteAudioStream};

/// Sink for decoded remote audio (a sound card, a mixer, a test channel)
pub trait AudioOutput: Send + Sync {
    fn play(&self, participant: &ParticipantId, frame: AudioFrame);
}

/// Discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullOutput;

impl AudioOutput for NullOutput {
    fn play(&self, _participant: &ParticipantId, _frame: AudioFrame) {}
}

/// Forwards played frames to a channel
#[derive(Debug, Clone)]
pub struct ChannelOutput {
    tx: mpsc::UnboundedSender<(ParticipantId, AudioFrame)>,
}

impl ChannelOutput {
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<(ParticipantId, AudioFrame)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl AudioOutput for ChannelOutput {
    fn play(&self, participant: &ParticipantId, frame: AudioFrame) {
        let _ = self.tx.send((participant.clone(), frame));
    }
}

struct ElementControls {
    muted: AtomicBool,
    volume: AtomicU8,
}

/// Plays one participant's remote stream
pub struct PlaybackElement {
    participant: ParticipantId,
    stream_id: String,
    controls: Arc<ElementControls>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PlaybackElement {
    #[must_use]
    pub fn start(
        participant: ParticipantId,
        stream: &RemoteAudioStream,
        output: Arc<dyn AudioOutput>,
        volume: u8,
        muted: bool,
    ) -> Self {
        let controls = Arc::new(ElementControls {
            muted: AtomicBool::new(muted),
            volume: AtomicU8::new(volume.min(100)),
        });
        let cancel = CancellationToken::new();

        let task = {
            let controls = Arc::clone(&controls);
            let cancel = cancel.clone();
            let participant = participant.clone();
            let stream = stream.clone();
            let mut frames = stream.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = stream.ended() => break,
                        frame = frames.recv() => match frame {
                            Ok(frame) => {
                                if controls.muted.load(Ordering::Acquire) {
                                    continue;
                                }
                                let gain = f32::from(controls.volume.load(Ordering::Acquire)) / 100.0;
                                output.play(&participant, frame.scaled(gain));
                            }
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                debug!(participant = %participant, skipped, "Playback lagging");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                    }
                }
                debug!(participant = %participant, "Playback stopped");
            })
        };

        info!(participant = %participant, stream = %stream.id(), volume, muted, "Playback started");
        Self {
            participant,
            stream_id: stream.id().to_string(),
            controls,
            cancel,
            task,
        }
    }

    #[must_use]
    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    #[must_use]
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn set_muted(&self, muted: bool) {
        self.controls.muted.store(muted, Ordering::Release);
    }

    #[must_use]
    pub fn is_muted(&self) -> bool {
        self.controls.muted.load(Ordering::Acquire)
    }

    pub fn set_volume(&self, volume: u8) {
        self.controls.volume.store(volume.min(100), Ordering::Release);
    }

    #[must_use]
    pub fn volume(&self) -> u8 {
        self.controls.volume.load(Ordering::Acquire)
    }

    /// Stop and wait for the playback task to exit
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Playback elements keyed by participant, sharing mute and volume
pub struct PlaybackRegistry {
    elements: DashMap<ParticipantId, PlaybackElement>,
    output: Arc<dyn AudioOutput>,
    muted: AtomicBool,
    volume: AtomicU8,
}

impl PlaybackRegistry {
    #[must_use]
    pub fn new(output: Arc<dyn AudioOutput>, volume: u8) -> Self {
        Self {
            elements: DashMap::new(),
            output,
            muted: AtomicBool::new(false),
            volume: AtomicU8::new(volume.min(100)),
        }
    }

    /// Start playing `stream`, replacing any element for the same participant
    pub fn start(&self, participant: ParticipantId, stream: &RemoteAudioStream) {
        if let Some(existing) = self.elements.get(&participant) {
            if existing.stream_id() == stream.id() {
                return;
            }
        }
        let element = PlaybackElement::start(
            participant.clone(),
            stream,
            Arc::clone(&self.output),
            self.volume(),
            self.is_muted(),
        );
        if let Some(previous) = self.elements.insert(participant, element) {
            previous.cancel.cancel();
        }
    }

    pub fn stop(&self, participant: &ParticipantId) -> bool {
        match self.elements.remove(participant) {
            Some((_, element)) => {
                element.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Mute or unmute every element, current and future
    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Release);
        for element in self.elements.iter() {
            element.set_muted(muted);
        }
    }

    #[must_use]
    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }

    pub fn set_volume(&self, volume: u8) {
        let volume = volume.min(100);
        self.volume.store(volume, Ordering::Release);
        for element in self.elements.iter() {
            element.set_volume(volume);
        }
    }

    #[must_use]
    pub fn volume(&self) -> u8 {
        self.volume.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn contains(&self, participant: &ParticipantId) -> bool {
        self.elements.contains_key(participant)
    }

    #[must_use]
    pub fn element_volume(&self, participant: &ParticipantId) -> Option<u8> {
        self.elements.get(participant).map(|e| e.volume())
    }

    #[must_use]
    pub fn element_muted(&self, participant: &ParticipantId) -> Option<bool> {
        self.elements.get(participant).map(|e| e.is_muted())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Stop every element and wait for their tasks
    pub async fn clear(&self) {
        let keys: Vec<ParticipantId> = self.elements.iter().map(|e| e.key().clone()).collect();
        let drained: Vec<PlaybackElement> = keys
            .iter()
            .filter_map(|key| self.elements.remove(key).map(|(_, element)| element))
            .collect();
        join_all(drained.into_iter().map(PlaybackElement::stop)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn next(
        rx: &mut mpsc::UnboundedReceiver<(ParticipantId, AudioFrame)>,
    ) -> (ParticipantId, AudioFrame) {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_element_applies_volume() {
        let (output, mut rx) = ChannelOutput::channel();
        let stream = RemoteAudioStream::new();
        let element = PlaybackElement::start("bob".into(), &stream, Arc::new(output), 50, false);

        stream.push(AudioFrame::new(vec![0.8; 4]));
        let (who, frame) = next(&mut rx).await;
        assert_eq!(who, ParticipantId::from("bob"));
        assert!((frame.samples[0] - 0.4).abs() < 1e-6);

        element.set_volume(250);
        assert_eq!(element.volume(), 100);
        element.stop().await;
    }

    #[tokio::test]
    async fn test_muted_element_drops_frames() {
        let (output, mut rx) = ChannelOutput::channel();
        let stream = RemoteAudioStream::new();
        let element = PlaybackElement::start("bob".into(), &stream, Arc::new(output), 100, true);

        stream.push(AudioFrame::new(vec![0.8; 4]));
        settle().await;
        assert!(rx.try_recv().is_err());

        element.set_muted(false);
        stream.push(AudioFrame::new(vec![0.8; 4]));
        let (_, frame) = next(&mut rx).await;
        assert_eq!(frame.samples[0], 0.8);
        element.stop().await;
    }

    #[tokio::test]
    async fn test_registry_uniform_controls() {
        let registry = PlaybackRegistry::new(Arc::new(NullOutput), 100);
        let a = RemoteAudioStream::new();
        let b = RemoteAudioStream::new();
        registry.start("a".into(), &a);
        registry.set_volume(30);
        registry.start("b".into(), &b);

        assert_eq!(registry.element_volume(&"a".into()), Some(30));
        assert_eq!(registry.element_volume(&"b".into()), Some(30));

        registry.set_muted(true);
        assert_eq!(registry.element_muted(&"a".into()), Some(true));
        assert_eq!(registry.element_muted(&"b".into()), Some(true));

        assert!(registry.stop(&"a".into()));
        assert!(!registry.stop(&"a".into()));
        assert_eq!(registry.len(), 1);

        registry.clear().await;
        assert!(registry.is_empty());
        assert_eq!(registry.volume(), 30);
    }

    #[tokio::test]
    async fn test_element_exits_when_stream_ends() {
        let (output, _rx) = ChannelOutput::channel();
        let stream = RemoteAudioStream::new();
        let element = PlaybackElement::start("bob".into(), &stream, Arc::new(output), 100, false);
        stream.end();
        tokio::time::timeout(Duration::from_secs(1), element.stop())
            .await
            .unwrap();
    }
}
