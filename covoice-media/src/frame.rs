use std::sync::Arc;
use std::time::Duration;

use covoice_core::generate_id;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Sample rate of every frame on the media plane
pub const SAMPLE_RATE: u32 = 48_000;

/// 10 ms at [`SAMPLE_RATE`]
pub const FRAME_SAMPLES: usize = 480;

const STREAM_CAPACITY: usize = 128;

/// Mono PCM frame, samples in -1.0..=1.0
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Arc<[f32]>,
    pub sample_rate: u32,
}

impl AudioFrame {
    #[must_use]
    pub fn new(samples: Vec<f32>) -> Self {
        Self {
            samples: samples.into(),
            sample_rate: SAMPLE_RATE,
        }
    }

    #[must_use]
    pub fn silence(len: usize) -> Self {
        Self::new(vec![0.0; len])
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / f64::from(self.sample_rate))
    }

    #[must_use]
    pub fn rms(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum: f32 = self.samples.iter().map(|s| s * s).sum();
        (sum / self.samples.len() as f32).sqrt()
    }

    /// Copy with every sample multiplied by `gain`
    #[must_use]
    pub fn scaled(&self, gain: f32) -> Self {
        if (gain - 1.0).abs() < f32::EPSILON {
            return self.clone();
        }
        Self {
            samples: self.samples.iter().map(|s| s * gain).collect(),
            sample_rate: self.sample_rate,
        }
    }
}

/// Audio received from a remote participant.
///
/// Cloning yields another handle to the same stream. The transport pushes
/// frames; playback subscribes. `end()` is called when the transport goes away.
#[derive(Debug, Clone)]
pub struct RemoteAudioStream {
    id: Arc<str>,
    frames: broadcast::Sender<AudioFrame>,
    ended: CancellationToken,
}

impl Default for RemoteAudioStream {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteAudioStream {
    #[must_use]
    pub fn new() -> Self {
        Self::with_id(generate_id())
    }

    #[must_use]
    pub fn with_id(id: impl Into<Arc<str>>) -> Self {
        let (frames, _) = broadcast::channel(STREAM_CAPACITY);
        Self {
            id: id.into(),
            frames,
            ended: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns false once the stream has ended
    pub fn push(&self, frame: AudioFrame) -> bool {
        if self.ended.is_cancelled() {
            return false;
        }
        // No subscriber yet is not an error
        let _ = self.frames.send(frame);
        true
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AudioFrame> {
        self.frames.subscribe()
    }

    pub fn end(&self) {
        self.ended.cancel();
    }

    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.ended.is_cancelled()
    }

    pub async fn ended(&self) {
        self.ended.cancelled().await;
    }
}

impl PartialEq for RemoteAudioStream {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_duration_and_rms() {
        let frame = AudioFrame::new(vec![0.5; FRAME_SAMPLES]);
        assert_eq!(frame.duration(), Duration::from_millis(10));
        assert!((frame.rms() - 0.5).abs() < 1e-6);
        assert_eq!(AudioFrame::silence(10).rms(), 0.0);
    }

    #[test]
    fn test_frame_scaled() {
        let frame = AudioFrame::new(vec![0.5, -0.5]);
        let half = frame.scaled(0.5);
        assert_eq!(&*half.samples, &[0.25, -0.25]);
        assert_eq!(frame.scaled(1.0), frame);
    }

    #[tokio::test]
    async fn test_remote_stream_end() {
        let stream = RemoteAudioStream::new();
        let mut rx = stream.subscribe();
        assert!(stream.push(AudioFrame::silence(4)));
        assert_eq!(rx.recv().await.unwrap().len(), 4);

        let handle = stream.clone();
        stream.end();
        handle.ended().await;
        assert!(!handle.push(AudioFrame::silence(4)));
        assert_eq!(handle, stream);
    }
}
