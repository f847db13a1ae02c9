//! Voice activity detection on the local track.
//!
//! A sampling loop ticks roughly once per animation frame, analyses the most
//! recent `fft_size` captured samples and publishes whether the average
//! byte-scaled spectrum level is above the configured threshold. Muted
//! (disabled) tracks never count as speaking.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use covoice_core::config::VadConfig;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::analyser::FrequencyAnalyser;
use crate::capture::LocalTrackView;

/// Threshold decision over a sliding window of samples
pub struct SpeakingDetector {
    analyser: FrequencyAnalyser,
    threshold: f32,
    window: VecDeque<f32>,
}

impl SpeakingDetector {
    #[must_use]
    pub fn new(config: &VadConfig) -> Self {
        Self {
            analyser: FrequencyAnalyser::from_config(config),
            threshold: f32::from(config.threshold),
            window: VecDeque::with_capacity(config.fft_size),
        }
    }

    /// Append captured samples, keeping only the newest `fft_size`
    pub fn extend(&mut self, samples: &[f32]) {
        let capacity = self.analyser.fft_size();
        let skip = samples.len().saturating_sub(capacity);
        for &sample in &samples[skip..] {
            if self.window.len() == capacity {
                self.window.pop_front();
            }
            self.window.push_back(sample);
        }
    }

    /// Run one analysis pass. `enabled` is the local track's enabled flag.
    pub fn evaluate(&mut self, enabled: bool) -> bool {
        let level = self.analyser.average_level(self.window.make_contiguous());
        trace!(level, "Voice activity level");
        enabled && level > self.threshold
    }

    pub fn reset(&mut self) {
        self.window.clear();
        self.analyser.reset();
    }
}

/// Start the sampling loop for `track`, writing into `speaking`.
///
/// The loop ends when `cancel` fires or the track ends; `speaking` is reset
/// to false on exit.
pub fn spawn_detector(
    track: LocalTrackView,
    config: &VadConfig,
    speaking: Arc<watch::Sender<bool>>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let mut detector = SpeakingDetector::new(config);
    let tick = Duration::from_millis(config.tick_interval_ms.max(1));

    tokio::spawn(async move {
        let mut frames = track.subscribe();
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        debug!(track = %track.id(), "Voice activity detector started");

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = track.ended() => break,
                frame = frames.recv() => match frame {
                    Ok(frame) => detector.extend(&frame.samples),
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = ticker.tick() => {
                    let now = detector.evaluate(track.is_enabled());
                    speaking.send_if_modified(|current| {
                        if *current == now {
                            false
                        } else {
                            *current = now;
                            debug!(speaking = now, "Speaking state changed");
                            true
                        }
                    });
                }
            }
        }

        speaking.send_if_modified(|current| std::mem::replace(current, false));
        debug!(track = %track.id(), "Voice activity detector stopped");
    })
}
