//! Sound card input and output through cpal.
//!
//! cpal streams are not `Send` on every host, so each stream lives on its
//! own thread for as long as it is needed. [`CpalMicrophone`] relays the
//! device callback into a [`PushMicrophone`] feed, so captured audio goes
//! through the same framing and processing as any other source.
//! [`CpalSpeaker`] mixes every participant's frames into one output stream.

use std::collections::{HashMap, VecDeque};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;

use async_trait::async_trait;
use covoice_core::ParticipantId;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    BuildStreamError, Device, PlayStreamError, SampleFormat, StreamConfig, SupportedStreamConfig,
    SupportedStreamConfigRange,
};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::capture::{
    AudioConstraints, LocalStream, MediaDevices, MicrophoneFeed, PushMicrophone,
};
use crate::error::MediaAccessError;
use crate::frame::{AudioFrame, SAMPLE_RATE};
use crate::playback::AudioOutput;

/// Per-participant backlog before old samples are dropped (500 ms)
const MAX_QUEUED_SAMPLES: usize = SAMPLE_RATE as usize / 2;

const I16_RANGE: f32 = 32_768.0;

/// Capture from a cpal input device
#[derive(Debug, Clone, Default)]
pub struct CpalMicrophone {
    device_name: Option<String>,
}

impl CpalMicrophone {
    /// The host's default input device
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_device(name: impl Into<String>) -> Self {
        Self {
            device_name: Some(name.into()),
        }
    }
}

#[async_trait]
impl MediaDevices for CpalMicrophone {
    async fn get_user_media(
        &self,
        constraints: &AudioConstraints,
    ) -> Result<LocalStream, MediaAccessError> {
        let relay = PushMicrophone::new();
        let stream = relay.get_user_media(constraints).await?;
        let feed = relay.feed();

        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let device_name = self.device_name.clone();
        let spawned = std::thread::Builder::new()
            .name("covoice-capture".to_string())
            .spawn(move || {
                let input = match open_input(device_name.as_deref(), feed) {
                    Ok(input) => input,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Returns once the track ended and the sender was dropped
                let _ = stop_rx.recv();
                drop(input);
                debug!("Capture device released");
            });

        if let Err(e) = spawned {
            stream.stop();
            return Err(MediaAccessError::Device(format!("capture thread: {e}")));
        }
        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                stream.stop();
                return Err(e);
            }
            Err(_) => {
                stream.stop();
                return Err(MediaAccessError::Device("capture thread exited".to_string()));
            }
        }

        if let Some(track) = stream.audio_tracks().first() {
            let view = track.view();
            tokio::spawn(async move {
                view.ended().await;
                drop(stop_tx);
            });
        }
        info!(
            device = self.device_name.as_deref().unwrap_or("default"),
            stream = %stream.id(),
            "Sound card capture started"
        );
        Ok(stream)
    }
}

fn open_input(
    name: Option<&str>,
    feed: MicrophoneFeed,
) -> Result<cpal::Stream, MediaAccessError> {
    let host = cpal::default_host();
    let device = match name {
        Some(name) => host
            .input_devices()
            .map_err(|_| MediaAccessError::NoDevice)?
            .find(|device| device.name().is_ok_and(|n| n == name))
            .ok_or(MediaAccessError::NoDevice)?,
        None => host.default_input_device().ok_or(MediaAccessError::NoDevice)?,
    };
    let ranges = device
        .supported_input_configs()
        .map_err(|e| MediaAccessError::Device(format!("input configs: {e}")))?;
    let config = pick_config(ranges).ok_or_else(|| {
        MediaAccessError::Device(format!("no {SAMPLE_RATE} Hz input configuration"))
    })?;

    let sample_format = config.sample_format();
    let stream_config: StreamConfig = config.into();
    let channels = usize::from(stream_config.channels);
    info!(
        device = %device_label(&device),
        format = ?sample_format,
        channels,
        "Opening input device"
    );

    let stream = match sample_format {
        SampleFormat::F32 => device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                feed.push(&downmix(data, channels, |s| s));
            },
            log_stream_error,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &stream_config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                feed.push(&downmix(data, channels, |s| f32::from(s) / I16_RANGE));
            },
            log_stream_error,
            None,
        ),
        SampleFormat::U16 => device.build_input_stream(
            &stream_config,
            move |data: &[u16], _: &cpal::InputCallbackInfo| {
                feed.push(&downmix(data, channels, |s| {
                    (f32::from(s) - I16_RANGE) / I16_RANGE
                }));
            },
            log_stream_error,
            None,
        ),
        other => {
            return Err(MediaAccessError::Device(format!(
                "unsupported input sample format {other:?}"
            )))
        }
    }
    .map_err(build_error)?;
    stream.play().map_err(play_error)?;
    Ok(stream)
}

/// Play remote audio on a cpal output device
pub struct CpalSpeaker {
    mixer: Arc<Mutex<Mixer>>,
    /// Dropping it ends the output thread
    _stop: std_mpsc::Sender<()>,
}

impl CpalSpeaker {
    /// Open `device_name`, or the host's default output device
    pub async fn open(device_name: Option<&str>) -> Result<Self, MediaAccessError> {
        let mixer = Arc::new(Mutex::new(Mixer::default()));
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let name = device_name.map(str::to_string);
        let source = Arc::clone(&mixer);

        std::thread::Builder::new()
            .name("covoice-playback".to_string())
            .spawn(move || {
                let output = match open_output(name.as_deref(), source) {
                    Ok(output) => output,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                let _ = stop_rx.recv();
                drop(output);
                debug!("Output device released");
            })
            .map_err(|e| MediaAccessError::Device(format!("playback thread: {e}")))?;

        ready_rx
            .await
            .map_err(|_| MediaAccessError::Device("playback thread exited".to_string()))??;
        info!(device = device_name.unwrap_or("default"), "Sound card playback started");
        Ok(Self {
            mixer,
            _stop: stop_tx,
        })
    }
}

impl AudioOutput for CpalSpeaker {
    fn play(&self, participant: &ParticipantId, frame: AudioFrame) {
        self.mixer.lock().queue(participant, &frame.samples);
    }
}

fn open_output(
    name: Option<&str>,
    mixer: Arc<Mutex<Mixer>>,
) -> Result<cpal::Stream, MediaAccessError> {
    let host = cpal::default_host();
    let device = match name {
        Some(name) => host
            .output_devices()
            .map_err(|_| MediaAccessError::NoDevice)?
            .find(|device| device.name().is_ok_and(|n| n == name))
            .ok_or(MediaAccessError::NoDevice)?,
        None => host.default_output_device().ok_or(MediaAccessError::NoDevice)?,
    };
    let ranges = device
        .supported_output_configs()
        .map_err(|e| MediaAccessError::Device(format!("output configs: {e}")))?;
    let config = pick_config(ranges).ok_or_else(|| {
        MediaAccessError::Device(format!("no {SAMPLE_RATE} Hz output configuration"))
    })?;

    let sample_format = config.sample_format();
    let stream_config: StreamConfig = config.into();
    let channels = usize::from(stream_config.channels);
    info!(
        device = %device_label(&device),
        format = ?sample_format,
        channels,
        "Opening output device"
    );

    let stream = match sample_format {
        SampleFormat::F32 => device.build_output_stream(
            &stream_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                mixer.lock().render(data, channels, |s| s);
            },
            log_stream_error,
            None,
        ),
        SampleFormat::I16 => device.build_output_stream(
            &stream_config,
            move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                mixer
                    .lock()
                    .render(data, channels, |s| (s * (I16_RANGE - 1.0)) as i16);
            },
            log_stream_error,
            None,
        ),
        SampleFormat::U16 => device.build_output_stream(
            &stream_config,
            move |data: &mut [u16], _: &cpal::OutputCallbackInfo| {
                mixer
                    .lock()
                    .render(data, channels, |s| (s * (I16_RANGE - 1.0) + I16_RANGE) as u16);
            },
            log_stream_error,
            None,
        ),
        other => {
            return Err(MediaAccessError::Device(format!(
                "unsupported output sample format {other:?}"
            )))
        }
    }
    .map_err(build_error)?;
    stream.play().map_err(play_error)?;
    Ok(stream)
}

/// Sums the queued audio of every participant
#[derive(Debug, Default)]
pub(crate) struct Mixer {
    queues: HashMap<ParticipantId, VecDeque<f32>>,
}

impl Mixer {
    pub(crate) fn queue(&mut self, participant: &ParticipantId, samples: &[f32]) {
        let queue = self.queues.entry(participant.clone()).or_default();
        queue.extend(samples.iter().copied());
        if queue.len() > MAX_QUEUED_SAMPLES {
            let excess = queue.len() - MAX_QUEUED_SAMPLES;
            queue.drain(..excess);
        }
    }

    pub(crate) fn queued(&self, participant: &ParticipantId) -> usize {
        self.queues.get(participant).map_or(0, VecDeque::len)
    }

    /// Fill an interleaved buffer, writing the mono mix to every channel
    pub(crate) fn render<T: Copy>(
        &mut self,
        data: &mut [T],
        channels: usize,
        convert: impl Fn(f32) -> T,
    ) {
        for frame in data.chunks_mut(channels.max(1)) {
            let mut mixed = 0.0;
            for queue in self.queues.values_mut() {
                mixed += queue.pop_front().unwrap_or(0.0);
            }
            let sample = convert(mixed.clamp(-1.0, 1.0));
            frame.fill(sample);
        }
        // Drained participants stop contributing until they queue again
        self.queues.retain(|_, queue| !queue.is_empty());
    }
}

/// Prefer a 48 kHz mono configuration, then the fewest channels
fn pick_config(
    ranges: impl Iterator<Item = SupportedStreamConfigRange>,
) -> Option<SupportedStreamConfig> {
    ranges
        .filter(|range| {
            range.min_sample_rate().0 <= SAMPLE_RATE && range.max_sample_rate().0 >= SAMPLE_RATE
        })
        .min_by_key(|range| range.channels())
        .map(|range| range.with_sample_rate(cpal::SampleRate(SAMPLE_RATE)))
}

fn downmix<T: Copy>(data: &[T], channels: usize, convert: impl Fn(T) -> f32) -> Vec<f32> {
    if channels <= 1 {
        return data.iter().map(|&s| convert(s)).collect();
    }
    data.chunks_exact(channels)
        .map(|frame| frame.iter().map(|&s| convert(s)).sum::<f32>() / channels as f32)
        .collect()
}

fn device_label(device: &Device) -> String {
    device.name().unwrap_or_else(|_| "unknown".to_string())
}

fn log_stream_error(e: cpal::StreamError) {
    warn!(error = %e, "Audio device stream error");
}

fn build_error(e: BuildStreamError) -> MediaAccessError {
    match e {
        BuildStreamError::DeviceNotAvailable => MediaAccessError::NoDevice,
        BuildStreamError::BackendSpecific { err } if is_permission_error(&err.description) => {
            MediaAccessError::PermissionDenied
        }
        other => MediaAccessError::Device(other.to_string()),
    }
}

fn play_error(e: PlayStreamError) -> MediaAccessError {
    match e {
        PlayStreamError::DeviceNotAvailable => MediaAccessError::NoDevice,
        PlayStreamError::BackendSpecific { err } if is_permission_error(&err.description) => {
            MediaAccessError::PermissionDenied
        }
        other => MediaAccessError::Device(other.to_string()),
    }
}

/// Hosts report a refused microphone grant as a backend error
fn is_permission_error(description: &str) -> bool {
    let description = description.to_ascii_lowercase();
    description.contains("permission") || description.contains("not authorized")
}
