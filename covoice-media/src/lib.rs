//! Local media plane of a voice session
//!
//! - [`capture`]: microphone acquisition and capture processing
//! - [`device`]: sound card capture and playback through cpal
//! - [`analyser`]: byte-scaled frequency data as a Web Audio `AnalyserNode` reports it
//! - [`vad`]: the "currently speaking" sampling loop
//! - [`playback`]: per-participant playback of remote audio with mute and volume

pub mod analyser;
pub mod capture;
pub mod device;
pub mod error;
pub mod frame;
pub mod playback;
pub mod vad;

pub use analyser::FrequencyAnalyser;
pub use capture::{
    AudioConstraints, AudioProcessor, LocalAudioTrack, LocalStream, LocalTrackView, MediaDevices,
    MicrophoneFeed, Permission, PushMicrophone,
};
pub use device::{CpalMicrophone, CpalSpeaker};
pub use error::MediaAccessError;
pub use frame::{AudioFrame, RemoteAudioStream, FRAME_SAMPLES, SAMPLE_RATE};
pub use playback::{AudioOutput, ChannelOutput, NullOutput, PlaybackElement, PlaybackRegistry};
pub use vad::{spawn_detector, SpeakingDetector};
