//! Opus glue between 48 kHz media frames and RTP payloads.
//!
//! Media frames are already 48 kHz mono 10 ms, which is a valid Opus frame,
//! so no resampling happens on either side.

use bytes::Bytes;
use covoice_media::{AudioFrame, FRAME_SAMPLES, SAMPLE_RATE};

use crate::error::TransportError;

/// RTP clock rate of Opus
pub const OPUS_CLOCK_RATE: u32 = SAMPLE_RATE;

/// Opus is always advertised as two channels in SDP
pub const OPUS_SDP_CHANNELS: u16 = 2;

pub const OPUS_FMTP: &str = "minptime=10;useinbandfec=1";

const OPUS_BITRATE: i32 = 32_000;

/// Upper bound from RFC 6716 for one packet
const MAX_PACKET_SIZE: usize = 1275;

/// 120 ms at 48 kHz, the longest frame a remote encoder may send
const MAX_DECODED_SAMPLES: usize = 5760;

pub struct OpusEncoder {
    encoder: opus::Encoder,
}

impl OpusEncoder {
    pub fn new() -> Result<Self, TransportError> {
        let mut encoder =
            opus::Encoder::new(SAMPLE_RATE, opus::Channels::Mono, opus::Application::Voip)
                .map_err(codec_error)?;
        encoder
            .set_bitrate(opus::Bitrate::Bits(OPUS_BITRATE))
            .map_err(codec_error)?;
        encoder.set_vbr(true).map_err(codec_error)?;
        encoder.set_inband_fec(true).map_err(codec_error)?;
        encoder.set_packet_loss_perc(5).map_err(codec_error)?;
        Ok(Self { encoder })
    }

    /// Encode one 10 ms frame; shorter frames are padded with silence
    pub fn encode(&mut self, frame: &AudioFrame) -> Result<Bytes, TransportError> {
        let mut output = vec![0u8; MAX_PACKET_SIZE];
        let len = if frame.len() == FRAME_SAMPLES {
            self.encoder.encode_float(&frame.samples, &mut output)
        } else {
            let mut padded = frame.samples.to_vec();
            padded.resize(FRAME_SAMPLES, 0.0);
            self.encoder.encode_float(&padded, &mut output)
        }
        .map_err(codec_error)?;
        output.truncate(len);
        Ok(Bytes::from(output))
    }
}

pub struct OpusDecoder {
    decoder: opus::Decoder,
}

impl OpusDecoder {
    pub fn new() -> Result<Self, TransportError> {
        let decoder =
            opus::Decoder::new(SAMPLE_RATE, opus::Channels::Mono).map_err(codec_error)?;
        Ok(Self { decoder })
    }

    /// Decode one packet into a mono 48 kHz frame
    pub fn decode(&mut self, payload: &[u8]) -> Result<AudioFrame, TransportError> {
        let mut output = vec![0.0f32; MAX_DECODED_SAMPLES];
        let len = self
            .decoder
            .decode_float(payload, &mut output, false)
            .map_err(codec_error)?;
        output.truncate(len);
        Ok(AudioFrame::new(output))
    }

    /// Packet loss concealment for one missing 10 ms frame
    pub fn conceal(&mut self) -> Result<AudioFrame, TransportError> {
        let mut output = vec![0.0f32; FRAME_SAMPLES];
        let len = self
            .decoder
            .decode_float(&[], &mut output, false)
            .map_err(codec_error)?;
        output.truncate(len);
        Ok(AudioFrame::new(output))
    }
}

fn codec_error(e: opus::Error) -> TransportError {
    TransportError::Codec(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::TAU;

    fn tone(frequency: f32, amplitude: f32, frames: usize) -> Vec<AudioFrame> {
        (0..frames)
            .map(|n| {
                AudioFrame::new(
                    (0..FRAME_SAMPLES)
                        .map(|i| {
                            let t = (n * FRAME_SAMPLES + i) as f32 / SAMPLE_RATE as f32;
                            amplitude * (TAU * frequency * t).sin()
                        })
                        .collect(),
                )
            })
            .collect()
    }

    /// Magnitude of one frequency in `samples`, normalised to amplitude
    fn goertzel(samples: &[f32], frequency: f32) -> f32 {
        let w = TAU * frequency / SAMPLE_RATE as f32;
        let coeff = 2.0 * w.cos();
        let (mut s1, mut s2) = (0.0f32, 0.0f32);
        for &x in samples {
            let s0 = x + coeff * s1 - s2;
            s2 = s1;
            s1 = s0;
        }
        let power = s1 * s1 + s2 * s2 - coeff * s1 * s2;
        2.0 * power.max(0.0).sqrt() / samples.len() as f32
    }

    fn round_trip(frames: &[AudioFrame]) -> Vec<f32> {
        let mut encoder = OpusEncoder::new().unwrap();
        let mut decoder = OpusDecoder::new().unwrap();
        let mut out = Vec::new();
        for frame in frames {
            let packet = encoder.encode(frame).unwrap();
            assert!(!packet.is_empty());
            assert!(packet.len() <= MAX_PACKET_SIZE);
            let decoded = decoder.decode(&packet).unwrap();
            assert_eq!(decoded.len(), FRAME_SAMPLES);
            out.extend(decoded.samples.iter().copied());
        }
        out
    }

    #[test]
    fn test_voice_band_tone_survives() {
        let out = round_trip(&tone(440.0, 0.5, 60));
        // Skip codec start-up
        let steady = &out[20 * FRAME_SAMPLES..];
        let level = goertzel(steady, 440.0);
        assert!(level > 0.3, "440 Hz came back at {level}");
    }

    #[test]
    fn test_high_tone_is_not_folded_down() {
        let out = round_trip(&tone(6_000.0, 0.5, 60));
        let steady = &out[20 * FRAME_SAMPLES..];
        let wanted = goertzel(steady, 6_000.0);
        let alias = goertzel(steady, 2_000.0);
        assert!(wanted > 0.25, "6 kHz came back at {wanted}");
        assert!(alias < wanted / 10.0, "2 kHz alias at {alias} vs {wanted}");
    }

    #[test]
    fn test_short_frame_is_padded() {
        let mut encoder = OpusEncoder::new().unwrap();
        let mut decoder = OpusDecoder::new().unwrap();
        let packet = encoder.encode(&AudioFrame::new(vec![0.1; 100])).unwrap();
        assert_eq!(decoder.decode(&packet).unwrap().len(), FRAME_SAMPLES);
    }

    #[test]
    fn test_conceal_yields_one_frame() {
        let mut encoder = OpusEncoder::new().unwrap();
        let mut decoder = OpusDecoder::new().unwrap();
        for frame in tone(300.0, 0.3, 5) {
            decoder.decode(&encoder.encode(&frame).unwrap()).unwrap();
        }
        assert_eq!(decoder.conceal().unwrap().len(), FRAME_SAMPLES);
    }

    #[test]
    fn test_garbage_payload_is_an_error() {
        let mut decoder = OpusDecoder::new().unwrap();
        // TOC byte announcing a code-3 packet with a zero frame count
        assert!(matches!(
            decoder.decode(&[0x03, 0x00]),
            Err(TransportError::Codec(_))
        ));
    }
}
