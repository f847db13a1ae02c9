//! Frequency analysis with the semantics of a Web Audio `AnalyserNode`:
//! Blackman window, real FFT, magnitude scaled by 1/N, temporal smoothing
//! between calls, then decibels mapped linearly from
//! `[min_decibels, max_decibels]` onto `0..=255`.

use std::f32::consts::PI;
use std::sync::Arc;

use covoice_core::config::VadConfig;
use realfft::num_complex::Complex;
use realfft::{RealFftPlanner, RealToComplex};

pub struct FrequencyAnalyser {
    fft_size: usize,
    smoothing: f32,
    min_decibels: f32,
    max_decibels: f32,
    window: Vec<f32>,
    fft: Arc<dyn RealToComplex<f32>>,
    input: Vec<f32>,
    spectrum: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
    smoothed: Vec<f32>,
    bytes: Vec<u8>,
}

impl FrequencyAnalyser {
    /// `fft_size` must be a power of two; configuration validation
    /// guarantees this for values coming from [`VadConfig`].
    #[must_use]
    pub fn new(fft_size: usize, smoothing: f32, min_decibels: f32, max_decibels: f32) -> Self {
        let fft = RealFftPlanner::<f32>::new().plan_fft_forward(fft_size);
        let bins = fft_size / 2;
        Self {
            fft_size,
            smoothing: smoothing.clamp(0.0, 1.0),
            min_decibels,
            max_decibels,
            window: blackman(fft_size),
            input: fft.make_input_vec(),
            spectrum: fft.make_output_vec(),
            scratch: fft.make_scratch_vec(),
            fft,
            smoothed: vec![0.0; bins],
            bytes: vec![0; bins],
        }
    }

    #[must_use]
    pub fn from_config(config: &VadConfig) -> Self {
        Self::new(
            config.fft_size,
            config.smoothing_time_constant,
            config.min_decibels,
            config.max_decibels,
        )
    }

    #[must_use]
    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    #[must_use]
    pub fn frequency_bin_count(&self) -> usize {
        self.fft_size / 2
    }

    /// Analyse the most recent `fft_size` samples of `time_domain`
    /// (zero-padded in front when shorter) and return byte frequency data.
    pub fn byte_frequency_data(&mut self, time_domain: &[f32]) -> &[u8] {
        let take = time_domain.len().min(self.fft_size);
        let offset = self.fft_size - take;
        self.input[..offset].fill(0.0);
        for (i, sample) in time_domain[time_domain.len() - take..].iter().enumerate() {
            self.input[offset + i] = sample * self.window[offset + i];
        }

        if self
            .fft
            .process_with_scratch(&mut self.input, &mut self.spectrum, &mut self.scratch)
            .is_err()
        {
            // Buffers come from the plan itself, so this only guards the API
            self.bytes.fill(0);
            return &self.bytes;
        }

        let scale = 1.0 / self.fft_size as f32;
        let range = self.max_decibels - self.min_decibels;
        for (k, bin) in self.spectrum.iter().take(self.smoothed.len()).enumerate() {
            let magnitude = bin.norm() * scale;
            let mut value = self.smoothing * self.smoothed[k] + (1.0 - self.smoothing) * magnitude;
            if !value.is_finite() {
                value = 0.0;
            }
            self.smoothed[k] = value;

            let db = 20.0 * value.log10();
            let scaled = 255.0 / range * (db - self.min_decibels);
            self.bytes[k] = if scaled.is_nan() {
                0
            } else {
                scaled.clamp(0.0, 255.0) as u8
            };
        }
        &self.bytes
    }

    /// Mean of the byte frequency data
    pub fn average_level(&mut self, time_domain: &[f32]) -> f32 {
        let bytes = self.byte_frequency_data(time_domain);
        if bytes.is_empty() {
            return 0.0;
        }
        let sum: u32 = bytes.iter().map(|&b| u32::from(b)).sum();
        sum as f32 / bytes.len() as f32
    }

    pub fn reset(&mut self) {
        self.smoothed.fill(0.0);
        self.bytes.fill(0);
    }
}

fn blackman(n: usize) -> Vec<f32> {
    const A0: f32 = 0.42;
    const A1: f32 = 0.5;
    const A2: f32 = 0.08;
    (0..n)
        .map(|i| {
            let x = i as f32 / n as f32;
            A0 - A1 * (2.0 * PI * x).cos() + A2 * (4.0 * PI * x).cos()
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Deterministic uniform noise in [-amplitude, amplitude]
    pub(crate) fn noise(len: usize, amplitude: f32, seed: u32) -> Vec<f32> {
        let mut state = seed.wrapping_mul(2_654_435_761).max(1);
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                (state as f32 / u32::MAX as f32 * 2.0 - 1.0) * amplitude
            })
            .collect()
    }

    #[test]
    fn test_blackman_window_shape() {
        let w = blackman(256);
        assert!(w[0].abs() < 1e-6);
        assert!((w[128] - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_silence_is_zero() {
        let mut analyser = FrequencyAnalyser::new(256, 0.8, -100.0, -30.0);
        assert_eq!(analyser.frequency_bin_count(), 128);
        let bytes = analyser.byte_frequency_data(&[0.0; 256]);
        assert!(bytes.iter().all(|&b| b == 0));
        assert_eq!(analyser.average_level(&[]), 0.0);
    }

    #[test]
    fn test_sine_peaks_at_its_bin() {
        let mut analyser = FrequencyAnalyser::new(256, 0.0, -100.0, -30.0);
        // Bin 16 of a 256-point FFT at 48 kHz is 3 kHz
        let signal: Vec<f32> = (0..256)
            .map(|i| 0.01 * (2.0 * PI * 16.0 * i as f32 / 256.0).sin())
            .collect();
        let bytes = analyser.byte_frequency_data(&signal).to_vec();
        let peak = bytes
            .iter()
            .enumerate()
            .max_by_key(|(_, &b)| b)
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(peak, 16);
        assert!(bytes[16] > 150);
        assert_eq!(bytes[64], 0);
    }

    #[test]
    fn test_noise_level_crosses_threshold() {
        let mut analyser = FrequencyAnalyser::new(256, 0.8, -100.0, -30.0);
        let loud = noise(256, 0.5, 7);
        let quiet = vec![0.0001; 256];

        let mut level = 0.0;
        for _ in 0..10 {
            level = analyser.average_level(&loud);
        }
        assert!(level > 100.0, "level {level}");

        analyser.reset();
        for _ in 0..10 {
            level = analyser.average_level(&quiet);
        }
        assert!(level < 20.0, "level {level}");
    }

    #[test]
    fn test_smoothing_decays_gradually() {
        let mut analyser = FrequencyAnalyser::new(256, 0.8, -100.0, -30.0);
        let loud = noise(256, 0.5, 3);
        for _ in 0..20 {
            analyser.average_level(&loud);
        }
        let after_one_silent = analyser.average_level(&[0.0; 256]);
        assert!(after_one_silent > 100.0);
        for _ in 0..200 {
            analyser.average_level(&[0.0; 256]);
        }
        assert!(analyser.average_level(&[0.0; 256]) < 20.0);
    }
}
