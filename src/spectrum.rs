/// Spectrum analysis module
///
/// Converts windows of PCM into frequency-bin byte magnitudes, the frame
/// format the blow detector consumes. Mirrors the common analyser
/// contract: Hann window, forward FFT, exponential magnitude smoothing,
/// then a dB range mapped linearly onto 0..=255.

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

use crate::frame_buffer::PcmSample;

/// Magnitude of a single frequency bin (0 = floor, 255 = ceiling)
pub type BinMagnitude = u8;

/// One analysis frame: ordered bin magnitudes, lowest frequency first
pub type SpectrumFrame = Vec<BinMagnitude>;

/// Largest representable bin magnitude, as a float for normalization
pub const MAX_BIN_MAGNITUDE: f32 = 255.0;

#[derive(Error, Debug)]
pub enum SpectrumError {
    #[error("Insufficient audio data: need at least {0} samples")]
    InsufficientData(usize),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Spectrum analyser configuration
#[derive(Debug, Clone)]
pub struct SpectrumConfig {
    /// FFT window size in samples (power of two); bins = fft_size / 2
    pub fft_size: usize,

    /// Exponential smoothing factor for bin magnitudes (0.0 - <1.0)
    pub smoothing: f32,

    /// dB level mapped to bin magnitude 0
    pub min_decibels: f32,

    /// dB level mapped to bin magnitude 255
    pub max_decibels: f32,
}

impl Default for SpectrumConfig {
    fn default() -> Self {
        Self {
            fft_size: 512,       // 256 bins
            smoothing: 0.8,      // analyser-style time smoothing
            min_decibels: -100.0,
            max_decibels: -30.0,
        }
    }
}

impl SpectrumConfig {
    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), SpectrumError> {
        if self.fft_size < 32 || !self.fft_size.is_power_of_two() {
            return Err(SpectrumError::InvalidConfig(
                "fft_size must be a power of two, at least 32".to_string(),
            ));
        }

        if self.smoothing < 0.0 || self.smoothing >= 1.0 {
            return Err(SpectrumError::InvalidConfig(
                "smoothing must be in [0.0, 1.0)".to_string(),
            ));
        }

        if self.min_decibels >= self.max_decibels {
            return Err(SpectrumError::InvalidConfig(
                "min_decibels must be below max_decibels".to_string(),
            ));
        }

        Ok(())
    }

    /// Number of frequency bins per frame
    pub fn bin_count(&self) -> usize {
        self.fft_size / 2
    }
}

/// Converts PCM windows into smoothed byte-magnitude spectra
pub struct SpectrumAnalyzer {
    config: SpectrumConfig,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    smoothed: Vec<f32>,
}

impl SpectrumAnalyzer {
    /// Create an analyser with default configuration
    pub fn new() -> Result<Self, SpectrumError> {
        Self::with_config(SpectrumConfig::default())
    }

    /// Create an analyser with custom configuration
    pub fn with_config(config: SpectrumConfig) -> Result<Self, SpectrumError> {
        config.validate()?;

        debug!("Initializing spectrum analyser with config: {:?}", config);

        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(config.fft_size);

        // Hann window, precomputed once
        let n = config.fft_size;
        let window = (0..n)
            .map(|i| {
                let phase = 2.0 * std::f32::consts::PI * i as f32 / n as f32;
                0.5 * (1.0 - phase.cos())
            })
            .collect();

        let bins = config.bin_count();

        Ok(Self {
            config,
            fft,
            window,
            smoothed: vec![0.0; bins],
        })
    }

    /// Analyse one PCM window and return its bin magnitudes
    ///
    /// Uses the first `fft_size` samples of the input. Smoothing state
    /// carries over between calls, so consecutive frames decay rather
    /// than flicker.
    pub fn analyze(&mut self, samples: &[PcmSample]) -> Result<SpectrumFrame, SpectrumError> {
        let n = self.config.fft_size;

        if samples.len() < n {
            return Err(SpectrumError::InsufficientData(n));
        }

        let mut buffer: Vec<Complex<f32>> = samples[..n]
            .iter()
            .zip(self.window.iter())
            .map(|(&s, &w)| Complex::new(s * w, 0.0))
            .collect();

        self.fft.process(&mut buffer);

        let tau = self.config.smoothing;
        let range = self.config.max_decibels - self.config.min_decibels;
        let mut frame = Vec::with_capacity(self.config.bin_count());

        for (i, value) in buffer[..self.config.bin_count()].iter().enumerate() {
            // Magnitude normalized by window size, then time-smoothed
            let magnitude = value.norm() / n as f32;
            let smoothed = tau * self.smoothed[i] + (1.0 - tau) * magnitude;
            self.smoothed[i] = smoothed;

            let byte = if smoothed <= 0.0 {
                0
            } else {
                let db = 20.0 * smoothed.log10();
                let scaled = (db - self.config.min_decibels) / range * MAX_BIN_MAGNITUDE;
                scaled.clamp(0.0, MAX_BIN_MAGNITUDE) as u8
            };

            frame.push(byte);
        }

        trace!(
            "Spectrum frame: peak={}, bins={}",
            frame.iter().max().copied().unwrap_or(0),
            frame.len()
        );

        Ok(frame)
    }

    /// Reset smoothing state (e.g. when capture restarts)
    pub fn reset(&mut self) {
        for value in self.smoothed.iter_mut() {
            *value = 0.0;
        }
        debug!("Spectrum analyser reset");
    }

    /// Get current configuration
    pub fn config(&self) -> &SpectrumConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_RATE: f32 = 44_100.0;

    fn generate_tone_at_bin(config: &SpectrumConfig, bin: usize, amplitude: f32) -> Vec<f32> {
        let frequency = bin as f32 * SAMPLE_RATE / config.fft_size as f32;
        (0..config.fft_size)
            .map(|i| {
                let t = i as f32 / SAMPLE_RATE;
                amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin()
            })
            .collect()
    }

    #[test]
    fn test_config_default() {
        let config = SpectrumConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bin_count(), 256);
    }

    #[test]
    fn test_config_validation() {
        let mut config = SpectrumConfig::default();
        config.fft_size = 500; // not a power of two
        assert!(config.validate().is_err());

        config.fft_size = 512;
        config.smoothing = 1.0;
        assert!(config.validate().is_err());

        config.smoothing = 0.8;
        config.min_decibels = -20.0; // above max
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_silence_produces_zero_bins() {
        let mut analyzer = SpectrumAnalyzer::new().unwrap();
        let silence = vec![0.0; 512];

        let frame = analyzer.analyze(&silence).unwrap();
        assert_eq!(frame.len(), 256);
        assert!(frame.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_tone_peaks_at_expected_bin() {
        let config = SpectrumConfig {
            smoothing: 0.0, // no history, single frame is exact
            ..Default::default()
        };
        let mut analyzer = SpectrumAnalyzer::with_config(config.clone()).unwrap();

        let tone = generate_tone_at_bin(&config, 10, 0.5);
        let frame = analyzer.analyze(&tone).unwrap();

        assert!(frame[10] > 200, "tone bin too quiet: {}", frame[10]);
        // Energy should be concentrated near the tone, not spread evenly
        assert!(frame[128] < frame[10] / 4);
    }

    #[test]
    fn test_smoothing_decays_after_burst() {
        let config = SpectrumConfig::default(); // smoothing 0.8
        let mut analyzer = SpectrumAnalyzer::with_config(config.clone()).unwrap();

        let tone = generate_tone_at_bin(&config, 10, 0.5);
        let loud = analyzer.analyze(&tone).unwrap();

        let silence = vec![0.0; config.fft_size];
        let decayed = analyzer.analyze(&silence).unwrap();

        // Magnitude persists through smoothing but must not grow
        assert!(decayed[10] > 0);
        assert!(decayed[10] <= loud[10]);
    }

    #[test]
    fn test_reset_clears_history() {
        let config = SpectrumConfig::default();
        let mut analyzer = SpectrumAnalyzer::with_config(config.clone()).unwrap();

        let tone = generate_tone_at_bin(&config, 10, 0.5);
        analyzer.analyze(&tone).unwrap();

        analyzer.reset();

        let silence = vec![0.0; config.fft_size];
        let frame = analyzer.analyze(&silence).unwrap();
        assert!(frame.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_insufficient_data_error() {
        let mut analyzer = SpectrumAnalyzer::new().unwrap();
        let short = vec![0.0; 100];

        let result = analyzer.analyze(&short);
        match result {
            Err(SpectrumError::InsufficientData(required)) => {
                assert_eq!(required, 512);
            }
            _ => panic!("Expected InsufficientData error"),
        }
    }
}
