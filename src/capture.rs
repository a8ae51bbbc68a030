/// Audio capture module
///
/// Abstracts the microphone/analysis pipeline behind the `FrameSource`
/// trait so the detection logic can be driven by synthetic frames in
/// tests. The real implementation, `MicCapture`, owns a cpal input
/// stream feeding the frame buffer; `next_frame` pulls one FFT window
/// and runs it through the spectrum analyser, so the caller's poll
/// cadence sets the analysis rate.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::frame_buffer::FrameBuffer;
use crate::spectrum::{SpectrumAnalyzer, SpectrumConfig, SpectrumError, SpectrumFrame};

/// How often `next_frame` re-checks the buffer while waiting
const POLL_INTERVAL: Duration = Duration::from_millis(2);

#[derive(Error, Debug)]
pub enum CaptureError {
    /// Input device missing or permission denied. Terminal for the
    /// session; the caller falls back to a manual trigger.
    #[error("Audio input unavailable: {0}")]
    Unavailable(String),

    #[error("Unsupported sample format: {0}")]
    UnsupportedFormat(String),

    #[error("Spectrum analysis failed: {0}")]
    Spectrum(#[from] SpectrumError),
}

/// A source of spectrum frames
///
/// `stop` must be idempotent and safe to call before `start`. A return
/// of `Ok(None)` from `next_frame` means no frame was ready within the
/// timeout; the caller keeps its state and polls again.
#[cfg_attr(test, mockall::automock)]
pub trait FrameSource {
    /// Acquire the input device and begin delivering frames
    fn start(&mut self) -> Result<(), CaptureError>;

    /// Wait up to `timeout` for the next analysis frame
    fn next_frame(&mut self, timeout: Duration) -> Result<Option<SpectrumFrame>, CaptureError>;

    /// Release the input device and any analysis state
    fn stop(&mut self);
}

/// Microphone capture backed by cpal
///
/// The cpal callback downmixes to mono f32 and writes into the shared
/// frame buffer; analysis happens on the polling side. The stream is a
/// scoped resource: `stop` (or drop) releases it on every exit path.
pub struct MicCapture {
    preferred_device: Option<String>,
    analyzer: SpectrumAnalyzer,
    buffer: Arc<FrameBuffer>,
    stream: Option<cpal::Stream>,
}

impl MicCapture {
    /// Create a capture source; the device is not touched until `start`
    pub fn new(
        preferred_device: Option<String>,
        spectrum_config: SpectrumConfig,
    ) -> Result<Self, CaptureError> {
        let analyzer = SpectrumAnalyzer::with_config(spectrum_config)?;

        Ok(Self {
            preferred_device,
            analyzer,
            buffer: Arc::new(FrameBuffer::new()),
            stream: None,
        })
    }

    /// List input device names for configuration/debugging
    pub fn list_devices() -> Result<Vec<String>, CaptureError> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| CaptureError::Unavailable(e.to_string()))?;

        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }

    fn find_device(&self) -> Result<cpal::Device, CaptureError> {
        let host = cpal::default_host();

        match &self.preferred_device {
            Some(name) => {
                let mut devices = host
                    .input_devices()
                    .map_err(|e| CaptureError::Unavailable(e.to_string()))?;
                devices
                    .find(|d| d.name().map(|n| &n == name).unwrap_or(false))
                    .ok_or_else(|| {
                        CaptureError::Unavailable(format!("input device '{}' not found", name))
                    })
            }
            None => host
                .default_input_device()
                .ok_or_else(|| CaptureError::Unavailable("no default input device".to_string())),
        }
    }

    fn build_stream(&self, device: &cpal::Device) -> Result<cpal::Stream, CaptureError> {
        let default_config = device
            .default_input_config()
            .map_err(|e| CaptureError::Unavailable(e.to_string()))?;
        let format = default_config.sample_format();
        let stream_config: StreamConfig = default_config.into();
        let channels = usize::from(stream_config.channels.max(1));

        debug!(
            "Capture config: format={:?}, sample_rate={}Hz, channels={}",
            format, stream_config.sample_rate.0, channels
        );

        let err_fn = |err| warn!("Audio stream error: {}", err);

        // Every supported sample type is converted to f32 in the
        // callback so the analysis side stays format-agnostic
        let stream = match format {
            SampleFormat::F32 => {
                let buffer = self.buffer.clone();
                device
                    .build_input_stream(
                        &stream_config,
                        move |data: &[f32], _| {
                            write_downmixed(&buffer, data, channels, |s| s);
                        },
                        err_fn,
                        None,
                    )
                    .map_err(|e| CaptureError::Unavailable(e.to_string()))?
            }
            SampleFormat::I16 => {
                let buffer = self.buffer.clone();
                device
                    .build_input_stream(
                        &stream_config,
                        move |data: &[i16], _| {
                            write_downmixed(&buffer, data, channels, |s| {
                                s as f32 / 32_768.0
                            });
                        },
                        err_fn,
                        None,
                    )
                    .map_err(|e| CaptureError::Unavailable(e.to_string()))?
            }
            SampleFormat::U16 => {
                let buffer = self.buffer.clone();
                device
                    .build_input_stream(
                        &stream_config,
                        move |data: &[u16], _| {
                            write_downmixed(&buffer, data, channels, |s| {
                                (s as f32 - 32_768.0) / 32_768.0
                            });
                        },
                        err_fn,
                        None,
                    )
                    .map_err(|e| CaptureError::Unavailable(e.to_string()))?
            }
            other => {
                return Err(CaptureError::UnsupportedFormat(format!("{:?}", other)));
            }
        };

        Ok(stream)
    }
}

impl FrameSource for MicCapture {
    fn start(&mut self) -> Result<(), CaptureError> {
        if self.stream.is_some() {
            warn!("Capture already started");
            return Ok(());
        }

        let device = self.find_device()?;
        let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());

        let stream = self.build_stream(&device)?;
        stream
            .play()
            .map_err(|e| CaptureError::Unavailable(e.to_string()))?;

        self.stream = Some(stream);
        info!("Capture started on '{}'", device_name);

        Ok(())
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<Option<SpectrumFrame>, CaptureError> {
        if self.stream.is_none() {
            return Ok(None);
        }

        let window = self.analyzer.config().fft_size;
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(samples) = self.buffer.read_window(window) {
                let frame = self.analyzer.analyze(&samples)?;
                return Ok(Some(frame));
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }

            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.pause() {
                warn!("Failed to pause audio stream: {}", e);
            }
            drop(stream);
            info!("Capture stopped");
        }

        self.buffer.clear();
        self.analyzer.reset();
    }
}

impl Drop for MicCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Downmix interleaved input to mono and append it to the buffer
fn write_downmixed<T: Copy>(
    buffer: &FrameBuffer,
    data: &[T],
    channels: usize,
    convert: impl Fn(T) -> f32,
) {
    if channels <= 1 {
        let mono: Vec<f32> = data.iter().map(|&s| convert(s)).collect();
        buffer.write(&mono);
        return;
    }

    let mono: Vec<f32> = data
        .chunks(channels)
        .map(|frame| frame.iter().map(|&s| convert(s)).sum::<f32>() / frame.len() as f32)
        .collect();
    buffer.write(&mono);
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_stop_before_start_is_safe() {
        let mut capture = MicCapture::new(None, SpectrumConfig::default()).unwrap();

        // Must not panic, repeatedly
        capture.stop();
        capture.stop();
    }

    #[test]
    fn test_next_frame_before_start_yields_nothing() {
        let mut capture = MicCapture::new(None, SpectrumConfig::default()).unwrap();

        let frame = capture.next_frame(Duration::from_millis(1)).unwrap();
        assert!(frame.is_none());
    }

    #[test]
    fn test_downmix_stereo_averages_channels() {
        let buffer = FrameBuffer::with_capacity(100);
        let interleaved: Vec<f32> = vec![0.2, 0.4, -0.6, -0.2];

        write_downmixed(&buffer, &interleaved, 2, |s| s);

        let mono = buffer.read(2).unwrap();
        assert_relative_eq!(mono[0], 0.3, epsilon = 1e-6);
        assert_relative_eq!(mono[1], -0.4, epsilon = 1e-6);
    }

    #[test]
    fn test_downmix_i16_conversion() {
        let buffer = FrameBuffer::with_capacity(100);
        let data: Vec<i16> = vec![i16::MAX, i16::MIN];

        write_downmixed(&buffer, &data, 1, |s| s as f32 / 32_768.0);

        let mono = buffer.read(2).unwrap();
        assert!(mono[0] > 0.99 && mono[0] <= 1.0);
        assert_relative_eq!(mono[1], -1.0, epsilon = 1e-6);
    }
}
