/// Breath detector library
///
/// Detects breath/blow bursts on a live microphone input using two-band
/// spectral energy analysis, with cooldown-limited triggers and a
/// consumer-facing listening/blowing status surface.

pub mod capture;
pub mod detector;
pub mod frame_buffer;
pub mod monitor;
pub mod spectrum;

// Re-export main types
pub use capture::{CaptureError, FrameSource, MicCapture};
pub use detector::{BreathDetector, DetectorConfig, DetectorError};
pub use frame_buffer::{FrameBuffer, PcmSample};
pub use monitor::{BlowEvent, BreathMonitor, MonitorError, MonitorStatus, SourceFactory};
pub use spectrum::{BinMagnitude, SpectrumAnalyzer, SpectrumConfig, SpectrumError, SpectrumFrame};
