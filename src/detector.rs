/// Blow detection module
///
/// Decides whether a spectrum frame represents a breath burst. Detection
/// level is the higher of the full-band mean and the low-band mean: a
/// full-spectrum average alone under-detects close-mic breath noise,
/// which concentrates in the low bins. Triggers are rate-limited by a
/// cooldown, and a separate deactivation window controls how long the
/// "blowing" flag stays up for consumers.
///
/// Time is injected into `evaluate` so the decision logic is fully
/// deterministic under test.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace};

use crate::spectrum::{BinMagnitude, MAX_BIN_MAGNITUDE};

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Blow detector configuration
///
/// Immutable per detector instance. Defaults follow the tuning that
/// worked on phone microphones: low threshold, modest sensitivity boost,
/// one-second cooldown.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Base detection threshold on the normalized level (0.0 - 1.0)
    pub threshold: f32,

    /// Threshold multiplier; the effective threshold is
    /// threshold * sensitivity
    pub sensitivity: f32,

    /// Minimum time between two accepted triggers, in milliseconds
    pub cooldown_ms: u64,

    /// Number of lowest-frequency bins forming the low band
    pub low_band_bins: usize,

    /// How long the active flag stays up after a trigger, in milliseconds
    pub deactivation_ms: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            threshold: 0.02,
            sensitivity: 1.5,
            cooldown_ms: 1000,
            low_band_bins: 50,
            deactivation_ms: 500,
        }
    }
}

impl DetectorConfig {
    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), DetectorError> {
        if self.threshold <= 0.0 || self.threshold > 1.0 {
            return Err(DetectorError::InvalidConfig(
                "threshold must be in (0.0, 1.0]".to_string(),
            ));
        }

        if self.sensitivity <= 0.0 {
            return Err(DetectorError::InvalidConfig(
                "sensitivity must be positive".to_string(),
            ));
        }

        if self.low_band_bins == 0 {
            return Err(DetectorError::InvalidConfig(
                "low_band_bins must be greater than 0".to_string(),
            ));
        }

        if self.deactivation_ms == 0 {
            return Err(DetectorError::InvalidConfig(
                "deactivation_ms must be greater than 0".to_string(),
            ));
        }

        // The active flag must never outlive the cooldown
        if self.deactivation_ms > self.cooldown_ms {
            return Err(DetectorError::InvalidConfig(
                "deactivation_ms must not exceed cooldown_ms".to_string(),
            ));
        }

        Ok(())
    }

    /// Cooldown as a Duration
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    /// Deactivation window as a Duration
    pub fn deactivation(&self) -> Duration {
        Duration::from_millis(self.deactivation_ms)
    }
}

/// Detector state, mutated only by `evaluate`
#[derive(Debug, Clone, Copy, Default)]
struct DetectorState {
    last_trigger: Option<Instant>,
    active_until: Option<Instant>,
    level: f32,
}

/// Breath/blow detector
pub struct BreathDetector {
    config: DetectorConfig,
    state: DetectorState,
}

impl BreathDetector {
    /// Create a detector with default configuration
    pub fn new() -> Self {
        Self {
            config: DetectorConfig::default(),
            state: DetectorState::default(),
        }
    }

    /// Create a detector with custom configuration
    pub fn with_config(config: DetectorConfig) -> Result<Self, DetectorError> {
        config.validate()?;

        debug!("Initializing breath detector with config: {:?}", config);

        Ok(Self {
            config,
            state: DetectorState::default(),
        })
    }

    /// Evaluate one spectrum frame at time `now`
    ///
    /// Returns true when this frame fires a blow trigger. At most one
    /// trigger is accepted per cooldown period; the caller observes the
    /// post-trigger window via `is_active`.
    pub fn evaluate(&mut self, bins: &[BinMagnitude], now: Instant) -> bool {
        let full_band = Self::band_level(bins);
        let low_band = Self::band_level(&bins[..self.config.low_band_bins.min(bins.len())]);

        // Max of the two estimates; low frequencies carry most of the
        // breath-noise energy on close mics
        let level = full_band.max(low_band);
        self.state.level = level;

        trace!(
            "Frame evaluation: full={:.4}, low={:.4}, level={:.4}",
            full_band, low_band, level
        );

        let effective_threshold = self.config.threshold * self.config.sensitivity;
        let cooled_down = match self.state.last_trigger {
            Some(last) => now.duration_since(last) > self.config.cooldown(),
            None => true,
        };

        let triggered = level > effective_threshold && cooled_down;

        if triggered {
            debug!("Blow detected at level {:.4}", level);
            self.state.last_trigger = Some(now);
            self.state.active_until = Some(now + self.config.deactivation());
        }

        triggered
    }

    /// Mean bin magnitude normalized to [0, 1]
    fn band_level(bins: &[BinMagnitude]) -> f32 {
        if bins.is_empty() {
            return 0.0;
        }

        let sum: u32 = bins.iter().map(|&b| b as u32).sum();
        sum as f32 / bins.len() as f32 / MAX_BIN_MAGNITUDE
    }

    /// Whether a trigger's deactivation window is still open at `now`
    pub fn is_active(&self, now: Instant) -> bool {
        match self.state.active_until {
            Some(until) => now < until,
            None => false,
        }
    }

    /// Detection level of the most recently evaluated frame
    pub fn level(&self) -> f32 {
        self.state.level
    }

    /// Time of the last accepted trigger, if any
    pub fn last_trigger(&self) -> Option<Instant> {
        self.state.last_trigger
    }

    /// Reset detector state (level, trigger history, active window)
    pub fn reset(&mut self) {
        self.state = DetectorState::default();
        debug!("Breath detector reset");
    }

    /// Get current configuration
    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }
}

impl Default for BreathDetector {
    fn default() -> Self {
        Self::new()
    }
}
