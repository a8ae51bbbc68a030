/// Breath detection service binary
///
/// Standalone service that listens on the microphone and logs each
/// detected blow. Intended as the backend for a UI that reacts to
/// `is_blowing` (the UI itself is out of scope here).

use anyhow::{Context, Result};
use breath_detector::{BreathMonitor, DetectorConfig, FrameSource, MicCapture, SpectrumConfig};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("breath_detector=debug".parse()?),
        )
        .init();

    info!("Starting breath detection service");

    let config = load_config().context("failed to load configuration")?;
    let device = std::env::var("BREATH_DEVICE").ok();

    let monitor = BreathMonitor::new(config)?;

    let spectrum_config = SpectrumConfig::default();
    let started = monitor
        .start(Box::new(move || {
            let capture = MicCapture::new(device, spectrum_config)?;
            Ok(Box::new(capture) as Box<dyn FrameSource>)
        }))
        .await;

    if let Err(e) = started {
        // Stay up in the not-listening state so a fronting UI can offer
        // its manual fallback; only Ctrl-C ends the session.
        warn!("Microphone unavailable, no blow detection: {}", e);
        info!("Idling without capture, press Ctrl-C to exit");
        tokio::signal::ctrl_c().await?;
        return Ok(());
    }

    info!("Listening for blows...");

    // Event loop
    loop {
        match monitor.recv_event().await {
            Some(event) => {
                info!(
                    "Blow detected! level={:.4}, timestamp={}",
                    event.level, event.timestamp
                );
            }
            None => {
                error!("Event channel closed, shutting down");
                break;
            }
        }
    }

    monitor.stop().await;
    info!("Breath detection service stopped");

    Ok(())
}

/// Load detector configuration from a JSON file or the environment
///
/// `BREATH_CONFIG` points at a JSON file; individual environment
/// variables override its values (or the defaults).
fn load_config() -> Result<DetectorConfig> {
    let mut config = match std::env::var("BREATH_CONFIG") {
        Ok(path) => {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("cannot read config file {}", path))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("invalid config file {}", path))?
        }
        Err(_) => DetectorConfig::default(),
    };

    if let Ok(value) = std::env::var("BREATH_THRESHOLD") {
        config.threshold = value.parse().context("invalid BREATH_THRESHOLD")?;
    }

    if let Ok(value) = std::env::var("BREATH_SENSITIVITY") {
        config.sensitivity = value.parse().context("invalid BREATH_SENSITIVITY")?;
    }

    if let Ok(value) = std::env::var("BREATH_COOLDOWN_MS") {
        config.cooldown_ms = value.parse().context("invalid BREATH_COOLDOWN_MS")?;
    }

    config.validate()?;
    Ok(config)
}
