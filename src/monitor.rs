/// Breath monitor service module
///
/// Ties the capture source and the blow detector together and exposes
/// the consumer-facing surface: a status snapshot (`is_listening`,
/// `is_blowing`, current level) and a stream of blow events.
///
/// Capture and detection start together and are torn down together. The
/// pump runs on a dedicated thread because platform audio streams are
/// not `Send`; the source is built on that thread from a `Send` factory.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::capture::{CaptureError, FrameSource};
use crate::detector::{BreathDetector, DetectorConfig, DetectorError};

/// How long the pump waits for a frame per iteration (~60 Hz cadence)
const FRAME_TIMEOUT: Duration = Duration::from_millis(16);

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Audio capture unavailable: {0}")]
    CaptureUnavailable(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] DetectorError),
}

/// One detected blow
#[derive(Debug, Clone)]
pub struct BlowEvent {
    /// Timestamp when the blow was detected (microseconds since epoch)
    pub timestamp: i64,

    /// Detection level of the triggering frame (0.0 - 1.0)
    pub level: f32,
}

/// Consumer-facing snapshot of the monitor
#[derive(Debug, Clone, Default)]
pub struct MonitorStatus {
    /// Capture is running and frames are being evaluated
    pub is_listening: bool,

    /// A trigger's deactivation window is currently open
    pub is_blowing: bool,

    /// Detection level of the most recent frame (0.0 - 1.0)
    pub audio_level: f32,

    /// Frames evaluated since the last reset
    pub frames_processed: u64,

    /// Blows detected since the last reset
    pub blows_detected: u64,

    /// Capture failed terminally (permission denied / no device); the
    /// consumer should fall back to a manual trigger
    pub unavailable: bool,
}

/// Builds a frame source on the pump thread
pub type SourceFactory =
    Box<dyn FnOnce() -> Result<Box<dyn FrameSource>, CaptureError> + Send + 'static>;

struct MonitorState {
    status: MonitorStatus,
    worker: Option<std::thread::JoinHandle<()>>,
}

/// Breath monitor
pub struct BreathMonitor {
    config: DetectorConfig,
    state: Arc<RwLock<MonitorState>>,
    stop_flag: Arc<AtomicBool>,
    event_tx: mpsc::UnboundedSender<BlowEvent>,
    event_rx: Mutex<mpsc::UnboundedReceiver<BlowEvent>>,
}

impl BreathMonitor {
    /// Create a monitor with the given detector configuration
    pub fn new(config: DetectorConfig) -> Result<Self, MonitorError> {
        config.validate()?;

        info!("Initializing breath monitor");
        info!(
            "Threshold: {} x{}, cooldown: {}ms",
            config.threshold, config.sensitivity, config.cooldown_ms
        );

        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let state = MonitorState {
            status: MonitorStatus::default(),
            worker: None,
        };

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(state)),
            stop_flag: Arc::new(AtomicBool::new(false)),
            event_tx,
            event_rx: Mutex::new(event_rx),
        })
    }

    /// Start capture and detection
    ///
    /// The factory runs on the pump thread and builds the frame source
    /// there. On `Unavailable` the monitor records a terminal state,
    /// leaves `is_listening` false, and refuses later starts.
    pub async fn start(&self, factory: SourceFactory) -> Result<(), MonitorError> {
        {
            let state = self.state.read().await;

            if state.status.is_listening {
                warn!("Monitor already listening");
                return Ok(());
            }

            if state.status.unavailable {
                return Err(MonitorError::CaptureUnavailable(
                    "input was previously unavailable".to_string(),
                ));
            }
        }

        self.stop_flag.store(false, Ordering::SeqCst);

        let (startup_tx, startup_rx) = oneshot::channel();
        let shared = self.state.clone();
        let stop_flag = self.stop_flag.clone();
        let event_tx = self.event_tx.clone();
        let detector_config = self.config.clone();

        let worker = std::thread::Builder::new()
            .name("breath-capture".to_string())
            .spawn(move || {
                pump(
                    factory,
                    detector_config,
                    shared,
                    stop_flag,
                    event_tx,
                    startup_tx,
                );
            })
            .map_err(|e| MonitorError::CaptureUnavailable(e.to_string()))?;

        // Wait for the capture thread to report its startup outcome
        let outcome = startup_rx
            .await
            .unwrap_or_else(|_| Err(CaptureError::Unavailable("capture thread died".to_string())));

        let mut state = self.state.write().await;

        match outcome {
            Ok(()) => {
                state.status.is_listening = true;
                state.worker = Some(worker);
                info!("Breath monitor listening");
                Ok(())
            }
            Err(e) => {
                // The thread has already released the source and exited
                let _ = worker.join();
                state.status.unavailable = true;
                state.status.is_listening = false;
                warn!("Capture unavailable: {}", e);
                Err(MonitorError::CaptureUnavailable(e.to_string()))
            }
        }
    }

    /// Stop capture and detection
    ///
    /// Idempotent and safe to call before `start`.
    pub async fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);

        let worker = {
            let mut state = self.state.write().await;
            state.status.is_listening = false;
            state.status.is_blowing = false;
            state.worker.take()
        };

        if let Some(handle) = worker {
            let join = tokio::task::spawn_blocking(move || handle.join());
            if join.await.map(|r| r.is_err()).unwrap_or(true) {
                error!("Capture thread did not shut down cleanly");
            }
            info!("Breath monitor stopped");
        }
    }

    /// Get the current status snapshot
    pub async fn status(&self) -> MonitorStatus {
        self.state.read().await.status.clone()
    }

    /// Reset counters and level
    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        state.status.frames_processed = 0;
        state.status.blows_detected = 0;
        state.status.audio_level = 0.0;
        state.status.is_blowing = false;
        info!("Monitor reset");
    }

    /// Get the next blow event (non-blocking)
    pub async fn try_recv_event(&self) -> Option<BlowEvent> {
        let mut rx = self.event_rx.lock().await;
        rx.try_recv().ok()
    }

    /// Get the next blow event (blocking)
    pub async fn recv_event(&self) -> Option<BlowEvent> {
        let mut rx = self.event_rx.lock().await;
        rx.recv().await
    }

    /// Get current configuration
    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }
}

/// Capture pump: owns the source and the detector for the session
fn pump(
    factory: SourceFactory,
    detector_config: DetectorConfig,
    shared: Arc<RwLock<MonitorState>>,
    stop_flag: Arc<AtomicBool>,
    event_tx: mpsc::UnboundedSender<BlowEvent>,
    startup_tx: oneshot::Sender<Result<(), CaptureError>>,
) {
    let mut source = match factory() {
        Ok(source) => source,
        Err(e) => {
            let _ = startup_tx.send(Err(e));
            return;
        }
    };

    if let Err(e) = source.start() {
        source.stop();
        let _ = startup_tx.send(Err(e));
        return;
    }

    // Detector config was validated by the monitor constructor
    let mut detector = match BreathDetector::with_config(detector_config) {
        Ok(detector) => detector,
        Err(e) => {
            source.stop();
            let _ = startup_tx.send(Err(CaptureError::Unavailable(e.to_string())));
            return;
        }
    };

    if startup_tx.send(Ok(())).is_err() {
        source.stop();
        return;
    }

    while !stop_flag.load(Ordering::SeqCst) {
        match source.next_frame(FRAME_TIMEOUT) {
            Ok(Some(frame)) => {
                let now = Instant::now();
                let triggered = detector.evaluate(&frame, now);

                let mut state = shared.blocking_write();
                state.status.frames_processed += 1;
                state.status.audio_level = detector.level();
                state.status.is_blowing = detector.is_active(now);

                if triggered {
                    state.status.blows_detected += 1;
                    drop(state);

                    let event = BlowEvent {
                        timestamp: current_timestamp_micros(),
                        level: detector.level(),
                    };

                    if event_tx.send(event).is_err() {
                        debug!("Event receiver dropped");
                    }
                }
            }
            Ok(None) => {
                // No frame within the timeout; let the active window lapse
                let now = Instant::now();
                let mut state = shared.blocking_write();
                state.status.is_blowing = detector.is_active(now);
            }
            Err(CaptureError::Unavailable(e)) => {
                error!("Capture became unavailable: {}", e);
                let mut state = shared.blocking_write();
                state.status.unavailable = true;
                state.status.is_listening = false;
                state.status.is_blowing = false;
                break;
            }
            Err(e) => {
                // Transient frame-read error: skip the frame, keep state
                warn!("Frame read error (skipping): {}", e);
            }
        }
    }

    source.stop();

    // Last write wins: a final frame evaluated between the stop request
    // and this point must not leave the blowing flag latched
    let mut state = shared.blocking_write();
    state.status.is_blowing = false;
    drop(state);

    debug!("Capture pump exited");
}

/// Current wall-clock time in microseconds
fn current_timestamp_micros() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}
