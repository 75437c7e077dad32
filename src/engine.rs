// Engine facade
//
// Owns the long-lived pieces (capture loop, session store, cue player,
// clock) and runs at most one start sequence at a time. Each sequence gets
// its own controller thread; the engine only routes commands to it and
// exposes events and snapshots to the caller.

use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::capture::{CaptureEvent, CaptureLoop};
use crate::clock::{Clock, MonotonicClock};
use crate::config::{ConfigError, EngineConfig, SequenceConfig};
use crate::cues::CuePlayer;
use crate::devices::CaptureDevice;
use crate::sequence::{
    Command, FailureReason, JitterSource, Session, SessionRuntime, SessionState, UniformJitter,
};
use crate::session::{SessionReport, SessionStore, SessionSummary};
use crate::sink::RecordingSink;

/// Error type for engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),

    #[error("a session is already running")]
    SessionActive,

    #[error("capture device is unavailable")]
    DeviceUnavailable,
}

/// Events pushed to subscribers as a session progresses.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    StateChanged { state: SessionState },
    CalibrationFinished { fps: f64, degraded: bool },
    PhaseStarted { state: SessionState, wait_secs: f64 },
    RecordingStarted,
    RecordingStopped { report: SessionReport },
    SessionCancelled,
    SessionFailed { reason: FailureReason },
    DeviceLost,
}

/// Point-in-time view of the engine for UIs and diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub state: SessionState,
    pub session_id: Option<String>,
    pub calibrated_fps: Option<f64>,
    pub calibration_degraded: bool,
    /// Frames the capture loop has ever delivered.
    pub frames_seen: u64,
    /// Frames stamped into the current session's ledger.
    pub recorded_frames: u64,
    pub dropped_after_finish: u64,
    pub device_failed: bool,
}

pub struct Engine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    cues: Arc<dyn CuePlayer>,
    capture: CaptureLoop,
    capture_events: Receiver<CaptureEvent>,
    store: Arc<SessionStore>,
    events_tx: Sender<EngineEvent>,
    events_rx: Receiver<EngineEvent>,
    current: RwLock<Option<Arc<Session>>>,
    commands: Mutex<Option<Sender<Command>>>,
    controller: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Spin up the capture loop and open the session store. The device is
    /// owned by the engine from here on.
    pub fn new(
        config: EngineConfig,
        device: Box<dyn CaptureDevice>,
        cues: Arc<dyn CuePlayer>,
    ) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock);
        let (capture_tx, capture_events) = unbounded();
        let capture = CaptureLoop::spawn(device, clock.clone(), capture_tx);
        let store = Arc::new(SessionStore::open(&config.storage_path));
        let (events_tx, events_rx) = unbounded();

        Self {
            config,
            clock,
            cues,
            capture,
            capture_events,
            store,
            events_tx,
            events_rx,
            current: RwLock::new(None),
            commands: Mutex::new(None),
            controller: Mutex::new(None),
        }
    }

    /// Start one full sequence: calibrate, prepare the sink, count down,
    /// record. Returns the new session's id.
    pub fn begin_session(
        &self,
        config: SequenceConfig,
        sink: Box<dyn RecordingSink>,
    ) -> Result<String, EngineError> {
        self.begin_session_with(config, sink, Box::new(UniformJitter))
    }

    /// Like `begin_session` but with an injected jitter source, so callers
    /// can pin the randomized phase durations.
    pub fn begin_session_with(
        &self,
        config: SequenceConfig,
        sink: Box<dyn RecordingSink>,
        jitter: Box<dyn JitterSource>,
    ) -> Result<String, EngineError> {
        config.validate()?;

        let handle = self.capture.handle();
        if handle.is_failed() {
            return Err(EngineError::DeviceUnavailable);
        }
        if let Some(session) = self.current.read().as_ref() {
            if !session.state().is_terminal() {
                return Err(EngineError::SessionActive);
            }
        }
        if let Some(thread) = self.controller.lock().take() {
            let _ = thread.join();
        }

        let session = Arc::new(Session::new(config));
        let id = session.id().to_string();
        handle.attach_ledger(session.ledger().clone());

        let (cmd_tx, cmd_rx) = unbounded();
        let runtime = SessionRuntime {
            session: session.clone(),
            capture: handle,
            clock: self.clock.clone(),
            cues: self.cues.clone(),
            store: self.store.clone(),
            commands: cmd_rx,
            capture_events: self.capture_events.clone(),
            events: self.events_tx.clone(),
            calibration_window: self.config.calibration_window(),
            prepare_timeout: self.config.prepare_timeout(),
            quality: self.config.quality,
            jitter,
        };

        *self.current.write() = Some(session);
        *self.commands.lock() = Some(cmd_tx);
        let thread = std::thread::spawn(move || runtime.run(sink));
        *self.controller.lock() = Some(thread);

        log::info!("[Engine] session {} started", id);
        Ok(id)
    }

    /// Abort the countdown. A no-op once recording or with no session.
    pub fn cancel_session(&self) {
        self.send_command(Command::Cancel);
    }

    /// End the recording. A no-op before the start fires.
    pub fn stop_recording(&self) {
        self.send_command(Command::Stop);
    }

    fn send_command(&self, command: Command) {
        let commands = self.commands.lock();
        match commands.as_ref() {
            Some(tx) => {
                if tx.send(command).is_err() {
                    log::debug!("[Engine] {:?} after the controller exited", command);
                }
            }
            None => log::debug!("[Engine] {:?} with no session", command),
        }
    }

    /// Event stream. Clones share one queue, so keep a single consumer.
    pub fn events(&self) -> Receiver<EngineEvent> {
        self.events_rx.clone()
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let handle = self.capture.handle();
        let current = self.current.read();
        match current.as_ref() {
            Some(session) => {
                let calibration = session.calibration();
                EngineSnapshot {
                    state: session.state(),
                    session_id: Some(session.id().to_string()),
                    calibrated_fps: calibration.map(|c| c.fps),
                    calibration_degraded: calibration.map(|c| c.degraded).unwrap_or(false),
                    frames_seen: handle.frames_seen(),
                    recorded_frames: session.ledger().frame_count(),
                    dropped_after_finish: session.ledger().dropped_after_finish(),
                    device_failed: handle.is_failed(),
                }
            }
            None => EngineSnapshot {
                state: SessionState::Idle,
                session_id: None,
                calibrated_fps: None,
                calibration_degraded: false,
                frames_seen: handle.frames_seen(),
                recorded_frames: 0,
                dropped_after_finish: 0,
                device_failed: handle.is_failed(),
            },
        }
    }

    pub fn latest_frame(&self) -> Option<Arc<crate::devices::Frame>> {
        self.capture.handle().latest_frame()
    }

    /// Newest persisted sessions first.
    pub fn recent_sessions(&self, limit: usize) -> anyhow::Result<Vec<SessionSummary>> {
        self.store.recent(limit)
    }

    pub fn storage_root(&self) -> &Path {
        self.store.root()
    }

    /// Block until the current controller thread exits. Test and shutdown
    /// helper; sessions normally just run to a terminal state on their own.
    pub fn join_session(&self) {
        if let Some(thread) = self.controller.lock().take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.cancel_session();
        self.stop_recording();
        self.join_session();
    }
}
