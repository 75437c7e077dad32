// Start-sequence state machine
//
// One session = one run through the phased countdown. The controller runs
// on its own thread and owns the sink for the whole session via SinkGuard,
// so every exit path (stop, cancel, device loss, prepare timeout) releases
// hardware exactly once. The synchronized start itself lives in
// `Session::fire_start` and does three things back to back with nothing in
// between: begin the sink, play the beep, stamp the clock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam_channel::{after, bounded, select, Receiver, Sender};
use parking_lot::RwLock;
use serde::Serialize;
use uuid::Uuid;

use crate::calibration::{self, CalibrationOutcome};
use crate::capture::{CaptureEvent, CaptureHandle};
use crate::clock::Clock;
use crate::config::{JitterRange, SequenceConfig};
use crate::cues::{Cue, CuePlayer};
use crate::engine::EngineEvent;
use crate::ledger::{ReportContext, TimingLedger};
use crate::session::SessionStore;
use crate::sink::{QualityProfile, RecordingSink, SinkError, SinkGuard};

// ============================================================================
// Constants
// ============================================================================

/// How much wall time may separate `begin()` returning and the start stamp.
/// Anything slower means the sink is doing slow work in `begin()` that
/// belongs in `prepare()`.
pub const START_SKEW_BUDGET: Duration = Duration::from_millis(5);

/// Default ceiling on sink preparation (`EngineConfig.prepare_timeout_secs`
/// overrides it). A sink still preparing after this is abandoned to an
/// orphan thread that releases it when it finally returns.
pub const PREPARE_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// States and commands
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Calibrating,
    Preparing,
    GoToStart,
    InPosition,
    Set,
    Recording,
    Finished,
    Cancelled,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Finished | SessionState::Cancelled | SessionState::Failed
        )
    }
}

/// External commands a running session accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Abort the sequence. Honored in every pre-start state, ignored once
    /// recording (the race is already running).
    Cancel,
    /// End the recording. Ignored before the start fires.
    Stop,
}

/// Why a session ended in `Failed`.
#[derive(Debug, Clone, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    #[error("capture device '{device}' unavailable: {detail}")]
    DeviceUnavailable { device: String, detail: String },

    #[error("sink preparation failed: {detail}")]
    SinkPrepare { detail: String },

    #[error("recording start failed: {detail}")]
    SinkBegin { detail: String },
}

// ============================================================================
// Jitter
// ============================================================================

/// Source of the randomized phase durations. A trait so tests can script
/// exact draws.
pub trait JitterSource: Send {
    fn draw(&mut self, range: JitterRange) -> Duration;
}

/// Uniform draw over the configured range, endpoints included.
pub struct UniformJitter;

impl JitterSource for UniformJitter {
    fn draw(&mut self, range: JitterRange) -> Duration {
        use rand::Rng;
        let (min, max) = (range.min_secs.min(range.max_secs), range.max_secs.max(range.min_secs));
        let secs = if max > min {
            rand::thread_rng().gen_range(min..=max)
        } else {
            min
        };
        Duration::from_secs_f64(secs.max(0.0))
    }
}

// ============================================================================
// Session
// ============================================================================

/// One start-sequence attempt: identity, config, state, and the timing
/// ledger that outlives the countdown.
pub struct Session {
    id: String,
    config: SequenceConfig,
    state: RwLock<SessionState>,
    calibration: RwLock<Option<CalibrationOutcome>>,
    ledger: Arc<TimingLedger>,
    start_fired: AtomicBool,
}

impl Session {
    pub fn new(config: SequenceConfig) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            config,
            state: RwLock::new(SessionState::Idle),
            calibration: RwLock::new(None),
            ledger: Arc::new(TimingLedger::new()),
            start_fired: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &SequenceConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn calibration(&self) -> Option<CalibrationOutcome> {
        *self.calibration.read()
    }

    pub fn ledger(&self) -> &Arc<TimingLedger> {
        &self.ledger
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        *self.state.write() = state;
    }

    pub(crate) fn set_calibration(&self, outcome: CalibrationOutcome) {
        *self.calibration.write() = Some(outcome);
    }

    /// The synchronized start. Begin the sink, play the beep, stamp the
    /// clock, in that order with no interleaved work. Idempotent: a second
    /// call is a logged no-op so a stray trigger can never double-start the
    /// sink or move the stamp.
    pub fn fire_start(
        &self,
        sink: &mut SinkGuard,
        cues: &dyn CuePlayer,
        clock: &dyn Clock,
    ) -> Result<bool, SinkError> {
        if self.start_fired.swap(true, Ordering::SeqCst) {
            log::warn!("[Sequence] duplicate start trigger for {} ignored", self.id);
            return Ok(false);
        }

        let before = Instant::now();
        sink.begin()?;
        if self.config.audio_enabled {
            cues.play(Cue::StartBeep);
        }
        self.ledger.arm(clock.now(), Utc::now());

        let skew = before.elapsed();
        if skew > START_SKEW_BUDGET {
            log::warn!(
                "[Sequence] start skew {:.1}ms exceeds {:.0}ms budget - sink begin() is too slow",
                skew.as_secs_f64() * 1000.0,
                START_SKEW_BUDGET.as_secs_f64() * 1000.0
            );
        }
        Ok(true)
    }
}

// ============================================================================
// Controller
// ============================================================================

/// Everything the controller thread needs for one session.
pub(crate) struct SessionRuntime {
    pub session: Arc<Session>,
    pub capture: CaptureHandle,
    pub clock: Arc<dyn Clock>,
    pub cues: Arc<dyn CuePlayer>,
    pub store: Arc<SessionStore>,
    pub commands: Receiver<Command>,
    pub capture_events: Receiver<CaptureEvent>,
    pub events: Sender<EngineEvent>,
    pub calibration_window: Duration,
    pub prepare_timeout: Duration,
    pub quality: QualityProfile,
    pub jitter: Box<dyn JitterSource>,
}

/// What a pre-start wait resolved to.
enum Wait {
    Elapsed,
    Cancelled,
    DeviceLost { device: String, detail: String },
}

impl SessionRuntime {
    /// Drive the session to a terminal state. Runs on its own thread.
    pub(crate) fn run(mut self, sink: Box<dyn RecordingSink>) {
        let mut guard = SinkGuard::new(sink);
        log::info!("[Sequence] session {} starting", self.session.id());

        // --- Calibrate --------------------------------------------------
        self.transition(SessionState::Calibrating);
        let outcome = match self.calibrate(&mut guard) {
            Some(outcome) => outcome,
            None => return, // finish_* already ran
        };
        self.session.set_calibration(outcome);
        self.emit(EngineEvent::CalibrationFinished {
            fps: outcome.fps,
            degraded: outcome.degraded,
        });

        // --- Prepare the sink -------------------------------------------
        self.transition(SessionState::Preparing);
        if !self.prepare_sink(&mut guard, outcome.fps) {
            return;
        }

        // --- Countdown phases -------------------------------------------
        let in_position = self.session.config().in_position;
        let set = self.session.config().set;
        let phases = [
            (SessionState::GoToStart, Cue::GoToStart, self.session.config().go_to_start()),
            (SessionState::InPosition, Cue::InPosition, self.jitter.draw(in_position)),
            (SessionState::Set, Cue::Set, self.jitter.draw(set)),
        ];

        for (state, cue, wait) in phases {
            self.transition(state);
            self.emit(EngineEvent::PhaseStarted {
                state,
                wait_secs: wait.as_secs_f64(),
            });
            if self.session.config().audio_enabled {
                self.cues.play(cue);
            }
            match self.wait_phase(wait) {
                Wait::Elapsed => {}
                Wait::Cancelled => return self.finish_cancelled(&mut guard),
                Wait::DeviceLost { device, detail } => {
                    return self.finish_failed(
                        &mut guard,
                        FailureReason::DeviceUnavailable { device, detail },
                    );
                }
            }
        }

        // --- Start ------------------------------------------------------
        if let Err(e) =
            self.session
                .fire_start(&mut guard, self.cues.as_ref(), self.clock.as_ref())
        {
            return self.finish_failed(
                &mut guard,
                FailureReason::SinkBegin {
                    detail: e.to_string(),
                },
            );
        }
        self.transition(SessionState::Recording);
        self.emit(EngineEvent::RecordingStarted);

        // --- Record until stopped ---------------------------------------
        loop {
            select! {
                recv(self.commands) -> cmd => match cmd {
                    Ok(Command::Stop) | Err(_) => return self.finish_recording(&mut guard),
                    Ok(Command::Cancel) => {
                        log::info!("[Sequence] cancel ignored while recording - use stop");
                    }
                },
                recv(self.capture_events) -> ev => {
                    let (device, detail) = describe_capture_event(ev.ok());
                    self.emit(EngineEvent::DeviceLost);
                    return self.finish_failed(
                        &mut guard,
                        FailureReason::DeviceUnavailable { device, detail },
                    );
                },
            }
        }
    }

    /// Count arrivals through the running capture loop over the calibration
    /// window, staying responsive to cancel and device loss. Returns None
    /// when the session already ended.
    fn calibrate(&mut self, guard: &mut SinkGuard) -> Option<CalibrationOutcome> {
        let before = self.capture.frames_seen();
        let started = Instant::now();

        match self.wait_phase(self.calibration_window) {
            Wait::Elapsed => {}
            Wait::Cancelled => {
                self.finish_cancelled(guard);
                return None;
            }
            Wait::DeviceLost { device, detail } => {
                self.finish_failed(guard, FailureReason::DeviceUnavailable { device, detail });
                return None;
            }
        }

        let frames = self.capture.frames_seen().saturating_sub(before);
        let outcome = CalibrationOutcome::from_counts(frames, started.elapsed());
        calibration::log_against_reported(self.capture.reported_fps(), &outcome);
        if outcome.degraded {
            log::warn!(
                "[Sequence] no frames during calibration, proceeding at fallback {:.0} fps",
                outcome.fps
            );
        }
        Some(outcome)
    }

    /// Run `prepare()` on a helper thread with a hard timeout. On timeout or
    /// cancellation the helper is orphaned and releases the sink itself when
    /// the stuck call finally returns. Returns true when the guard holds a
    /// prepared sink.
    fn prepare_sink(&mut self, guard: &mut SinkGuard, fps: f64) -> bool {
        let mut sink = match guard.take() {
            Some(sink) => sink,
            None => {
                self.finish_failed(
                    guard,
                    FailureReason::SinkPrepare {
                        detail: "sink already consumed".into(),
                    },
                );
                return false;
            }
        };

        let quality = self.quality;
        let (tx, rx) = bounded::<(Box<dyn RecordingSink>, Result<(), SinkError>)>(1);
        std::thread::spawn(move || {
            let result = sink.prepare(fps, quality);
            if let Err(unsent) = tx.send((sink, result)) {
                let (mut sink, result) = unsent.into_inner();
                log::warn!(
                    "[Sequence] sink prepare finished after abandonment ({:?}), releasing",
                    result
                );
                sink.release();
            }
        });

        let deadline = after(self.prepare_timeout);
        loop {
            select! {
                recv(rx) -> msg => match msg {
                    Ok((sink, Ok(()))) => {
                        guard.put_back(sink);
                        return true;
                    }
                    Ok((sink, Err(e))) => {
                        guard.put_back(sink);
                        self.finish_failed(
                            guard,
                            FailureReason::SinkPrepare { detail: e.to_string() },
                        );
                        return false;
                    }
                    Err(_) => {
                        // Helper panicked; the sink went down with it.
                        self.finish_failed(
                            guard,
                            FailureReason::SinkPrepare {
                                detail: "prepare worker died".into(),
                            },
                        );
                        return false;
                    }
                },
                recv(self.commands) -> cmd => match cmd {
                    Ok(Command::Cancel) | Err(_) => {
                        reclaim_prepared(&rx, guard);
                        self.finish_cancelled(guard);
                        return false;
                    }
                    Ok(Command::Stop) => {}
                },
                recv(self.capture_events) -> ev => {
                    let (device, detail) = describe_capture_event(ev.ok());
                    self.emit(EngineEvent::DeviceLost);
                    reclaim_prepared(&rx, guard);
                    self.finish_failed(
                        guard,
                        FailureReason::DeviceUnavailable { device, detail },
                    );
                    return false;
                },
                recv(deadline) -> _ => {
                    log::error!(
                        "[Sequence] sink prepare exceeded {:?}, abandoning it",
                        self.prepare_timeout
                    );
                    reclaim_prepared(&rx, guard);
                    self.finish_failed(
                        guard,
                        FailureReason::SinkPrepare { detail: "prepare timed out".into() },
                    );
                    return false;
                },
            }
        }
    }

    /// Sleep out one phase, waking for commands and device loss.
    fn wait_phase(&self, wait: Duration) -> Wait {
        let deadline = after(wait);
        loop {
            select! {
                recv(deadline) -> _ => return Wait::Elapsed,
                recv(self.commands) -> cmd => match cmd {
                    Ok(Command::Cancel) | Err(_) => return Wait::Cancelled,
                    Ok(Command::Stop) => {
                        log::debug!("[Sequence] stop ignored before the start fires");
                    }
                },
                recv(self.capture_events) -> ev => {
                    let (device, detail) = describe_capture_event(ev.ok());
                    self.emit(EngineEvent::DeviceLost);
                    return Wait::DeviceLost { device, detail };
                },
            }
        }
    }

    /// Normal stop path: stamp the finish, stop the sink, persist, release.
    fn finish_recording(&self, guard: &mut SinkGuard) {
        self.session
            .ledger()
            .finish(self.clock.now(), Utc::now());

        let codec = match guard.stop() {
            Ok(report) => report.codec,
            Err(e) => {
                log::error!("[Sequence] sink stop failed: {}", e);
                "unknown".to_string()
            }
        };

        self.persist(codec, false);
        guard.release();
        self.capture.detach_ledger();
        self.transition(SessionState::Finished);
        log::info!("[Sequence] session {} finished", self.session.id());
    }

    fn finish_cancelled(&self, guard: &mut SinkGuard) {
        self.cues.stop_all();
        guard.release();
        self.capture.detach_ledger();
        self.emit(EngineEvent::SessionCancelled);
        self.transition(SessionState::Cancelled);
        log::info!("[Sequence] session {} cancelled", self.session.id());
    }

    fn finish_failed(&self, guard: &mut SinkGuard, reason: FailureReason) {
        self.cues.stop_all();
        log::error!("[Sequence] session {} failed: {}", self.session.id(), reason);

        // A failure after the start stamp still salvages whatever frames
        // were recorded.
        if self.session.ledger().is_armed() {
            self.session
                .ledger()
                .finish(self.clock.now(), Utc::now());
            let codec = match guard.stop() {
                Ok(report) => report.codec,
                Err(e) => {
                    log::warn!("[Sequence] sink stop during failure: {}", e);
                    "unknown".to_string()
                }
            };
            self.persist(codec, true);
        }

        guard.release();
        self.capture.detach_ledger();
        self.emit(EngineEvent::SessionFailed { reason });
        self.transition(SessionState::Failed);
    }

    fn persist(&self, codec: String, partial: bool) {
        let calibration = self.session.calibration();
        let ctx = ReportContext {
            session_id: self.session.id().to_string(),
            calibrated_fps: calibration.map(|c| c.fps).unwrap_or(0.0),
            calibration_degraded: calibration.map(|c| c.degraded).unwrap_or(false),
            codec,
            quality: self.quality,
            partial,
        };

        match self.session.ledger().export(&ctx) {
            Some(report) => {
                match self.store.flush(&report) {
                    Ok(path) => {
                        log::info!("[Sequence] session report written to {}", path.display())
                    }
                    Err(e) => log::error!("[Sequence] failed to persist session report: {}", e),
                }
                self.emit(EngineEvent::RecordingStopped { report });
            }
            None => log::error!("[Sequence] no start stamp, nothing to persist"),
        }
    }

    fn transition(&self, state: SessionState) {
        log::info!("[Sequence] {} -> {:?}", self.session.id(), state);
        self.session.set_state(state);
        self.emit(EngineEvent::StateChanged { state });
    }

    fn emit(&self, event: EngineEvent) {
        if self.events.send(event).is_err() {
            log::debug!("[Sequence] no event listener attached");
        }
    }
}

/// The prepare helper may have parked its finished sink in the channel
/// buffer in the same wake that resolved a cancel, device loss, or timeout.
/// Hand it back to the guard so the exit path releases it; a sink left in
/// the buffer would be dropped unreleased (the helper's own fallback only
/// fires when its send fails).
fn reclaim_prepared(
    rx: &Receiver<(Box<dyn RecordingSink>, Result<(), SinkError>)>,
    guard: &mut SinkGuard,
) {
    if let Ok((sink, _)) = rx.try_recv() {
        guard.put_back(sink);
    }
}

fn describe_capture_event(ev: Option<CaptureEvent>) -> (String, String) {
    match ev {
        Some(CaptureEvent::DeviceUnavailable { device, detail }) => (device, detail),
        None => ("unknown".to_string(), "capture loop gone".to_string()),
    }
}
