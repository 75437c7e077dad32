// Simulated device, sink, cue player, jitter, and clock
//
// Always compiled so both unit tests and integration tests can drive a
// full engine without hardware. Nothing here touches a real camera,
// encoder, or speaker.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::clock::Clock;
use crate::config::JitterRange;
use crate::cues::{Cue, CuePlayer};
use crate::devices::{CaptureDevice, DeviceError, Frame};
use crate::sequence::JitterSource;
use crate::sink::{QualityProfile, RecordingSink, SinkError, SinkReport};

// ============================================================================
// Capture device
// ============================================================================

/// Frame source that paces itself to a target rate.
pub struct SimCaptureDevice {
    interval: Duration,
    reported_fps: Option<f64>,
    /// Disconnect after this many successful pulls.
    fail_after: Option<u64>,
    stalled: bool,
    delivered: u64,
}

impl SimCaptureDevice {
    pub fn new(fps: f64) -> Self {
        Self {
            interval: Duration::from_secs_f64(1.0 / fps.max(0.001)),
            reported_fps: None,
            fail_after: None,
            stalled: false,
            delivered: 0,
        }
    }

    /// Claim a (possibly wrong) driver-reported rate.
    pub fn with_reported_fps(mut self, fps: f64) -> Self {
        self.reported_fps = Some(fps);
        self
    }

    /// Disconnect permanently after `frames` successful pulls.
    pub fn failing_after(mut self, frames: u64) -> Self {
        self.fail_after = Some(frames);
        self
    }

    /// Never delivers a frame; every pull times out.
    pub fn stalled() -> Self {
        let mut device = Self::new(50.0);
        device.stalled = true;
        device
    }
}

impl CaptureDevice for SimCaptureDevice {
    fn name(&self) -> &str {
        "sim-camera"
    }

    fn poll_frame(&mut self) -> Result<Frame, DeviceError> {
        if self.stalled {
            std::thread::sleep(Duration::from_millis(20));
            return Err(DeviceError::Timeout);
        }
        if let Some(limit) = self.fail_after {
            if self.delivered >= limit {
                return Err(DeviceError::Disconnected("simulated unplug".into()));
            }
        }
        std::thread::sleep(self.interval);
        self.delivered += 1;
        Ok(Frame::test_pattern(64, 48))
    }

    fn reported_fps(&self) -> Option<f64> {
        self.reported_fps
    }
}

// ============================================================================
// Recording sink
// ============================================================================

#[derive(Default)]
struct SinkCalls {
    prepare_count: u32,
    prepared_fps: Option<f64>,
    prepared_quality: Option<QualityProfile>,
    begin_count: u32,
    begin_at: Option<Instant>,
    stop_count: u32,
    release_count: u32,
}

/// Shared record of every call a `SimSink` receives, inspectable after the
/// sink itself has been moved into the engine.
#[derive(Clone, Default)]
pub struct SinkCallLog {
    calls: Arc<Mutex<SinkCalls>>,
}

impl SinkCallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prepare_count(&self) -> u32 {
        self.calls.lock().prepare_count
    }

    pub fn prepared_fps(&self) -> Option<f64> {
        self.calls.lock().prepared_fps
    }

    pub fn prepared_quality(&self) -> Option<QualityProfile> {
        self.calls.lock().prepared_quality
    }

    pub fn begin_count(&self) -> u32 {
        self.calls.lock().begin_count
    }

    /// When `begin()` returned, for start-skew assertions.
    pub fn begin_at(&self) -> Option<Instant> {
        self.calls.lock().begin_at
    }

    pub fn stop_count(&self) -> u32 {
        self.calls.lock().stop_count
    }

    pub fn release_count(&self) -> u32 {
        self.calls.lock().release_count
    }
}

/// Sink that records calls instead of encoding anything.
pub struct SimSink {
    log: SinkCallLog,
    prepare_delay: Duration,
    fail_prepare: bool,
    prepared: bool,
    recording: bool,
}

impl SimSink {
    pub fn new(log: SinkCallLog) -> Self {
        Self {
            log,
            prepare_delay: Duration::ZERO,
            fail_prepare: false,
            prepared: false,
            recording: false,
        }
    }

    /// Make `prepare()` take this long, to exercise the timeout path.
    pub fn with_prepare_delay(mut self, delay: Duration) -> Self {
        self.prepare_delay = delay;
        self
    }

    pub fn failing_prepare(mut self) -> Self {
        self.fail_prepare = true;
        self
    }
}

impl RecordingSink for SimSink {
    fn prepare(&mut self, calibrated_fps: f64, profile: QualityProfile) -> Result<(), SinkError> {
        if !self.prepare_delay.is_zero() {
            std::thread::sleep(self.prepare_delay);
        }
        let mut calls = self.log.calls.lock();
        calls.prepare_count += 1;
        calls.prepared_fps = Some(calibrated_fps);
        calls.prepared_quality = Some(profile);
        drop(calls);

        if self.fail_prepare {
            return Err(SinkError::Prepare("simulated allocation failure".into()));
        }
        self.prepared = true;
        Ok(())
    }

    fn begin(&mut self) -> Result<(), SinkError> {
        if !self.prepared {
            return Err(SinkError::NotPrepared);
        }
        self.recording = true;
        let mut calls = self.log.calls.lock();
        calls.begin_count += 1;
        calls.begin_at = Some(Instant::now());
        Ok(())
    }

    fn stop(&mut self) -> Result<SinkReport, SinkError> {
        if !self.recording {
            return Err(SinkError::Stop("not recording".into()));
        }
        self.recording = false;
        self.log.calls.lock().stop_count += 1;
        Ok(SinkReport {
            codec: "sim/mp4v".into(),
        })
    }

    fn release(&mut self) {
        self.prepared = false;
        self.recording = false;
        self.log.calls.lock().release_count += 1;
    }
}

// ============================================================================
// Cue player
// ============================================================================

/// Cue player that logs dispatch instants instead of making sound.
#[derive(Default)]
pub struct SimCuePlayer {
    plays: Mutex<Vec<(Cue, Instant)>>,
    stops: AtomicU32,
}

impl SimCuePlayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plays(&self) -> Vec<(Cue, Instant)> {
        self.plays.lock().clone()
    }

    pub fn plays_of(&self, cue: Cue) -> usize {
        self.plays.lock().iter().filter(|(c, _)| *c == cue).count()
    }

    /// When the start beep was dispatched, for skew assertions.
    pub fn beep_at(&self) -> Option<Instant> {
        self.plays
            .lock()
            .iter()
            .find(|(c, _)| *c == Cue::StartBeep)
            .map(|(_, at)| *at)
    }

    pub fn stop_count(&self) -> u32 {
        self.stops.load(Ordering::SeqCst)
    }
}

impl CuePlayer for SimCuePlayer {
    fn play(&self, cue: Cue) {
        self.plays.lock().push((cue, Instant::now()));
    }

    fn stop_all(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Jitter and clock
// ============================================================================

/// Jitter source that replays scripted draws, then falls back to each
/// range's minimum.
pub struct ScriptedJitter {
    draws: VecDeque<Duration>,
}

impl ScriptedJitter {
    pub fn new(draws: Vec<Duration>) -> Self {
        Self {
            draws: draws.into(),
        }
    }
}

impl JitterSource for ScriptedJitter {
    fn draw(&mut self, range: JitterRange) -> Duration {
        self.draws
            .pop_front()
            .unwrap_or_else(|| Duration::from_secs_f64(range.min_secs.max(0.0)))
    }
}

/// Clock whose reading only moves when a test advances it.
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sim_device_paces_and_disconnects() {
        let mut device = SimCaptureDevice::new(200.0).failing_after(2);
        assert!(device.poll_frame().is_ok());
        assert!(device.poll_frame().is_ok());
        assert!(matches!(
            device.poll_frame(),
            Err(DeviceError::Disconnected(_))
        ));
    }

    #[test]
    fn sim_sink_enforces_call_order() {
        let log = SinkCallLog::new();
        let mut sink = SimSink::new(log.clone());
        assert!(matches!(sink.begin(), Err(SinkError::NotPrepared)));
        sink.prepare(30.0, QualityProfile::Low480p).unwrap();
        sink.begin().unwrap();
        sink.stop().unwrap();
        sink.release();

        assert_eq!(log.prepare_count(), 1);
        assert_eq!(log.prepared_quality(), Some(QualityProfile::Low480p));
        assert_eq!(log.begin_count(), 1);
        assert_eq!(log.stop_count(), 1);
        assert_eq!(log.release_count(), 1);
    }

    #[test]
    fn scripted_jitter_replays_then_falls_back() {
        let mut jitter = ScriptedJitter::new(vec![Duration::from_millis(40)]);
        assert_eq!(
            jitter.draw(JitterRange::new(1.0, 2.0)),
            Duration::from_millis(40)
        );
        assert_eq!(
            jitter.draw(JitterRange::new(1.0, 2.0)),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn manual_clock_advances_on_demand() {
        let clock = ManualClock::new();
        let a = clock.now();
        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now() - a, Duration::from_millis(250));
    }
}
