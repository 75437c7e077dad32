// Timing ledger
//
// Append-only timing record for one session. The capture thread is the sole
// writer of frame timestamps; the sequence thread is the sole writer of the
// start/finish stamps. The two sides meet only through `append_frame`,
// which is constant-time and gated by an atomic recording-active flag, so a
// frame racing the start transition resolves as pre-start.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::session::SessionReport;
use crate::sink::QualityProfile;

/// Effective-vs-calibrated fps divergence beyond which the persisted record
/// carries a mismatch flag. Diagnostic, never fatal.
pub const FPS_MISMATCH_TOLERANCE: f64 = 0.10;

#[derive(Debug, Default)]
struct LedgerInner {
    start: Option<Instant>,
    started_at: Option<DateTime<Utc>>,
    finish: Option<Instant>,
    finished_at: Option<DateTime<Utc>>,
    frames: Vec<Instant>,
}

/// Context the ledger cannot know by itself when exporting a report.
#[derive(Debug, Clone)]
pub struct ReportContext {
    pub session_id: String,
    pub calibrated_fps: f64,
    pub calibration_degraded: bool,
    pub codec: String,
    pub quality: QualityProfile,
    pub partial: bool,
}

#[derive(Debug, Default)]
pub struct TimingLedger {
    inner: Mutex<LedgerInner>,
    /// True strictly between arm() and finish(). Frames are only accepted
    /// while this holds.
    active: AtomicBool,
    /// True once finish() has run; used to attribute late appends.
    finished: AtomicBool,
    dropped_after_finish: AtomicU64,
}

impl TimingLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamp the start of recording and open the ledger for frame appends.
    /// Single-assignment: a second call is a logged anomaly and a no-op.
    pub fn arm(&self, ts: Instant, wall: DateTime<Utc>) -> bool {
        let mut inner = self.inner.lock();
        if inner.start.is_some() {
            log::warn!("[Ledger] arm() called twice; keeping original start stamp");
            return false;
        }
        inner.start = Some(ts);
        inner.started_at = Some(wall);
        // Flag flips only after the stamp is in place: a frame arriving in
        // the same instant as the start transition counts as pre-start.
        self.active.store(true, Ordering::Release);
        true
    }

    /// Stamp the end of recording and close the ledger. Single-assignment.
    pub fn finish(&self, ts: Instant, wall: DateTime<Utc>) -> bool {
        self.active.store(false, Ordering::Release);
        let mut inner = self.inner.lock();
        if inner.finish.is_some() {
            log::warn!("[Ledger] finish() called twice; keeping original finish stamp");
            return false;
        }
        if inner.start.is_none() {
            log::warn!("[Ledger] finish() without a start stamp");
        }
        inner.finish = Some(ts);
        inner.finished_at = Some(wall);
        self.finished.store(true, Ordering::Release);
        true
    }

    /// Append one frame-arrival timestamp. Returns false when the ledger is
    /// not accepting frames; appends after finish are dropped silently and
    /// counted as a diagnostic metric. A stamp taken before the start stamp
    /// (the capture thread stamps first, then appends, so one pull can race
    /// `arm()`) resolves as pre-start and is rejected too.
    pub fn append_frame(&self, ts: Instant) -> bool {
        if !self.active.load(Ordering::Acquire) {
            if self.finished.load(Ordering::Acquire) {
                self.dropped_after_finish.fetch_add(1, Ordering::Relaxed);
            }
            return false;
        }
        let mut inner = self.inner.lock();
        match inner.start {
            Some(start) if ts >= start => {
                inner.frames.push(ts);
                true
            }
            _ => false,
        }
    }

    /// True once the start stamp is set (the session reached `Start`).
    pub fn is_armed(&self) -> bool {
        self.inner.lock().start.is_some()
    }

    pub fn start(&self) -> Option<Instant> {
        self.inner.lock().start
    }

    pub fn finish_stamp(&self) -> Option<Instant> {
        self.inner.lock().finish
    }

    /// Finish minus start. Undefined until both stamps are set.
    pub fn duration(&self) -> Option<Duration> {
        let inner = self.inner.lock();
        match (inner.start, inner.finish) {
            (Some(start), Some(finish)) => Some(finish.duration_since(start)),
            _ => None,
        }
    }

    pub fn frame_count(&self) -> u64 {
        self.inner.lock().frames.len() as u64
    }

    /// Snapshot of the recorded frame timestamps, for display and tests.
    pub fn frames(&self) -> Vec<Instant> {
        self.inner.lock().frames.clone()
    }

    pub fn dropped_after_finish(&self) -> u64 {
        self.dropped_after_finish.load(Ordering::Relaxed)
    }

    /// Build the persisted record. None until both stamps are set.
    pub fn export(&self, ctx: &ReportContext) -> Option<SessionReport> {
        let inner = self.inner.lock();
        let (start, finish) = match (inner.start, inner.finish) {
            (Some(s), Some(f)) => (s, f),
            _ => return None,
        };
        let (started_at, finished_at) = match (inner.started_at, inner.finished_at) {
            (Some(s), Some(f)) => (s, f),
            _ => return None,
        };
        let duration = finish.duration_since(start);
        let frame_count = inner.frames.len() as u64;
        let secs = duration.as_secs_f64();
        let effective_fps = if secs > 0.0 {
            frame_count as f64 / secs
        } else {
            0.0
        };
        let fps_mismatch = ctx.calibrated_fps > 0.0
            && ((effective_fps - ctx.calibrated_fps).abs() / ctx.calibrated_fps)
                > FPS_MISMATCH_TOLERANCE;

        Some(SessionReport {
            session_id: ctx.session_id.clone(),
            started_at,
            finished_at,
            duration_ms: secs * 1000.0,
            frame_count,
            calibrated_fps: ctx.calibrated_fps,
            calibration_degraded: ctx.calibration_degraded,
            measured_effective_fps: effective_fps,
            fps_mismatch,
            dropped_after_finish: self.dropped_after_finish(),
            codec: ctx.codec.clone(),
            quality: ctx.quality,
            partial: ctx.partial,
        })
    }
}
