// Frame-rate calibration
//
// Driver-reported frame rates are routinely wrong; a device claiming 30 fps
// that delivers ~15 produces recordings that play back at double speed. So
// the engine measures: count the frames a device actually delivers over a
// real-time window and derive fps from that, never from the report.

use std::time::{Duration, Instant};

use crate::capture::CaptureHandle;
use crate::devices::{CaptureDevice, DeviceError};

/// Conservative floor used when a window sees zero frames. The session
/// proceeds, degraded.
pub const FALLBACK_FPS: f64 = 15.0;

/// Sanity band for measured rates; values outside are clock glitches or
/// pathological devices, not real frame rates.
pub const FPS_CLAMP_MIN: f64 = 1.0;
pub const FPS_CLAMP_MAX: f64 = 240.0;

/// Default measurement window.
pub const DEFAULT_CALIBRATION_WINDOW: Duration = Duration::from_secs(2);

/// Result of one calibration window. Ephemeral; only `fps` and `degraded`
/// survive into the session report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationOutcome {
    pub fps: f64,
    /// True when the window saw no frames and `fps` is the fallback floor.
    pub degraded: bool,
    pub frames_seen: u64,
    pub window: Duration,
}

impl CalibrationOutcome {
    /// Derive an outcome from a raw frame count over an elapsed window.
    pub fn from_counts(frames: u64, elapsed: Duration) -> Self {
        let secs = elapsed.as_secs_f64();
        if frames == 0 || secs <= 0.0 {
            log::warn!(
                "[Calibrate] no frames in {:.2}s window, falling back to {} fps",
                secs,
                FALLBACK_FPS
            );
            return Self {
                fps: FALLBACK_FPS,
                degraded: true,
                frames_seen: 0,
                window: elapsed,
            };
        }
        let raw = frames as f64 / secs;
        let fps = raw.clamp(FPS_CLAMP_MIN, FPS_CLAMP_MAX);
        if fps != raw {
            log::warn!(
                "[Calibrate] measured {:.2} fps outside sane band, clamped to {:.2}",
                raw,
                fps
            );
        }
        Self {
            fps,
            degraded: false,
            frames_seen: frames,
            window: elapsed,
        }
    }
}

/// Measure a device directly by pulling (and discarding) frames for the
/// window. Intended for standalone use, e.g. while an operator is choosing
/// a device; a running engine instead counts arrivals through the capture
/// loop (see [`measure_realtime`]) right before the attempt. A wedged
/// device cannot hang the call: polls stop once twice the window has
/// elapsed.
pub fn measure(device: &mut dyn CaptureDevice, window: Duration) -> CalibrationOutcome {
    let started = Instant::now();
    let hard_deadline = started + window * 2;
    let mut frames: u64 = 0;

    while started.elapsed() < window {
        match device.poll_frame() {
            Ok(_) => frames += 1,
            Err(DeviceError::Timeout) => {}
            Err(e) => {
                log::warn!("[Calibrate] device '{}' failed mid-window: {}", device.name(), e);
                break;
            }
        }
        if Instant::now() > hard_deadline {
            log::warn!("[Calibrate] device '{}' exceeded the measurement deadline", device.name());
            break;
        }
    }

    let outcome = CalibrationOutcome::from_counts(frames, started.elapsed());
    log_against_reported(device.reported_fps(), &outcome);
    outcome
}

/// Measure through a running capture loop by watching its arrival counter.
/// Run immediately before a recording attempt so the number reflects the
/// load (CPU, exposure auto-adjust) the recording will actually see.
pub fn measure_realtime(capture: &CaptureHandle, window: Duration) -> CalibrationOutcome {
    let before = capture.frames_seen();
    let started = Instant::now();
    std::thread::sleep(window);
    let frames = capture.frames_seen().saturating_sub(before);
    let outcome = CalibrationOutcome::from_counts(frames, started.elapsed());
    log_against_reported(capture.reported_fps(), &outcome);
    outcome
}

pub(crate) fn log_against_reported(reported: Option<f64>, outcome: &CalibrationOutcome) {
    match reported {
        Some(reported) if reported > 0.0 => {
            let ratio = outcome.fps / reported;
            if ratio < 0.8 || ratio > 1.25 {
                log::warn!(
                    "[Calibrate] measured {:.2} fps but device reports {:.2} (ratio {:.2})",
                    outcome.fps,
                    reported,
                    ratio
                );
            } else {
                log::info!(
                    "[Calibrate] measured {:.2} fps (device reports {:.2})",
                    outcome.fps,
                    reported
                );
            }
        }
        _ => log::info!("[Calibrate] measured {:.2} fps (no reported rate)", outcome.fps),
    }
}
