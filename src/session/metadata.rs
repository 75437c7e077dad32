// Session metadata structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::sink::QualityProfile;

/// Complete persisted record of one race-timing session.
///
/// Written as a `timing.json` sidecar in the session folder and summarized
/// into the recent-sessions index. Intervals come from the monotonic clock;
/// the `*_at` fields are wall-clock anchors captured at the same instants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    /// Unique session ID
    pub session_id: String,

    /// Wall-clock anchor of the start stamp (the beep instant)
    pub started_at: DateTime<Utc>,

    /// Wall-clock anchor of the finish stamp
    pub finished_at: DateTime<Utc>,

    /// Monotonic finish minus start, in milliseconds
    pub duration_ms: f64,

    /// Frames recorded between start and finish
    pub frame_count: u64,

    /// Frame rate measured right before this attempt
    pub calibrated_fps: f64,

    /// True when calibration saw no frames and fell back to the floor
    pub calibration_degraded: bool,

    /// frame_count / duration, the rate actually achieved
    pub measured_effective_fps: f64,

    /// True when effective fps deviates from calibrated fps beyond
    /// tolerance. Diagnostic; the recording is still kept.
    pub fps_mismatch: bool,

    /// Frames that arrived after the finish stamp and were dropped
    pub dropped_after_finish: u64,

    /// Codec or profile the sink reported using
    pub codec: String,

    /// Quality profile requested at prepare time
    pub quality: QualityProfile,

    /// True when the session failed mid-recording and this record is a
    /// best-effort flush of what the ledger held
    pub partial: bool,
}

/// Session summary for list display
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: f64,
    pub frame_count: u64,
    pub measured_effective_fps: f64,
    pub fps_mismatch: bool,
    pub partial: bool,
    pub path: PathBuf,
}

impl SessionSummary {
    pub fn from_report(report: &SessionReport, path: PathBuf) -> Self {
        Self {
            session_id: report.session_id.clone(),
            started_at: report.started_at,
            duration_ms: report.duration_ms,
            frame_count: report.frame_count,
            measured_effective_fps: report.measured_effective_fps,
            fps_mismatch: report.fps_mismatch,
            partial: report.partial,
            path,
        }
    }
}
