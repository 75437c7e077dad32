// Recording sink contract
//
// The sink is the writer collaborator that turns frames into a stored
// artifact. The engine depends on one thing only: the two-phase split
// between `prepare()` (all slow, variable-latency work: allocation, codec
// negotiation, file creation) and `begin()` (bounded, near-zero cost).
// Collapsing the two back into one call reintroduces the start-skew bug
// this engine exists to fix.

use serde::{Deserialize, Serialize};

/// Error type for sink operations
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("sink preparation failed: {0}")]
    Prepare(String),

    #[error("recording start failed: {0}")]
    Begin(String),

    #[error("recording stop failed: {0}")]
    Stop(String),

    #[error("begin() called before prepare()")]
    NotPrepared,
}

/// Output quality profile, with the classic capture resolutions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityProfile {
    High1080p,
    Medium720p,
    Low480p,
}

impl QualityProfile {
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            QualityProfile::High1080p => (1920, 1080),
            QualityProfile::Medium720p => (1280, 720),
            QualityProfile::Low480p => (854, 480),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            QualityProfile::High1080p => "High (1080p)",
            QualityProfile::Medium720p => "Medium (720p)",
            QualityProfile::Low480p => "Low (480p)",
        }
    }
}

impl Default for QualityProfile {
    fn default() -> Self {
        Self::Medium720p
    }
}

/// Final metadata handed back when a sink stops.
#[derive(Debug, Clone)]
pub struct SinkReport {
    /// Codec or profile the sink actually used (persisted verbatim).
    pub codec: String,
}

/// Pre-initializable recording writer.
///
/// Contract: `prepare` may be arbitrarily slow and is called exactly once,
/// before any countdown audio plays. `begin` must be cheap. `release` frees
/// whatever `prepare` reserved; it must be idempotent and callable in any
/// state, including before `prepare` and after `stop`.
pub trait RecordingSink: Send {
    fn prepare(&mut self, calibrated_fps: f64, profile: QualityProfile) -> Result<(), SinkError>;

    fn begin(&mut self) -> Result<(), SinkError>;

    fn stop(&mut self) -> Result<SinkReport, SinkError>;

    fn release(&mut self);
}

/// Owns the session's sink and guarantees `release()` runs exactly once on
/// every exit path, including cancellation mid-wait and panics.
pub struct SinkGuard {
    sink: Option<Box<dyn RecordingSink>>,
    released: bool,
}

impl SinkGuard {
    pub fn new(sink: Box<dyn RecordingSink>) -> Self {
        Self {
            sink: Some(sink),
            released: false,
        }
    }

    /// Hand the sink to a helper thread (the bounded-prepare path). While
    /// the sink is out, the guard releases nothing; whoever holds it must
    /// either put it back or release it themselves.
    pub fn take(&mut self) -> Option<Box<dyn RecordingSink>> {
        self.sink.take()
    }

    pub fn put_back(&mut self, sink: Box<dyn RecordingSink>) {
        debug_assert!(self.sink.is_none());
        self.sink = Some(sink);
    }

    pub fn begin(&mut self) -> Result<(), SinkError> {
        match self.sink.as_mut() {
            Some(sink) => sink.begin(),
            None => Err(SinkError::NotPrepared),
        }
    }

    pub fn stop(&mut self) -> Result<SinkReport, SinkError> {
        match self.sink.as_mut() {
            Some(sink) => sink.stop(),
            None => Err(SinkError::Stop("sink already gone".into())),
        }
    }

    /// Release now instead of at drop. Safe to call repeatedly.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(sink) = self.sink.as_mut() {
            sink.release();
        }
    }
}

impl Drop for SinkGuard {
    fn drop(&mut self) {
        self.release();
    }
}
