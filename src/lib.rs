// StartGate: start-sequence and timing-synchronization engine for race
// starts.
//
// The engine continuously pulls frames from a capture device, measures the
// delivered frame rate under real load, runs a phased audio countdown with
// randomized waits, and starts the recording sink in lockstep with the
// start beep. Every frame that lands while a session is live is stamped
// into a timing ledger, and the resulting report is written next to the
// recording so times can be read off the footage afterwards.
//
// Layout:
// - devices:     capture-device trait and frame type
// - capture:     background pull loop with retry and stall handling
// - calibration: measured-fps windows (direct and through the loop)
// - sequence:    the session state machine and synchronized start
// - ledger:      monotonic timestamps for start, finish, and every frame
// - sink:        the two-phase recording sink contract
// - cues:        audio cue identities and the player trait
// - session:     persisted reports, the sidecar file, and the sqlite index
// - engine:      the facade tying the above together
// - sim:         hardware-free stand-ins for tests and dry runs

pub mod calibration;
pub mod capture;
pub mod clock;
pub mod config;
pub mod cues;
pub mod devices;
pub mod engine;
pub mod ledger;
pub mod sequence;
pub mod session;
pub mod sim;
pub mod sink;

pub use calibration::{CalibrationOutcome, FALLBACK_FPS};
pub use capture::{CaptureEvent, CaptureHandle, CaptureLoop};
pub use clock::{Clock, MonotonicClock};
pub use config::{config_path, ConfigError, EngineConfig, JitterRange, SequenceConfig};
pub use cues::{Cue, CuePlayer, SilentCuePlayer};
pub use devices::{CaptureDevice, DeviceError, Frame};
pub use engine::{Engine, EngineError, EngineEvent, EngineSnapshot};
pub use ledger::{ReportContext, TimingLedger, FPS_MISMATCH_TOLERANCE};
pub use sequence::{
    FailureReason, JitterSource, Session, SessionState, UniformJitter, PREPARE_TIMEOUT,
    START_SKEW_BUDGET,
};
pub use session::{SessionIndex, SessionReport, SessionStore, SessionSummary};
pub use sim::{
    ManualClock, ScriptedJitter, SimCaptureDevice, SimCuePlayer, SimSink, SinkCallLog,
};
pub use sink::{QualityProfile, RecordingSink, SinkError, SinkGuard, SinkReport};
