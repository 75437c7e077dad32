// Audio cue player contract
//
// The sequence controller issues fire-and-forget play commands; it never
// waits on playback. Clip naming matches the shipped audio files.

use std::time::Duration;

/// The four scripted cues of a start sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Cue {
    GoToStart,
    InPosition,
    Set,
    StartBeep,
}

impl Cue {
    /// Stable clip identifier, also the audio file stem.
    pub fn clip_name(&self) -> &'static str {
        match self {
            Cue::GoToStart => "go_to_start",
            Cue::InPosition => "in_position",
            Cue::Set => "set",
            Cue::StartBeep => "start_beep",
        }
    }

    /// Operator-facing announcement text.
    pub fn announcement(&self) -> &'static str {
        match self {
            Cue::GoToStart => "Go to the start",
            Cue::InPosition => "In position",
            Cue::Set => "Set",
            Cue::StartBeep => "GO!",
        }
    }
}

/// Playback collaborator. `play` must return promptly; buffering latency is
/// the player's problem and is only ever observed for diagnostics.
pub trait CuePlayer: Send + Sync {
    fn play(&self, cue: Cue);

    /// Best-effort stop of anything still sounding (cancel path).
    fn stop_all(&self) {}

    /// Measured command-to-audible latency, if the backend can report one.
    /// Diagnostic only; never a gate for the start transition.
    fn dispatch_latency(&self) -> Option<Duration> {
        None
    }
}

/// No-op player for headless runs and audio-disabled sessions.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentCuePlayer;

impl CuePlayer for SilentCuePlayer {
    fn play(&self, _cue: Cue) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_names_are_stable() {
        assert_eq!(Cue::GoToStart.clip_name(), "go_to_start");
        assert_eq!(Cue::InPosition.clip_name(), "in_position");
        assert_eq!(Cue::Set.clip_name(), "set");
        assert_eq!(Cue::StartBeep.clip_name(), "start_beep");
    }
}
