// Full-engine session tests against simulated hardware. Timings are
// compressed to keep the suite fast; the phase structure is the real one.

use std::sync::Arc;
use std::time::{Duration, Instant};

use startgate::session::storage::load_report;
use startgate::{
    Engine, EngineConfig, EngineError, EngineEvent, JitterRange, ScriptedJitter, SequenceConfig,
    SessionState, SimCaptureDevice, SimCuePlayer, SimSink, SinkCallLog, Cue,
};

const EVENT_TIMEOUT: Duration = Duration::from_secs(15);

fn fast_sequence() -> SequenceConfig {
    SequenceConfig {
        go_to_start_secs: 0.05,
        in_position: JitterRange::new(0.02, 0.04),
        set: JitterRange::new(0.02, 0.04),
        audio_enabled: true,
    }
}

fn engine_with(
    storage: &std::path::Path,
    device: SimCaptureDevice,
    calibration_window_secs: f64,
) -> (Engine, Arc<SimCuePlayer>) {
    let config = EngineConfig {
        storage_path: storage.to_path_buf(),
        calibration_window_secs,
        ..EngineConfig::default()
    };
    let cues = Arc::new(SimCuePlayer::new());
    let engine = Engine::new(config, Box::new(device), cues.clone());
    (engine, cues)
}

/// Drain events until one matches, failing the test on timeout.
fn wait_for(
    events: &crossbeam_channel::Receiver<EngineEvent>,
    mut pred: impl FnMut(&EngineEvent) -> bool,
) -> EngineEvent {
    let deadline = Instant::now() + EVENT_TIMEOUT;
    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .unwrap_or(Duration::ZERO);
        let event = events
            .recv_timeout(remaining)
            .expect("timed out waiting for an engine event");
        if pred(&event) {
            return event;
        }
    }
}

fn wait_for_state(events: &crossbeam_channel::Receiver<EngineEvent>, want: SessionState) {
    wait_for(events, |e| {
        matches!(e, EngineEvent::StateChanged { state } if *state == want)
    });
}

#[test]
fn full_session_records_and_persists() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, cues) = engine_with(dir.path(), SimCaptureDevice::new(100.0), 0.2);
    let events = engine.events();
    let sink_log = SinkCallLog::new();

    let id = engine
        .begin_session(fast_sequence(), Box::new(SimSink::new(sink_log.clone())))
        .unwrap();

    let calibration = wait_for(&events, |e| {
        matches!(e, EngineEvent::CalibrationFinished { .. })
    });
    if let EngineEvent::CalibrationFinished { fps, degraded } = calibration {
        assert!(!degraded);
        assert!(fps > 10.0, "calibrated {} fps", fps);
        assert!(fps < 240.0);
    }

    wait_for(&events, |e| matches!(e, EngineEvent::RecordingStarted));
    std::thread::sleep(Duration::from_millis(150));
    engine.stop_recording();

    let stopped = wait_for(&events, |e| {
        matches!(e, EngineEvent::RecordingStopped { .. })
    });
    wait_for_state(&events, SessionState::Finished);

    let report = match stopped {
        EngineEvent::RecordingStopped { report } => report,
        _ => unreachable!(),
    };
    assert_eq!(report.session_id, id);
    assert!(!report.partial);
    assert!(report.frame_count > 0, "no frames were stamped");
    assert!(report.duration_ms >= 100.0);
    assert_eq!(report.codec, "sim/mp4v");

    // Synchronized start: begin() first, beep right behind it.
    let begin_at = sink_log.begin_at().expect("begin never ran");
    let beep_at = cues.beep_at().expect("start beep never played");
    assert!(beep_at >= begin_at);
    assert!(
        beep_at - begin_at <= Duration::from_millis(5),
        "start skew {:?}",
        beep_at - begin_at
    );
    assert_eq!(sink_log.begin_count(), 1);
    assert_eq!(sink_log.release_count(), 1);

    // Persisted and indexed.
    let recent = engine.recent_sessions(5).unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].session_id, id);
    let reloaded = load_report(&recent[0].path).unwrap();
    assert_eq!(reloaded.frame_count, report.frame_count);
}

#[test]
fn countdown_duration_tracks_configured_waits() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _cues) = engine_with(dir.path(), SimCaptureDevice::new(100.0), 0.05);
    let events = engine.events();

    let sequence = SequenceConfig {
        go_to_start_secs: 0.08,
        ..fast_sequence()
    };
    let jitter = ScriptedJitter::new(vec![Duration::from_millis(50), Duration::from_millis(60)]);
    engine
        .begin_session_with(sequence, Box::new(SimSink::new(SinkCallLog::new())), Box::new(jitter))
        .unwrap();

    // Anchor at the first phase so calibration and prepare time stay out
    // of the measurement.
    let mut phases = Vec::new();
    let mut countdown_start = None;
    loop {
        let event = wait_for(&events, |e| {
            matches!(
                e,
                EngineEvent::PhaseStarted { .. } | EngineEvent::RecordingStarted
            )
        });
        match event {
            EngineEvent::PhaseStarted { state, wait_secs } => {
                countdown_start.get_or_insert_with(Instant::now);
                phases.push((state, wait_secs));
            }
            EngineEvent::RecordingStarted => break,
            _ => unreachable!(),
        }
    }
    let elapsed = countdown_start.expect("no phases ran").elapsed();

    let states: Vec<SessionState> = phases.iter().map(|(s, _)| *s).collect();
    assert_eq!(
        states,
        [
            SessionState::GoToStart,
            SessionState::InPosition,
            SessionState::Set
        ]
    );
    let waits: Vec<f64> = phases.iter().map(|(_, w)| *w).collect();
    assert!((waits[0] - 0.08).abs() < 1e-9);
    assert!((waits[1] - 0.05).abs() < 1e-9);
    assert!((waits[2] - 0.06).abs() < 1e-9);

    // Sleeps only overshoot: total countdown is at least the sum of the
    // three waits and not wildly more.
    assert!(elapsed >= Duration::from_millis(185), "countdown took {:?}", elapsed);
    assert!(elapsed <= Duration::from_millis(900), "countdown took {:?}", elapsed);

    engine.stop_recording();
    wait_for_state(&events, SessionState::Finished);
}

#[test]
fn stalled_device_degrades_calibration_but_still_records() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _cues) = engine_with(dir.path(), SimCaptureDevice::stalled(), 0.1);
    let events = engine.events();
    let sink_log = SinkCallLog::new();

    engine
        .begin_session(fast_sequence(), Box::new(SimSink::new(sink_log.clone())))
        .unwrap();

    let calibration = wait_for(&events, |e| {
        matches!(e, EngineEvent::CalibrationFinished { .. })
    });
    match calibration {
        EngineEvent::CalibrationFinished { fps, degraded } => {
            assert!(degraded);
            assert_eq!(fps, startgate::FALLBACK_FPS);
        }
        _ => unreachable!(),
    }

    // The sequence still reaches a synchronized start at the fallback rate.
    wait_for(&events, |e| matches!(e, EngineEvent::RecordingStarted));
    assert_eq!(sink_log.prepared_fps(), Some(startgate::FALLBACK_FPS));

    engine.stop_recording();
    let stopped = wait_for(&events, |e| {
        matches!(e, EngineEvent::RecordingStopped { .. })
    });
    if let EngineEvent::RecordingStopped { report } = stopped {
        assert!(report.calibration_degraded);
        assert_eq!(report.frame_count, 0);
    }
    wait_for_state(&events, SessionState::Finished);
}

#[test]
fn cancel_during_countdown_releases_sink_and_persists_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, cues) = engine_with(dir.path(), SimCaptureDevice::new(100.0), 0.05);
    let events = engine.events();
    let sink_log = SinkCallLog::new();

    // Long middle phases so the cancel lands inside InPosition.
    let sequence = SequenceConfig {
        go_to_start_secs: 0.05,
        in_position: JitterRange::new(10.0, 10.0),
        set: JitterRange::new(10.0, 10.0),
        audio_enabled: true,
    };
    engine
        .begin_session(sequence, Box::new(SimSink::new(sink_log.clone())))
        .unwrap();

    // Only one session at a time.
    assert!(matches!(
        engine.begin_session(fast_sequence(), Box::new(SimSink::new(SinkCallLog::new()))),
        Err(EngineError::SessionActive)
    ));

    wait_for(&events, |e| {
        matches!(
            e,
            EngineEvent::PhaseStarted { state: SessionState::InPosition, .. }
        )
    });
    engine.cancel_session();

    wait_for(&events, |e| matches!(e, EngineEvent::SessionCancelled));
    wait_for_state(&events, SessionState::Cancelled);

    assert_eq!(sink_log.begin_count(), 0, "start must not fire");
    assert_eq!(sink_log.release_count(), 1);
    assert!(cues.stop_count() >= 1, "pending cues must be silenced");
    assert_eq!(cues.plays_of(Cue::StartBeep), 0);
    assert!(engine.recent_sessions(5).unwrap().is_empty());

    // A new session is accepted after the terminal state.
    let id = engine
        .begin_session(fast_sequence(), Box::new(SimSink::new(SinkCallLog::new())))
        .unwrap();
    assert!(!id.is_empty());
    wait_for(&events, |e| matches!(e, EngineEvent::RecordingStarted));
    engine.stop_recording();
    wait_for_state(&events, SessionState::Finished);
}

#[test]
fn slow_prepare_times_out_and_fails_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        storage_path: dir.path().to_path_buf(),
        calibration_window_secs: 0.05,
        prepare_timeout_secs: 0.05,
        ..EngineConfig::default()
    };
    let engine = Engine::new(
        config,
        Box::new(SimCaptureDevice::new(100.0)),
        Arc::new(SimCuePlayer::new()),
    );
    let events = engine.events();
    let sink_log = SinkCallLog::new();

    engine
        .begin_session(
            fast_sequence(),
            Box::new(SimSink::new(sink_log.clone()).with_prepare_delay(Duration::from_millis(400))),
        )
        .unwrap();

    let failed = wait_for(&events, |e| matches!(e, EngineEvent::SessionFailed { .. }));
    if let EngineEvent::SessionFailed { reason } = failed {
        assert!(
            reason.to_string().contains("timed out"),
            "unexpected reason: {}",
            reason
        );
    }
    wait_for_state(&events, SessionState::Failed);
    assert_eq!(sink_log.begin_count(), 0);
    assert!(engine.recent_sessions(5).unwrap().is_empty());

    // The abandoned helper releases the sink once its slow prepare returns.
    std::thread::sleep(Duration::from_millis(500));
    assert_eq!(sink_log.release_count(), 1);
}

#[test]
fn cancel_racing_prepare_completion_still_releases_once() {
    // The cancel is timed to land right as prepare() finishes, so either
    // side of the race can win; whichever does, the sink must end up
    // released exactly once and the session in a terminal state.
    for _ in 0..5 {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _cues) = engine_with(dir.path(), SimCaptureDevice::new(100.0), 0.02);
        let events = engine.events();
        let sink_log = SinkCallLog::new();

        let sequence = SequenceConfig {
            go_to_start_secs: 0.5,
            ..fast_sequence()
        };
        engine
            .begin_session(
                sequence,
                Box::new(
                    SimSink::new(sink_log.clone()).with_prepare_delay(Duration::from_millis(25)),
                ),
            )
            .unwrap();

        wait_for(&events, |e| {
            matches!(
                e,
                EngineEvent::StateChanged {
                    state: SessionState::Preparing
                }
            )
        });
        std::thread::sleep(Duration::from_millis(25));
        engine.cancel_session();

        wait_for(&events, |e| matches!(e, EngineEvent::SessionCancelled));
        wait_for_state(&events, SessionState::Cancelled);
        engine.join_session();

        // When the helper was orphaned its release trails the controller
        // exit by a moment; give it time, then demand exactly one.
        let deadline = Instant::now() + Duration::from_secs(2);
        while sink_log.release_count() == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(sink_log.begin_count(), 0);
        assert_eq!(sink_log.release_count(), 1);
    }
}

#[test]
fn failed_prepare_fails_the_session_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _cues) = engine_with(dir.path(), SimCaptureDevice::new(100.0), 0.05);
    let events = engine.events();
    let sink_log = SinkCallLog::new();

    engine
        .begin_session(
            fast_sequence(),
            Box::new(SimSink::new(sink_log.clone()).failing_prepare()),
        )
        .unwrap();

    wait_for(&events, |e| matches!(e, EngineEvent::SessionFailed { .. }));
    wait_for_state(&events, SessionState::Failed);

    assert_eq!(sink_log.begin_count(), 0);
    assert_eq!(sink_log.release_count(), 1);
    assert!(engine.recent_sessions(5).unwrap().is_empty());
}

#[test]
fn device_loss_during_countdown_fails_the_session() {
    let dir = tempfile::tempdir().unwrap();
    // Healthy through calibration, unplugged shortly after.
    let device = SimCaptureDevice::new(100.0).failing_after(30);
    let (engine, _cues) = engine_with(dir.path(), device, 0.1);
    let events = engine.events();
    let sink_log = SinkCallLog::new();

    let sequence = SequenceConfig {
        go_to_start_secs: 10.0,
        ..fast_sequence()
    };
    engine
        .begin_session(sequence, Box::new(SimSink::new(sink_log.clone())))
        .unwrap();

    let failed = wait_for(&events, |e| matches!(e, EngineEvent::SessionFailed { .. }));
    if let EngineEvent::SessionFailed { reason } = failed {
        let text = reason.to_string();
        assert!(text.contains("sim-camera"), "unexpected reason: {}", text);
    }
    wait_for_state(&events, SessionState::Failed);

    assert_eq!(sink_log.begin_count(), 0);
    assert_eq!(sink_log.release_count(), 1);
}
