// End-to-end dry run against simulated hardware.
//
// Runs one full session (calibrate, prepare, countdown, record for a
// second, stop) and prints the resulting report. Useful for eyeballing
// timing behavior without a camera attached.

use std::sync::Arc;
use std::time::Duration;

use startgate::{
    Engine, EngineConfig, EngineEvent, JitterRange, SequenceConfig, SimCaptureDevice,
    SimCuePlayer, SimSink, SinkCallLog,
};

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let storage = std::env::temp_dir().join(format!("startgate-dry-run-{}", std::process::id()));
    let config = EngineConfig {
        storage_path: storage.clone(),
        calibration_window_secs: 0.5,
        ..EngineConfig::default()
    };

    // Compressed timings so the whole run takes a few seconds.
    let sequence = SequenceConfig {
        go_to_start_secs: 1.0,
        in_position: JitterRange::new(0.4, 0.9),
        set: JitterRange::new(0.4, 0.9),
        audio_enabled: true,
    };

    let engine = Engine::new(
        config,
        Box::new(SimCaptureDevice::new(30.0)),
        Arc::new(SimCuePlayer::new()),
    );
    let events = engine.events();

    let sink_log = SinkCallLog::new();
    let id = engine.begin_session(sequence, Box::new(SimSink::new(sink_log.clone())))?;
    println!("session {}", id);

    loop {
        let event = events.recv_timeout(Duration::from_secs(30))?;
        match &event {
            EngineEvent::StateChanged { state } => println!("state: {:?}", state),
            EngineEvent::CalibrationFinished { fps, degraded } => {
                println!("calibrated {:.2} fps (degraded: {})", fps, degraded)
            }
            EngineEvent::PhaseStarted { state, wait_secs } => {
                println!("phase {:?} for {:.2}s", state, wait_secs)
            }
            EngineEvent::RecordingStarted => {
                println!("recording; stopping in one second");
                std::thread::sleep(Duration::from_secs(1));
                engine.stop_recording();
            }
            EngineEvent::RecordingStopped { report } => {
                println!("{}", serde_json::to_string_pretty(report)?);
            }
            other => println!("{:?}", other),
        }
        if let EngineEvent::StateChanged { state } = event {
            if state.is_terminal() {
                break;
            }
        }
    }

    println!(
        "sink calls: prepare={} begin={} stop={} release={}",
        sink_log.prepare_count(),
        sink_log.begin_count(),
        sink_log.stop_count(),
        sink_log.release_count()
    );
    println!("reports under {}", storage.display());
    Ok(())
}
