// Capture loop
//
// Pulls frames from the device on its own thread, continuously, independent
// of whatever the sequence controller is doing. Each successful pull bumps
// an atomic arrival counter, refreshes the latest-frame snapshot for
// observers, and appends the arrival timestamp to the attached session
// ledger (the ledger itself decides whether recording is active). Frames
// pulled outside a recording are discarded, not buffered.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::Sender;
use parking_lot::{Mutex, RwLock};

use crate::clock::Clock;
use crate::devices::{
    CaptureDevice, DeviceError, Frame, PULL_RETRY_BACKOFF, PULL_RETRY_LIMIT, RECONNECT_COOLDOWN,
};
use crate::ledger::TimingLedger;

/// Raised once by the loop when the device is gone for good.
#[derive(Debug, Clone)]
pub enum CaptureEvent {
    DeviceUnavailable { device: String, detail: String },
}

struct CaptureShared {
    frames_seen: AtomicU64,
    latest: Mutex<Option<Arc<Frame>>>,
    ledger: RwLock<Option<Arc<TimingLedger>>>,
    failed: AtomicBool,
    stop: AtomicBool,
    device_name: String,
    reported_fps: Option<f64>,
}

/// Cloneable read/attach view of a running capture loop.
#[derive(Clone)]
pub struct CaptureHandle {
    shared: Arc<CaptureShared>,
}

impl CaptureHandle {
    /// Total frames delivered since the loop started (all sessions).
    pub fn frames_seen(&self) -> u64 {
        self.shared.frames_seen.load(Ordering::Relaxed)
    }

    /// Most recent frame, for live preview by the display collaborator.
    pub fn latest_frame(&self) -> Option<Arc<Frame>> {
        self.shared.latest.lock().clone()
    }

    pub fn is_failed(&self) -> bool {
        self.shared.failed.load(Ordering::Acquire)
    }

    pub fn device_name(&self) -> &str {
        &self.shared.device_name
    }

    /// The driver's claimed rate, kept only so calibration can log how far
    /// off it was.
    pub fn reported_fps(&self) -> Option<f64> {
        self.shared.reported_fps
    }

    /// Point frame-arrival timestamps at a session's ledger.
    pub(crate) fn attach_ledger(&self, ledger: Arc<TimingLedger>) {
        *self.shared.ledger.write() = Some(ledger);
    }

    pub(crate) fn detach_ledger(&self) {
        *self.shared.ledger.write() = None;
    }
}

/// Owner of the capture thread. Dropping it stops and joins the loop.
pub struct CaptureLoop {
    handle: CaptureHandle,
    thread: Option<JoinHandle<()>>,
}

impl CaptureLoop {
    /// Take exclusive ownership of the device and start pulling.
    pub fn spawn(
        device: Box<dyn CaptureDevice>,
        clock: Arc<dyn Clock>,
        events: Sender<CaptureEvent>,
    ) -> Self {
        let shared = Arc::new(CaptureShared {
            frames_seen: AtomicU64::new(0),
            latest: Mutex::new(None),
            ledger: RwLock::new(None),
            failed: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            device_name: device.name().to_string(),
            reported_fps: device.reported_fps(),
        });

        let thread_shared = shared.clone();
        let thread = std::thread::Builder::new()
            .name("startgate-capture".into())
            .spawn(move || run_loop(device, thread_shared, clock, events))
            .ok();

        Self {
            handle: CaptureHandle { shared },
            thread,
        }
    }

    pub fn handle(&self) -> CaptureHandle {
        self.handle.clone()
    }

    pub fn shutdown(&mut self) {
        self.handle.shared.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for CaptureLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_loop(
    mut device: Box<dyn CaptureDevice>,
    shared: Arc<CaptureShared>,
    clock: Arc<dyn Clock>,
    events: Sender<CaptureEvent>,
) {
    log::info!("[Capture] loop started for '{}'", shared.device_name);
    let mut consecutive_failures: u32 = 0;

    while !shared.stop.load(Ordering::Acquire) {
        match device.poll_frame() {
            Ok(frame) => {
                consecutive_failures = 0;
                let ts = clock.now();
                shared.frames_seen.fetch_add(1, Ordering::Relaxed);
                *shared.latest.lock() = Some(Arc::new(frame));
                if let Some(ledger) = shared.ledger.read().as_ref() {
                    ledger.append_frame(ts);
                }
            }
            Err(DeviceError::Timeout) => {
                // No frame this poll window; the device is still there.
            }
            Err(e) => {
                consecutive_failures += 1;
                if consecutive_failures < PULL_RETRY_LIMIT {
                    log::warn!(
                        "[Capture] pull failed ({}/{}): {}",
                        consecutive_failures,
                        PULL_RETRY_LIMIT,
                        e
                    );
                    interruptible_sleep(&shared, PULL_RETRY_BACKOFF);
                } else if consecutive_failures == PULL_RETRY_LIMIT {
                    log::warn!(
                        "[Capture] retry budget spent for '{}', cooling down",
                        shared.device_name
                    );
                    interruptible_sleep(&shared, RECONNECT_COOLDOWN);
                } else {
                    // Cooldown didn't help; give up and report once.
                    log::error!(
                        "[Capture] device '{}' unavailable: {}",
                        shared.device_name,
                        e
                    );
                    shared.failed.store(true, Ordering::Release);
                    let _ = events.send(CaptureEvent::DeviceUnavailable {
                        device: shared.device_name.clone(),
                        detail: e.to_string(),
                    });
                    break;
                }
            }
        }
    }

    log::info!("[Capture] loop stopped for '{}'", shared.device_name);
}

/// Sleep in small slices so shutdown is never stuck behind a backoff.
fn interruptible_sleep(shared: &CaptureShared, total: Duration) {
    let slice = Duration::from_millis(50);
    let mut remaining = total;
    while !remaining.is_zero() && !shared.stop.load(Ordering::Acquire) {
        let step = remaining.min(slice);
        std::thread::sleep(step);
        remaining -= step;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MonotonicClock;
    use crate::sim::SimCaptureDevice;
    use std::time::Instant;

    fn spawn_sim(fps: f64) -> (CaptureLoop, crossbeam_channel::Receiver<CaptureEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let capture = CaptureLoop::spawn(
            Box::new(SimCaptureDevice::new(fps)),
            Arc::new(MonotonicClock),
            tx,
        );
        (capture, rx)
    }

    #[test]
    fn loop_counts_frames_and_publishes_latest() {
        let (capture, _rx) = spawn_sim(200.0);
        let handle = capture.handle();
        std::thread::sleep(Duration::from_millis(150));
        assert!(handle.frames_seen() > 5);
        assert!(handle.latest_frame().is_some());
        assert!(!handle.is_failed());
    }

    #[test]
    fn frames_flow_into_attached_ledger_only_while_active() {
        let (capture, _rx) = spawn_sim(200.0);
        let handle = capture.handle();
        let ledger = Arc::new(TimingLedger::new());
        handle.attach_ledger(ledger.clone());

        // Not armed: frames are discarded.
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(ledger.frame_count(), 0);

        ledger.arm(Instant::now(), chrono::Utc::now());
        std::thread::sleep(Duration::from_millis(120));
        ledger.finish(Instant::now(), chrono::Utc::now());
        let recorded = ledger.frame_count();
        assert!(recorded > 0);

        // Finished: appends stop even though the loop keeps pulling.
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(ledger.frame_count(), recorded);
    }

    #[test]
    fn dead_device_reports_unavailable_once() {
        let (tx, rx) = crossbeam_channel::unbounded();
        // Fails every pull immediately; retry budget burns fast because the
        // sim device returns instantly and backoffs are the only delay.
        let device = SimCaptureDevice::new(1000.0).failing_after(0);
        let capture = CaptureLoop::spawn(Box::new(device), Arc::new(MonotonicClock), tx);
        let handle = capture.handle();

        let event = rx
            .recv_timeout(Duration::from_secs(10))
            .expect("expected a DeviceUnavailable event");
        let CaptureEvent::DeviceUnavailable { device, .. } = event;
        assert_eq!(device, "sim-camera");
        assert!(handle.is_failed());
        assert!(rx.try_recv().is_err());
    }
}
