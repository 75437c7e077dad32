// Capture device contract
//
// The engine never talks to a camera backend directly. It owns a
// `CaptureDevice` handle (opened by the caller, closed on drop) and pulls
// frames from it on the capture thread. Everything backend-specific lives
// behind this trait.

use std::time::Duration;

/// Error type for capture device operations
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// No frame arrived within the backend's poll window. Benign; the
    /// capture loop keeps polling.
    #[error("poll timed out")]
    Timeout,

    /// The device vanished (unplugged, driver reset).
    #[error("device disconnected: {0}")]
    Disconnected(String),

    /// Backend-level failure that is not obviously a disconnect.
    #[error("capture backend error: {0}")]
    Backend(String),
}

/// One captured frame. The engine only moves frames around; pixel layout is
/// the sink's concern.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    /// Small synthetic frame, used by simulated devices and tests.
    pub fn test_pattern(width: u32, height: u32) -> Self {
        Self {
            data: vec![0u8; (width * height) as usize],
            width,
            height,
        }
    }
}

/// An open capture device. Exclusively owned by the capture loop for its
/// lifetime; dropping the device closes it.
pub trait CaptureDevice: Send {
    fn name(&self) -> &str;

    /// Block until the next frame is available, a poll window elapses
    /// (`DeviceError::Timeout`), or the device fails.
    fn poll_frame(&mut self) -> Result<Frame, DeviceError>;

    /// The frame rate the driver claims to deliver. Diagnostic only; the
    /// calibrator never trusts it.
    fn reported_fps(&self) -> Option<f64> {
        None
    }
}

/// Consecutive pull failures tolerated before the cooldown kicks in.
pub const PULL_RETRY_LIMIT: u32 = 5;

/// Backoff between failed pulls.
pub const PULL_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// One longer pause after the retry budget is spent, before the final
/// attempt that decides whether the device is gone for good.
pub const RECONNECT_COOLDOWN: Duration = Duration::from_secs(1);
