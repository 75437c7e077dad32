// Monotonic clock source
//
// Every interval in the engine is measured against this trait, never against
// wall-clock time. Wall-clock (`chrono`) appears only as an anchor in
// persisted metadata.

use std::time::Instant;

/// Monotonic, high-resolution time source.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Production clock backed by `std::time::Instant`.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}
