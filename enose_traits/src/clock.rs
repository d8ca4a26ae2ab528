use std::thread;
use std::time::{Duration, Instant};

/// Monotonic time source threaded through every polling and sleeping
/// component, so control code never touches `Instant::now` directly and
/// tests can run on virtual time.
pub trait Clock {
    fn now(&self) -> Instant;
    fn sleep(&self, d: Duration);

    /// Milliseconds elapsed since `epoch`; 0 on underflow.
    fn ms_since(&self, epoch: Instant) -> u64 {
        self.now().saturating_duration_since(epoch).as_millis() as u64
    }
}

/// Real-time clock backed by the OS monotonic clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl MonotonicClock {
    #[inline]
    pub fn new() -> Self {
        Self
    }
}

impl Clock for MonotonicClock {
    #[inline]
    fn now(&self) -> Instant {
        Instant::now()
    }

    #[inline]
    fn sleep(&self, d: Duration) {
        if d.is_zero() {
            return;
        }
        thread::sleep(d);
    }
}

pub mod test_clock {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    /// Deterministic clock for tests: `now()` is a fixed origin plus an
    /// atomically tracked offset, and `sleep` advances the offset without
    /// blocking. Clones share the same timeline.
    #[derive(Debug, Clone)]
    pub struct TestClock {
        origin: Instant,
        offset_ns: Arc<AtomicU64>,
    }

    impl Default for TestClock {
        fn default() -> Self {
            Self::new()
        }
    }

    impl TestClock {
        pub fn new() -> Self {
            Self {
                origin: Instant::now(),
                offset_ns: Arc::new(AtomicU64::new(0)),
            }
        }

        /// Move the timeline forward by `d`.
        pub fn advance(&self, d: Duration) {
            let ns = d.as_nanos().min(u64::MAX as u128) as u64;
            self.offset_ns.fetch_add(ns, Ordering::SeqCst);
        }

        /// Jump to an absolute offset from the origin.
        pub fn set_offset(&self, d: Duration) {
            let ns = d.as_nanos().min(u64::MAX as u128) as u64;
            self.offset_ns.store(ns, Ordering::SeqCst);
        }
    }

    impl Clock for TestClock {
        fn now(&self) -> Instant {
            self.origin + Duration::from_nanos(self.offset_ns.load(Ordering::SeqCst))
        }

        fn sleep(&self, d: Duration) {
            self.advance(d);
        }
    }
}
