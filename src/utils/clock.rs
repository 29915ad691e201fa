//! Process-local monotonic clock handle, passed explicitly to every
//! component that needs time or timers (no global network singleton).

use rand::Rng;

use tokio::time::{self, Duration, Instant};

/// Monotonic clock reporting seconds as `f64` since an origin instant.
///
/// Cheap to copy. Built on `tokio::time`, so timers (and therefore all of
/// the rate/backoff logic downstream) advance virtually under tokio paused
/// time in tests.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    /// Origin instant that second 0.0 refers to.
    origin: Instant,
}

impl Clock {
    /// Creates a new clock anchored at the current instant.
    pub fn new() -> Self {
        Clock {
            origin: Instant::now(),
        }
    }

    /// Seconds elapsed since the clock's origin.
    pub fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    /// Suspends the calling task for the given number of seconds.
    pub async fn delay(&self, secs: f64) {
        if secs > 0.0 {
            time::sleep(Duration::from_secs_f64(secs)).await;
        }
    }

    /// Suspends for the given number of seconds, perturbed by up to +-10%
    /// so that herds of peers do not wake in lockstep.
    pub async fn delay_jittered(&self, secs: f64) {
        let jittered = secs * (0.9 + 0.2 * rand::thread_rng().gen::<f64>());
        self.delay(jittered).await;
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod clock_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn clock_advances() {
        let clock = Clock::new();
        let before = clock.now();
        clock.delay(1.5).await;
        let after = clock.now();
        assert!(after - before >= 1.5);
    }

    #[tokio::test(start_paused = true)]
    async fn jitter_bounded() {
        let clock = Clock::new();
        let before = clock.now();
        clock.delay_jittered(10.0).await;
        let elapsed = clock.now() - before;
        assert!(elapsed >= 9.0);
        assert!(elapsed <= 11.1);
    }
}
