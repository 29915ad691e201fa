//! Basic exponential smoothing of a running total.

/// Exponentially smoothed running total.
///
/// Sample times are `f64` seconds from the caller's `Clock` and must be
/// non-decreasing. `smooth_total()` is a continuous (under)estimate of the
/// sum of all `add_delta()`s; `smooth_rate()` is its derivative and is NOT
/// continuous.
#[derive(Debug, Clone)]
pub struct Smoother {
    /// E-folding time of the smoothing kernel, in seconds.
    e_folding_time: f64,

    /// Exact running total.
    total: f64,

    /// Time of the last estimate update.
    time: f64,

    /// Smoothed estimate as of `time`.
    estimate: f64,
}

impl Smoother {
    /// Creates a new smoother with the given e-folding time, holding 0.
    pub fn new(e_folding_time: f64) -> Self {
        debug_assert!(e_folding_time > 0.0);
        Smoother {
            e_folding_time,
            total: 0.0,
            time: 0.0,
            estimate: 0.0,
        }
    }

    /// Forgets all history and pins both total and estimate to `value`.
    pub fn reset(&mut self, value: f64) {
        self.time = 0.0;
        self.total = value;
        self.estimate = value;
    }

    /// Folds the estimate toward the exact total for elapsed time.
    fn update(&mut self, t: f64) {
        let elapsed = t - self.time;
        if elapsed > 0.0 {
            self.time = t;
            self.estimate += (self.total - self.estimate)
                * (1.0 - (-elapsed / self.e_folding_time).exp());
        }
    }

    /// Jumps the exact total to `total` at time `t`.
    pub fn set_total(&mut self, total: f64, t: f64) {
        self.add_delta(total - self.total, t);
    }

    /// Adds `delta` to the exact total at time `t`.
    pub fn add_delta(&mut self, delta: f64, t: f64) {
        self.update(t);
        self.total += delta;
    }

    /// Smoothed estimate of the total as of time `t`.
    pub fn smooth_total(&mut self, t: f64) -> f64 {
        self.update(t);
        self.estimate
    }

    /// Smoothed estimate of d/dt of the total as of time `t`.
    pub fn smooth_rate(&mut self, t: f64) -> f64 {
        self.update(t);
        (self.total - self.estimate) / self.e_folding_time
    }

    /// Exact (unsmoothed) running total.
    pub fn total(&self) -> f64 {
        self.total
    }
}

#[cfg(test)]
mod smoother_tests {
    use super::*;

    #[test]
    fn estimate_converges() {
        let mut sm = Smoother::new(1.0);
        sm.add_delta(10.0, 0.0);
        assert!(sm.smooth_total(0.0) < 1e-9);
        // after many folding times the estimate approaches the total
        let est = sm.smooth_total(20.0);
        assert!((est - 10.0).abs() < 1e-6);
        assert_eq!(sm.total(), 10.0);
    }

    #[test]
    fn rate_tracks_recent_additions() {
        let mut sm = Smoother::new(2.0);
        // 5 units/sec for 10 seconds, added in unit steps
        for i in 1..=100 {
            sm.add_delta(0.5, i as f64 * 0.1);
        }
        let rate = sm.smooth_rate(10.0);
        assert!((rate - 5.0).abs() < 1.0);
    }

    #[test]
    fn reset_pins_both() {
        let mut sm = Smoother::new(1.0);
        sm.add_delta(42.0, 3.0);
        sm.reset(7.0);
        assert_eq!(sm.total(), 7.0);
        assert!((sm.smooth_total(100.0) - 7.0).abs() < 1e-9);
    }
}
