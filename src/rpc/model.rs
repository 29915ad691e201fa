//! Per-endpoint queue-length model driving replica placement, plus the
//! scoped holder that keeps its accounting exact on every exit path.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use crate::rpc::endpoint::EndpointToken;
use crate::utils::{Clock, EstuaryError, Smoother};

use serde::Deserialize;

use tokio::task::JoinSet;

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigQueueModel {
    /// E-folding time of the outstanding-requests smoother, in secs.
    pub smoothing_amount: f64,

    /// Initial future-version suppression horizon, in secs.
    pub future_version_initial_backoff: f64,

    /// Growth factor of the future-version horizon on repeat offenses.
    pub future_version_backoff_growth: f64,

    /// Cap on the future-version horizon, in secs.
    pub future_version_max_backoff: f64,

    /// Cap on retained lagging-request tasks; exceeding it cancels the
    /// whole collection and starts a fresh one.
    pub max_lagging_requests_outstanding: usize,
}

#[allow(clippy::derivable_impls)]
impl Default for ConfigQueueModel {
    fn default() -> Self {
        ConfigQueueModel {
            smoothing_amount: 2.0,
            future_version_initial_backoff: 1.0,
            future_version_backoff_growth: 2.0,
            future_version_max_backoff: 8.0,
            max_lagging_requests_outstanding: 100_000,
        }
    }
}

impl ConfigQueueModel {
    /// Composes the tunables from defaults plus optional TOML overrides.
    pub fn from_config_str(
        config_str: Option<&str>,
    ) -> Result<Self, EstuaryError> {
        parsed_config!(config_str => ConfigQueueModel;
                       smoothing_amount,
                       future_version_initial_backoff,
                       future_version_backoff_growth,
                       future_version_max_backoff,
                       max_lagging_requests_outstanding)
    }
}

/// Per-endpoint measurement state.
#[derive(Debug)]
struct Measurement {
    /// Exponentially-smoothed count of in-flight requests.
    smooth_outstanding: Smoother,

    /// Last client-perceived round-trip latency, in secs.
    latency: f64,

    /// Server-declared self-penalty (default 1.0).
    penalty: f64,

    /// Do not consider this endpoint before this time.
    failed_until: f64,

    /// Current future-version suppression horizon, in secs.
    future_version_backoff: f64,

    /// Next time at which the horizon is allowed to grow again.
    increase_backoff_time: f64,
}

impl Measurement {
    fn new(config: &ConfigQueueModel) -> Self {
        Measurement {
            smooth_outstanding: Smoother::new(config.smoothing_amount),
            latency: 0.001,
            penalty: 1.0,
            failed_until: 0.0,
            future_version_backoff: config.future_version_initial_backoff,
            increase_backoff_time: 0.0,
        }
    }
}

/// Placement-relevant snapshot of one endpoint's measurement.
#[derive(Debug, Clone, Copy)]
pub struct MeasurementSample {
    /// Smoothed outstanding-request count as of now.
    pub outstanding: f64,

    /// Last perceived latency, in secs.
    pub latency: f64,

    /// Server-declared self-penalty.
    pub penalty: f64,

    /// Suppression deadline; skip the endpoint while `now < failed_until`.
    pub failed_until: f64,
}

/// Hedged-second-request adaptation state.
#[derive(Debug)]
struct HedgeState {
    /// Multiplier applied to the second-best latency when computing the
    /// hedge delay; grows on hedge use, decays toward 1.0 on success.
    second_multiplier: f64,

    /// Budget of hedge sends; refills on success, spent 1.0 per hedge.
    second_budget: f64,
}

/// Smoothed per-endpoint latency, outstanding load, and penalty model kept
/// by a client to bias replica placement. Also owns the background
/// collection of lagging requests: attempts whose reply the caller stopped
/// waiting for but whose model update must still land.
#[derive(Debug)]
pub struct QueueModel {
    /// Configuration parameters struct.
    config: ConfigQueueModel,

    /// Clock for smoothing timestamps and suppression deadlines.
    clock: Clock,

    /// Map from endpoint token -> its measurement.
    data: Mutex<HashMap<EndpointToken, Measurement>>,

    /// Hedging adaptation state.
    hedge: Mutex<HedgeState>,

    /// Detached lagging-request tasks.
    lagging: Mutex<JoinSet<()>>,
}

impl QueueModel {
    /// Creates a new queue model.
    pub fn new(config: ConfigQueueModel, clock: Clock) -> Self {
        QueueModel {
            config,
            clock,
            data: Mutex::new(HashMap::new()),
            hedge: Mutex::new(HedgeState {
                second_multiplier: 1.0,
                second_budget: 0.0,
            }),
            lagging: Mutex::new(JoinSet::new()),
        }
    }

    /// Clock this model stamps its measurements with.
    pub(crate) fn clock(&self) -> Clock {
        self.clock
    }

    /// Accounts for a new in-flight request to the endpoint. Returns the
    /// delta added to the smoothed outstanding count, which the matching
    /// `end_request` must subtract back out.
    pub(crate) fn add_request(&self, token: EndpointToken) -> f64 {
        let now = self.clock.now();
        let mut data = self.data.lock().unwrap();
        let meas = data
            .entry(token)
            .or_insert_with(|| Measurement::new(&self.config));
        meas.smooth_outstanding.add_delta(meas.penalty, now);
        meas.penalty
    }

    /// Completes the accounting of one request. `delta` must be the value
    /// returned by the matching `add_request`. A `clean` completion
    /// replaces the stored latency and resets the future-version horizon;
    /// an unclean measured sample only raises the stored latency. A
    /// `future_version` completion arms the suppression deadline, growing
    /// the horizon on repeat offenses.
    pub(crate) fn end_request(
        &self,
        token: EndpointToken,
        latency: f64,
        penalty: f64,
        delta: f64,
        clean: bool,
        future_version: bool,
    ) {
        let now = self.clock.now();
        let mut data = self.data.lock().unwrap();
        let meas = data
            .entry(token)
            .or_insert_with(|| Measurement::new(&self.config));

        if clean {
            meas.latency = latency;
        } else {
            meas.latency = meas.latency.max(latency);
        }

        if future_version {
            if now > meas.failed_until {
                meas.failed_until = now + meas.future_version_backoff;
                if now > meas.increase_backoff_time {
                    meas.future_version_backoff = (meas.future_version_backoff
                        * self.config.future_version_backoff_growth)
                        .min(self.config.future_version_max_backoff);
                    meas.increase_backoff_time = meas.failed_until;
                }
            }
        } else if clean {
            meas.future_version_backoff =
                self.config.future_version_initial_backoff;
            meas.increase_backoff_time = 0.0;
        }

        meas.smooth_outstanding.add_delta(-delta, now);
        if penalty > 0.0 {
            meas.penalty = penalty;
        }
    }

    /// Placement snapshot of the endpoint's measurement as of now.
    pub fn sample(&self, token: EndpointToken) -> MeasurementSample {
        let now = self.clock.now();
        let mut data = self.data.lock().unwrap();
        let meas = data
            .entry(token)
            .or_insert_with(|| Measurement::new(&self.config));
        MeasurementSample {
            outstanding: meas.smooth_outstanding.smooth_total(now),
            latency: meas.latency,
            penalty: meas.penalty,
            failed_until: meas.failed_until,
        }
    }

    /// Current hedge-delay multiplier.
    pub fn second_multiplier(&self) -> f64 {
        self.hedge.lock().unwrap().second_multiplier
    }

    /// Current hedge-send budget.
    pub fn second_budget(&self) -> f64 {
        self.hedge.lock().unwrap().second_budget
    }

    /// Adapts hedging state on arrival of a first-attempt reply: the
    /// multiplier decays toward 1.0 and the budget refills up to its cap.
    pub(crate) fn on_first_reply(
        &self,
        multiplier_decay: f64,
        budget_growth: f64,
        max_budget: f64,
    ) {
        let mut hedge = self.hedge.lock().unwrap();
        hedge.second_multiplier =
            (hedge.second_multiplier - multiplier_decay).max(1.0);
        hedge.second_budget =
            (hedge.second_budget + budget_growth).min(max_budget);
    }

    /// Tries to spend one hedge send from the budget, growing the
    /// multiplier on success. Returns false if the budget is too low.
    pub(crate) fn try_spend_hedge(&self, multiplier_growth: f64) -> bool {
        let mut hedge = self.hedge.lock().unwrap();
        if hedge.second_budget < 1.0 {
            return false;
        }
        hedge.second_multiplier += multiplier_growth;
        hedge.second_budget -= 1.0;
        true
    }

    /// Detaches a pending attempt into the background collection so its
    /// eventual outcome still updates the model. If the cap on outstanding
    /// lagging requests is exceeded, the whole collection is cancelled and
    /// restarted to bound memory.
    pub(crate) fn add_lagging(
        &self,
        fut: impl Future<Output = ()> + Send + 'static,
    ) {
        // without a live runtime there is nowhere to finish the accounting
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let mut lagging = self.lagging.lock().unwrap();
        while lagging.try_join_next().is_some() {}
        if lagging.len() > self.config.max_lagging_requests_outstanding {
            lagging.abort_all();
            *lagging = JoinSet::new();
        }
        lagging.spawn_on(fut, &handle);
    }

    /// Number of lagging-request tasks not yet reaped.
    pub fn lagging_request_count(&self) -> usize {
        let mut lagging = self.lagging.lock().unwrap();
        while lagging.try_join_next().is_some() {}
        lagging.len()
    }

    #[cfg(test)]
    pub(crate) fn set_hedge_state(&self, multiplier: f64, budget: f64) {
        let mut hedge = self.hedge.lock().unwrap();
        hedge.second_multiplier = multiplier;
        hedge.second_budget = budget;
    }
}

/// Scoped accounting handle bound to one request attempt. Construction
/// lands the attempt's delta in the model; exactly one release (explicit
/// or on drop) takes it back out, so the net change for a completed pair
/// is zero on every exit path.
#[derive(Debug)]
pub(crate) struct ModelHolder {
    /// Model the delta was added to; `None` for unmodeled dispatch.
    model: Option<Arc<QueueModel>>,

    /// Endpoint the attempt was sent to.
    token: EndpointToken,

    /// Time the attempt was issued.
    start_time: f64,

    /// Delta returned by `add_request`.
    delta: f64,

    /// Guard making release idempotent.
    released: bool,
}

impl ModelHolder {
    /// Creates a new holder, registering the attempt with the model.
    pub(crate) fn new(
        model: Option<Arc<QueueModel>>,
        token: EndpointToken,
    ) -> Self {
        let (start_time, delta) = match &model {
            Some(m) => (m.clock().now(), m.add_request(token)),
            None => (0.0, 0.0),
        };
        ModelHolder {
            model,
            token,
            start_time,
            delta,
            released: false,
        }
    }

    /// Completes the attempt's accounting. `measure_latency` controls
    /// whether an unclean completion still reports its round-trip.
    pub(crate) fn release(
        &mut self,
        clean: bool,
        future_version: bool,
        penalty: f64,
        measure_latency: bool,
    ) {
        if let Some(model) = &self.model {
            if !self.released {
                self.released = true;
                let latency = if clean || measure_latency {
                    model.clock().now() - self.start_time
                } else {
                    0.0
                };
                model.end_request(
                    self.token,
                    latency,
                    penalty,
                    self.delta,
                    clean,
                    future_version,
                );
            }
        }
    }
}

impl Drop for ModelHolder {
    fn drop(&mut self) {
        self.release(false, false, -1.0, false);
    }
}

#[cfg(test)]
mod model_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn add_end_nets_zero() {
        let clock = Clock::new();
        let model = QueueModel::new(ConfigQueueModel::default(), clock);

        let delta = model.add_request(1);
        assert_eq!(delta, 1.0);
        clock.delay(0.05).await;
        model.end_request(1, 0.05, 1.0, delta, true, false);

        // smoothed count decays back to the true total of zero
        clock.delay(60.0).await;
        assert!(model.sample(1).outstanding < 1e-6);
        assert!((model.sample(1).latency - 0.05).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn penalty_scales_delta() {
        let clock = Clock::new();
        let model = QueueModel::new(ConfigQueueModel::default(), clock);

        let d1 = model.add_request(3);
        model.end_request(3, 0.01, 2.5, d1, true, false);
        // next request's contribution is weighted by the recorded penalty
        let d2 = model.add_request(3);
        assert_eq!(d2, 2.5);
        model.end_request(3, 0.01, 1.0, d2, true, false);
    }

    #[tokio::test(start_paused = true)]
    async fn future_version_debounce_grows() {
        let clock = Clock::new();
        let config = ConfigQueueModel::default();
        let model = QueueModel::new(config.clone(), clock);

        let d = model.add_request(9);
        model.end_request(9, 0.0, -1.0, d, false, true);
        let first_horizon = model.sample(9).failed_until - clock.now();
        assert!(first_horizon > 0.9 && first_horizon <= 1.0 + 1e-9);

        // past the horizon, a repeat offense doubles the backoff
        clock.delay(1.5).await;
        let d = model.add_request(9);
        model.end_request(9, 0.0, -1.0, d, false, true);
        let second_horizon = model.sample(9).failed_until - clock.now();
        assert!(second_horizon > 1.9 && second_horizon <= 2.0 + 1e-9);

        // a clean completion resets the horizon growth
        clock.delay(2.5).await;
        let d = model.add_request(9);
        model.end_request(9, 0.01, 1.0, d, true, false);
        clock.delay(0.1).await;
        let d = model.add_request(9);
        model.end_request(9, 0.0, -1.0, d, false, true);
        let reset_horizon = model.sample(9).failed_until - clock.now();
        assert!(reset_horizon <= 1.0 + 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn holder_release_idempotent() {
        let clock = Clock::new();
        let model =
            Arc::new(QueueModel::new(ConfigQueueModel::default(), clock));

        let mut holder = ModelHolder::new(Some(model.clone()), 4);
        holder.release(true, false, 1.0, true);
        holder.release(true, false, 1.0, true);
        drop(holder); // no double subtraction

        clock.delay(60.0).await;
        assert!(model.sample(4).outstanding.abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn holder_drop_releases() {
        let clock = Clock::new();
        let model =
            Arc::new(QueueModel::new(ConfigQueueModel::default(), clock));

        let holder = ModelHolder::new(Some(model.clone()), 8);
        drop(holder);
        clock.delay(60.0).await;
        assert!(model.sample(8).outstanding.abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn lagging_cap_restarts_collection() {
        let clock = Clock::new();
        let config = ConfigQueueModel {
            max_lagging_requests_outstanding: 4,
            ..Default::default()
        };
        let model = Arc::new(QueueModel::new(config, clock));

        for _ in 0..8 {
            model.add_lagging(async {
                std::future::pending::<()>().await;
            });
        }
        // cap of 4 forces at least one wholesale restart
        assert!(model.lagging_request_count() <= 5);
    }
}
