//! Load-balanced dispatch over an alternatives set: two-choice placement
//! biased by the queue model, a budgeted hedged second request, failure
//! debounce, and bounded retry backoff.

use std::sync::{Arc, Mutex};

use crate::rpc::endpoint::{
    Alternatives, EndpointToken, Reply, Request, RequestStream, TaskPriority,
};
use crate::rpc::failmon::{FailureMonitor, FailureStatus};
use crate::rpc::model::QueueModel;
use crate::rpc::request::{Outcome, RequestData};
use crate::utils::{Clock, EstuaryError};

use futures::future::select_all;

use rand::Rng;

use serde::Deserialize;

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigLoadBalance {
    /// Hedge immediately if the best latency exceeds this multiple of the
    /// computed hedge delay.
    pub instant_second_request_multiplier: f64,

    /// Additive component of the hedge delay, in secs.
    pub base_second_request_time: f64,

    /// Hedge-delay multiplier growth per hedge sent.
    pub second_request_multiplier_growth: f64,

    /// Hedge-delay multiplier decay per first-attempt reply.
    pub second_request_multiplier_decay: f64,

    /// Hedge budget refill per first-attempt reply.
    pub second_request_budget_growth: f64,

    /// Cap on the hedge budget.
    pub second_request_max_budget: f64,

    /// Initial retry backoff after a full failed cycle, in secs.
    pub start_backoff: f64,

    /// Cap on the retry backoff, in secs.
    pub max_backoff: f64,

    /// Multiplicative backoff growth per full failed cycle.
    pub backoff_rate: f64,

    /// Bad-endpoint tolerance before remote alternatives are considered.
    pub max_bad_options: usize,

    /// Whether a penalty above 1.001 marks an endpoint as bad.
    pub penalty_is_bad: bool,

    /// Dispatch duration after which diagnostics are logged, in secs.
    pub watchdog_secs: f64,

    /// Floor of the non-fresh all-failed delay, in secs.
    pub alternatives_failure_min_delay: f64,

    /// Fast ramp ratio of the non-fresh all-failed delay.
    pub alternatives_failure_delay_ratio: f64,

    /// Fast ramp cap, in secs.
    pub alternatives_failure_max_delay: f64,

    /// Slow ramp ratio of the non-fresh all-failed delay.
    pub alternatives_failure_slow_delay_ratio: f64,

    /// Slow ramp cap, in secs.
    pub alternatives_failure_slow_max_delay: f64,

    /// Back-to-back failures within this window skip the ramped delay.
    pub alternatives_failure_skip_delay: f64,

    /// Quiet period after which the ramp origin resets, in secs.
    pub alternatives_failure_reset_time: f64,
}

impl Default for ConfigLoadBalance {
    fn default() -> Self {
        ConfigLoadBalance {
            instant_second_request_multiplier: 2.0,
            base_second_request_time: 0.0005,
            second_request_multiplier_growth: 0.01,
            second_request_multiplier_decay: 0.00025,
            second_request_budget_growth: 0.05,
            second_request_max_budget: 100.0,
            start_backoff: 0.01,
            max_backoff: 5.0,
            backoff_rate: 5.0,
            max_bad_options: 1,
            penalty_is_bad: true,
            watchdog_secs: 600.0,
            alternatives_failure_min_delay: 0.05,
            alternatives_failure_delay_ratio: 0.2,
            alternatives_failure_max_delay: 1.0,
            alternatives_failure_slow_delay_ratio: 0.04,
            alternatives_failure_slow_max_delay: 30.0,
            alternatives_failure_skip_delay: 1.0,
            alternatives_failure_reset_time: 5.0,
        }
    }
}

impl ConfigLoadBalance {
    /// Composes the tunables from defaults plus optional TOML overrides.
    pub fn from_config_str(
        config_str: Option<&str>,
    ) -> Result<Self, EstuaryError> {
        parsed_config!(config_str => ConfigLoadBalance;
                       instant_second_request_multiplier,
                       base_second_request_time,
                       second_request_multiplier_growth,
                       second_request_multiplier_decay,
                       second_request_budget_growth,
                       second_request_max_budget,
                       start_backoff, max_backoff, backoff_rate,
                       max_bad_options, penalty_is_bad, watchdog_secs,
                       alternatives_failure_min_delay,
                       alternatives_failure_delay_ratio,
                       alternatives_failure_max_delay,
                       alternatives_failure_slow_delay_ratio,
                       alternatives_failure_slow_max_delay,
                       alternatives_failure_skip_delay,
                       alternatives_failure_reset_time)
    }
}

/// Bookkeeping of all-alternatives-failed episodes, shared across dispatch
/// calls so that the refresh delay ramps with outage duration.
#[derive(Debug, Default)]
struct AltFailureInfo {
    /// Start of the current outage episode.
    oldest: f64,

    /// Most recent all-failed observation.
    newest: f64,

    /// Last time the ramped delay was skipped.
    last_skip_delay: f64,
}

/// Shared client-side dispatch context: clock, failure monitor, tunables,
/// and cross-call failure bookkeeping.
#[derive(Debug)]
pub struct RpcContext {
    /// Network clock.
    pub clock: Clock,

    /// Process-wide reachability oracle.
    pub failure_monitor: FailureMonitor,

    /// Configuration parameters struct.
    pub config: ConfigLoadBalance,

    /// All-alternatives-failed bookkeeping.
    alt_failure: Mutex<AltFailureInfo>,
}

impl RpcContext {
    /// Creates a new dispatch context.
    pub fn new(config: ConfigLoadBalance, clock: Clock) -> Self {
        RpcContext {
            clock,
            failure_monitor: FailureMonitor::new(),
            config,
            alt_failure: Mutex::new(AltFailureInfo::default()),
        }
    }

    /// Records an all-alternatives-failed observation and returns how long
    /// to wait before asking the caller to refresh its set. Back-to-back
    /// first observations get the floor delay; sustained outages ramp it
    /// up proportionally to how long alternatives have been down.
    fn alternatives_failure_delay(&self) -> f64 {
        let now = self.clock.now();
        let knobs = &self.config;
        let mut info = self.alt_failure.lock().unwrap();

        if now - info.newest > knobs.alternatives_failure_reset_time {
            info.oldest = now;
        }

        let mut delay = knobs.alternatives_failure_min_delay;
        if now - info.last_skip_delay > knobs.alternatives_failure_skip_delay
        {
            info.last_skip_delay = now;
        } else {
            let elapsed = now - info.oldest;
            delay = delay.max(
                (elapsed * knobs.alternatives_failure_delay_ratio)
                    .min(knobs.alternatives_failure_max_delay),
            );
            delay = delay.max(
                (elapsed * knobs.alternatives_failure_slow_delay_ratio)
                    .min(knobs.alternatives_failure_slow_max_delay),
            );
        }

        info.newest = now;
        delay
    }
}

/// Computed hedge policy for one dispatch call.
#[derive(Debug, Clone, Copy, PartialEq)]
enum SecondDelay {
    /// No viable second choice; never hedge.
    Never,

    /// Hedge after this many seconds of first-attempt silence.
    After(f64),
}

/// Tries to get a reply from one of the alternatives until success,
/// cancellation, or a non-retriable error.
///
/// With a queue model, placement picks the two least-loaded healthy
/// alternatives (local prefix first) and races a budgeted hedged second
/// request when the first is slow. If ALL alternatives are failed and the
/// set is not fresh, raises `AllAlternativesFailed` after a ramped delay so
/// the caller refreshes its set. With `at_most_once`, an ambiguous outcome
/// surfaces as `RequestMaybeDelivered` instead of retrying.
pub async fn load_balance<R, S>(
    ctx: &RpcContext,
    alternatives: &Arc<Alternatives<S>>,
    mut request: R,
    priority: TaskPriority,
    at_most_once: bool,
    model: Option<Arc<QueueModel>>,
) -> Result<R::Reply, EstuaryError>
where
    R: Request,
    S: RequestStream<R>,
{
    request.set_reply_priority(priority);

    if alternatives.is_empty() {
        if alternatives.always_fresh() {
            return Err(EstuaryError::AllAlternativesFailed);
        }
        // a non-fresh empty set blocks forever; the caller's refresh path
        // is responsible for replacing it
        std::future::pending::<()>().await;
        unreachable!();
    }

    let clock = ctx.clock;
    let knobs = &ctx.config;
    let size = alternatives.len();
    let start_time = clock.now();

    let mut first = RequestData::<R>::new();
    let mut second = RequestData::<R>::new();
    let mut first_endpoint: Option<EndpointToken> = None;

    let mut best_alt =
        rand::thread_rng().gen_range(0..alternatives.count_best());
    let mut next_alt = rand::thread_rng().gen_range(0..(size - 1).max(1));
    if next_alt >= best_alt {
        next_alt += 1;
    }

    let mut second_delay = SecondDelay::Never;
    if let Some(model) = &model {
        // scan for the two lowest-outstanding healthy alternatives; stop
        // before the remote tail once a healthy local choice exists and
        // the bad count is tolerable
        let mut best_metric = 1e9;
        let mut next_metric = 1e9;
        let mut best_time = 1e9;
        let mut next_time = 1e9;
        let mut bad_servers = 0;

        for i in 0..size {
            if bad_servers < i.min(knobs.max_bad_options + 1)
                && i == alternatives.count_best()
            {
                break;
            }

            let endpoint = alternatives.get(i).endpoint();
            if !ctx.failure_monitor.get_state(&endpoint).failed {
                let meas = model.sample(endpoint.token);
                if clock.now() > meas.failed_until {
                    let this_metric = meas.outstanding;
                    let this_time = meas.latency;
                    if knobs.penalty_is_bad && meas.penalty > 1.001 {
                        bad_servers += 1;
                    }

                    if this_metric < best_metric {
                        if i != best_alt {
                            next_alt = best_alt;
                            next_metric = best_metric;
                            next_time = best_time;
                        }
                        best_alt = i;
                        best_metric = this_metric;
                        best_time = this_time;
                    } else if this_metric < next_metric {
                        next_alt = i;
                        next_metric = this_metric;
                        next_time = this_time;
                    }
                } else {
                    bad_servers += 1;
                }
            } else {
                bad_servers += 1;
            }
        }

        if next_metric > 1e8 {
            // no viable second choice in the local prefix; go through the
            // remote tail that the early break may have skipped
            for i in alternatives.count_best()..size {
                let endpoint = alternatives.get(i).endpoint();
                if !ctx.failure_monitor.get_state(&endpoint).failed {
                    let meas = model.sample(endpoint.token);
                    if clock.now() > meas.failed_until
                        && meas.outstanding < next_metric
                    {
                        next_alt = i;
                        next_metric = meas.outstanding;
                        next_time = meas.latency;
                    }
                }
            }
        }

        if next_time < 1e9 {
            // decide when to send the request to the second best choice
            let hedge_after = model.second_multiplier() * next_time
                + knobs.base_second_request_time;
            if best_time > knobs.instant_second_request_multiplier * hedge_after
            {
                second_delay = SecondDelay::After(0.0);
            } else {
                second_delay = SecondDelay::After(hedge_after);
            }
        } else {
            second_delay = SecondDelay::Never;
        }
    }

    let start_alt = next_alt;
    let start_distance = (best_alt + size - start_alt % size) % size;

    let mut num_attempts = 0usize;
    let mut backoff = 0.0f64;
    let mut tried_all_options = false;
    let mut last_watchdog = f64::NEG_INFINITY;

    loop {
        if clock.now() - start_time > knobs.watchdog_secs
            && clock.now() - last_watchdog > 1.0
        {
            last_watchdog = clock.now();
            pf_warn!(
                "dispatch to '{}' taking long: elapsed {:.1}s attempts {} backoff {:.2}s tried_all {}",
                alternatives.description(),
                clock.now() - start_time,
                num_attempts,
                backoff,
                tried_all_options
            );
            for i in 0..size {
                let endpoint = alternatives.get(i).endpoint();
                pf_warn!(
                    "  alternative {}: addr {} token {} failed {}",
                    i,
                    endpoint.addr,
                    endpoint.token,
                    ctx.failure_monitor.get_state(&endpoint).failed
                );
            }
        }

        // find an alternative, if any, that is not failed, starting with
        // next_alt; when a model picked best/next this just realizes that
        // choice
        let mut chosen: Option<usize> = None;
        for _ in 0..size {
            let mut use_alt = next_alt % size;
            if next_alt == start_alt {
                use_alt = best_alt;
            } else if (next_alt + size - start_alt % size) % size
                <= start_distance
            {
                use_alt = (next_alt + size - 1) % size;
            }

            let endpoint = alternatives.get(use_alt).endpoint();
            if !ctx.failure_monitor.get_state(&endpoint).failed
                && first_endpoint != Some(endpoint.token)
            {
                chosen = Some(use_alt);
                break;
            }
            next_alt = (next_alt + 1) % size;
            if next_alt == start_alt {
                tried_all_options = true;
            }
        }

        if chosen.is_none() && !first.is_valid() {
            // everything is down; wait for someone to come back up
            let watchers: Vec<_> = (0..size)
                .map(|i| {
                    let endpoint = alternatives.get(i).endpoint();
                    Box::pin(async move {
                        ctx.failure_monitor
                            .on_state_equal(&endpoint, FailureStatus::ok())
                            .await;
                    })
                })
                .collect();
            let any_up = select_all(watchers);

            if !alternatives.always_fresh() {
                let delay = ctx.alternatives_failure_delay();
                pf_warn!(
                    "all alternatives failed for '{}'; refresh delay {:.3}s",
                    alternatives.description(),
                    delay
                );
                tokio::select! {
                    _ = any_up => {}
                    _ = clock.delay_jittered(delay) => {
                        return Err(EstuaryError::AllAlternativesFailed);
                    }
                }
            } else {
                any_up.await;
            }

            num_attempts = 0; // a server came back; reset the backoff
        } else if chosen.is_none() {
            // only the first location is available
            let (holder, result) = first.response().await;
            if let Outcome::Delivered(reply) =
                first.check_and_process_result(holder, result, at_most_once)?
            {
                return Ok(reply);
            }
            first_endpoint = None;
        } else if first.is_valid() {
            // the first attempt is taking a long time; issue the hedge and
            // race both
            second.start_request(
                clock,
                backoff,
                tried_all_options,
                alternatives.get(chosen.unwrap()),
                request.clone(),
                model.clone(),
            );

            loop {
                tokio::select! {
                    (holder, result) = first.response(), if first.is_valid() => {
                        if let Outcome::Delivered(reply) = first
                            .check_and_process_result(holder, result, at_most_once)?
                        {
                            return Ok(reply);
                        }
                        first_endpoint = None;
                    }
                    (holder, result) = second.response() => {
                        if let Outcome::Delivered(reply) = second
                            .check_and_process_result(holder, result, at_most_once)?
                        {
                            return Ok(reply);
                        }
                        break;
                    }
                }
            }

            num_attempts += 1;
            if num_attempts >= size {
                backoff = (backoff * knobs.backoff_rate)
                    .max(knobs.start_backoff)
                    .min(knobs.max_backoff);
            }
        } else {
            // issue a request; if it takes too long to get a reply, hedge
            // or go around the loop
            first.start_request(
                clock,
                backoff,
                tried_all_options,
                alternatives.get(chosen.unwrap()),
                request.clone(),
                model.clone(),
            );
            first_endpoint =
                Some(alternatives.get(chosen.unwrap()).endpoint().token);

            loop {
                let hedge_after = match second_delay {
                    SecondDelay::After(secs) => secs,
                    SecondDelay::Never => 0.0,
                };
                tokio::select! {
                    (holder, result) = first.response() => {
                        if let Some(model) = &model {
                            model.on_first_reply(
                                knobs.second_request_multiplier_decay,
                                knobs.second_request_budget_growth,
                                knobs.second_request_max_budget,
                            );
                        }
                        if let Outcome::Delivered(reply) = first
                            .check_and_process_result(holder, result, at_most_once)?
                        {
                            return Ok(reply);
                        }
                        first_endpoint = None;
                        break;
                    }
                    _ = clock.delay(hedge_after),
                        if second_delay != SecondDelay::Never =>
                    {
                        second_delay = SecondDelay::Never;
                        if let Some(model) = &model {
                            if model.try_spend_hedge(
                                knobs.second_request_multiplier_growth,
                            ) {
                                break;
                            }
                        }
                    }
                }
            }

            num_attempts += 1;
            if num_attempts >= size {
                backoff = (backoff * knobs.backoff_rate)
                    .max(knobs.start_backoff)
                    .min(knobs.max_backoff);
            }
        }

        next_alt = (next_alt + 1) % size;
        if next_alt == start_alt {
            tried_all_options = true;
        }
        second_delay = SecondDelay::Never;
    }
}

/// A simpler dispatch for always-fresh alternatives sets that never hedges
/// and uses no queue model: placement follows recent busyness reports, and
/// only ambiguous transport failures are retried.
pub async fn basic_load_balance<R, S>(
    ctx: &RpcContext,
    alternatives: &Arc<Alternatives<S>>,
    mut request: R,
    priority: TaskPriority,
    at_most_once: bool,
) -> Result<R::Reply, EstuaryError>
where
    R: Request,
    S: RequestStream<R>,
{
    request.set_reply_priority(priority);

    if alternatives.is_empty() || !alternatives.always_fresh() {
        return logged_err!(
            "basic dispatch requires a non-empty always-fresh set, got '{}'",
            alternatives.description()
        );
    }

    let clock = ctx.clock;
    let knobs = &ctx.config;
    let size = alternatives.len();

    let best_alt = alternatives.get_best(clock.now());
    let mut next_alt = rand::thread_rng().gen_range(0..(size - 1).max(1));
    if next_alt >= best_alt {
        next_alt += 1;
    }

    let start_alt = next_alt;
    let start_distance = (best_alt + size - start_alt % size) % size;

    let mut num_attempts = 0usize;
    let mut backoff = 0.0f64;

    loop {
        // find an alternative, if any, that is not failed
        let mut chosen: Option<usize> = None;
        for _ in 0..size {
            let mut use_alt = next_alt % size;
            if next_alt == start_alt {
                use_alt = best_alt;
            } else if (next_alt + size - start_alt % size) % size
                <= start_distance
            {
                use_alt = (next_alt + size - 1) % size;
            }

            let endpoint = alternatives.get(use_alt).endpoint();
            if !ctx.failure_monitor.get_state(&endpoint).failed {
                chosen = Some(use_alt);
                break;
            }
            next_alt = (next_alt + 1) % size;
        }

        match chosen {
            None => {
                // everything is down; wait for someone to come back up
                let watchers: Vec<_> = (0..size)
                    .map(|i| {
                        let endpoint = alternatives.get(i).endpoint();
                        Box::pin(async move {
                            ctx.failure_monitor
                                .on_state_equal(
                                    &endpoint,
                                    FailureStatus::ok(),
                                )
                                .await;
                        })
                    })
                    .collect();
                select_all(watchers).await;
                num_attempts = 0;
            }
            Some(use_alt) => {
                if backoff > 0.0 {
                    clock.delay(backoff).await;
                }

                let stream = alternatives.get(use_alt);
                match stream.try_get_reply(request.clone()).await {
                    Ok(reply) => {
                        if let Some(basic) = reply.basic_load_balanced_reply()
                        {
                            alternatives.update_recent(
                                use_alt,
                                basic.process_busy_time,
                                clock.now(),
                            );
                        }
                        return Ok(reply);
                    }
                    Err(err) => {
                        if !err.is_maybe_delivered() {
                            return Err(err);
                        }
                        if at_most_once {
                            return Err(EstuaryError::RequestMaybeDelivered);
                        }
                        num_attempts += 1;
                        if num_attempts >= size {
                            backoff = (backoff * knobs.backoff_rate)
                                .max(knobs.start_backoff)
                                .min(knobs.max_backoff);
                        }
                    }
                }
            }
        }

        next_alt = (next_alt + 1) % size;
    }
}
