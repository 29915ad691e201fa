//! State machine for one in-flight replica attempt made by the load
//! balancer, including lagging-request retention on abandonment.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::rpc::endpoint::{Reply, Request, RequestStream};
use crate::rpc::model::{ModelHolder, QueueModel};
use crate::utils::{Clock, EstuaryError};

/// Classified outcome of a completed attempt.
#[derive(Debug)]
pub(crate) enum Outcome<T> {
    /// The reply was delivered and should be returned to the caller.
    Delivered(T),

    /// The attempt failed in a way that is worth retrying elsewhere.
    Retry,
}

/// The pending attempt: acquires the model holder (after an optional
/// backoff delay), performs the RPC, and yields both so classification can
/// settle the model accounting. Owning the holder inside the future means
/// dropping the future mid-flight releases the model cleanly, and moving
/// the future into the lagging collection keeps accounting alive.
type ResponseFuture<T> =
    Pin<Box<dyn Future<Output = (ModelHolder, Result<T, EstuaryError>)> + Send>>;

/// State of one request attempt.
pub(crate) struct RequestData<R: Request> {
    /// Pending response future; `None` before start and after completion.
    response: Option<ResponseFuture<R::Reply>>,

    /// Set (from inside the response future) once the request has actually
    /// been sent to an alternative, i.e. past any backoff delay.
    started: Arc<AtomicBool>,

    /// True once a response has been classified by
    /// `check_and_process_result`.
    processed: bool,

    /// Whether every alternative had been tried when this attempt started.
    tried_all_options: bool,

    /// Model to detach into if the attempt outlives its caller.
    model: Option<Arc<QueueModel>>,
}

impl<R: Request> RequestData<R> {
    /// Creates an idle attempt slot.
    pub(crate) fn new() -> Self {
        RequestData {
            response: None,
            started: Arc::new(AtomicBool::new(false)),
            processed: false,
            tried_all_options: false,
            model: None,
        }
    }

    /// Whether a response is (or will be) in flight.
    pub(crate) fn is_valid(&self) -> bool {
        self.response.is_some()
    }

    /// Initializes the attempt state and starts it, possibly after a
    /// backoff delay; the model registration happens only once the actual
    /// send is imminent.
    pub(crate) fn start_request<S: RequestStream<R>>(
        &mut self,
        clock: Clock,
        backoff: f64,
        tried_all_options: bool,
        stream: &Arc<S>,
        request: R,
        model: Option<Arc<QueueModel>>,
    ) {
        self.started = Arc::new(AtomicBool::new(false));
        self.processed = false;
        self.tried_all_options = tried_all_options;
        self.model = model.clone();

        let started = Arc::clone(&self.started);
        let stream = Arc::clone(stream);
        let token = stream.endpoint().token;
        self.response = Some(Box::pin(async move {
            if backoff > 0.0 {
                clock.delay(backoff).await;
            }
            started.store(true, Ordering::Relaxed);
            let holder = ModelHolder::new(model, token);
            let result = stream.try_get_reply(request).await;
            (holder, result)
        }));
    }

    /// Awaits the pending response, consuming it. Callers must guard with
    /// `is_valid()`.
    pub(crate) async fn response(
        &mut self,
    ) -> (ModelHolder, Result<R::Reply, EstuaryError>) {
        let out = self
            .response
            .as_mut()
            .expect("no response in flight")
            .as_mut()
            .await;
        self.response = None;
        out
    }

    /// Classifies a completed response, settling the model accounting.
    /// `Ok(Delivered)` carries the reply; `Ok(Retry)` means re-select; an
    /// `Err` is surfaced to the original caller.
    pub(crate) fn check_and_process_result(
        &mut self,
        holder: ModelHolder,
        result: Result<R::Reply, EstuaryError>,
        at_most_once: bool,
    ) -> Result<Outcome<R::Reply>, EstuaryError> {
        self.processed = true;
        check_and_process_result_impl(
            holder,
            result,
            at_most_once,
            self.tried_all_options,
        )
    }
}

impl<R: Request> Drop for RequestData<R> {
    fn drop(&mut self) {
        // an attempt that was sent but never classified becomes a lagging
        // request so the queue model still sees its eventual outcome
        if let Some(fut) = self.response.take() {
            if !self.processed && self.started.load(Ordering::Relaxed) {
                if let Some(model) = self.model.take() {
                    let tried_all_options = self.tried_all_options;
                    model.add_lagging(async move {
                        let (holder, result) = fut.await;
                        let _ = check_and_process_result_impl(
                            holder,
                            result,
                            false,
                            tried_all_options,
                        );
                    });
                }
            }
        }
    }
}

/// Shared classification logic for live and lagging attempts.
///
/// The rules, in order:
///   - a reply with no in-band error (or no load-balanced header at all)
///     counts as delivered;
///   - `ServerOverloaded` is retriable and not delivered;
///   - `BrokenPromise` / `RequestMaybeDelivered` mean the request may have
///     executed: retriable, but under `at_most_once` they surface as
///     `RequestMaybeDelivered`;
///   - `FutureVersion` / `ProcessBehind` are version-ordering lag:
///     retriable until every alternative was tried in this pass, then
///     surfaced;
///   - every other in-band or transport error is a definite failure and is
///     surfaced immediately.
pub(crate) fn check_and_process_result_impl<T: Reply>(
    mut holder: ModelHolder,
    result: Result<T, EstuaryError>,
    at_most_once: bool,
    tried_all_options: bool,
) -> Result<Outcome<T>, EstuaryError> {
    let header = result
        .as_ref()
        .ok()
        .and_then(|reply| reply.load_balanced_reply())
        .cloned();

    let err = match &header {
        Some(header) => header.error.clone(),
        None => result.as_ref().err().cloned(),
    };

    let maybe_delivered = matches!(
        err,
        Some(EstuaryError::BrokenPromise)
            | Some(EstuaryError::RequestMaybeDelivered)
    );
    let version_lag = matches!(
        err,
        Some(EstuaryError::FutureVersion) | Some(EstuaryError::ProcessBehind)
    );
    let mut received_response = match &header {
        Some(header) => header.error.is_none(),
        None => result.is_ok(),
    };
    received_response = received_response || (!maybe_delivered && !version_lag);

    holder.release(
        received_response,
        version_lag,
        header.as_ref().map(|h| h.penalty).unwrap_or(-1.0),
        true,
    );

    if matches!(err, Some(EstuaryError::ServerOverloaded)) {
        return Ok(Outcome::Retry);
    }

    if let Ok(reply) = result {
        match &header {
            Some(header) if header.error.is_some() => {
                // in-band failure; classified below through `err`
            }
            _ => return Ok(Outcome::Delivered(reply)),
        }
    }

    if received_response {
        // the server definitely processed the request and failed it
        return Err(err.expect("received failure carries an error"));
    }

    if at_most_once && maybe_delivered {
        return Err(EstuaryError::RequestMaybeDelivered);
    }

    if tried_all_options && version_lag {
        return Err(err.expect("version lag carries an error"));
    }

    Ok(Outcome::Retry)
}

#[cfg(test)]
mod request_tests {
    use super::*;
    use crate::rpc::endpoint::LoadBalancedReply;
    use crate::rpc::model::{ConfigQueueModel, ModelHolder};
    use crate::utils::Clock;

    #[derive(Debug, Clone, PartialEq)]
    struct EchoReply {
        header: Option<LoadBalancedReply>,
    }

    impl Reply for EchoReply {
        fn load_balanced_reply(&self) -> Option<&LoadBalancedReply> {
            self.header.as_ref()
        }
    }

    fn classify(
        result: Result<EchoReply, EstuaryError>,
        at_most_once: bool,
        tried_all_options: bool,
    ) -> Result<Outcome<EchoReply>, EstuaryError> {
        check_and_process_result_impl(
            ModelHolder::new(None, 0),
            result,
            at_most_once,
            tried_all_options,
        )
    }

    fn with_inner(error: Option<EstuaryError>) -> EchoReply {
        EchoReply {
            header: Some(LoadBalancedReply {
                penalty: 1.0,
                error,
            }),
        }
    }

    #[test]
    fn clean_reply_is_delivered() {
        match classify(Ok(with_inner(None)), false, false) {
            Ok(Outcome::Delivered(_)) => {}
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn headerless_reply_is_delivered() {
        let reply = EchoReply { header: None };
        match classify(Ok(reply), false, false) {
            Ok(Outcome::Delivered(_)) => {}
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn overloaded_is_retriable() {
        let inner = with_inner(Some(EstuaryError::ServerOverloaded));
        assert!(matches!(
            classify(Ok(inner), false, false),
            Ok(Outcome::Retry)
        ));
        assert!(matches!(
            classify(Err(EstuaryError::ServerOverloaded), false, false),
            Ok(Outcome::Retry)
        ));
    }

    #[test]
    fn maybe_delivered_retries_unless_at_most_once() {
        for err in
            [EstuaryError::BrokenPromise, EstuaryError::RequestMaybeDelivered]
        {
            assert!(matches!(
                classify(Err(err.clone()), false, false),
                Ok(Outcome::Retry)
            ));
            assert_eq!(
                classify(Err(err), true, false).unwrap_err(),
                EstuaryError::RequestMaybeDelivered
            );
        }
    }

    #[test]
    fn version_lag_surfaces_only_after_full_pass() {
        for err in [EstuaryError::FutureVersion, EstuaryError::ProcessBehind] {
            assert!(matches!(
                classify(Err(err.clone()), false, false),
                Ok(Outcome::Retry)
            ));
            assert_eq!(
                classify(Err(err.clone()), false, true).unwrap_err(),
                err
            );
        }
    }

    #[test]
    fn other_inner_error_surfaces() {
        let inner = with_inner(Some(EstuaryError::PleaseReboot));
        assert_eq!(
            classify(Ok(inner), false, false).unwrap_err(),
            EstuaryError::PleaseReboot
        );
        assert_eq!(
            classify(Err(EstuaryError::TimedOut), false, false).unwrap_err(),
            EstuaryError::TimedOut
        );
    }

    #[tokio::test(start_paused = true)]
    async fn delivered_penalty_feeds_model() {
        let clock = Clock::new();
        let model = std::sync::Arc::new(crate::rpc::QueueModel::new(
            ConfigQueueModel::default(),
            clock,
        ));

        let holder = ModelHolder::new(Some(model.clone()), 17);
        let reply = EchoReply {
            header: Some(LoadBalancedReply {
                penalty: 3.0,
                error: None,
            }),
        };
        check_and_process_result_impl(holder, Ok(reply), false, false)
            .unwrap();
        assert_eq!(model.sample(17).penalty, 3.0);
    }
}
