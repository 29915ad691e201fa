//! Per-endpoint reachability oracle with edge-triggered notifications.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::rpc::endpoint::{Endpoint, EndpointToken};

use tokio::sync::watch;

/// Reachability verdict for one endpoint incarnation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureStatus {
    /// Whether the endpoint is currently considered unreachable.
    pub failed: bool,
}

impl FailureStatus {
    /// Status of a reachable endpoint.
    pub fn ok() -> Self {
        FailureStatus { failed: false }
    }

    /// Status of an unreachable endpoint.
    pub fn down() -> Self {
        FailureStatus { failed: true }
    }
}

/// Pointwise reachability oracle. Observations are monotone per endpoint
/// incarnation within a generation; no ordering across endpoints is
/// guaranteed. Endpoints never heard about count as reachable.
#[derive(Debug)]
pub struct FailureMonitor {
    /// Map from endpoint token -> latest observation, with a watch channel
    /// per endpoint for `on_state_equal` waiters.
    states: Mutex<HashMap<EndpointToken, watch::Sender<bool>>>,
}

impl FailureMonitor {
    /// Creates a new, empty failure monitor.
    pub fn new() -> Self {
        FailureMonitor {
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Latest observed state of the given endpoint.
    pub fn get_state(&self, endpoint: &Endpoint) -> FailureStatus {
        let states = self.states.lock().unwrap();
        match states.get(&endpoint.token) {
            Some(tx) => FailureStatus {
                failed: *tx.borrow(),
            },
            None => FailureStatus::ok(),
        }
    }

    /// Records an observation of the endpoint, waking any `on_state_equal`
    /// waiters for the new state.
    pub fn set_state(&self, endpoint: &Endpoint, status: FailureStatus) {
        let mut states = self.states.lock().unwrap();
        match states.get(&endpoint.token) {
            Some(tx) => {
                tx.send_replace(status.failed);
            }
            None => {
                states
                    .insert(endpoint.token, watch::channel(status.failed).0);
            }
        }
    }

    /// Completes the next time the endpoint is observed in the given state
    /// (immediately if it is already there).
    pub async fn on_state_equal(
        &self,
        endpoint: &Endpoint,
        status: FailureStatus,
    ) {
        let mut rx = {
            let mut states = self.states.lock().unwrap();
            states
                .entry(endpoint.token)
                .or_insert_with(|| watch::channel(false).0)
                .subscribe()
        };
        if rx.wait_for(|failed| *failed == status.failed).await.is_err() {
            // monitor dropped from under the waiter; stay pending so the
            // caller's notification never fires spuriously
            std::future::pending::<()>().await;
        }
    }
}

impl Default for FailureMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod failmon_tests {
    use super::*;
    use std::sync::Arc;
    use tokio::time::{self, Duration};

    fn endpoint(token: EndpointToken) -> Endpoint {
        Endpoint {
            addr: "127.0.0.1:52800".parse().unwrap(),
            token,
        }
    }

    #[test]
    fn unknown_counts_as_ok() {
        let monitor = FailureMonitor::new();
        assert_eq!(monitor.get_state(&endpoint(1)), FailureStatus::ok());
    }

    #[test]
    fn set_then_get() {
        let monitor = FailureMonitor::new();
        monitor.set_state(&endpoint(1), FailureStatus::down());
        assert_eq!(monitor.get_state(&endpoint(1)), FailureStatus::down());
        monitor.set_state(&endpoint(1), FailureStatus::ok());
        assert_eq!(monitor.get_state(&endpoint(1)), FailureStatus::ok());
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_woken_on_recovery() {
        let monitor = Arc::new(FailureMonitor::new());
        monitor.set_state(&endpoint(5), FailureStatus::down());

        let monitor_ref = monitor.clone();
        let waiter = tokio::spawn(async move {
            monitor_ref
                .on_state_equal(&endpoint(5), FailureStatus::ok())
                .await;
        });

        time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        monitor.set_state(&endpoint(5), FailureStatus::ok());
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn already_equal_completes_now() {
        let monitor = FailureMonitor::new();
        monitor.set_state(&endpoint(2), FailureStatus::down());
        monitor
            .on_state_equal(&endpoint(2), FailureStatus::down())
            .await;
    }
}
