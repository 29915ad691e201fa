//! Single-writer, single-reader reply promise built on a oneshot channel.

use std::mem;

use crate::utils::EstuaryError;

use tokio::sync::oneshot;

/// Sender half of a reply channel.
///
/// Exactly one of `send`, `send_error`, or `send_never` may be called.
/// Dropping an unsent promise surfaces as `BrokenPromise` on the receiver
/// side, matching a server task that died before replying.
#[derive(Debug)]
pub struct Promise<T> {
    /// Underlying oneshot sender.
    tx: oneshot::Sender<Result<T, EstuaryError>>,
}

/// Receiver half of a reply channel.
#[derive(Debug)]
pub struct PromiseHandle<T> {
    /// Underlying oneshot receiver.
    rx: oneshot::Receiver<Result<T, EstuaryError>>,
}

/// Creates a connected promise/handle pair.
pub fn promise_pair<T>() -> (Promise<T>, PromiseHandle<T>) {
    let (tx, rx) = oneshot::channel();
    (Promise { tx }, PromiseHandle { rx })
}

impl<T> Promise<T> {
    /// Fulfills the promise with a reply.
    pub fn send(self, reply: T) {
        let _ = self.tx.send(Ok(reply));
    }

    /// Fulfills the promise with an error.
    pub fn send_error(self, err: EstuaryError) {
        let _ = self.tx.send(Err(err));
    }

    /// Makes the reply one that will never arrive: the channel is kept open
    /// forever, so the receiver suspends indefinitely rather than observing
    /// `BrokenPromise`. Used for stale requests whose sender has already
    /// moved on and will not look at the result.
    pub fn send_never(self) {
        mem::forget(self.tx);
    }
}

impl<T> PromiseHandle<T> {
    /// Waits for the reply, surfacing a dropped sender as `BrokenPromise`.
    pub async fn wait(self) -> Result<T, EstuaryError> {
        self.rx
            .await
            .unwrap_or(Err(EstuaryError::BrokenPromise))
    }
}

#[cfg(test)]
mod promise_tests {
    use super::*;
    use tokio::time::{self, Duration};

    #[tokio::test]
    async fn send_then_wait() {
        let (promise, handle) = promise_pair();
        promise.send(39);
        assert_eq!(handle.wait().await, Ok(39));
    }

    #[tokio::test]
    async fn send_error_then_wait() {
        let (promise, handle) = promise_pair::<u64>();
        promise.send_error(EstuaryError::ServerOverloaded);
        assert_eq!(handle.wait().await, Err(EstuaryError::ServerOverloaded));
    }

    #[tokio::test]
    async fn dropped_is_broken_promise() {
        let (promise, handle) = promise_pair::<u64>();
        drop(promise);
        assert_eq!(handle.wait().await, Err(EstuaryError::BrokenPromise));
    }

    #[tokio::test(start_paused = true)]
    async fn never_never_arrives() {
        let (promise, handle) = promise_pair::<u64>();
        promise.send_never();
        tokio::select! {
            _ = handle.wait() => panic!("never-reply arrived"),
            _ = time::sleep(Duration::from_secs(3600)) => {}
        }
    }
}
