//! Customized unified error type.

use std::fmt;
use std::io;
use std::net;

use serde::{Deserialize, Serialize};

/// Customized error type for Estuary.
///
/// RPC-visible failure kinds get their own variants so that dispatch code
/// can classify replies without string matching; everything else collapses
/// into the `Msg` catch-all.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum EstuaryError {
    /// The reply channel was dropped before anything was sent on it.
    BrokenPromise,

    /// The request may or may not have reached the server; the sender
    /// cannot tell which.
    RequestMaybeDelivered,

    /// The server shed the request due to overload; safe to retry.
    ServerOverloaded,

    /// The server's version horizon is ahead of the requester.
    FutureVersion,

    /// The server is lagging behind the committed version frontier.
    ProcessBehind,

    /// Every alternative endpoint is failed and the alternatives set is not
    /// authoritative; the caller should refresh it.
    AllAlternativesFailed,

    /// The operation exceeded its deadline.
    TimedOut,

    /// The process should restart itself.
    PleaseReboot,

    /// The process should restart itself and wipe its data files.
    PleaseRebootDelete,

    /// A request was addressed to a superseded recruitment generation.
    MasterLifetimeMismatch,

    /// Anything else, carried as its string representation.
    Msg(String),
}

impl EstuaryError {
    /// Creates a `Msg` variant error from anything string-convertible.
    pub fn msg(m: impl ToString) -> Self {
        EstuaryError::Msg(m.to_string())
    }

    /// Whether this error means the request might still have been executed
    /// by the server.
    pub fn is_maybe_delivered(&self) -> bool {
        matches!(
            self,
            EstuaryError::BrokenPromise | EstuaryError::RequestMaybeDelivered
        )
    }
}

impl fmt::Display for EstuaryError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EstuaryError::BrokenPromise => write!(f, "broken promise"),
            EstuaryError::RequestMaybeDelivered => {
                write!(f, "request maybe delivered")
            }
            EstuaryError::ServerOverloaded => write!(f, "server overloaded"),
            EstuaryError::FutureVersion => write!(f, "future version"),
            EstuaryError::ProcessBehind => write!(f, "process behind"),
            EstuaryError::AllAlternativesFailed => {
                write!(f, "all alternatives failed")
            }
            EstuaryError::TimedOut => write!(f, "timed out"),
            EstuaryError::PleaseReboot => write!(f, "please reboot"),
            EstuaryError::PleaseRebootDelete => {
                write!(f, "please reboot and delete data")
            }
            EstuaryError::MasterLifetimeMismatch => {
                write!(f, "master lifetime mismatch")
            }
            EstuaryError::Msg(s) => write!(f, "{}", s), // no literal quotes
        }
    }
}

// Helper macro for saving boiler-plate `impl From<T>`s for transparent
// conversion from various common error types to `EstuaryError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for EstuaryError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                EstuaryError::Msg(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(net::AddrParseError);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = EstuaryError::msg("what the heck?");
        assert_eq!(format!("{}", e), String::from("what the heck?"));
        assert_eq!(
            format!("{}", EstuaryError::RequestMaybeDelivered),
            String::from("request maybe delivered")
        );
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "oh no!");
        let e = EstuaryError::from(io_error);
        assert!(matches!(e, EstuaryError::Msg(s) if s.contains("oh no!")));
    }

    #[test]
    fn maybe_delivered_kinds() {
        assert!(EstuaryError::BrokenPromise.is_maybe_delivered());
        assert!(EstuaryError::RequestMaybeDelivered.is_maybe_delivered());
        assert!(!EstuaryError::ServerOverloaded.is_maybe_delivered());
    }
}
