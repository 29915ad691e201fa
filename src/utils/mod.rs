//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod clock;
mod error;
mod promise;
mod smoother;

pub use clock::Clock;
pub use error::EstuaryError;
pub use promise::{promise_pair, Promise, PromiseHandle};
pub use smoother::Smoother;
