//! Run queue and dispatcher.

pub mod dispatcher;
pub mod queue;

pub use dispatcher::Dispatcher;
pub use queue::{Cancellation, Dequeued, RunQueue};
