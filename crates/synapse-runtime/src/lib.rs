#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **synapse-runtime** – The Synapse dispatch loop.
//!
//! The [`Dispatcher`] is the long-running heart of the system: it claims
//! batches of pending events from the store, matches each against the trigger
//! registry, runs matching handlers sequentially in priority order under
//! their scope locks, and settles every claimed event with exactly one ack or
//! nack. Concurrency across events is bounded by a semaphore; handler panics
//! are contained and treated as failures.
//!
//! The loop runs under a restart supervisor: store-level failures crash the
//! inner loop, which the supervisor restarts with exponential backoff until
//! shutdown is requested.

mod dispatcher;
mod settings;

pub use dispatcher::{run_once, Dispatcher, DispatcherConfig, DispatcherHandle};
pub use settings::Settings;
