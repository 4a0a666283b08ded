#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **synapse-triggers** – Trigger matching for the Synapse dispatch core.
//!
//! A *trigger* binds an event filter to a handler, together with a priority
//! and a scope-key extractor. This crate provides the three pieces of that
//! binding:
//!
//! * the composable [`filters`] algebra deciding which events a trigger
//!   accepts,
//! * the [`Handler`] trait and [`HandlerContext`] runtime surface handlers
//!   execute against, and
//! * the [`TriggerRegistry`] the dispatch loop consults to route each claimed
//!   event, in priority order.

pub mod filters;

mod handler;
mod registry;

pub use handler::{Handler, HandlerContext};
pub use registry::{ScopeFn, Trigger, TriggerBuilder, TriggerRegistry};

/// Errors raised while building or registering triggers.
#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    /// A trigger with this name is already registered.
    #[error("trigger {name:?} is already registered")]
    DuplicateName {
        /// The contested trigger name.
        name: String,
    },
    /// The builder was finalized without a filter.
    #[error("trigger {name:?} has no filter")]
    MissingFilter {
        /// Name of the half-built trigger.
        name: String,
    },
    /// The builder was finalized without a handler.
    #[error("trigger {name:?} has no handler")]
    MissingHandler {
        /// Name of the half-built trigger.
        name: String,
    },
    /// A source filter pattern failed to compile.
    #[error("invalid source pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

/// Convenient prelude for importing the most common types.
pub mod prelude {
    pub use super::filters::{
        all_of, any_of, not_matching, AndFilter, DedupeFilter, EventFilter, FilterContext,
        FilterExt, KeywordFilter, NotFilter, OrFilter, RateLimitFilter, SourceFilter, TypeFilter,
    };
    pub use super::{
        Handler, HandlerContext, ScopeFn, Trigger, TriggerBuilder, TriggerError, TriggerRegistry,
    };
}
