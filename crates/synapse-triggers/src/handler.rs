//! Handler trait and the runtime surface handlers execute against.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use synapse_store_core::EventStore;
use synapse_types::{Event, EventMeta, EventVariant};

/// An event handler bound to a trigger.
///
/// Handlers are arbitrary user code; the core only requires that they finish
/// in finite time and signal failure by returning an error (a panic is
/// treated the same way by the dispatch loop). Redelivery after a failure is
/// the baseline behavior, so side effects on external systems must be
/// idempotent.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handle the triggering event.
    async fn handle(&self, ctx: &HandlerContext) -> Result<()>;
}

/// Runtime surface a handler sees during one invocation.
///
/// Carries the immutable triggering event, the scope chosen by the trigger
/// for this invocation, and a publish path back into the same event store so
/// handlers can emit derived events.
pub struct HandlerContext {
    event: Event,
    scope: String,
    store: Arc<dyn EventStore>,
}

impl HandlerContext {
    /// Build a context for one handler invocation.
    pub fn new(event: Event, scope: impl Into<String>, store: Arc<dyn EventStore>) -> Self {
        Self {
            event,
            scope: scope.into(),
            store,
        }
    }

    /// The event that triggered this invocation.
    pub fn event(&self) -> &Event {
        &self.event
    }

    /// The scope string this invocation is serialized under. Informational.
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Publish a new event into the store that dispatched this one.
    ///
    /// The event re-enters the same dispatch loop, possibly on this very
    /// worker.
    pub async fn publish(&self, event: &Event) -> Result<()> {
        self.store.publish(event).await
    }

    /// Build an event causally linked to the triggering event.
    ///
    /// The trace id is propagated and `causation_id`/`correlation_id` are
    /// filled from the triggering event via [`EventMeta::derived`]. The event
    /// is returned unpublished so callers can adjust it first.
    pub fn derive<V: EventVariant>(
        &self,
        source: impl Into<String>,
        variant: &V,
    ) -> Result<Event> {
        Ok(Event::new(source, variant)?.with_meta(EventMeta::derived(&self.event)))
    }
}
