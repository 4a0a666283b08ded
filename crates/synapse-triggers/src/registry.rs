//! Triggers and the priority-ordered trigger registry.

use std::cmp::Reverse;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use synapse_types::Event;

use crate::filters::{EventFilter, FilterContext};
use crate::{Handler, TriggerError};

/// Extracts the serialization scope from an event.
pub type ScopeFn = Arc<dyn Fn(&Event) -> String + Send + Sync>;

/// A named binding of a filter to a handler.
///
/// The scope function extracts the key that serializes handler execution;
/// events with the same scope are handled one at a time. By default the
/// event's source is the scope, which serializes per producer.
pub struct Trigger {
    name: String,
    filter: Box<dyn EventFilter>,
    handler: Arc<dyn Handler>,
    scope_fn: ScopeFn,
    priority: i32,
    context: FilterContext,
}

impl std::fmt::Debug for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trigger")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

impl Trigger {
    /// Start building a trigger with the given unique name.
    pub fn builder(name: impl Into<String>) -> TriggerBuilder {
        TriggerBuilder {
            name: name.into(),
            filter: None,
            handler: None,
            scope_fn: None,
            priority: 0,
        }
    }

    /// The trigger's unique name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execution priority; higher fires first.
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// The bound handler.
    pub fn handler(&self) -> &Arc<dyn Handler> {
        &self.handler
    }

    /// Whether this trigger's filter accepts `event`.
    pub fn matches(&self, event: &Event) -> bool {
        self.filter.matches(event, Some(&self.context))
    }

    /// The scope key serializing this trigger's execution for `event`.
    pub fn scope_for(&self, event: &Event) -> String {
        (self.scope_fn)(event)
    }
}

/// Builder for [`Trigger`].
pub struct TriggerBuilder {
    name: String,
    filter: Option<Box<dyn EventFilter>>,
    handler: Option<Arc<dyn Handler>>,
    scope_fn: Option<ScopeFn>,
    priority: i32,
}

impl TriggerBuilder {
    /// Set the filter deciding which events fire this trigger.
    pub fn filter(mut self, filter: impl EventFilter + 'static) -> Self {
        self.filter = Some(Box::new(filter));
        self
    }

    /// Set the handler executed when the trigger fires.
    pub fn handler(mut self, handler: impl Handler + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Set an already-shared handler.
    pub fn handler_arc(mut self, handler: Arc<dyn Handler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Set the scope extractor. Defaults to the event's source.
    pub fn scope(mut self, scope_fn: impl Fn(&Event) -> String + Send + Sync + 'static) -> Self {
        self.scope_fn = Some(Arc::new(scope_fn));
        self
    }

    /// Set the priority; higher-priority triggers fire first. Defaults to 0.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Finalize the trigger.
    pub fn build(self) -> Result<Trigger, TriggerError> {
        let filter = self.filter.ok_or_else(|| TriggerError::MissingFilter {
            name: self.name.clone(),
        })?;
        let handler = self.handler.ok_or_else(|| TriggerError::MissingHandler {
            name: self.name.clone(),
        })?;
        Ok(Trigger {
            name: self.name,
            filter,
            handler,
            scope_fn: self
                .scope_fn
                .unwrap_or_else(|| Arc::new(|event: &Event| event.source.clone())),
            priority: self.priority,
            context: FilterContext::default(),
        })
    }
}

/// Priority-ordered table of triggers.
///
/// Registration and unregistration are the only mutations and normally
/// happen at startup; matching during dispatch takes the read side only.
#[derive(Default)]
pub struct TriggerRegistry {
    triggers: RwLock<Vec<Arc<Trigger>>>,
}

impl TriggerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a trigger, keeping the table sorted by priority.
    ///
    /// Names are unique; registering a second trigger under an existing name
    /// fails.
    pub fn register(&self, trigger: Trigger) -> Result<(), TriggerError> {
        let mut triggers = self.triggers.write().unwrap_or_else(PoisonError::into_inner);
        if triggers.iter().any(|t| t.name == trigger.name) {
            return Err(TriggerError::DuplicateName { name: trigger.name });
        }
        debug!(trigger = %trigger.name, priority = trigger.priority, "trigger registered");
        triggers.push(Arc::new(trigger));
        // Stable sort keeps registration order among equal priorities.
        triggers.sort_by_key(|t| Reverse(t.priority));
        Ok(())
    }

    /// Remove a trigger by name. Returns whether one was removed.
    pub fn unregister(&self, name: &str) -> bool {
        let mut triggers = self.triggers.write().unwrap_or_else(PoisonError::into_inner);
        match triggers.iter().position(|t| t.name == name) {
            Some(index) => {
                triggers.remove(index);
                true
            }
            None => false,
        }
    }

    /// Look up a trigger by name.
    pub fn get(&self, name: &str) -> Option<Arc<Trigger>> {
        self.triggers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|t| t.name == name)
            .cloned()
    }

    /// Every trigger whose filter accepts `event`, highest priority first;
    /// ties keep registration order.
    pub fn matching(&self, event: &Event) -> Vec<Arc<Trigger>> {
        self.triggers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|t| t.matches(event))
            .cloned()
            .collect()
    }

    /// Snapshot of all registered triggers in match order.
    pub fn triggers(&self) -> Vec<Arc<Trigger>> {
        self.triggers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of registered triggers.
    pub fn len(&self) -> usize {
        self.triggers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every trigger.
    pub fn clear(&self) {
        self.triggers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use crate::filters::TypeFilter;
    use crate::HandlerContext;
    use synapse_types::variants::WsMessage;

    use super::*;

    struct NoopHandler;

    #[async_trait]
    impl Handler for NoopHandler {
        async fn handle(&self, _ctx: &HandlerContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn trigger(name: &str, priority: i32) -> Trigger {
        Trigger::builder(name)
            .filter(TypeFilter::new(["ws.message"]))
            .handler(NoopHandler)
            .priority(priority)
            .build()
            .unwrap()
    }

    fn event() -> Event {
        Event::new(
            "ws:client-1",
            &WsMessage {
                connection_id: "c1".into(),
                content: "hi".into(),
            },
        )
        .unwrap()
    }

    #[test]
    fn builder_requires_filter_and_handler() {
        let err = Trigger::builder("bare").build().unwrap_err();
        assert!(matches!(err, TriggerError::MissingFilter { .. }));

        let err = Trigger::builder("bare")
            .filter(TypeFilter::new(["ws.message"]))
            .build()
            .unwrap_err();
        assert!(matches!(err, TriggerError::MissingHandler { .. }));
    }

    #[test]
    fn default_scope_is_event_source() {
        let t = trigger("scoped", 0);
        assert_eq!(t.scope_for(&event()), "ws:client-1");

        let t = Trigger::builder("custom")
            .filter(TypeFilter::new(["ws.message"]))
            .handler(NoopHandler)
            .scope(|e| format!("conn:{}", e.source))
            .build()
            .unwrap();
        assert_eq!(t.scope_for(&event()), "conn:ws:client-1");
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let registry = TriggerRegistry::new();
        registry.register(trigger("t", 0)).unwrap();
        let err = registry.register(trigger("t", 5)).unwrap_err();
        assert!(matches!(err, TriggerError::DuplicateName { .. }));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn matching_orders_by_priority_then_registration() {
        let registry = TriggerRegistry::new();
        registry.register(trigger("low", 1)).unwrap();
        registry.register(trigger("high", 10)).unwrap();
        registry.register(trigger("tie-a", 5)).unwrap();
        registry.register(trigger("tie-b", 5)).unwrap();

        let names: Vec<String> = registry
            .matching(&event())
            .iter()
            .map(|t| t.name().to_string())
            .collect();
        assert_eq!(names, vec!["high", "tie-a", "tie-b", "low"]);
    }

    #[test]
    fn matching_skips_non_accepting_filters() {
        let registry = TriggerRegistry::new();
        registry.register(trigger("ws", 0)).unwrap();
        registry
            .register(
                Trigger::builder("timers")
                    .filter(TypeFilter::new(["timer.tick"]))
                    .handler(NoopHandler)
                    .build()
                    .unwrap(),
            )
            .unwrap();

        let matched = registry.matching(&event());
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].name(), "ws");
    }

    #[test]
    fn unregister_and_clear() {
        let registry = TriggerRegistry::new();
        registry.register(trigger("a", 0)).unwrap();
        registry.register(trigger("b", 0)).unwrap();

        assert!(registry.unregister("a"));
        assert!(!registry.unregister("a"));
        assert!(registry.get("b").is_some());
        assert!(registry.get("a").is_none());

        registry.clear();
        assert!(registry.is_empty());
    }
}
