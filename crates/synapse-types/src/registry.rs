//! Runtime event-type registry.
//!
//! The registry maps kind discriminators to registered variants so that
//! stored events can be parsed back into validated envelopes. Exactly one
//! variant may own a discriminator; registering the same variant again is a
//! no-op, registering a different variant under a taken discriminator fails.

use std::any::TypeId;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use once_cell::sync::Lazy;
use serde_json::{Map, Value};

use crate::{Event, EventError, EventVariant};

/// Validation thunk, monomorphized per registered variant.
type PayloadCheck = fn(&Map<String, Value>) -> Result<(), serde_json::Error>;

struct RegisteredVariant {
    type_id: TypeId,
    check: PayloadCheck,
}

/// Maps kind discriminators to typed event variants.
///
/// The registry is safe for concurrent use; registration normally happens at
/// startup while parsing runs concurrently on the dispatch path.
#[derive(Default)]
pub struct EventTypeRegistry {
    variants: RwLock<HashMap<String, RegisteredVariant>>,
}

impl EventTypeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry pre-loaded with the built-in variants.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        crate::variants::register_builtins(&registry);
        registry
    }

    /// Register `V` under its [`EventVariant::KIND`] discriminator.
    ///
    /// Registering the same variant more than once is idempotent. Fails with
    /// [`EventError::DuplicateType`] when a different variant already holds
    /// the discriminator.
    pub fn register<V: EventVariant>(&self) -> Result<(), EventError> {
        let mut variants = self
            .variants
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        match variants.entry(V::KIND.to_string()) {
            Entry::Occupied(entry) => {
                if entry.get().type_id == TypeId::of::<V>() {
                    Ok(())
                } else {
                    Err(EventError::DuplicateType {
                        kind: V::KIND.to_string(),
                    })
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(RegisteredVariant {
                    type_id: TypeId::of::<V>(),
                    check: check_payload::<V>,
                });
                Ok(())
            }
        }
    }

    /// Parse a serialized envelope, validating its payload against the
    /// registered variant for its discriminator.
    pub fn parse(&self, raw: &str) -> Result<Event, EventError> {
        let event: Event = serde_json::from_str(raw)?;

        let variants = self.variants.read().unwrap_or_else(PoisonError::into_inner);
        let registered = variants.get(&event.kind).ok_or_else(|| EventError::UnknownType {
            kind: event.kind.clone(),
        })?;

        (registered.check)(&event.payload).map_err(|e| EventError::Schema {
            kind: event.kind.clone(),
            reason: e.to_string(),
        })?;

        Ok(event)
    }

    /// Whether a variant is registered for `kind`.
    pub fn is_registered(&self, kind: &str) -> bool {
        self.variants
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(kind)
    }

    /// Snapshot of all registered discriminators, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self
            .variants
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        kinds.sort();
        kinds
    }
}

fn check_payload<V: EventVariant>(payload: &Map<String, Value>) -> Result<(), serde_json::Error> {
    serde_json::from_value::<V>(Value::Object(payload.clone())).map(|_| ())
}

static GLOBAL: Lazy<EventTypeRegistry> = Lazy::new(EventTypeRegistry::with_builtins);

/// The process-global registry, pre-loaded with the built-in variants.
///
/// Applications that want full isolation (tests, embedded uses) can build
/// their own [`EventTypeRegistry`] instead.
pub fn global_registry() -> &'static EventTypeRegistry {
    &GLOBAL
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::variants::WsMessage;

    #[derive(Debug, Serialize, Deserialize)]
    struct OrderCreated {
        order_id: String,
        total_cents: i64,
    }

    impl EventVariant for OrderCreated {
        const KIND: &'static str = "order.created";
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct ImposterOrder {
        sku: String,
    }

    impl EventVariant for ImposterOrder {
        const KIND: &'static str = "order.created";
    }

    #[test]
    fn registration_is_idempotent_for_same_variant() {
        let registry = EventTypeRegistry::new();
        registry.register::<OrderCreated>().unwrap();
        registry.register::<OrderCreated>().unwrap();
        assert_eq!(registry.kinds(), vec!["order.created".to_string()]);
    }

    #[test]
    fn conflicting_variant_is_rejected() {
        let registry = EventTypeRegistry::new();
        registry.register::<OrderCreated>().unwrap();
        let err = registry.register::<ImposterOrder>().unwrap_err();
        assert!(matches!(err, EventError::DuplicateType { kind } if kind == "order.created"));
    }

    #[test]
    fn parse_selects_variant_by_discriminator() {
        let registry = EventTypeRegistry::with_builtins();
        let event = Event::new(
            "ws:client-2",
            &WsMessage {
                connection_id: "c2".into(),
                content: "ping".into(),
            },
        )
        .unwrap();

        let parsed = registry.parse(&event.to_json().unwrap()).unwrap();
        assert_eq!(parsed, event);
        assert_eq!(parsed.kind, WsMessage::KIND);
    }

    #[test]
    fn parse_unknown_type_fails() {
        let registry = EventTypeRegistry::new();
        let raw = r#"{"id":"e1","type":"mystery","source":"s","timestamp":"2026-01-01T00:00:00Z"}"#;
        let err = registry.parse(raw).unwrap_err();
        assert!(matches!(err, EventError::UnknownType { kind } if kind == "mystery"));
    }

    #[test]
    fn parse_invalid_payload_fails_schema() {
        let registry = EventTypeRegistry::new();
        registry.register::<OrderCreated>().unwrap();
        // total_cents has the wrong JSON type.
        let raw = r#"{"id":"e2","type":"order.created","source":"s",
                      "timestamp":"2026-01-01T00:00:00Z",
                      "order_id":"o1","total_cents":"a lot"}"#;
        let err = registry.parse(raw).unwrap_err();
        assert!(matches!(err, EventError::Schema { .. }));
    }

    #[test]
    fn global_registry_knows_builtins() {
        assert!(global_registry().is_registered("ws.message"));
        assert!(global_registry().is_registered("timer.tick"));
    }
}
