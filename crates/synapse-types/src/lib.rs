#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **synapse-types** – Core event model for the Synapse dispatch core.
//!
//! This crate defines the event envelope shared by every other Synapse crate:
//! an opaque id, a string discriminator (the event *kind*), a producer label,
//! a creation timestamp, trace metadata, and a variant-specific payload. It
//! also hosts the runtime [`registry::EventTypeRegistry`] that maps kind
//! discriminators to typed variants for deserialization.
//!
//! Events are immutable value objects: stores and handlers receive them by
//! value and never mutate them in place.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub mod registry;
pub mod variants;

//─────────────────────────────
//  Trace metadata
//─────────────────────────────

/// Trace context carried by every event.
///
/// `trace_id` identifies the overall trace and is always present.
/// `correlation_id` links every event belonging to one workflow, while
/// `causation_id` points at the single event that directly produced this one.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventMeta {
    /// Unique identifier for the trace this event belongs to.
    pub trace_id: String,
    /// Links related events across a workflow.
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// The event that directly caused this one.
    #[serde(default)]
    pub causation_id: Option<String>,
}

impl Default for EventMeta {
    fn default() -> Self {
        Self {
            trace_id: Uuid::new_v4().to_string(),
            correlation_id: None,
            causation_id: None,
        }
    }
}

impl EventMeta {
    /// Build the metadata for an event derived from `parent`.
    ///
    /// The trace id is propagated unchanged, `causation_id` becomes the
    /// parent's id, and `correlation_id` falls back to the parent's id when
    /// the parent is the root of its workflow.
    pub fn derived(parent: &Event) -> Self {
        Self {
            trace_id: parent.meta.trace_id.clone(),
            correlation_id: Some(
                parent
                    .meta
                    .correlation_id
                    .clone()
                    .unwrap_or_else(|| parent.id.clone()),
            ),
            causation_id: Some(parent.id.clone()),
        }
    }
}

//─────────────────────────────
//  Event envelope
//─────────────────────────────

/// A typed event flowing through the dispatch core.
///
/// The envelope carries the fields shared by every event; the variant-specific
/// payload is kept as a JSON object and flattened into the same serialized
/// object, so the wire format has common fields and payload fields as
/// siblings:
///
/// ```json
/// {"id":"…","type":"ws.message","source":"ws:client-7","timestamp":"…",
///  "meta":{"trace_id":"…"},"connection_id":"c7","content":"hi"}
/// ```
///
/// Use [`Event::new`] to build an envelope from a typed variant and
/// [`Event::payload`] to recover the typed view.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Unique event id (UUID v4 by default).
    pub id: String,
    /// Kind discriminator, e.g. `ws.message` or `order.created`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Free-form origin label, e.g. `ws:client-7` or `timer:billing`.
    pub source: String,
    /// Event creation time (UTC).
    pub timestamp: DateTime<Utc>,
    /// Trace metadata.
    #[serde(default)]
    pub meta: EventMeta,
    /// Variant payload, flattened into the serialized object.
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Event {
    /// Build an event from a typed variant.
    ///
    /// A fresh id, the current time, and default metadata are filled in; the
    /// variant must serialize to a JSON object.
    pub fn new<V: EventVariant>(source: impl Into<String>, variant: &V) -> Result<Self, EventError> {
        let payload = match serde_json::to_value(variant)? {
            Value::Object(map) => map,
            other => {
                return Err(EventError::NonObjectPayload {
                    kind: V::KIND.to_string(),
                    found: value_kind(&other),
                })
            }
        };

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            kind: V::KIND.to_string(),
            source: source.into(),
            timestamp: Utc::now(),
            meta: EventMeta::default(),
            payload,
        })
    }

    /// Replace the trace metadata, consuming and returning the event.
    pub fn with_meta(mut self, meta: EventMeta) -> Self {
        self.meta = meta;
        self
    }

    /// Recover the typed payload of this event.
    ///
    /// Fails with [`EventError::KindMismatch`] when `V` does not match the
    /// envelope's discriminator, or [`EventError::Schema`] when the payload no
    /// longer deserializes into `V`.
    pub fn payload<V: EventVariant>(&self) -> Result<V, EventError> {
        if self.kind != V::KIND {
            return Err(EventError::KindMismatch {
                expected: V::KIND.to_string(),
                found: self.kind.clone(),
            });
        }
        serde_json::from_value(Value::Object(self.payload.clone())).map_err(|e| {
            EventError::Schema {
                kind: self.kind.clone(),
                reason: e.to_string(),
            }
        })
    }

    /// Serialize the full envelope to its canonical JSON form.
    pub fn to_json(&self) -> Result<String, EventError> {
        Ok(serde_json::to_string(self)?)
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

//─────────────────────────────
//  Event variant trait
//─────────────────────────────

/// A typed event payload with a fixed kind discriminator.
///
/// Implementors are plain serde structs carrying the variant-specific fields;
/// the constant [`EventVariant::KIND`] is the value stored in the envelope's
/// `type` field. Register variants with an
/// [`registry::EventTypeRegistry`] so stored events can be parsed back.
pub trait EventVariant: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Discriminator value stored in the envelope's `type` field.
    const KIND: &'static str;
}

//─────────────────────────────
//  Error types
//─────────────────────────────

/// Errors produced by the event model and type registry.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    /// A different variant already owns this discriminator.
    #[error("event type {kind:?} is already registered to a different variant")]
    DuplicateType {
        /// The contested discriminator.
        kind: String,
    },
    /// No variant is registered for this discriminator.
    #[error("unknown event type {kind:?}")]
    UnknownType {
        /// The unregistered discriminator.
        kind: String,
    },
    /// The payload failed validation against the registered variant.
    #[error("event payload for {kind:?} failed validation: {reason}")]
    Schema {
        /// Discriminator of the offending event.
        kind: String,
        /// Deserialization failure detail.
        reason: String,
    },
    /// A typed payload was requested for the wrong discriminator.
    #[error("expected event type {expected:?}, found {found:?}")]
    KindMismatch {
        /// Discriminator of the requested variant.
        expected: String,
        /// Discriminator actually present in the envelope.
        found: String,
    },
    /// The variant serialized to something other than a JSON object.
    #[error("variant for {kind:?} must serialize to a JSON object, found {found}")]
    NonObjectPayload {
        /// Discriminator of the offending variant.
        kind: String,
        /// JSON type actually produced.
        found: &'static str,
    },
    /// Envelope serialization or deserialization failed.
    #[error("event serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

//─────────────────────────────
//  Convenience re-exports
//─────────────────────────────

/// Convenient prelude for importing the most common types.
pub mod prelude {
    pub use super::registry::{global_registry, EventTypeRegistry};
    pub use super::variants::{FileChange, HttpRequest, Lifecycle, TimerTick, WsMessage};
    pub use super::{Event, EventError, EventMeta, EventVariant};
}
