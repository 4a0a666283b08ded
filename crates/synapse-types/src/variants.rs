//! Built-in event variants.
//!
//! These cover the common ingestion surfaces (socket messages, HTTP requests,
//! timers, file watchers) plus internal lifecycle signals. Applications add
//! their own variants by implementing [`EventVariant`] and registering them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::registry::EventTypeRegistry;
use crate::EventVariant;

/// Message received on a WebSocket connection.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct WsMessage {
    /// Connection the message arrived on.
    pub connection_id: String,
    /// Raw message content.
    pub content: String,
}

impl EventVariant for WsMessage {
    const KIND: &'static str = "ws.message";
}

/// Inbound HTTP request handed to the dispatch core.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HttpRequest {
    /// HTTP method.
    pub method: String,
    /// Request path.
    pub path: String,
    /// Parsed JSON body, when present.
    #[serde(default)]
    pub body: Option<Value>,
}

impl EventVariant for HttpRequest {
    const KIND: &'static str = "http.request";
}

/// Tick from a named periodic timer.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimerTick {
    /// Name of the timer that fired.
    pub timer_name: String,
    /// Ticks fired so far, starting at zero.
    #[serde(default)]
    pub tick_count: u64,
}

impl EventVariant for TimerTick {
    const KIND: &'static str = "timer.tick";
}

/// Kind of change observed on a watched file.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileChangeKind {
    /// The file appeared.
    Created,
    /// The file contents changed.
    Modified,
    /// The file was removed.
    Deleted,
}

/// File system change notification.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileChange {
    /// Path of the affected file.
    pub path: String,
    /// What happened to it.
    pub change_type: FileChangeKind,
}

impl EventVariant for FileChange {
    const KIND: &'static str = "file.change";
}

/// Lifecycle transition reported by a component.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleAction {
    /// The component came up.
    Started,
    /// The component shut down.
    Stopped,
    /// The component hit an error.
    Error,
}

/// Internal lifecycle signal.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Lifecycle {
    /// The transition that occurred.
    pub action: LifecycleAction,
    /// Optional human-readable detail.
    #[serde(default)]
    pub details: Option<String>,
}

impl EventVariant for Lifecycle {
    const KIND: &'static str = "lifecycle";
}

/// Register every built-in variant on `registry`.
pub fn register_builtins(registry: &EventTypeRegistry) {
    // Built-in kinds never collide with each other, so these cannot fail.
    let _ = registry.register::<WsMessage>();
    let _ = registry.register::<HttpRequest>();
    let _ = registry.register::<TimerTick>();
    let _ = registry.register::<FileChange>();
    let _ = registry.register::<Lifecycle>();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Event;

    #[test]
    fn file_change_kind_uses_lowercase_wire_names() {
        let event = Event::new(
            "watcher:/etc",
            &FileChange {
                path: "/etc/synapse.toml".into(),
                change_type: FileChangeKind::Modified,
            },
        )
        .unwrap();

        let raw: Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(raw["change_type"], "modified");
    }

    #[test]
    fn builtin_registration_covers_all_kinds() {
        let registry = EventTypeRegistry::with_builtins();
        assert_eq!(
            registry.kinds(),
            vec![
                "file.change".to_string(),
                "http.request".to_string(),
                "lifecycle".to_string(),
                "timer.tick".to_string(),
                "ws.message".to_string(),
            ]
        );
    }
}
