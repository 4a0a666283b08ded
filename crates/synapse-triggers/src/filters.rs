//! Composable event filters.
//!
//! Filters decide which events fire which triggers. Primitives match on the
//! discriminator, the source label, or serialized content; stateful filters
//! rate-limit or deduplicate; [`AndFilter`]/[`OrFilter`]/[`NotFilter`] and
//! the [`FilterExt`] combinators compose them:
//!
//! ```
//! use synapse_triggers::filters::{FilterExt, SourceFilter, TypeFilter};
//!
//! let vip_messages = TypeFilter::new(["ws.message"])
//!     .and(SourceFilter::new(r"ws:vip-.*").unwrap());
//! ```
//!
//! Stateful filters carry their own internal synchronization: the same
//! trigger's filter may be evaluated from several dispatch workers at once.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use regex::Regex;
use serde_json::Value;

use synapse_types::Event;

use crate::TriggerError;

/// Default bound on the [`FilterContext`] event window.
const DEFAULT_WINDOW_CAPACITY: usize = 128;

/// Default key capacity for [`DedupeFilter`].
const DEFAULT_MAX_KEYS: usize = 10_000;

//─────────────────────────────
//  Filter trait and context
//─────────────────────────────

/// A predicate over events.
///
/// `ctx` carries optional shared state for filters that want history beyond
/// their own internals; stateless filters ignore it.
pub trait EventFilter: Send + Sync {
    /// Whether `event` passes this filter.
    fn matches(&self, event: &Event, ctx: Option<&FilterContext>) -> bool;
}

/// Shared state for stateful filtering: a bounded window of recent events and
/// an ad-hoc state bag.
///
/// Owned by a single trigger; state never leaks between triggers. All access
/// is internally synchronized.
pub struct FilterContext {
    window: Mutex<VecDeque<Event>>,
    capacity: usize,
    state: Mutex<HashMap<String, Value>>,
}

impl Default for FilterContext {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_WINDOW_CAPACITY)
    }
}

impl FilterContext {
    /// Create a context whose event window holds at most `capacity` events.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            window: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Append an event to the window, evicting the oldest beyond capacity.
    pub fn observe(&self, event: &Event) {
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        window.push_back(event.clone());
        while window.len() > self.capacity {
            window.pop_front();
        }
    }

    /// Snapshot of the observed events, oldest first.
    pub fn recent(&self) -> Vec<Event> {
        self.window
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Store an arbitrary state value under `key`.
    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value);
    }

    /// Fetch a state value by `key`.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }
}

//─────────────────────────────
//  Stateless primitives
//─────────────────────────────

/// Matches events whose kind is one of the given discriminators.
#[derive(Clone, Debug)]
pub struct TypeFilter {
    kinds: Vec<String>,
}

impl TypeFilter {
    /// Create a filter accepting the given event kinds.
    pub fn new<I, S>(kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kinds: kinds.into_iter().map(Into::into).collect(),
        }
    }
}

impl EventFilter for TypeFilter {
    fn matches(&self, event: &Event, _ctx: Option<&FilterContext>) -> bool {
        self.kinds.iter().any(|k| *k == event.kind)
    }
}

/// Matches events whose source matches a regular expression anchored at the
/// start of the label.
#[derive(Clone, Debug)]
pub struct SourceFilter {
    pattern: Regex,
}

impl SourceFilter {
    /// Compile `pattern`; fails on invalid regex syntax.
    pub fn new(pattern: &str) -> Result<Self, TriggerError> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
        })
    }
}

impl EventFilter for SourceFilter {
    fn matches(&self, event: &Event, _ctx: Option<&FilterContext>) -> bool {
        // Prefix semantics: the match must begin at the start of the source.
        self.pattern
            .find(&event.source)
            .is_some_and(|m| m.start() == 0)
    }
}

/// Matches events whose serialized form contains any of the given keywords.
#[derive(Clone, Debug)]
pub struct KeywordFilter {
    keywords: Vec<String>,
    case_sensitive: bool,
}

impl KeywordFilter {
    /// Create a keyword filter.
    pub fn new<I, S>(keywords: I, case_sensitive: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keywords: keywords.into_iter().map(Into::into).collect(),
            case_sensitive,
        }
    }
}

impl EventFilter for KeywordFilter {
    fn matches(&self, event: &Event, _ctx: Option<&FilterContext>) -> bool {
        let Ok(content) = event.to_json() else {
            return false;
        };
        if self.case_sensitive {
            self.keywords.iter().any(|kw| content.contains(kw))
        } else {
            let content = content.to_lowercase();
            self.keywords
                .iter()
                .any(|kw| content.contains(&kw.to_lowercase()))
        }
    }
}

//─────────────────────────────
//  Stateful primitives
//─────────────────────────────

/// Admits at most `max_events` events within any rolling window.
///
/// The filter tracks the timestamps of the events it admitted; aged
/// timestamps are evicted on every evaluation, so an instance never grows
/// past `max_events` entries. Each instance has independent state.
pub struct RateLimitFilter {
    max_events: usize,
    window: Duration,
    admitted: Mutex<VecDeque<DateTime<Utc>>>,
}

impl RateLimitFilter {
    /// Create a filter admitting `max_events` per `window`.
    pub fn new(max_events: usize, window: Duration) -> Self {
        Self {
            max_events,
            window,
            admitted: Mutex::new(VecDeque::new()),
        }
    }
}

impl EventFilter for RateLimitFilter {
    fn matches(&self, _event: &Event, _ctx: Option<&FilterContext>) -> bool {
        let now = Utc::now();
        let cutoff =
            now - chrono::Duration::from_std(self.window).unwrap_or_else(|_| chrono::Duration::max_value());

        let mut admitted = self.admitted.lock().unwrap_or_else(PoisonError::into_inner);
        while admitted.front().is_some_and(|ts| *ts < cutoff) {
            admitted.pop_front();
        }

        if admitted.len() >= self.max_events {
            return false;
        }
        admitted.push_back(now);
        true
    }
}

/// Rejects events whose key was seen within the deduplication window.
///
/// Keys live in an insertion-ordered table bounded by `max_keys`; when the
/// table overflows, the least-recently-inserted key is evicted. A `None`
/// window deduplicates forever (within the table bound).
pub struct DedupeFilter {
    key_fn: Box<dyn Fn(&Event) -> String + Send + Sync>,
    window: Option<Duration>,
    max_keys: usize,
    seen: Mutex<IndexMap<String, DateTime<Utc>>>,
}

impl DedupeFilter {
    /// Create a dedupe filter with the default key capacity.
    pub fn new(
        key_fn: impl Fn(&Event) -> String + Send + Sync + 'static,
        window: Option<Duration>,
    ) -> Self {
        Self::with_max_keys(key_fn, window, DEFAULT_MAX_KEYS)
    }

    /// Create a dedupe filter tracking at most `max_keys` keys.
    pub fn with_max_keys(
        key_fn: impl Fn(&Event) -> String + Send + Sync + 'static,
        window: Option<Duration>,
        max_keys: usize,
    ) -> Self {
        Self {
            key_fn: Box::new(key_fn),
            window,
            max_keys,
            seen: Mutex::new(IndexMap::new()),
        }
    }
}

impl EventFilter for DedupeFilter {
    fn matches(&self, event: &Event, _ctx: Option<&FilterContext>) -> bool {
        let now = Utc::now();
        let key = (self.key_fn)(event);
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(window) = self.window {
            let cutoff =
                now - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::max_value());
            // shift-removal keeps the remaining keys in insertion order.
            seen.retain(|_, ts| *ts >= cutoff);
        }

        if let Some(last_seen) = seen.get_mut(&key) {
            *last_seen = now;
            return false;
        }

        seen.insert(key, now);
        while seen.len() > self.max_keys {
            seen.shift_remove_index(0);
        }
        true
    }
}

//─────────────────────────────
//  Boolean composition
//─────────────────────────────

/// Matches when every child filter matches. Short-circuits.
pub struct AndFilter {
    filters: Vec<Box<dyn EventFilter>>,
}

impl AndFilter {
    /// Combine `filters` with AND logic.
    pub fn new(filters: Vec<Box<dyn EventFilter>>) -> Self {
        Self { filters }
    }
}

impl EventFilter for AndFilter {
    fn matches(&self, event: &Event, ctx: Option<&FilterContext>) -> bool {
        self.filters.iter().all(|f| f.matches(event, ctx))
    }
}

/// Matches when at least one child filter matches. Short-circuits.
pub struct OrFilter {
    filters: Vec<Box<dyn EventFilter>>,
}

impl OrFilter {
    /// Combine `filters` with OR logic.
    pub fn new(filters: Vec<Box<dyn EventFilter>>) -> Self {
        Self { filters }
    }
}

impl EventFilter for OrFilter {
    fn matches(&self, event: &Event, ctx: Option<&FilterContext>) -> bool {
        self.filters.iter().any(|f| f.matches(event, ctx))
    }
}

/// Matches when the child filter does not.
pub struct NotFilter {
    filter: Box<dyn EventFilter>,
}

impl NotFilter {
    /// Negate `filter`.
    pub fn new(filter: Box<dyn EventFilter>) -> Self {
        Self { filter }
    }
}

impl EventFilter for NotFilter {
    fn matches(&self, event: &Event, ctx: Option<&FilterContext>) -> bool {
        !self.filter.matches(event, ctx)
    }
}

/// Combinator methods so filters compose syntactically.
pub trait FilterExt: EventFilter + Sized + 'static {
    /// Both `self` and `other` must match.
    fn and<F: EventFilter + 'static>(self, other: F) -> AndFilter {
        AndFilter::new(vec![Box::new(self), Box::new(other)])
    }

    /// Either `self` or `other` must match.
    fn or<F: EventFilter + 'static>(self, other: F) -> OrFilter {
        OrFilter::new(vec![Box::new(self), Box::new(other)])
    }

    /// `self` must not match.
    fn not(self) -> NotFilter {
        NotFilter::new(Box::new(self))
    }
}

impl<T: EventFilter + Sized + 'static> FilterExt for T {}

/// Combine all `filters` with AND logic.
pub fn all_of(filters: Vec<Box<dyn EventFilter>>) -> AndFilter {
    AndFilter::new(filters)
}

/// Combine all `filters` with OR logic.
pub fn any_of(filters: Vec<Box<dyn EventFilter>>) -> OrFilter {
    OrFilter::new(filters)
}

/// Negate `filter`.
pub fn not_matching(filter: impl EventFilter + 'static) -> NotFilter {
    NotFilter::new(Box::new(filter))
}
