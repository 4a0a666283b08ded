#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **synapse-store-core** – Core event-store abstractions for Synapse.
//!
//! This crate defines the contracts for the durable event log without
//! providing concrete implementations: the persisted record shape and its
//! status lifecycle, the claim/ack/nack protocol, the retry policy, and the
//! wake channel that lets subscribers sleep between publications instead of
//! polling.
//!
//! Store drivers (in-memory, PostgreSQL) implement these traits in separate
//! crates that depend on this core abstraction.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use synapse_types::{Event, EventError};

//─────────────────────────────
//  Record model
//─────────────────────────────

/// Processing state of a persisted event row.
///
/// Transitions are enforced by the store:
///
/// ```text
///   publish            claim               success
///   ──────▶ pending ─────────▶ processing ─────────▶ completed
///                                      │ failure, attempts < max
///                                      ├───────────▶ pending  (next_retry_at set)
///                                      │ failure, attempts ≥ max
///                                      └───────────▶ dlq
/// ```
///
/// `dlq → pending` happens only through an explicit operator retry, which
/// resets `attempts` and clears the stored error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventStatus {
    /// Waiting to be claimed.
    Pending,
    /// Claimed by a worker; exactly one ack or nack is owed.
    Processing,
    /// Successfully handled.
    Completed,
    /// Dead-lettered after exhausting retries (or an unparseable payload).
    Dlq,
}

impl EventStatus {
    /// Stable textual form used in the persisted `status` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Processing => "processing",
            EventStatus::Completed => "completed",
            EventStatus::Dlq => "dlq",
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EventStatus::Pending),
            "processing" => Ok(EventStatus::Processing),
            "completed" => Ok(EventStatus::Completed),
            "dlq" => Ok(EventStatus::Dlq),
            other => Err(StoreError::InvalidStatus {
                status: other.to_string(),
            }),
        }
    }
}

/// A persisted event row.
///
/// The serialized `payload` is authoritative; the remaining columns exist for
/// claim queries and operator inspection. The store exclusively owns rows and
/// their lifecycle.
#[derive(Clone, Debug, PartialEq)]
pub struct EventRecord {
    /// Event id (primary key).
    pub id: String,
    /// Kind discriminator.
    pub kind: String,
    /// Producer label.
    pub source: String,
    /// Event creation time.
    pub timestamp: DateTime<Utc>,
    /// Serialized event envelope, authoritative.
    pub payload: String,
    /// Current processing state.
    pub status: EventStatus,
    /// Claims so far; incremented when a worker claims the row.
    pub attempts: i32,
    /// Last failure message, if any.
    pub error: Option<String>,
    /// Row insertion time.
    pub created_at: DateTime<Utc>,
    /// Set when the row reaches `completed`.
    pub processed_at: Option<DateTime<Utc>>,
    /// Earliest instant the row may be re-claimed after a retryable failure.
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl EventRecord {
    /// Build a fresh `pending` row for `event`.
    pub fn from_event(event: &Event) -> Result<Self, EventError> {
        Ok(Self {
            id: event.id.clone(),
            kind: event.kind.clone(),
            source: event.source.clone(),
            timestamp: event.timestamp,
            payload: event.to_json()?,
            status: EventStatus::Pending,
            attempts: 0,
            error: None,
            created_at: Utc::now(),
            processed_at: None,
            next_retry_at: None,
        })
    }
}

/// Opaque claim token.
///
/// Every event yielded by a subscription comes with a token, and exactly one
/// of [`EventStore::ack`] or [`EventStore::nack`] must be called with it.
/// Dropping the token leaves the row in `processing` indefinitely.
#[derive(Debug, PartialEq, Eq)]
pub struct AckToken(String);

impl AckToken {
    /// Wrap a claimed row id. Intended for store drivers.
    pub fn new(event_id: impl Into<String>) -> Self {
        Self(event_id.into())
    }

    /// Id of the claimed event.
    pub fn event_id(&self) -> &str {
        &self.0
    }
}

/// Dead-letter row as shown to operators.
///
/// The raw payload is carried instead of a parsed [`Event`] because rows can
/// reach the DLQ precisely when their payload no longer parses.
#[derive(Clone, Debug)]
pub struct DlqEntry {
    /// Event id.
    pub id: String,
    /// Kind discriminator.
    pub kind: String,
    /// Producer label.
    pub source: String,
    /// Serialized event envelope.
    pub payload: String,
    /// Last failure message.
    pub error: Option<String>,
    /// Claims consumed before dead-lettering.
    pub attempts: i32,
    /// Row insertion time.
    pub created_at: DateTime<Utc>,
}

//─────────────────────────────
//  Retry policy
//─────────────────────────────

/// Exponential-backoff retry policy applied on nack.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Claims allowed before a failing row is dead-lettered.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub base_delay: Duration,
    /// Upper bound on the backoff delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Backoff delay scheduled after failed attempt number `attempt`
    /// (1-based): `min(base · 2^(attempt−1), max)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        // Past 2^31 the doubling has long since crossed any sane cap.
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        delay.min(self.max_delay)
    }

    /// Whether a row with `attempts` consumed claims has exhausted its
    /// retries.
    pub fn is_exhausted(&self, attempts: i32) -> bool {
        attempts >= 0 && attempts as u32 >= self.max_attempts
    }
}

//─────────────────────────────
//  Store traits
//─────────────────────────────

/// Durable event log with claim/ack/nack delivery and DLQ inspection.
///
/// Stores are safe for concurrent use from many workers; the claim protocol
/// guarantees each pending row is handed to at most one worker at a time,
/// even across replicas sharing the same database.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persist `event` as a `pending` row and wake subscribers.
    ///
    /// Fails with [`StoreError::Duplicate`] when the id already exists;
    /// callers may treat that as idempotent success. The wake notification is
    /// best-effort — correctness never depends on its delivery.
    async fn publish(&self, event: &Event) -> anyhow::Result<()>;

    /// Open a long-running claim subscription.
    ///
    /// `kinds` filters the claimed event types (empty = all); `batch_size`
    /// bounds the rows claimed per iteration. Each yielded token must be
    /// passed to exactly one of [`ack`](EventStore::ack) or
    /// [`nack`](EventStore::nack).
    async fn subscribe(
        &self,
        kinds: &[String],
        batch_size: usize,
    ) -> anyhow::Result<Box<dyn EventSubscription>>;

    /// Mark a claimed event as successfully handled.
    ///
    /// Idempotent over already-completed rows.
    async fn ack(&self, token: AckToken) -> anyhow::Result<()>;

    /// Mark a claimed event as failed.
    ///
    /// Schedules a retry with exponential backoff, or dead-letters the row
    /// once the policy's `max_attempts` is exhausted.
    async fn nack(&self, token: AckToken, error: Option<&str>) -> anyhow::Result<()>;

    /// Replay stored events in `timestamp` order, regardless of status.
    ///
    /// Read-only: no row state changes. `end` defaults to now; `kinds`
    /// filters event types (empty = all).
    async fn replay(
        &self,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
        kinds: &[String],
    ) -> anyhow::Result<Vec<Event>>;

    /// List up to `limit` dead-lettered rows, most recent first.
    async fn dlq_list(&self, limit: usize) -> anyhow::Result<Vec<DlqEntry>>;

    /// Move one dead-lettered row back to `pending`, resetting its attempts
    /// and clearing its error. Returns whether a row was affected.
    async fn dlq_retry(&self, event_id: &str) -> anyhow::Result<bool>;

    /// Move every dead-lettered row back to `pending`. Returns the number of
    /// rows affected.
    async fn dlq_retry_all(&self) -> anyhow::Result<u64>;
}

/// Lazy, infinite sequence of claimed events.
///
/// Each call to [`next`](EventSubscription::next) claims work when available
/// or parks on the wake channel (bounded by the driver's poll timeout) until
/// something becomes claimable. Rows whose stored payload fails validation
/// are dead-lettered by the driver and never yielded.
#[async_trait]
pub trait EventSubscription: Send {
    /// Claim and return the next event together with its ack token.
    async fn next(&mut self) -> anyhow::Result<(Event, AckToken)>;
}

//─────────────────────────────
//  Wake channel
//─────────────────────────────

/// Name of the shared notification channel carrying event ids.
pub const WAKE_CHANNEL: &str = "events";

/// Process- or cluster-level wake signal emitted on publish.
///
/// Required semantics: emitting never blocks the publisher, delivery is
/// allowed to be lossy (a lost signal only delays pickup by one poll
/// timeout), and one emit wakes at least one waiting listener when any
/// exists.
#[async_trait]
pub trait WakeChannel: Send + Sync {
    /// Emit a best-effort wake signal carrying the published event id.
    async fn notify(&self, event_id: &str) -> anyhow::Result<()>;

    /// Open a listener on the channel.
    async fn listen(&self) -> anyhow::Result<Box<dyn WakeListener>>;
}

/// Receiving side of a [`WakeChannel`].
#[async_trait]
pub trait WakeListener: Send {
    /// Park until a wake signal arrives or `timeout` elapses.
    ///
    /// Returns `true` when woken by a signal. Callers must re-check for
    /// claimable work either way — the signal payload is advisory only.
    async fn wait(&mut self, timeout: Duration) -> bool;
}

//─────────────────────────────
//  Error types
//─────────────────────────────

/// Errors raised by event-store drivers.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// An event with this id is already stored.
    #[error("duplicate event id {id:?}")]
    Duplicate {
        /// The conflicting event id.
        id: String,
    },
    /// No row exists for this id.
    #[error("event {id:?} not found")]
    NotFound {
        /// The missing event id.
        id: String,
    },
    /// A stored payload failed validation against the type registry.
    #[error("stored event failed validation: {0}")]
    Schema(#[from] EventError),
    /// The persisted `status` column held an unknown value.
    #[error("invalid event status {status:?}")]
    InvalidStatus {
        /// The unrecognized status string.
        status: String,
    },
    /// The backing storage failed.
    #[error("store backend failure: {reason}")]
    Backend {
        /// Backend failure detail.
        reason: String,
    },
}

/// Whether `err` is a duplicate-publish failure, which callers may treat as
/// idempotent success.
pub fn is_duplicate(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<StoreError>(), Some(StoreError::Duplicate { .. }))
}

//─────────────────────────────
//  Convenience re-exports
//─────────────────────────────

/// Convenient prelude for importing the most common types.
pub mod prelude {
    pub use super::{
        is_duplicate, AckToken, DlqEntry, EventRecord, EventStatus, EventStore,
        EventSubscription, RetryPolicy, StoreError, WakeChannel, WakeListener, WAKE_CHANNEL,
    };
}
