#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **synapse-store-memory** – In-memory event-store driver for Synapse.
//!
//! This crate provides a fast, non-persistent store suitable for testing,
//! development, and single-process deployments that can tolerate losing the
//! event log on restart. It implements the full claim/retry/DLQ contract of
//! [`synapse_store_core::EventStore`] with the same observable semantics as
//! the PostgreSQL driver, so dispatch behavior exercised against it carries
//! over unchanged.
//!
//! Claims are resolved under a single map lock, which makes the "each pending
//! row is claimed by at most one worker" guarantee trivial here.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

use synapse_store_core::{
    AckToken, DlqEntry, EventRecord, EventStatus, EventStore, EventSubscription, RetryPolicy,
    StoreError, WakeChannel, WakeListener,
};
use synapse_types::registry::EventTypeRegistry;
use synapse_types::Event;

/// Default buffer size for the wake broadcast channel.
const DEFAULT_WAKE_BUFFER: usize = 1024;

/// Default bounded wait between claim attempts when no wake arrives.
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(5);

//─────────────────────────────
//  Wake channel
//─────────────────────────────

/// In-memory wake channel over a tokio broadcast ring buffer.
///
/// Emitting never blocks; listeners that fall behind simply miss signals,
/// which the subscribe loop's bounded poll tolerates by design.
#[derive(Clone, Debug)]
pub struct MemoryWakeChannel {
    tx: broadcast::Sender<String>,
}

impl Default for MemoryWakeChannel {
    fn default() -> Self {
        Self::new(DEFAULT_WAKE_BUFFER)
    }
}

impl MemoryWakeChannel {
    /// Create a wake channel with the given ring-buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Current number of active listeners.
    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[async_trait]
impl WakeChannel for MemoryWakeChannel {
    async fn notify(&self, event_id: &str) -> Result<()> {
        // No listeners is fine - the signal is best-effort.
        let _ = self.tx.send(event_id.to_string());
        Ok(())
    }

    async fn listen(&self) -> Result<Box<dyn WakeListener>> {
        Ok(Box::new(MemoryWakeListener {
            rx: self.tx.subscribe(),
        }))
    }
}

struct MemoryWakeListener {
    rx: broadcast::Receiver<String>,
}

#[async_trait]
impl WakeListener for MemoryWakeListener {
    async fn wait(&mut self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Ok(event_id)) => {
                debug!(event_id, "wake signal received");
                true
            }
            // Lagging means signals arrived while we were away - wake now.
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => true,
            Ok(Err(broadcast::error::RecvError::Closed)) => {
                tokio::time::sleep(timeout).await;
                false
            }
            Err(_) => false,
        }
    }
}

//─────────────────────────────
//  In-memory store
//─────────────────────────────

struct Inner {
    records: RwLock<HashMap<String, EventRecord>>,
    registry: Arc<EventTypeRegistry>,
    policy: RetryPolicy,
    wake: MemoryWakeChannel,
    poll_timeout: Duration,
}

/// An in-memory, non-persistent event store.
///
/// All rows live in a `HashMap` guarded by an async `RwLock`; the wake
/// channel is a broadcast ring buffer. Cloning the store is cheap and shares
/// the underlying state.
#[derive(Clone)]
pub struct MemoryEventStore {
    inner: Arc<Inner>,
}

impl MemoryEventStore {
    /// Create an empty store using the default retry policy.
    pub fn new(registry: Arc<EventTypeRegistry>) -> Self {
        Self::with_policy(registry, RetryPolicy::default())
    }

    /// Create an empty store with a custom retry policy.
    pub fn with_policy(registry: Arc<EventTypeRegistry>, policy: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                records: RwLock::new(HashMap::new()),
                registry,
                policy,
                wake: MemoryWakeChannel::default(),
                poll_timeout: DEFAULT_POLL_TIMEOUT,
            }),
        }
    }

    /// Override the bounded wait used between claim attempts.
    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        // Only reachable before the store is shared.
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.poll_timeout = poll_timeout;
        }
        self
    }

    /// The wake channel shared by this store's subscriptions.
    pub fn wake_channel(&self) -> MemoryWakeChannel {
        self.inner.wake.clone()
    }

    /// Current number of stored rows.
    pub async fn event_count(&self) -> usize {
        self.inner.records.read().await.len()
    }

    /// Fetch a copy of one row, for inspection in tests and tooling.
    pub async fn record(&self, event_id: &str) -> Option<EventRecord> {
        self.inner.records.read().await.get(event_id).cloned()
    }

    /// Drop every stored row.
    pub async fn clear(&self) {
        self.inner.records.write().await.clear();
    }

    /// Claim up to `batch_size` eligible rows, oldest first.
    ///
    /// Runs entirely under the write lock, so concurrent subscriptions can
    /// never claim the same row. Rows whose payload fails registry validation
    /// are dead-lettered here and not returned.
    async fn claim_batch(&self, kinds: &[String], batch_size: usize) -> Vec<(Event, AckToken)> {
        let now = Utc::now();
        let mut records = self.inner.records.write().await;

        let mut eligible: Vec<String> = records
            .values()
            .filter(|r| {
                r.status == EventStatus::Pending
                    && r.next_retry_at.map_or(true, |at| at <= now)
                    && (kinds.is_empty() || kinds.iter().any(|k| *k == r.kind))
            })
            .map(|r| r.id.clone())
            .collect();
        eligible.sort_by_key(|id| records[id].timestamp);
        eligible.truncate(batch_size);

        let mut claimed = Vec::with_capacity(eligible.len());
        for id in eligible {
            let record = match records.get_mut(&id) {
                Some(record) => record,
                None => continue,
            };
            record.status = EventStatus::Processing;
            record.attempts += 1;

            match self.inner.registry.parse(&record.payload) {
                Ok(event) => claimed.push((event, AckToken::new(id))),
                Err(err) => {
                    // Unparseable rows cannot be handled; dead-letter without retry.
                    warn!(event_id = %id, error = %err, "stored event failed validation, moving to DLQ");
                    record.status = EventStatus::Dlq;
                    record.error = Some(err.to_string());
                    record.next_retry_at = None;
                }
            }
        }
        claimed
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn publish(&self, event: &Event) -> Result<()> {
        let record = EventRecord::from_event(event)?;
        {
            let mut records = self.inner.records.write().await;
            if records.contains_key(&event.id) {
                return Err(StoreError::Duplicate {
                    id: event.id.clone(),
                }
                .into());
            }
            records.insert(event.id.clone(), record);
        }
        self.inner.wake.notify(&event.id).await?;
        debug!(event_id = %event.id, kind = %event.kind, "event published");
        Ok(())
    }

    async fn subscribe(
        &self,
        kinds: &[String],
        batch_size: usize,
    ) -> Result<Box<dyn EventSubscription>> {
        let listener = self.inner.wake.listen().await?;
        Ok(Box::new(MemorySubscription {
            store: self.clone(),
            kinds: kinds.to_vec(),
            batch_size,
            listener,
            buffer: VecDeque::new(),
        }))
    }

    async fn ack(&self, token: AckToken) -> Result<()> {
        let mut records = self.inner.records.write().await;
        match records.get_mut(token.event_id()) {
            Some(record) => {
                record.status = EventStatus::Completed;
                record.processed_at = Some(Utc::now());
                Ok(())
            }
            None => {
                warn!(event_id = token.event_id(), "ack for unknown event");
                Ok(())
            }
        }
    }

    async fn nack(&self, token: AckToken, error: Option<&str>) -> Result<()> {
        let policy = self.inner.policy;
        let mut records = self.inner.records.write().await;
        let record = match records.get_mut(token.event_id()) {
            Some(record) => record,
            None => {
                warn!(event_id = token.event_id(), "nack for unknown event");
                return Ok(());
            }
        };

        record.error = error.map(str::to_string);
        if policy.is_exhausted(record.attempts) {
            record.status = EventStatus::Dlq;
            record.next_retry_at = None;
            warn!(event_id = %record.id, attempts = record.attempts, "event dead-lettered");
        } else {
            // `attempts` was already incremented at claim time.
            let delay = policy.delay_for_attempt(record.attempts.max(1) as u32);
            record.status = EventStatus::Pending;
            record.next_retry_at = Some(
                Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::seconds(60)),
            );
            debug!(event_id = %record.id, attempts = record.attempts, ?delay, "retry scheduled");
        }
        Ok(())
    }

    async fn replay(
        &self,
        start: chrono::DateTime<Utc>,
        end: Option<chrono::DateTime<Utc>>,
        kinds: &[String],
    ) -> Result<Vec<Event>> {
        let records = self.inner.records.read().await;
        let mut matching: Vec<&EventRecord> = records
            .values()
            .filter(|r| {
                r.timestamp >= start
                    && end.map_or(true, |e| r.timestamp <= e)
                    && (kinds.is_empty() || kinds.iter().any(|k| *k == r.kind))
            })
            .collect();
        matching.sort_by_key(|r| r.timestamp);

        let mut events = Vec::with_capacity(matching.len());
        for record in matching {
            match self.inner.registry.parse(&record.payload) {
                Ok(event) => events.push(event),
                Err(err) => {
                    warn!(event_id = %record.id, error = %err, "skipping unparseable event in replay")
                }
            }
        }
        Ok(events)
    }

    async fn dlq_list(&self, limit: usize) -> Result<Vec<DlqEntry>> {
        let records = self.inner.records.read().await;
        let mut dead: Vec<&EventRecord> = records
            .values()
            .filter(|r| r.status == EventStatus::Dlq)
            .collect();
        dead.sort_by_key(|r| std::cmp::Reverse(r.created_at));
        Ok(dead
            .into_iter()
            .take(limit)
            .map(|r| DlqEntry {
                id: r.id.clone(),
                kind: r.kind.clone(),
                source: r.source.clone(),
                payload: r.payload.clone(),
                error: r.error.clone(),
                attempts: r.attempts,
                created_at: r.created_at,
            })
            .collect())
    }

    async fn dlq_retry(&self, event_id: &str) -> Result<bool> {
        let moved = {
            let mut records = self.inner.records.write().await;
            match records.get_mut(event_id) {
                Some(record) if record.status == EventStatus::Dlq => {
                    record.status = EventStatus::Pending;
                    record.attempts = 0;
                    record.error = None;
                    record.next_retry_at = None;
                    true
                }
                _ => false,
            }
        };
        if moved {
            self.inner.wake.notify(event_id).await?;
        }
        Ok(moved)
    }

    async fn dlq_retry_all(&self) -> Result<u64> {
        let moved = {
            let mut records = self.inner.records.write().await;
            let mut moved = 0u64;
            for record in records.values_mut() {
                if record.status == EventStatus::Dlq {
                    record.status = EventStatus::Pending;
                    record.attempts = 0;
                    record.error = None;
                    record.next_retry_at = None;
                    moved += 1;
                }
            }
            moved
        };
        if moved > 0 {
            self.inner.wake.notify("").await?;
        }
        Ok(moved)
    }
}

struct MemorySubscription {
    store: MemoryEventStore,
    kinds: Vec<String>,
    batch_size: usize,
    listener: Box<dyn WakeListener>,
    buffer: VecDeque<(Event, AckToken)>,
}

#[async_trait]
impl EventSubscription for MemorySubscription {
    async fn next(&mut self) -> Result<(Event, AckToken)> {
        loop {
            if let Some(pair) = self.buffer.pop_front() {
                return Ok(pair);
            }

            let batch = self.store.claim_batch(&self.kinds, self.batch_size).await;
            if !batch.is_empty() {
                self.buffer.extend(batch);
                continue;
            }

            // Nothing claimable; park until a publish wakes us or the poll
            // timeout forces another look (retry rows become eligible by time).
            self.listener.wait(self.store.inner.poll_timeout).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use synapse_types::variants::WsMessage;

    fn store() -> MemoryEventStore {
        MemoryEventStore::new(Arc::new(EventTypeRegistry::with_builtins()))
            .with_poll_timeout(Duration::from_millis(20))
    }

    fn event(content: &str) -> Event {
        Event::new(
            "ws:test",
            &WsMessage {
                connection_id: "c1".into(),
                content: content.into(),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn publish_claim_ack_lifecycle() {
        let store = store();
        let e = event("one");
        store.publish(&e).await.unwrap();

        let mut sub = store.subscribe(&[], 10).await.unwrap();
        let (claimed, token) = sub.next().await.unwrap();
        assert_eq!(claimed.id, e.id);

        let record = store.record(&e.id).await.unwrap();
        assert_eq!(record.status, EventStatus::Processing);
        assert_eq!(record.attempts, 1);

        store.ack(token).await.unwrap();
        let record = store.record(&e.id).await.unwrap();
        assert_eq!(record.status, EventStatus::Completed);
        assert!(record.processed_at.is_some());
    }

    #[tokio::test]
    async fn duplicate_publish_is_rejected() {
        let store = store();
        let e = event("dup");
        store.publish(&e).await.unwrap();
        let err = store.publish(&e).await.unwrap_err();
        assert!(synapse_store_core::is_duplicate(&err));
    }

    #[tokio::test]
    async fn nack_schedules_backoff_then_dead_letters() {
        let registry = Arc::new(EventTypeRegistry::with_builtins());
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        };
        let store = MemoryEventStore::with_policy(registry, policy)
            .with_poll_timeout(Duration::from_millis(5));

        let e = event("flaky");
        store.publish(&e).await.unwrap();

        let mut sub = store.subscribe(&[], 10).await.unwrap();
        let (_, token) = sub.next().await.unwrap();
        let before = Utc::now();
        store.nack(token, Some("boom")).await.unwrap();

        let record = store.record(&e.id).await.unwrap();
        assert_eq!(record.status, EventStatus::Pending);
        assert_eq!(record.error.as_deref(), Some("boom"));
        let retry_at = record.next_retry_at.unwrap();
        // First failed attempt backs off by the base delay.
        assert!(retry_at >= before + chrono::Duration::seconds(1));
        assert!(retry_at <= Utc::now() + chrono::Duration::seconds(2));

        // The row is not claimable until the backoff elapses.
        assert!(store.claim_batch(&[], 10).await.is_empty());

        // Force eligibility and exhaust the second (final) attempt.
        {
            let mut records = store.inner.records.write().await;
            records.get_mut(&e.id).unwrap().next_retry_at = Some(Utc::now());
        }
        let (_, token) = sub.next().await.unwrap();
        store.nack(token, Some("boom again")).await.unwrap();

        let record = store.record(&e.id).await.unwrap();
        assert_eq!(record.status, EventStatus::Dlq);
        assert_eq!(record.attempts, 2);
        assert!(record.next_retry_at.is_none());
    }

    #[tokio::test]
    async fn kind_filter_limits_claims() {
        let store = store();
        store.publish(&event("a")).await.unwrap();
        let other = Event::new(
            "timer:t",
            &synapse_types::variants::TimerTick {
                timer_name: "t".into(),
                tick_count: 0,
            },
        )
        .unwrap();
        store.publish(&other).await.unwrap();

        let claimed = store
            .claim_batch(&["timer.tick".to_string()], 10)
            .await;
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].0.kind, "timer.tick");
    }

    #[tokio::test]
    async fn concurrent_subscriptions_never_share_a_claim() {
        let store = store();
        for i in 0..50 {
            store.publish(&event(&format!("m{i}"))).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut sub = store.subscribe(&[], 5).await.unwrap();
                let mut seen = Vec::new();
                loop {
                    let claim =
                        tokio::time::timeout(Duration::from_millis(100), sub.next()).await;
                    match claim {
                        Ok(Ok((event, token))) => {
                            seen.push(event.id.clone());
                            store.ack(token).await.unwrap();
                        }
                        _ => break,
                    }
                }
                seen
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort();
        let before_dedup = all.len();
        all.dedup();
        assert_eq!(before_dedup, 50, "every event claimed exactly once");
        assert_eq!(all.len(), 50);
    }

    #[tokio::test]
    async fn unparseable_payload_is_dead_lettered_without_retry() {
        let store = store();
        let e = event("bad");
        store.publish(&e).await.unwrap();
        {
            let mut records = store.inner.records.write().await;
            records.get_mut(&e.id).unwrap().payload =
                r#"{"id":"x","type":"mystery","source":"s","timestamp":"2026-01-01T00:00:00Z"}"#
                    .to_string();
        }

        assert!(store.claim_batch(&[], 10).await.is_empty());
        let record = store.record(&e.id).await.unwrap();
        assert_eq!(record.status, EventStatus::Dlq);
        assert!(record.error.is_some());
    }

    #[tokio::test]
    async fn replay_is_read_only_and_ordered() {
        let store = store();
        let mut e1 = event("first");
        let mut e2 = event("second");
        e1.timestamp = Utc::now() - chrono::Duration::seconds(10);
        e2.timestamp = Utc::now() - chrono::Duration::seconds(5);
        store.publish(&e1).await.unwrap();
        store.publish(&e2).await.unwrap();

        let start = Utc::now() - chrono::Duration::seconds(60);
        let replayed = store.replay(start, None, &[]).await.unwrap();
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0].id, e1.id);
        assert_eq!(replayed[1].id, e2.id);

        for id in [&e1.id, &e2.id] {
            let record = store.record(id).await.unwrap();
            assert_eq!(record.status, EventStatus::Pending);
            assert_eq!(record.attempts, 0);
            assert!(record.error.is_none());
            assert!(record.next_retry_at.is_none());
        }
    }

    #[tokio::test]
    async fn dlq_retry_resets_row_for_redelivery() {
        let registry = Arc::new(EventTypeRegistry::with_builtins());
        let policy = RetryPolicy {
            max_attempts: 1,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
        };
        let store = MemoryEventStore::with_policy(registry, policy)
            .with_poll_timeout(Duration::from_millis(5));

        let e = event("doomed");
        store.publish(&e).await.unwrap();
        let mut sub = store.subscribe(&[], 10).await.unwrap();
        let (_, token) = sub.next().await.unwrap();
        store.nack(token, Some("fatal")).await.unwrap();
        assert_eq!(
            store.record(&e.id).await.unwrap().status,
            EventStatus::Dlq
        );

        let listed = store.dlq_list(10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, e.id);
        assert_eq!(listed[0].error.as_deref(), Some("fatal"));

        assert!(store.dlq_retry(&e.id).await.unwrap());
        let record = store.record(&e.id).await.unwrap();
        assert_eq!(record.status, EventStatus::Pending);
        assert_eq!(record.attempts, 0);
        assert!(record.error.is_none());

        // Redelivered after the reset.
        let (again, token) = sub.next().await.unwrap();
        assert_eq!(again.id, e.id);
        store.ack(token).await.unwrap();

        assert!(!store.dlq_retry(&e.id).await.unwrap());
    }

    #[tokio::test]
    async fn dlq_retry_all_moves_every_row() {
        let registry = Arc::new(EventTypeRegistry::with_builtins());
        let policy = RetryPolicy {
            max_attempts: 1,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
        };
        let store = MemoryEventStore::with_policy(registry, policy)
            .with_poll_timeout(Duration::from_millis(5));

        let mut sub = store.subscribe(&[], 10).await.unwrap();
        for i in 0..3 {
            store.publish(&event(&format!("d{i}"))).await.unwrap();
            let (_, token) = sub.next().await.unwrap();
            store.nack(token, Some("down")).await.unwrap();
        }
        assert_eq!(store.dlq_list(10).await.unwrap().len(), 3);

        assert_eq!(store.dlq_retry_all().await.unwrap(), 3);
        assert!(store.dlq_list(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn wake_channel_wakes_waiting_listener() {
        let channel = MemoryWakeChannel::default();
        let mut listener = channel.listen().await.unwrap();

        let waiter = tokio::spawn(async move { listener.wait(Duration::from_secs(2)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        channel.notify("e-1").await.unwrap();
        assert!(waiter.await.unwrap());
    }
}
