#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **synapse-store-postgres** – PostgreSQL event-store driver for Synapse.
//!
//! This crate persists events to a PostgreSQL `events` table and implements
//! the claim protocol on top of `FOR UPDATE SKIP LOCKED`, so any number of
//! workers (in one process or across replicas) can subscribe concurrently
//! without ever claiming the same row twice. Subscribers are woken through
//! `LISTEN`/`NOTIFY` on the shared `events` channel; a lost notification only
//! delays pickup until the next bounded poll.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgListener, PgPoolOptions};
use sqlx::{PgPool, Row};
use tracing::{debug, warn};

use synapse_store_core::{
    AckToken, DlqEntry, EventStore, EventSubscription, RetryPolicy, StoreError, WakeChannel,
    WakeListener, WAKE_CHANNEL,
};
use synapse_types::registry::EventTypeRegistry;
use synapse_types::Event;

/// Default bounded wait between claim attempts when no notification arrives.
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// PostgreSQL error code for unique-constraint violations.
const UNIQUE_VIOLATION: &str = "23505";

//─────────────────────────────
//  Wake channel
//─────────────────────────────

/// Cluster-wide wake channel over PostgreSQL `LISTEN`/`NOTIFY`.
///
/// `notify` runs `pg_notify` on a pooled connection; `listen` opens a
/// dedicated long-lived listener connection on the shared channel.
#[derive(Clone)]
pub struct PgWakeChannel {
    pool: PgPool,
}

impl PgWakeChannel {
    /// Create a wake channel over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WakeChannel for PgWakeChannel {
    async fn notify(&self, event_id: &str) -> Result<()> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(WAKE_CHANNEL)
            .bind(event_id)
            .execute(&self.pool)
            .await
            .context("failed to notify event channel")?;
        Ok(())
    }

    async fn listen(&self) -> Result<Box<dyn WakeListener>> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .context("failed to open listener connection")?;
        listener
            .listen(WAKE_CHANNEL)
            .await
            .context("failed to LISTEN on event channel")?;
        Ok(Box::new(PgWakeListener { listener }))
    }
}

struct PgWakeListener {
    listener: PgListener,
}

#[async_trait]
impl WakeListener for PgWakeListener {
    async fn wait(&mut self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.listener.recv()).await {
            Ok(Ok(notification)) => {
                debug!(event_id = notification.payload(), "notification received");
                true
            }
            Ok(Err(err)) => {
                // The listener reconnects internally; report and let the
                // caller fall back to its poll cadence.
                warn!(error = %err, "event listener error");
                false
            }
            Err(_) => false,
        }
    }
}

//─────────────────────────────
//  PostgreSQL store
//─────────────────────────────

/// A durable event store backed by PostgreSQL.
///
/// The `events` table is the single point of mutation for event state; every
/// lifecycle transition goes through the statements below. See [`migrate`]
/// for the authoritative schema.
///
/// [`migrate`]: PostgresEventStore::migrate
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
    registry: Arc<EventTypeRegistry>,
    policy: RetryPolicy,
    poll_timeout: Duration,
}

impl PostgresEventStore {
    /// Connect to `database_url` and build a store with the default policy.
    pub async fn connect(database_url: &str, registry: Arc<EventTypeRegistry>) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .context("failed to connect to postgres")?;
        Ok(Self::from_pool(pool, registry))
    }

    /// Build a store over an existing pool.
    ///
    /// Useful when the pool is shared with other components (e.g. the
    /// advisory-lock backend).
    pub fn from_pool(pool: PgPool, registry: Arc<EventTypeRegistry>) -> Self {
        Self {
            pool,
            registry,
            policy: RetryPolicy::default(),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }

    /// Override the retry policy.
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Override the bounded wait used between claim attempts.
    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// A wake channel bound to this store's pool.
    pub fn wake_channel(&self) -> PgWakeChannel {
        PgWakeChannel::new(self.pool.clone())
    }

    /// Create or upgrade the events schema.
    ///
    /// The composite `(status, timestamp)` index is what keeps the claim
    /// query cheap under load.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                id            TEXT PRIMARY KEY,
                type          TEXT NOT NULL,
                source        TEXT NOT NULL,
                timestamp     TIMESTAMPTZ NOT NULL,
                payload       TEXT NOT NULL,
                status        TEXT NOT NULL DEFAULT 'pending',
                attempts      INTEGER NOT NULL DEFAULT 0,
                error         TEXT,
                created_at    TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                processed_at  TIMESTAMPTZ,
                next_retry_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for statement in [
            "CREATE INDEX IF NOT EXISTS ix_events_status_timestamp ON events(status, timestamp)",
            "CREATE INDEX IF NOT EXISTS ix_events_type ON events(type)",
            "CREATE INDEX IF NOT EXISTS ix_events_source ON events(source)",
            "CREATE INDEX IF NOT EXISTS ix_events_timestamp ON events(timestamp)",
            "CREATE INDEX IF NOT EXISTS ix_events_next_retry_at ON events(next_retry_at)",
        ] {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }

    /// Close the connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Claim up to `batch_size` eligible rows in one statement.
    ///
    /// The inner `SELECT … FOR UPDATE SKIP LOCKED` is the concurrency
    /// keystone: rows locked by another worker's in-flight claim are skipped
    /// instead of awaited, so concurrent subscribers partition the backlog.
    async fn claim_batch(
        pool: &PgPool,
        registry: &EventTypeRegistry,
        kinds: &[String],
        batch_size: usize,
    ) -> Result<Vec<(Event, AckToken)>> {
        let rows = sqlx::query(
            r#"
            UPDATE events
            SET status = 'processing', attempts = attempts + 1
            WHERE id IN (
                SELECT id FROM events
                WHERE status = 'pending'
                  AND (next_retry_at IS NULL OR next_retry_at <= NOW())
                  AND (cardinality($1::text[]) = 0 OR type = ANY($1))
                ORDER BY timestamp
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, payload
            "#,
        )
        .bind(kinds)
        .bind(batch_size as i64)
        .fetch_all(pool)
        .await
        .context("claim query failed")?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get("id");
            let payload: String = row.get("payload");
            match registry.parse(&payload) {
                Ok(event) => claimed.push((event, AckToken::new(id))),
                Err(err) => {
                    // Unparseable rows cannot be handled; dead-letter without retry.
                    warn!(event_id = %id, error = %err, "stored event failed validation, moving to DLQ");
                    sqlx::query(
                        "UPDATE events SET status = 'dlq', error = $2, next_retry_at = NULL WHERE id = $1",
                    )
                    .bind(&id)
                    .bind(err.to_string())
                    .execute(pool)
                    .await?;
                }
            }
        }
        Ok(claimed)
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    async fn publish(&self, event: &Event) -> Result<()> {
        let payload = event.to_json()?;
        let result = sqlx::query(
            r#"
            INSERT INTO events (id, type, source, timestamp, payload, status, attempts)
            VALUES ($1, $2, $3, $4, $5, 'pending', 0)
            "#,
        )
        .bind(&event.id)
        .bind(&event.kind)
        .bind(&event.source)
        .bind(event.timestamp)
        .bind(&payload)
        .execute(&self.pool)
        .await;

        if let Err(err) = result {
            if let sqlx::Error::Database(db) = &err {
                if db.code().as_deref() == Some(UNIQUE_VIOLATION) {
                    return Err(StoreError::Duplicate {
                        id: event.id.clone(),
                    }
                    .into());
                }
            }
            return Err(anyhow::Error::new(err).context("failed to insert event"));
        }

        // Best-effort wake after the insert commits; subscribers still claim
        // through the table, so a lost notification is harmless.
        if let Err(err) = self.wake_channel().notify(&event.id).await {
            warn!(event_id = %event.id, error = %err, "publish notification failed");
        }
        debug!(event_id = %event.id, kind = %event.kind, "event published");
        Ok(())
    }

    async fn subscribe(
        &self,
        kinds: &[String],
        batch_size: usize,
    ) -> Result<Box<dyn EventSubscription>> {
        let listener = self.wake_channel().listen().await?;
        Ok(Box::new(PostgresSubscription {
            pool: self.pool.clone(),
            registry: self.registry.clone(),
            kinds: kinds.to_vec(),
            batch_size,
            listener,
            buffer: VecDeque::new(),
            poll_timeout: self.poll_timeout,
        }))
    }

    async fn ack(&self, token: AckToken) -> Result<()> {
        sqlx::query(
            "UPDATE events SET status = 'completed', processed_at = NOW() WHERE id = $1",
        )
        .bind(token.event_id())
        .execute(&self.pool)
        .await
        .context("ack update failed")?;
        Ok(())
    }

    async fn nack(&self, token: AckToken, error: Option<&str>) -> Result<()> {
        // `attempts` was already incremented at claim time, so the backoff
        // exponent is `attempts - 1`.
        sqlx::query(
            r#"
            UPDATE events SET
                status = CASE
                    WHEN attempts >= $2 THEN 'dlq'
                    ELSE 'pending'
                END,
                error = $3,
                next_retry_at = CASE
                    WHEN attempts >= $2 THEN NULL
                    ELSE NOW() + make_interval(secs =>
                        LEAST($4 * POWER(2, attempts - 1), $5))
                END
            WHERE id = $1
            "#,
        )
        .bind(token.event_id())
        .bind(self.policy.max_attempts as i32)
        .bind(error)
        .bind(self.policy.base_delay.as_secs_f64())
        .bind(self.policy.max_delay.as_secs_f64())
        .execute(&self.pool)
        .await
        .context("nack update failed")?;

        warn!(event_id = token.event_id(), error = ?error, "event nacked");
        Ok(())
    }

    async fn replay(
        &self,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
        kinds: &[String],
    ) -> Result<Vec<Event>> {
        let rows = sqlx::query(
            r#"
            SELECT id, payload FROM events
            WHERE timestamp >= $1
              AND ($2::timestamptz IS NULL OR timestamp <= $2)
              AND (cardinality($3::text[]) = 0 OR type = ANY($3))
            ORDER BY timestamp
            "#,
        )
        .bind(start)
        .bind(end)
        .bind(kinds)
        .fetch_all(&self.pool)
        .await
        .context("replay query failed")?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let payload: String = row.get("payload");
            match self.registry.parse(&payload) {
                Ok(event) => events.push(event),
                Err(err) => {
                    let id: String = row.get("id");
                    warn!(event_id = %id, error = %err, "skipping unparseable event in replay");
                }
            }
        }
        debug!(event_count = events.len(), "replay completed");
        Ok(events)
    }

    async fn dlq_list(&self, limit: usize) -> Result<Vec<DlqEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, type, source, payload, error, attempts, created_at
            FROM events
            WHERE status = 'dlq'
            ORDER BY created_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("dlq listing failed")?;

        Ok(rows
            .into_iter()
            .map(|row| DlqEntry {
                id: row.get("id"),
                kind: row.get("type"),
                source: row.get("source"),
                payload: row.get("payload"),
                error: row.get("error"),
                attempts: row.get("attempts"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    async fn dlq_retry(&self, event_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE events
            SET status = 'pending', attempts = 0, error = NULL, next_retry_at = NULL
            WHERE id = $1 AND status = 'dlq'
            "#,
        )
        .bind(event_id)
        .execute(&self.pool)
        .await
        .context("dlq retry failed")?;

        let moved = result.rows_affected() > 0;
        if moved {
            if let Err(err) = self.wake_channel().notify(event_id).await {
                warn!(event_id, error = %err, "dlq retry notification failed");
            }
        }
        Ok(moved)
    }

    async fn dlq_retry_all(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE events
            SET status = 'pending', attempts = 0, error = NULL, next_retry_at = NULL
            WHERE status = 'dlq'
            "#,
        )
        .execute(&self.pool)
        .await
        .context("bulk dlq retry failed")?;

        let moved = result.rows_affected();
        if moved > 0 {
            if let Err(err) = self.wake_channel().notify("").await {
                warn!(error = %err, "bulk dlq retry notification failed");
            }
        }
        Ok(moved)
    }
}

struct PostgresSubscription {
    pool: PgPool,
    registry: Arc<EventTypeRegistry>,
    kinds: Vec<String>,
    batch_size: usize,
    listener: Box<dyn WakeListener>,
    buffer: VecDeque<(Event, AckToken)>,
    poll_timeout: Duration,
}

#[async_trait]
impl EventSubscription for PostgresSubscription {
    async fn next(&mut self) -> Result<(Event, AckToken)> {
        loop {
            if let Some(pair) = self.buffer.pop_front() {
                return Ok(pair);
            }

            let batch = PostgresEventStore::claim_batch(
                &self.pool,
                &self.registry,
                &self.kinds,
                self.batch_size,
            )
            .await?;
            if !batch.is_empty() {
                self.buffer.extend(batch);
                continue;
            }

            // Nothing claimable; park on LISTEN until a publish wakes us or
            // the poll timeout forces another look. The bounded wait is the
            // forward-progress guarantee against lost notifications.
            self.listener.wait(self.poll_timeout).await;
        }
    }
}

//─────────────────────────────
//  Integration tests
//─────────────────────────────

// These exercise a live database; run them with a scratch PostgreSQL and
//   SYNAPSE_TEST_DATABASE_URL=postgres://… cargo test -- --ignored
#[cfg(test)]
mod tests {
    use super::*;
    use synapse_store_core::EventStatus;
    use synapse_types::variants::WsMessage;

    async fn test_store() -> Option<PostgresEventStore> {
        let url = std::env::var("SYNAPSE_TEST_DATABASE_URL").ok()?;
        let registry = Arc::new(EventTypeRegistry::with_builtins());
        let store = PostgresEventStore::connect(&url, registry)
            .await
            .expect("connect to test database")
            .with_poll_timeout(Duration::from_millis(100));
        store.migrate().await.expect("migrate test database");
        sqlx::query("TRUNCATE events")
            .execute(store.pool())
            .await
            .expect("truncate events");
        Some(store)
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

    async fn status_of(store: &PostgresEventStore, id: &str) -> (EventStatus, i32) {
        let row = sqlx::query("SELECT status, attempts FROM events WHERE id = $1")
            .bind(id)
            .fetch_one(store.pool())
            .await
            .unwrap();
        let status: String = row.get("status");
        (status.parse().unwrap(), row.get("attempts"))
    }

    #[tokio::test]
    #[ignore = "requires a running postgres (SYNAPSE_TEST_DATABASE_URL)"]
    async fn publish_claim_ack_roundtrip() {
        let Some(store) = test_store().await else { return };

        let e = event("pg-one");
        store.publish(&e).await.unwrap();

        let mut sub = store.subscribe(&[], 10).await.unwrap();
        let (claimed, token) = sub.next().await.unwrap();
        assert_eq!(claimed.id, e.id);
        assert_eq!(status_of(&store, &e.id).await, (EventStatus::Processing, 1));

        store.ack(token).await.unwrap();
        assert_eq!(status_of(&store, &e.id).await, (EventStatus::Completed, 1));
    }

    #[tokio::test]
    #[ignore = "requires a running postgres (SYNAPSE_TEST_DATABASE_URL)"]
    async fn duplicate_insert_maps_to_duplicate_error() {
        let Some(store) = test_store().await else { return };

        let e = event("pg-dup");
        store.publish(&e).await.unwrap();
        let err = store.publish(&e).await.unwrap_err();
        assert!(synapse_store_core::is_duplicate(&err));
    }

    #[tokio::test]
    #[ignore = "requires a running postgres (SYNAPSE_TEST_DATABASE_URL)"]
    async fn nack_backoff_then_dlq_then_operator_retry() {
        let Some(store) = test_store().await else { return };
        let store = store.with_policy(RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        });

        let e = event("pg-flaky");
        store.publish(&e).await.unwrap();

        let mut sub = store.subscribe(&[], 10).await.unwrap();
        let (_, token) = sub.next().await.unwrap();
        store.nack(token, Some("boom")).await.unwrap();
        assert_eq!(status_of(&store, &e.id).await, (EventStatus::Pending, 1));

        // Make the row immediately eligible and exhaust the final attempt.
        sqlx::query("UPDATE events SET next_retry_at = NOW() WHERE id = $1")
            .bind(&e.id)
            .execute(store.pool())
            .await
            .unwrap();
        let (_, token) = sub.next().await.unwrap();
        store.nack(token, Some("boom again")).await.unwrap();
        assert_eq!(status_of(&store, &e.id).await, (EventStatus::Dlq, 2));

        let listed = store.dlq_list(10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].error.as_deref(), Some("boom again"));

        assert!(store.dlq_retry(&e.id).await.unwrap());
        assert_eq!(status_of(&store, &e.id).await, (EventStatus::Pending, 0));
    }

    #[tokio::test]
    #[ignore = "requires a running postgres (SYNAPSE_TEST_DATABASE_URL)"]
    async fn concurrent_subscribers_partition_the_backlog() {
        let Some(store) = test_store().await else { return };

        for i in 0..40 {
            store.publish(&event(&format!("pg-{i}"))).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut sub = store.subscribe(&[], 5).await.unwrap();
                let mut seen = Vec::new();
                loop {
                    match tokio::time::timeout(Duration::from_millis(500), sub.next()).await {
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
        all.dedup();
        assert_eq!(all.len(), 40, "every event claimed exactly once");
    }
}
