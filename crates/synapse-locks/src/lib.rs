#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **synapse-locks** – Scoped lock manager for Synapse.
//!
//! The dispatch loop serializes handler execution per *scope* (a string
//! extracted from the event, e.g. `user:123`) while unrelated scopes proceed
//! in parallel. This crate keeps that mutual exclusion behind the
//! [`LockBackend`] interface with two swappable implementations:
//!
//! | Backend | Scope of exclusion | Use |
//! |---|---|---|
//! | [`LocalLockBackend`] | Single process | Single-replica deployments, tests |
//! | [`PostgresLockBackend`] | Cluster-wide | Multi-replica deployments |
//!
//! The local backend warns loudly at construction: its locks do not reach
//! across processes, so running multiple replicas with it invites duplicate
//! concurrent handling within a scope.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres, Row};
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Poll interval for timed acquisition against the database backend.
const TRY_ACQUIRE_POLL: Duration = Duration::from_millis(100);

//─────────────────────────────
//  Lock backend trait
//─────────────────────────────

/// Mutual exclusion keyed by scope string.
///
/// Locks are acquired before handler invocation and must be released on every
/// exit path. Releasing a lock that is not held is a warning, never a fatal
/// error.
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Acquire the lock for `scope`.
    ///
    /// With `wait_timeout = None` this waits indefinitely and returns `true`.
    /// Otherwise it returns `false` once the timeout elapses without the lock
    /// becoming available.
    async fn acquire(&self, scope: &str, wait_timeout: Option<Duration>) -> Result<bool>;

    /// Release a previously acquired lock for `scope`.
    async fn release(&self, scope: &str) -> Result<()>;

    /// Advisory check whether `scope` is currently locked.
    ///
    /// The answer can be stale by the time the caller acts on it; never use
    /// it for decision logic.
    async fn is_locked(&self, scope: &str) -> Result<bool>;

    /// Release every held lock and tear down backend resources.
    async fn close(&self) -> Result<()>;
}

//─────────────────────────────
//  Local backend
//─────────────────────────────

/// In-process lock backend over a map of single-permit semaphores.
///
/// Exclusion only covers this process. Deployments with more than one replica
/// must use [`PostgresLockBackend`] instead; see [`LocalLockBackend::new`].
pub struct LocalLockBackend {
    scopes: StdMutex<HashMap<String, Arc<Semaphore>>>,
}

impl LocalLockBackend {
    /// Create a local backend, warning about its single-process limitation.
    ///
    /// The warning is a hard visibility requirement: operators must be able
    /// to see when a multi-replica deployment was misconfigured onto local
    /// locks.
    pub fn new() -> Self {
        warn!(
            "local lock backend only serializes within this process; \
             multi-replica deployments must use the distributed backend"
        );
        Self::new_quiet()
    }

    /// Create a local backend without the startup warning. Intended for
    /// tests and deliberately single-replica embeddings.
    pub fn new_quiet() -> Self {
        Self {
            scopes: StdMutex::new(HashMap::new()),
        }
    }

    fn semaphore(&self, scope: &str) -> Arc<Semaphore> {
        let mut scopes = self.scopes.lock().unwrap_or_else(PoisonError::into_inner);
        scopes
            .entry(scope.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }
}

impl Default for LocalLockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockBackend for LocalLockBackend {
    async fn acquire(&self, scope: &str, wait_timeout: Option<Duration>) -> Result<bool> {
        let semaphore = self.semaphore(scope);
        let permit = match wait_timeout {
            None => semaphore.acquire_owned().await,
            Some(timeout) => {
                match tokio::time::timeout(timeout, semaphore.acquire_owned()).await {
                    Ok(permit) => permit,
                    Err(_) => return Ok(false),
                }
            }
        };

        // The semaphore is never closed, so acquisition only fails if the
        // backend is being torn down concurrently.
        let permit = permit.context("lock backend closed")?;
        // Ownership of the permit transfers to the eventual release() call.
        permit.forget();
        debug!(scope, "scope lock acquired");
        Ok(true)
    }

    async fn release(&self, scope: &str) -> Result<()> {
        let semaphore = {
            let scopes = self.scopes.lock().unwrap_or_else(PoisonError::into_inner);
            scopes.get(scope).cloned()
        };
        match semaphore {
            Some(semaphore) if semaphore.available_permits() == 0 => {
                semaphore.add_permits(1);
                debug!(scope, "scope lock released");
            }
            _ => warn!(scope, "releasing scope lock that is not held"),
        }
        Ok(())
    }

    async fn is_locked(&self, scope: &str) -> Result<bool> {
        let scopes = self.scopes.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(scopes
            .get(scope)
            .map(|s| s.available_permits() == 0)
            .unwrap_or(false))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

//─────────────────────────────
//  PostgreSQL advisory backend
//─────────────────────────────

/// Map a scope string onto the signed 63-bit advisory-lock key space.
///
/// Hash collisions between distinct scopes are possible but tolerated: they
/// only cause occasional unnecessary serialization, never lost exclusion.
/// The hash must be identical across replicas, so this uses blake3 rather
/// than any process-seeded hasher.
pub fn scope_lock_id(scope: &str) -> i64 {
    let digest = blake3::hash(scope.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest.as_bytes()[..8]);
    i64::from_be_bytes(bytes) & 0x7FFF_FFFF_FFFF_FFFF
}

/// Cluster-wide lock backend over PostgreSQL session advisory locks.
///
/// Each held lock pins its own pooled connection until release: advisory
/// locks are session-scoped, so the unlock must run on the same session that
/// locked, and a dropped connection releases everything that session held —
/// a crashed replica can never strand a scope.
pub struct PostgresLockBackend {
    pool: PgPool,
    held: Mutex<HashMap<i64, PoolConnection<Postgres>>>,
}

impl PostgresLockBackend {
    /// Create a backend over an existing pool.
    ///
    /// Size the pool with the dispatch concurrency in mind: every held scope
    /// lock occupies one connection.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            held: Mutex::new(HashMap::new()),
        }
    }

    async fn store_held(&self, lock_id: i64, conn: PoolConnection<Postgres>) {
        let mut held = self.held.lock().await;
        if held.insert(lock_id, conn).is_some() {
            // Two scopes hashing to one id while both held in this process.
            warn!(lock_id, "advisory lock id collision within process");
        }
    }
}

#[async_trait]
impl LockBackend for PostgresLockBackend {
    async fn acquire(&self, scope: &str, wait_timeout: Option<Duration>) -> Result<bool> {
        let lock_id = scope_lock_id(scope);
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("failed to acquire connection for advisory lock")?;

        match wait_timeout {
            None => {
                sqlx::query("SELECT pg_advisory_lock($1)")
                    .bind(lock_id)
                    .execute(&mut *conn)
                    .await
                    .context("pg_advisory_lock failed")?;
                debug!(scope, lock_id, "advisory lock acquired");
                self.store_held(lock_id, conn).await;
                Ok(true)
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                loop {
                    let granted: bool = sqlx::query("SELECT pg_try_advisory_lock($1)")
                        .bind(lock_id)
                        .fetch_one(&mut *conn)
                        .await
                        .context("pg_try_advisory_lock failed")?
                        .get(0);
                    if granted {
                        debug!(scope, lock_id, "advisory lock acquired");
                        self.store_held(lock_id, conn).await;
                        return Ok(true);
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    tokio::time::sleep(TRY_ACQUIRE_POLL.min(deadline - now)).await;
                }
            }
        }
    }

    async fn release(&self, scope: &str) -> Result<()> {
        let lock_id = scope_lock_id(scope);
        let conn = self.held.lock().await.remove(&lock_id);
        let mut conn = match conn {
            Some(conn) => conn,
            None => {
                warn!(scope, "releasing scope lock that is not held");
                return Ok(());
            }
        };

        let unlocked: bool = sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(lock_id)
            .fetch_one(&mut *conn)
            .await
            .context("pg_advisory_unlock failed")?
            .get(0);
        if !unlocked {
            warn!(scope, lock_id, "advisory unlock reported lock not held");
        } else {
            debug!(scope, lock_id, "advisory lock released");
        }
        Ok(())
    }

    async fn is_locked(&self, scope: &str) -> Result<bool> {
        let lock_id = scope_lock_id(scope);
        // A 64-bit advisory key is split across classid (high) and objid (low).
        let row = sqlx::query(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM pg_locks
                WHERE locktype = 'advisory'
                  AND ((classid::bigint << 32) | objid::bigint) = $1
                  AND granted
            ) AS locked
            "#,
        )
        .bind(lock_id)
        .fetch_one(&self.pool)
        .await
        .context("pg_locks query failed")?;
        Ok(row.get("locked"))
    }

    async fn close(&self) -> Result<()> {
        let mut held = self.held.lock().await;
        for (lock_id, mut conn) in held.drain() {
            if let Err(err) = sqlx::query("SELECT pg_advisory_unlock($1)")
                .bind(lock_id)
                .execute(&mut *conn)
                .await
            {
                warn!(lock_id, error = %err, "failed to release advisory lock on close");
            }
        }
        Ok(())
    }
}

//─────────────────────────────
//  Backend selection
//─────────────────────────────

/// Which lock backend a deployment uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockBackendKind {
    /// In-process locks; single-replica only.
    Local,
    /// PostgreSQL advisory locks; safe across replicas.
    Distributed,
}

impl FromStr for LockBackendKind {
    type Err = LockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(LockBackendKind::Local),
            "distributed" => Ok(LockBackendKind::Distributed),
            other => Err(LockError::UnknownBackend {
                name: other.to_string(),
            }),
        }
    }
}

/// Build a lock backend for `kind`.
///
/// The distributed backend requires a PostgreSQL pool; asking for it without
/// one is a configuration error.
pub fn create_lock_backend(
    kind: LockBackendKind,
    pool: Option<PgPool>,
) -> Result<Arc<dyn LockBackend>> {
    match kind {
        LockBackendKind::Local => Ok(Arc::new(LocalLockBackend::new())),
        LockBackendKind::Distributed => {
            let pool = pool.ok_or(LockError::PoolRequired)?;
            Ok(Arc::new(PostgresLockBackend::new(pool)))
        }
    }
}

/// Errors raised by lock backend selection.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// The configured backend name is not recognized.
    #[error("unknown lock backend {name:?}, expected \"local\" or \"distributed\"")]
    UnknownBackend {
        /// The unrecognized backend name.
        name: String,
    },
    /// The distributed backend was requested without a database pool.
    #[error("distributed lock backend requires a postgres pool")]
    PoolRequired,
}
