//! The supervised claim/match/execute loop.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use synapse_locks::LockBackend;
use synapse_store_core::{AckToken, EventStore, EventSubscription};
use synapse_triggers::{HandlerContext, TriggerRegistry};
use synapse_types::Event;

/// Tuning knobs for the dispatch loop.
#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    /// Maximum handler invocations in flight at once.
    pub max_concurrent: usize,
    /// Rows claimed per subscribe iteration.
    pub claim_batch_size: usize,
    /// Event kinds this loop claims; empty claims everything.
    pub event_kinds: Vec<String>,
    /// Optional bound on waiting for a scope lock. `None` waits
    /// indefinitely; a timeout turns lock starvation into a nack-and-retry.
    pub scope_lock_timeout: Option<Duration>,
    /// How long shutdown waits for in-flight handlers before aborting them.
    pub drain_timeout: Duration,
    /// First supervisor restart delay after a loop crash.
    pub restart_base_delay: Duration,
    /// Cap on the supervisor restart delay.
    pub restart_max_delay: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            claim_batch_size: 100,
            event_kinds: Vec::new(),
            scope_lock_timeout: None,
            drain_timeout: Duration::from_secs(30),
            restart_base_delay: Duration::from_secs(1),
            restart_max_delay: Duration::from_secs(60),
        }
    }
}

/// The event dispatch loop.
///
/// Wire a store, a trigger registry, and a lock backend together, then call
/// [`start`](Dispatcher::start) to launch the supervised loop. Handlers that
/// publish derived events feed the same store and wake the same loop.
pub struct Dispatcher {
    store: Arc<dyn EventStore>,
    registry: Arc<TriggerRegistry>,
    locks: Arc<dyn LockBackend>,
    config: DispatcherConfig,
}

impl Dispatcher {
    /// Build a dispatcher with the default configuration.
    pub fn new(
        store: Arc<dyn EventStore>,
        registry: Arc<TriggerRegistry>,
        locks: Arc<dyn LockBackend>,
    ) -> Self {
        Self::with_config(store, registry, locks, DispatcherConfig::default())
    }

    /// Build a dispatcher with an explicit configuration.
    pub fn with_config(
        store: Arc<dyn EventStore>,
        registry: Arc<TriggerRegistry>,
        locks: Arc<dyn LockBackend>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            registry,
            locks,
            config,
        }
    }

    /// Launch the supervised dispatch loop.
    ///
    /// The returned handle shuts the loop down and awaits its exit; dropping
    /// the handle also requests shutdown.
    pub fn start(self: Arc<Self>) -> DispatcherHandle {
        let token = CancellationToken::new();
        let task = tokio::spawn(self.supervise(token.clone()));
        DispatcherHandle {
            token,
            task: Some(task),
        }
    }

    /// Restart-with-backoff wrapper around the inner loop.
    async fn supervise(self: Arc<Self>, token: CancellationToken) {
        let mut backoff = self.config.restart_base_delay;
        loop {
            if token.is_cancelled() {
                break;
            }
            match self.clone().run(token.clone()).await {
                Ok(()) => break,
                Err(err) => {
                    error!(error = %err, restart_in = ?backoff, "dispatch loop failed, restarting");
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(self.config.restart_max_delay);
                }
            }
        }
        info!("dispatch loop stopped");
    }

    /// One life of the inner loop. Store failures propagate out to the
    /// supervisor; handler failures are settled per event and never escape.
    async fn run(self: Arc<Self>, token: CancellationToken) -> Result<()> {
        let mut subscription = self
            .store
            .subscribe(&self.config.event_kinds, self.config.claim_batch_size)
            .await?;
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent));
        let mut tasks: JoinSet<()> = JoinSet::new();

        info!(
            max_concurrent = self.config.max_concurrent,
            trigger_count = self.registry.len(),
            event_kinds = ?self.config.event_kinds,
            "dispatch loop started"
        );

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(err) = joined {
                        if err.is_panic() {
                            // process_event contains handler panics, so this
                            // is a bug in the loop itself.
                            error!("event task panicked");
                        }
                    }
                }
                claimed = subscription.next() => {
                    let (event, ack) = claimed?;
                    let permit = tokio::select! {
                        _ = token.cancelled() => break,
                        permit = semaphore.clone().acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => break,
                        },
                    };
                    let this = self.clone();
                    tasks.spawn(async move {
                        this.process_event(event, ack).await;
                        drop(permit);
                    });
                }
            }
        }

        self.drain(tasks).await;
        Ok(())
    }

    /// Wait for in-flight handlers up to the drain deadline, then abort the
    /// rest. Aborted events stay `processing`; they surface again only
    /// through operator action (no reaper at this layer).
    async fn drain(&self, mut tasks: JoinSet<()>) {
        if tasks.is_empty() {
            return;
        }
        info!(in_flight = tasks.len(), "draining in-flight handlers");
        let deadline = tokio::time::sleep(self.config.drain_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    warn!(remaining = tasks.len(), "drain deadline reached, aborting remaining handlers");
                    tasks.shutdown().await;
                    break;
                }
                joined = tasks.join_next() => {
                    if joined.is_none() {
                        break;
                    }
                }
            }
        }
    }

    /// Run every matching trigger for one claimed event and settle it with a
    /// single ack or nack.
    async fn process_event(&self, event: Event, token: AckToken) {
        let triggers = self.registry.matching(&event);
        if triggers.is_empty() {
            debug!(event_id = %event.id, kind = %event.kind, "no triggers matched");
            if let Err(err) = self.store.ack(token).await {
                error!(event_id = %event.id, error = %err, "ack failed");
            }
            return;
        }

        debug!(
            event_id = %event.id,
            kind = %event.kind,
            trigger_count = triggers.len(),
            "processing event"
        );

        // All matching triggers run even after one fails; failures are
        // aggregated into the single nack below.
        let mut failures: Vec<String> = Vec::new();
        for trigger in triggers {
            let scope = trigger.scope_for(&event);
            match self
                .locks
                .acquire(&scope, self.config.scope_lock_timeout)
                .await
            {
                Ok(true) => {
                    let ctx =
                        HandlerContext::new(event.clone(), scope.clone(), self.store.clone());
                    let outcome =
                        AssertUnwindSafe(trigger.handler().handle(&ctx)).catch_unwind().await;
                    match outcome {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            error!(
                                trigger = trigger.name(),
                                event_id = %event.id,
                                error = %err,
                                "handler failed"
                            );
                            failures.push(format!("{}: {}", trigger.name(), err));
                        }
                        Err(_) => {
                            error!(trigger = trigger.name(), event_id = %event.id, "handler panicked");
                            failures.push(format!("{}: handler panicked", trigger.name()));
                        }
                    }
                    if let Err(err) = self.locks.release(&scope).await {
                        warn!(scope = %scope, error = %err, "scope lock release failed");
                    }
                }
                Ok(false) => {
                    warn!(
                        trigger = trigger.name(),
                        scope = %scope,
                        "timed out waiting for scope lock"
                    );
                    failures.push(format!(
                        "{}: timed out waiting for scope lock {scope:?}",
                        trigger.name()
                    ));
                }
                Err(err) => {
                    failures.push(format!("{}: scope lock failed: {}", trigger.name(), err));
                }
            }
        }

        let settled = if failures.is_empty() {
            self.store.ack(token).await
        } else {
            self.store.nack(token, Some(&failures.join("; "))).await
        };
        if let Err(err) = settled {
            error!(event_id = %event.id, error = %err, "failed to settle event");
        }
    }
}

/// Handle for a running dispatcher.
pub struct DispatcherHandle {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl DispatcherHandle {
    /// Request shutdown: stop claiming, drain in-flight handlers, exit.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Wait for the loop to finish. Call [`shutdown`](Self::shutdown) first
    /// (or rely on Drop) to make it finish.
    pub async fn join(mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for DispatcherHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Process one event through the registry synchronously, without touching a
/// claim. Returns the per-trigger failure messages.
///
/// Useful in tests and debugging sessions where the full loop is in the way.
pub async fn run_once(
    store: Arc<dyn EventStore>,
    registry: &TriggerRegistry,
    locks: Arc<dyn LockBackend>,
    event: &Event,
) -> Vec<String> {
    let mut failures = Vec::new();
    for trigger in registry.matching(event) {
        let scope = trigger.scope_for(event);
        match locks.acquire(&scope, None).await {
            Ok(_) => {
                let ctx = HandlerContext::new(event.clone(), scope.clone(), store.clone());
                if let Err(err) = trigger.handler().handle(&ctx).await {
                    failures.push(format!("{}: {}", trigger.name(), err));
                }
                if let Err(err) = locks.release(&scope).await {
                    warn!(scope = %scope, error = %err, "scope lock release failed");
                }
            }
            Err(err) => failures.push(format!("{}: scope lock failed: {}", trigger.name(), err)),
        }
    }
    failures
}
