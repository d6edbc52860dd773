//! Catch-up subscriptions over the store-wide event log.
//!
//! A [`SubscriptionRunner`] delivers decoded events, in commit order, to one
//! [`EventHandler`], saving a checkpoint after every event so a restart
//! resumes where it left off. Delivery is at-least-once: an event may be seen
//! again if the process stops between handling it and saving the checkpoint.
//!
//! Runners are hosted by a [`Supervisor`], which owns their tasks, cancels
//! them together and joins them on shutdown.

use crate::domain::DomainEvent;
use crate::errors::{EventStoreError, RegistryError};
use crate::event_store::{EventFilter, EventStore, SerializedEvent, StoredEvent};
use crate::registry::EventRegistry;
use crate::shutdown::{CancellationHandle, CancellationSignal};
use crate::types::GlobalPosition;
use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Information about a failed delivery, passed to [`EventHandler::on_error`].
#[derive(Debug)]
pub struct FailureContext<'a, E> {
    /// The error returned by the handler.
    pub error: &'a E,
    /// Position of the event that failed.
    pub position: GlobalPosition,
    /// Retries already attempted for this event (0 on first failure).
    pub retry_count: u32,
}

/// What the runner does after a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStrategy {
    /// Stop the subscription and report the error.
    Fatal,
    /// Log the failure, checkpoint past the event and continue.
    Skip,
    /// Deliver the same event again after a backoff, up to the configured
    /// retry limit; after that the failure is fatal.
    Retry,
}

/// Consumer of a subscription.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Error returned by [`EventHandler::handle`].
    type Error: std::error::Error + Send + Sync + 'static;

    /// Stable name; also the checkpoint key.
    fn name(&self) -> &str;

    /// Streams this handler wants to see.
    fn filter(&self) -> EventFilter;

    /// Processes one event.
    async fn handle(&self, event: &StoredEvent<DomainEvent>) -> Result<(), Self::Error>;

    /// Chooses how to proceed after `handle` failed. Defaults to
    /// [`FailureStrategy::Fatal`].
    fn on_error(&self, _ctx: FailureContext<'_, Self::Error>) -> FailureStrategy {
        FailureStrategy::Fatal
    }
}

/// Checkpoint persistence failure.
#[derive(Debug, Clone, Error)]
pub enum CheckpointError {
    /// The backing store could not be reached.
    #[error("Checkpoint store unavailable: {0}")]
    Unavailable(String),
}

/// Remembers how far each subscription has progressed.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Last position handled by `subscription`, if any.
    async fn load(&self, subscription: &str) -> Result<Option<GlobalPosition>, CheckpointError>;

    /// Records `position` as handled by `subscription`.
    async fn save(&self, subscription: &str, position: GlobalPosition)
        -> Result<(), CheckpointError>;
}

/// Process-local checkpoint store.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    positions: RwLock<HashMap<String, GlobalPosition>>,
}

impl InMemoryCheckpointStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(&self, subscription: &str) -> Result<Option<GlobalPosition>, CheckpointError> {
        Ok(self.positions.read().get(subscription).copied())
    }

    async fn save(
        &self,
        subscription: &str,
        position: GlobalPosition,
    ) -> Result<(), CheckpointError> {
        self.positions
            .write()
            .insert(subscription.to_string(), position);
        Ok(())
    }
}

/// Errors that end a subscription.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    /// The handler failed and its failure strategy gave up.
    #[error("Subscription '{subscription}' failed at position {position}: {source}")]
    Handler {
        /// Name of the failed subscription
        subscription: String,
        /// Position of the event that could not be handled
        position: GlobalPosition,
        /// The handler's error
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Reading the log failed.
    #[error(transparent)]
    EventStore(#[from] EventStoreError),

    /// A stored event could not be decoded.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Loading or saving the checkpoint failed.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

/// Tuning knobs of a [`SubscriptionRunner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionConfig {
    /// Maximum events read from the log at once.
    pub batch_size: usize,
    /// Retries allowed per event when the handler asks for them.
    pub max_retries: u32,
    /// Delay before the first retry; doubled on each further attempt.
    pub retry_delay: Duration,
    /// Upper bound for the retry delay.
    pub max_retry_delay: Duration,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            batch_size: 256,
            max_retries: 5,
            retry_delay: Duration::from_millis(100),
            max_retry_delay: Duration::from_secs(10),
        }
    }
}

impl SubscriptionConfig {
    /// Sets the batch size (at least 1).
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Sets the per-event retry limit.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the initial retry delay.
    #[must_use]
    pub const fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Backoff before retry number `attempt` (0-based): exponential, capped,
    /// with up to ±12.5% jitter.
    pub fn retry_delay_for(&self, attempt: u32) -> Duration {
        let max_ms = u64::try_from(self.max_retry_delay.as_millis()).unwrap_or(u64::MAX);
        let base_ms = u64::try_from(self.retry_delay.as_millis()).unwrap_or(u64::MAX);
        let delay = base_ms
            .saturating_mul(1_u64 << attempt.min(20))
            .min(max_ms);
        let spread = delay / 4;
        let jitter = if spread == 0 {
            0
        } else {
            rand::rng().random_range(0..=spread)
        };
        Duration::from_millis((delay - delay / 8 + jitter).min(max_ms))
    }
}

enum Delivery {
    Handled,
    Skipped,
    Cancelled,
}

/// Feeds one handler from the event log.
pub struct SubscriptionRunner<H, S, C> {
    handler: H,
    store: Arc<S>,
    registry: Arc<EventRegistry>,
    checkpoints: Arc<C>,
    config: SubscriptionConfig,
}

impl<H, S, C> SubscriptionRunner<H, S, C>
where
    H: EventHandler,
    S: EventStore<Event = SerializedEvent>,
    C: CheckpointStore,
{
    /// Creates a runner with the default configuration.
    pub fn new(
        handler: H,
        store: Arc<S>,
        registry: Arc<EventRegistry>,
        checkpoints: Arc<C>,
    ) -> Self {
        Self {
            handler,
            store,
            registry,
            checkpoints,
            config: SubscriptionConfig::default(),
        }
    }

    /// Replaces the configuration.
    #[must_use]
    pub fn with_config(mut self, config: SubscriptionConfig) -> Self {
        self.config = config;
        self
    }

    /// Name of the hosted handler.
    pub fn name(&self) -> &str {
        self.handler.name()
    }

    /// Runs until `cancel` fires (returns `Ok`) or a delivery fails fatally.
    ///
    /// Catches up from the last checkpoint, then waits for new appends.
    #[instrument(skip_all, fields(subscription = %self.handler.name()))]
    pub async fn run(self, cancel: CancellationSignal) -> Result<(), SubscriptionError> {
        let name = self.handler.name().to_string();
        let filter = self.handler.filter();
        let mut position = self.checkpoints.load(&name).await?;
        info!(?position, "subscription started");

        loop {
            if cancel.is_cancelled() {
                break;
            }

            // head is read before the batch so nothing appended in between is missed
            let head = self.store.head_position().await?;
            let batch = self
                .store
                .read_all(&filter, position, self.config.batch_size)
                .await?;

            if batch.is_empty() {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    appended = self.store.wait_for_append(head) => appended?,
                }
                continue;
            }

            for stored in batch {
                let at = stored.position;
                let event = stored.try_map(|payload| self.registry.decode(&payload))?;
                match self.deliver(&name, &event, &cancel).await? {
                    Delivery::Cancelled => {
                        info!(position = %at, "subscription stopped during retry");
                        return Ok(());
                    }
                    Delivery::Handled | Delivery::Skipped => {
                        self.checkpoints.save(&name, at).await?;
                        position = Some(at);
                    }
                }
            }
        }

        info!(?position, "subscription stopped");
        Ok(())
    }

    async fn deliver(
        &self,
        name: &str,
        event: &StoredEvent<DomainEvent>,
        cancel: &CancellationSignal,
    ) -> Result<Delivery, SubscriptionError> {
        let event_type = event.payload.event_type();
        let mut retry_count = 0;
        loop {
            let Err(error) = self.handler.handle(event).await else {
                debug!(position = %event.position, event_type, "event handled");
                return Ok(Delivery::Handled);
            };

            let strategy = self.handler.on_error(FailureContext {
                error: &error,
                position: event.position,
                retry_count,
            });

            match strategy {
                FailureStrategy::Skip => {
                    warn!(position = %event.position, event_type, %error, "skipping event");
                    return Ok(Delivery::Skipped);
                }
                FailureStrategy::Retry if retry_count < self.config.max_retries => {
                    let delay = self.config.retry_delay_for(retry_count);
                    retry_count += 1;
                    warn!(
                        position = %event.position,
                        event_type,
                        %error,
                        retry_count,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "retrying event"
                    );
                    tokio::select! {
                        () = cancel.cancelled() => return Ok(Delivery::Cancelled),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                FailureStrategy::Retry | FailureStrategy::Fatal => {
                    error!(position = %event.position, event_type, %error, retry_count, "event handling failed");
                    return Err(SubscriptionError::Handler {
                        subscription: name.to_string(),
                        position: event.position,
                        source: Box::new(error),
                    });
                }
            }
        }
    }
}

/// How a supervised task ended.
#[derive(Debug)]
pub enum TaskExit {
    /// Stopped after cancellation.
    Stopped,
    /// Ended with an error before or during shutdown.
    Failed(SubscriptionError),
    /// The task panicked.
    Panicked,
    /// The task did not stop in time and was aborted.
    Aborted,
}

struct SupervisedTask {
    name: String,
    handle: JoinHandle<Result<(), SubscriptionError>>,
}

/// Owns the tasks hosting subscriptions.
pub struct Supervisor {
    cancellation: CancellationHandle,
    tasks: Vec<SupervisedTask>,
}

impl Supervisor {
    /// Creates a supervisor with no tasks.
    pub fn new() -> Self {
        Self {
            cancellation: CancellationHandle::new(),
            tasks: Vec::new(),
        }
    }

    /// A signal that fires when shutdown begins.
    pub fn signal(&self) -> CancellationSignal {
        self.cancellation.signal()
    }

    /// Spawns `runner` on the current tokio runtime.
    pub fn spawn<H, S, C>(&mut self, runner: SubscriptionRunner<H, S, C>)
    where
        H: EventHandler + 'static,
        S: EventStore<Event = SerializedEvent> + 'static,
        C: CheckpointStore + 'static,
    {
        let name = runner.name().to_string();
        let signal = self.signal();
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            let result = runner.run(signal).await;
            if let Err(error) = &result {
                error!(subscription = %task_name, %error, "subscription terminated");
            }
            result
        });
        info!(subscription = %name, "subscription spawned");
        self.tasks.push(SupervisedTask { name, handle });
    }

    /// Names of the supervised subscriptions.
    pub fn names(&self) -> Vec<&str> {
        self.tasks.iter().map(|t| t.name.as_str()).collect()
    }

    /// Names of subscriptions whose task has already ended.
    pub fn finished(&self) -> Vec<&str> {
        self.tasks
            .iter()
            .filter(|t| t.handle.is_finished())
            .map(|t| t.name.as_str())
            .collect()
    }

    /// Cancels every subscription and waits up to `timeout` in total for
    /// them to stop; stragglers are aborted.
    pub async fn shutdown(self, timeout: Duration) -> Vec<(String, TaskExit)> {
        self.cancellation.cancel();
        let deadline = tokio::time::Instant::now() + timeout;
        let mut exits = Vec::with_capacity(self.tasks.len());

        for SupervisedTask { name, mut handle } in self.tasks {
            let exit = match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(Ok(()))) => TaskExit::Stopped,
                Ok(Ok(Err(error))) => TaskExit::Failed(error),
                Ok(Err(join_error)) if join_error.is_panic() => TaskExit::Panicked,
                Ok(Err(_)) => TaskExit::Aborted,
                Err(_) => {
                    handle.abort();
                    TaskExit::Aborted
                }
            };
            info!(subscription = %name, ?exit, "subscription joined");
            exits.push((name, exit));
        }

        exits
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}
