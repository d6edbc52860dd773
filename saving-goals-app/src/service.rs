//! Wiring of the saving goals service.
//!
//! One store and one registry feed the command bus and three supervised
//! subscriptions: the `AccountsWithSavingGoals` projection and the two
//! process managers.

use crate::config::AppConfig;
use futures::StreamExt;
use saving_goals::aggregate::{Committed, Repository};
use saving_goals::commands::{Command, CommandBus, CommandDispatcher};
use saving_goals::domain::account::AccountId;
use saving_goals::domain::interval::{CalendarMonth, MonthStarted};
use saving_goals::domain::spending::{Spending, SpendingId};
use saving_goals::errors::{CommandResult, EventStoreError, RegistryError};
use saving_goals::event_store::{
    EventStore, EventToWrite, ExpectedVersion, SerializedEvent, StreamEvents,
};
use saving_goals::policy::{
    RecordTransactionProcessManager, StartOfMonthProcessManager, CALENDAR_STREAM,
};
use saving_goals::projection::{
    AccountWithSavingGoal, AccountsWithSavingGoals, AccountsWithSavingGoalsQuery, BufferSize,
};
use saving_goals::subscription::{
    CheckpointStore, EventHandler, InMemoryCheckpointStore, SubscriptionConfig,
    SubscriptionRunner, Supervisor, TaskExit,
};
use saving_goals::types::{EventVersion, StreamId, StreamIdError};
use saving_goals::EventRegistry;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

/// Failures of the service outside command handling.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The event registry could not be built or used.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The event store rejected a read or write.
    #[error(transparent)]
    EventStore(#[from] EventStoreError),

    /// A stream name was rejected.
    #[error(transparent)]
    StreamId(#[from] StreamIdError),
}

fn runner<H, S, C>(
    handler: H,
    store: &Arc<S>,
    registry: &Arc<EventRegistry>,
    checkpoints: &Arc<C>,
    config: &SubscriptionConfig,
) -> SubscriptionRunner<H, S, C>
where
    H: EventHandler,
    S: EventStore<Event = SerializedEvent>,
    C: CheckpointStore,
{
    SubscriptionRunner::new(
        handler,
        Arc::clone(store),
        Arc::clone(registry),
        Arc::clone(checkpoints),
    )
    .with_config(config.clone())
}

/// A running saving goals service.
pub struct SavingGoalsService<S> {
    store: Arc<S>,
    registry: Arc<EventRegistry>,
    bus: Arc<CommandBus<S>>,
    projection: AccountsWithSavingGoals,
    supervisor: Supervisor,
    query_buffer_size: BufferSize,
}

impl<S> SavingGoalsService<S>
where
    S: EventStore<Event = SerializedEvent> + 'static,
{
    /// Wires the service over `store` and spawns its subscriptions on the
    /// current runtime.
    #[instrument(skip_all)]
    pub fn start(store: Arc<S>, config: &AppConfig) -> Result<Self, ServiceError> {
        let registry = Arc::new(EventRegistry::saving_goals()?);
        let bus = Arc::new(CommandBus::new(Arc::clone(&store), Arc::clone(&registry)));
        let projection = AccountsWithSavingGoals::new();
        let checkpoints = Arc::new(InMemoryCheckpointStore::new());
        let settings = &config.subscription;
        let mut supervisor = Supervisor::new();
        let cancel = supervisor.signal();

        supervisor.spawn(runner(
            projection.clone(),
            &store,
            &registry,
            &checkpoints,
            settings,
        ));
        supervisor.spawn(runner(
            StartOfMonthProcessManager::new(projection.clone(), Arc::clone(&bus))
                .with_buffer_size(config.query_buffer_size)
                .with_cancellation(cancel),
            &store,
            &registry,
            &checkpoints,
            settings,
        ));
        supervisor.spawn(runner(
            RecordTransactionProcessManager::new(Arc::clone(&bus)),
            &store,
            &registry,
            &checkpoints,
            settings,
        ));

        info!(subscriptions = ?supervisor.names(), "saving goals service started");

        Ok(Self {
            store,
            registry,
            bus,
            projection,
            supervisor,
            query_buffer_size: config.query_buffer_size,
        })
    }

    /// Handles one command.
    pub async fn dispatch(&self, command: impl Into<Command>) -> CommandResult<Committed> {
        self.bus.dispatch(command.into()).await
    }

    /// Announces the start of `month`, which starts spending tracking for
    /// every account whose balance covers its goal.
    #[instrument(skip_all, fields(%month))]
    pub async fn start_month(&self, month: CalendarMonth) -> Result<EventVersion, ServiceError> {
        let stream_id = StreamId::try_new(CALENDAR_STREAM)?;
        let payload = self.registry.encode(&MonthStarted { month }.into())?;
        let versions = self
            .store
            .write_events_multi(vec![StreamEvents::new(
                stream_id.clone(),
                ExpectedVersion::Any,
                vec![EventToWrite::new(payload)],
            )])
            .await?;

        let version = versions.get(&stream_id).copied().ok_or_else(|| {
            EventStoreError::Internal(format!("store did not report a version for '{stream_id}'"))
        })?;
        info!(%version, "month started");
        Ok(version)
    }

    /// Every account that currently has a saving goal, as the projection
    /// sees it now.
    pub async fn accounts_with_saving_goals(&self) -> Vec<AccountWithSavingGoal> {
        let query = AccountsWithSavingGoalsQuery {
            buffer_size: self.query_buffer_size,
        };
        self.projection
            .query(query, self.supervisor.signal())
            .await
            .collect()
            .await
    }

    /// Current spending of an account for `month`.
    pub async fn spending(
        &self,
        account_id: AccountId,
        month: CalendarMonth,
    ) -> CommandResult<Spending> {
        let repository: Repository<Spending, S> =
            Repository::new(Arc::clone(&self.store), Arc::clone(&self.registry));
        let root = repository.load(&SpendingId::new(account_id, month)).await?;
        Ok(root.state().clone())
    }

    /// The read model of accounts and their goals.
    pub const fn projection(&self) -> &AccountsWithSavingGoals {
        &self.projection
    }

    /// The backing event store.
    pub const fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Subscriptions that ended on their own. Subscriptions only stop on
    /// shutdown, so any name here failed.
    pub fn failed_subscriptions(&self) -> Vec<&str> {
        self.supervisor.finished()
    }

    /// Stops every subscription, waiting up to `timeout`.
    #[instrument(skip(self))]
    pub async fn shutdown(self, timeout: Duration) -> Vec<(String, TaskExit)> {
        let exits = self.supervisor.shutdown(timeout).await;
        for (name, exit) in &exits {
            match exit {
                TaskExit::Stopped => {}
                TaskExit::Failed(error) => warn!(subscription = %name, %error, "subscription had failed"),
                TaskExit::Panicked | TaskExit::Aborted => {
                    warn!(subscription = %name, ?exit, "subscription did not stop cleanly");
                }
            }
        }
        info!("saving goals service stopped");
        exits
    }
}

/// Polls `check` every few milliseconds until it yields a value or
/// `timeout` elapses.
///
/// The service is eventually consistent: effects of process managers and
/// the projection show up some time after the command that caused them.
pub async fn eventually<T, F, Fut>(timeout: Duration, mut check: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = check().await {
            return Some(value);
        }
        if Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
