//! Saving goals service binary
//!
//! Runs the service on the in-memory store, optionally replays the
//! demonstration workload, then waits for Ctrl-C.

use anyhow::{Context, Result};
use saving_goals::event_store::SerializedEvent;
use saving_goals_app::service::SavingGoalsService;
use saving_goals_app::{demo, telemetry, AppConfig};
use saving_goals_memory::InMemoryEventStore;
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::from_env().context("loading configuration")?;
    telemetry::init(&config.log).context("initialising logging")?;
    info!(?config, "configuration loaded");

    let store: Arc<InMemoryEventStore<SerializedEvent>> = Arc::new(InMemoryEventStore::new());
    let service = SavingGoalsService::start(store, &config)?;

    if config.run_demo {
        if let Err(error) = demo::run(&service).await {
            error!(%error, "demonstration failed");
        }
    }

    info!("running; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("listening for Ctrl-C")?;

    let failed = service.failed_subscriptions().len();
    if failed > 0 {
        warn!(failed, "some subscriptions stopped before shutdown");
    }
    service.shutdown(config.shutdown_timeout).await;
    Ok(())
}
