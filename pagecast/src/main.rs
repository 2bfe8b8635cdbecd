use std::sync::Arc;

use pagecast::config::CoordinatorConfig;
use pagecast::diagnose::DiagnoseSweep;
use pagecast::invoker::HttpStageInvoker;
use pagecast::logging::init_logging;
use pagecast::services::ServiceContainer;
use pagecast::store::SqliteStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = CoordinatorConfig::from_env()?;
    let _log_guard = init_logging(&config.log)?;

    // Initialize the store, running migrations
    let store = SqliteStore::connect(&config.store.database_url).await?;
    let invoker = HttpStageInvoker::new(&config.invoker)?;
    let services = ServiceContainer::new(Arc::new(store), Arc::new(invoker), config).await?;

    let diagnose = &services.config.diagnose;
    let sweep = DiagnoseSweep::new(services.clone());
    let scheduler = tokio::spawn({
        let interval = diagnose.interval();
        let budget = diagnose.time_budget();
        let cancel = services.cancellation_token().clone();
        async move { sweep.run_forever(interval, budget, cancel).await }
    });

    tracing::info!("pagecast coordinator started");

    tokio::signal::ctrl_c().await?;
    services.shutdown();
    scheduler.await?;

    tracing::info!("pagecast coordinator stopped");
    Ok(())
}
