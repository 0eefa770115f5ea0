use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agentflow_runtime::Evaluator;
use agentflow_storage::{PersistenceStore, PostgresStore};
use agentflow_worker::{RunnerService, RunnerServiceConfig};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agentflow=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let database_url = std::env::var("AGENTFLOW_DATABASE_URL")
        .expect("AGENTFLOW_DATABASE_URL environment variable required");

    let store = PostgresStore::connect(&database_url).await?;
    store.migrate().await?;
    let store: Arc<dyn PersistenceStore> = Arc::new(store);
    tracing::info!("store connection established");

    let mut config = RunnerServiceConfig::default();
    if let Ok(task_list) = std::env::var("AGENTFLOW_TASK_LIST") {
        config = config.with_task_list(task_list);
    }

    let evaluator = Arc::new(Evaluator::new(Arc::clone(&store)));
    let service = Arc::new(RunnerService::new(store, evaluator, config));

    let shutdown = Arc::clone(&service);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            shutdown.shutdown();
        }
    });

    service.start().await?;
    Ok(())
}
