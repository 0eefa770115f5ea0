use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agentflow_runtime::HandlerDispatcher;
use agentflow_storage::{PersistenceStore, PostgresStore};
use agentflow_worker::{AgentPoller, AgentPollerConfig, ArtifactConfig};

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

    let mut config = AgentPollerConfig::default();
    if let Ok(task_list) = std::env::var("AGENTFLOW_TASK_LIST") {
        config = config.with_task_list(task_list);
    }
    if let Ok(topics) = std::env::var("AGENTFLOW_TOPICS") {
        config = config.with_topics(topics.split(',').map(str::to_string).collect());
    }

    // Domain handlers register themselves here; this binary serves
    // artifact-backed registrations from the shared registry.
    let dispatcher = Arc::new(HandlerDispatcher::new());

    let poller = Arc::new(AgentPoller::with_artifacts(
        store,
        dispatcher,
        config,
        ArtifactConfig::default(),
    ));

    let shutdown = Arc::clone(&poller);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            shutdown.shutdown();
        }
    });

    poller.start().await?;
    Ok(())
}
