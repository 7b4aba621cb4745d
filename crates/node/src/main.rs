use std::sync::Arc;

use anyhow::Context;

use conveyor_core::SystemClock;
use conveyor_infra::command::{CommandExecutor, EngineConfiguration};
use conveyor_infra::config::{AsyncExecutorConfig, JobConfig};
use conveyor_infra::jobs::{self, AsyncExecutor, JobHandlerRegistry};
use conveyor_infra::store::{BackingStore, InMemoryStore, PostgresStore};

const DEFAULT_DB_CONNECTIONS: u32 = 10;

async fn build_store() -> anyhow::Result<Arc<dyn BackingStore>> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        tracing::warn!("DATABASE_URL not set; using the in-memory store, jobs are lost on exit");
        return Ok(Arc::new(InMemoryStore::with_foreign_keys(jobs::foreign_keys())));
    };

    let max_connections = match std::env::var("CONVEYOR_DB_MAX_CONNECTIONS") {
        Ok(value) => value
            .parse()
            .with_context(|| format!("invalid CONVEYOR_DB_MAX_CONNECTIONS '{value}'"))?,
        Err(_) => DEFAULT_DB_CONNECTIONS,
    };
    let store = PostgresStore::connect(&url, max_connections, jobs::tables())
        .await
        .context("failed to connect to postgres")?;
    store
        .ensure_schema()
        .await
        .context("failed to create job tables")?;
    tracing::info!(max_connections, "connected to postgres");
    Ok(Arc::new(store))
}

fn handlers() -> JobHandlerRegistry {
    let mut registry = JobHandlerRegistry::new();
    registry.register_fn("log", |job, _ctx| {
        tracing::info!(
            job_id = %job.id,
            config = job.job_handler_config.as_deref().unwrap_or(""),
            "log job executed"
        );
        Ok(())
    });
    registry
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    conveyor_observability::init();

    let executor_config = AsyncExecutorConfig::from_env().context("executor configuration")?;
    let job_config = JobConfig::from_env().context("job configuration")?;

    let store = build_store().await?;
    let engine = EngineConfiguration::builder(store)
        .with_clock(Arc::new(SystemClock))
        .with_job_config(job_config)
        .with_handlers(handlers())
        .build();
    let commands = CommandExecutor::new(engine);

    let handle = AsyncExecutor::new(commands, executor_config)
        .start()
        .context("failed to start async executor")?;
    tracing::info!(executor_id = %handle.executor_id(), "node running; ctrl-c to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutdown requested");

    // waits for in-flight jobs, which drive the store with blocking calls
    let stats = tokio::task::spawn_blocking(move || handle.shutdown())
        .await
        .context("shutdown task failed")?;
    tracing::info!(
        completed = stats.jobs_completed,
        retried = stats.jobs_retried,
        dead_lettered = stats.jobs_dead_lettered,
        "node stopped"
    );
    Ok(())
}
