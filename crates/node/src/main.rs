//! Boots one management node against in-memory adapters.

use std::sync::Arc;

use anyhow::Context;

use jobweave_engine::{AsyncJobManager, EngineConfig, JobExecutor, JobExecutorConfig, JobOutcome};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    jobweave_observability::init();

    let config = EngineConfig::from_env().context("invalid engine configuration")?;
    tracing::info!(
        node_id = config.node_id,
        workers = config.executor_workers,
        sweep_interval_ms = config.sweep_interval.as_millis() as u64,
        "starting management node"
    );

    let manager = Arc::new(AsyncJobManager::in_memory(config.clone()));
    manager.on_startup().context("startup sweep failed")?;

    let mut executor = JobExecutor::new(manager.clone(), JobExecutorConfig::from_engine(&config))
        .context("failed to register executor")?;
    // Smoke-test job: completes with its own arguments as the result.
    executor.register_handler("Echo", |ctx| JobOutcome::success(ctx.job().cmd_info.clone()));

    let scheduler = manager
        .wakeup_scheduler()
        .spawn()
        .context("failed to spawn wakeup scheduler")?;
    let workers = executor.spawn().context("failed to spawn executor workers")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");

    tokio::task::spawn_blocking(move || {
        workers.shutdown();
        scheduler.shutdown();
    })
    .await
    .context("shutdown task failed")?;

    tracing::info!(node_id = config.node_id, "management node stopped");
    Ok(())
}
