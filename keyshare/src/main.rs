use keyshare::Engine;
use keyshare::config::EngineConfig;
use keyshare::logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = EngineConfig::from_env()?;

    // Initialize logging; keep the handle alive so the file writer flushes
    let logging_handle = logging::init_logging(config.log_dir.as_deref())?;
    tracing::info!(
        filter = %logging_handle.get_filter(),
        log_dir = ?logging_handle.log_dir(),
        "Logging initialized"
    );

    let engine = Engine::open(config).await?;

    let stats = engine.usage_stats().await?;
    tracing::info!(
        credentials = stats.len(),
        active = stats.iter().filter(|s| s.active).count(),
        "keyshare initialized successfully"
    );

    let tasks = engine.start_background_tasks();
    logging_handle.start_retention_cleanup(engine.cancellation_token());

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received Ctrl-C, shutting down");

    // Let in-flight sweeps finish before the pools close
    engine.cancellation_token().cancel();
    for task in tasks {
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "Background task ended abnormally");
        }
    }
    engine.shutdown().await;

    Ok(())
}
