use std::sync::Arc;

use anyhow::{Context, Result};
use calendar_core::telemetry::{init_telemetry, TelemetryConfig};
use calendar_queue::create_queue;
use calendar_storage::create_storage;
use calendar_worker::{Scheduler, SchedulerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Optional .env file for local runs
    dotenvy::dotenv().ok();

    // Configure via environment variables:
    // - RUST_LOG or LOG_LEVEL: Log filter (default: "info")
    // - LOG_FORMAT: "json" for structured output
    let mut telemetry_config = TelemetryConfig::from_env().with_default_filter("info");
    if telemetry_config.service_name == "calendar" {
        telemetry_config.service_name = "calendar-scheduler".to_string();
    }
    init_telemetry(telemetry_config);

    tracing::info!("calendar-scheduler starting...");

    let config = SchedulerConfig::from_env().context("Invalid scheduler configuration")?;

    let storage = create_storage(&config.storage)
        .await
        .context("Failed to initialize event storage")?;
    let queue = create_queue(&config.queue)
        .await
        .context("Failed to initialize notification queue")?;

    let scheduler = Arc::new(
        Scheduler::new(&config)
            .with_storage(storage)
            .with_queue(queue),
    );

    let mut runner = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run().await })
    };

    // Run until Ctrl-C, then let the loop close the queue
    let result = tokio::select! {
        result = &mut runner => result,
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for shutdown signal")?;
            tracing::info!("Received shutdown signal");
            scheduler.stop();
            runner.await
        }
    };

    result
        .context("Scheduler task panicked")?
        .context("Scheduler exited with an error")?;

    tracing::info!("Scheduler shutdown complete");
    Ok(())
}
