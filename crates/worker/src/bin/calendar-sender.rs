use std::sync::Arc;

use anyhow::{Context, Result};
use calendar_core::telemetry::{init_telemetry, TelemetryConfig};
use calendar_queue::create_queue;
use calendar_worker::{Sender, SenderConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Optional .env file for local runs
    dotenvy::dotenv().ok();

    let mut telemetry_config = TelemetryConfig::from_env().with_default_filter("info");
    if telemetry_config.service_name == "calendar" {
        telemetry_config.service_name = "calendar-sender".to_string();
    }
    init_telemetry(telemetry_config);

    tracing::info!("calendar-sender starting...");

    let config = SenderConfig::from_env().context("Invalid sender configuration")?;
    let queue = create_queue(&config.queue)
        .await
        .context("Failed to initialize notification queue")?;

    let sender = Arc::new(Sender::new().with_queue(queue));

    let mut runner = {
        let sender = sender.clone();
        tokio::spawn(async move { sender.run().await })
    };

    let result = tokio::select! {
        result = &mut runner => result,
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for shutdown signal")?;
            tracing::info!("Received shutdown signal");
            sender.stop();
            runner.await
        }
    };

    result
        .context("Sender task panicked")?
        .context("Sender exited with an error")?;

    tracing::info!(delivered = sender.delivered(), "Sender shutdown complete");
    Ok(())
}
