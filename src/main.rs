use anyhow::{Context, Result};
use field_gateway::{config, controller, telemetry};
use config::Config;
use controller::{Gateway, ScanScheduler};
use std::sync::Arc;
use telemetry::init_tracing;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cfg = Config::load()?;
    let _log_guard = init_tracing(&cfg.logging);

    let gateway = Arc::new(Gateway::from_config(cfg.clone()));
    gateway
        .seed_devices()
        .context("Failed to register configured devices")?;

    info!(
        ports = ?gateway.ports.available_ports(),
        baud_rates = ?cfg.serial.baud_rates,
        network = cfg.network.enabled,
        "starting field gateway"
    );

    let scheduler = ScanScheduler::for_gateway(Arc::clone(&gateway), &cfg.scheduler);
    scheduler.start();

    telemetry::shutdown_signal().await;

    if !scheduler.shutdown(cfg.scheduler.shutdown_grace()).await {
        warn!("shutdown did not complete cleanly");
    }

    match serde_json::to_string(&gateway.status()) {
        Ok(status) => info!(%status, "final device status"),
        Err(e) => warn!(error = %e, "could not serialize device status"),
    }
    info!(report = %gateway.report(), "device test report");

    warn!("shutdown complete");
    Ok(())
}
