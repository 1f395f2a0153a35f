use std::sync::Arc;

use sqlx::sqlite::SqlitePoolOptions;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use notifsrv::bus::modbus::ModbusConnector;
use notifsrv::bus::mqtt::MqttBus;
use notifsrv::services::{ConfigCache, ControlLoop, DeviceFleetController};
use notifsrv::{AlarmSetStore, ServiceConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServiceConfig::load()?;
    info!("starting notifsrv");

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect(&config.store.database_url)
        .await?;

    let cache = Arc::new(ConfigCache::new(
        pool,
        config.control.config_refresh_interval(),
    ));
    if let Err(e) = cache.refresh().await {
        warn!("initial config refresh failed, starting with defaults: {}", e);
    }
    let refresh_task = cache.spawn_refresh_task();

    let store = Arc::new(AlarmSetStore::new());
    let mqtt = MqttBus::start(&config.mqtt, Arc::clone(&store), Arc::clone(&cache));

    let connector = Arc::new(ModbusConnector::new(config.control.io_timeout()));
    let fleet = Arc::new(DeviceFleetController::new(connector));
    fleet.apply_roster(&cache.snapshot().roster).await;
    cache.take_roster_changed();
    let recovery_task = fleet.spawn_recovery_task(config.control.recovery_interval());

    let control = ControlLoop::new(
        Arc::clone(&store),
        Arc::clone(&cache),
        Arc::clone(&fleet),
        mqtt,
        config.control.tick_interval(),
    );
    let mut control_task = tokio::spawn(control.run());

    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("shutdown signal received"),
            Err(e) => error!("failed to listen for shutdown signal: {}", e),
        },
        _ = &mut control_task => {
            error!("control loop task terminated unexpectedly, shutting down");
        }
    }

    control_task.abort();
    recovery_task.abort();
    refresh_task.abort();
    fleet.shutdown().await;
    info!("notifsrv stopped");
    Ok(())
}
