use anyhow::{Context, Result};
use rollcall_core::Config;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod dbus_interface;
mod stream;
mod trainer;

use dbus_interface::{AttendanceService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Arc::new(Config::load().context("failed to load configuration")?);
    tracing::info!(
        data_dir = %config.data_dir.display(),
        db = %config.db_path().display(),
        camera = %config.camera_device,
        distance_threshold = config.distance_threshold,
        confidence_threshold = config.confidence_threshold,
        "configuration loaded"
    );

    let trainer = trainer::spawn_trainer(&config).context("failed to start trainer")?;
    let service = AttendanceService::new(config.clone(), trainer);
    let stream = service.stream_slot();

    let _conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on the session bus")?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    let session = stream.lock().await.take();
    if let Some(session) = session {
        let exit = tokio::task::spawn_blocking(move || session.stop()).await?;
        tracing::info!(?exit, "stream stopped on shutdown");
    }

    Ok(())
}
