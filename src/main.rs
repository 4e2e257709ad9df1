use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use route_tracker::api;
use route_tracker::cache::{FileCache, LocalCache};
use route_tracker::config::Config;
use route_tracker::engine::outbox::run_outbox_retry;
use route_tracker::error::AppError;
use route_tracker::lifecycle::run_elapsed_timer;
use route_tracker::observability::init_tracing;
use route_tracker::remote::{InMemoryRemote, RemoteStore};
use route_tracker::sensor::{ChannelSensor, WatchOptions};
use route_tracker::state::{AppState, StateOptions};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = Config::from_env()?;

    init_tracing(&config.log_level, config.log_json);

    let cache: Arc<dyn LocalCache> = Arc::new(FileCache::open(&config.cache_dir)?);
    let remote: Arc<dyn RemoteStore> = Arc::new(InMemoryRemote::new());
    let sensor = Arc::new(ChannelSensor::new(config.sensor_queue_size));

    let options = StateOptions {
        driver_id: config.driver_id.clone(),
        event_buffer_size: config.event_buffer_size,
        track_capacity: config.track_log_capacity,
        filter: config.filter_config(),
        watch: WatchOptions {
            high_accuracy: true,
            maximum_age: config.fix_max_age(),
            timeout: config.fix_timeout(),
        },
        sink_timeout: config.sink_timeout(),
    };
    let shared_state = Arc::new(AppState::new(remote.clone(), cache, sensor, options));

    match shared_state.controller.reconcile(Utc::now()).await {
        Ok(outcome) => tracing::info!(?outcome, "startup reconciliation finished"),
        Err(err) => tracing::warn!(error = %err, "startup reconciliation skipped"),
    }
    shared_state.controller.resume().await;

    tokio::spawn(run_outbox_retry(
        shared_state.outbox.clone(),
        remote,
        Duration::from_secs(config.outbox_retry_secs.max(1)),
    ));
    tokio::spawn(run_elapsed_timer(
        shared_state.session.clone(),
        Duration::from_secs(1),
    ));

    let app = api::rest::router(shared_state.clone());

    let bind_addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|err| AppError::Internal(format!("failed to bind {bind_addr}: {err}")))?;

    tracing::info!(http_port = config.http_port, "http server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::Internal(format!("server error: {err}")))?;

    if let Some(stats) = shared_state.sampler.stop().await {
        tracing::info!(accepted = stats.accepted, "tracking stopped for shutdown");
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}
