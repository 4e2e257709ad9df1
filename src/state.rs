use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::cache::LocalCache;
use crate::engine::mutation::MutationEngine;
use crate::engine::outbox::Outbox;
use crate::lifecycle::RouteController;
use crate::models::location::LivePosition;
use crate::observability::metrics::Metrics;
use crate::reconcile::ReconciliationGuard;
use crate::remote::RemoteStore;
use crate::sensor::{ChannelSensor, WatchOptions};
use crate::session::SessionStore;
use crate::tracking::fanout::{FanoutSink, DEFAULT_SINK_TIMEOUT};
use crate::tracking::filter::FilterConfig;
use crate::tracking::sampler::LocationSampler;
use crate::tracking::track_log::DEFAULT_TRACK_CAPACITY;

#[derive(Debug, Clone)]
pub struct StateOptions {
    pub driver_id: Option<String>,
    pub event_buffer_size: usize,
    pub track_capacity: usize,
    pub filter: FilterConfig,
    pub watch: WatchOptions,
    pub sink_timeout: Duration,
}

impl Default for StateOptions {
    fn default() -> Self {
        Self {
            driver_id: None,
            event_buffer_size: 1024,
            track_capacity: DEFAULT_TRACK_CAPACITY,
            filter: FilterConfig::default(),
            watch: WatchOptions::default(),
            sink_timeout: DEFAULT_SINK_TIMEOUT,
        }
    }
}

pub struct AppState {
    pub controller: RouteController,
    pub engine: Arc<MutationEngine>,
    pub session: Arc<SessionStore>,
    pub sampler: Arc<LocationSampler>,
    pub guard: Arc<ReconciliationGuard>,
    pub outbox: Arc<Outbox>,
    pub remote: Arc<dyn RemoteStore>,
    pub cache: Arc<dyn LocalCache>,
    pub sensor: Arc<ChannelSensor>,
    pub live_tx: broadcast::Sender<LivePosition>,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        cache: Arc<dyn LocalCache>,
        sensor: Arc<ChannelSensor>,
        options: StateOptions,
    ) -> Self {
        let metrics = Metrics::new();
        let (live_tx, _unused_rx) = broadcast::channel(options.event_buffer_size.max(1));

        let session = Arc::new(SessionStore::load(cache.clone()));
        let outbox = Arc::new(Outbox::load(cache.clone(), metrics.clone()));
        let engine = Arc::new(MutationEngine::new(
            remote.clone(),
            outbox.clone(),
            metrics.clone(),
        ));
        let guard = Arc::new(ReconciliationGuard::new(options.driver_id));

        let fanout = Arc::new(
            FanoutSink::new(
                remote.clone(),
                cache.clone(),
                live_tx.clone(),
                options.track_capacity,
                metrics.clone(),
            )
            .with_sink_timeout(options.sink_timeout),
        );
        let sampler = Arc::new(LocationSampler::new(
            sensor.clone(),
            fanout,
            session.clone(),
            metrics.clone(),
            options.filter,
            options.watch,
        ));

        let controller = RouteController::new(
            engine.clone(),
            session.clone(),
            sampler.clone(),
            guard.clone(),
        );

        Self {
            controller,
            engine,
            session,
            sampler,
            guard,
            outbox,
            remote,
            cache,
            sensor,
            live_tx,
            metrics,
        }
    }
}
