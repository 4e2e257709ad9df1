use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::cache::LocalCache;
use crate::models::location::{LivePosition, LocationSample, TrackLogEntry, VehicleLocation};
use crate::observability::metrics::Metrics;
use crate::remote::{RemoteResult, RemoteStore};
use crate::tracking::track_log;
use crate::tracking::TrackingTarget;

pub const DEFAULT_SINK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sink {
    VehicleLocation,
    LiveTracking,
    LiveBroadcast,
    TrackLocal,
    TrackRemote,
}

impl Sink {
    pub fn label(self) -> &'static str {
        match self {
            Sink::VehicleLocation => "vehicle_location",
            Sink::LiveTracking => "live_tracking",
            Sink::LiveBroadcast => "live_broadcast",
            Sink::TrackLocal => "track_local",
            Sink::TrackRemote => "track_remote",
        }
    }
}

#[derive(Debug, Default)]
pub struct FanoutReport {
    pub delivered: Vec<Sink>,
    pub failed: Vec<(Sink, String)>,
}

impl FanoutReport {
    fn record(&mut self, sink: Sink, outcome: Result<(), String>) {
        match outcome {
            Ok(()) => self.delivered.push(sink),
            Err(err) => self.failed.push((sink, err)),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Delivers accepted samples to every destination. Sinks run concurrently
/// and independently; results are only logged and counted. Every remote
/// call is bounded by the sink timeout.
pub struct FanoutSink {
    remote: Arc<dyn RemoteStore>,
    cache: Arc<dyn LocalCache>,
    live_tx: broadcast::Sender<LivePosition>,
    track_capacity: usize,
    sink_timeout: Duration,
    metrics: Metrics,
}

impl FanoutSink {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        cache: Arc<dyn LocalCache>,
        live_tx: broadcast::Sender<LivePosition>,
        track_capacity: usize,
        metrics: Metrics,
    ) -> Self {
        Self {
            remote,
            cache,
            live_tx,
            track_capacity: track_capacity.max(1),
            sink_timeout: DEFAULT_SINK_TIMEOUT,
            metrics,
        }
    }

    pub fn with_sink_timeout(mut self, sink_timeout: Duration) -> Self {
        self.sink_timeout = sink_timeout;
        self
    }

    pub async fn dispatch(&self, target: &TrackingTarget, sample: &LocationSample) -> FanoutReport {
        let start = Instant::now();
        let position = LivePosition {
            route_id: target.route_id.clone(),
            vehicle_id: target.vehicle_id.clone(),
            lat: sample.lat,
            lng: sample.lng,
            heading: sample.heading,
            speed: sample.speed.unwrap_or(0.0),
            timestamp: sample.timestamp,
        };
        let entry = TrackLogEntry::from_sample(&target.route_id, sample);

        let (vehicle, live, broadcast, (track_local, track_remote)) = tokio::join!(
            self.update_vehicle(target, &position),
            self.push_live(&position),
            self.broadcast_live(&position),
            self.append_track(&entry),
        );

        let mut report = FanoutReport::default();
        if let Some(outcome) = vehicle {
            report.record(Sink::VehicleLocation, outcome);
        }
        report.record(Sink::LiveTracking, live);
        report.record(Sink::LiveBroadcast, broadcast);
        report.record(Sink::TrackLocal, track_local);
        report.record(Sink::TrackRemote, track_remote);

        for (sink, err) in &report.failed {
            warn!(
                route_id = %target.route_id,
                sink = sink.label(),
                error = %err,
                "sink delivery failed"
            );
            self.metrics
                .sink_failures_total
                .with_label_values(&[sink.label()])
                .inc();
        }

        let outcome = if report.is_clean() { "clean" } else { "partial" };
        self.metrics
            .fanout_latency_seconds
            .with_label_values(&[outcome])
            .observe(start.elapsed().as_secs_f64());

        report
    }

    async fn update_vehicle(
        &self,
        target: &TrackingTarget,
        position: &LivePosition,
    ) -> Option<Result<(), String>> {
        let vehicle_id = target.vehicle_id.as_ref()?;
        let location = VehicleLocation {
            vehicle_id: vehicle_id.clone(),
            route_id: target.route_id.clone(),
            lat: position.lat,
            lng: position.lng,
            heading: position.heading,
            speed: position.speed,
            updated_at: Utc::now(),
        };

        Some(self.bounded(self.remote.upsert_vehicle_location(&location)).await)
    }

    async fn push_live(&self, position: &LivePosition) -> Result<(), String> {
        self.bounded(self.remote.push_live_position(position)).await
    }

    async fn broadcast_live(&self, position: &LivePosition) -> Result<(), String> {
        // No subscribers is not a failure.
        let viewers = self.live_tx.send(position.clone()).unwrap_or(0);
        debug!(route_id = %position.route_id, viewers, "live position broadcast");
        Ok(())
    }

    async fn append_track(&self, entry: &TrackLogEntry) -> (Result<(), String>, Result<(), String>) {
        let local = track_log::append(self.cache.as_ref(), entry, self.track_capacity)
            .map(|_| ())
            .map_err(|err| err.to_string());

        let remote = self.bounded(self.remote.insert_track_entry(entry)).await;

        (local, remote)
    }

    async fn bounded<T>(&self, call: impl Future<Output = RemoteResult<T>>) -> Result<T, String> {
        match timeout(self.sink_timeout, call).await {
            Ok(result) => result.map_err(|err| err.to_string()),
            Err(_) => Err(format!("no response within {:?}", self.sink_timeout)),
        }
    }
}
