use std::sync::Arc;

use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::models::location::LocationSample;
use crate::observability::metrics::Metrics;
use crate::sensor::{FixSubscription, GeoSensor, SensorError, WatchOptions};
use crate::session::SessionStore;
use crate::tracking::fanout::FanoutSink;
use crate::tracking::filter::{FilterConfig, SampleFilter, Verdict};
use crate::tracking::TrackingTarget;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SamplerStats {
    pub received: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub sensor_errors: u64,
}

struct ActiveTracking {
    target: TrackingTarget,
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<SamplerStats>,
}

/// Owns at most one sensor subscription. Samples are filtered and fanned
/// out one at a time in arrival order on a dedicated task.
pub struct LocationSampler {
    sensor: Arc<dyn GeoSensor>,
    fanout: Arc<FanoutSink>,
    session: Arc<SessionStore>,
    metrics: Metrics,
    filter_config: FilterConfig,
    watch_options: WatchOptions,
    active: Mutex<Option<ActiveTracking>>,
}

impl LocationSampler {
    pub fn new(
        sensor: Arc<dyn GeoSensor>,
        fanout: Arc<FanoutSink>,
        session: Arc<SessionStore>,
        metrics: Metrics,
        filter_config: FilterConfig,
        watch_options: WatchOptions,
    ) -> Self {
        Self {
            sensor,
            fanout,
            session,
            metrics,
            filter_config,
            watch_options,
            active: Mutex::new(None),
        }
    }

    pub fn sensor(&self) -> &Arc<dyn GeoSensor> {
        &self.sensor
    }

    pub fn watch_options(&self) -> &WatchOptions {
        &self.watch_options
    }

    /// Starts sampling for `target`. A no-op when already sampling the same
    /// route; a different route's subscription is stopped first.
    pub async fn start(&self, target: TrackingTarget) -> Result<(), SensorError> {
        let mut active = self.active.lock().await;

        if let Some(current) = running(&active) {
            if current.target.route_id == target.route_id {
                return Ok(());
            }
        }
        if let Some(previous) = active.take() {
            shutdown(previous).await;
        }

        let subscription = self.sensor.watch(&self.watch_options).await?;
        let (stop_tx, stop_rx) = oneshot::channel();

        let task = tokio::spawn(run_sampler(
            self.sensor.clone(),
            subscription,
            stop_rx,
            target.clone(),
            self.fanout.clone(),
            self.session.clone(),
            self.metrics.clone(),
            SampleFilter::new(self.filter_config.clone()),
        ));

        info!(route_id = %target.route_id, "location sampling started");
        *active = Some(ActiveTracking {
            target,
            stop_tx,
            task,
        });
        Ok(())
    }

    /// Cancels the subscription and waits for the sampling task to exit, so
    /// nothing is delivered after this returns.
    pub async fn stop(&self) -> Option<SamplerStats> {
        let previous = self.active.lock().await.take()?;
        let route_id = previous.target.route_id.clone();
        let stats = shutdown(previous).await;
        info!(route_id = %route_id, accepted = stats.accepted, "location sampling stopped");
        Some(stats)
    }

    pub async fn active_target(&self) -> Option<TrackingTarget> {
        running(&*self.active.lock().await).map(|active| active.target.clone())
    }

    pub async fn is_active(&self) -> bool {
        running(&*self.active.lock().await).is_some()
    }
}

/// The slot's task, unless it already ended on its own.
fn running(slot: &Option<ActiveTracking>) -> Option<&ActiveTracking> {
    slot.as_ref().filter(|active| !active.task.is_finished())
}

async fn shutdown(active: ActiveTracking) -> SamplerStats {
    let _ = active.stop_tx.send(());
    match active.task.await {
        Ok(stats) => stats,
        Err(err) => {
            warn!(route_id = %active.target.route_id, error = %err, "sampler task failed");
            SamplerStats::default()
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_sampler(
    sensor: Arc<dyn GeoSensor>,
    subscription: FixSubscription,
    mut stop_rx: oneshot::Receiver<()>,
    target: TrackingTarget,
    fanout: Arc<FanoutSink>,
    session: Arc<SessionStore>,
    metrics: Metrics,
    mut filter: SampleFilter,
) -> SamplerStats {
    let FixSubscription { handle, mut events } = subscription;
    let mut stats = SamplerStats::default();

    let closed = 'sampling: loop {
        tokio::select! {
            biased;
            _ = &mut stop_rx => break 'sampling false,
            event = events.recv() => match event {
                Some(Ok(fix)) => {
                    stats.received += 1;
                    let sample = LocationSample::from(fix);

                    match filter.evaluate(&sample) {
                        Verdict::Accepted => {
                            stats.accepted += 1;
                            metrics.samples_total.with_label_values(&["accepted"]).inc();
                            session.record_location(&sample);
                            // Stop wins over an in-flight delivery.
                            tokio::select! {
                                biased;
                                _ = &mut stop_rx => break 'sampling false,
                                _ = fanout.dispatch(&target, &sample) => {}
                            }
                        }
                        verdict => {
                            stats.rejected += 1;
                            metrics.samples_total.with_label_values(&["rejected"]).inc();
                            debug!(route_id = %target.route_id, ?verdict, "sample filtered out");
                        }
                    }
                }
                Some(Err(err)) => {
                    stats.sensor_errors += 1;
                    warn!(route_id = %target.route_id, error = %err, "sensor error while tracking");
                    session.record_error(err.to_string());
                }
                None => break 'sampling true,
            }
        }
    };

    sensor.cancel(handle);
    if closed {
        warn!(route_id = %target.route_id, "sensor stream closed; tracking stopped");
        session.update(|state| state.tracking_enabled = false);
    }
    stats
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{Duration as ChronoDuration, Utc};
    use tokio::sync::broadcast;

    use super::LocationSampler;
    use crate::cache::MemoryCache;
    use crate::geo::METERS_PER_DEGREE;
    use crate::observability::metrics::Metrics;
    use crate::remote::{InMemoryRemote, RemoteOp};
    use crate::sensor::{ChannelSensor, RawFix, SensorError, WatchOptions};
    use crate::session::SessionStore;
    use crate::tracking::fanout::FanoutSink;
    use crate::tracking::filter::FilterConfig;
    use crate::tracking::TrackingTarget;

    struct Harness {
        sampler: LocationSampler,
        sensor: Arc<ChannelSensor>,
        remote: Arc<InMemoryRemote>,
        session: Arc<SessionStore>,
    }

    fn harness() -> Harness {
        let sensor = Arc::new(ChannelSensor::new(64));
        let remote = Arc::new(InMemoryRemote::new());
        let cache = Arc::new(MemoryCache::new());
        let session = Arc::new(SessionStore::load(cache.clone()));
        let (live_tx, _) = broadcast::channel(16);
        let fanout = Arc::new(FanoutSink::new(
            remote.clone(),
            cache,
            live_tx,
            1500,
            Metrics::new(),
        ));
        let sampler = LocationSampler::new(
            sensor.clone(),
            fanout,
            session.clone(),
            Metrics::new(),
            FilterConfig::default(),
            WatchOptions::default(),
        );
        Harness {
            sampler,
            sensor,
            remote,
            session,
        }
    }

    fn target(route_id: &str) -> TrackingTarget {
        TrackingTarget {
            route_id: route_id.to_string(),
            vehicle_id: Some("truck-1".to_string()),
        }
    }

    fn fix(secs: i64, north_m: f64) -> RawFix {
        RawFix {
            latitude: 53.5 + north_m / METERS_PER_DEGREE,
            longitude: 10.0,
            heading: None,
            speed: None,
            timestamp: Utc::now() + ChronoDuration::seconds(secs),
        }
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test]
    async fn accepted_samples_reach_the_track_log_in_order() {
        let h = harness();
        h.sampler.start(target("R1")).await.unwrap();

        h.sensor.publish(fix(0, 0.0));
        h.sensor.publish(fix(1, 50.0));
        h.sensor.publish(fix(6, 60.0));
        h.sensor.publish(fix(12, 60.5));
        h.sensor.publish(fix(18, 200.0));

        wait_for(|| h.remote.track("R1").len() == 3).await;
        let stats = h.sampler.stop().await.unwrap();

        assert_eq!(stats.received, 5);
        assert_eq!(stats.accepted, 3);
        assert_eq!(stats.rejected, 2);

        let track = h.remote.track("R1");
        assert!(track.windows(2).all(|pair| pair[0].timestamp < pair[1].timestamp));
        assert!(h.session.snapshot().last_location.is_some());
    }

    #[tokio::test]
    async fn stop_cancels_the_subscription() {
        let h = harness();
        h.sampler.start(target("R1")).await.unwrap();
        assert_eq!(h.sensor.watcher_count(), 1);

        h.sampler.stop().await.unwrap();
        assert_eq!(h.sensor.watcher_count(), 0);
        assert!(!h.sampler.is_active().await);

        assert_eq!(h.sensor.publish(fix(30, 500.0)), 0);
        assert!(h.remote.track("R1").is_empty());
    }

    #[tokio::test]
    async fn restart_begins_a_fresh_acceptance_window() {
        let h = harness();
        h.sampler.start(target("R1")).await.unwrap();
        h.sensor.publish(fix(0, 0.0));
        wait_for(|| h.remote.track("R1").len() == 1).await;
        h.sampler.stop().await;

        h.sampler.start(target("R1")).await.unwrap();
        h.sensor.publish(fix(1, 0.0));
        wait_for(|| h.remote.track("R1").len() == 2).await;
        h.sampler.stop().await;
    }

    #[tokio::test]
    async fn sensor_errors_are_recorded_but_sampling_continues() {
        let h = harness();
        h.sampler.start(target("R1")).await.unwrap();

        h.sensor.publish_error(SensorError::Timeout);
        h.sensor.publish(fix(0, 0.0));
        wait_for(|| h.remote.track("R1").len() == 1).await;

        let stats = h.sampler.stop().await.unwrap();
        assert_eq!(stats.sensor_errors, 1);
        assert_eq!(
            h.session.snapshot().last_error.as_deref(),
            Some("timed out waiting for a position fix")
        );
    }

    #[tokio::test]
    async fn switching_routes_replaces_the_subscription() {
        let h = harness();
        h.sampler.start(target("R1")).await.unwrap();
        h.sampler.start(target("R1")).await.unwrap();
        assert_eq!(h.sensor.watcher_count(), 1);

        h.sampler.start(target("R2")).await.unwrap();
        assert_eq!(h.sensor.watcher_count(), 1);
        assert_eq!(h.sampler.active_target().await.unwrap().route_id, "R2");
        h.sampler.stop().await;
    }

    #[tokio::test]
    async fn lost_sensor_stream_ends_tracking() {
        let h = harness();
        h.session.update(|state| state.tracking_enabled = true);
        h.sampler.start(target("R1")).await.unwrap();

        h.sensor.disconnect_all();

        let sampler = &h.sampler;
        for _ in 0..200 {
            if !sampler.is_active().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!sampler.is_active().await);
        assert!(sampler.active_target().await.is_none());
        let session = h.session.clone();
        wait_for(move || !session.snapshot().tracking_enabled).await;

        h.sampler.start(target("R1")).await.unwrap();
        assert!(h.sampler.is_active().await);
        assert_eq!(h.sensor.watcher_count(), 1);
        h.sampler.stop().await;
    }

    #[tokio::test]
    async fn stop_does_not_wait_for_a_stalled_delivery() {
        let h = harness();
        h.remote.stall_on(RemoteOp::PushLive);
        h.sampler.start(target("R1")).await.unwrap();

        h.sensor.publish(fix(0, 0.0));
        let remote = h.remote.clone();
        wait_for(move || remote.calls(RemoteOp::PushLive) == 1).await;

        let stats = tokio::time::timeout(Duration::from_secs(2), h.sampler.stop())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.accepted, 1);
        assert_eq!(h.sensor.watcher_count(), 0);
    }

    #[tokio::test]
    async fn permission_denied_leaves_sampler_idle() {
        let h = harness();
        h.sensor.set_permission(false);

        let err = h.sampler.start(target("R1")).await.unwrap_err();
        assert_eq!(err, SensorError::PermissionDenied);
        assert!(!h.sampler.is_active().await);
    }
}
