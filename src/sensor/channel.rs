use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::sensor::{
    FixSubscription, GeoSensor, RawFix, SensorError, SensorEvent, WatchHandle, WatchOptions,
};

/// Sensor fed by whoever owns the device link: the HTTP ingestion endpoint
/// in the service, test code elsewhere. Each watcher gets its own bounded
/// queue; a full queue drops the event for that watcher only.
pub struct ChannelSensor {
    queue_size: usize,
    subscribers: DashMap<WatchHandle, mpsc::Sender<SensorEvent>>,
    next_handle: AtomicU64,
    last_fix: Mutex<Option<RawFix>>,
    permission_granted: AtomicBool,
}

impl ChannelSensor {
    pub fn new(queue_size: usize) -> Self {
        Self {
            queue_size: queue_size.max(1),
            subscribers: DashMap::new(),
            next_handle: AtomicU64::new(1),
            last_fix: Mutex::new(None),
            permission_granted: AtomicBool::new(true),
        }
    }

    pub fn set_permission(&self, granted: bool) {
        self.permission_granted.store(granted, Ordering::SeqCst);
    }

    pub fn watcher_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn publish(&self, fix: RawFix) -> usize {
        if let Ok(mut last) = self.last_fix.lock() {
            *last = Some(fix.clone());
        }
        self.broadcast(Ok(fix))
    }

    /// Drops every watcher's queue, as when the device link goes away.
    /// Watchers see their event stream end.
    pub fn disconnect_all(&self) {
        self.subscribers.clear();
    }

    pub fn publish_error(&self, err: SensorError) -> usize {
        self.broadcast(Err(err))
    }

    fn broadcast(&self, event: SensorEvent) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();

        for entry in self.subscribers.iter() {
            match entry.value().try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(watch = entry.key().0, "sensor queue full; dropping event");
                }
                Err(TrySendError::Closed(_)) => closed.push(*entry.key()),
            }
        }

        for handle in closed {
            self.subscribers.remove(&handle);
        }

        delivered
    }

    fn cached_fix(&self, options: &WatchOptions) -> Option<RawFix> {
        let last = self.last_fix.lock().ok()?.clone()?;
        let age = Utc::now().signed_duration_since(last.timestamp).to_std().ok()?;
        (age <= options.maximum_age).then_some(last)
    }
}

#[async_trait]
impl GeoSensor for ChannelSensor {
    async fn watch(&self, options: &WatchOptions) -> Result<FixSubscription, SensorError> {
        if !self.permission_granted.load(Ordering::SeqCst) {
            return Err(SensorError::PermissionDenied);
        }

        let handle = WatchHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        let (tx, events) = mpsc::channel(self.queue_size);
        self.subscribers.insert(handle, tx);

        debug!(
            watch = handle.0,
            high_accuracy = options.high_accuracy,
            "sensor watch registered"
        );

        Ok(FixSubscription { handle, events })
    }

    fn cancel(&self, handle: WatchHandle) {
        if self.subscribers.remove(&handle).is_some() {
            debug!(watch = handle.0, "sensor watch cancelled");
        }
    }

    async fn current_fix(&self, options: &WatchOptions) -> Result<RawFix, SensorError> {
        if !self.permission_granted.load(Ordering::SeqCst) {
            return Err(SensorError::PermissionDenied);
        }
        if let Some(fix) = self.cached_fix(options) {
            return Ok(fix);
        }

        let mut subscription = self.watch(options).await?;
        let outcome = tokio::time::timeout(options.timeout, subscription.events.recv()).await;
        self.cancel(subscription.handle);

        match outcome {
            Ok(Some(event)) => event,
            Ok(None) => Err(SensorError::Closed),
            Err(_) => Err(SensorError::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::ChannelSensor;
    use crate::sensor::{GeoSensor, RawFix, SensorError, WatchOptions};

    fn fix(lat: f64) -> RawFix {
        RawFix {
            latitude: lat,
            longitude: 9.99,
            heading: None,
            speed: Some(12.0),
            timestamp: Utc::now(),
        }
    }

    fn quick_options() -> WatchOptions {
        WatchOptions {
            high_accuracy: true,
            maximum_age: Duration::from_secs(5),
            timeout: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn cancelled_watch_receives_nothing_more() {
        let sensor = ChannelSensor::new(8);
        let mut sub = sensor.watch(&quick_options()).await.unwrap();

        assert_eq!(sensor.publish(fix(53.0)), 1);
        sensor.cancel(sub.handle);
        assert_eq!(sensor.publish(fix(53.1)), 0);

        assert_eq!(sub.events.recv().await.unwrap().unwrap().latitude, 53.0);
        assert!(sub.events.recv().await.is_none());
    }

    #[tokio::test]
    async fn current_fix_times_out_without_device_input() {
        let sensor = ChannelSensor::new(8);
        let err = sensor.current_fix(&quick_options()).await.unwrap_err();

        assert_eq!(err, SensorError::Timeout);
        assert_eq!(sensor.watcher_count(), 0);
    }

    #[tokio::test]
    async fn current_fix_reuses_fresh_cached_fix() {
        let sensor = ChannelSensor::new(8);
        sensor.publish(fix(48.0));

        let got = sensor.current_fix(&quick_options()).await.unwrap();
        assert_eq!(got.latitude, 48.0);
    }

    #[tokio::test]
    async fn denied_permission_fails_watch() {
        let sensor = ChannelSensor::new(8);
        sensor.set_permission(false);

        assert_eq!(
            sensor.watch(&quick_options()).await.err(),
            Some(SensorError::PermissionDenied)
        );
    }

    #[tokio::test]
    async fn full_queue_drops_for_slow_watcher() {
        let sensor = ChannelSensor::new(1);
        let _sub = sensor.watch(&quick_options()).await.unwrap();

        assert_eq!(sensor.publish(fix(1.0)), 1);
        assert_eq!(sensor.publish(fix(2.0)), 0);
    }
}
