pub mod channel;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::models::location::LocationSample;

pub use channel::ChannelSensor;

#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum SensorError {
    #[error("location permission denied")]
    PermissionDenied,

    #[error("timed out waiting for a position fix")]
    Timeout,

    #[error("position unavailable: {0}")]
    PositionUnavailable(String),

    #[error("sensor subscription closed")]
    Closed,
}

/// A fix exactly as the device reports it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawFix {
    pub latitude: f64,
    pub longitude: f64,
    pub heading: Option<f64>,
    pub speed: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl From<RawFix> for LocationSample {
    fn from(fix: RawFix) -> Self {
        LocationSample {
            lat: fix.latitude,
            lng: fix.longitude,
            speed: fix.speed,
            heading: fix.heading,
            timestamp: fix.timestamp,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub high_accuracy: bool,
    pub maximum_age: Duration,
    pub timeout: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            high_accuracy: true,
            maximum_age: Duration::from_secs(5),
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchHandle(pub u64);

pub type SensorEvent = Result<RawFix, SensorError>;

pub struct FixSubscription {
    pub handle: WatchHandle,
    pub events: mpsc::Receiver<SensorEvent>,
}

#[async_trait]
pub trait GeoSensor: Send + Sync {
    async fn watch(&self, options: &WatchOptions) -> Result<FixSubscription, SensorError>;

    /// After this returns, no further events are delivered for `handle`.
    fn cancel(&self, handle: WatchHandle);

    /// One fix, honouring `maximum_age` for cached fixes and `timeout` for
    /// fresh ones.
    async fn current_fix(&self, options: &WatchOptions) -> Result<RawFix, SensorError>;
}
