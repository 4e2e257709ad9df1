use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::AppError;
use crate::tracking::filter::FilterConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub log_json: bool,
    pub cache_dir: PathBuf,
    pub driver_id: Option<String>,
    pub event_buffer_size: usize,
    pub sensor_queue_size: usize,
    pub sample_min_interval_secs: u64,
    pub sample_min_displacement_m: f64,
    pub track_log_capacity: usize,
    pub fix_timeout_ms: u64,
    pub fix_max_age_ms: u64,
    pub outbox_retry_secs: u64,
    pub sink_timeout_ms: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", 3000)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_json: parse_or_default("LOG_JSON", false)?,
            cache_dir: env::var("CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".route-cache")),
            driver_id: env::var("DRIVER_ID").ok().filter(|id| !id.trim().is_empty()),
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", 1024)?,
            sensor_queue_size: parse_or_default("SENSOR_QUEUE_SIZE", 256)?,
            sample_min_interval_secs: parse_or_default("SAMPLE_MIN_INTERVAL_SECS", 5)?,
            sample_min_displacement_m: parse_or_default("SAMPLE_MIN_DISPLACEMENT_M", 10.0)?,
            track_log_capacity: parse_or_default("TRACK_LOG_CAPACITY", 1500)?,
            fix_timeout_ms: parse_or_default("FIX_TIMEOUT_MS", 10_000)?,
            fix_max_age_ms: parse_or_default("FIX_MAX_AGE_MS", 5_000)?,
            outbox_retry_secs: parse_or_default("OUTBOX_RETRY_SECS", 30)?,
            sink_timeout_ms: parse_or_default("SINK_TIMEOUT_MS", 5_000)?,
        })
    }

    pub fn filter_config(&self) -> FilterConfig {
        FilterConfig {
            min_interval: Duration::from_secs(self.sample_min_interval_secs),
            min_displacement_m: self.sample_min_displacement_m,
        }
    }

    pub fn fix_timeout(&self) -> Duration {
        Duration::from_millis(self.fix_timeout_ms)
    }

    pub fn fix_max_age(&self) -> Duration {
        Duration::from_millis(self.fix_max_age_ms)
    }

    pub fn sink_timeout(&self) -> Duration {
        Duration::from_millis(self.sink_timeout_ms.max(1))
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}
