use serde::Serialize;
use tracing::warn;

use crate::cache::{get_json, set_json, CacheError, LocalCache};
use crate::geo::path_length_km;
use crate::models::location::TrackLogEntry;
use crate::models::route::GeoPoint;
use crate::remote::RemoteStore;

pub const DEFAULT_TRACK_CAPACITY: usize = 1500;

pub fn track_key(route_id: &str) -> String {
    format!("track_log:{route_id}")
}

pub fn load(cache: &dyn LocalCache, route_id: &str) -> Result<Vec<TrackLogEntry>, CacheError> {
    Ok(get_json(cache, &track_key(route_id))?.unwrap_or_default())
}

/// Read-append-truncate-write of the route's local buffer. Returns the
/// buffer length after the write.
pub fn append(
    cache: &dyn LocalCache,
    entry: &TrackLogEntry,
    capacity: usize,
) -> Result<usize, CacheError> {
    let key = track_key(&entry.route_id);
    let mut buffer: Vec<TrackLogEntry> = get_json(cache, &key).unwrap_or_else(|err| {
        warn!(route_id = %entry.route_id, error = %err, "track buffer unreadable; starting over");
        None
    })
    .unwrap_or_default();

    buffer.push(entry.clone());
    if buffer.len() > capacity {
        let overflow = buffer.len() - capacity;
        buffer.drain(..overflow);
    }

    set_json(cache, &key, &buffer)?;
    Ok(buffer.len())
}

pub fn clear(cache: &dyn LocalCache, route_id: &str) -> Result<(), CacheError> {
    cache.remove(&track_key(route_id))
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TrackSource {
    Remote,
    Local,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TrackPlayback {
    Available {
        source: TrackSource,
        distance_km: f64,
        entries: Vec<TrackLogEntry>,
    },
    Unavailable,
}

/// History for replaying a route. Prefers the remote copy, falls back to the
/// device buffer, and reports no trajectory rather than failing.
pub async fn playback(
    remote: &dyn RemoteStore,
    cache: &dyn LocalCache,
    route_id: &str,
) -> TrackPlayback {
    let remote_entries = match remote.query_track(route_id).await {
        Ok(entries) => entries,
        Err(err) => {
            warn!(route_id = %route_id, error = %err, "remote track query failed");
            Vec::new()
        }
    };

    let (source, mut entries) = if remote_entries.is_empty() {
        let local = load(cache, route_id).unwrap_or_else(|err| {
            warn!(route_id = %route_id, error = %err, "local track buffer unreadable");
            Vec::new()
        });
        (TrackSource::Local, local)
    } else {
        (TrackSource::Remote, remote_entries)
    };

    if entries.is_empty() {
        return TrackPlayback::Unavailable;
    }

    entries.sort_by_key(|entry| entry.timestamp);
    let points: Vec<GeoPoint> = entries.iter().map(TrackLogEntry::point).collect();

    TrackPlayback::Available {
        source,
        distance_km: path_length_km(&points),
        entries,
    }
}
