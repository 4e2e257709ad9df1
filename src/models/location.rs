use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::route::GeoPoint;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocationSample {
    pub lat: f64,
    pub lng: f64,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl LocationSample {
    pub fn point(&self) -> GeoPoint {
        GeoPoint {
            lat: self.lat,
            lng: self.lng,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackLogEntry {
    pub route_id: String,
    pub lat: f64,
    pub lng: f64,
    pub speed: f64,
    pub heading: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl TrackLogEntry {
    pub fn from_sample(route_id: &str, sample: &LocationSample) -> Self {
        Self {
            route_id: route_id.to_string(),
            lat: sample.lat,
            lng: sample.lng,
            speed: sample.speed.unwrap_or(0.0),
            heading: sample.heading,
            timestamp: sample.timestamp,
        }
    }

    pub fn point(&self) -> GeoPoint {
        GeoPoint {
            lat: self.lat,
            lng: self.lng,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LivePosition {
    pub route_id: String,
    pub vehicle_id: Option<String>,
    pub lat: f64,
    pub lng: f64,
    pub heading: Option<f64>,
    pub speed: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VehicleLocation {
    pub vehicle_id: String,
    pub route_id: String,
    pub lat: f64,
    pub lng: f64,
    pub heading: Option<f64>,
    pub speed: f64,
    pub updated_at: DateTime<Utc>,
}
