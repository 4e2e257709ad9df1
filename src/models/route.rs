use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum RouteStatus {
    Pending,
    InProgress,
    Completed,
}

impl RouteStatus {
    /// The only status a route may move to from `self`. No skips, no way back.
    pub fn next(self) -> Option<RouteStatus> {
        match self {
            RouteStatus::Pending => Some(RouteStatus::InProgress),
            RouteStatus::InProgress => Some(RouteStatus::Completed),
            RouteStatus::Completed => None,
        }
    }

    pub fn can_transition_to(self, to: RouteStatus) -> bool {
        self.next() == Some(to)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryProof {
    /// Base64 signature image as captured on the device.
    pub signature: String,
    pub client_name: Option<String>,
    pub client_id: Option<String>,
    pub delivered_at: DateTime<Utc>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Route {
    pub id: String,
    pub origin: String,
    pub destination: String,
    pub distance_km: f64,
    pub price: f64,
    pub driver_id: Option<String>,
    pub vehicle_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub status: RouteStatus,
    pub start_location: Option<GeoPoint>,
    pub started_at: Option<DateTime<Utc>>,
    pub proof: Option<DeliveryProof>,
    pub rating: Option<u8>,
}

impl Route {
    pub fn new(id: impl Into<String>, origin: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            origin: origin.into(),
            destination: destination.into(),
            distance_km: 0.0,
            price: 0.0,
            driver_id: None,
            vehicle_id: None,
            created_at: Utc::now(),
            status: RouteStatus::Pending,
            start_location: None,
            started_at: None,
            proof: None,
            rating: None,
        }
    }

    /// Checks the cross-field invariants tying proof, rating and start
    /// coordinates to the lifecycle status.
    pub fn is_consistent(&self) -> bool {
        let completed = self.status == RouteStatus::Completed;
        let started = matches!(self.status, RouteStatus::InProgress | RouteStatus::Completed);

        (self.proof.is_none() || completed)
            && (self.rating.is_none() || completed)
            && (self.start_location.is_none() || started)
    }

    pub fn is_assigned_to(&self, driver_id: Option<&str>) -> bool {
        match driver_id {
            Some(driver) => self.driver_id.as_deref() == Some(driver),
            None => true,
        }
    }
}
