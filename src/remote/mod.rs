//! Contract of the remote persistence service. Every call may fail and
//! callers decide per operation whether a failure matters.

pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::location::{LivePosition, TrackLogEntry, VehicleLocation};
use crate::models::route::{DeliveryProof, Route};

pub use memory::InMemoryRemote;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RemoteError {
    #[error("network unavailable: {0}")]
    Unavailable(String),

    #[error("rejected by remote: {0}")]
    Rejected(String),

    #[error("not found remotely: {0}")]
    NotFound(String),
}

pub type RemoteResult<T> = Result<T, RemoteError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    ListRoutes,
    CreateRoute,
    DeleteRoute,
    UpdateStatus,
    AttachProof,
    RateRoute,
    InsertTrack,
    QueryTrack,
    UpsertVehicle,
    PushLive,
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn list_routes(&self) -> RemoteResult<Vec<Route>>;
    async fn create_route(&self, route: &Route) -> RemoteResult<()>;
    async fn delete_route(&self, route_id: &str) -> RemoteResult<()>;

    /// Writes status together with the start coordinates and start time.
    async fn update_route_status(&self, route: &Route) -> RemoteResult<()>;

    /// Stores the proof and marks the route completed in one write.
    async fn attach_proof(&self, route_id: &str, proof: &DeliveryProof) -> RemoteResult<()>;
    async fn rate_route(&self, route_id: &str, rating: u8) -> RemoteResult<()>;

    async fn insert_track_entry(&self, entry: &TrackLogEntry) -> RemoteResult<()>;
    async fn query_track(&self, route_id: &str) -> RemoteResult<Vec<TrackLogEntry>>;

    async fn upsert_vehicle_location(&self, location: &VehicleLocation) -> RemoteResult<()>;
    async fn push_live_position(&self, position: &LivePosition) -> RemoteResult<()>;
}
