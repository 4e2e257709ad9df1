use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};

use crate::models::location::{LivePosition, TrackLogEntry, VehicleLocation};
use crate::models::route::{DeliveryProof, Route, RouteStatus};
use crate::remote::{RemoteError, RemoteOp, RemoteResult, RemoteStore};

/// Process-local stand-in for the remote persistence service, with failure
/// injection per operation or for the whole link.
#[derive(Default)]
pub struct InMemoryRemote {
    routes: DashMap<String, Route>,
    tracks: DashMap<String, Vec<TrackLogEntry>>,
    vehicles: DashMap<String, VehicleLocation>,
    live: DashMap<String, LivePosition>,
    failing: DashSet<RemoteOp>,
    stalled: DashSet<RemoteOp>,
    offline: AtomicBool,
    calls: DashMap<RemoteOp, usize>,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn fail_on(&self, op: RemoteOp) {
        self.failing.insert(op);
    }

    pub fn recover(&self, op: RemoteOp) {
        self.failing.remove(&op);
        self.stalled.remove(&op);
    }

    /// Calls to `op` never answer, like a request lost on a dead link.
    pub fn stall_on(&self, op: RemoteOp) {
        self.stalled.insert(op);
    }

    /// Inserts a route directly, as if another session had written it.
    pub fn seed_route(&self, route: Route) {
        self.routes.insert(route.id.clone(), route);
    }

    pub fn route(&self, route_id: &str) -> Option<Route> {
        self.routes.get(route_id).map(|entry| entry.value().clone())
    }

    pub fn track(&self, route_id: &str) -> Vec<TrackLogEntry> {
        self.tracks
            .get(route_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    pub fn vehicle(&self, vehicle_id: &str) -> Option<VehicleLocation> {
        self.vehicles.get(vehicle_id).map(|entry| entry.value().clone())
    }

    pub fn live(&self, route_id: &str) -> Option<LivePosition> {
        self.live.get(route_id).map(|entry| entry.value().clone())
    }

    pub fn calls(&self, op: RemoteOp) -> usize {
        self.calls.get(&op).map(|count| *count).unwrap_or(0)
    }

    async fn check(&self, op: RemoteOp) -> RemoteResult<()> {
        *self.calls.entry(op).or_insert(0) += 1;

        if self.stalled.contains(&op) {
            std::future::pending::<()>().await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable("remote offline".to_string()));
        }
        if self.failing.contains(&op) {
            return Err(RemoteError::Unavailable(format!("{op:?} failing")));
        }
        Ok(())
    }

    fn with_route<F>(&self, route_id: &str, apply: F) -> RemoteResult<()>
    where
        F: FnOnce(&mut Route),
    {
        let mut route = self
            .routes
            .get_mut(route_id)
            .ok_or_else(|| RemoteError::NotFound(format!("route {route_id}")))?;
        apply(&mut route);
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemote {
    async fn list_routes(&self) -> RemoteResult<Vec<Route>> {
        self.check(RemoteOp::ListRoutes).await?;
        Ok(self.routes.iter().map(|entry| entry.value().clone()).collect())
    }

    async fn create_route(&self, route: &Route) -> RemoteResult<()> {
        self.check(RemoteOp::CreateRoute).await?;
        if self.routes.contains_key(&route.id) {
            return Err(RemoteError::Rejected(format!("route {} already exists", route.id)));
        }
        self.routes.insert(route.id.clone(), route.clone());
        Ok(())
    }

    async fn delete_route(&self, route_id: &str) -> RemoteResult<()> {
        self.check(RemoteOp::DeleteRoute).await?;
        self.routes.remove(route_id);
        self.tracks.remove(route_id);
        Ok(())
    }

    async fn update_route_status(&self, route: &Route) -> RemoteResult<()> {
        self.check(RemoteOp::UpdateStatus).await?;
        let mut stored = self
            .routes
            .get_mut(&route.id)
            .ok_or_else(|| RemoteError::NotFound(format!("route {}", route.id)))?;

        if stored.status != route.status && !stored.status.can_transition_to(route.status) {
            return Err(RemoteError::Rejected(format!(
                "route {} cannot move from {:?} to {:?}",
                route.id, stored.status, route.status
            )));
        }
        stored.status = route.status;
        stored.start_location = route.start_location;
        stored.started_at = route.started_at;
        Ok(())
    }

    async fn attach_proof(&self, route_id: &str, proof: &DeliveryProof) -> RemoteResult<()> {
        self.check(RemoteOp::AttachProof).await?;
        self.with_route(route_id, |stored| {
            stored.status = RouteStatus::Completed;
            stored.proof = Some(proof.clone());
        })
    }

    async fn rate_route(&self, route_id: &str, rating: u8) -> RemoteResult<()> {
        self.check(RemoteOp::RateRoute).await?;
        self.with_route(route_id, |stored| stored.rating = Some(rating))
    }

    async fn insert_track_entry(&self, entry: &TrackLogEntry) -> RemoteResult<()> {
        self.check(RemoteOp::InsertTrack).await?;
        self.tracks
            .entry(entry.route_id.clone())
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn query_track(&self, route_id: &str) -> RemoteResult<Vec<TrackLogEntry>> {
        self.check(RemoteOp::QueryTrack).await?;
        Ok(self.track(route_id))
    }

    async fn upsert_vehicle_location(&self, location: &VehicleLocation) -> RemoteResult<()> {
        self.check(RemoteOp::UpsertVehicle).await?;
        self.vehicles
            .insert(location.vehicle_id.clone(), location.clone());
        Ok(())
    }

    async fn push_live_position(&self, position: &LivePosition) -> RemoteResult<()> {
        self.check(RemoteOp::PushLive).await?;
        self.live.insert(position.route_id.clone(), position.clone());
        Ok(())
    }
}
