use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{info, warn};

use crate::engine::mutation::{MutationEngine, WriteTicket};
use crate::error::AppError;
use crate::models::route::{DeliveryProof, GeoPoint, Route, RouteStatus};
use crate::reconcile::{ReconcileOutcome, ReconciliationGuard};
use crate::sensor::{RawFix, SensorError};
use crate::session::SessionStore;
use crate::tracking::sampler::LocationSampler;
use crate::tracking::TrackingTarget;

/// A lifecycle step applied locally, with its remote write in flight.
pub struct Transition {
    pub route: Route,
    pub write: WriteTicket,
}

/// Drives a route through Pending -> InProgress -> Completed for this device.
pub struct RouteController {
    engine: Arc<MutationEngine>,
    session: Arc<SessionStore>,
    sampler: Arc<LocationSampler>,
    guard: Arc<ReconciliationGuard>,
    // Held for a whole start so the active-route check and the claim on the
    // session cannot interleave with another start.
    starting: Mutex<()>,
}

impl RouteController {
    pub fn new(
        engine: Arc<MutationEngine>,
        session: Arc<SessionStore>,
        sampler: Arc<LocationSampler>,
        guard: Arc<ReconciliationGuard>,
    ) -> Self {
        Self {
            engine,
            session,
            sampler,
            guard,
            starting: Mutex::new(()),
        }
    }

    pub async fn start(&self, route_id: &str) -> Result<Transition, AppError> {
        let _starting = self.starting.lock().await;
        let route = self.find(route_id)?;
        if route.status != RouteStatus::Pending {
            return Err(AppError::InvalidTransition {
                route_id: route.id,
                from: route.status,
                to: RouteStatus::InProgress,
            });
        }

        let snapshot = self.session.snapshot();
        if let Some(active) = snapshot.active_route_id() {
            if active != route_id {
                return Err(AppError::Conflict(format!(
                    "route {active} is already in progress on this device"
                )));
            }
        }

        let start_fix = if snapshot.gps_enabled {
            self.acquire_start_fix(route_id).await
        } else {
            None
        };

        let (updated, write) =
            self.engine
                .change_status(route_id, RouteStatus::InProgress, |route| {
                    route.start_location = start_fix.map(|fix| GeoPoint {
                        lat: fix.latitude,
                        lng: fix.longitude,
                    });
                    route.started_at = Some(Utc::now());
                })?;

        self.session.update(|state| {
            state.active_route = Some(updated.clone());
            state.elapsed_secs = 0;
            state.awaiting_proof = false;
        });
        info!(
            route_id = %route_id,
            has_start_fix = updated.start_location.is_some(),
            "route started"
        );

        let snapshot = self.session.snapshot();
        if updated.vehicle_id.is_some() && snapshot.gps_enabled && !snapshot.tracking_enabled {
            if let Err(err) = self.enable_tracking(&updated).await {
                warn!(route_id = %route_id, error = %err, "automatic tracking unavailable");
            }
        }

        Ok(Transition {
            route: updated,
            write,
        })
    }

    /// Opens proof capture. The route stays in progress until `finish`.
    pub fn request_finish(&self, route_id: &str) -> Result<Route, AppError> {
        let route = self.find(route_id)?;
        if route.status != RouteStatus::InProgress {
            return Err(AppError::InvalidTransition {
                route_id: route.id,
                from: route.status,
                to: RouteStatus::Completed,
            });
        }

        self.session.update(|state| {
            if state.active_route_id().is_none_or(|active| active == route_id) {
                state.awaiting_proof = true;
            }
        });
        Ok(route)
    }

    /// Terminal step. Local completion is committed before the remote write
    /// starts and is never rolled back; a failed write goes to the outbox.
    pub async fn finish(&self, route_id: &str, proof: DeliveryProof) -> Result<Transition, AppError> {
        if proof.signature.trim().is_empty() {
            return Err(AppError::BadRequest("signature cannot be empty".to_string()));
        }

        let route = self.find(route_id)?;
        if route.status != RouteStatus::InProgress {
            return Err(AppError::InvalidTransition {
                route_id: route.id,
                from: route.status,
                to: RouteStatus::Completed,
            });
        }

        self.guard.mark_finalized(route_id);

        self.session.update(|state| {
            if state.active_route_id().is_none_or(|active| active == route_id) {
                state.clear_active();
            }
        });

        if let Some(target) = self.sampler.active_target().await {
            if target.route_id == route_id {
                self.sampler.stop().await;
            }
        }

        let (route, write) = self.engine.attach_proof(route_id, proof)?;
        info!(route_id = %route_id, "route completed");

        Ok(Transition { route, write })
    }

    /// Flips live tracking for the active route and returns the new state.
    pub async fn toggle_tracking(&self) -> Result<bool, AppError> {
        let snapshot = self.session.snapshot();

        if snapshot.tracking_enabled || self.sampler.is_active().await {
            self.sampler.stop().await;
            self.session.update(|state| state.tracking_enabled = false);
            return Ok(false);
        }

        let route = snapshot
            .active_route
            .ok_or_else(|| AppError::Conflict("no active route to track".to_string()))?;
        self.enable_tracking(&route).await?;
        Ok(true)
    }

    pub fn set_gps_enabled(&self, enabled: bool) {
        self.session.update(|state| state.gps_enabled = enabled);
    }

    /// Picks tracking back up after a restart if the persisted session says
    /// it was running.
    pub async fn resume(&self) {
        let snapshot = self.session.snapshot();
        let Some(route) = snapshot.active_route else {
            return;
        };
        if !snapshot.tracking_enabled {
            return;
        }

        if let Err(err) = self.enable_tracking(&route).await {
            warn!(route_id = %route.id, error = %err, "could not resume tracking");
            self.session.update(|state| state.tracking_enabled = false);
        }
    }

    /// Removes the route. Deleting the active route also releases the
    /// session and stops its sampling.
    pub async fn delete(&self, route_id: &str) -> Result<WriteTicket, AppError> {
        let write = self.engine.delete(route_id)?;

        self.session.update(|state| {
            if state.active_route_id() == Some(route_id) {
                state.clear_active();
            }
        });
        self.release_stale_tracking().await;

        Ok(write)
    }

    /// Refreshes routes from the remote, then drops sampling that no longer
    /// belongs to the active route.
    pub async fn reconcile(&self, now: DateTime<Utc>) -> Result<ReconcileOutcome, AppError> {
        let outcome = self.guard.reconcile(&self.engine, &self.session, now).await?;
        self.release_stale_tracking().await;
        Ok(outcome)
    }

    pub fn rate(&self, route_id: &str, rating: u8) -> Result<Transition, AppError> {
        let (route, write) = self.engine.rate(route_id, rating)?;
        Ok(Transition { route, write })
    }

    pub fn session(&self) -> &Arc<SessionStore> {
        &self.session
    }

    pub fn engine(&self) -> &Arc<MutationEngine> {
        &self.engine
    }

    async fn enable_tracking(&self, route: &Route) -> Result<(), SensorError> {
        let target = TrackingTarget {
            route_id: route.id.clone(),
            vehicle_id: route.vehicle_id.clone(),
        };

        match self.sampler.start(target).await {
            Ok(()) => {
                self.session.update(|state| state.tracking_enabled = true);
                Ok(())
            }
            Err(err) => {
                self.session.record_error(err.to_string());
                Err(err)
            }
        }
    }

    async fn release_stale_tracking(&self) {
        let Some(target) = self.sampler.active_target().await else {
            return;
        };
        let snapshot = self.session.snapshot();
        if snapshot.active_route_id() != Some(target.route_id.as_str()) {
            self.sampler.stop().await;
            info!(route_id = %target.route_id, "tracking released with its route");
        }
    }

    async fn acquire_start_fix(&self, route_id: &str) -> Option<RawFix> {
        let options = self.sampler.watch_options().clone();
        let outcome = match timeout(options.timeout, self.sampler.sensor().current_fix(&options)).await {
            Ok(result) => result,
            Err(_) => Err(SensorError::Timeout),
        };

        match outcome {
            Ok(fix) => Some(fix),
            Err(err) => {
                warn!(route_id = %route_id, error = %err, "starting without a position fix");
                self.session.record_error(err.to_string());
                None
            }
        }
    }

    fn find(&self, route_id: &str) -> Result<Route, AppError> {
        self.engine
            .route(route_id)
            .ok_or_else(|| AppError::NotFound(format!("route {route_id} not found")))
    }
}

pub async fn run_elapsed_timer(session: Arc<SessionStore>, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        session.tick(period.as_secs().max(1));
    }
}
