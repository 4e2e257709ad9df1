//! Merges the authoritative remote route set into the local view and picks
//! the route this device should be running.
//!
//! The finalized set closes a race: `finish` completes a route locally and
//! writes remotely in the background, so a refresh landing in between can
//! still report the route as in progress. Ids in the set are never adopted.
//! Routes whose proof write is still queued count as finalized too, so the
//! guarantee holds across a restart.

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use serde::Serialize;
use tracing::{info, warn};

use crate::engine::mutation::MutationEngine;
use crate::error::AppError;
use crate::models::route::{Route, RouteStatus};
use crate::session::SessionStore;

pub const MAX_RESUMED_ELAPSED_SECS: i64 = 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Adopted { route_id: String, elapsed_secs: u64 },
    KeptActive { route_id: String },
    Idle,
}

pub struct ReconciliationGuard {
    finalized: DashSet<String>,
    driver_id: Option<String>,
}

impl ReconciliationGuard {
    pub fn new(driver_id: Option<String>) -> Self {
        Self {
            finalized: DashSet::new(),
            driver_id,
        }
    }

    pub fn mark_finalized(&self, route_id: &str) {
        self.finalized.insert(route_id.to_string());
    }

    pub fn is_finalized(&self, route_id: &str) -> bool {
        self.finalized.contains(route_id)
    }

    pub fn driver_id(&self) -> Option<&str> {
        self.driver_id.as_deref()
    }

    /// The in-progress route this device should pick up, newest first.
    pub fn select_adoptable<'a>(&self, routes: &'a [Route]) -> Option<&'a Route> {
        routes
            .iter()
            .filter(|route| route.status == RouteStatus::InProgress)
            .filter(|route| route.is_assigned_to(self.driver_id()))
            .filter(|route| !self.is_finalized(&route.id))
            .max_by_key(|route| route.started_at.unwrap_or(route.created_at))
    }

    pub async fn reconcile(
        &self,
        engine: &MutationEngine,
        session: &SessionStore,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, AppError> {
        let authoritative = engine.remote().list_routes().await.map_err(|err| {
            warn!(error = %err, "route refresh failed; keeping local view");
            AppError::Remote(err)
        })?;

        let outbox = engine.outbox().clone();
        for route_id in outbox.pending_completions() {
            self.mark_finalized(&route_id);
        }

        let candidate = self.select_adoptable(&authoritative).cloned();
        engine.merge_authoritative(authoritative, |id| {
            self.is_finalized(id) || outbox.has_pending_for(id)
        });

        let outcome = session.update(|state| {
            if let Some(active) = state.active_route.clone() {
                match engine.route(&active.id) {
                    Some(fresh) if fresh.status == RouteStatus::InProgress => {
                        state.active_route = Some(fresh);
                        return ReconcileOutcome::KeptActive { route_id: active.id };
                    }
                    // Completed or deleted elsewhere; the device is free again.
                    Some(_) | None => {
                        info!(route_id = %active.id, "active route closed elsewhere; releasing it");
                        state.clear_active();
                    }
                }
            }

            match &candidate {
                Some(route) => {
                    let elapsed_secs = resumed_elapsed_secs(route, now);
                    state.active_route = Some(route.clone());
                    state.elapsed_secs = elapsed_secs;
                    state.awaiting_proof = false;
                    ReconcileOutcome::Adopted {
                        route_id: route.id.clone(),
                        elapsed_secs,
                    }
                }
                None => ReconcileOutcome::Idle,
            }
        });

        if let ReconcileOutcome::Adopted {
            route_id,
            elapsed_secs,
        } = &outcome
        {
            info!(route_id = %route_id, elapsed_secs, "adopted in-progress route");
        }

        Ok(outcome)
    }
}

/// Time since the route started, or zero when the value is implausible.
pub fn resumed_elapsed_secs(route: &Route, now: DateTime<Utc>) -> u64 {
    let since = route.started_at.unwrap_or(route.created_at);
    let elapsed = now.signed_duration_since(since).num_seconds();

    if elapsed > 0 && elapsed < MAX_RESUMED_ELAPSED_SECS {
        elapsed as u64
    } else {
        0
    }
}
