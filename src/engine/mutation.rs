use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::outbox::{Outbox, RemoteWrite};
use crate::error::AppError;
use crate::models::route::{DeliveryProof, Route, RouteStatus};
use crate::observability::metrics::Metrics;
use crate::remote::{RemoteError, RemoteStore};

/// What happens to the local change when its remote write fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OnFailure {
    /// Undo the local change and hand the error to the caller.
    Rollback,
    /// Keep the local change, queue the write for retry.
    KeepLocal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Delete,
    StatusChange,
    AttachProof,
    Rate,
}

impl Operation {
    pub fn policy(self) -> OnFailure {
        match self {
            Operation::Create => OnFailure::Rollback,
            Operation::Delete
            | Operation::StatusChange
            | Operation::AttachProof
            | Operation::Rate => OnFailure::KeepLocal,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Delete => "delete",
            Operation::StatusChange => "status_change",
            Operation::AttachProof => "attach_proof",
            Operation::Rate => "rate",
        }
    }

    fn of(write: &RemoteWrite) -> Self {
        match write {
            RemoteWrite::UpdateStatus { .. } => Operation::StatusChange,
            RemoteWrite::AttachProof { .. } => Operation::AttachProof,
            RemoteWrite::Delete { .. } => Operation::Delete,
            RemoteWrite::Rate { .. } => Operation::Rate,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    Persisted,
    Queued(RemoteError),
    /// Not attempted; queued behind an earlier pending write for the route.
    Deferred,
    Aborted,
}

/// Handle on a background remote write. Dropping it detaches the write.
#[must_use = "dropping a ticket detaches the write; call settled() to wait for it"]
pub struct WriteTicket {
    handle: JoinHandle<WriteOutcome>,
}

impl WriteTicket {
    pub async fn settled(self) -> WriteOutcome {
        self.handle.await.unwrap_or(WriteOutcome::Aborted)
    }
}

/// Completion signal of the newest write per route, tagged with its sequence.
type WriteTails = DashMap<String, (u64, oneshot::Receiver<()>)>;

/// The visible route collection plus apply-then-persist for every change.
/// Remote writes for one route run strictly in the order they were issued.
pub struct MutationEngine {
    routes: DashMap<String, Route>,
    remote: Arc<dyn RemoteStore>,
    outbox: Arc<Outbox>,
    metrics: Metrics,
    write_tails: Arc<WriteTails>,
    write_seq: AtomicU64,
}

impl MutationEngine {
    pub fn new(remote: Arc<dyn RemoteStore>, outbox: Arc<Outbox>, metrics: Metrics) -> Self {
        Self {
            routes: DashMap::new(),
            remote,
            outbox,
            metrics,
            write_tails: Arc::new(DashMap::new()),
            write_seq: AtomicU64::new(0),
        }
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    pub fn route(&self, route_id: &str) -> Option<Route> {
        self.routes.get(route_id).map(|entry| entry.value().clone())
    }

    pub fn routes(&self) -> Vec<Route> {
        let mut routes: Vec<Route> = self
            .routes
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        routes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Inserts locally, then waits for the remote create. A remote failure
    /// removes the route again and is returned to the caller.
    pub async fn create(&self, route: Route) -> Result<Route, AppError> {
        if route.status != RouteStatus::Pending || !route.is_consistent() {
            return Err(AppError::BadRequest("new routes must be pending".to_string()));
        }

        match self.routes.entry(route.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(AppError::Conflict(format!("route {} already exists", route.id)));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(route.clone());
            }
        }

        match self.remote.create_route(&route).await {
            Ok(()) => {
                self.count(Operation::Create, "persisted");
                info!(route_id = %route.id, "route created");
                Ok(route)
            }
            Err(err) => {
                self.routes.remove(&route.id);
                self.count(Operation::Create, "rolled_back");
                warn!(route_id = %route.id, error = %err, "route create failed; rolled back");
                Err(AppError::Remote(err))
            }
        }
    }

    pub fn delete(&self, route_id: &str) -> Result<WriteTicket, AppError> {
        self.routes
            .remove(route_id)
            .ok_or_else(|| AppError::NotFound(format!("route {route_id} not found")))?;

        info!(route_id = %route_id, "route deleted locally");
        Ok(self.persist(RemoteWrite::Delete {
            route_id: route_id.to_string(),
        }))
    }

    /// Moves a route one step along its lifecycle, applying `edit` in the
    /// same critical section as the status check.
    pub fn change_status(
        &self,
        route_id: &str,
        to: RouteStatus,
        edit: impl FnOnce(&mut Route),
    ) -> Result<(Route, WriteTicket), AppError> {
        let updated = self.mutate(route_id, |route| {
            ensure_transition(route, to)?;
            edit(route);
            route.status = to;
            Ok(())
        })?;

        let ticket = self.persist(RemoteWrite::UpdateStatus {
            route: updated.clone(),
        });
        Ok((updated, ticket))
    }

    /// The completing write: status and proof land together, exactly once.
    pub fn attach_proof(
        &self,
        route_id: &str,
        proof: DeliveryProof,
    ) -> Result<(Route, WriteTicket), AppError> {
        let updated = self.mutate(route_id, |route| {
            ensure_transition(route, RouteStatus::Completed)?;
            if route.proof.is_some() {
                return Err(AppError::Conflict(format!(
                    "route {} already has a delivery proof",
                    route.id
                )));
            }
            route.status = RouteStatus::Completed;
            route.proof = Some(proof.clone());
            Ok(())
        })?;

        let ticket = self.persist(RemoteWrite::AttachProof {
            route_id: route_id.to_string(),
            proof,
        });
        Ok((updated, ticket))
    }

    pub fn rate(&self, route_id: &str, rating: u8) -> Result<(Route, WriteTicket), AppError> {
        if !(1..=5).contains(&rating) {
            return Err(AppError::BadRequest("rating must be between 1 and 5".to_string()));
        }

        let updated = self.mutate(route_id, |route| {
            if route.status != RouteStatus::Completed {
                return Err(AppError::Conflict(format!(
                    "route {} is not completed",
                    route.id
                )));
            }
            route.rating = Some(rating);
            Ok(())
        })?;

        let ticket = self.persist(RemoteWrite::Rate {
            route_id: route_id.to_string(),
            rating,
        });
        Ok((updated, ticket))
    }

    /// Replaces the visible collection with `authoritative`, except for ids
    /// where `keep_local` says the local copy knows better.
    pub fn merge_authoritative(&self, authoritative: Vec<Route>, keep_local: impl Fn(&str) -> bool) {
        let incoming: std::collections::HashSet<String> =
            authoritative.iter().map(|route| route.id.clone()).collect();

        self.routes
            .retain(|id, _| incoming.contains(id) || keep_local(id));

        for mut route in authoritative {
            if keep_local(&route.id) && self.routes.contains_key(&route.id) {
                continue;
            }
            if self.outbox.has_pending_delete(&route.id) {
                continue;
            }
            self.outbox.overlay(&mut route);
            self.routes.insert(route.id.clone(), route);
        }
    }

    /// Local-only insert that bypasses the remote.
    pub fn upsert_local(&self, route: Route) {
        self.routes.insert(route.id.clone(), route);
    }

    fn mutate(
        &self,
        route_id: &str,
        apply: impl FnOnce(&mut Route) -> Result<(), AppError>,
    ) -> Result<Route, AppError> {
        let mut entry = self
            .routes
            .get_mut(route_id)
            .ok_or_else(|| AppError::NotFound(format!("route {route_id} not found")))?;

        let mut draft = entry.clone();
        apply(&mut draft)?;
        *entry = draft.clone();
        Ok(draft)
    }

    fn persist(&self, write: RemoteWrite) -> WriteTicket {
        let operation = Operation::of(&write);
        let route_id = write.route_id().to_string();
        let remote = self.remote.clone();
        let outbox = self.outbox.clone();
        let metrics = self.metrics.clone();
        let tails = self.write_tails.clone();

        let seq = self.write_seq.fetch_add(1, Ordering::Relaxed);
        let (done_tx, done_rx) = oneshot::channel();
        let earlier = tails.insert(route_id.clone(), (seq, done_rx));

        let handle = tokio::spawn(async move {
            if let Some((_, earlier_done)) = earlier {
                let _ = earlier_done.await;
            }

            let outcome = if outbox.has_pending_for(&route_id) {
                debug!(
                    route_id = %route_id,
                    operation = operation.label(),
                    "earlier write still queued; deferring"
                );
                metrics
                    .mutations_total
                    .with_label_values(&[operation.label(), "deferred"])
                    .inc();
                outbox.defer(write);
                WriteOutcome::Deferred
            } else {
                match write.apply(remote.as_ref()).await {
                    Ok(()) => {
                        metrics
                            .mutations_total
                            .with_label_values(&[operation.label(), "persisted"])
                            .inc();
                        WriteOutcome::Persisted
                    }
                    Err(err) => {
                        debug_assert_eq!(operation.policy(), OnFailure::KeepLocal);
                        warn!(
                            route_id = %route_id,
                            operation = operation.label(),
                            error = %err,
                            "remote write failed; keeping local state and queueing retry"
                        );
                        metrics
                            .mutations_total
                            .with_label_values(&[operation.label(), "queued"])
                            .inc();
                        outbox.push(write, &err);
                        WriteOutcome::Queued(err)
                    }
                }
            };

            tails.remove_if(&route_id, |_, (tail, _)| *tail == seq);
            let _ = done_tx.send(());
            outcome
        });

        WriteTicket { handle }
    }

    fn count(&self, operation: Operation, outcome: &str) {
        self.metrics
            .mutations_total
            .with_label_values(&[operation.label(), outcome])
            .inc();
    }
}

fn ensure_transition(route: &Route, to: RouteStatus) -> Result<(), AppError> {
    if route.status.can_transition_to(to) {
        Ok(())
    } else {
        Err(AppError::InvalidTransition {
            route_id: route.id.clone(),
            from: route.status,
            to,
        })
    }
}
