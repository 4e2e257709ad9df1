use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::interval;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cache::{get_json, set_json, LocalCache};
use crate::models::route::{DeliveryProof, Route, RouteStatus};
use crate::observability::metrics::Metrics;
use crate::remote::{RemoteError, RemoteResult, RemoteStore};

pub const OUTBOX_KEY: &str = "pending_writes";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemoteWrite {
    UpdateStatus { route: Route },
    AttachProof { route_id: String, proof: DeliveryProof },
    Delete { route_id: String },
    Rate { route_id: String, rating: u8 },
}

impl RemoteWrite {
    pub fn route_id(&self) -> &str {
        match self {
            RemoteWrite::UpdateStatus { route } => &route.id,
            RemoteWrite::AttachProof { route_id, .. }
            | RemoteWrite::Delete { route_id }
            | RemoteWrite::Rate { route_id, .. } => route_id,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RemoteWrite::UpdateStatus { .. } => "status_change",
            RemoteWrite::AttachProof { .. } => "attach_proof",
            RemoteWrite::Delete { .. } => "delete",
            RemoteWrite::Rate { .. } => "rate",
        }
    }

    /// Replays the write onto a copy of the route, as the remote will look
    /// once this write lands.
    pub fn apply_local(&self, route: &mut Route) {
        match self {
            RemoteWrite::UpdateStatus { route: written } => {
                route.status = written.status;
                route.start_location = written.start_location;
                route.started_at = written.started_at;
            }
            RemoteWrite::AttachProof { proof, .. } => {
                route.status = RouteStatus::Completed;
                route.proof = Some(proof.clone());
            }
            RemoteWrite::Rate { rating, .. } => route.rating = Some(*rating),
            RemoteWrite::Delete { .. } => {}
        }
    }

    pub async fn apply(&self, remote: &dyn RemoteStore) -> RemoteResult<()> {
        match self {
            RemoteWrite::UpdateStatus { route } => remote.update_route_status(route).await,
            RemoteWrite::AttachProof { route_id, proof } => {
                remote.attach_proof(route_id, proof).await
            }
            RemoteWrite::Delete { route_id } => remote.delete_route(route_id).await,
            RemoteWrite::Rate { route_id, rating } => remote.rate_route(route_id, *rating).await,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingWrite {
    pub id: Uuid,
    pub write: RemoteWrite,
    pub attempts: u32,
    pub last_error: String,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlushReport {
    pub persisted: usize,
    pub dropped: usize,
    pub still_pending: usize,
}

/// Remote writes that failed under the keep-local policy. Mirrored to the
/// local cache on every change so a restart does not lose them.
pub struct Outbox {
    cache: Arc<dyn LocalCache>,
    entries: Mutex<Vec<PendingWrite>>,
    metrics: Metrics,
}

impl Outbox {
    pub fn load(cache: Arc<dyn LocalCache>, metrics: Metrics) -> Self {
        let entries: Vec<PendingWrite> = match get_json(cache.as_ref(), OUTBOX_KEY) {
            Ok(entries) => entries.unwrap_or_default(),
            Err(err) => {
                warn!(error = %err, "discarding unreadable outbox");
                Vec::new()
            }
        };

        if !entries.is_empty() {
            info!(pending = entries.len(), "restored pending remote writes");
        }
        metrics.pending_writes.set(entries.len() as i64);

        Self {
            cache,
            entries: Mutex::new(entries),
            metrics,
        }
    }

    pub fn push(&self, write: RemoteWrite, err: &RemoteError) {
        self.enqueue(write, 1, err.to_string());
    }

    /// Queues a write that was never attempted because an earlier write for
    /// the same route is still pending.
    pub fn defer(&self, write: RemoteWrite) {
        self.enqueue(write, 0, "waiting for an earlier write".to_string());
    }

    fn enqueue(&self, write: RemoteWrite, attempts: u32, last_error: String) {
        let mut entries = self.lock();
        entries.push(PendingWrite {
            id: Uuid::new_v4(),
            write,
            attempts,
            last_error,
            queued_at: Utc::now(),
        });
        self.persist(&entries);
    }

    pub fn pending(&self) -> Vec<PendingWrite> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_pending_for(&self, route_id: &str) -> bool {
        self.lock()
            .iter()
            .any(|pending| pending.write.route_id() == route_id)
    }

    pub fn has_pending_delete(&self, route_id: &str) -> bool {
        self.lock().iter().any(|pending| {
            matches!(&pending.write, RemoteWrite::Delete { route_id: id } if id == route_id)
        })
    }

    /// Ids of routes whose completing proof write is still queued.
    pub fn pending_completions(&self) -> Vec<String> {
        self.lock()
            .iter()
            .filter_map(|pending| match &pending.write {
                RemoteWrite::AttachProof { route_id, .. } => Some(route_id.clone()),
                _ => None,
            })
            .collect()
    }

    /// Applies every queued write for `route`, oldest first.
    pub fn overlay(&self, route: &mut Route) {
        for pending in self.lock().iter() {
            if pending.write.route_id() == route.id {
                pending.write.apply_local(route);
            }
        }
    }

    /// Retries every queued write once, oldest first. A failed write holds
    /// back later writes for the same route until the next round.
    pub async fn flush(&self, remote: &dyn RemoteStore) -> FlushReport {
        let snapshot = self.pending();
        let mut blocked: HashSet<String> = HashSet::new();
        let mut done: HashSet<Uuid> = HashSet::new();
        let mut failed: Vec<(Uuid, String)> = Vec::new();
        let mut report = FlushReport::default();

        for pending in snapshot {
            let route_id = pending.write.route_id().to_string();
            if blocked.contains(&route_id) {
                continue;
            }

            match pending.write.apply(remote).await {
                Ok(()) => {
                    report.persisted += 1;
                    done.insert(pending.id);
                }
                Err(err @ (RemoteError::NotFound(_) | RemoteError::Rejected(_))) => {
                    error!(
                        route_id = %route_id,
                        write = pending.write.label(),
                        error = %err,
                        "remote refused queued write; dropping it"
                    );
                    report.dropped += 1;
                    done.insert(pending.id);
                }
                Err(err) => {
                    blocked.insert(route_id);
                    failed.push((pending.id, err.to_string()));
                }
            }
        }

        let mut entries = self.lock();
        entries.retain(|pending| !done.contains(&pending.id));
        for (id, err) in failed {
            if let Some(pending) = entries.iter_mut().find(|pending| pending.id == id) {
                pending.attempts += 1;
                pending.last_error = err;
            }
        }
        report.still_pending = entries.len();
        self.persist(&entries);

        report
    }

    fn lock(&self) -> MutexGuard<'_, Vec<PendingWrite>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn persist(&self, entries: &[PendingWrite]) {
        self.metrics.pending_writes.set(entries.len() as i64);
        if let Err(err) = set_json(self.cache.as_ref(), OUTBOX_KEY, &entries) {
            warn!(error = %err, "failed to persist outbox");
        }
    }
}

pub async fn run_outbox_retry(outbox: Arc<Outbox>, remote: Arc<dyn RemoteStore>, every: Duration) {
    info!(interval_secs = every.as_secs(), "outbox retry loop started");
    let mut ticker = interval(every);

    loop {
        ticker.tick().await;
        if outbox.is_empty() {
            continue;
        }

        let report = outbox.flush(remote.as_ref()).await;
        info!(
            persisted = report.persisted,
            dropped = report.dropped,
            still_pending = report.still_pending,
            "outbox flushed"
        );
    }
}
