//! The device's view of the route it is currently running. Injected where
//! needed; every change is written through to the local cache so a restart
//! mid-delivery picks up where it left off.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::warn;

use crate::cache::LocalCache;
use crate::models::location::LocationSample;
use crate::models::route::Route;

pub const SESSION_KEY: &str = "route_session";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionState {
    pub active_route: Option<Route>,
    pub elapsed_secs: u64,
    pub tracking_enabled: bool,
    pub gps_enabled: bool,
    pub awaiting_proof: bool,
    pub last_location: Option<LocationSample>,
    pub last_error: Option<String>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            active_route: None,
            elapsed_secs: 0,
            tracking_enabled: false,
            gps_enabled: true,
            awaiting_proof: false,
            last_location: None,
            last_error: None,
        }
    }
}

impl SessionState {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn active_route_id(&self) -> Option<&str> {
        self.active_route.as_ref().map(|route| route.id.as_str())
    }

    /// Drops everything tied to the active route; device preferences stay.
    pub fn clear_active(&mut self) {
        self.active_route = None;
        self.elapsed_secs = 0;
        self.tracking_enabled = false;
        self.awaiting_proof = false;
    }
}

pub struct SessionStore {
    cache: Arc<dyn LocalCache>,
    state: Mutex<SessionState>,
    observers: watch::Sender<SessionState>,
}

impl SessionStore {
    /// Restores the persisted session, falling back to a fresh one when the
    /// cached value is missing or unreadable.
    pub fn load(cache: Arc<dyn LocalCache>) -> Self {
        let restored = match cache.get(SESSION_KEY) {
            Ok(Some(raw)) => SessionState::from_json(&raw).unwrap_or_else(|err| {
                warn!(error = %err, "discarding unreadable session state");
                SessionState::default()
            }),
            Ok(None) => SessionState::default(),
            Err(err) => {
                warn!(error = %err, "failed to read session state");
                SessionState::default()
            }
        };

        let (observers, _unused_rx) = watch::channel(restored.clone());
        Self {
            cache,
            state: Mutex::new(restored),
            observers,
        }
    }

    pub fn snapshot(&self) -> SessionState {
        match self.state.lock() {
            Ok(state) => state.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.observers.subscribe()
    }

    /// Applies `change`, persists the result and notifies observers.
    pub fn update<R>(&self, change: impl FnOnce(&mut SessionState) -> R) -> R {
        let (result, next) = {
            let mut state = match self.state.lock() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            let result = change(&mut state);
            (result, state.clone())
        };

        self.persist(&next);
        self.observers.send_replace(next);
        result
    }

    pub fn tick(&self, seconds: u64) {
        if self.snapshot().active_route.is_none() {
            return;
        }
        self.update(|state| {
            if state.active_route.is_some() {
                state.elapsed_secs = state.elapsed_secs.saturating_add(seconds);
            }
        });
    }

    pub fn record_error(&self, message: impl Into<String>) {
        let message = message.into();
        self.update(|state| state.last_error = Some(message));
    }

    pub fn record_location(&self, sample: &LocationSample) {
        self.update(|state| state.last_location = Some(sample.clone()));
    }

    fn persist(&self, state: &SessionState) {
        let result = state
            .to_json()
            .map_err(|err| err.to_string())
            .and_then(|raw| {
                self.cache
                    .set(SESSION_KEY, &raw)
                    .map_err(|err| err.to_string())
            });

        if let Err(err) = result {
            warn!(error = %err, "failed to persist session state");
        }
    }
}
