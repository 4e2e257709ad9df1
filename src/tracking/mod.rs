pub mod fanout;
pub mod filter;
pub mod sampler;
pub mod track_log;

use serde::{Deserialize, Serialize};

/// What a running sampler is attributed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingTarget {
    pub route_id: String,
    pub vehicle_id: Option<String>,
}
