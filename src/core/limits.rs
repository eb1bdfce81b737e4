//! Engine safety limits (normative defaults).

use serde::{Deserialize, Serialize};

/// Limits are intentionally explicit about their units to avoid confusion.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Outstanding + unreconciled mutation records one engine tracks.
    pub max_tracked_records: usize,
    /// Items accepted from a single poll; oversize snapshots skip the cycle.
    pub max_snapshot_items: usize,

    pub max_status_subscribers: usize,
    pub status_queue_max_events: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_tracked_records: 256,
            max_snapshot_items: 10_000,
            max_status_subscribers: 32,
            status_queue_max_events: 1_024,
        }
    }
}
