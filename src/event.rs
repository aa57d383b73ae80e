//! Structured events broadcast to workcenter terminals on state changes.
//!
//! These are transient: written to whoever is connected at the moment and
//! never stored. A terminal connecting after an event simply does not see
//! it — reconnecting clients re-read queue state instead of replaying.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::PlanId;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    /// A checksheet joined the line behind the active one.
    PlanQueued {
        id: PlanId,
        workcenter_key: String,
        workcenter_code: String,
    },
    /// A checksheet took the workcenter's active slot, either on enqueue
    /// into an idle workcenter or by promotion.
    PlanActivated {
        id: PlanId,
        workcenter_key: String,
        workcenter_code: String,
    },
    PlanCompleted {
        id: PlanId,
        workcenter_key: String,
    },
    PlanSkipped {
        id: PlanId,
        workcenter_key: String,
    },
    /// In-progress measurements were backed up onto the active checksheet.
    LinesBackedUp {
        id: PlanId,
        workcenter_key: String,
        line_count: usize,
    },
}

/// First event pushed on every new stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectedEvent {
    pub connected: bool,
    #[serde(rename = "clientId")]
    pub client_id: String,
    pub channel: String,
}

/// Periodic keep-alive pushed to every subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatEvent {
    pub heartbeat: String,
    pub timestamp: DateTime<Utc>,
}

impl HeartbeatEvent {
    pub fn ping() -> Self {
        Self {
            heartbeat: "ping".to_string(),
            timestamp: Utc::now(),
        }
    }
}
