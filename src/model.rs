//! Core data model.
//!
//! A control plan is one checksheet queued against a workcenter. It has
//! identity, tenant scope, a caller-owned header, and three workflow flags
//! (active / skip / complete) whose combinations form the queue lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Control Plan
// ---------------------------------------------------------------------------

/// One checksheet in a workcenter queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPlan {
    /// Unique identifier.
    pub id: PlanId,

    /// Customer/account scope. Queues never cross tenants.
    pub tenant_id: String,

    /// Workcenter this checksheet is queued against. Also the broadcast
    /// channel name for its state changes.
    pub workcenter_key: String,

    /// Display label for the workcenter.
    pub workcenter_code: String,

    /// Caller-owned header. The queue only ever rewrites `note`.
    pub header: PlanHeader,

    /// True for the single checksheet currently being worked at this
    /// workcenter. At most one active row per (tenant_id, workcenter_key).
    pub active: bool,

    /// Operator skipped this checksheet.
    pub skip: bool,

    /// Inspection finished.
    pub complete: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ControlPlan {
    /// Derived workflow state from the three flags.
    pub fn state(&self) -> WorkflowState {
        if self.complete {
            WorkflowState::Completed
        } else if self.skip {
            WorkflowState::Skipped
        } else if self.active {
            WorkflowState::Active
        } else {
            WorkflowState::Queued
        }
    }
}

/// Newtype for control plan IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlanId(pub Uuid);

impl PlanId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for PlanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for PlanId {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Workflow state
// ---------------------------------------------------------------------------

/// View of a plan's flag combination. The flags are the persisted truth;
/// this exists for display and filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    /// Waiting for the workcenter's current active checksheet to finish.
    Queued,
    /// Currently being worked.
    Active,
    /// Inspection done. Terminal for workflow, still purgeable.
    Completed,
    /// Operator skipped it. Terminal for workflow, still purgeable.
    Skipped,
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkflowState::Queued => "queued",
            WorkflowState::Active => "active",
            WorkflowState::Completed => "completed",
            WorkflowState::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// Control plan header supplied by the caller.
///
/// The fields the queue actually touches are explicit; everything else the
/// caller sends rides along in `extra` untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanHeader {
    #[serde(rename = "controlPlanNo", skip_serializing_if = "Option::is_none")]
    pub control_plan_no: Option<String>,

    #[serde(rename = "partNo", skip_serializing_if = "Option::is_none")]
    pub part_no: Option<String>,

    #[serde(rename = "primeOperation", skip_serializing_if = "Option::is_none")]
    pub prime_operation: Option<String>,

    #[serde(rename = "inspectionMode", skip_serializing_if = "Option::is_none")]
    pub inspection_mode: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Measurement lines
// ---------------------------------------------------------------------------

/// One in-progress measurement, keyed by its specification description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementLine {
    /// Merge key. Lines with the same description overwrite in place.
    #[serde(rename = "specificationDescription")]
    pub specification_description: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl MeasurementLine {
    pub fn new(specification_description: impl Into<String>) -> Self {
        Self {
            specification_description: specification_description.into(),
            value: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn value(mut self, value: serde_json::Value) -> Self {
        self.value = Some(value);
        self
    }
}

/// The active plan together with its backed-up measurement lines, if any.
#[derive(Debug, Clone, Serialize)]
pub struct ActivePlan {
    pub plan: ControlPlan,
    pub lines: Option<Vec<MeasurementLine>>,
}

// ---------------------------------------------------------------------------
// Patch
// ---------------------------------------------------------------------------

/// Field patch for a control plan. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct PlanPatch {
    pub active: Option<bool>,
    pub skip: Option<bool>,
    pub complete: Option<bool>,
    pub workcenter_code: Option<String>,
}

impl PlanPatch {
    pub fn is_empty(&self) -> bool {
        self.active.is_none()
            && self.skip.is_none()
            && self.complete.is_none()
            && self.workcenter_code.is_none()
    }

    /// The patch applied when a checksheet finishes: clears the active slot
    /// so the next queued item can be promoted.
    pub fn completed() -> Self {
        Self {
            active: Some(false),
            complete: Some(true),
            ..Default::default()
        }
    }

    /// The patch applied when an operator skips a checksheet.
    pub fn skipped() -> Self {
        Self {
            active: Some(false),
            skip: Some(true),
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Queue listing filter
// ---------------------------------------------------------------------------

/// Filter for queue listings. Empty `workcenter_keys` means all workcenters.
#[derive(Debug, Clone, Default)]
pub struct QueueFilter {
    pub workcenter_keys: Vec<String>,
    pub active: Option<bool>,
    pub complete: Option<bool>,
    pub skip: Option<bool>,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for enqueuing a checksheet. The queue's public submission API.
pub struct NewControlPlan {
    pub(crate) tenant_id: String,
    pub(crate) workcenter_key: String,
    pub(crate) workcenter_code: String,
    pub(crate) header: PlanHeader,
}

impl NewControlPlan {
    pub fn new(
        tenant_id: impl Into<String>,
        workcenter_key: impl Into<String>,
        workcenter_code: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            workcenter_key: workcenter_key.into(),
            workcenter_code: workcenter_code.into(),
            header: PlanHeader::default(),
        }
    }

    pub fn header(mut self, header: PlanHeader) -> Self {
        self.header = header;
        self
    }

    pub fn control_plan_no(mut self, no: impl Into<String>) -> Self {
        self.header.control_plan_no = Some(no.into());
        self
    }

    pub fn part_no(mut self, no: impl Into<String>) -> Self {
        self.header.part_no = Some(no.into());
        self
    }

    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.header.note = Some(note.into());
        self
    }
}
