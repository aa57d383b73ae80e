//! Control plan queue. The public API for enqueuing and managing checksheets.
//!
//! The queue owns the storage and enforces the per-workcenter invariant:
//! for every (tenant, workcenter) pair at most one checksheet is active at
//! any instant. Enqueue and promotion run inside single transactions so two
//! concurrent callers cannot both observe "no active" and both claim the
//! slot; the storage layer's partial unique index backstops the invariant.

use chrono::{Duration, Utc};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::*;
use crate::storage::Storage;

/// Default retention for purge: inactive checksheets older than this go away.
pub const DEFAULT_RETENTION_DAYS: i64 = 7;

/// The checksheet queue. Owns all persisted state and the invariants on it.
pub struct ControlPlanQueue {
    storage: Storage,
}

impl ControlPlanQueue {
    /// Create a queue with in-memory storage (for testing).
    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            storage: Storage::in_memory()?,
        })
    }

    /// Create a queue backed by a file.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Ok(Self {
            storage: Storage::open(path)?,
        })
    }

    /// Enqueue a checksheet for a workcenter.
    ///
    /// If the workcenter has no active checksheet the new one goes straight
    /// to active; otherwise it waits in line. The look-then-create runs in
    /// one transaction — concurrent enqueues for an idle workcenter cannot
    /// both come out active.
    pub fn enqueue(&mut self, new: NewControlPlan) -> Result<ControlPlan> {
        let now = Utc::now();
        let id = PlanId::new();

        let plan = self.storage.with_transaction(|ctx| {
            let current = ctx.find_active(&new.tenant_id, &new.workcenter_key)?;

            let plan = ControlPlan {
                id,
                tenant_id: new.tenant_id.clone(),
                workcenter_key: new.workcenter_key.clone(),
                workcenter_code: new.workcenter_code.clone(),
                header: new.header.clone(),
                active: current.is_none(),
                skip: false,
                complete: false,
                created_at: now,
                updated_at: now,
            };
            ctx.insert_plan(&plan)?;
            Ok(plan)
        })?;

        info!(
            id = %plan.id,
            tenant = %plan.tenant_id,
            workcenter = %plan.workcenter_key,
            active = plan.active,
            "checksheet enqueued"
        );
        Ok(plan)
    }

    /// Get a checksheet by ID.
    pub fn get(&self, id: PlanId) -> Result<ControlPlan> {
        self.storage.get_plan(id)
    }

    /// Apply a field patch. Fails with NotFound when nothing was affected —
    /// the patch is never assumed to have succeeded silently.
    pub fn patch_fields(&mut self, id: PlanId, patch: PlanPatch) -> Result<u64> {
        let affected = self.storage.patch_plan(id, &patch)?;
        if affected == 0 {
            return Err(Error::NotFound(format!("control plan {id}")));
        }
        debug!(id = %id, affected, "checksheet patched");
        Ok(affected)
    }

    /// Promote the oldest waiting checksheet for a workcenter to active.
    ///
    /// The scope is deliberately part of the signature: promotion always
    /// stays on the workcenter whose checksheet just finished. Returns None
    /// when nothing is waiting. If the workcenter still has an active
    /// checksheet this is a conflict — the caller's transition did not
    /// release the slot — and it is surfaced, not resolved by picking one.
    pub fn promote_oldest_queued(
        &mut self,
        tenant_id: &str,
        workcenter_key: &str,
    ) -> Result<Option<ControlPlan>> {
        let tenant = tenant_id.to_string();
        let workcenter = workcenter_key.to_string();

        let promoted = self.storage.with_transaction(|ctx| {
            if let Some(current) = ctx.find_active(&tenant, &workcenter)? {
                return Err(Error::Conflict(format!(
                    "cannot promote on {tenant}/{workcenter}: {} is still active",
                    current.id
                )));
            }

            let Some(next) = ctx.oldest_queued(&tenant, &workcenter)? else {
                return Ok(None);
            };

            ctx.patch_plan(
                next.id,
                &PlanPatch {
                    active: Some(true),
                    ..Default::default()
                },
            )?;
            ctx.get_plan(next.id).map(Some)
        })?;

        if let Some(ref plan) = promoted {
            info!(
                id = %plan.id,
                workcenter = %plan.workcenter_key,
                "checksheet promoted to active"
            );
        }
        Ok(promoted)
    }

    /// Oldest not-complete, not-skipped checksheet for a workcenter —
    /// "what's next" without mutating.
    pub fn first_in_queue(
        &self,
        tenant_id: &str,
        workcenter_key: &str,
    ) -> Result<Option<ControlPlan>> {
        self.storage.first_in_queue(tenant_id, workcenter_key)
    }

    /// The active checksheet for a workcenter with its measurement backup.
    pub fn get_active(&self, tenant_id: &str, workcenter_key: &str) -> Result<Option<ActivePlan>> {
        let Some(plan) = self.storage.find_active(tenant_id, workcenter_key)? else {
            return Ok(None);
        };
        let lines = self.storage.get_lines(plan.id)?;
        Ok(Some(ActivePlan { plan, lines }))
    }

    /// List a tenant's queue, active items first within each workcenter.
    pub fn list_queue(&self, tenant_id: &str, filter: &QueueFilter) -> Result<Vec<ControlPlan>> {
        self.storage.list_queue(tenant_id, filter)
    }

    /// Delete inactive checksheets older than the retention window.
    /// Active checksheets survive regardless of age.
    pub fn purge(&mut self, tenant_id: &str, retention: Duration) -> Result<u64> {
        let cutoff = Utc::now() - retention;
        let deleted = self.storage.purge(tenant_id, cutoff)?;
        info!(tenant = tenant_id, deleted, "purged aged-out checksheets");
        Ok(deleted)
    }

    /// Back up in-progress measurements onto a checksheet.
    ///
    /// Find-or-create: the first write stores the lines verbatim; later
    /// writes merge by specification description — previously seen keys are
    /// overwritten in place keeping their position, new keys append at the
    /// end. Returns the full post-merge set. Measurement content is not
    /// validated here; that belongs to the upstream validators.
    pub fn upsert_lines(
        &mut self,
        plan_id: PlanId,
        new_lines: Vec<MeasurementLine>,
    ) -> Result<Vec<MeasurementLine>> {
        self.storage.with_transaction(|ctx| {
            // Confirm the plan exists before creating a backup for it.
            ctx.get_plan(plan_id)?;

            let merged = match ctx.get_lines(plan_id)? {
                None => new_lines,
                Some(mut existing) => {
                    for line in new_lines {
                        match existing
                            .iter_mut()
                            .find(|l| l.specification_description == line.specification_description)
                        {
                            Some(slot) => *slot = line,
                            None => existing.push(line),
                        }
                    }
                    existing
                }
            };

            ctx.put_lines(plan_id, &merged)?;
            Ok(merged)
        })
    }

    /// Header merge: rewrite the note on a checksheet, leaving the rest of
    /// the caller-owned header untouched.
    pub fn set_header_note(&mut self, id: PlanId, note: impl Into<String>) -> Result<ControlPlan> {
        let note = note.into();
        self.storage.with_transaction(|ctx| {
            let mut plan = ctx.get_plan(id)?;
            plan.header.note = Some(note.clone());
            ctx.update_header(id, &plan.header)?;
            ctx.get_plan(id)
        })
    }
}
