//! Dispatch layer: store first, broadcast second.
//!
//! Every write goes through here in the same order — mutate the persisted
//! queue, then notify the workcenter's live subscribers. The two components
//! share no state; this sequencing is their only connection. The storage
//! lock is always released before the hub is awaited.

use std::sync::{Arc, Mutex};

use chrono::Duration;
use tracing::warn;

use crate::error::{Error, Result};
use crate::event::QueueEvent;
use crate::hub::BroadcastHub;
use crate::model::*;
use crate::queue::ControlPlanQueue;

pub struct Dispatcher {
    queue: Mutex<ControlPlanQueue>,
    hub: Arc<BroadcastHub>,
}

impl Dispatcher {
    pub fn new(queue: ControlPlanQueue, hub: Arc<BroadcastHub>) -> Self {
        Self {
            queue: Mutex::new(queue),
            hub,
        }
    }

    pub fn hub(&self) -> Arc<BroadcastHub> {
        Arc::clone(&self.hub)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ControlPlanQueue>> {
        self.queue
            .lock()
            .map_err(|_| Error::Other("queue lock poisoned".to_string()))
    }

    /// Enqueue a checksheet and notify its workcenter channel.
    pub async fn enqueue(&self, new: NewControlPlan) -> Result<ControlPlan> {
        let plan = self.lock()?.enqueue(new)?;

        let event = if plan.active {
            QueueEvent::PlanActivated {
                id: plan.id,
                workcenter_key: plan.workcenter_key.clone(),
                workcenter_code: plan.workcenter_code.clone(),
            }
        } else {
            QueueEvent::PlanQueued {
                id: plan.id,
                workcenter_key: plan.workcenter_key.clone(),
                workcenter_code: plan.workcenter_code.clone(),
            }
        };
        self.hub.broadcast(&plan.workcenter_key, &event).await;
        Ok(plan)
    }

    /// Finish the checksheet, promote the next one on the same workcenter,
    /// and notify. Returns the promoted plan, if any.
    pub async fn complete(&self, id: PlanId) -> Result<Option<ControlPlan>> {
        self.finish(id, PlanPatch::completed()).await
    }

    /// Skip the checksheet, promote the next one on the same workcenter,
    /// and notify. Returns the promoted plan, if any.
    pub async fn skip(&self, id: PlanId) -> Result<Option<ControlPlan>> {
        self.finish(id, PlanPatch::skipped()).await
    }

    async fn finish(&self, id: PlanId, patch: PlanPatch) -> Result<Option<ControlPlan>> {
        let skipped = patch.skip == Some(true);

        let (plan, promoted) = {
            let mut queue = self.lock()?;
            let plan = queue.get(id)?;
            queue.patch_fields(id, patch)?;
            // Only a slot holder releases the slot. Finishing an item that
            // was still waiting leaves the active checksheet alone, and
            // promotion stays on the finished checksheet's own workcenter —
            // another workcenter's queue must never absorb this slot.
            let promoted = if plan.active {
                queue.promote_oldest_queued(&plan.tenant_id, &plan.workcenter_key)?
            } else {
                None
            };
            (plan, promoted)
        };

        let event = if skipped {
            QueueEvent::PlanSkipped {
                id: plan.id,
                workcenter_key: plan.workcenter_key.clone(),
            }
        } else {
            QueueEvent::PlanCompleted {
                id: plan.id,
                workcenter_key: plan.workcenter_key.clone(),
            }
        };
        self.hub.broadcast(&plan.workcenter_key, &event).await;

        if let Some(ref next) = promoted {
            self.hub
                .broadcast(
                    &next.workcenter_key,
                    &QueueEvent::PlanActivated {
                        id: next.id,
                        workcenter_key: next.workcenter_key.clone(),
                        workcenter_code: next.workcenter_code.clone(),
                    },
                )
                .await;
        }
        Ok(promoted)
    }

    /// Back up in-progress measurements and notify the workcenter.
    pub async fn backup_lines(
        &self,
        id: PlanId,
        lines: Vec<MeasurementLine>,
    ) -> Result<Vec<MeasurementLine>> {
        let (plan, merged) = {
            let mut queue = self.lock()?;
            let plan = queue.get(id)?;
            let merged = queue.upsert_lines(id, lines)?;
            (plan, merged)
        };

        self.hub
            .broadcast(
                &plan.workcenter_key,
                &QueueEvent::LinesBackedUp {
                    id,
                    workcenter_key: plan.workcenter_key.clone(),
                    line_count: merged.len(),
                },
            )
            .await;
        Ok(merged)
    }

    /// Rewrite the note on a checksheet's header.
    pub fn set_header_note(&self, id: PlanId, note: impl Into<String>) -> Result<ControlPlan> {
        self.lock()?.set_header_note(id, note)
    }

    pub fn get(&self, id: PlanId) -> Result<ControlPlan> {
        self.lock()?.get(id)
    }

    pub fn get_active(&self, tenant_id: &str, workcenter_key: &str) -> Result<Option<ActivePlan>> {
        self.lock()?.get_active(tenant_id, workcenter_key)
    }

    pub fn first_in_queue(
        &self,
        tenant_id: &str,
        workcenter_key: &str,
    ) -> Result<Option<ControlPlan>> {
        self.lock()?.first_in_queue(tenant_id, workcenter_key)
    }

    pub fn list_queue(&self, tenant_id: &str, filter: &QueueFilter) -> Result<Vec<ControlPlan>> {
        self.lock()?.list_queue(tenant_id, filter)
    }

    /// Purge aged-out inactive checksheets. Failures propagate — retry
    /// scheduling belongs to the caller.
    pub fn purge(&self, tenant_id: &str, retention: Duration) -> Result<u64> {
        let deleted = self.lock()?.purge(tenant_id, retention)?;
        if deleted > 0 {
            warn!(tenant = tenant_id, deleted, "retention purge removed checksheets");
        }
        Ok(deleted)
    }
}
