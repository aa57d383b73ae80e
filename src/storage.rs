//! SQLite storage layer.
//!
//! Single source of truth for control plans and their measurement-line
//! backups. WAL mode for concurrent read access. All writes go through the
//! queue. The one-active-per-workcenter invariant is enforced here with a
//! partial unique index, so a locking failure above surfaces as a conflict
//! instead of silently producing two active rows.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, ToSql};

use crate::error::{Error, Result};
use crate::model::*;

/// Storage backend. Owns the SQLite connection.
pub struct Storage {
    conn: Connection,
}

/// Handle for performing storage operations within a transaction.
///
/// All methods delegate to the same SQL logic as `Storage`, but execute
/// against the transaction's connection. This ensures atomicity — either
/// all operations commit together or none do.
pub(crate) struct TxContext<'a> {
    tx: &'a Connection,
}

impl TxContext<'_> {
    pub fn insert_plan(&self, plan: &ControlPlan) -> Result<()> {
        insert_plan_on(self.tx, plan)
    }

    pub fn get_plan(&self, id: PlanId) -> Result<ControlPlan> {
        get_plan_on(self.tx, id)
    }

    pub fn find_active(&self, tenant_id: &str, workcenter_key: &str) -> Result<Option<ControlPlan>> {
        find_active_on(self.tx, tenant_id, workcenter_key)
    }

    pub fn oldest_queued(
        &self,
        tenant_id: &str,
        workcenter_key: &str,
    ) -> Result<Option<ControlPlan>> {
        oldest_queued_on(self.tx, tenant_id, workcenter_key)
    }

    pub fn patch_plan(&self, id: PlanId, patch: &PlanPatch) -> Result<u64> {
        patch_plan_on(self.tx, id, patch)
    }

    pub fn update_header(&self, id: PlanId, header: &PlanHeader) -> Result<u64> {
        update_header_on(self.tx, id, header)
    }

    pub fn get_lines(&self, plan_id: PlanId) -> Result<Option<Vec<MeasurementLine>>> {
        get_lines_on(self.tx, plan_id)
    }

    pub fn put_lines(&self, plan_id: PlanId, lines: &[MeasurementLine]) -> Result<()> {
        put_lines_on(self.tx, plan_id, lines)
    }
}

impl Storage {
    /// Open or create a database at the given path.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut storage = Self { conn };
        storage.init()?;
        Ok(storage)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut storage = Self { conn };
        storage.init()?;
        Ok(storage)
    }

    fn init(&mut self) -> Result<()> {
        // WAL mode for concurrent readers
        self.conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        self.conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS control_plans (
                id              TEXT PRIMARY KEY,
                tenant_id       TEXT NOT NULL,
                workcenter_key  TEXT NOT NULL,
                workcenter_code TEXT NOT NULL,
                header          TEXT NOT NULL DEFAULT '{}',
                active          INTEGER NOT NULL DEFAULT 0,
                skip            INTEGER NOT NULL DEFAULT 0,
                complete        INTEGER NOT NULL DEFAULT 0,
                created_at      TEXT NOT NULL,
                updated_at      TEXT NOT NULL
            );

            -- Invariant: at most one active checksheet per (tenant, workcenter).
            CREATE UNIQUE INDEX IF NOT EXISTS idx_one_active
                ON control_plans(tenant_id, workcenter_key) WHERE active = 1;

            CREATE INDEX IF NOT EXISTS idx_queued
                ON control_plans(tenant_id, workcenter_key, created_at)
                WHERE active = 0 AND skip = 0 AND complete = 0;

            CREATE INDEX IF NOT EXISTS idx_tenant ON control_plans(tenant_id);

            CREATE TABLE IF NOT EXISTS control_plan_lines (
                control_plan_id TEXT PRIMARY KEY REFERENCES control_plans(id),
                lines           TEXT NOT NULL DEFAULT '[]',
                updated_at      TEXT NOT NULL
            );
            ",
        )?;

        Ok(())
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    /// Execute a closure within a SQLite transaction.
    ///
    /// The transaction commits if the closure returns Ok, rolls back on Err.
    pub(crate) fn with_transaction<F, T>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut TxContext) -> Result<T>,
    {
        let tx = self.conn.transaction()?;
        let mut ctx = TxContext { tx: &tx };
        let result = f(&mut ctx)?;
        tx.commit()?;
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Control Plans
    // -----------------------------------------------------------------------

    /// Get a control plan by ID.
    pub fn get_plan(&self, id: PlanId) -> Result<ControlPlan> {
        get_plan_on(&self.conn, id)
    }

    /// The current active checksheet for a workcenter, if any.
    pub fn find_active(&self, tenant_id: &str, workcenter_key: &str) -> Result<Option<ControlPlan>> {
        find_active_on(&self.conn, tenant_id, workcenter_key)
    }

    /// Oldest not-complete, not-skipped item for a workcenter. Includes the
    /// active item — this answers "what's next" without mutating anything.
    pub fn first_in_queue(
        &self,
        tenant_id: &str,
        workcenter_key: &str,
    ) -> Result<Option<ControlPlan>> {
        let plan = self
            .conn
            .query_row(
                "SELECT * FROM control_plans
                 WHERE tenant_id = ?1 AND workcenter_key = ?2
                 AND complete = 0 AND skip = 0
                 ORDER BY created_at ASC LIMIT 1",
                params![tenant_id, workcenter_key],
                |row| Ok(row_to_plan(row)),
            )
            .optional()?;

        plan.transpose()
            .map_err(|e| Error::Other(format!("failed to parse control plan: {e}")))
    }

    /// Field patch. Returns the number of rows affected — zero means the
    /// plan does not exist and the caller must fail loudly, not assume
    /// success.
    pub fn patch_plan(&mut self, id: PlanId, patch: &PlanPatch) -> Result<u64> {
        patch_plan_on(&self.conn, id, patch)
    }

    /// List a tenant's queue. Active items surface first within each
    /// workcenter group, ties broken by age.
    pub fn list_queue(&self, tenant_id: &str, filter: &QueueFilter) -> Result<Vec<ControlPlan>> {
        let mut sql = String::from("SELECT * FROM control_plans WHERE tenant_id = ?");
        let mut values: Vec<Box<dyn ToSql>> = vec![Box::new(tenant_id.to_string())];

        if !filter.workcenter_keys.is_empty() {
            let placeholders = vec!["?"; filter.workcenter_keys.len()].join(", ");
            sql.push_str(&format!(" AND workcenter_key IN ({placeholders})"));
            for key in &filter.workcenter_keys {
                values.push(Box::new(key.clone()));
            }
        }
        for (column, flag) in [
            ("active", filter.active),
            ("complete", filter.complete),
            ("skip", filter.skip),
        ] {
            if let Some(v) = flag {
                sql.push_str(&format!(" AND {column} = ?"));
                values.push(Box::new(v));
            }
        }
        sql.push_str(" ORDER BY workcenter_key ASC, active DESC, created_at ASC");

        let param_refs: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();
        let mut stmt = self.conn.prepare(&sql)?;
        let plans = stmt
            .query_map(&param_refs[..], |row| Ok(row_to_plan(row)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut result = Vec::new();
        for plan in plans {
            result.push(plan.map_err(|e| Error::Other(format!("parse error: {e}")))?);
        }
        Ok(result)
    }

    /// Delete inactive plans older than the cutoff, line backups included.
    /// Active plans are never deleted regardless of age.
    pub fn purge(&mut self, tenant_id: &str, cutoff: DateTime<Utc>) -> Result<u64> {
        let tenant = tenant_id.to_string();
        self.with_transaction(|ctx| {
            ctx.tx.execute(
                "DELETE FROM control_plan_lines WHERE control_plan_id IN (
                     SELECT id FROM control_plans
                     WHERE tenant_id = ?1 AND active = 0 AND created_at < ?2
                 )",
                params![tenant, cutoff.to_rfc3339()],
            )?;
            let deleted = ctx.tx.execute(
                "DELETE FROM control_plans
                 WHERE tenant_id = ?1 AND active = 0 AND created_at < ?2",
                params![tenant, cutoff.to_rfc3339()],
            )?;
            Ok(deleted as u64)
        })
    }

    // -----------------------------------------------------------------------
    // Measurement lines
    // -----------------------------------------------------------------------

    /// Get the backed-up measurement lines for a plan, if any exist.
    pub fn get_lines(&self, plan_id: PlanId) -> Result<Option<Vec<MeasurementLine>>> {
        get_lines_on(&self.conn, plan_id)
    }
}

// ---------------------------------------------------------------------------
// Inner functions — accept &Connection so they work with both
// Connection (auto-commit) and Transaction (deref to Connection).
// ---------------------------------------------------------------------------

fn insert_plan_on(conn: &Connection, plan: &ControlPlan) -> Result<()> {
    let header = serde_json::to_string(&plan.header)
        .map_err(|e| Error::Other(format!("unserializable header for {}: {e}", plan.id)))?;
    conn.execute(
        "INSERT INTO control_plans (
            id, tenant_id, workcenter_key, workcenter_code, header,
            active, skip, complete, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            plan.id.0.to_string(),
            plan.tenant_id,
            plan.workcenter_key,
            plan.workcenter_code,
            header,
            plan.active,
            plan.skip,
            plan.complete,
            plan.created_at.to_rfc3339(),
            plan.updated_at.to_rfc3339(),
        ],
    )
    .map_err(|e| {
        map_active_conflict(e, format!("{}/{}", plan.tenant_id, plan.workcenter_key))
    })?;
    Ok(())
}

fn get_plan_on(conn: &Connection, id: PlanId) -> Result<ControlPlan> {
    conn.query_row(
        "SELECT * FROM control_plans WHERE id = ?1",
        params![id.0.to_string()],
        |row| Ok(row_to_plan(row)),
    )
    .optional()?
    .ok_or_else(|| Error::NotFound(format!("control plan {id}")))?
    .map_err(|e| Error::Other(format!("failed to parse control plan: {e}")))
}

fn find_active_on(
    conn: &Connection,
    tenant_id: &str,
    workcenter_key: &str,
) -> Result<Option<ControlPlan>> {
    conn.query_row(
        "SELECT * FROM control_plans
         WHERE tenant_id = ?1 AND workcenter_key = ?2 AND active = 1",
        params![tenant_id, workcenter_key],
        |row| Ok(row_to_plan(row)),
    )
    .optional()?
    .transpose()
    .map_err(|e| Error::Other(format!("failed to parse control plan: {e}")))
}

fn oldest_queued_on(
    conn: &Connection,
    tenant_id: &str,
    workcenter_key: &str,
) -> Result<Option<ControlPlan>> {
    conn.query_row(
        "SELECT * FROM control_plans
         WHERE tenant_id = ?1 AND workcenter_key = ?2
         AND active = 0 AND skip = 0 AND complete = 0
         ORDER BY created_at ASC LIMIT 1",
        params![tenant_id, workcenter_key],
        |row| Ok(row_to_plan(row)),
    )
    .optional()?
    .transpose()
    .map_err(|e| Error::Other(format!("failed to parse control plan: {e}")))
}

fn patch_plan_on(conn: &Connection, id: PlanId, patch: &PlanPatch) -> Result<u64> {
    if patch.is_empty() {
        return Err(Error::Other("empty patch".to_string()));
    }

    let mut sets: Vec<&str> = Vec::new();
    let mut values: Vec<Box<dyn ToSql>> = Vec::new();

    if let Some(active) = patch.active {
        sets.push("active = ?");
        values.push(Box::new(active));
    }
    if let Some(skip) = patch.skip {
        sets.push("skip = ?");
        values.push(Box::new(skip));
    }
    if let Some(complete) = patch.complete {
        sets.push("complete = ?");
        values.push(Box::new(complete));
    }
    if let Some(ref code) = patch.workcenter_code {
        sets.push("workcenter_code = ?");
        values.push(Box::new(code.clone()));
    }
    sets.push("updated_at = ?");
    values.push(Box::new(Utc::now().to_rfc3339()));
    values.push(Box::new(id.0.to_string()));

    let sql = format!(
        "UPDATE control_plans SET {} WHERE id = ?",
        sets.join(", ")
    );
    let param_refs: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();

    let affected = conn
        .execute(&sql, &param_refs[..])
        .map_err(|e| map_active_conflict(e, id))?;
    Ok(affected as u64)
}

fn update_header_on(conn: &Connection, id: PlanId, header: &PlanHeader) -> Result<u64> {
    let header = serde_json::to_string(header)
        .map_err(|e| Error::Other(format!("unserializable header for {id}: {e}")))?;
    let affected = conn.execute(
        "UPDATE control_plans SET header = ?1, updated_at = ?2 WHERE id = ?3",
        params![
            header,
            Utc::now().to_rfc3339(),
            id.0.to_string(),
        ],
    )?;
    Ok(affected as u64)
}

fn get_lines_on(conn: &Connection, plan_id: PlanId) -> Result<Option<Vec<MeasurementLine>>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT lines FROM control_plan_lines WHERE control_plan_id = ?1",
            params![plan_id.0.to_string()],
            |row| row.get(0),
        )
        .optional()?;

    match raw {
        Some(json) => {
            let lines = serde_json::from_str(&json)
                .map_err(|e| Error::Other(format!("corrupt line backup for {plan_id}: {e}")))?;
            Ok(Some(lines))
        }
        None => Ok(None),
    }
}

fn put_lines_on(conn: &Connection, plan_id: PlanId, lines: &[MeasurementLine]) -> Result<()> {
    let lines = serde_json::to_string(lines)
        .map_err(|e| Error::Other(format!("unserializable lines for {plan_id}: {e}")))?;
    conn.execute(
        "INSERT INTO control_plan_lines (control_plan_id, lines, updated_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT (control_plan_id) DO UPDATE SET lines = ?2, updated_at = ?3",
        params![
            plan_id.0.to_string(),
            lines,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Map a unique-index violation on idx_one_active to a conflict error.
/// Anything else passes through as a storage error.
fn map_active_conflict(e: rusqlite::Error, slot: impl std::fmt::Display) -> Error {
    match &e {
        rusqlite::Error::SqliteFailure(f, _) if f.code == ErrorCode::ConstraintViolation => {
            Error::Conflict(format!("a checksheet is already active for {slot}"))
        }
        _ => Error::Storage(e),
    }
}

// ---------------------------------------------------------------------------
// Row parsing helpers
// ---------------------------------------------------------------------------

fn row_to_plan(row: &rusqlite::Row) -> std::result::Result<ControlPlan, String> {
    let id_str: String = row.get(0).map_err(|e| e.to_string())?;
    let header_str: String = row.get(4).map_err(|e| e.to_string())?;
    let created_str: String = row.get(8).map_err(|e| e.to_string())?;
    let updated_str: String = row.get(9).map_err(|e| e.to_string())?;

    Ok(ControlPlan {
        id: PlanId(id_str.parse().map_err(|e: uuid::Error| e.to_string())?),
        tenant_id: row.get(1).map_err(|e| e.to_string())?,
        workcenter_key: row.get(2).map_err(|e| e.to_string())?,
        workcenter_code: row.get(3).map_err(|e| e.to_string())?,
        header: serde_json::from_str(&header_str).map_err(|e| format!("invalid header: {e}"))?,
        active: row.get(5).map_err(|e| e.to_string())?,
        skip: row.get(6).map_err(|e| e.to_string())?,
        complete: row.get(7).map_err(|e| e.to_string())?,
        created_at: created_str
            .parse()
            .map_err(|_| "invalid created_at".to_string())?,
        updated_at: updated_str
            .parse()
            .map_err(|_| "invalid updated_at".to_string())?,
    })
}

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

#[cfg(test)]
impl Storage {
    /// Rewrite a plan's created_at so age-based behavior can be tested.
    pub(crate) fn backdate(&mut self, id: PlanId, created_at: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "UPDATE control_plans SET created_at = ?1 WHERE id = ?2",
            params![created_at.to_rfc3339(), id.0.to_string()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(tenant: &str, wc: &str, active: bool) -> ControlPlan {
        let now = Utc::now();
        ControlPlan {
            id: PlanId::new(),
            tenant_id: tenant.to_string(),
            workcenter_key: wc.to_string(),
            workcenter_code: wc.to_string(),
            header: PlanHeader::default(),
            active,
            skip: false,
            complete: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn second_active_insert_is_a_conflict() {
        let mut storage = Storage::in_memory().unwrap();
        storage
            .with_transaction(|ctx| ctx.insert_plan(&plan("T", "W1", true)))
            .unwrap();

        let err = storage
            .with_transaction(|ctx| ctx.insert_plan(&plan("T", "W1", true)))
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn active_rows_allowed_across_workcenters_and_tenants() {
        let mut storage = Storage::in_memory().unwrap();
        storage
            .with_transaction(|ctx| {
                ctx.insert_plan(&plan("T", "W1", true))?;
                ctx.insert_plan(&plan("T", "W2", true))?;
                ctx.insert_plan(&plan("U", "W1", true))
            })
            .unwrap();
    }

    #[test]
    fn patch_activating_second_plan_is_a_conflict() {
        let mut storage = Storage::in_memory().unwrap();
        let queued = plan("T", "W1", false);
        let queued_id = queued.id;
        storage
            .with_transaction(|ctx| {
                ctx.insert_plan(&plan("T", "W1", true))?;
                ctx.insert_plan(&queued)
            })
            .unwrap();

        let err = storage
            .patch_plan(
                queued_id,
                &PlanPatch {
                    active: Some(true),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn corrupt_header_surfaces_instead_of_defaulting() {
        let mut storage = Storage::in_memory().unwrap();
        let p = plan("T", "W1", false);
        let id = p.id;
        storage.with_transaction(|ctx| ctx.insert_plan(&p)).unwrap();

        storage
            .conn
            .execute(
                "UPDATE control_plans SET header = 'not json' WHERE id = ?1",
                params![id.0.to_string()],
            )
            .unwrap();

        let err = storage.get_plan(id).unwrap_err();
        assert!(matches!(err, Error::Other(_)));
    }

    #[test]
    fn header_round_trips_with_extra_fields() {
        let mut storage = Storage::in_memory().unwrap();
        let mut p = plan("T", "W1", false);
        p.header.control_plan_no = Some("CP-100".to_string());
        p.header.note = Some("first article".to_string());
        p.header.extra.insert(
            "revision".to_string(),
            serde_json::Value::String("B".to_string()),
        );
        let id = p.id;
        storage.with_transaction(|ctx| ctx.insert_plan(&p)).unwrap();

        let loaded = storage.get_plan(id).unwrap();
        assert_eq!(loaded.header, p.header);
    }
}
