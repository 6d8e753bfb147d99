//! SQLite-backed incident and approval store.
//!
//! Queries run on the blocking pool. Updates are column-wise `COALESCE`, so
//! concurrent incidents never overwrite each other's fields and a repeated
//! write of the same transition is harmless.

use super::{fmt_ts, open_pool, parse_ts, IncidentStore, Pool, StoreError};
use crate::action::{ActionName, ActionProposal, ProposalSource};
use crate::executor::ExecutionResult;
use crate::gate::{ApprovalStore, ApprovalToken, Decision, GateDecision};
use crate::incident::{Incident, IncidentId, IncidentUpdate, Outcome, PipelineState};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::fmt::Display;
use uuid::Uuid;

const SELECT_INCIDENT: &str = "SELECT id, log_line, line_received_at, detected_at, state, summary,
        action, action_source, action_raw, fallback_reason, summary_latency_ms,
        decision, decision_reason, decided_at, outcome, exit_code, stdout_tail,
        exec_duration_ms, finished_at
     FROM incidents";

#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Open (or create) the database file and run migrations.
    pub fn open(path: &str) -> anyhow::Result<Self> {
        Ok(Self::new(open_pool(path)?))
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            f(&conn)
        })
        .await?
    }
}

/// Column values for one write. `None` means "leave as is" on update.
#[derive(Default)]
struct Columns {
    state: Option<String>,
    summary: Option<String>,
    action: Option<String>,
    action_source: Option<String>,
    action_raw: Option<String>,
    fallback_reason: Option<String>,
    summary_latency_ms: Option<i64>,
    decision: Option<String>,
    decision_reason: Option<String>,
    decided_at: Option<String>,
    outcome: Option<String>,
    exit_code: Option<i64>,
    stdout_tail: Option<String>,
    exec_duration_ms: Option<i64>,
    finished_at: Option<String>,
}

impl From<&IncidentUpdate> for Columns {
    fn from(u: &IncidentUpdate) -> Self {
        Self {
            state: u.state.map(|s| s.as_str().to_string()),
            summary: u.summary.clone(),
            action: u.action.as_ref().map(|a| a.name.as_str().to_string()),
            action_source: u.action.as_ref().map(|a| a.source.to_string()),
            action_raw: u.action.as_ref().and_then(|a| a.raw.clone()),
            fallback_reason: u.fallback_reason.clone(),
            summary_latency_ms: u.summary_latency_ms.map(|v| v as i64),
            decision: u.decision.as_ref().map(|d| d.decision.as_str().to_string()),
            decision_reason: u.decision.as_ref().map(|d| d.reason.clone()),
            decided_at: u.decision.as_ref().map(|d| fmt_ts(d.decided_at)),
            outcome: u.outcome.map(|o| o.as_str().to_string()),
            exit_code: u.execution.as_ref().map(|e| i64::from(e.exit_code)),
            stdout_tail: u.execution.as_ref().map(|e| e.stdout_tail.clone()),
            exec_duration_ms: u.execution.as_ref().map(|e| e.duration_ms as i64),
            finished_at: u.finished_at.map(fmt_ts),
        }
    }
}

/// Raw column values as read back.
struct IncidentRow {
    id: String,
    log_line: String,
    line_received_at: String,
    detected_at: String,
    state: String,
    summary: Option<String>,
    action: Option<String>,
    action_source: Option<String>,
    action_raw: Option<String>,
    fallback_reason: Option<String>,
    summary_latency_ms: Option<i64>,
    decision: Option<String>,
    decision_reason: Option<String>,
    decided_at: Option<String>,
    outcome: String,
    exit_code: Option<i64>,
    stdout_tail: Option<String>,
    exec_duration_ms: Option<i64>,
    finished_at: Option<String>,
}

impl IncidentRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            log_line: row.get(1)?,
            line_received_at: row.get(2)?,
            detected_at: row.get(3)?,
            state: row.get(4)?,
            summary: row.get(5)?,
            action: row.get(6)?,
            action_source: row.get(7)?,
            action_raw: row.get(8)?,
            fallback_reason: row.get(9)?,
            summary_latency_ms: row.get(10)?,
            decision: row.get(11)?,
            decision_reason: row.get(12)?,
            decided_at: row.get(13)?,
            outcome: row.get(14)?,
            exit_code: row.get(15)?,
            stdout_tail: row.get(16)?,
            exec_duration_ms: row.get(17)?,
            finished_at: row.get(18)?,
        })
    }

    fn into_incident(self) -> Result<Incident, StoreError> {
        let detected_at = parse_ts(&self.detected_at)?;

        let action = match self.action {
            Some(name) => Some(ActionProposal {
                name: name.parse::<ActionName>().map_err(corrupt)?,
                source: self
                    .action_source
                    .as_deref()
                    .unwrap_or("model")
                    .parse::<ProposalSource>()
                    .map_err(corrupt)?,
                raw: self.action_raw,
            }),
            None => None,
        };

        let decision = match self.decision {
            Some(d) => Some(GateDecision {
                decision: d.parse::<Decision>().map_err(corrupt)?,
                reason: self.decision_reason.unwrap_or_default(),
                decided_at: self
                    .decided_at
                    .as_deref()
                    .map(parse_ts)
                    .transpose()?
                    .unwrap_or(detected_at),
            }),
            None => None,
        };

        let execution = self.exit_code.map(|code| ExecutionResult {
            exit_code: code as i32,
            stdout_tail: self.stdout_tail.unwrap_or_default(),
            duration_ms: self.exec_duration_ms.unwrap_or(0).max(0) as u64,
        });

        Ok(Incident {
            id: Uuid::parse_str(&self.id).map_err(corrupt)?,
            log_line: self.log_line,
            line_received_at: parse_ts(&self.line_received_at)?,
            detected_at,
            state: self.state.parse::<PipelineState>().map_err(corrupt)?,
            summary: self.summary,
            action,
            fallback_reason: self.fallback_reason,
            summary_latency_ms: self.summary_latency_ms.map(|v| v.max(0) as u64),
            decision,
            execution,
            outcome: self.outcome.parse::<Outcome>().map_err(corrupt)?,
            finished_at: self.finished_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}

fn corrupt(e: impl Display) -> StoreError {
    StoreError::Corrupt(e.to_string())
}

#[async_trait::async_trait]
impl IncidentStore for SqliteStore {
    async fn put_incident(&self, incident: &Incident) -> Result<IncidentId, StoreError> {
        let id = incident.id;
        let log_line = incident.log_line.clone();
        let line_received_at = fmt_ts(incident.line_received_at);
        let detected_at = fmt_ts(incident.detected_at);
        let c = Columns::from(&IncidentUpdate::snapshot(incident));

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO incidents (id, log_line, line_received_at, detected_at, state,
                    summary, action, action_source, action_raw, fallback_reason,
                    summary_latency_ms, decision, decision_reason, decided_at, outcome,
                    exit_code, stdout_tail, exec_duration_ms, finished_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                         ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)
                 ON CONFLICT(id) DO UPDATE SET
                    state = excluded.state,
                    summary = excluded.summary,
                    action = excluded.action,
                    action_source = excluded.action_source,
                    action_raw = excluded.action_raw,
                    fallback_reason = excluded.fallback_reason,
                    summary_latency_ms = excluded.summary_latency_ms,
                    decision = excluded.decision,
                    decision_reason = excluded.decision_reason,
                    decided_at = excluded.decided_at,
                    outcome = excluded.outcome,
                    exit_code = excluded.exit_code,
                    stdout_tail = excluded.stdout_tail,
                    exec_duration_ms = excluded.exec_duration_ms,
                    finished_at = excluded.finished_at,
                    updated_at = excluded.updated_at",
                params![
                    id.to_string(),
                    log_line,
                    line_received_at,
                    detected_at,
                    c.state,
                    c.summary,
                    c.action,
                    c.action_source,
                    c.action_raw,
                    c.fallback_reason,
                    c.summary_latency_ms,
                    c.decision,
                    c.decision_reason,
                    c.decided_at,
                    c.outcome,
                    c.exit_code,
                    c.stdout_tail,
                    c.exec_duration_ms,
                    c.finished_at,
                    fmt_ts(Utc::now()),
                ],
            )?;
            Ok(id)
        })
        .await
    }

    async fn update_incident(
        &self,
        id: IncidentId,
        update: &IncidentUpdate,
    ) -> Result<(), StoreError> {
        let c = Columns::from(update);

        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE incidents SET
                    state = COALESCE(?2, state),
                    summary = COALESCE(?3, summary),
                    action = COALESCE(?4, action),
                    action_source = COALESCE(?5, action_source),
                    action_raw = COALESCE(?6, action_raw),
                    fallback_reason = COALESCE(?7, fallback_reason),
                    summary_latency_ms = COALESCE(?8, summary_latency_ms),
                    decision = COALESCE(?9, decision),
                    decision_reason = COALESCE(?10, decision_reason),
                    decided_at = COALESCE(?11, decided_at),
                    outcome = COALESCE(?12, outcome),
                    exit_code = COALESCE(?13, exit_code),
                    stdout_tail = COALESCE(?14, stdout_tail),
                    exec_duration_ms = COALESCE(?15, exec_duration_ms),
                    finished_at = COALESCE(?16, finished_at),
                    updated_at = ?17
                 WHERE id = ?1",
                params![
                    id.to_string(),
                    c.state,
                    c.summary,
                    c.action,
                    c.action_source,
                    c.action_raw,
                    c.fallback_reason,
                    c.summary_latency_ms,
                    c.decision,
                    c.decision_reason,
                    c.decided_at,
                    c.outcome,
                    c.exit_code,
                    c.stdout_tail,
                    c.exec_duration_ms,
                    c.finished_at,
                    fmt_ts(Utc::now()),
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(id));
            }
            Ok(())
        })
        .await
    }

    async fn get_incident(&self, id: IncidentId) -> Result<Option<Incident>, StoreError> {
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    &format!("{SELECT_INCIDENT} WHERE id = ?1"),
                    params![id.to_string()],
                    IncidentRow::from_row,
                )
                .optional()?;
            row.map(IncidentRow::into_incident).transpose()
        })
        .await
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<Incident>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            let mut stmt =
                conn.prepare(&format!("{SELECT_INCIDENT} ORDER BY detected_at DESC LIMIT ?1"))?;
            let rows = stmt
                .query_map(params![limit], IncidentRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(IncidentRow::into_incident).collect()
        })
        .await
    }
}

#[async_trait::async_trait]
impl ApprovalStore for SqliteStore {
    async fn grant(&self, token: ApprovalToken) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO approvals (action, approved_by, granted_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    token.action.as_str(),
                    token.approved_by,
                    fmt_ts(token.granted_at),
                    token.expires_at.map(fmt_ts),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn lookup(
        &self,
        action: ActionName,
        now: DateTime<Utc>,
    ) -> Result<Option<ApprovalToken>, StoreError> {
        self.with_conn(move |conn| {
            let row: Option<(String, String, Option<String>)> = conn
                .query_row(
                    "SELECT approved_by, granted_at, expires_at FROM approvals
                     WHERE action = ?1 AND (expires_at IS NULL OR expires_at > ?2)
                     ORDER BY granted_at DESC, id DESC
                     LIMIT 1",
                    params![action.as_str(), fmt_ts(now)],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;

            row.map(|(approved_by, granted_at, expires_at)| {
                Ok(ApprovalToken {
                    action,
                    approved_by,
                    granted_at: parse_ts(&granted_at)?,
                    expires_at: expires_at.as_deref().map(parse_ts).transpose()?,
                })
            })
            .transpose()
        })
        .await
    }
}
