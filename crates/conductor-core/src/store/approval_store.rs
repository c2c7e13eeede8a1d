//! Store for approvals, decision records, and notification audit rows.
//!
//! Decisions are transactional: the append-only `DecisionRecord` and the
//! approval status flip commit as one atomic unit. Status transitions are
//! one-way; a resolved approval never returns to `pending`.

use chrono::Utc;
use rusqlite::OptionalExtension;
use uuid::Uuid;

use crate::db::Database;
use crate::error::CoreError;
use crate::models::approval::{
    Approval, ApprovalFilter, ApprovalPage, ApprovalStatus, ApprovalSummary, CreateApprovalInput,
    Decision, DecisionRecord, RiskLevel,
};

const APPROVAL_COLUMNS: &str = "id, run_id, step_id, prompt, context_snapshot, risk_level, \
     requested_at, timeout_seconds, expires_at, status, resolved_at, resolved_by, \
     auto_approve_after_timeout";

/// Resolver identity recorded when the expiry sweep auto-approves a gate.
pub const SYSTEM_AUTO_APPROVER: &str = "system:auto-approve";

enum DecideOutcome {
    Missing,
    NotPending(String),
    Done(DecisionRecord),
}

enum CancelOutcome {
    Missing,
    NotPending(String),
    Done,
}

#[derive(Clone)]
pub struct ApprovalStore {
    db: Database,
}

impl ApprovalStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a pending approval. At most one open approval may exist per
    /// (run, step) pair; a second create while one is pending is a conflict.
    pub async fn create(&self, input: CreateApprovalInput) -> Result<Approval, CoreError> {
        let now = Utc::now().timestamp_millis();
        let approval = Approval {
            id: Uuid::new_v4().to_string(),
            run_id: input.run_id,
            step_id: input.step_id,
            prompt: input.prompt,
            context_snapshot: input.context_snapshot,
            risk_level: input.risk_level,
            requested_at: now,
            timeout_seconds: input.timeout_seconds,
            expires_at: now + input.timeout_seconds * 1000,
            status: ApprovalStatus::Pending,
            resolved_at: None,
            resolved_by: None,
            auto_approve_after_timeout: input.auto_approve_after_timeout,
        };
        let ac = approval.clone();
        let conflict = self
            .db
            .with_conn_async(move |conn| {
                let tx = conn.transaction()?;
                let open: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM approvals \
                     WHERE run_id = ?1 AND step_id = ?2 AND status = 'pending'",
                    rusqlite::params![ac.run_id, ac.step_id],
                    |row| row.get(0),
                )?;
                if open > 0 {
                    return Ok(true);
                }
                tx.execute(
                    "INSERT INTO approvals (id, run_id, step_id, prompt, context_snapshot, \
                     risk_level, requested_at, timeout_seconds, expires_at, status, \
                     auto_approve_after_timeout) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'pending', ?10)",
                    rusqlite::params![
                        ac.id,
                        ac.run_id,
                        ac.step_id,
                        ac.prompt,
                        ac.context_snapshot.to_string(),
                        ac.risk_level.as_str(),
                        ac.requested_at,
                        ac.timeout_seconds,
                        ac.expires_at,
                        ac.auto_approve_after_timeout as i64,
                    ],
                )?;
                tx.commit()?;
                Ok(false)
            })
            .await?;
        if conflict {
            return Err(CoreError::Conflict(format!(
                "Open approval already exists for step {} of run {}",
                approval.step_id, approval.run_id
            )));
        }
        Ok(approval)
    }

    pub async fn get(&self, approval_id: &str) -> Result<Option<Approval>, CoreError> {
        let id = approval_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    &format!("SELECT {} FROM approvals WHERE id = ?1", APPROVAL_COLUMNS),
                    rusqlite::params![id],
                    row_to_approval,
                )
                .optional()
            })
            .await
    }

    /// The open approval for a (run, step) pair, if any.
    pub async fn find_open(
        &self,
        run_id: &str,
        step_id: &str,
    ) -> Result<Option<Approval>, CoreError> {
        let run_id = run_id.to_string();
        let step_id = step_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    &format!(
                        "SELECT {} FROM approvals \
                         WHERE run_id = ?1 AND step_id = ?2 AND status = 'pending'",
                        APPROVAL_COLUMNS
                    ),
                    rusqlite::params![run_id, step_id],
                    row_to_approval,
                )
                .optional()
            })
            .await
    }

    /// A standing approved decision for a (run, step) pair, if any. The most
    /// recent one wins when a pair was re-requested across resumes.
    pub async fn find_approved(
        &self,
        run_id: &str,
        step_id: &str,
    ) -> Result<Option<Approval>, CoreError> {
        let run_id = run_id.to_string();
        let step_id = step_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    &format!(
                        "SELECT {} FROM approvals \
                         WHERE run_id = ?1 AND step_id = ?2 AND status = 'approved' \
                         ORDER BY requested_at DESC LIMIT 1",
                        APPROVAL_COLUMNS
                    ),
                    rusqlite::params![run_id, step_id],
                    row_to_approval,
                )
                .optional()
            })
            .await
    }

    /// Append a decision record and resolve the approval, atomically.
    pub async fn decide(
        &self,
        approval_id: &str,
        decision: Decision,
        decided_by: &str,
        comment: Option<String>,
        reasoning: Option<String>,
    ) -> Result<DecisionRecord, CoreError> {
        let id = approval_id.to_string();
        let by = decided_by.to_string();
        let outcome = self
            .db
            .with_conn_async(move |conn| {
                let tx = conn.transaction()?;
                let status: Option<String> = tx
                    .query_row(
                        "SELECT status FROM approvals WHERE id = ?1",
                        rusqlite::params![id],
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(status) = status else {
                    return Ok(DecideOutcome::Missing);
                };
                if status != "pending" {
                    return Ok(DecideOutcome::NotPending(status));
                }

                let record = DecisionRecord {
                    id: Uuid::new_v4().to_string(),
                    approval_id: id.clone(),
                    decision,
                    comment,
                    reasoning,
                    decided_by: by.clone(),
                    decided_at: Utc::now().timestamp_millis(),
                };
                tx.execute(
                    "INSERT INTO approval_decisions \
                     (id, approval_id, decision, comment, reasoning, decided_by, decided_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![
                        record.id,
                        record.approval_id,
                        record.decision.as_str(),
                        record.comment,
                        record.reasoning,
                        record.decided_by,
                        record.decided_at,
                    ],
                )?;
                tx.execute(
                    "UPDATE approvals SET status = ?2, resolved_at = ?3, resolved_by = ?4 \
                     WHERE id = ?1",
                    rusqlite::params![id, record.decision.as_str(), record.decided_at, by],
                )?;
                tx.commit()?;
                Ok(DecideOutcome::Done(record))
            })
            .await?;

        match outcome {
            DecideOutcome::Missing => Err(CoreError::NotFound(format!(
                "Approval {} not found",
                approval_id
            ))),
            DecideOutcome::NotPending(status) => Err(CoreError::Conflict(format!(
                "Approval {} already resolved (status: {})",
                approval_id, status
            ))),
            DecideOutcome::Done(record) => Ok(record),
        }
    }

    /// Cancel a pending approval (used when the owning run aborts).
    pub async fn cancel(&self, approval_id: &str, cancelled_by: &str) -> Result<(), CoreError> {
        let id = approval_id.to_string();
        let by = cancelled_by.to_string();
        let outcome = self
            .db
            .with_conn_async(move |conn| {
                let status: Option<String> = conn
                    .query_row(
                        "SELECT status FROM approvals WHERE id = ?1",
                        rusqlite::params![id],
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(status) = status else {
                    return Ok(CancelOutcome::Missing);
                };
                if status != "pending" {
                    return Ok(CancelOutcome::NotPending(status));
                }
                conn.execute(
                    "UPDATE approvals SET status = 'cancelled', resolved_at = ?2, resolved_by = ?3 \
                     WHERE id = ?1",
                    rusqlite::params![id, Utc::now().timestamp_millis(), by],
                )?;
                Ok(CancelOutcome::Done)
            })
            .await?;

        match outcome {
            CancelOutcome::Missing => Err(CoreError::NotFound(format!(
                "Approval {} not found",
                approval_id
            ))),
            CancelOutcome::NotPending(status) => Err(CoreError::Conflict(format!(
                "Approval {} is not pending (status: {})",
                approval_id, status
            ))),
            CancelOutcome::Done => Ok(()),
        }
    }

    /// Pending approvals for a run (abort support).
    pub async fn list_pending_for_run(&self, run_id: &str) -> Result<Vec<Approval>, CoreError> {
        let run_id = run_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM approvals WHERE run_id = ?1 AND status = 'pending' \
                     ORDER BY requested_at",
                    APPROVAL_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![run_id], row_to_approval)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Bulk-transition pending approvals past their expiry.
    ///
    /// Rows with `auto_approve_after_timeout` become `approved` (with a
    /// decision record by the system resolver); the rest become `expired`.
    /// Returns the ids of all transitioned approvals.
    pub async fn sweep_expired(&self, now_ms: i64) -> Result<Vec<String>, CoreError> {
        self.db
            .with_conn_async(move |conn| {
                let tx = conn.transaction()?;
                let due: Vec<(String, bool)> = {
                    let mut stmt = tx.prepare(
                        "SELECT id, auto_approve_after_timeout FROM approvals \
                         WHERE status = 'pending' AND expires_at < ?1",
                    )?;
                    let rows = stmt
                        .query_map(rusqlite::params![now_ms], |row| {
                            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? != 0))
                        })?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows
                };

                let mut swept = Vec::with_capacity(due.len());
                for (id, auto_approve) in due {
                    if auto_approve {
                        tx.execute(
                            "UPDATE approvals SET status = 'approved', resolved_at = ?2, \
                             resolved_by = ?3 WHERE id = ?1",
                            rusqlite::params![id, now_ms, SYSTEM_AUTO_APPROVER],
                        )?;
                        tx.execute(
                            "INSERT INTO approval_decisions \
                             (id, approval_id, decision, comment, decided_by, decided_at) \
                             VALUES (?1, ?2, 'approved', 'auto-approved on timeout', ?3, ?4)",
                            rusqlite::params![
                                Uuid::new_v4().to_string(),
                                id,
                                SYSTEM_AUTO_APPROVER,
                                now_ms,
                            ],
                        )?;
                    } else {
                        tx.execute(
                            "UPDATE approvals SET status = 'expired', resolved_at = ?2 \
                             WHERE id = ?1",
                            rusqlite::params![id, now_ms],
                        )?;
                    }
                    swept.push(id);
                }
                tx.commit()?;
                Ok(swept)
            })
            .await
    }

    /// Paginated listing with summary counters.
    pub async fn list(&self, filter: ApprovalFilter) -> Result<ApprovalPage, CoreError> {
        let page = filter.page.max(1);
        let page_size = if filter.page_size == 0 { 20 } else { filter.page_size };
        let now = Utc::now();
        let now_ms = now.timestamp_millis();
        let today_start_ms = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp_millis())
            .unwrap_or(now_ms);

        self.db
            .with_conn_async(move |conn| {
                let mut where_clauses: Vec<String> = Vec::new();
                let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
                if let Some(run_id) = &filter.run_id {
                    params.push(Box::new(run_id.clone()));
                    where_clauses.push(format!("run_id = ?{}", params.len()));
                }
                if !filter.statuses.is_empty() {
                    let mut placeholders = Vec::new();
                    for status in &filter.statuses {
                        params.push(Box::new(status.as_str().to_string()));
                        placeholders.push(format!("?{}", params.len()));
                    }
                    where_clauses.push(format!("status IN ({})", placeholders.join(", ")));
                }
                let where_sql = if where_clauses.is_empty() {
                    String::new()
                } else {
                    format!("WHERE {}", where_clauses.join(" AND "))
                };

                let param_refs: Vec<&dyn rusqlite::ToSql> =
                    params.iter().map(|p| p.as_ref()).collect();

                let total: i64 = conn.query_row(
                    &format!("SELECT COUNT(*) FROM approvals {}", where_sql),
                    param_refs.as_slice(),
                    |row| row.get(0),
                )?;

                let offset = (page - 1) * page_size;
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM approvals {} ORDER BY requested_at DESC LIMIT {} OFFSET {}",
                    APPROVAL_COLUMNS, where_sql, page_size, offset
                ))?;
                let items = stmt
                    .query_map(param_refs.as_slice(), row_to_approval)?
                    .collect::<Result<Vec<_>, _>>()?;

                let pending: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM approvals WHERE status = 'pending'",
                    [],
                    |row| row.get(0),
                )?;
                let overdue: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM approvals WHERE status = 'pending' AND expires_at < ?1",
                    rusqlite::params![now_ms],
                    |row| row.get(0),
                )?;
                let approved_today: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM approvals \
                     WHERE status = 'approved' AND resolved_at >= ?1",
                    rusqlite::params![today_start_ms],
                    |row| row.get(0),
                )?;
                let rejected_today: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM approvals \
                     WHERE status = 'rejected' AND resolved_at >= ?1",
                    rusqlite::params![today_start_ms],
                    |row| row.get(0),
                )?;

                Ok(ApprovalPage {
                    items,
                    total,
                    page,
                    page_size,
                    summary: ApprovalSummary {
                        pending,
                        overdue,
                        approved_today,
                        rejected_today,
                    },
                })
            })
            .await
    }

    /// Latest decision record for an approval, if any.
    pub async fn latest_decision(
        &self,
        approval_id: &str,
    ) -> Result<Option<DecisionRecord>, CoreError> {
        let id = approval_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    "SELECT id, approval_id, decision, comment, reasoning, decided_by, decided_at \
                     FROM approval_decisions WHERE approval_id = ?1 \
                     ORDER BY decided_at DESC, rowid DESC LIMIT 1",
                    rusqlite::params![id],
                    row_to_decision,
                )
                .optional()
            })
            .await
    }

    /// Record a published notification (audit for the enriched count).
    pub async fn record_notification(
        &self,
        approval_id: &str,
        channel: &str,
    ) -> Result<(), CoreError> {
        let id = Uuid::new_v4().to_string();
        let approval_id = approval_id.to_string();
        let channel = channel.to_string();
        let now = Utc::now().timestamp_millis();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO approval_notifications (id, approval_id, channel, sent_at) \
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![id, approval_id, channel, now],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn notification_count(&self, approval_id: &str) -> Result<i64, CoreError> {
        let id = approval_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM approval_notifications WHERE approval_id = ?1",
                    rusqlite::params![id],
                    |row| row.get(0),
                )
            })
            .await
    }
}

fn row_to_approval(row: &rusqlite::Row<'_>) -> Result<Approval, rusqlite::Error> {
    let context_text: String = row.get(4)?;
    let risk: String = row.get(5)?;
    let status: String = row.get(9)?;
    Ok(Approval {
        id: row.get(0)?,
        run_id: row.get(1)?,
        step_id: row.get(2)?,
        prompt: row.get(3)?,
        context_snapshot: serde_json::from_str(&context_text)
            .unwrap_or(serde_json::Value::Null),
        risk_level: RiskLevel::parse(&risk).unwrap_or_default(),
        requested_at: row.get(6)?,
        timeout_seconds: row.get(7)?,
        expires_at: row.get(8)?,
        status: ApprovalStatus::parse(&status).unwrap_or(ApprovalStatus::Pending),
        resolved_at: row.get(10)?,
        resolved_by: row.get(11)?,
        auto_approve_after_timeout: row.get::<_, i64>(12)? != 0,
    })
}

fn row_to_decision(row: &rusqlite::Row<'_>) -> Result<DecisionRecord, rusqlite::Error> {
    let decision: String = row.get(2)?;
    Ok(DecisionRecord {
        id: row.get(0)?,
        approval_id: row.get(1)?,
        decision: Decision::parse(&decision).unwrap_or(Decision::Rejected),
        comment: row.get(3)?,
        reasoning: row.get(4)?,
        decided_by: row.get(5)?,
        decided_at: row.get(6)?,
    })
}
