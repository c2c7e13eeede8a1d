//! Store for workflow runs, their steps, and checkpoints.
//!
//! Step transitions and checkpoint appends happen in one transaction so a
//! crash can never leave a step updated without a matching checkpoint.

use std::collections::HashMap;

use chrono::Utc;
use rusqlite::OptionalExtension;
use uuid::Uuid;

use crate::db::Database;
use crate::error::CoreError;
use crate::models::run::{
    Checkpoint, RunStatus, StepCheckpoint, StepKind, StepRow, StepSpec, StepStatus, WorkflowRun,
};

#[derive(Clone)]
pub struct RunStore {
    db: Database,
}

impl RunStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persist a new run with all its declared steps (status `pending`).
    pub async fn create_run(
        &self,
        specs: &[StepSpec],
        max_parallel: usize,
        working_directory: &str,
    ) -> Result<WorkflowRun, CoreError> {
        let run = WorkflowRun {
            id: Uuid::new_v4().to_string(),
            status: RunStatus::Pending,
            max_parallel,
            working_directory: working_directory.to_string(),
            created_at: Utc::now().timestamp_millis(),
            updated_at: Utc::now().timestamp_millis(),
        };
        let rc = run.clone();
        let specs: Vec<StepSpec> = specs.to_vec();
        self.db
            .with_conn_async(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO workflow_runs (id, status, max_parallel, working_directory, \
                     created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    rusqlite::params![
                        rc.id,
                        rc.status.as_str(),
                        rc.max_parallel as i64,
                        rc.working_directory,
                        rc.created_at,
                        rc.updated_at,
                    ],
                )?;
                for (pos, spec) in specs.iter().enumerate() {
                    tx.execute(
                        "INSERT INTO steps (run_id, id, position, kind, role, task, deps, payload, \
                         status, continue_on_error, created_at, updated_at) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending', ?9, ?10, ?10)",
                        rusqlite::params![
                            rc.id,
                            spec.id,
                            pos as i64,
                            spec.kind.tag(),
                            spec.role,
                            spec.task,
                            serde_json::to_string(&spec.deps).unwrap_or_else(|_| "[]".into()),
                            serde_json::to_string(&spec.kind).unwrap_or_else(|_| "{}".into()),
                            spec.continue_on_error as i64,
                            rc.created_at,
                        ],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(run)
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Option<WorkflowRun>, CoreError> {
        let id = run_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    "SELECT id, status, max_parallel, working_directory, created_at, updated_at \
                     FROM workflow_runs WHERE id = ?1",
                    rusqlite::params![id],
                    row_to_run,
                )
                .optional()
            })
            .await
    }

    pub async fn set_run_status(&self, run_id: &str, status: RunStatus) -> Result<(), CoreError> {
        let id = run_id.to_string();
        let now = Utc::now().timestamp_millis();
        let n = self
            .db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE workflow_runs SET status = ?2, updated_at = ?3 WHERE id = ?1",
                    rusqlite::params![id, status.as_str(), now],
                )
            })
            .await?;
        if n == 0 {
            return Err(CoreError::NotFound(format!("Run {} not found", run_id)));
        }
        Ok(())
    }

    pub async fn list_steps(&self, run_id: &str) -> Result<Vec<StepRow>, CoreError> {
        let id = run_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT run_id, id, position, kind, role, task, deps, payload, status, \
                     output, continuation_token, continue_on_error, created_at, updated_at \
                     FROM steps WHERE run_id = ?1 ORDER BY position",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![id], row_to_step)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Apply a step transition and append a checkpoint, atomically.
    ///
    /// `output` and `continuation_token` only overwrite when present, so a
    /// status-only transition never clobbers earlier results or tokens.
    pub async fn apply_transition(
        &self,
        run_id: &str,
        step_id: &str,
        status: StepStatus,
        output: Option<serde_json::Value>,
        continuation_token: Option<String>,
        frontier: &[String],
        step_state: &HashMap<String, StepCheckpoint>,
    ) -> Result<Checkpoint, CoreError> {
        let cp = Checkpoint {
            id: Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            frontier: frontier.to_vec(),
            step_state: step_state.clone(),
            created_at: Utc::now().timestamp_millis(),
        };
        let cpc = cp.clone();
        let run_id = run_id.to_string();
        let step_id = step_id.to_string();
        let output_text = output.map(|v| v.to_string());
        self.db
            .with_conn_async(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "UPDATE steps SET status = ?3, output = COALESCE(?4, output), \
                     continuation_token = COALESCE(?5, continuation_token), updated_at = ?6 \
                     WHERE run_id = ?1 AND id = ?2",
                    rusqlite::params![
                        run_id,
                        step_id,
                        status.as_str(),
                        output_text,
                        continuation_token,
                        cpc.created_at,
                    ],
                )?;
                tx.execute(
                    "INSERT INTO checkpoints (id, run_id, frontier, step_state, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![
                        cpc.id,
                        cpc.run_id,
                        serde_json::to_string(&cpc.frontier).unwrap_or_else(|_| "[]".into()),
                        serde_json::to_string(&cpc.step_state).unwrap_or_else(|_| "{}".into()),
                        cpc.created_at,
                    ],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(cp)
    }

    pub async fn get_checkpoint(&self, checkpoint_id: &str) -> Result<Option<Checkpoint>, CoreError> {
        let id = checkpoint_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    "SELECT id, run_id, frontier, step_state, created_at \
                     FROM checkpoints WHERE id = ?1",
                    rusqlite::params![id],
                    row_to_checkpoint,
                )
                .optional()
            })
            .await
    }

    pub async fn latest_checkpoint(&self, run_id: &str) -> Result<Option<Checkpoint>, CoreError> {
        let id = run_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    "SELECT id, run_id, frontier, step_state, created_at \
                     FROM checkpoints WHERE run_id = ?1 \
                     ORDER BY created_at DESC, rowid DESC LIMIT 1",
                    rusqlite::params![id],
                    row_to_checkpoint,
                )
                .optional()
            })
            .await
    }

    /// Rewind step rows to a checkpoint snapshot. Resume applies the latest
    /// checkpoint by default, or an explicitly chosen one.
    pub async fn apply_checkpoint(&self, cp: &Checkpoint) -> Result<(), CoreError> {
        let cp = cp.clone();
        self.db
            .with_conn_async(move |conn| {
                let tx = conn.transaction()?;
                let now = Utc::now().timestamp_millis();
                for (step_id, state) in &cp.step_state {
                    tx.execute(
                        "UPDATE steps SET status = ?3, \
                         continuation_token = COALESCE(?4, continuation_token), updated_at = ?5 \
                         WHERE run_id = ?1 AND id = ?2",
                        rusqlite::params![
                            cp.run_id,
                            step_id,
                            state.status.as_str(),
                            state.continuation_token,
                            now,
                        ],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
    }

    /// Delete a run and (via cascade) its steps and checkpoints.
    pub async fn delete_run(&self, run_id: &str) -> Result<bool, CoreError> {
        let id = run_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let n = conn.execute(
                    "DELETE FROM workflow_runs WHERE id = ?1",
                    rusqlite::params![id],
                )?;
                Ok(n > 0)
            })
            .await
    }
}

fn row_to_run(row: &rusqlite::Row<'_>) -> Result<WorkflowRun, rusqlite::Error> {
    let status: String = row.get(1)?;
    Ok(WorkflowRun {
        id: row.get(0)?,
        status: RunStatus::parse(&status).unwrap_or(RunStatus::Failed),
        max_parallel: row.get::<_, i64>(2)? as usize,
        working_directory: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn row_to_step(row: &rusqlite::Row<'_>) -> Result<StepRow, rusqlite::Error> {
    let deps_json: String = row.get(6)?;
    let payload_json: String = row.get(7)?;
    let status: String = row.get(8)?;
    let output_text: Option<String> = row.get(9)?;
    Ok(StepRow {
        run_id: row.get(0)?,
        id: row.get(1)?,
        position: row.get(2)?,
        kind: serde_json::from_str(&payload_json).unwrap_or(StepKind::Task),
        role: row.get(4)?,
        task: row.get(5)?,
        deps: serde_json::from_str(&deps_json).unwrap_or_default(),
        status: StepStatus::parse(&status).unwrap_or(StepStatus::Pending),
        output: output_text.and_then(|t| serde_json::from_str(&t).ok()),
        continuation_token: row.get(10)?,
        continue_on_error: row.get::<_, i64>(11)? != 0,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

fn row_to_checkpoint(row: &rusqlite::Row<'_>) -> Result<Checkpoint, rusqlite::Error> {
    let frontier_json: String = row.get(2)?;
    let state_json: String = row.get(3)?;
    Ok(Checkpoint {
        id: row.get(0)?,
        run_id: row.get(1)?,
        frontier: serde_json::from_str(&frontier_json).unwrap_or_default(),
        step_state: serde_json::from_str(&state_json).unwrap_or_default(),
        created_at: row.get(4)?,
    })
}
