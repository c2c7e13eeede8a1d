//! Workflow execution engine.
//!
//! Drives a declared step graph to completion: dependency scheduling under a
//! parallelism bound, branch/loop/approval step kinds, and a checkpoint
//! appended with every step transition so an interrupted run resumes without
//! re-executing finished work or losing continuation tokens.

pub mod template;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::approval::ApprovalGate;
use crate::error::CoreError;
use crate::events::{topics, EventBus};
use crate::models::{
    ApprovalStatus, Condition, CreateApprovalInput, ParallelTask, RiskLevel,
    RunSnapshot, RunStatus, StartOptions, StepCheckpoint, StepKind, StepRow, StepSpec, StepStatus,
    WorkflowRun,
};
use crate::session::SessionRegistry;
use crate::store::RunStore;

/// Result of one step execution, reported back to the drive loop.
enum StepOutcome {
    Completed {
        output: serde_json::Value,
        token: Option<String>,
    },
    /// Conditional steps complete and name the branch that lost.
    Branched {
        other: String,
        output: serde_json::Value,
    },
    Failed {
        error: String,
        token: Option<String>,
    },
    Aborted {
        token: Option<String>,
    },
}

#[derive(Clone)]
pub struct WorkflowEngine {
    store: RunStore,
    gate: ApprovalGate,
    sessions: SessionRegistry,
    bus: EventBus,
    approval_poll_ms: u64,
    cancels: Arc<RwLock<HashMap<String, CancellationToken>>>,
    handles: Arc<tokio::sync::Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl WorkflowEngine {
    pub fn new(
        store: RunStore,
        gate: ApprovalGate,
        sessions: SessionRegistry,
        bus: EventBus,
        approval_poll_ms: u64,
    ) -> Self {
        Self {
            store,
            gate,
            sessions,
            bus,
            approval_poll_ms,
            cancels: Arc::new(RwLock::new(HashMap::new())),
            handles: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
        }
    }

    /// Validate and persist a workflow, then launch its driver. Returns the
    /// run id immediately; execution proceeds in the background.
    pub async fn start(
        &self,
        specs: Vec<StepSpec>,
        options: StartOptions,
    ) -> Result<String, CoreError> {
        if options.max_parallel == 0 {
            return Err(CoreError::Validation("max_parallel must be at least 1".into()));
        }
        validate_graph(&specs)?;
        let run = self
            .store
            .create_run(&specs, options.max_parallel, &options.working_directory)
            .await?;
        tracing::info!(
            "[Engine] Starting run {} ({} step(s), max_parallel {})",
            run.id,
            specs.len(),
            options.max_parallel
        );
        let run_id = run.id.clone();
        self.launch(run).await?;
        Ok(run_id)
    }

    /// Resume an interrupted run. With `checkpoint_id`, step rows are first
    /// rewound to that snapshot; otherwise the current rows are used.
    /// Completed steps never re-execute; `running`/`aborted` steps are
    /// re-dispatched with their preserved continuation tokens.
    pub async fn resume(
        &self,
        run_id: &str,
        checkpoint_id: Option<&str>,
    ) -> Result<(), CoreError> {
        let mut run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("Run {} not found", run_id)))?;
        if self.is_active(run_id).await {
            return Err(CoreError::Conflict(format!("Run {} is already running", run_id)));
        }
        if run.status == RunStatus::Completed {
            return Err(CoreError::Conflict(format!("Run {} already completed", run_id)));
        }

        match checkpoint_id {
            Some(cp_id) => {
                let cp = self
                    .store
                    .get_checkpoint(cp_id)
                    .await?
                    .ok_or_else(|| {
                        CoreError::NotFound(format!("Checkpoint {} not found", cp_id))
                    })?;
                if cp.run_id != run_id {
                    return Err(CoreError::Validation(format!(
                        "Checkpoint {} belongs to a different run",
                        cp_id
                    )));
                }
                self.store.apply_checkpoint(&cp).await?;
            }
            None => {
                // Restore from the most recent checkpoint by default.
                if let Some(cp) = self.store.latest_checkpoint(run_id).await? {
                    self.store.apply_checkpoint(&cp).await?;
                }
            }
        }

        // Interrupted work becomes pending again; tokens stay on the rows.
        let steps = self.store.list_steps(run_id).await?;
        let mut snapshot = checkpoint_state(&steps);
        for step in &steps {
            if matches!(step.status, StepStatus::Running | StepStatus::Aborted) {
                snapshot.insert(
                    step.id.clone(),
                    StepCheckpoint {
                        status: StepStatus::Pending,
                        continuation_token: step.continuation_token.clone(),
                    },
                );
                self.store
                    .apply_transition(run_id, &step.id, StepStatus::Pending, None, None, &[], &snapshot)
                    .await?;
            }
        }

        tracing::info!("[Engine] Resuming run {}", run_id);
        run.status = RunStatus::Pending;
        self.launch(run).await
    }

    /// Request cooperative cancellation of a run. In-flight sessions are
    /// aborted, their steps recorded as `aborted` with the last continuation
    /// token, and every pending approval of the run is cancelled.
    pub async fn abort(&self, run_id: &str) -> Result<(), CoreError> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("Run {} not found", run_id)))?;

        if let Some(cancel) = self.cancels.read().await.get(run_id) {
            tracing::info!("[Engine] Aborting run {}", run_id);
            cancel.cancel();
            return Ok(());
        }

        // No live driver (e.g. process restart): settle the rows directly.
        if !run.status.is_terminal() {
            self.set_run_status(run_id, RunStatus::Aborted).await?;
            self.gate.cancel_for_run(run_id, "system:abort").await?;
        }
        Ok(())
    }

    /// Read-only projection of a run: header, step rows, and the current
    /// frontier (steps ready or in flight).
    pub async fn status(&self, run_id: &str) -> Result<RunSnapshot, CoreError> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("Run {} not found", run_id)))?;
        let steps = self.store.list_steps(run_id).await?;
        let status: HashMap<String, StepStatus> =
            steps.iter().map(|s| (s.id.clone(), s.status)).collect();
        let frontier = steps
            .iter()
            .filter(|s| {
                s.status == StepStatus::Running
                    || (s.status == StepStatus::Pending
                        && s.deps
                            .iter()
                            .all(|d| status.get(d) == Some(&StepStatus::Completed)))
            })
            .map(|s| s.id.clone())
            .collect();
        Ok(RunSnapshot { run, steps, frontier })
    }

    /// Wait for a run's driver to finish. Returns immediately when none is
    /// active.
    pub async fn join(&self, run_id: &str) -> Result<(), CoreError> {
        let handle = self.handles.lock().await.remove(run_id);
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!("[Engine] Run {} driver panicked: {}", run_id, e);
            }
        }
        Ok(())
    }

    async fn is_active(&self, run_id: &str) -> bool {
        self.cancels.read().await.contains_key(run_id)
    }

    async fn launch(&self, run: WorkflowRun) -> Result<(), CoreError> {
        self.set_run_status(&run.id, RunStatus::Running).await?;
        let cancel = CancellationToken::new();
        self.cancels
            .write()
            .await
            .insert(run.id.clone(), cancel.clone());

        let engine = self.clone();
        let run_id = run.id.clone();
        let handle = tokio::spawn(async move {
            let id = run.id.clone();
            engine.drive(run, cancel).await;
            engine.cancels.write().await.remove(&id);
        });
        self.handles.lock().await.insert(run_id, handle);
        Ok(())
    }

    async fn set_run_status(&self, run_id: &str, status: RunStatus) -> Result<(), CoreError> {
        self.store.set_run_status(run_id, status).await?;
        let payload = serde_json::json!({ "runId": run_id, "status": status });
        if let Err(e) = self.bus.emit(topics::RUN_STATUS, payload).await {
            tracing::warn!("[Engine] run-status emit failed: {}", e);
        }
        Ok(())
    }

    async fn drive(&self, run: WorkflowRun, cancel: CancellationToken) {
        let run_id = run.id.clone();
        match self.drive_inner(&run, &cancel).await {
            Ok(final_status) => {
                tracing::info!("[Engine] Run {} finished: {}", run_id, final_status.as_str());
            }
            Err(e) => {
                tracing::error!("[Engine] Run {} driver error: {}", run_id, e);
                let _ = self.set_run_status(&run_id, RunStatus::Failed).await;
                let _ = self.gate.cancel_for_run(&run_id, "system:failure").await;
            }
        }
    }

    async fn drive_inner(
        &self,
        run: &WorkflowRun,
        cancel: &CancellationToken,
    ) -> Result<RunStatus, CoreError> {
        let rows = self.store.list_steps(&run.id).await?;
        let order: Vec<String> = rows.iter().map(|s| s.id.clone()).collect();
        let specs: HashMap<String, StepRow> =
            rows.iter().map(|s| (s.id.clone(), s.clone())).collect();
        let mut status: HashMap<String, StepStatus> =
            rows.iter().map(|s| (s.id.clone(), s.status)).collect();
        let mut outputs: HashMap<String, serde_json::Value> = rows
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .filter_map(|s| s.output.clone().map(|o| (s.id.clone(), o)))
            .collect();
        let mut snapshot = checkpoint_state(&rows);

        let semaphore = Arc::new(Semaphore::new(run.max_parallel.max(1)));
        let (tx, mut rx) = mpsc::unbounded_channel::<(String, StepOutcome)>();
        let mut in_flight: HashSet<String> = HashSet::new();
        // Child token so a run failure stops step futures without marking
        // the run itself as externally aborted.
        let step_cancel = cancel.child_token();
        let mut run_failed = false;
        let mut abort_signaled = false;

        loop {
            // Skip propagation: a pending step whose dependency was skipped,
            // or failed with continue_on_error, can never run.
            loop {
                let mut changed = false;
                for id in &order {
                    if status[id] != StepStatus::Pending {
                        continue;
                    }
                    let spec = &specs[id];
                    let doomed = spec.deps.iter().any(|d| match status.get(d) {
                        Some(StepStatus::Skipped) => true,
                        Some(StepStatus::Failed) => specs[d].continue_on_error,
                        _ => false,
                    });
                    if doomed {
                        self.transition(
                            run, id, StepStatus::Skipped, None, None, &order, &specs,
                            &mut snapshot,
                        )
                        .await?;
                        status.insert(id.clone(), StepStatus::Skipped);
                        changed = true;
                    }
                }
                if !changed {
                    break;
                }
            }

            // Dispatch every ready step a permit is available for.
            if !run_failed && !cancel.is_cancelled() {
                for id in &order {
                    if status[id] != StepStatus::Pending || in_flight.contains(id) {
                        continue;
                    }
                    let spec = &specs[id];
                    if !spec
                        .deps
                        .iter()
                        .all(|d| status.get(d) == Some(&StepStatus::Completed))
                    {
                        continue;
                    }
                    let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                        break;
                    };
                    self.transition(
                        run, id, StepStatus::Running, None, None, &order, &specs,
                        &mut snapshot,
                    )
                    .await?;
                    status.insert(id.clone(), StepStatus::Running);
                    in_flight.insert(id.clone());

                    let engine = self.clone();
                    let run_c = run.clone();
                    let step = spec.clone();
                    let outputs_c = outputs.clone();
                    let step_cancel_c = step_cancel.clone();
                    let tx_c = tx.clone();
                    let id_c = id.clone();
                    tokio::spawn(async move {
                        let outcome = engine
                            .execute_step(&run_c, step, outputs_c, step_cancel_c)
                            .await;
                        drop(permit);
                        let _ = tx_c.send((id_c, outcome));
                    });
                }
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled(), if !abort_signaled => {
                    abort_signaled = true;
                    let roles = roles_of_steps(&specs, &in_flight);
                    self.sessions.abort_roles(&roles).await;
                    continue;
                }
                msg = rx.recv() => {
                    let Some((id, outcome)) = msg else { break };
                    in_flight.remove(&id);
                    let spec = &specs[&id];
                    match outcome {
                        StepOutcome::Completed { output, token } => {
                            outputs.insert(id.clone(), output.clone());
                            status.insert(id.clone(), StepStatus::Completed);
                            self.transition(
                                run, &id, StepStatus::Completed, Some(output), token,
                                &order, &specs, &mut snapshot,
                            )
                            .await?;
                        }
                        StepOutcome::Branched { other, output } => {
                            outputs.insert(id.clone(), output.clone());
                            status.insert(id.clone(), StepStatus::Completed);
                            self.transition(
                                run, &id, StepStatus::Completed, Some(output), None,
                                &order, &specs, &mut snapshot,
                            )
                            .await?;
                            if status.get(&other) == Some(&StepStatus::Pending) {
                                status.insert(other.clone(), StepStatus::Skipped);
                                self.transition(
                                    run, &other, StepStatus::Skipped, None, None,
                                    &order, &specs, &mut snapshot,
                                )
                                .await?;
                            }
                        }
                        StepOutcome::Failed { error, token } => {
                            tracing::warn!(
                                "[Engine] Step {} of run {} failed: {}",
                                id, run.id, error
                            );
                            status.insert(id.clone(), StepStatus::Failed);
                            self.transition(
                                run, &id, StepStatus::Failed,
                                Some(serde_json::json!({ "error": error })), token,
                                &order, &specs, &mut snapshot,
                            )
                            .await?;
                            if !spec.continue_on_error && !run_failed {
                                run_failed = true;
                                step_cancel.cancel();
                                let roles = roles_of_steps(&specs, &in_flight);
                                self.sessions.abort_roles(&roles).await;
                            }
                        }
                        StepOutcome::Aborted { token } => {
                            status.insert(id.clone(), StepStatus::Aborted);
                            self.transition(
                                run, &id, StepStatus::Aborted, None, token,
                                &order, &specs, &mut snapshot,
                            )
                            .await?;
                        }
                    }
                }
            }
        }

        // Any failed step fails the run, continue_on_error included: the
        // flag keeps independent branches executing, it does not make the
        // run a success.
        let final_status = if cancel.is_cancelled() {
            RunStatus::Aborted
        } else if run_failed || order.iter().any(|id| status[id] == StepStatus::Failed) {
            RunStatus::Failed
        } else if order
            .iter()
            .all(|id| matches!(status[id], StepStatus::Completed | StepStatus::Skipped))
        {
            RunStatus::Completed
        } else {
            // Pending steps remain but nothing can unblock them.
            tracing::error!("[Engine] Run {} stalled with unrunnable steps", run.id);
            RunStatus::Failed
        };

        if final_status != RunStatus::Completed {
            self.gate.cancel_for_run(&run.id, "system:abort").await?;
        }
        self.set_run_status(&run.id, final_status).await?;
        Ok(final_status)
    }

    /// Persist a step transition plus its checkpoint, and broadcast it.
    #[allow(clippy::too_many_arguments)]
    async fn transition(
        &self,
        run: &WorkflowRun,
        step_id: &str,
        status: StepStatus,
        output: Option<serde_json::Value>,
        token: Option<String>,
        order: &[String],
        specs: &HashMap<String, StepRow>,
        snapshot: &mut HashMap<String, StepCheckpoint>,
    ) -> Result<(), CoreError> {
        let entry = snapshot.entry(step_id.to_string()).or_insert(StepCheckpoint {
            status,
            continuation_token: None,
        });
        entry.status = status;
        if token.is_some() {
            entry.continuation_token = token.clone();
        }

        // Frontier mirrors status(): steps in flight plus pending steps
        // whose dependencies have all completed.
        let stat = |id: &str| snapshot.get(id).map(|s| s.status);
        let frontier: Vec<String> = order
            .iter()
            .filter(|id| match stat(id) {
                Some(StepStatus::Running) => true,
                Some(StepStatus::Pending) => specs[id.as_str()]
                    .deps
                    .iter()
                    .all(|d| stat(d) == Some(StepStatus::Completed)),
                _ => false,
            })
            .cloned()
            .collect();

        self.store
            .apply_transition(&run.id, step_id, status, output, token, &frontier, snapshot)
            .await?;

        let payload = serde_json::json!({
            "runId": run.id,
            "stepId": step_id,
            "status": status,
        });
        if let Err(e) = self.bus.emit(topics::STEP_STATUS, payload).await {
            tracing::warn!("[Engine] step-status emit failed: {}", e);
        }
        Ok(())
    }

    async fn execute_step(
        &self,
        run: &WorkflowRun,
        step: StepRow,
        outputs: HashMap<String, serde_json::Value>,
        cancel: CancellationToken,
    ) -> StepOutcome {
        match step.kind.clone() {
            StepKind::Task => {
                let vars = HashMap::new();
                self.run_task(run, &step.role, &step.task, &outputs, &vars, step.continuation_token.clone())
                    .await
            }
            StepKind::Parallel { tasks } => self.run_parallel(run, &tasks, &outputs).await,
            StepKind::Conditional {
                predicate,
                true_branch,
                false_branch,
            } => run_conditional(&predicate, &true_branch, &false_branch, &outputs),
            StepKind::Loop {
                items,
                loop_var,
                max_iterations,
            } => {
                self.run_loop(run, &step, &items, &loop_var, max_iterations, &outputs, &cancel)
                    .await
            }
            StepKind::HumanApproval {
                prompt,
                risk_level,
                timeout_seconds,
                auto_approve_after_timeout,
            } => {
                self.run_approval(
                    run,
                    &step,
                    &prompt,
                    risk_level,
                    timeout_seconds,
                    auto_approve_after_timeout,
                    &outputs,
                    &cancel,
                )
                .await
            }
        }
    }

    async fn run_task(
        &self,
        run: &WorkflowRun,
        role: &str,
        task: &str,
        outputs: &HashMap<String, serde_json::Value>,
        vars: &HashMap<String, String>,
        token: Option<String>,
    ) -> StepOutcome {
        let prompt = template::resolve(task, outputs, vars);
        let session = self.sessions.get_or_create(role).await;
        match session
            .send_message(&prompt, &run.working_directory, token)
            .await
        {
            Ok(text) => StepOutcome::Completed {
                output: serde_json::Value::String(text),
                token: session.continuation_token(),
            },
            Err(CoreError::Aborted { continuation_token }) => StepOutcome::Aborted {
                token: continuation_token,
            },
            Err(e) => StepOutcome::Failed {
                error: e.to_string(),
                token: session.continuation_token(),
            },
        }
    }

    async fn run_parallel(
        &self,
        run: &WorkflowRun,
        tasks: &[ParallelTask],
        outputs: &HashMap<String, serde_json::Value>,
    ) -> StepOutcome {
        let vars = HashMap::new();
        let futures = tasks
            .iter()
            .map(|t| self.run_task(run, &t.role, &t.task, outputs, &vars, None));
        let results = futures::future::join_all(futures).await;

        let mut collected = Vec::with_capacity(results.len());
        let mut errors = Vec::new();
        let mut aborted_token: Option<Option<String>> = None;
        for result in results {
            match result {
                StepOutcome::Completed { output, .. } => collected.push(output),
                StepOutcome::Failed { error, .. } => errors.push(error),
                StepOutcome::Aborted { token } => aborted_token = Some(token),
                StepOutcome::Branched { .. } => unreachable!("tasks never branch"),
            }
        }
        if let Some(token) = aborted_token {
            return StepOutcome::Aborted { token };
        }
        if !errors.is_empty() {
            return StepOutcome::Failed {
                error: errors.join("; "),
                token: None,
            };
        }
        StepOutcome::Completed {
            output: serde_json::Value::Array(collected),
            token: None,
        }
    }

    async fn run_loop(
        &self,
        run: &WorkflowRun,
        step: &StepRow,
        items: &[String],
        loop_var: &str,
        max_iterations: u32,
        outputs: &HashMap<String, serde_json::Value>,
        cancel: &CancellationToken,
    ) -> StepOutcome {
        let mut collected = Vec::new();
        let mut last_token = step.continuation_token.clone();
        for item in items.iter().take(max_iterations as usize) {
            if cancel.is_cancelled() {
                return StepOutcome::Aborted { token: last_token };
            }
            let mut vars = HashMap::new();
            vars.insert(loop_var.to_string(), item.clone());
            match self
                .run_task(run, &step.role, &step.task, outputs, &vars, last_token.clone())
                .await
            {
                StepOutcome::Completed { output, token } => {
                    collected.push(output);
                    if token.is_some() {
                        last_token = token;
                    }
                }
                StepOutcome::Failed { error, token } => {
                    return StepOutcome::Failed {
                        error: format!("iteration '{}' failed: {}", item, error),
                        token,
                    };
                }
                StepOutcome::Aborted { token } => return StepOutcome::Aborted { token },
                StepOutcome::Branched { .. } => unreachable!("tasks never branch"),
            }
        }
        StepOutcome::Completed {
            output: serde_json::Value::Array(collected),
            token: last_token,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_approval(
        &self,
        run: &WorkflowRun,
        step: &StepRow,
        prompt: &str,
        risk_level: RiskLevel,
        timeout_seconds: i64,
        auto_approve_after_timeout: bool,
        outputs: &HashMap<String, serde_json::Value>,
        cancel: &CancellationToken,
    ) -> StepOutcome {
        // A decision from a previous attempt still stands; rejected or
        // expired gates get a fresh request so resume can try again.
        match self.gate.find_approved(&run.id, &step.id).await {
            Ok(Some(prior)) => return approved_outcome(prior.resolved_by),
            Ok(None) => {}
            Err(e) => {
                return StepOutcome::Failed { error: e.to_string(), token: None };
            }
        }

        let existing = match self.gate.find_open(&run.id, &step.id).await {
            Ok(existing) => existing,
            Err(e) => return StepOutcome::Failed { error: e.to_string(), token: None },
        };
        let approval = match existing {
            Some(approval) => approval,
            None => {
                let context: serde_json::Map<String, serde_json::Value> =
                    outputs.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                let resolved_prompt = template::resolve(prompt, outputs, &HashMap::new());
                match self
                    .gate
                    .create(CreateApprovalInput {
                        run_id: run.id.clone(),
                        step_id: step.id.clone(),
                        prompt: resolved_prompt,
                        context_snapshot: serde_json::Value::Object(context),
                        risk_level,
                        timeout_seconds,
                        auto_approve_after_timeout,
                    })
                    .await
                {
                    Ok(approval) => approval,
                    Err(e) => {
                        return StepOutcome::Failed { error: e.to_string(), token: None }
                    }
                }
            }
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return StepOutcome::Aborted { token: None },
                _ = tokio::time::sleep(std::time::Duration::from_millis(self.approval_poll_ms)) => {}
            }
            if let Err(e) = self.gate.sweep_expired().await {
                tracing::warn!("[Engine] approval sweep failed: {}", e);
            }
            let current = match self.gate.get(&approval.id).await {
                Ok(Some(current)) => current,
                Ok(None) => {
                    return StepOutcome::Failed {
                        error: format!("approval {} disappeared", approval.id),
                        token: None,
                    }
                }
                Err(e) => return StepOutcome::Failed { error: e.to_string(), token: None },
            };
            match current.status {
                ApprovalStatus::Pending => continue,
                ApprovalStatus::Approved => return approved_outcome(current.resolved_by),
                ApprovalStatus::Rejected => {
                    return StepOutcome::Failed {
                        error: "approval rejected".into(),
                        token: None,
                    }
                }
                ApprovalStatus::Expired => {
                    return StepOutcome::Failed {
                        error: "approval expired".into(),
                        token: None,
                    }
                }
                ApprovalStatus::Cancelled => {
                    return StepOutcome::Aborted { token: None }
                }
            }
        }
    }
}

fn approved_outcome(resolved_by: Option<String>) -> StepOutcome {
    StepOutcome::Completed {
        output: serde_json::json!({ "approved": true, "resolvedBy": resolved_by }),
        token: None,
    }
}

fn run_conditional(
    predicate: &Condition,
    true_branch: &str,
    false_branch: &str,
    outputs: &HashMap<String, serde_json::Value>,
) -> StepOutcome {
    match predicate.evaluate(outputs) {
        Ok(result) => {
            let (chosen, other) = if result {
                (true_branch, false_branch)
            } else {
                (false_branch, true_branch)
            };
            StepOutcome::Branched {
                other: other.to_string(),
                output: serde_json::json!({ "result": result, "chosen": chosen }),
            }
        }
        Err(e) => StepOutcome::Failed { error: e.to_string(), token: None },
    }
}

fn checkpoint_state(rows: &[StepRow]) -> HashMap<String, StepCheckpoint> {
    rows.iter()
        .map(|s| {
            (
                s.id.clone(),
                StepCheckpoint {
                    status: s.status,
                    continuation_token: s.continuation_token.clone(),
                },
            )
        })
        .collect()
}

fn roles_of_steps(specs: &HashMap<String, StepRow>, ids: &HashSet<String>) -> Vec<String> {
    let mut roles = Vec::new();
    for id in ids {
        let Some(step) = specs.get(id) else { continue };
        match &step.kind {
            StepKind::Task | StepKind::Loop { .. } => roles.push(step.role.clone()),
            StepKind::Parallel { tasks } => {
                roles.extend(tasks.iter().map(|t| t.role.clone()));
            }
            StepKind::Conditional { .. } | StepKind::HumanApproval { .. } => {}
        }
    }
    roles.sort();
    roles.dedup();
    roles
}

/// Reject malformed graphs before anything is persisted.
fn validate_graph(specs: &[StepSpec]) -> Result<(), CoreError> {
    if specs.is_empty() {
        return Err(CoreError::Validation("workflow has no steps".into()));
    }

    let mut ids = HashSet::new();
    for spec in specs {
        if spec.id.is_empty() {
            return Err(CoreError::Validation("step id must not be empty".into()));
        }
        if !ids.insert(spec.id.as_str()) {
            return Err(CoreError::Validation(format!("duplicate step id '{}'", spec.id)));
        }
    }

    for spec in specs {
        for dep in &spec.deps {
            if !ids.contains(dep.as_str()) {
                return Err(CoreError::Validation(format!(
                    "step '{}' depends on unknown step '{}'",
                    spec.id, dep
                )));
            }
        }
        match &spec.kind {
            StepKind::Task => {
                if spec.role.is_empty() {
                    return Err(CoreError::Validation(format!(
                        "task step '{}' has no role",
                        spec.id
                    )));
                }
            }
            StepKind::Parallel { tasks } => {
                if tasks.is_empty() {
                    return Err(CoreError::Validation(format!(
                        "parallel step '{}' has no tasks",
                        spec.id
                    )));
                }
                if tasks.iter().any(|t| t.role.is_empty()) {
                    return Err(CoreError::Validation(format!(
                        "parallel step '{}' has a task without a role",
                        spec.id
                    )));
                }
            }
            StepKind::Conditional {
                true_branch,
                false_branch,
                ..
            } => {
                for branch in [true_branch, false_branch] {
                    if !ids.contains(branch.as_str()) {
                        return Err(CoreError::Validation(format!(
                            "conditional step '{}' references unknown branch '{}'",
                            spec.id, branch
                        )));
                    }
                    let branch_spec = specs.iter().find(|s| &s.id == branch);
                    if !branch_spec.is_some_and(|s| s.deps.contains(&spec.id)) {
                        return Err(CoreError::Validation(format!(
                            "branch '{}' must depend on conditional step '{}'",
                            branch, spec.id
                        )));
                    }
                }
            }
            StepKind::Loop {
                loop_var,
                max_iterations,
                ..
            } => {
                if *max_iterations == 0 {
                    return Err(CoreError::Validation(format!(
                        "loop step '{}' allows zero iterations",
                        spec.id
                    )));
                }
                if loop_var.is_empty() {
                    return Err(CoreError::Validation(format!(
                        "loop step '{}' has no loop variable",
                        spec.id
                    )));
                }
            }
            StepKind::HumanApproval { timeout_seconds, .. } => {
                if *timeout_seconds <= 0 {
                    return Err(CoreError::Validation(format!(
                        "approval step '{}' needs a positive timeout",
                        spec.id
                    )));
                }
            }
        }
    }

    detect_cycle(specs)
}

fn detect_cycle(specs: &[StepSpec]) -> Result<(), CoreError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    let index: HashMap<&str, &StepSpec> = specs.iter().map(|s| (s.id.as_str(), s)).collect();
    let mut marks: HashMap<&str, Mark> =
        specs.iter().map(|s| (s.id.as_str(), Mark::Unvisited)).collect();

    fn visit<'a>(
        id: &'a str,
        index: &HashMap<&'a str, &'a StepSpec>,
        marks: &mut HashMap<&'a str, Mark>,
    ) -> Result<(), CoreError> {
        match marks[id] {
            Mark::Done => return Ok(()),
            Mark::InProgress => {
                return Err(CoreError::Validation(format!(
                    "dependency cycle through step '{}'",
                    id
                )))
            }
            Mark::Unvisited => {}
        }
        marks.insert(id, Mark::InProgress);
        for dep in &index[id].deps {
            visit(dep.as_str(), index, marks)?;
        }
        marks.insert(id, Mark::Done);
        Ok(())
    }

    for spec in specs {
        visit(spec.id.as_str(), &index, &mut marks)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{ApprovalFilter, Combinator, Comparator};
    use crate::session::scripted::{ScriptedBackend, ScriptedCall};
    use crate::session::backend::BackendEvent;
    use crate::store::ApprovalStore;
    use std::time::Duration;

    fn harness(poll_ms: u64) -> (WorkflowEngine, ApprovalGate, ScriptedBackend) {
        let db = Database::open_in_memory().unwrap();
        let bus = EventBus::new();
        let backend = ScriptedBackend::echoing();
        let gate = ApprovalGate::new(ApprovalStore::new(db.clone()), bus.clone());
        let sessions = SessionRegistry::new(Arc::new(backend.clone()), bus.clone());
        let engine = WorkflowEngine::new(RunStore::new(db), gate.clone(), sessions, bus, poll_ms);
        (engine, gate, backend)
    }

    async fn run_to_end(engine: &WorkflowEngine, specs: Vec<StepSpec>) -> String {
        let run_id = engine
            .start(specs, StartOptions::default())
            .await
            .unwrap();
        engine.join(&run_id).await.unwrap();
        run_id
    }

    #[tokio::test]
    async fn linear_chain_substitutes_prior_outputs() {
        let (engine, _gate, backend) = harness(25);
        let run_id = run_to_end(
            &engine,
            vec![
                StepSpec::task("s1", "dev", "build", &[]),
                StepSpec::task("s2", "dev", "test ${steps.s1.output}", &["s1"]),
            ],
        )
        .await;

        let snapshot = engine.status(&run_id).await.unwrap();
        assert_eq!(snapshot.run.status, RunStatus::Completed);
        assert_eq!(snapshot.step_status("s2"), Some(StepStatus::Completed));

        let requests = backend.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].prompt, "build");
        assert_eq!(requests[1].prompt, "test ok: build");
    }

    #[tokio::test]
    async fn diamond_runs_join_after_both_arms() {
        let (engine, _gate, backend) = harness(25);
        let run_id = run_to_end(
            &engine,
            vec![
                StepSpec::task("a", "dev", "seed", &[]),
                StepSpec::task("b", "dev", "left ${steps.a.output}", &["a"]),
                StepSpec::task("c", "dev", "right ${steps.a.output}", &["a"]),
                StepSpec::task(
                    "d",
                    "dev",
                    "join ${steps.b.output} | ${steps.c.output}",
                    &["b", "c"],
                ),
            ],
        )
        .await;

        assert_eq!(
            engine.status(&run_id).await.unwrap().run.status,
            RunStatus::Completed
        );
        let requests = backend.requests();
        assert_eq!(requests.len(), 4);
        assert_eq!(requests[0].prompt, "seed");
        // The join only dispatches after both arms delivered their outputs.
        assert_eq!(
            requests[3].prompt,
            "join ok: left ok: seed | ok: right ok: seed"
        );
    }

    #[tokio::test]
    async fn parallel_step_fans_out_and_collects() {
        let (engine, _gate, backend) = harness(25);
        let run_id = run_to_end(
            &engine,
            vec![StepSpec {
                id: "fanout".into(),
                role: String::new(),
                task: String::new(),
                deps: vec![],
                kind: StepKind::Parallel {
                    tasks: vec![
                        ParallelTask { role: "w1".into(), task: "part one".into() },
                        ParallelTask { role: "w2".into(), task: "part two".into() },
                    ],
                },
                continue_on_error: false,
            }],
        )
        .await;

        let snapshot = engine.status(&run_id).await.unwrap();
        assert_eq!(snapshot.run.status, RunStatus::Completed);
        let output = snapshot.steps[0].output.clone().unwrap();
        assert_eq!(output.as_array().unwrap().len(), 2);
        assert_eq!(backend.requests().len(), 2);
    }

    #[tokio::test]
    async fn loop_iterates_bounded_and_in_order() {
        let (engine, _gate, backend) = harness(25);
        let run_id = run_to_end(
            &engine,
            vec![StepSpec {
                id: "each".into(),
                role: "dev".into(),
                task: "do ${item}".into(),
                deps: vec![],
                kind: StepKind::Loop {
                    items: vec!["a".into(), "b".into(), "c".into()],
                    loop_var: "item".into(),
                    max_iterations: 2,
                },
                continue_on_error: false,
            }],
        )
        .await;

        let snapshot = engine.status(&run_id).await.unwrap();
        assert_eq!(snapshot.run.status, RunStatus::Completed);
        let output = snapshot.steps[0].output.clone().unwrap();
        assert_eq!(output.as_array().unwrap().len(), 2);

        let prompts: Vec<String> = backend.requests().into_iter().map(|r| r.prompt).collect();
        assert_eq!(prompts, vec!["do a".to_string(), "do b".to_string()]);
    }

    #[tokio::test]
    async fn conditional_skips_losing_branch_and_descendants() {
        let (engine, _gate, _backend) = harness(25);
        let run_id = run_to_end(
            &engine,
            vec![
                StepSpec::task("s1", "dev", "build", &[]),
                StepSpec {
                    id: "gate".into(),
                    role: String::new(),
                    task: String::new(),
                    deps: vec!["s1".into()],
                    kind: StepKind::Conditional {
                        predicate: Condition::Rule {
                            field: "s1".into(),
                            op: Comparator::Contains,
                            value: serde_json::json!("ok"),
                        },
                        true_branch: "yes".into(),
                        false_branch: "no".into(),
                    },
                    continue_on_error: false,
                },
                StepSpec::task("yes", "dev", "ship it", &["gate"]),
                StepSpec::task("no", "dev", "roll back", &["gate"]),
                StepSpec::task("after_no", "dev", "cleanup", &["no"]),
            ],
        )
        .await;

        let snapshot = engine.status(&run_id).await.unwrap();
        assert_eq!(snapshot.run.status, RunStatus::Completed);
        assert_eq!(snapshot.step_status("yes"), Some(StepStatus::Completed));
        assert_eq!(snapshot.step_status("no"), Some(StepStatus::Skipped));
        assert_eq!(snapshot.step_status("after_no"), Some(StepStatus::Skipped));
        assert_eq!(
            snapshot.steps[1].output.clone().unwrap()["chosen"],
            serde_json::json!("yes")
        );
    }

    #[tokio::test]
    async fn group_predicate_combines_rules() {
        let condition = Condition::Group {
            combinator: Combinator::And,
            children: vec![
                Condition::Rule {
                    field: "lint".into(),
                    op: Comparator::Eq,
                    value: serde_json::json!("clean"),
                },
                Condition::Rule {
                    field: "tests.failed".into(),
                    op: Comparator::Lte,
                    value: serde_json::json!(0),
                },
            ],
        };
        let mut context = HashMap::new();
        context.insert("lint".to_string(), serde_json::json!("clean"));
        context.insert("tests".to_string(), serde_json::json!({ "failed": 0 }));
        assert!(condition.evaluate(&context).unwrap());
    }

    #[tokio::test]
    async fn hard_failure_fails_run_and_leaves_dependents_pending() {
        let (engine, _gate, backend) = harness(25);
        backend.push(ScriptedCall::Fail("tool crashed".into()));
        let run_id = run_to_end(
            &engine,
            vec![
                StepSpec::task("s1", "dev", "build", &[]),
                StepSpec::task("s2", "dev", "test", &["s1"]),
            ],
        )
        .await;

        let snapshot = engine.status(&run_id).await.unwrap();
        assert_eq!(snapshot.run.status, RunStatus::Failed);
        assert_eq!(snapshot.step_status("s1"), Some(StepStatus::Failed));
        assert_eq!(snapshot.step_status("s2"), Some(StepStatus::Pending));
        assert!(snapshot.steps[0].output.clone().unwrap()["error"]
            .as_str()
            .unwrap()
            .contains("tool crashed"));
    }

    #[tokio::test]
    async fn continue_on_error_runs_siblings_but_fails_the_run() {
        let (engine, _gate, backend) = harness(25);
        backend.push(ScriptedCall::Fail("flaky".into()));
        let mut failing = StepSpec::task("s1", "dev", "lint", &[]);
        failing.continue_on_error = true;
        // max_parallel 1 pins the failing script to s1.
        let run_id = engine
            .start(
                vec![
                    failing,
                    StepSpec::task("s2", "dev", "fix lint", &["s1"]),
                    StepSpec::task("s3", "dev", "report", &[]),
                ],
                StartOptions {
                    max_parallel: 1,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        engine.join(&run_id).await.unwrap();

        // Independent work still executes, but a failed step never leaves
        // the run completed.
        let snapshot = engine.status(&run_id).await.unwrap();
        assert_eq!(snapshot.run.status, RunStatus::Failed);
        assert_eq!(snapshot.step_status("s1"), Some(StepStatus::Failed));
        assert_eq!(snapshot.step_status("s2"), Some(StepStatus::Skipped));
        assert_eq!(snapshot.step_status("s3"), Some(StepStatus::Completed));
        assert_eq!(backend.requests().len(), 2);
    }

    #[tokio::test]
    async fn abort_preserves_token_and_resume_reuses_it() {
        let (engine, _gate, backend) = harness(25);
        backend.push(ScriptedCall::Events {
            events: vec![
                BackendEvent::assistant("working").with_token("tok-early"),
                BackendEvent::assistant("still working"),
                BackendEvent::result("tok-final"),
            ],
            delay: Duration::from_millis(50),
        });
        let run_id = engine
            .start(
                vec![StepSpec::task("s1", "dev", "long job", &[])],
                StartOptions::default(),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        engine.abort(&run_id).await.unwrap();
        engine.join(&run_id).await.unwrap();

        let snapshot = engine.status(&run_id).await.unwrap();
        assert_eq!(snapshot.run.status, RunStatus::Aborted);
        assert_eq!(snapshot.step_status("s1"), Some(StepStatus::Aborted));
        assert_eq!(
            snapshot.steps[0].continuation_token.as_deref(),
            Some("tok-early")
        );

        engine.resume(&run_id, None).await.unwrap();
        engine.join(&run_id).await.unwrap();

        let snapshot = engine.status(&run_id).await.unwrap();
        assert_eq!(snapshot.run.status, RunStatus::Completed);
        let requests = backend.requests();
        assert_eq!(requests.len(), 2);
        // Resume picks the conversation back up, not from scratch.
        assert_eq!(requests[1].continuation_token.as_deref(), Some("tok-early"));
    }

    #[tokio::test]
    async fn resume_never_redispatches_completed_steps() {
        let (engine, _gate, backend) = harness(25);
        backend.push(ScriptedCall::Events {
            events: vec![BackendEvent::assistant("done").with_token("tok-s1")],
            delay: Duration::ZERO,
        });
        backend.push(ScriptedCall::Fail("transient".into()));
        let run_id = run_to_end(
            &engine,
            vec![
                StepSpec::task("s1", "dev", "build", &[]),
                StepSpec::task("s2", "dev", "test", &["s1"]),
            ],
        )
        .await;
        assert_eq!(
            engine.status(&run_id).await.unwrap().run.status,
            RunStatus::Failed
        );

        // Failed steps stay failed; resume only re-dispatches interrupted
        // work, and there is none here.
        engine.resume(&run_id, None).await.unwrap();
        engine.join(&run_id).await.unwrap();
        let snapshot = engine.status(&run_id).await.unwrap();
        assert_eq!(snapshot.step_status("s1"), Some(StepStatus::Completed));
        let s1_calls = backend
            .requests()
            .iter()
            .filter(|r| r.prompt == "build")
            .count();
        assert_eq!(s1_calls, 1);
    }

    #[tokio::test]
    async fn checkpoint_frontier_lists_only_ready_steps() {
        let (engine, _gate, backend) = harness(25);
        backend.push(ScriptedCall::Events {
            events: vec![
                BackendEvent::assistant("working"),
                BackendEvent::result("tok-a"),
            ],
            delay: Duration::from_millis(50),
        });
        let run_id = engine
            .start(
                vec![
                    StepSpec::task("a", "dev", "fetch", &[]),
                    StepSpec::task("b", "dev", "parse", &["a"]),
                    StepSpec::task("c", "dev", "publish", &["b"]),
                ],
                StartOptions::default(),
            )
            .await
            .unwrap();

        // While a is in flight, b and c are blocked on it and stay out of
        // the persisted frontier.
        tokio::time::sleep(Duration::from_millis(60)).await;
        let cp = engine
            .store
            .latest_checkpoint(&run_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cp.frontier, vec!["a".to_string()]);

        engine.join(&run_id).await.unwrap();
        let cp = engine
            .store
            .latest_checkpoint(&run_id)
            .await
            .unwrap()
            .unwrap();
        assert!(cp.frontier.is_empty());
        assert_eq!(
            engine.status(&run_id).await.unwrap().run.status,
            RunStatus::Completed
        );
    }

    #[tokio::test]
    async fn approval_gate_blocks_until_approved() {
        let (engine, gate, _backend) = harness(20);
        let run_id = engine
            .start(
                vec![
                    StepSpec::task("build", "dev", "build", &[]),
                    StepSpec {
                        id: "signoff".into(),
                        role: String::new(),
                        task: String::new(),
                        deps: vec!["build".into()],
                        kind: StepKind::HumanApproval {
                            prompt: "Ship ${steps.build.output}?".into(),
                            risk_level: RiskLevel::High,
                            timeout_seconds: 3600,
                            auto_approve_after_timeout: false,
                        },
                        continue_on_error: false,
                    },
                    StepSpec::task("ship", "dev", "ship", &["signoff"]),
                ],
                StartOptions::default(),
            )
            .await
            .unwrap();

        // Wait for the pending approval to surface, then approve it.
        let approval = loop {
            if let Some(approval) = gate.find_open(&run_id, "signoff").await.unwrap() {
                break approval;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        assert_eq!(approval.prompt, "Ship ok: build?");
        gate.decide(&approval.id, crate::models::Decision::Approved, "alice", None, None)
            .await
            .unwrap();

        engine.join(&run_id).await.unwrap();
        let snapshot = engine.status(&run_id).await.unwrap();
        assert_eq!(snapshot.run.status, RunStatus::Completed);
        assert_eq!(snapshot.step_status("ship"), Some(StepStatus::Completed));
        let output = snapshot.steps[1].output.clone().unwrap();
        assert_eq!(output["approved"], serde_json::json!(true));
    }

    #[tokio::test]
    async fn rejected_approval_fails_the_run() {
        let (engine, gate, _backend) = harness(20);
        let run_id = engine
            .start(
                vec![StepSpec {
                    id: "signoff".into(),
                    role: String::new(),
                    task: String::new(),
                    deps: vec![],
                    kind: StepKind::HumanApproval {
                        prompt: "Proceed?".into(),
                        risk_level: RiskLevel::Medium,
                        timeout_seconds: 3600,
                        auto_approve_after_timeout: false,
                    },
                    continue_on_error: false,
                }],
                StartOptions::default(),
            )
            .await
            .unwrap();

        let approval = loop {
            if let Some(approval) = gate.find_open(&run_id, "signoff").await.unwrap() {
                break approval;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        gate.decide(&approval.id, crate::models::Decision::Rejected, "bob", None, None)
            .await
            .unwrap();

        engine.join(&run_id).await.unwrap();
        let snapshot = engine.status(&run_id).await.unwrap();
        assert_eq!(snapshot.run.status, RunStatus::Failed);
        assert_eq!(snapshot.step_status("signoff"), Some(StepStatus::Failed));
    }

    #[tokio::test]
    async fn expired_approval_fails_the_run() {
        let (engine, gate, _backend) = harness(30);
        let run_id = engine
            .start(
                vec![StepSpec {
                    id: "signoff".into(),
                    role: String::new(),
                    task: String::new(),
                    deps: vec![],
                    kind: StepKind::HumanApproval {
                        prompt: "Proceed?".into(),
                        risk_level: RiskLevel::Medium,
                        timeout_seconds: 1,
                        auto_approve_after_timeout: false,
                    },
                    continue_on_error: false,
                }],
                StartOptions::default(),
            )
            .await
            .unwrap();

        // Nobody answers within the timeout; the poll loop sweeps the
        // request into expired and the gate fails.
        engine.join(&run_id).await.unwrap();
        let snapshot = engine.status(&run_id).await.unwrap();
        assert_eq!(snapshot.run.status, RunStatus::Failed);
        assert_eq!(snapshot.step_status("signoff"), Some(StepStatus::Failed));

        let expired = gate.list(ApprovalFilter {
            run_id: Some(run_id.clone()),
            statuses: vec![ApprovalStatus::Expired],
            page: 1,
            page_size: 10,
        })
        .await
        .unwrap();
        assert_eq!(expired.total, 1);
        assert!(expired.items[0].resolved_by.is_none());
    }

    #[tokio::test]
    async fn overdue_flagged_approval_auto_approves() {
        let (engine, _gate, _backend) = harness(30);
        let run_id = engine
            .start(
                vec![StepSpec {
                    id: "signoff".into(),
                    role: String::new(),
                    task: String::new(),
                    deps: vec![],
                    kind: StepKind::HumanApproval {
                        prompt: "Routine rollout".into(),
                        risk_level: RiskLevel::Low,
                        timeout_seconds: 1,
                        auto_approve_after_timeout: true,
                    },
                    continue_on_error: false,
                }],
                StartOptions::default(),
            )
            .await
            .unwrap();

        engine.join(&run_id).await.unwrap();
        let snapshot = engine.status(&run_id).await.unwrap();
        assert_eq!(snapshot.run.status, RunStatus::Completed);
        let output = snapshot.steps[0].output.clone().unwrap();
        assert_eq!(
            output["resolvedBy"],
            serde_json::json!(crate::store::SYSTEM_AUTO_APPROVER)
        );
    }

    #[tokio::test]
    async fn abort_cancels_pending_approvals() {
        let (engine, gate, _backend) = harness(20);
        let run_id = engine
            .start(
                vec![StepSpec {
                    id: "signoff".into(),
                    role: String::new(),
                    task: String::new(),
                    deps: vec![],
                    kind: StepKind::HumanApproval {
                        prompt: "Proceed?".into(),
                        risk_level: RiskLevel::Medium,
                        timeout_seconds: 3600,
                        auto_approve_after_timeout: false,
                    },
                    continue_on_error: false,
                }],
                StartOptions::default(),
            )
            .await
            .unwrap();

        let approval = loop {
            if let Some(approval) = gate.find_open(&run_id, "signoff").await.unwrap() {
                break approval;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };

        engine.abort(&run_id).await.unwrap();
        engine.join(&run_id).await.unwrap();

        assert_eq!(
            engine.status(&run_id).await.unwrap().run.status,
            RunStatus::Aborted
        );
        assert_eq!(
            gate.get(&approval.id).await.unwrap().unwrap().status,
            ApprovalStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn resume_honors_standing_approval_without_new_request() {
        let (engine, gate, backend) = harness(20);
        backend.push(ScriptedCall::Fail("deploy tool down".into()));
        let run_id = engine
            .start(
                vec![
                    StepSpec {
                        id: "signoff".into(),
                        role: String::new(),
                        task: String::new(),
                        deps: vec![],
                        kind: StepKind::HumanApproval {
                            prompt: "Proceed?".into(),
                            risk_level: RiskLevel::Medium,
                            timeout_seconds: 3600,
                            auto_approve_after_timeout: false,
                        },
                        continue_on_error: false,
                    },
                    StepSpec::task("ship", "dev", "ship", &["signoff"]),
                ],
                StartOptions::default(),
            )
            .await
            .unwrap();

        let approval = loop {
            if let Some(approval) = gate.find_open(&run_id, "signoff").await.unwrap() {
                break approval;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        // Checkpoint taken while the gate is still open.
        let mid = engine
            .store
            .latest_checkpoint(&run_id)
            .await
            .unwrap()
            .unwrap();
        gate.decide(&approval.id, crate::models::Decision::Approved, "alice", None, None)
            .await
            .unwrap();
        engine.join(&run_id).await.unwrap();
        assert_eq!(
            engine.status(&run_id).await.unwrap().run.status,
            RunStatus::Failed
        );

        // Rewinding past the gate must not open a second request; the
        // earlier decision stands.
        engine.resume(&run_id, Some(mid.id.as_str())).await.unwrap();
        engine.join(&run_id).await.unwrap();

        let snapshot = engine.status(&run_id).await.unwrap();
        assert_eq!(snapshot.run.status, RunStatus::Completed);
        assert_eq!(snapshot.step_status("ship"), Some(StepStatus::Completed));
        let all = gate
            .list(ApprovalFilter {
                run_id: Some(run_id.clone()),
                statuses: vec![],
                page: 1,
                page_size: 10,
            })
            .await
            .unwrap();
        assert_eq!(all.total, 1);
        assert_eq!(all.items[0].status, ApprovalStatus::Approved);
    }

    #[tokio::test]
    async fn start_rejects_malformed_graphs() {
        let (engine, _gate, _backend) = harness(25);

        for specs in [
            vec![],
            vec![
                StepSpec::task("dup", "dev", "a", &[]),
                StepSpec::task("dup", "dev", "b", &[]),
            ],
            vec![StepSpec::task("s1", "dev", "a", &["ghost"])],
            vec![
                StepSpec::task("s1", "dev", "a", &["s2"]),
                StepSpec::task("s2", "dev", "b", &["s1"]),
            ],
            vec![StepSpec {
                id: "each".into(),
                role: "dev".into(),
                task: "do ${item}".into(),
                deps: vec![],
                kind: StepKind::Loop {
                    items: vec!["a".into()],
                    loop_var: "item".into(),
                    max_iterations: 0,
                },
                continue_on_error: false,
            }],
        ] {
            let err = engine.start(specs, StartOptions::default()).await.unwrap_err();
            assert!(matches!(err, CoreError::Validation(_)));
        }
    }

    #[tokio::test]
    async fn conditional_branches_must_depend_on_gate() {
        let (engine, _gate, _backend) = harness(25);
        let err = engine
            .start(
                vec![
                    StepSpec {
                        id: "gate".into(),
                        role: String::new(),
                        task: String::new(),
                        deps: vec![],
                        kind: StepKind::Conditional {
                            predicate: Condition::Rule {
                                field: "x".into(),
                                op: Comparator::Exists,
                                value: serde_json::Value::Null,
                            },
                            true_branch: "yes".into(),
                            false_branch: "no".into(),
                        },
                        continue_on_error: false,
                    },
                    StepSpec::task("yes", "dev", "a", &[]),
                    StepSpec::task("no", "dev", "b", &["gate"]),
                ],
                StartOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn status_of_unknown_run_is_not_found() {
        let (engine, _gate, _backend) = harness(25);
        assert!(matches!(
            engine.status("nope").await.unwrap_err(),
            CoreError::NotFound(_)
        ));
        assert!(matches!(
            engine.resume("nope", None).await.unwrap_err(),
            CoreError::NotFound(_)
        ));
        assert!(matches!(
            engine.abort("nope").await.unwrap_err(),
            CoreError::NotFound(_)
        ));
    }
}
