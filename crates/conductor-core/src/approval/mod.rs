//! Approval gate service.
//!
//! Wraps the approval store with event notifications: every lifecycle
//! transition lands in the database first, then fans out over the bus.
//! Subscribers that miss an event can always reconstruct state from the
//! store; the bus is advisory.

use chrono::Utc;

use crate::error::CoreError;
use crate::events::{topics, EventBus};
use crate::models::{
    Approval, ApprovalDetails, ApprovalFilter, ApprovalPage, ApprovalStatus, CreateApprovalInput,
    Decision,
};
use crate::store::ApprovalStore;

#[derive(Clone)]
pub struct ApprovalGate {
    store: ApprovalStore,
    bus: EventBus,
}

impl ApprovalGate {
    pub fn new(store: ApprovalStore, bus: EventBus) -> Self {
        Self { store, bus }
    }

    /// Create a pending approval and notify subscribers. Fails with
    /// `Conflict` when the step already has an open request.
    pub async fn create(&self, input: CreateApprovalInput) -> Result<Approval, CoreError> {
        let approval = self.store.create(input).await?;
        self.store
            .record_notification(&approval.id, "event-bus")
            .await?;
        tracing::info!(
            "[ApprovalGate] Created approval {} for step {} (risk: {:?})",
            approval.id,
            approval.step_id,
            approval.risk_level
        );
        self.emit_lossy(
            topics::APPROVAL_CREATED,
            serde_json::json!({
                "approvalId": approval.id,
                "runId": approval.run_id,
                "stepId": approval.step_id,
                "riskLevel": approval.risk_level,
                "expiresAt": approval.expires_at,
            }),
        )
        .await;
        Ok(approval)
    }

    /// Resolve a pending approval with an explicit decision.
    pub async fn decide(
        &self,
        approval_id: &str,
        decision: Decision,
        decided_by: &str,
        comment: Option<String>,
        reasoning: Option<String>,
    ) -> Result<Approval, CoreError> {
        let record = self
            .store
            .decide(approval_id, decision, decided_by, comment, reasoning)
            .await?;
        let approval = self
            .store
            .get(approval_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("approval {}", approval_id)))?;
        tracing::info!(
            "[ApprovalGate] Approval {} {:?} by {}",
            approval_id,
            record.decision,
            record.decided_by
        );
        self.emit_resolved(&approval).await;
        Ok(approval)
    }

    /// Cancel a pending approval (the run was aborted or the step became
    /// irrelevant).
    pub async fn cancel(&self, approval_id: &str, cancelled_by: &str) -> Result<(), CoreError> {
        self.store.cancel(approval_id, cancelled_by).await?;
        if let Some(approval) = self.store.get(approval_id).await? {
            self.emit_resolved(&approval).await;
        }
        Ok(())
    }

    /// Cancel every pending approval belonging to a run. Returns how many
    /// were cancelled.
    pub async fn cancel_for_run(
        &self,
        run_id: &str,
        cancelled_by: &str,
    ) -> Result<usize, CoreError> {
        let pending = self.store.list_pending_for_run(run_id).await?;
        for approval in &pending {
            // Races with a concurrent decision lose gracefully.
            match self.cancel(&approval.id, cancelled_by).await {
                Ok(()) => {}
                Err(CoreError::Conflict(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(pending.len())
    }

    /// Resolve every pending approval past its deadline: auto-approve the
    /// ones flagged for it, expire the rest. Returns the number swept.
    pub async fn sweep_expired(&self) -> Result<usize, CoreError> {
        let swept = self.store.sweep_expired(Utc::now().timestamp_millis()).await?;
        if swept.is_empty() {
            return Ok(0);
        }
        tracing::info!("[ApprovalGate] Swept {} overdue approval(s)", swept.len());
        for id in &swept {
            if let Some(approval) = self.store.get(id).await? {
                self.emit_resolved(&approval).await;
            }
        }
        Ok(swept.len())
    }

    pub async fn get(&self, approval_id: &str) -> Result<Option<Approval>, CoreError> {
        self.store.get(approval_id).await
    }

    pub async fn find_open(
        &self,
        run_id: &str,
        step_id: &str,
    ) -> Result<Option<Approval>, CoreError> {
        self.store.find_open(run_id, step_id).await
    }

    pub async fn find_approved(
        &self,
        run_id: &str,
        step_id: &str,
    ) -> Result<Option<Approval>, CoreError> {
        self.store.find_approved(run_id, step_id).await
    }

    pub async fn list(&self, filter: ApprovalFilter) -> Result<ApprovalPage, CoreError> {
        self.store.list(filter).await
    }

    /// Single approval enriched with deadline math, the latest decision and
    /// the notification trail.
    pub async fn details(&self, approval_id: &str) -> Result<ApprovalDetails, CoreError> {
        let approval = self
            .store
            .get(approval_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("approval {}", approval_id)))?;
        let now = Utc::now().timestamp_millis();
        let remaining_ms = approval.expires_at - now;
        let is_overdue = approval.status == ApprovalStatus::Pending && remaining_ms < 0;
        let decision = self.store.latest_decision(approval_id).await?;
        let notification_count = self.store.notification_count(approval_id).await?;
        Ok(ApprovalDetails {
            time_remaining_seconds: (remaining_ms / 1000).max(0),
            is_overdue,
            decision,
            notification_count,
            approval,
        })
    }

    async fn emit_resolved(&self, approval: &Approval) {
        self.emit_lossy(
            topics::APPROVAL_RESOLVED,
            serde_json::json!({
                "approvalId": approval.id,
                "runId": approval.run_id,
                "stepId": approval.step_id,
                "status": approval.status,
                "resolvedBy": approval.resolved_by,
            }),
        )
        .await;
    }

    async fn emit_lossy(&self, topic: &str, payload: serde_json::Value) {
        if let Err(e) = self.bus.emit(topic, payload).await {
            tracing::warn!("[ApprovalGate] emit '{}' failed: {}", topic, e);
        }
    }
}
