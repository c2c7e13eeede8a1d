//! Approval-gate models.
//!
//! An `Approval` is a pause point tied to one (run, step) pair. Its status
//! transition is one-way: once resolved, expired, or cancelled it is
//! immutable except for audit appends. `DecisionRecord` rows are append-only.

use serde::{Deserialize, Serialize};

/// Risk classification shown to the decision maker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
    Cancelled,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "expired" => Some(Self::Expired),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// The two decisions a human can record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Rejected,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// Persisted approval row. Timestamps are Unix millis.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Approval {
    pub id: String,
    pub run_id: String,
    pub step_id: String,
    pub prompt: String,
    pub context_snapshot: serde_json::Value,
    pub risk_level: RiskLevel,
    pub requested_at: i64,
    pub timeout_seconds: i64,
    /// Always `requested_at + timeout_seconds * 1000`.
    pub expires_at: i64,
    pub status: ApprovalStatus,
    pub resolved_at: Option<i64>,
    pub resolved_by: Option<String>,
    pub auto_approve_after_timeout: bool,
}

/// Append-only audit record referencing an approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionRecord {
    pub id: String,
    pub approval_id: String,
    pub decision: Decision,
    pub comment: Option<String>,
    pub reasoning: Option<String>,
    pub decided_by: String,
    pub decided_at: i64,
}

/// Input to `ApprovalGate::create`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateApprovalInput {
    pub run_id: String,
    pub step_id: String,
    pub prompt: String,
    #[serde(default)]
    pub context_snapshot: serde_json::Value,
    #[serde(default)]
    pub risk_level: RiskLevel,
    pub timeout_seconds: i64,
    #[serde(default)]
    pub auto_approve_after_timeout: bool,
}

/// Filter for `ApprovalGate::list`.
#[derive(Debug, Clone, Default)]
pub struct ApprovalFilter {
    pub run_id: Option<String>,
    pub statuses: Vec<ApprovalStatus>,
    /// 1-based page number.
    pub page: usize,
    pub page_size: usize,
}

/// Summary counters returned alongside a listing page.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalSummary {
    pub pending: i64,
    /// Pending rows already past their expiry.
    pub overdue: i64,
    pub approved_today: i64,
    pub rejected_today: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalPage {
    pub items: Vec<Approval>,
    pub total: i64,
    pub page: usize,
    pub page_size: usize,
    pub summary: ApprovalSummary,
}

/// Enriched read-time projection of an approval. Computed on `get`, never
/// persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalDetails {
    #[serde(flatten)]
    pub approval: Approval,
    /// Seconds until expiry; zero once expired or resolved.
    pub time_remaining_seconds: i64,
    pub is_overdue: bool,
    pub decision: Option<DecisionRecord>,
    pub notification_count: i64,
}
