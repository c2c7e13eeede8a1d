pub mod approval;
pub mod condition;
pub mod run;

pub use approval::{
    Approval, ApprovalDetails, ApprovalFilter, ApprovalPage, ApprovalStatus, ApprovalSummary,
    CreateApprovalInput, Decision, DecisionRecord, RiskLevel,
};
pub use condition::{Combinator, Comparator, Condition};
pub use run::{
    Checkpoint, ParallelTask, RunSnapshot, RunStatus, StartOptions, StepCheckpoint, StepKind,
    StepRow, StepSpec, StepStatus, WorkflowRun,
};
