//! End-to-end coverage of the wired coordinator: workflow runs driving real
//! sessions over the scripted backend, approval gates resolved over the
//! public API, and events observed on the bus.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use conductor_core::events::topics;
use conductor_core::models::{
    ApprovalFilter, ApprovalStatus, Decision, RiskLevel, RunStatus, StartOptions, StepKind,
    StepSpec, StepStatus,
};
use conductor_core::session::scripted::ScriptedBackend;
use conductor_core::{Coordinator, CoordinatorConfig};

async fn coordinator(poll_ms: u64) -> (Coordinator, ScriptedBackend) {
    let backend = ScriptedBackend::echoing();
    let config = CoordinatorConfig {
        approval_poll_ms: poll_ms,
        ..CoordinatorConfig::default()
    };
    let coordinator = Coordinator::new(config, Arc::new(backend.clone()))
        .await
        .unwrap();
    (coordinator, backend)
}

fn approval_step(id: &str, deps: &[&str], timeout_seconds: i64) -> StepSpec {
    StepSpec {
        id: id.to_string(),
        role: String::new(),
        task: String::new(),
        deps: deps.iter().map(|s| s.to_string()).collect(),
        kind: StepKind::HumanApproval {
            prompt: "Proceed?".into(),
            risk_level: RiskLevel::High,
            timeout_seconds,
            auto_approve_after_timeout: false,
        },
        continue_on_error: false,
    }
}

#[tokio::test]
async fn full_pipeline_with_approval_gate() {
    let (coordinator, backend) = coordinator(20).await;

    let run_id = coordinator
        .engine
        .start(
            vec![
                StepSpec::task("plan", "architect", "draft a plan", &[]),
                StepSpec::task("build", "dev", "implement ${steps.plan.output}", &["plan"]),
                approval_step("signoff", &["build"], 3600),
                StepSpec::task("deploy", "ops", "deploy ${steps.build.output}", &["signoff"]),
            ],
            StartOptions {
                max_parallel: 2,
                working_directory: "/tmp/project".into(),
            },
        )
        .await
        .unwrap();

    let approval = loop {
        match coordinator.approvals.find_open(&run_id, "signoff").await.unwrap() {
            Some(approval) => break approval,
            None => tokio::time::sleep(Duration::from_millis(10)).await,
        }
    };
    coordinator
        .approvals
        .decide(&approval.id, Decision::Approved, "alice", Some("lgtm".into()), None)
        .await
        .unwrap();

    coordinator.engine.join(&run_id).await.unwrap();

    let snapshot = coordinator.engine.status(&run_id).await.unwrap();
    assert_eq!(snapshot.run.status, RunStatus::Completed);
    for step in ["plan", "build", "signoff", "deploy"] {
        assert_eq!(snapshot.step_status(step), Some(StepStatus::Completed));
    }

    // Sessions keyed by role, each with its own conversation.
    let requests = backend.requests();
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[0].prompt, "draft a plan");
    assert_eq!(requests[1].prompt, "implement ok: draft a plan");
    assert!(requests[2].prompt.starts_with("deploy ok: implement"));
    assert!(requests.iter().all(|r| r.working_directory == "/tmp/project"));

    // The audit trail survives the run.
    let details = coordinator.approvals.details(&approval.id).await.unwrap();
    assert_eq!(details.approval.status, ApprovalStatus::Approved);
    assert_eq!(details.decision.unwrap().comment.as_deref(), Some("lgtm"));
    assert_eq!(details.notification_count, 1);
}

#[tokio::test]
async fn bus_reports_run_progress() {
    let (coordinator, _backend) = coordinator(20).await;

    let step_events = Arc::new(Mutex::new(Vec::new()));
    let sink = step_events.clone();
    coordinator
        .bus
        .on(topics::STEP_STATUS, move |payload| {
            sink.lock().unwrap().push((
                payload["stepId"].as_str().unwrap().to_string(),
                payload["status"].as_str().unwrap().to_string(),
            ));
        })
        .await;

    let run_id = coordinator
        .engine
        .start(
            vec![StepSpec::task("only", "dev", "work", &[])],
            StartOptions::default(),
        )
        .await
        .unwrap();
    coordinator.engine.join(&run_id).await.unwrap();

    let events = step_events.lock().unwrap().clone();
    assert_eq!(
        events,
        vec![
            ("only".to_string(), "running".to_string()),
            ("only".to_string(), "completed".to_string()),
        ]
    );
}

#[tokio::test]
async fn approval_listing_spans_runs() {
    let (coordinator, _backend) = coordinator(20).await;

    let mut run_ids = Vec::new();
    for _ in 0..2 {
        let run_id = coordinator
            .engine
            .start(vec![approval_step("gate", &[], 3600)], StartOptions::default())
            .await
            .unwrap();
        run_ids.push(run_id);
    }
    for run_id in &run_ids {
        while coordinator
            .approvals
            .find_open(run_id, "gate")
            .await
            .unwrap()
            .is_none()
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    let page = coordinator
        .approvals
        .list(ApprovalFilter {
            run_id: None,
            statuses: vec![ApprovalStatus::Pending],
            page: 1,
            page_size: 10,
        })
        .await
        .unwrap();
    assert_eq!(page.total, 2);
    assert_eq!(page.summary.pending, 2);

    // Scoped to one run.
    let page = coordinator
        .approvals
        .list(ApprovalFilter {
            run_id: Some(run_ids[0].clone()),
            statuses: vec![],
            page: 1,
            page_size: 10,
        })
        .await
        .unwrap();
    assert_eq!(page.total, 1);

    for run_id in &run_ids {
        coordinator.engine.abort(run_id).await.unwrap();
        coordinator.engine.join(run_id).await.unwrap();
    }
}

#[tokio::test]
async fn abort_then_resume_round_trip() {
    let (coordinator, backend) = coordinator(20).await;

    let run_id = coordinator
        .engine
        .start(vec![approval_step("gate", &[], 3600)], StartOptions::default())
        .await
        .unwrap();
    while coordinator
        .approvals
        .find_open(&run_id, "gate")
        .await
        .unwrap()
        .is_none()
    {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    coordinator.engine.abort(&run_id).await.unwrap();
    coordinator.engine.join(&run_id).await.unwrap();
    assert_eq!(
        coordinator.engine.status(&run_id).await.unwrap().run.status,
        RunStatus::Aborted
    );

    // Resume re-opens the gate with a fresh approval.
    coordinator.engine.resume(&run_id, None).await.unwrap();
    let approval = loop {
        match coordinator.approvals.find_open(&run_id, "gate").await.unwrap() {
            Some(approval) => break approval,
            None => tokio::time::sleep(Duration::from_millis(10)).await,
        }
    };
    coordinator
        .approvals
        .decide(&approval.id, Decision::Approved, "bob", None, None)
        .await
        .unwrap();
    coordinator.engine.join(&run_id).await.unwrap();

    assert_eq!(
        coordinator.engine.status(&run_id).await.unwrap().run.status,
        RunStatus::Completed
    );
    assert!(backend.requests().is_empty());
}

#[tokio::test]
async fn persisted_runs_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("conductor.db").to_string_lossy().to_string();
    let backend = ScriptedBackend::echoing();

    let run_id = {
        let coordinator = Coordinator::new(
            CoordinatorConfig {
                db_path: Some(db_path.clone()),
                approval_poll_ms: 20,
                ..CoordinatorConfig::default()
            },
            Arc::new(backend.clone()),
        )
        .await
        .unwrap();
        let run_id = coordinator
            .engine
            .start(
                vec![StepSpec::task("s1", "dev", "build", &[])],
                StartOptions::default(),
            )
            .await
            .unwrap();
        coordinator.engine.join(&run_id).await.unwrap();
        run_id
    };

    // A fresh coordinator over the same file sees the finished run.
    let coordinator = Coordinator::new(
        CoordinatorConfig {
            db_path: Some(db_path),
            ..CoordinatorConfig::default()
        },
        Arc::new(backend),
    )
    .await
    .unwrap();
    let snapshot = coordinator.engine.status(&run_id).await.unwrap();
    assert_eq!(snapshot.run.status, RunStatus::Completed);
    assert_eq!(snapshot.step_status("s1"), Some(StepStatus::Completed));
}
