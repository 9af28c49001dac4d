//! End-to-end engine tests: controller + machine + pipeline + store with
//! scripted workers, a stubbed workspace provider, and a dead router
//! (every transition goes through the deterministic fallback).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use vigil_core::events::EventKind;
use vigil_core::finding::{Finding, FindingStatus, Location, Severity};
use vigil_core::task::{
    AuditTask, Phase, ProjectSource, TaskStatus, VerificationLevel, VulnClass,
};
use vigil_runtime::workspace::Workspace;
use vigil_runtime::{
    AcquireError, PhaseWorker, RouterClient, RouterDecision, RouterError, RuntimeError,
    StateSummary, StreamItem, SubmitRequest, TaskController, WorkerError, WorkerFactory,
    WorkerInput, WorkerOutput, WorkspaceProvider,
};
use vigil_settings::VigilSettings;
use vigil_store::{AuditStore, ConnectionConfig, run_migrations};

// ─────────────────────────────────────────────────────────────────────────────
// Scripted collaborators
// ─────────────────────────────────────────────────────────────────────────────

/// Provider that hands out a ready-made local directory.
struct StubProvider {
    dir: tempfile::TempDir,
}

impl StubProvider {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.py"), "import os\n").unwrap();
        Self { dir }
    }
}

#[async_trait]
impl WorkspaceProvider for StubProvider {
    async fn acquire(
        &self,
        _project: &ProjectSource,
        cancel: &CancellationToken,
    ) -> Result<Workspace, AcquireError> {
        if cancel.is_cancelled() {
            return Err(AcquireError::Cancelled);
        }
        Ok(Workspace::local(self.dir.path().to_path_buf()))
    }
}

/// Router that is always down, exercising fallback routing end to end.
struct DownRouter;

#[async_trait]
impl RouterClient for DownRouter {
    async fn decide(
        &self,
        _summary: &StateSummary,
        _allowed: &[vigil_runtime::PhaseAction],
    ) -> Result<RouterDecision, RouterError> {
        Err(RouterError::Unavailable("model offline".into()))
    }
}

#[derive(Clone, Copy)]
enum WorkerMode {
    /// Full scripted flow: recon finds entry points, analysis reports
    /// three findings, verification confirms one.
    Standard,
    /// Every worker parks on the cancellation token (cooperative hang).
    HangCooperative,
    /// Every worker hangs forever and never polls the token.
    HangForever,
}

struct ScriptedWorker {
    phase: Phase,
    mode: WorkerMode,
}

fn finding(task_id: &str, file: &str) -> Finding {
    Finding::new(
        task_id,
        VulnClass::Injection,
        Severity::High,
        Location {
            file: file.into(),
            line: Some(10),
        },
        "sink(input)",
        0.7,
    )
}

#[async_trait]
impl PhaseWorker for ScriptedWorker {
    async fn run(&self, input: WorkerInput) -> Result<WorkerOutput, WorkerError> {
        match self.mode {
            WorkerMode::HangCooperative => {
                input.cancel.cancelled().await;
                return Err(WorkerError::Cancelled);
            }
            WorkerMode::HangForever => {
                let () = futures::future::pending().await;
                unreachable!();
            }
            WorkerMode::Standard => {}
        }
        let output = match self.phase {
            Phase::Planning => WorkerOutput {
                success: true,
                artifacts: json!({"plan": "scoped"}),
                ..Default::default()
            },
            Phase::Reconnaissance => WorkerOutput {
                success: true,
                entry_points: 2,
                iterations: 1,
                files_scanned: 20,
                artifacts: json!({"entryPoints": ["login", "upload"]}),
                ..Default::default()
            },
            Phase::Analysis => WorkerOutput {
                success: true,
                iterations: 1,
                tool_calls: 4,
                tokens_used: 800,
                findings: vec![
                    finding(&input.task_id, "src/db.py"),
                    finding(&input.task_id, "src/auth.py"),
                    finding(&input.task_id, "src/api.py"),
                ],
                artifacts: json!({"summary": "three sinks"}),
                ..Default::default()
            },
            Phase::Verification => {
                let mut verified = finding(&input.task_id, "src/db.py");
                verified.status = FindingStatus::Verified;
                verified.confidence = 0.95;
                WorkerOutput {
                    success: true,
                    iterations: 1,
                    findings: vec![verified],
                    artifacts: json!({"verified": 1}),
                    ..Default::default()
                }
            }
            Phase::Reporting => WorkerOutput {
                success: true,
                artifacts: json!({"report": "assembled"}),
                ..Default::default()
            },
        };
        Ok(output)
    }
}

struct ScriptedFactory(WorkerMode);

impl WorkerFactory for ScriptedFactory {
    fn create(&self, phase: Phase) -> Arc<dyn PhaseWorker> {
        Arc::new(ScriptedWorker {
            phase,
            mode: self.0,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Fixture
// ─────────────────────────────────────────────────────────────────────────────

fn make_store() -> Arc<AuditStore> {
    let pool = vigil_store::new_in_memory(&ConnectionConfig::default()).unwrap();
    {
        let conn = pool.get().unwrap();
        let _ = run_migrations(&conn).unwrap();
    }
    Arc::new(AuditStore::new(pool))
}

fn make_settings(max_concurrent: usize) -> VigilSettings {
    let mut settings = VigilSettings::default();
    settings.scheduler.max_concurrent_tasks = max_concurrent;
    settings.cancel.force_grace_ms = 200;
    settings.stream.poll_interval_ms = 20;
    settings.stream.heartbeat_interval_ms = 50;
    settings.stream.idle_timeout_ms = 2_000;
    settings
}

fn make_controller(mode: WorkerMode, max_concurrent: usize) -> (Arc<TaskController>, Arc<AuditStore>) {
    let store = make_store();
    let controller = TaskController::new(
        Arc::clone(&store),
        Arc::new(DownRouter),
        Arc::new(ScriptedFactory(mode)),
        Arc::new(StubProvider::new()),
        Arc::new(make_settings(max_concurrent)),
    );
    (controller, store)
}

fn request() -> SubmitRequest {
    SubmitRequest {
        project: ProjectSource::Repository {
            url: "https://git.example.com/acme/app".into(),
            branch: None,
            default_branch: None,
        },
        scope: vec![VulnClass::Injection, VulnClass::Ssrf],
        verification: VerificationLevel::Sandboxed,
        exclude: vec![],
        target_files: vec![],
        max_iterations: Some(4),
        timeout_secs: Some(600),
    }
}

/// Poll status until the task reaches a terminal state.
async fn wait_terminal(controller: &TaskController, task_id: &str) -> AuditTask {
    // Generous under paused time: virtual sleeps auto-advance, and the
    // wall-clock-timeout test needs to ride past a 60s virtual timer.
    for _ in 0..10_000 {
        let snapshot = controller.status(task_id).unwrap();
        if snapshot.task.status.is_terminal() {
            return snapshot.task;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {task_id} never reached a terminal state");
}

/// Poll status until the task is Running.
async fn wait_running(controller: &TaskController, task_id: &str) {
    for _ in 0..2_000 {
        let snapshot = controller.status(task_id).unwrap();
        if snapshot.task.status == TaskStatus::Running {
            return;
        }
        assert!(
            !snapshot.task.status.is_terminal(),
            "task went terminal while waiting for Running"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("task {task_id} never started running");
}

// ─────────────────────────────────────────────────────────────────────────────
// Submission validation
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn submit_rejects_empty_scope_without_creating_a_task() {
    let (controller, store) = make_controller(WorkerMode::Standard, 2);
    let mut bad = request();
    bad.scope.clear();

    let err = controller.submit(bad).unwrap_err();
    assert!(matches!(err, RuntimeError::Config(_)));
    assert!(store.list_tasks_by_status(TaskStatus::Pending).unwrap().is_empty());
}

#[tokio::test]
async fn submit_rejects_missing_archive() {
    let (controller, _) = make_controller(WorkerMode::Standard, 2);
    let mut bad = request();
    bad.project = ProjectSource::Archive {
        path: "/nonexistent/app.tar.gz".into(),
    };
    let err = controller.submit(bad).unwrap_err();
    assert!(err.to_string().contains("does not exist"));
}

#[tokio::test]
async fn submit_rejects_bad_iteration_budget() {
    let (controller, _) = make_controller(WorkerMode::Standard, 2);
    let mut bad = request();
    bad.max_iterations = Some(0);
    assert!(controller.submit(bad).is_err());
}

// ─────────────────────────────────────────────────────────────────────────────
// Happy path
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn full_audit_completes_with_rollup() {
    let (controller, store) = make_controller(WorkerMode::Standard, 2);
    let task_id = controller.submit(request()).unwrap();

    let task = wait_terminal(&controller, &task_id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.started_at.is_some());
    assert!(task.ended_at.is_some());

    // Three non-false-positive high findings → score 18.
    assert_eq!(task.severity_counts.high, 3);
    assert!((task.score - 18.0).abs() < f64::EPSILON);

    // Findings persisted, one verified via merge.
    let findings = store.findings(&task_id).unwrap();
    assert_eq!(findings.len(), 3);
    assert_eq!(
        findings
            .iter()
            .filter(|f| f.status == FindingStatus::Verified)
            .count(),
        1
    );

    // Progress merged additively across phases.
    assert_eq!(task.progress.tool_calls, 4);
    assert_eq!(task.progress.tokens_used, 800);
}

#[tokio::test]
async fn event_log_is_ordered_with_exactly_one_terminal() {
    let (controller, _) = make_controller(WorkerMode::Standard, 2);
    let task_id = controller.submit(request()).unwrap();
    let _ = wait_terminal(&controller, &task_id).await;

    let events = controller.events_after(&task_id, 0, 1_000).unwrap();
    assert!(!events.is_empty());

    // Strictly increasing, gap-free sequences.
    for (index, event) in events.iter().enumerate() {
        assert_eq!(event.sequence, index as i64 + 1);
    }

    // Exactly one terminal event, and it is last.
    let terminals: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| e.kind.is_terminal())
        .map(|(i, _)| i)
        .collect();
    assert_eq!(terminals, vec![events.len() - 1]);

    // First event announces Planning, per the execution algorithm.
    assert_eq!(events[0].kind, EventKind::PhaseStart);
    assert_eq!(events[0].phase, Some(Phase::Planning));
}

#[tokio::test]
async fn subscriber_sees_ordered_stream_with_one_terminal() {
    let (controller, _) = make_controller(WorkerMode::Standard, 2);
    let task_id = controller.submit(request()).unwrap();

    let stream = controller.subscribe_events(&task_id, 0);
    let items: Vec<StreamItem> = stream.collect().await;

    let sequences: Vec<i64> = items
        .iter()
        .filter_map(|item| match item {
            StreamItem::Event(e) => Some(e.sequence),
            StreamItem::Heartbeat => None,
        })
        .collect();
    assert!(!sequences.is_empty());
    assert!(sequences.windows(2).all(|w| w[0] < w[1]), "out of order: {sequences:?}");

    let terminal_count = items
        .iter()
        .filter(|item| matches!(item, StreamItem::Event(e) if e.kind.is_terminal()))
        .count();
    assert_eq!(terminal_count, 1);
}

#[tokio::test]
async fn paged_history_matches_full_history() {
    let (controller, _) = make_controller(WorkerMode::Standard, 2);
    let task_id = controller.submit(request()).unwrap();
    let _ = wait_terminal(&controller, &task_id).await;

    let full = controller.events_after(&task_id, 0, 1_000).unwrap();
    let mut paged = Vec::new();
    let mut cursor = 0;
    loop {
        let page = controller.events_after(&task_id, cursor, 3).unwrap();
        if page.is_empty() {
            break;
        }
        cursor = page.last().unwrap().sequence;
        paged.extend(page);
    }
    assert_eq!(paged, full);
}

// ─────────────────────────────────────────────────────────────────────────────
// Cancellation
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn cancel_mid_run_yields_cancelled_exactly_once() {
    let (controller, _) = make_controller(WorkerMode::HangCooperative, 2);
    let task_id = controller.submit(request()).unwrap();
    wait_running(&controller, &task_id).await;

    assert!(controller.cancel(&task_id).unwrap());
    let task = wait_terminal(&controller, &task_id).await;
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert!(task.error.is_none(), "cancellation is not an error");

    // Idempotent and absorbing: post-terminal cancel is a no-op.
    assert!(!controller.cancel(&task_id).unwrap());
    let after = controller.status(&task_id).unwrap().task;
    assert_eq!(after.status, TaskStatus::Cancelled);
    assert_eq!(after.ended_at, task.ended_at);
}

#[tokio::test]
async fn repeated_cancel_requests_are_noops() {
    let (controller, _) = make_controller(WorkerMode::HangCooperative, 2);
    let task_id = controller.submit(request()).unwrap();
    wait_running(&controller, &task_id).await;

    for _ in 0..5 {
        let _ = controller.cancel(&task_id).unwrap();
    }
    let task = wait_terminal(&controller, &task_id).await;
    assert_eq!(task.status, TaskStatus::Cancelled);
}

#[tokio::test]
async fn cancel_of_queued_task_never_runs_it() {
    // Single permit: the first task parks cooperatively and holds it.
    let (controller, _) = make_controller(WorkerMode::HangCooperative, 1);
    let blocker_id = controller.submit(request()).unwrap();
    wait_running(&controller, &blocker_id).await;

    let queued_id = controller.submit(request()).unwrap();
    assert!(controller.cancel(&queued_id).unwrap());

    let queued = wait_terminal(&controller, &queued_id).await;
    assert_eq!(queued.status, TaskStatus::Cancelled);
    assert!(queued.started_at.is_none(), "queued task must never start");

    let _ = controller.cancel(&blocker_id).unwrap();
    let _ = wait_terminal(&controller, &blocker_id).await;
}

#[tokio::test]
async fn cancel_unknown_task_is_a_noop() {
    let (controller, _) = make_controller(WorkerMode::Standard, 2);
    assert!(!controller.cancel("task_unknown").unwrap());
}

#[tokio::test]
async fn cancel_after_completion_is_a_noop() {
    let (controller, _) = make_controller(WorkerMode::Standard, 2);
    let task_id = controller.submit(request()).unwrap();
    let task = wait_terminal(&controller, &task_id).await;
    assert_eq!(task.status, TaskStatus::Completed);

    assert!(!controller.cancel(&task_id).unwrap());
    assert_eq!(
        controller.status(&task_id).unwrap().task.status,
        TaskStatus::Completed
    );
}

#[tokio::test(start_paused = true)]
async fn forced_interrupt_bounds_a_hanging_tool_call() {
    // Workers never poll the token: only the forced-interrupt handle can
    // stop them, within the configured grace period.
    let (controller, _) = make_controller(WorkerMode::HangForever, 2);
    let task_id = controller.submit(request()).unwrap();
    wait_running(&controller, &task_id).await;

    assert!(controller.cancel(&task_id).unwrap());
    let task = wait_terminal(&controller, &task_id).await;
    assert_eq!(task.status, TaskStatus::Cancelled, "forced abort surfaces as Cancelled");
}

#[tokio::test(start_paused = true)]
async fn wall_clock_timeout_fails_a_hung_task() {
    let (controller, _) = make_controller(WorkerMode::HangForever, 2);
    let mut req = request();
    req.timeout_secs = Some(60);
    let task_id = controller.submit(req).unwrap();

    let task = wait_terminal(&controller, &task_id).await;
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.as_deref().unwrap_or("").contains("timed out"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Status and shutdown
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn status_reports_live_flag_while_running() {
    let (controller, _) = make_controller(WorkerMode::HangCooperative, 2);
    let task_id = controller.submit(request()).unwrap();
    wait_running(&controller, &task_id).await;

    let snapshot = controller.status(&task_id).unwrap();
    assert!(snapshot.live);
    assert_eq!(snapshot.task.status, TaskStatus::Running);

    let _ = controller.cancel(&task_id).unwrap();
    let _ = wait_terminal(&controller, &task_id).await;
    assert!(!controller.status(&task_id).unwrap().live);
}

#[tokio::test]
async fn status_unknown_task_errors() {
    let (controller, _) = make_controller(WorkerMode::Standard, 2);
    assert!(matches!(
        controller.status("task_unknown"),
        Err(RuntimeError::TaskNotFound(_))
    ));
}

#[tokio::test]
async fn concurrent_tasks_complete_independently() {
    let (controller, _) = make_controller(WorkerMode::Standard, 4);
    let ids: Vec<String> = (0..4)
        .map(|_| controller.submit(request()).unwrap())
        .collect();

    for task_id in &ids {
        let task = wait_terminal(&controller, task_id).await;
        assert_eq!(task.status, TaskStatus::Completed);
    }
}

#[tokio::test]
async fn shutdown_cancels_all_live_tasks() {
    let (controller, _) = make_controller(WorkerMode::HangCooperative, 4);
    let a = controller.submit(request()).unwrap();
    let b = controller.submit(request()).unwrap();
    wait_running(&controller, &a).await;
    wait_running(&controller, &b).await;

    controller.shutdown().await;

    for task_id in [&a, &b] {
        let task = controller.status(task_id).unwrap().task;
        assert_eq!(task.status, TaskStatus::Cancelled);
    }
}

#[tokio::test]
async fn failed_task_carries_short_safe_error() {
    // A provider that always fails with a classified error.
    struct FailingProvider;

    #[async_trait]
    impl WorkspaceProvider for FailingProvider {
        async fn acquire(
            &self,
            _project: &ProjectSource,
            _cancel: &CancellationToken,
        ) -> Result<Workspace, AcquireError> {
            Err(AcquireError::Auth(
                "cannot access https://git.example.com/acme/app; check repository credentials"
                    .into(),
            ))
        }
    }

    let store = make_store();
    let controller = TaskController::new(
        Arc::clone(&store),
        Arc::new(DownRouter),
        Arc::new(ScriptedFactory(WorkerMode::Standard)),
        Arc::new(FailingProvider),
        Arc::new(make_settings(2)),
    );

    let task_id = controller.submit(request()).unwrap();
    let task = wait_terminal(&controller, &task_id).await;
    assert_eq!(task.status, TaskStatus::Failed);
    let error = task.error.unwrap();
    assert!(error.contains("credentials"), "actionable message: {error}");
    assert!(error.len() <= 512 + 16);
}
