//! Task lifecycle controller.
//!
//! `submit` validates configuration, persists a Pending task, and schedules
//! execution on its own tokio task; `cancel` is safe at any point in the
//! task's life; `status` merges the persisted record with live worker-tree
//! counters without ever blocking on the running task.
//!
//! Each accepted task runs under a supervisor that owns the terminal
//! commit: the execution future is spawned separately so its `JoinHandle`
//! doubles as the forced-interrupt handle. Cancellation and the wall-clock
//! timeout race the execution; the cooperative path gets a grace period
//! before the handle is aborted, and a forced abort is surfaced exactly
//! like a cooperative exit. Cleanup runs unconditionally on every path.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use vigil_core::events::AuditEvent;
use vigil_core::task::{
    AuditTask, ConfigError, ProjectSource, SeverityCounts, TaskConfig, TaskStatus,
    VerificationLevel, VulnClass,
};
use vigil_core::text::safe_error_message;
use vigil_settings::VigilSettings;
use vigil_store::AuditStore;

use crate::cancel::CancelRegistry;
use crate::errors::{Result, RuntimeError};
use crate::machine::{MachineReport, PhaseMachine, TaskContext};
use crate::pipeline::stream::{StreamItem, subscribe};
use crate::pipeline::{EventPipeline, SubscriberRegistry};
use crate::router::RouterClient;
use crate::workers::{NodeRole, WorkerArena, WorkerFactory};
use crate::workspace::{AcquireError, WorkspaceProvider};

/// Submission request: project reference plus per-task config overrides.
/// Unset budgets fall back to the account defaults in settings.
#[derive(Clone, Debug)]
pub struct SubmitRequest {
    /// Project under audit.
    pub project: ProjectSource,
    /// Vulnerability classes in scope.
    pub scope: Vec<VulnClass>,
    /// Verification depth.
    pub verification: VerificationLevel,
    /// Task-level exclude globs (account defaults are merged in later).
    pub exclude: Vec<String>,
    /// Target-file globs; empty means the whole tree.
    pub target_files: Vec<String>,
    /// Iteration budget override.
    pub max_iterations: Option<u32>,
    /// Wall-clock budget override.
    pub timeout_secs: Option<u64>,
}

/// Point-in-time task view: persisted record merged with live counters.
#[derive(Clone, Debug)]
pub struct StatusSnapshot {
    /// The task record, with live counters folded in while running.
    pub task: AuditTask,
    /// Whether a worker tree is currently executing this task.
    pub live: bool,
}

/// How a supervised execution ended.
enum Outcome {
    Completed(MachineReport),
    Cancelled,
    Failed(String),
    TimedOut(u64),
}

/// Top-level orchestrator driving tasks from submission to terminal state.
pub struct TaskController {
    store: Arc<AuditStore>,
    pipeline: Arc<EventPipeline>,
    cancels: Arc<CancelRegistry>,
    arena: Arc<WorkerArena>,
    router: Arc<dyn RouterClient>,
    workers: Arc<dyn WorkerFactory>,
    provider: Arc<dyn WorkspaceProvider>,
    settings: Arc<VigilSettings>,
    run_semaphore: Arc<Semaphore>,
    supervisors: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TaskController {
    /// Build a controller over the shared engine components.
    pub fn new(
        store: Arc<AuditStore>,
        router: Arc<dyn RouterClient>,
        workers: Arc<dyn WorkerFactory>,
        provider: Arc<dyn WorkspaceProvider>,
        settings: Arc<VigilSettings>,
    ) -> Arc<Self> {
        let subscribers = Arc::new(SubscriberRegistry::new(
            settings.stream.buffer_capacity,
            settings.stream.channel_capacity,
        ));
        let pipeline = Arc::new(EventPipeline::new(
            Arc::clone(&store),
            subscribers,
            settings.events.tool_output_budget_bytes,
        ));
        Arc::new(Self {
            store,
            pipeline,
            cancels: Arc::new(CancelRegistry::new()),
            arena: Arc::new(WorkerArena::new()),
            router,
            workers,
            provider,
            run_semaphore: Arc::new(Semaphore::new(settings.scheduler.max_concurrent_tasks)),
            settings,
            supervisors: Mutex::new(HashMap::new()),
        })
    }

    /// The event pipeline (shared with embedders that emit their own logs).
    pub fn pipeline(&self) -> &Arc<EventPipeline> {
        &self.pipeline
    }

    // ─────────────────────────────────────────────────────────────────────
    // Public contract: submit / cancel / status / events
    // ─────────────────────────────────────────────────────────────────────

    /// Validate, persist a Pending task, schedule execution, return its id.
    #[instrument(skip_all)]
    pub fn submit(self: &Arc<Self>, request: SubmitRequest) -> Result<String> {
        let config = TaskConfig {
            scope: request.scope,
            verification: request.verification,
            exclude: request.exclude,
            target_files: request.target_files,
            max_iterations: request
                .max_iterations
                .unwrap_or(self.settings.audit.max_iterations),
            timeout_secs: request
                .timeout_secs
                .unwrap_or(self.settings.audit.timeout_secs),
        };
        config.validate()?;
        if let ProjectSource::Archive { path } = &request.project {
            if !Path::new(path).is_file() {
                return Err(ConfigError::MissingProject(path.clone()).into());
            }
        }

        let task = AuditTask::new(request.project, config);
        self.store.create_task(&task)?;

        // Registry lifecycle: create on submit, destroy on terminal cleanup.
        let token = self.cancels.register(&task.id);
        self.pipeline.subscribers().register(&task.id);

        counter!("tasks_submitted_total").increment(1);
        info!(task_id = %task.id, "task submitted");

        let controller = Arc::clone(self);
        let task_id = task.id.clone();
        let handle = tokio::spawn(async move {
            controller.supervise(&task_id, token).await;
        });
        let _ = self.supervisors.lock().insert(task.id.clone(), handle);
        Ok(task.id)
    }

    /// Request cancellation. Safe at any point in the task's life; a no-op
    /// for unknown or already-terminal tasks. Returns whether the request
    /// was recorded against a live task.
    #[instrument(skip(self))]
    pub fn cancel(&self, task_id: &str) -> Result<bool> {
        match self.store.get_task(task_id)? {
            None => Ok(false),
            Some(task) if task.status.is_terminal() => Ok(false),
            Some(_) => {
                self.cancels.request(task_id);
                Ok(true)
            }
        }
    }

    /// Snapshot of the persisted record merged with live in-memory
    /// counters. Never blocks on the running task.
    pub fn status(&self, task_id: &str) -> Result<StatusSnapshot> {
        let mut task = self
            .store
            .get_task(task_id)?
            .ok_or_else(|| RuntimeError::TaskNotFound(task_id.to_string()))?;
        let live = task.status == TaskStatus::Running;
        if live {
            let live_counters = self.arena.aggregate(task_id);
            task.progress.files_scanned = task.progress.files_scanned.max(live_counters.files_scanned);
            task.progress.iterations = task.progress.iterations.max(live_counters.iterations);
            task.progress.tool_calls = task.progress.tool_calls.max(live_counters.tool_calls);
            task.progress.tokens_used = task.progress.tokens_used.max(live_counters.tokens_used);
        }
        Ok(StatusSnapshot { task, live })
    }

    /// Live event subscription (durable-storage fallback for finished
    /// tasks). Dropping the stream detaches with no side effects.
    pub fn subscribe_events(
        &self,
        task_id: &str,
        after_sequence: i64,
    ) -> impl Stream<Item = StreamItem> + Send + use<> {
        subscribe(
            Arc::clone(&self.store),
            Arc::clone(self.pipeline.subscribers()),
            task_id.to_string(),
            after_sequence,
            self.settings.stream.clone(),
        )
    }

    /// Paged historical query of events after a sequence number.
    pub fn events_after(
        &self,
        task_id: &str,
        after_sequence: i64,
        limit: i64,
    ) -> Result<Vec<AuditEvent>> {
        Ok(self.store.events_after(task_id, after_sequence, limit)?)
    }

    /// Graceful shutdown: cancel every live task and wait for terminals.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        info!("controller shutdown initiated");
        let handles: Vec<(String, JoinHandle<()>)> = self.supervisors.lock().drain().collect();
        for (task_id, _) in &handles {
            self.cancels.request(task_id);
        }
        for (_, handle) in handles {
            let _ = handle.await;
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Supervision
    // ─────────────────────────────────────────────────────────────────────

    /// Run one task under supervision and commit exactly one terminal.
    async fn supervise(self: &Arc<Self>, task_id: &str, cancel: CancellationToken) {
        // Concurrency ceiling: queue for a permit, but let a cancel of a
        // still-queued task win immediately.
        let permit = tokio::select! {
            permit = Arc::clone(&self.run_semaphore).acquire_owned() => {
                match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                }
            }
            () = cancel.cancelled() => {
                self.commit_terminal(task_id, Outcome::Cancelled);
                return;
            }
        };
        gauge!("tasks_active").increment(1.0);

        let outcome = self.run_supervised(task_id, &cancel).await;
        self.commit_terminal(task_id, outcome);

        gauge!("tasks_active").decrement(1.0);
        drop(permit);
    }

    /// Race execution against cancellation and the wall-clock timeout.
    async fn run_supervised(self: &Arc<Self>, task_id: &str, cancel: &CancellationToken) -> Outcome {
        // Cancellation requested before pickup: first safe point honors it.
        if cancel.is_cancelled() {
            return Outcome::Cancelled;
        }

        let timeout_secs = match self.store.get_task(task_id) {
            Ok(Some(task)) => task.config.timeout_secs,
            Ok(None) => return Outcome::Failed(format!("task not found: {task_id}")),
            Err(e) => return Outcome::Failed(safe_error_message(&e.to_string())),
        };

        // The execution future gets its own tokio task so this JoinHandle
        // is the forced-interrupt handle for everything under it,
        // including blocking network/model/tool calls that never poll the
        // cooperative flag.
        let controller = Arc::clone(self);
        let exec_task_id = task_id.to_string();
        let exec_cancel = cancel.clone();
        let mut execution: JoinHandle<Result<MachineReport>> =
            tokio::spawn(async move { controller.execute_task(&exec_task_id, &exec_cancel).await });

        let grace = Duration::from_millis(self.settings.cancel.force_grace_ms);

        tokio::select! {
            result = &mut execution => Self::map_execution(result),
            () = cancel.cancelled() => {
                // Give the cooperative path a grace window, then abort.
                match tokio::time::timeout(grace, &mut execution).await {
                    Ok(result) => {
                        let outcome = Self::map_execution(result);
                        // Cancellation was requested; a success that slipped
                        // in under the wire still counts, anything else is
                        // the cancelled outcome.
                        match outcome {
                            Outcome::Completed(report) => Outcome::Completed(report),
                            _ => Outcome::Cancelled,
                        }
                    }
                    Err(_) => {
                        warn!(task_id, grace_ms = grace.as_millis() as u64, "forcing interrupt after grace period");
                        counter!("tasks_force_interrupted_total").increment(1);
                        execution.abort();
                        let _ = execution.await;
                        Outcome::Cancelled
                    }
                }
            }
            () = tokio::time::sleep(Duration::from_secs(timeout_secs)) => {
                warn!(task_id, timeout_secs, "wall-clock budget elapsed");
                // Unified with cancellation: flip the shared flag, grace,
                // then force.
                cancel.cancel();
                match tokio::time::timeout(grace, &mut execution).await {
                    Ok(result) => match Self::map_execution(result) {
                        Outcome::Completed(report) => Outcome::Completed(report),
                        _ => Outcome::TimedOut(timeout_secs),
                    },
                    Err(_) => {
                        execution.abort();
                        let _ = execution.await;
                        Outcome::TimedOut(timeout_secs)
                    }
                }
            }
        }
    }

    fn map_execution(result: std::result::Result<Result<MachineReport>, tokio::task::JoinError>) -> Outcome {
        match result {
            Ok(Ok(report)) => Outcome::Completed(report),
            Ok(Err(RuntimeError::Cancelled)) => Outcome::Cancelled,
            Ok(Err(e)) => Outcome::Failed(safe_error_message(&e.to_string())),
            Err(join_error) if join_error.is_cancelled() => Outcome::Cancelled,
            Err(join_error) => {
                // Unclassified panic: caught at the outermost boundary.
                error!(error = %join_error, "execution task panicked");
                Outcome::Failed("internal execution failure".into())
            }
        }
    }

    /// The execution algorithm: Running → acquire → resolve config →
    /// worker tree → phase machine.
    async fn execute_task(
        self: &Arc<Self>,
        task_id: &str,
        cancel: &CancellationToken,
    ) -> Result<MachineReport> {
        let task = self
            .store
            .get_task(task_id)?
            .ok_or_else(|| RuntimeError::TaskNotFound(task_id.to_string()))?;

        // (1) Running, with Planning visible to observers immediately.
        let _ = self.store.transition(task_id, TaskStatus::Running, None)?;
        let _ = self
            .store
            .set_phase(task_id, Some(vigil_core::task::Phase::Planning))?;
        let _ = self
            .pipeline
            .phase_start(task_id, vigil_core::task::Phase::Planning)?;

        // (2) Workspace acquisition, aborting on cancellation.
        let workspace = self
            .provider
            .acquire(&task.project, cancel)
            .await
            .map_err(|e| match e {
                AcquireError::Cancelled => RuntimeError::Cancelled,
                other => RuntimeError::Acquire(other),
            })?;

        // (3) Effective configuration: task overrides over account defaults.
        let config = self.effective_config(&task.config);
        let _ = self.pipeline.log(
            task_id,
            Some(vigil_core::task::Phase::Planning),
            "effective configuration resolved",
            json!({ "config": config }),
        )?;

        // (4) Worker tree root, wired to the shared pipeline and token.
        let root_node_id = self.arena.spawn(task_id, NodeRole::Root, None);

        // (5) Hand control to the phase machine.
        let machine = PhaseMachine::new(
            Arc::clone(&self.pipeline),
            Arc::clone(&self.router),
            Arc::clone(&self.workers),
            Arc::clone(&self.arena),
        );
        let ctx = TaskContext {
            task_id: task_id.to_string(),
            config,
            workspace_root: workspace.root().to_path_buf(),
            cancel: cancel.clone(),
            root_node_id,
            verification_threshold: self.settings.audit.verification_threshold,
            planning_started: true,
        };
        let report = machine.run(&ctx).await?;

        debug!(task_id, phases = report.phases_run.len(), "execution finished");
        // Workspace released here on drop.
        Ok(report)
    }

    /// Account defaults merged under the task's own configuration.
    fn effective_config(&self, task_config: &TaskConfig) -> TaskConfig {
        let mut config = task_config.clone();
        for pattern in &self.settings.audit.exclude {
            if !config.exclude.contains(pattern) {
                config.exclude.push(pattern.clone());
            }
        }
        config
    }

    /// Commit exactly one terminal status, then clean up unconditionally.
    fn commit_terminal(&self, task_id: &str, outcome: Outcome) {
        let (status, error) = match outcome {
            Outcome::Completed(_) => (TaskStatus::Completed, None),
            Outcome::Cancelled => (TaskStatus::Cancelled, None),
            Outcome::Failed(message) => (TaskStatus::Failed, Some(message)),
            Outcome::TimedOut(secs) => (
                TaskStatus::Failed,
                Some(format!("task timed out after {secs}s")),
            ),
        };

        // (6) Completion rollup: severity counts and score over findings
        // that survived verification.
        if status == TaskStatus::Completed {
            match self.store.findings(task_id) {
                Ok(findings) => {
                    let mut counts = SeverityCounts::default();
                    for finding in findings
                        .iter()
                        .filter(|f| f.status != vigil_core::finding::FindingStatus::FalsePositive)
                    {
                        counts.record(finding.severity);
                    }
                    let score = counts.risk_score();
                    if let Err(e) = self.store.set_outcome(task_id, &counts, score) {
                        warn!(task_id, error = %e, "failed to record outcome rollup");
                    }
                }
                Err(e) => warn!(task_id, error = %e, "failed to load findings for rollup"),
            }
        }

        // (8a) Flush the worker-tree snapshot before the stream closes.
        let snapshot = self.arena.snapshot(task_id);
        if snapshot.as_array().is_some_and(|nodes| !nodes.is_empty()) {
            let progress = self.arena.aggregate(task_id);
            let _ = self.store.set_progress(task_id, &progress);
            if let Err(e) = self
                .pipeline
                .log(task_id, None, "worker tree flushed", json!({ "nodes": snapshot }))
            {
                warn!(task_id, error = %e, "failed to flush worker tree snapshot");
            }
        }

        // Terminal transition, then the terminal event (storage-first).
        match self.store.transition(task_id, status, error.as_deref()) {
            Ok(_) => {
                counter!("tasks_terminal_total", "status" => status.as_str()).increment(1);
                info!(task_id, status = status.as_str(), "task terminal");
                if let Err(e) = self.pipeline.terminal(task_id, status, error.as_deref()) {
                    warn!(task_id, error = %e, "failed to emit terminal event");
                }
            }
            Err(e) => {
                // Single-committer discipline makes this unreachable in
                // practice; log rather than mask the earlier outcome.
                error!(task_id, error = %e, "terminal transition rejected");
            }
        }

        // (8b) Unconditional cleanup: registries, arena, supervisor entry.
        let _ = self.arena.remove_task(task_id);
        self.pipeline.subscribers().remove(task_id);
        self.cancels.remove(task_id);
        let _ = self.supervisors.lock().remove(task_id);
    }
}
