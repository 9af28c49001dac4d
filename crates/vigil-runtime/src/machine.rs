//! Phase state machine.
//!
//! `Planning → Reconnaissance → Analysis ⟲ → Verification → Reporting`,
//! with Analysis re-enterable from Verification. After each phase the
//! router proposes the next action (validated, deterministic fallback);
//! every transition is recorded as a `phase.end` event with its reason.
//! A hard ceiling on total Analysis entries forces Reporting regardless
//! of router output — the non-termination guard.
//!
//! Phase outputs merge into task state additively, never destructively:
//! findings are upserted by fingerprint as soon as a phase returns, so a
//! later stage failing can never lose earlier partial results.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use vigil_core::events::{PhaseEndPayload, RoutedBy};
use vigil_core::finding::FindingStatus;
use vigil_core::task::{Phase, TaskConfig};
use vigil_core::text::safe_error_message;

use crate::errors::{Result, RuntimeError};
use crate::pipeline::EventPipeline;
use crate::router::{PhaseAction, RouterClient, StateSummary, route};
use crate::workers::{NodeCounters, NodeRole, WorkerArena, WorkerError, WorkerFactory, WorkerInput};

/// Everything a phase run needs from the task.
pub struct TaskContext {
    /// Owning task.
    pub task_id: String,
    /// Effective (merged) configuration.
    pub config: TaskConfig,
    /// Acquired workspace root.
    pub workspace_root: PathBuf,
    /// Shared cooperative-cancellation token.
    pub cancel: CancellationToken,
    /// Root node of the worker tree.
    pub root_node_id: String,
    /// Findings needed before the Analysis fallback routes to Verification.
    pub verification_threshold: u32,
    /// Whether the controller already emitted `phase.start(Planning)` when
    /// the task went Running (the machine then skips the duplicate).
    pub planning_started: bool,
}

/// Summary of a completed machine run.
#[derive(Clone, Debug)]
pub struct MachineReport {
    /// Phases in execution order.
    pub phases_run: Vec<Phase>,
    /// Total Analysis entries consumed.
    pub analysis_entries: u32,
}

/// Drives one task's phases from Planning through Reporting.
pub struct PhaseMachine {
    pipeline: Arc<EventPipeline>,
    router: Arc<dyn RouterClient>,
    workers: Arc<dyn WorkerFactory>,
    arena: Arc<WorkerArena>,
}

impl PhaseMachine {
    /// Create a machine over the shared engine components.
    pub fn new(
        pipeline: Arc<EventPipeline>,
        router: Arc<dyn RouterClient>,
        workers: Arc<dyn WorkerFactory>,
        arena: Arc<WorkerArena>,
    ) -> Self {
        Self {
            pipeline,
            router,
            workers,
            arena,
        }
    }

    /// Run the machine to Reporting or a cancellation/failure exit.
    #[instrument(skip_all, fields(task_id = %ctx.task_id))]
    pub async fn run(&self, ctx: &TaskContext) -> Result<MachineReport> {
        let store = Arc::clone(self.pipeline.store());
        let mut phase = Phase::Planning;
        let mut analysis_entries: u32 = 0;
        let mut entry_points_total: u32 = 0;
        let mut phases_run = Vec::new();
        let mut first_phase = true;

        loop {
            // Phase boundary is a cancellation safe point.
            if ctx.cancel.is_cancelled() {
                return Err(RuntimeError::Cancelled);
            }
            if phase == Phase::Analysis {
                analysis_entries += 1;
            }
            phases_run.push(phase);
            if !(first_phase && ctx.planning_started) {
                let _ = store.set_phase(&ctx.task_id, Some(phase))?;
                let _ = self.pipeline.phase_start(&ctx.task_id, phase)?;
            }
            first_phase = false;

            let node_id =
                self.arena
                    .spawn(&ctx.task_id, NodeRole::Phase(phase), Some(&ctx.root_node_id));
            let worker = self.workers.create(phase);
            let input = WorkerInput {
                task_id: ctx.task_id.clone(),
                phase,
                workspace_root: ctx.workspace_root.clone(),
                config: ctx.config.clone(),
                cancel: ctx.cancel.clone(),
                node_id: node_id.clone(),
            };

            let output = match worker.run(input).await {
                Ok(output) => output,
                Err(WorkerError::Cancelled) => return Err(RuntimeError::Cancelled),
                Err(WorkerError::Failed(detail)) => {
                    let safe = safe_error_message(&detail);
                    let _ = self.pipeline.log(
                        &ctx.task_id,
                        Some(phase),
                        format!("{phase} worker failed"),
                        json!({ "error": safe }),
                    )?;
                    return Err(RuntimeError::Worker(safe));
                }
            };

            // Merge additively: counters, entry points, findings.
            self.arena.record(
                &node_id,
                NodeCounters {
                    iterations: output.iterations,
                    tool_calls: output.tool_calls,
                    tokens_used: output.tokens_used,
                    files_scanned: output.files_scanned,
                },
            );
            entry_points_total += output.entry_points;

            for finding in &output.findings {
                let stored = store.upsert_finding(finding)?;
                if stored.id == finding.id {
                    let _ = self.pipeline.finding_new(phase, finding)?;
                }
            }

            let progress = self.arena.aggregate(&ctx.task_id);
            let _ = store.set_progress(&ctx.task_id, &progress)?;
            let _ = self.pipeline.progress(&ctx.task_id, phase, &progress)?;

            if !output.success {
                let detail = output.error.clone().unwrap_or_else(|| "unspecified".into());
                if output.has_artifacts() {
                    // Partial results survive; the failure is absorbed as an event.
                    warn!(task_id = %ctx.task_id, %phase, detail, "worker failed with partial output");
                    let _ = self.pipeline.log(
                        &ctx.task_id,
                        Some(phase),
                        format!("{phase} worker failed, partial results kept"),
                        json!({ "error": safe_error_message(&detail) }),
                    )?;
                } else {
                    let safe = safe_error_message(&detail);
                    let _ = self.pipeline.log(
                        &ctx.task_id,
                        Some(phase),
                        format!("{phase} produced no artifact"),
                        json!({ "error": safe }),
                    )?;
                    return Err(RuntimeError::Worker(format!(
                        "{phase} produced no artifact: {safe}"
                    )));
                }
            }

            if phase == Phase::Reporting {
                let _ = self.pipeline.phase_end(
                    &ctx.task_id,
                    &PhaseEndPayload {
                        phase,
                        next: None,
                        reason: "report assembled".into(),
                        routed_by: RoutedBy::Fallback,
                    },
                )?;
                info!(task_id = %ctx.task_id, analysis_entries, "phase machine finished");
                return Ok(MachineReport {
                    phases_run,
                    analysis_entries,
                });
            }

            let summary = StateSummary {
                phase: Some(phase),
                analysis_entries,
                max_iterations: ctx.config.max_iterations,
                entry_points: entry_points_total,
                findings_new: store.count_findings_by_status(&ctx.task_id, FindingStatus::New)?,
                findings_verified: store
                    .count_findings_by_status(&ctx.task_id, FindingStatus::Verified)?,
                false_positives: store
                    .count_findings_by_status(&ctx.task_id, FindingStatus::FalsePositive)?,
                verification_threshold: ctx.verification_threshold,
            };

            let (mut action, mut reason, mut routed_by) =
                route(self.router.as_ref(), phase, &summary).await;

            // Non-termination guard: the iteration budget caps Analysis
            // re-entries no matter what the router says.
            if action == PhaseAction::Analysis && analysis_entries >= ctx.config.max_iterations {
                action = PhaseAction::Reporting;
                reason = format!(
                    "analysis iteration budget ({}) exhausted",
                    ctx.config.max_iterations
                );
                routed_by = RoutedBy::Fallback;
            }

            let _ = self.pipeline.phase_end(
                &ctx.task_id,
                &PhaseEndPayload {
                    phase,
                    next: Some(action.target()),
                    reason,
                    routed_by,
                },
            )?;
            phase = action.target();
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::result::Result;
    use async_trait::async_trait;
    use assert_matches::assert_matches;
    use vigil_core::events::EventKind;
    use vigil_core::finding::{Finding, Location, Severity};
    use vigil_core::task::{
        AuditTask, ProjectSource, TaskStatus, VerificationLevel, VulnClass,
    };
    use vigil_store::{AuditStore, ConnectionConfig, run_migrations};

    use crate::pipeline::SubscriberRegistry;
    use crate::router::{RouterDecision, RouterError};
    use crate::workers::{PhaseWorker, WorkerOutput};

    // ── Scripted collaborators ───────────────────────────────────────────

    /// Router that always recommends the same action.
    struct FixedRouter(PhaseAction);

    #[async_trait]
    impl RouterClient for FixedRouter {
        async fn decide(
            &self,
            _summary: &StateSummary,
            _allowed: &[PhaseAction],
        ) -> Result<RouterDecision, RouterError> {
            Ok(RouterDecision {
                action: self.0,
                reason: "scripted".into(),
            })
        }
    }

    /// Router that always fails, exercising the fallback everywhere.
    struct DownRouter;

    #[async_trait]
    impl RouterClient for DownRouter {
        async fn decide(
            &self,
            _summary: &StateSummary,
            _allowed: &[PhaseAction],
        ) -> Result<RouterDecision, RouterError> {
            Err(RouterError::Unavailable("model offline".into()))
        }
    }

    /// Worker that returns a canned output per phase.
    struct ScriptedWorker(WorkerOutput);

    #[async_trait]
    impl PhaseWorker for ScriptedWorker {
        async fn run(&self, _input: WorkerInput) -> Result<WorkerOutput, WorkerError> {
            Ok(self.0.clone())
        }
    }

    struct FailingWorker;

    #[async_trait]
    impl PhaseWorker for FailingWorker {
        async fn run(&self, _input: WorkerInput) -> Result<WorkerOutput, WorkerError> {
            Err(WorkerError::Failed("sandbox unavailable".into()))
        }
    }

    /// Factory mapping each phase to a scripted behavior.
    struct ScriptedFactory {
        recon: WorkerOutput,
        analysis: WorkerOutput,
        verification: WorkerOutput,
        fail_verification: bool,
    }

    impl ScriptedFactory {
        fn standard(task_id: &str) -> Self {
            Self {
                recon: WorkerOutput {
                    success: true,
                    entry_points: 2,
                    iterations: 1,
                    artifacts: json!({"entryPoints": ["login", "upload"]}),
                    ..Default::default()
                },
                analysis: WorkerOutput {
                    success: true,
                    iterations: 1,
                    tool_calls: 3,
                    tokens_used: 500,
                    findings: vec![
                        finding(task_id, "src/db.rs", 10),
                        finding(task_id, "src/auth.rs", 20),
                        finding(task_id, "src/api.rs", 30),
                    ],
                    artifacts: json!({"summary": "three sinks"}),
                    ..Default::default()
                },
                verification: WorkerOutput {
                    success: true,
                    iterations: 1,
                    findings: vec![verified(task_id, "src/db.rs", 10)],
                    artifacts: json!({"verified": 1}),
                    ..Default::default()
                },
                fail_verification: false,
            }
        }
    }

    impl WorkerFactory for ScriptedFactory {
        fn create(&self, phase: Phase) -> Arc<dyn PhaseWorker> {
            match phase {
                Phase::Planning => Arc::new(ScriptedWorker(WorkerOutput {
                    success: true,
                    artifacts: json!({"plan": "scoped"}),
                    ..Default::default()
                })),
                Phase::Reconnaissance => Arc::new(ScriptedWorker(self.recon.clone())),
                Phase::Analysis => Arc::new(ScriptedWorker(self.analysis.clone())),
                Phase::Verification => {
                    if self.fail_verification {
                        Arc::new(FailingWorker)
                    } else {
                        Arc::new(ScriptedWorker(self.verification.clone()))
                    }
                }
                Phase::Reporting => Arc::new(ScriptedWorker(WorkerOutput {
                    success: true,
                    artifacts: json!({"report": "done"}),
                    ..Default::default()
                })),
            }
        }
    }

    fn finding(task_id: &str, file: &str, line: u32) -> Finding {
        Finding::new(
            task_id,
            VulnClass::Injection,
            Severity::High,
            Location {
                file: file.into(),
                line: Some(line),
            },
            "sink(input)",
            0.7,
        )
    }

    fn verified(task_id: &str, file: &str, line: u32) -> Finding {
        let mut f = finding(task_id, file, line);
        f.status = FindingStatus::Verified;
        f.confidence = 0.95;
        f
    }

    // ── Fixture ──────────────────────────────────────────────────────────

    struct Fixture {
        pipeline: Arc<EventPipeline>,
        arena: Arc<WorkerArena>,
        task_id: String,
    }

    fn fixture(max_iterations: u32) -> Fixture {
        let pool = vigil_store::new_in_memory(&ConnectionConfig::default()).unwrap();
        {
            let conn = pool.get().unwrap();
            let _ = run_migrations(&conn).unwrap();
        }
        let store = Arc::new(AuditStore::new(pool));
        let task = AuditTask::new(
            ProjectSource::Archive {
                path: "/tmp/app.tar.gz".into(),
            },
            TaskConfig {
                scope: vec![VulnClass::Injection],
                verification: VerificationLevel::Sandboxed,
                exclude: vec![],
                target_files: vec![],
                max_iterations,
                timeout_secs: 600,
            },
        );
        store.create_task(&task).unwrap();
        let _ = store.transition(&task.id, TaskStatus::Running, None).unwrap();

        let subscribers = Arc::new(SubscriberRegistry::new(256, 256));
        subscribers.register(&task.id);
        Fixture {
            pipeline: Arc::new(EventPipeline::new(store, subscribers, 4_096)),
            arena: Arc::new(WorkerArena::new()),
            task_id: task.id,
        }
    }

    fn context(fixture: &Fixture, max_iterations: u32) -> TaskContext {
        let root_node_id = fixture.arena.spawn(&fixture.task_id, NodeRole::Root, None);
        TaskContext {
            task_id: fixture.task_id.clone(),
            config: TaskConfig {
                scope: vec![VulnClass::Injection],
                verification: VerificationLevel::Sandboxed,
                exclude: vec![],
                target_files: vec![],
                max_iterations,
                timeout_secs: 600,
            },
            workspace_root: "/tmp/ws".into(),
            cancel: CancellationToken::new(),
            root_node_id,
            verification_threshold: 3,
            planning_started: false,
        }
    }

    fn machine(fixture: &Fixture, router: Arc<dyn RouterClient>, workers: Arc<dyn WorkerFactory>) -> PhaseMachine {
        PhaseMachine::new(
            Arc::clone(&fixture.pipeline),
            router,
            workers,
            Arc::clone(&fixture.arena),
        )
    }

    // ── Tests ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn full_workflow_with_fallback_routing() {
        let fixture = fixture(4);
        let ctx = context(&fixture, 4);
        let factory = Arc::new(ScriptedFactory::standard(&fixture.task_id));
        let report = machine(&fixture, Arc::new(DownRouter), factory)
            .run(&ctx)
            .await
            .unwrap();

        // Fallback chain: Planning → Recon → Analysis (3 findings ≥
        // threshold) → Verification (1 verified, 0 FPs) → Reporting.
        assert_eq!(
            report.phases_run,
            vec![
                Phase::Planning,
                Phase::Reconnaissance,
                Phase::Analysis,
                Phase::Verification,
                Phase::Reporting
            ]
        );
        assert_eq!(report.analysis_entries, 1);

        // Findings persisted; the verified re-report merged, not duplicated.
        let findings = fixture.pipeline.store().findings(&fixture.task_id).unwrap();
        assert_eq!(findings.len(), 3);
        let verified_count = findings
            .iter()
            .filter(|f| f.status == FindingStatus::Verified)
            .count();
        assert_eq!(verified_count, 1);
    }

    #[tokio::test]
    async fn transition_events_carry_reasons() {
        let fixture = fixture(4);
        let ctx = context(&fixture, 4);
        let factory = Arc::new(ScriptedFactory::standard(&fixture.task_id));
        let _ = machine(&fixture, Arc::new(DownRouter), factory)
            .run(&ctx)
            .await
            .unwrap();

        let events = fixture
            .pipeline
            .store()
            .events_after(&fixture.task_id, 0, 1_000)
            .unwrap();
        let ends: Vec<&vigil_core::events::AuditEvent> = events
            .iter()
            .filter(|e| e.kind == EventKind::PhaseEnd)
            .collect();
        // One phase.end per phase run
        assert_eq!(ends.len(), 5);
        for event in &ends {
            let payload: PhaseEndPayload = serde_json::from_value(event.payload.clone()).unwrap();
            assert!(!payload.reason.is_empty());
        }
        // Final transition has no next phase
        let last: PhaseEndPayload = serde_json::from_value(ends[4].payload.clone()).unwrap();
        assert_eq!(last.next, None);
    }

    #[tokio::test]
    async fn iteration_ceiling_forces_reporting_against_stubborn_router() {
        let fixture = fixture(3);
        let ctx = context(&fixture, 3);
        // Analysis finds nothing, so the fallback would loop too; the
        // router insists on Analysis forever.
        let factory = Arc::new(ScriptedFactory {
            analysis: WorkerOutput {
                success: true,
                iterations: 1,
                artifacts: json!({"summary": "nothing yet"}),
                ..Default::default()
            },
            ..ScriptedFactory::standard(&fixture.task_id)
        });
        let report = machine(&fixture, Arc::new(FixedRouter(PhaseAction::Analysis)), factory)
            .run(&ctx)
            .await
            .unwrap();

        let analysis_runs = report
            .phases_run
            .iter()
            .filter(|p| **p == Phase::Analysis)
            .count();
        assert_eq!(analysis_runs, 3, "at most max_iterations Analysis entries");
        assert_eq!(*report.phases_run.last().unwrap(), Phase::Reporting);
    }

    #[tokio::test]
    async fn recon_without_entry_points_skips_to_reporting() {
        let fixture = fixture(4);
        let ctx = context(&fixture, 4);
        let factory = Arc::new(ScriptedFactory {
            recon: WorkerOutput {
                success: true,
                artifacts: json!({"entryPoints": []}),
                ..Default::default()
            },
            ..ScriptedFactory::standard(&fixture.task_id)
        });
        let report = machine(&fixture, Arc::new(DownRouter), factory)
            .run(&ctx)
            .await
            .unwrap();
        assert_eq!(
            report.phases_run,
            vec![Phase::Planning, Phase::Reconnaissance, Phase::Reporting]
        );
    }

    #[tokio::test]
    async fn worker_failure_without_artifacts_aborts_but_keeps_partials() {
        let fixture = fixture(4);
        let ctx = context(&fixture, 4);
        let factory = Arc::new(ScriptedFactory {
            fail_verification: true,
            ..ScriptedFactory::standard(&fixture.task_id)
        });
        let err = machine(&fixture, Arc::new(DownRouter), factory)
            .run(&ctx)
            .await
            .unwrap_err();
        assert_matches!(err, RuntimeError::Worker(_));

        // Analysis findings survived the verification failure.
        let findings = fixture.pipeline.store().findings(&fixture.task_id).unwrap();
        assert_eq!(findings.len(), 3);
    }

    #[tokio::test]
    async fn worker_failure_with_partial_output_is_absorbed() {
        let fixture = fixture(4);
        let ctx = context(&fixture, 4);
        let factory = Arc::new(ScriptedFactory {
            verification: WorkerOutput {
                success: false,
                error: Some("sandbox flaked on the last probe".into()),
                findings: vec![verified(&fixture.task_id, "src/db.rs", 10)],
                artifacts: json!({"verified": 1}),
                ..Default::default()
            },
            ..ScriptedFactory::standard(&fixture.task_id)
        });
        let report = machine(&fixture, Arc::new(DownRouter), factory)
            .run(&ctx)
            .await
            .unwrap();
        assert_eq!(*report.phases_run.last().unwrap(), Phase::Reporting);
    }

    #[tokio::test]
    async fn cancellation_at_phase_boundary_is_distinct() {
        let fixture = fixture(4);
        let ctx = context(&fixture, 4);
        ctx.cancel.cancel();
        let factory = Arc::new(ScriptedFactory::standard(&fixture.task_id));
        let err = machine(&fixture, Arc::new(DownRouter), factory)
            .run(&ctx)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn out_of_domain_router_answer_validated_at_planning() {
        let fixture = fixture(4);
        let ctx = context(&fixture, 4);
        // Verification is never a legal Planning successor; the machine
        // must fall back to Reconnaissance instead of trusting the model.
        let factory = Arc::new(ScriptedFactory::standard(&fixture.task_id));
        let report = machine(
            &fixture,
            Arc::new(FixedRouter(PhaseAction::Verification)),
            factory,
        )
        .run(&ctx)
        .await
        .unwrap();
        assert_eq!(report.phases_run[1], Phase::Reconnaissance);
    }

    #[tokio::test]
    async fn progress_counters_merge_additively() {
        let fixture = fixture(4);
        let ctx = context(&fixture, 4);
        let factory = Arc::new(ScriptedFactory::standard(&fixture.task_id));
        let _ = machine(&fixture, Arc::new(DownRouter), factory)
            .run(&ctx)
            .await
            .unwrap();

        let task = fixture
            .pipeline
            .store()
            .get_task(&fixture.task_id)
            .unwrap()
            .unwrap();
        // recon 1 + analysis 1 + verification 1 iterations (+ planning/reporting 0)
        assert_eq!(task.progress.iterations, 3);
        assert_eq!(task.progress.tool_calls, 3);
        assert_eq!(task.progress.tokens_used, 500);
    }

    #[tokio::test]
    async fn re_reported_fingerprint_emits_no_second_finding_event() {
        let fixture = fixture(4);
        let ctx = context(&fixture, 4);
        let factory = Arc::new(ScriptedFactory::standard(&fixture.task_id));
        let _ = machine(&fixture, Arc::new(DownRouter), factory)
            .run(&ctx)
            .await
            .unwrap();

        let events = fixture
            .pipeline
            .store()
            .events_after(&fixture.task_id, 0, 1_000)
            .unwrap();
        let finding_events = events
            .iter()
            .filter(|e| e.kind == EventKind::FindingNew)
            .count();
        // Three discoveries; the verification re-report merged silently.
        assert_eq!(finding_events, 3);
    }
}
