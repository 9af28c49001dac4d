//! Phase routing — model recommendation with a deterministic fallback.
//!
//! The coordinating model only ever supplies a *hint*: its answer is
//! validated against the closed action set for the current phase, and any
//! failure (call error, unparseable output, out-of-domain action) falls
//! back to a total deterministic function. Both paths flow through the same
//! validation, so a routed transition is always a member of the allowed set.

use async_trait::async_trait;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use vigil_core::events::RoutedBy;
use vigil_core::task::Phase;

/// A routing action: the phase to run next. Closed set per state via
/// [`allowed_actions`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseAction {
    /// Run reconnaissance.
    Reconnaissance,
    /// Run (or re-run) analysis.
    Analysis,
    /// Run verification.
    Verification,
    /// Assemble the report and finish.
    Reporting,
}

impl PhaseAction {
    /// The phase this action transitions into.
    pub fn target(self) -> Phase {
        match self {
            Self::Reconnaissance => Phase::Reconnaissance,
            Self::Analysis => Phase::Analysis,
            Self::Verification => Phase::Verification,
            Self::Reporting => Phase::Reporting,
        }
    }
}

/// Actions valid after the given phase completes.
///
/// Reporting is terminal: no actions, the machine stops.
pub fn allowed_actions(phase: Phase) -> &'static [PhaseAction] {
    match phase {
        Phase::Planning => &[PhaseAction::Reconnaissance],
        Phase::Reconnaissance => &[PhaseAction::Analysis, PhaseAction::Reporting],
        Phase::Analysis => &[
            PhaseAction::Analysis,
            PhaseAction::Verification,
            PhaseAction::Reporting,
        ],
        Phase::Verification => &[PhaseAction::Analysis, PhaseAction::Reporting],
        Phase::Reporting => &[],
    }
}

/// Compact task-state summary handed to the router.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSummary {
    /// Phase that just finished.
    pub phase: Option<Phase>,
    /// Analysis entries consumed so far.
    pub analysis_entries: u32,
    /// Hard ceiling on analysis entries.
    pub max_iterations: u32,
    /// Entry points / risk areas discovered during reconnaissance.
    pub entry_points: u32,
    /// Findings still unverified.
    pub findings_new: i64,
    /// Findings confirmed by verification.
    pub findings_verified: i64,
    /// Findings rejected as false positives.
    pub false_positives: i64,
    /// Findings needed before the fallback routes to verification.
    pub verification_threshold: u32,
}

impl StateSummary {
    /// Whether the analysis iteration budget still has room.
    pub fn budget_remains(&self) -> bool {
        self.analysis_entries < self.max_iterations
    }
}

/// A router verdict: what to do next and why.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterDecision {
    /// Recommended action.
    pub action: PhaseAction,
    /// Model justification, recorded on the transition event.
    pub reason: String,
}

/// Router call failure. Always recovered locally via the fallback.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// The model call itself failed.
    #[error("router unavailable: {0}")]
    Unavailable(String),
    /// The model answered, but not in the expected shape.
    #[error("router answer unparseable: {0}")]
    Unparseable(String),
}

/// Client asking the coordinating model for a routing recommendation.
#[async_trait]
pub trait RouterClient: Send + Sync {
    /// Recommend one of `allowed` given the task state.
    async fn decide(
        &self,
        summary: &StateSummary,
        allowed: &[PhaseAction],
    ) -> Result<RouterDecision, RouterError>;
}

/// The total deterministic fallback.
///
/// - after Reconnaissance: Analysis iff an entry point or risk area was
///   found, else Reporting;
/// - after Analysis: Verification if findings reached the threshold or the
///   iteration budget is exhausted, else Analysis;
/// - after Verification: Analysis if false positives outweigh confirmed
///   findings and budget remains, else Reporting.
pub fn fallback_action(phase: Phase, summary: &StateSummary) -> (PhaseAction, String) {
    match phase {
        Phase::Planning => (
            PhaseAction::Reconnaissance,
            "planning complete".to_string(),
        ),
        Phase::Reconnaissance => {
            if summary.entry_points > 0 {
                (
                    PhaseAction::Analysis,
                    format!("{} entry points to analyze", summary.entry_points),
                )
            } else {
                (
                    PhaseAction::Reporting,
                    "no entry points or risk areas found".to_string(),
                )
            }
        }
        Phase::Analysis => {
            if summary.findings_new >= i64::from(summary.verification_threshold) {
                (
                    PhaseAction::Verification,
                    format!("{} unverified findings reached threshold", summary.findings_new),
                )
            } else if !summary.budget_remains() {
                (
                    PhaseAction::Verification,
                    "iteration budget exhausted".to_string(),
                )
            } else {
                (
                    PhaseAction::Analysis,
                    "below finding threshold with budget remaining".to_string(),
                )
            }
        }
        Phase::Verification => {
            if summary.false_positives > summary.findings_verified && summary.budget_remains() {
                (
                    PhaseAction::Analysis,
                    "false positives outweigh confirmed findings".to_string(),
                )
            } else {
                (PhaseAction::Reporting, "verification settled".to_string())
            }
        }
        Phase::Reporting => (PhaseAction::Reporting, "terminal".to_string()),
    }
}

/// Ask the router, validate its answer, fall back deterministically.
///
/// An out-of-domain recommendation is treated exactly like a failed call.
pub async fn route(
    router: &dyn RouterClient,
    phase: Phase,
    summary: &StateSummary,
) -> (PhaseAction, String, RoutedBy) {
    let allowed = allowed_actions(phase);
    if allowed.is_empty() {
        let (action, reason) = fallback_action(phase, summary);
        return (action, reason, RoutedBy::Fallback);
    }

    match router.decide(summary, allowed).await {
        Ok(decision) if allowed.contains(&decision.action) => {
            debug!(?phase, action = ?decision.action, "router decision accepted");
            counter!("router_decisions_total", "routed_by" => "model").increment(1);
            (decision.action, decision.reason, RoutedBy::Model)
        }
        Ok(decision) => {
            warn!(
                ?phase,
                action = ?decision.action,
                "router recommended an action invalid for this state, using fallback"
            );
            counter!("router_decisions_total", "routed_by" => "fallback").increment(1);
            let (action, reason) = fallback_action(phase, summary);
            (
                action,
                format!("fallback ({reason}); router suggested out-of-domain action"),
                RoutedBy::Fallback,
            )
        }
        Err(e) => {
            warn!(?phase, error = %e, "router call failed, using fallback");
            counter!("router_decisions_total", "routed_by" => "fallback").increment(1);
            let (action, reason) = fallback_action(phase, summary);
            (action, format!("fallback ({reason})"), RoutedBy::Fallback)
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
