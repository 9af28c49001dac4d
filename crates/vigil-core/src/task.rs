//! Audit task model: status graph, phases, and validated configuration.
//!
//! Key invariants enforced here:
//!
//! - **Absorbing terminals**: `Completed`, `Failed`, and `Cancelled` reject
//!   every outgoing transition. [`TaskStatus::can_transition_to`] is the
//!   single source of truth; the store refuses writes that violate it.
//! - **Validated config**: [`TaskConfig::validate`] rejects empty scopes,
//!   out-of-bounds iteration/timeout budgets, and malformed glob filters
//!   before a task row is ever created.

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::finding::Severity;

/// Inclusive bounds for `max_iterations`.
pub const ITERATION_BOUNDS: (u32, u32) = (1, 64);
/// Inclusive bounds for `timeout_secs` (30 s .. 24 h).
pub const TIMEOUT_BOUNDS: (u64, u64) = (30, 86_400);

/// Lifecycle status of an audit task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Accepted and persisted, not yet picked up.
    Pending,
    /// The worker tree is executing.
    Running,
    /// Terminal: the investigation finished and findings were committed.
    Completed,
    /// Terminal: an unrecovered error stopped the task.
    Failed,
    /// Terminal: cancellation was requested and honored.
    Cancelled,
}

impl TaskStatus {
    /// Whether this status absorbs all further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// The status transition graph: `Pending → Running → {terminal}`.
    ///
    /// Terminal states reject everything, including self-transitions.
    pub fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Running | Self::Cancelled | Self::Failed),
            Self::Running => next.is_terminal(),
            Self::Completed | Self::Failed | Self::Cancelled => false,
        }
    }

    /// Stable SQL/wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One named stage of the investigation workflow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Initial planning before any workspace content is read.
    Planning,
    /// Entry-point and attack-surface discovery.
    Reconnaissance,
    /// Vulnerability analysis. Re-enterable from Verification.
    Analysis,
    /// Confirmation or rejection of candidate findings.
    Verification,
    /// Final report assembly.
    Reporting,
}

impl Phase {
    /// Stable SQL/wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Reconnaissance => "reconnaissance",
            Self::Analysis => "analysis",
            Self::Verification => "verification",
            Self::Reporting => "reporting",
        }
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planning" => Ok(Self::Planning),
            "reconnaissance" => Ok(Self::Reconnaissance),
            "analysis" => Ok(Self::Analysis),
            "verification" => Ok(Self::Verification),
            "reporting" => Ok(Self::Reporting),
            other => Err(format!("unknown phase: {other}")),
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of vulnerability classes an audit can scope to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VulnClass {
    /// SQL/command/template injection.
    Injection,
    /// Broken authentication or session handling.
    BrokenAuth,
    /// Cross-site scripting.
    Xss,
    /// Path traversal and unsafe file access.
    PathTraversal,
    /// Server-side request forgery.
    Ssrf,
    /// Unsafe deserialization.
    Deserialization,
    /// Misuse of cryptographic primitives.
    CryptoMisuse,
    /// TOCTOU and other race conditions.
    RaceCondition,
    /// Memory-safety violations in unsafe/native code.
    MemorySafety,
    /// Application logic flaws.
    LogicFlaw,
    /// Hardcoded secrets and credential exposure.
    SecretsExposure,
}

impl VulnClass {
    /// Stable wire name (kebab-case, matches serde rename).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Injection => "injection",
            Self::BrokenAuth => "broken-auth",
            Self::Xss => "xss",
            Self::PathTraversal => "path-traversal",
            Self::Ssrf => "ssrf",
            Self::Deserialization => "deserialization",
            Self::CryptoMisuse => "crypto-misuse",
            Self::RaceCondition => "race-condition",
            Self::MemorySafety => "memory-safety",
            Self::LogicFlaw => "logic-flaw",
            Self::SecretsExposure => "secrets-exposure",
        }
    }
}

/// How far verification is allowed to go.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VerificationLevel {
    /// Static reasoning only; no code is executed.
    AnalysisOnly,
    /// Candidate findings may be exercised inside the sandbox.
    Sandboxed,
    /// Sandboxed verification plus proof-of-concept generation.
    ExploitGeneration,
}

/// Where the project under audit comes from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProjectSource {
    /// A local archive (`.tar` / `.tar.gz`) to extract.
    Archive {
        /// Filesystem path of the archive.
        path: String,
    },
    /// A remote git repository.
    Repository {
        /// Clone/download URL.
        url: String,
        /// Explicit branch requested for this task, if any.
        #[serde(skip_serializing_if = "Option::is_none")]
        branch: Option<String>,
        /// Project default branch, if known.
        #[serde(skip_serializing_if = "Option::is_none")]
        default_branch: Option<String>,
    },
}

/// Configuration validation failure. Rejected synchronously at submit;
/// no task row is created.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The vulnerability scope is empty.
    #[error("vulnerability scope must name at least one class")]
    EmptyScope,
    /// `max_iterations` is outside [`ITERATION_BOUNDS`].
    #[error("max iterations {0} outside allowed range 1..=64")]
    IterationBounds(u32),
    /// `timeout_secs` is outside [`TIMEOUT_BOUNDS`].
    #[error("timeout {0}s outside allowed range 30s..=86400s")]
    TimeoutBounds(u64),
    /// A file filter glob failed to parse.
    #[error("invalid file filter '{pattern}': {reason}")]
    BadFilter {
        /// The offending glob pattern.
        pattern: String,
        /// Parser error text.
        reason: String,
    },
    /// The referenced project does not exist.
    #[error("project does not exist: {0}")]
    MissingProject(String),
}

/// Per-task audit configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskConfig {
    /// Vulnerability classes in scope. Must be non-empty.
    pub scope: Vec<VulnClass>,
    /// Verification depth.
    pub verification: VerificationLevel,
    /// Glob patterns for files to skip.
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Glob patterns restricting analysis to matching files. Empty = all.
    #[serde(default)]
    pub target_files: Vec<String>,
    /// Hard ceiling on total Analysis re-entries.
    pub max_iterations: u32,
    /// Wall-clock budget for the whole task.
    pub timeout_secs: u64,
}

impl TaskConfig {
    /// Validate scope, budgets, and filter globs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scope.is_empty() {
            return Err(ConfigError::EmptyScope);
        }
        if self.max_iterations < ITERATION_BOUNDS.0 || self.max_iterations > ITERATION_BOUNDS.1 {
            return Err(ConfigError::IterationBounds(self.max_iterations));
        }
        if self.timeout_secs < TIMEOUT_BOUNDS.0 || self.timeout_secs > TIMEOUT_BOUNDS.1 {
            return Err(ConfigError::TimeoutBounds(self.timeout_secs));
        }
        let _ = compile_filters(&self.exclude)?;
        let _ = compile_filters(&self.target_files)?;
        Ok(())
    }
}

/// Compile glob patterns into a matcher, surfacing the failing pattern.
pub fn compile_filters(patterns: &[String]) -> Result<GlobSet, ConfigError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| ConfigError::BadFilter {
            pattern: pattern.clone(),
            reason: e.to_string(),
        })?;
        let _ = builder.add(glob);
    }
    builder.build().map_err(|e| ConfigError::BadFilter {
        pattern: String::new(),
        reason: e.to_string(),
    })
}

/// Live progress counters, merged additively as phases report.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressCounters {
    /// Files examined so far.
    pub files_scanned: u64,
    /// Worker loop iterations consumed.
    pub iterations: u64,
    /// Tool invocations issued.
    pub tool_calls: u64,
    /// Model tokens consumed.
    pub tokens_used: u64,
}

impl ProgressCounters {
    /// Merge another counter set additively.
    pub fn absorb(&mut self, other: Self) {
        self.files_scanned += other.files_scanned;
        self.iterations += other.iterations;
        self.tool_calls += other.tool_calls;
        self.tokens_used += other.tokens_used;
    }
}

/// Per-severity finding counts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeverityCounts {
    /// Critical findings.
    pub critical: u32,
    /// High findings.
    pub high: u32,
    /// Medium findings.
    pub medium: u32,
    /// Low findings.
    pub low: u32,
    /// Informational findings.
    pub info: u32,
}

impl SeverityCounts {
    /// Record one finding of the given severity.
    pub fn record(&mut self, severity: Severity) {
        match severity {
            Severity::Critical => self.critical += 1,
            Severity::High => self.high += 1,
            Severity::Medium => self.medium += 1,
            Severity::Low => self.low += 1,
            Severity::Info => self.info += 1,
        }
    }

    /// Weighted risk score, capped at 100.
    pub fn risk_score(&self) -> f64 {
        let raw = f64::from(self.critical) * 10.0
            + f64::from(self.high) * 6.0
            + f64::from(self.medium) * 3.0
            + f64::from(self.low) * 1.0;
        raw.min(100.0)
    }
}

/// An audit task record. Created by the submission boundary; mutated only
/// by the lifecycle controller; immutable once terminal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditTask {
    /// Unique task ID (`task_` + UUID v7).
    pub id: String,
    /// Project under audit.
    pub project: ProjectSource,
    /// Lifecycle status.
    pub status: TaskStatus,
    /// Current phase while running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    /// Validated configuration.
    pub config: TaskConfig,
    /// Progress counters.
    pub progress: ProgressCounters,
    /// Per-severity finding counts, computed at completion.
    pub severity_counts: SeverityCounts,
    /// Weighted risk score, computed at completion.
    pub score: f64,
    /// Short, safe error string when `Failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Creation timestamp (RFC 3339).
    pub created_at: String,
    /// Set on the transition to `Running`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    /// Set on the transition to any terminal status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<String>,
}

impl AuditTask {
    /// Create a new pending task with a fresh `task_` ID.
    pub fn new(project: ProjectSource, config: TaskConfig) -> Self {
        Self {
            id: format!("task_{}", Uuid::now_v7()),
            project,
            status: TaskStatus::Pending,
            phase: None,
            config,
            progress: ProgressCounters::default(),
            severity_counts: SeverityCounts::default(),
            score: 0.0,
            error: None,
            created_at: chrono::Utc::now().to_rfc3339(),
            started_at: None,
            ended_at: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
