//! Findings: candidate vulnerabilities with fingerprint deduplication.
//!
//! A finding's fingerprint is a SHA-256 over classification, location, and a
//! bounded snippet prefix. Re-reporting an existing fingerprint merges into
//! the stored row (status transition + confidence max) instead of creating a
//! duplicate; the store enforces uniqueness per task at the DB level.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::task::VulnClass;
use crate::text::truncate_str;

/// Snippet prefix length (bytes) folded into the fingerprint.
const FINGERPRINT_SNIPPET_BYTES: usize = 256;

/// Finding severity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational.
    Info,
    /// Low.
    Low,
    /// Medium.
    Medium,
    /// High.
    High,
    /// Critical.
    Critical,
}

impl Severity {
    /// Stable SQL/wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Self::Info),
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

/// Verification status of a finding.
///
/// `New` may transition to `Verified` or `FalsePositive`; both of those are
/// final. [`FindingStatus::can_transition_to`] mirrors the task status graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FindingStatus {
    /// Discovered during Analysis, not yet verified.
    New,
    /// Confirmed during Verification.
    Verified,
    /// Rejected during Verification.
    FalsePositive,
}

impl FindingStatus {
    /// Whether the status accepts the given transition.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::New, Self::Verified) | (Self::New, Self::FalsePositive)
        )
    }

    /// Stable SQL/wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Verified => "verified",
            Self::FalsePositive => "false-positive",
        }
    }
}

impl std::str::FromStr for FindingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "verified" => Ok(Self::Verified),
            "false-positive" => Ok(Self::FalsePositive),
            other => Err(format!("unknown finding status: {other}")),
        }
    }
}

/// Source location of a finding.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    /// Workspace-relative file path.
    pub file: String,
    /// 1-indexed line, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.line {
            Some(line) => write!(f, "{}:{line}", self.file),
            None => f.write_str(&self.file),
        }
    }
}

/// A candidate vulnerability reported by a worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    /// Unique finding ID (`fnd_` + UUID v7).
    pub id: String,
    /// Owning task.
    pub task_id: String,
    /// Vulnerability classification.
    pub class: VulnClass,
    /// Severity.
    pub severity: Severity,
    /// Source location.
    pub location: Location,
    /// Evidence snippet.
    pub snippet: String,
    /// Verification status.
    pub status: FindingStatus,
    /// Confidence in [0, 1].
    pub confidence: f64,
    /// Dedupe fingerprint, stable across re-reports of the same issue.
    pub fingerprint: String,
}

impl Finding {
    /// Create a new unverified finding with a computed fingerprint.
    pub fn new(
        task_id: impl Into<String>,
        class: VulnClass,
        severity: Severity,
        location: Location,
        snippet: impl Into<String>,
        confidence: f64,
    ) -> Self {
        let snippet = snippet.into();
        let fingerprint = fingerprint(class, &location, &snippet);
        Self {
            id: format!("fnd_{}", Uuid::now_v7()),
            task_id: task_id.into(),
            class,
            severity,
            location,
            snippet,
            status: FindingStatus::New,
            confidence: confidence.clamp(0.0, 1.0),
            fingerprint,
        }
    }

    /// Merge a re-report of the same fingerprint into this finding.
    ///
    /// Applies the incoming status only if the transition is legal, and keeps
    /// the higher confidence. Identity fields (id, location, snippet) are
    /// kept from the original report.
    pub fn merge(&mut self, incoming: &Finding) {
        if self.status.can_transition_to(incoming.status) {
            self.status = incoming.status;
        }
        if incoming.confidence > self.confidence {
            self.confidence = incoming.confidence;
        }
        if incoming.severity > self.severity {
            self.severity = incoming.severity;
        }
    }
}

/// Compute the dedupe fingerprint for a classification + location + snippet.
///
/// Hex SHA-256 of `class | file:line | snippet prefix` where the prefix is
/// at most [`FINGERPRINT_SNIPPET_BYTES`] bytes at a char boundary.
pub fn fingerprint(class: VulnClass, location: &Location, snippet: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(class.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(location.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(truncate_str(snippet, FINGERPRINT_SNIPPET_BYTES).as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
