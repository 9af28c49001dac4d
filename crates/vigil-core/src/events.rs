//! Audit event model.
//!
//! Two event classes flow through the pipeline:
//!
//! - **Persisted** kinds (phase/tool/finding/progress/log/terminal) are
//!   written to durable storage before any live subscriber sees them.
//! - **Ephemeral** kinds (`thought.fragment`) reach live subscribers only
//!   and are reconstructable from the eventual persisted message.
//!
//! The base event is a flat struct with an opaque `payload`, matching the
//! stored wire format. Typed payload structs exist for the kinds whose
//! payloads the engine itself reads back.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::finding::{Finding, Severity};
use crate::task::{Phase, TaskStatus};

/// Event kind discriminator. Closed set; dotted names on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// A phase began.
    #[serde(rename = "phase.start")]
    PhaseStart,
    /// A phase ended; payload records the transition and its reason.
    #[serde(rename = "phase.end")]
    PhaseEnd,
    /// A fragment of in-progress model output. Ephemeral, never persisted.
    #[serde(rename = "thought.fragment")]
    ThoughtFragment,
    /// A tool invocation started.
    #[serde(rename = "tool.start")]
    ToolStart,
    /// A tool invocation finished; payload carries duration and output.
    #[serde(rename = "tool.end")]
    ToolEnd,
    /// A new candidate finding was discovered.
    #[serde(rename = "finding.new")]
    FindingNew,
    /// Progress counter update.
    #[serde(rename = "progress")]
    Progress,
    /// Free-form diagnostic line.
    #[serde(rename = "log")]
    Log,
    /// The task reached a terminal status. Closes live streams.
    #[serde(rename = "task.terminal")]
    TaskTerminal,
}

impl EventKind {
    /// Whether this kind bypasses durable storage.
    pub fn is_ephemeral(self) -> bool {
        matches!(self, Self::ThoughtFragment)
    }

    /// Whether this kind ends the task's event stream.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::TaskTerminal)
    }

    /// Stable SQL/wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PhaseStart => "phase.start",
            Self::PhaseEnd => "phase.end",
            Self::ThoughtFragment => "thought.fragment",
            Self::ToolStart => "tool.start",
            Self::ToolEnd => "tool.end",
            Self::FindingNew => "finding.new",
            Self::Progress => "progress",
            Self::Log => "log",
            Self::TaskTerminal => "task.terminal",
        }
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "phase.start" => Ok(Self::PhaseStart),
            "phase.end" => Ok(Self::PhaseEnd),
            "thought.fragment" => Ok(Self::ThoughtFragment),
            "tool.start" => Ok(Self::ToolStart),
            "tool.end" => Ok(Self::ToolEnd),
            "finding.new" => Ok(Self::FindingNew),
            "progress" => Ok(Self::Progress),
            "log" => Ok(Self::Log),
            "task.terminal" => Ok(Self::TaskTerminal),
            other => Err(format!("unknown event kind: {other}")),
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An audit event. Sequence numbers are per-task and assigned by the
/// pipeline; persisted kinds are gap-free, ephemeral kinds carry the
/// sequence of the most recent persisted event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    /// Unique event ID (`evt_` + UUID v7).
    pub id: String,
    /// Task this event belongs to.
    pub task_id: String,
    /// Per-task monotonic sequence number.
    pub sequence: i64,
    /// Kind discriminator.
    pub kind: EventKind,
    /// Phase active when the event was emitted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    /// Optional human-readable message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Kind-specific data (opaque JSON).
    pub payload: Value,
    /// Emission timestamp (RFC 3339).
    pub timestamp: String,
}

impl AuditEvent {
    /// Build an event with a fresh ID and current timestamp.
    ///
    /// `sequence` starts at 0 and is overwritten by the pipeline.
    pub fn new(task_id: impl Into<String>, kind: EventKind, payload: Value) -> Self {
        Self {
            id: format!("evt_{}", Uuid::now_v7()),
            task_id: task_id.into(),
            sequence: 0,
            kind,
            phase: None,
            message: None,
            payload,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Attach the active phase.
    #[must_use]
    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = Some(phase);
        self
    }

    /// Attach a human-readable message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Typed payloads
// ─────────────────────────────────────────────────────────────────────────────

/// Who chose a phase transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutedBy {
    /// The coordinating model's recommendation was valid and used.
    Model,
    /// The deterministic fallback fired.
    Fallback,
}

/// Payload of a `phase.end` event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseEndPayload {
    /// Phase that just finished.
    pub phase: Phase,
    /// Phase chosen next, `None` when the task goes terminal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next: Option<Phase>,
    /// Router or fallback justification.
    pub reason: String,
    /// Transition provenance.
    pub routed_by: RoutedBy,
}

/// Payload of a `tool.start` event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolStartPayload {
    /// Pairing ID shared with the matching `tool.end`.
    pub tool_call_id: String,
    /// Tool name.
    pub tool: String,
    /// Tool input, truncated to the payload budget.
    pub input: Value,
}

/// Payload of a `tool.end` event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolEndPayload {
    /// Pairing ID shared with the matching `tool.start`.
    pub tool_call_id: String,
    /// Tool name.
    pub tool: String,
    /// Wall-clock duration.
    pub duration_ms: u64,
    /// Whether the tool reported an error.
    pub is_error: bool,
    /// Tool output, truncated (never dropped) to the payload budget.
    pub output: String,
    /// Set when `output` was truncated; original byte length.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_bytes: Option<usize>,
}

/// Payload of a `finding.new` event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindingPayload {
    /// Finding ID.
    pub finding_id: String,
    /// Vulnerability class wire name.
    pub class: String,
    /// Severity.
    pub severity: Severity,
    /// `file:line` location string.
    pub location: String,
    /// Dedupe fingerprint.
    pub fingerprint: String,
}

impl FindingPayload {
    /// Build from a finding.
    pub fn from_finding(finding: &Finding) -> Self {
        Self {
            finding_id: finding.id.clone(),
            class: finding.class.as_str().to_owned(),
            severity: finding.severity,
            location: finding.location.to_string(),
            fingerprint: finding.fingerprint.clone(),
        }
    }
}

/// Payload of a `task.terminal` event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalPayload {
    /// Final status (always terminal).
    pub status: TaskStatus,
    /// Short, safe error string for `Failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_round_trips_through_str() {
        for kind in [
            EventKind::PhaseStart,
            EventKind::PhaseEnd,
            EventKind::ThoughtFragment,
            EventKind::ToolStart,
            EventKind::ToolEnd,
            EventKind::FindingNew,
            EventKind::Progress,
            EventKind::Log,
            EventKind::TaskTerminal,
        ] {
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
        }
    }

    #[test]
    fn only_thought_fragment_is_ephemeral() {
        assert!(EventKind::ThoughtFragment.is_ephemeral());
        assert!(!EventKind::PhaseStart.is_ephemeral());
        assert!(!EventKind::TaskTerminal.is_ephemeral());
    }

    #[test]
    fn only_task_terminal_is_terminal() {
        assert!(EventKind::TaskTerminal.is_terminal());
        assert!(!EventKind::PhaseEnd.is_terminal());
    }

    #[test]
    fn new_event_has_evt_id_and_zero_sequence() {
        let event = AuditEvent::new("task_1", EventKind::Log, json!({"line": "hi"}));
        assert!(event.id.starts_with("evt_"));
        assert_eq!(event.task_id, "task_1");
        assert_eq!(event.sequence, 0);
        assert!(event.phase.is_none());
    }

    #[test]
    fn builder_attaches_phase_and_message() {
        let event = AuditEvent::new("task_1", EventKind::PhaseStart, json!({}))
            .with_phase(Phase::Analysis)
            .with_message("analysis started");
        assert_eq!(event.phase, Some(Phase::Analysis));
        assert_eq!(event.message.as_deref(), Some("analysis started"));
    }

    #[test]
    fn wire_format_is_camel_case_with_dotted_kind() {
        let event = AuditEvent::new("task_1", EventKind::ToolEnd, json!({}))
            .with_phase(Phase::Reconnaissance);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "tool.end");
        assert_eq!(json["taskId"], "task_1");
        assert_eq!(json["phase"], "reconnaissance");
        assert!(json["timestamp"].is_string());
        // Unset optional fields are omitted entirely
        assert!(json.get("message").is_none());
    }

    #[test]
    fn phase_end_payload_round_trips() {
        let payload = PhaseEndPayload {
            phase: Phase::Analysis,
            next: Some(Phase::Verification),
            reason: "finding threshold reached".into(),
            routed_by: RoutedBy::Fallback,
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["routedBy"], "fallback");
        assert_eq!(value["next"], "verification");
        let back: PhaseEndPayload = serde_json::from_value(value).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn tool_end_payload_omits_original_bytes_when_untruncated() {
        let payload = ToolEndPayload {
            tool_call_id: "tc_1".into(),
            tool: "grep".into(),
            duration_ms: 12,
            is_error: false,
            output: "ok".into(),
            original_bytes: None,
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert!(value.get("originalBytes").is_none());
        assert_eq!(value["durationMs"], 12);
    }

    #[test]
    fn terminal_payload_serializes_status() {
        let payload = TerminalPayload {
            status: TaskStatus::Cancelled,
            error: None,
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["status"], "cancelled");
    }
}
