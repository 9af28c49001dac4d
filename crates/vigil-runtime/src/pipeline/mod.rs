//! Event pipeline — the single entry point for event emission.
//!
//! Persisted kinds are written to durable storage synchronously (sequence
//! assigned inside the store transaction) before any live subscriber sees
//! them, so a crash can never show a subscriber something storage does not
//! know. Ephemeral kinds bypass storage entirely and carry the sequence of
//! the most recent persisted event.

pub mod stream;
pub mod subscribers;

use std::sync::Arc;

use metrics::counter;
use serde_json::{Value, json};
use tracing::instrument;

use vigil_core::events::{
    AuditEvent, EventKind, FindingPayload, PhaseEndPayload, RoutedBy, TerminalPayload,
    ToolEndPayload, ToolStartPayload,
};
use vigil_core::finding::Finding;
use vigil_core::task::{Phase, ProgressCounters, TaskStatus};
use vigil_core::text::truncate_output;
use vigil_store::{AuditStore, StoreError};

pub use subscribers::{LiveSubscription, SubscriberRegistry};

/// Single-entry-point event pipeline.
pub struct EventPipeline {
    store: Arc<AuditStore>,
    subscribers: Arc<SubscriberRegistry>,
    tool_output_budget: usize,
}

impl EventPipeline {
    /// Create a pipeline over a store and a subscriber registry.
    pub fn new(
        store: Arc<AuditStore>,
        subscribers: Arc<SubscriberRegistry>,
        tool_output_budget: usize,
    ) -> Self {
        Self {
            store,
            subscribers,
            tool_output_budget,
        }
    }

    /// The subscriber registry backing live fan-out.
    pub fn subscribers(&self) -> &Arc<SubscriberRegistry> {
        &self.subscribers
    }

    /// The durable store backing persistence.
    pub fn store(&self) -> &Arc<AuditStore> {
        &self.store
    }

    /// Emit an event: persist (for durable kinds), then fan out.
    ///
    /// Returns the event with its assigned sequence. Fan-out never blocks;
    /// a slow or absent viewer only affects its own queue.
    #[instrument(skip(self, event), fields(task_id = %event.task_id, kind = %event.kind))]
    pub fn emit(&self, mut event: AuditEvent) -> Result<AuditEvent, StoreError> {
        if event.kind.is_ephemeral() {
            event.sequence = self.subscribers.last_sequence(&event.task_id);
            let _ = self.subscribers.publish(&event);
            counter!("events_emitted_total", "class" => "ephemeral").increment(1);
            return Ok(event);
        }

        let stored = self.store.append_event(event)?;
        let _ = self.subscribers.publish(&stored);
        counter!("events_emitted_total", "class" => "persisted").increment(1);
        Ok(stored)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Typed emit helpers
    // ─────────────────────────────────────────────────────────────────────

    /// Emit a `phase.start` event.
    pub fn phase_start(&self, task_id: &str, phase: Phase) -> Result<AuditEvent, StoreError> {
        self.emit(
            AuditEvent::new(task_id, EventKind::PhaseStart, json!({}))
                .with_phase(phase)
                .with_message(format!("{phase} started")),
        )
    }

    /// Emit a `phase.end` event recording the transition and its reason.
    pub fn phase_end(
        &self,
        task_id: &str,
        payload: &PhaseEndPayload,
    ) -> Result<AuditEvent, StoreError> {
        let message = match payload.next {
            Some(next) => format!("{} finished, next {next}", payload.phase),
            None => format!("{} finished", payload.phase),
        };
        self.emit(
            AuditEvent::new(task_id, EventKind::PhaseEnd, serde_json::to_value(payload)?)
                .with_phase(payload.phase)
                .with_message(message),
        )
    }

    /// Emit an ephemeral `thought.fragment` event.
    pub fn thought_fragment(
        &self,
        task_id: &str,
        phase: Phase,
        text: &str,
    ) -> Result<AuditEvent, StoreError> {
        self.emit(
            AuditEvent::new(task_id, EventKind::ThoughtFragment, json!({ "text": text }))
                .with_phase(phase),
        )
    }

    /// Emit a `tool.start` event. Input is truncated to the payload budget.
    pub fn tool_start(
        &self,
        task_id: &str,
        phase: Phase,
        tool_call_id: &str,
        tool: &str,
        input: &Value,
    ) -> Result<AuditEvent, StoreError> {
        let rendered = input.to_string();
        let (bounded, _) = truncate_output(&rendered, self.tool_output_budget);
        let payload = ToolStartPayload {
            tool_call_id: tool_call_id.to_owned(),
            tool: tool.to_owned(),
            input: Value::String(bounded),
        };
        self.emit(
            AuditEvent::new(task_id, EventKind::ToolStart, serde_json::to_value(&payload)?)
                .with_phase(phase)
                .with_message(format!("{tool} started")),
        )
    }

    /// Emit a `tool.end` event paired with a prior `tool.start`.
    ///
    /// Output is truncated (never dropped) to the payload budget; the
    /// original byte length is recorded whenever truncation fires.
    #[allow(clippy::too_many_arguments)]
    pub fn tool_end(
        &self,
        task_id: &str,
        phase: Phase,
        tool_call_id: &str,
        tool: &str,
        duration_ms: u64,
        is_error: bool,
        output: &str,
    ) -> Result<AuditEvent, StoreError> {
        let (bounded, original_bytes) = truncate_output(output, self.tool_output_budget);
        let payload = ToolEndPayload {
            tool_call_id: tool_call_id.to_owned(),
            tool: tool.to_owned(),
            duration_ms,
            is_error,
            output: bounded,
            original_bytes,
        };
        self.emit(
            AuditEvent::new(task_id, EventKind::ToolEnd, serde_json::to_value(&payload)?)
                .with_phase(phase)
                .with_message(format!("{tool} finished in {duration_ms}ms")),
        )
    }

    /// Emit a `finding.new` event.
    pub fn finding_new(
        &self,
        phase: Phase,
        finding: &Finding,
    ) -> Result<AuditEvent, StoreError> {
        let payload = FindingPayload::from_finding(finding);
        self.emit(
            AuditEvent::new(
                &finding.task_id,
                EventKind::FindingNew,
                serde_json::to_value(&payload)?,
            )
            .with_phase(phase)
            .with_message(format!(
                "{} {} at {}",
                finding.severity.as_str(),
                finding.class.as_str(),
                finding.location
            )),
        )
    }

    /// Emit a `progress` counter update.
    pub fn progress(
        &self,
        task_id: &str,
        phase: Phase,
        counters: &ProgressCounters,
    ) -> Result<AuditEvent, StoreError> {
        self.emit(
            AuditEvent::new(task_id, EventKind::Progress, serde_json::to_value(counters)?)
                .with_phase(phase),
        )
    }

    /// Emit a `log` event.
    pub fn log(
        &self,
        task_id: &str,
        phase: Option<Phase>,
        message: impl Into<String>,
        payload: Value,
    ) -> Result<AuditEvent, StoreError> {
        let mut event = AuditEvent::new(task_id, EventKind::Log, payload).with_message(message);
        event.phase = phase;
        self.emit(event)
    }

    /// Emit the `task.terminal` event that closes live streams.
    pub fn terminal(
        &self,
        task_id: &str,
        status: TaskStatus,
        error: Option<&str>,
    ) -> Result<AuditEvent, StoreError> {
        let payload = TerminalPayload {
            status,
            error: error.map(ToOwned::to_owned),
        };
        self.emit(
            AuditEvent::new(task_id, EventKind::TaskTerminal, serde_json::to_value(&payload)?)
                .with_message(format!("task {status}")),
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
