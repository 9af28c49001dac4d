//! Opaque tool registry and the instrumented execution path.
//!
//! Tools are external collaborators (scanners, sandbox probes, exploit
//! verifiers). The engine owns the envelope: paired `tool.start`/`tool.end`
//! events with durations and size-truncated payloads, a cancellation check
//! at launch, and per-call error absorption — a failed tool becomes an
//! error event, never a phase abort by itself.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use metrics::{counter, histogram};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};
use uuid::Uuid;

use vigil_core::task::Phase;
use vigil_store::StoreError;

use crate::pipeline::EventPipeline;

/// Tool call failure, reported as an event rather than propagated.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// The tool rejected its input.
    #[error("invalid tool input: {0}")]
    InvalidInput(String),
    /// The tool ran and failed.
    #[error("{0}")]
    Execution(String),
}

/// An opaque tool: name, input schema, execute.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Registry name.
    fn name(&self) -> &str;
    /// JSON schema describing the expected input.
    fn input_schema(&self) -> Value;
    /// Execute with the task's cancellation token.
    async fn execute(&self, input: Value, cancel: &CancellationToken)
    -> Result<String, ToolError>;
}

/// Name-indexed tool registry.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool under its name. Later registrations win.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let _ = self.tools.insert(tool.name().to_string(), tool);
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Registered tool names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of one instrumented tool call.
#[derive(Clone, Debug)]
pub struct ToolCallResult {
    /// Pairing id shared by the start/end events.
    pub tool_call_id: String,
    /// Tool output (or error text).
    pub output: String,
    /// Whether the call failed.
    pub is_error: bool,
    /// Wall-clock duration.
    pub duration_ms: u64,
}

/// Execute one tool call through the event envelope.
///
/// Emits `tool.start`, runs the tool (skipped when cancellation is already
/// requested), then emits `tool.end` with the duration and truncated
/// output. Tool failures are absorbed into the result, never propagated.
#[instrument(skip_all, fields(tool = name, task_id))]
pub async fn execute_tool(
    pipeline: &EventPipeline,
    registry: &ToolRegistry,
    task_id: &str,
    phase: Phase,
    name: &str,
    input: Value,
    cancel: &CancellationToken,
) -> Result<ToolCallResult, StoreError> {
    let start = Instant::now();
    let tool_call_id = format!("tc_{}", Uuid::now_v7());

    let Some(tool) = registry.get(name) else {
        error!(name, "tool not found");
        let output = format!("tool not found: {name}");
        let _ = pipeline.tool_end(task_id, phase, &tool_call_id, name, 0, true, &output)?;
        return Ok(ToolCallResult {
            tool_call_id,
            output,
            is_error: true,
            duration_ms: 0,
        });
    };

    let _ = pipeline.tool_start(task_id, phase, &tool_call_id, name, &input)?;

    let (output, is_error) = if cancel.is_cancelled() {
        ("tool call skipped: cancellation requested".to_string(), true)
    } else {
        match tool.execute(input, cancel).await {
            Ok(output) => (output, false),
            Err(e) => (e.to_string(), true),
        }
    };

    let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
    counter!("tool_executions_total", "tool" => name.to_string()).increment(1);
    histogram!("tool_execution_duration_seconds", "tool" => name.to_string())
        .record(start.elapsed().as_secs_f64());

    let _ = pipeline.tool_end(
        task_id,
        phase,
        &tool_call_id,
        name,
        duration_ms,
        is_error,
        &output,
    )?;
    info!(tool = name, duration_ms, is_error, "tool executed");

    Ok(ToolCallResult {
        tool_call_id,
        output,
        is_error,
        duration_ms,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
