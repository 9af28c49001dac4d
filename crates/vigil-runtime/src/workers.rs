//! Worker contracts and the execution-node arena.
//!
//! Phase workers are external collaborators: the engine only sequences,
//! records, and aborts them. The arena records the worker hierarchy by
//! opaque id — parents are referenced by id, never by handle — so teardown
//! is simply "remove all ids under this task".

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use vigil_core::finding::Finding;
use vigil_core::task::{Phase, ProgressCounters, TaskConfig};

/// Input handed to a phase worker.
pub struct WorkerInput {
    /// Owning task.
    pub task_id: String,
    /// Phase being executed.
    pub phase: Phase,
    /// Acquired workspace root.
    pub workspace_root: PathBuf,
    /// Effective (merged) task configuration.
    pub config: TaskConfig,
    /// Shared cooperative-cancellation token.
    pub cancel: CancellationToken,
    /// Arena node attributed to this worker.
    pub node_id: String,
}

/// Output of one phase worker run. Merged into task state additively.
#[derive(Clone, Debug, Default)]
pub struct WorkerOutput {
    /// New or re-reported findings.
    pub findings: Vec<Finding>,
    /// Opaque phase artifacts (plans, summaries, report sections).
    pub artifacts: Value,
    /// Whether the worker considers the phase successful.
    pub success: bool,
    /// Worker error detail when `success` is false.
    pub error: Option<String>,
    /// Model tokens consumed.
    pub tokens_used: u64,
    /// Tool invocations issued.
    pub tool_calls: u64,
    /// Think/act/observe loop iterations consumed.
    pub iterations: u64,
    /// Files examined.
    pub files_scanned: u64,
    /// Entry points / risk areas discovered (reconnaissance).
    pub entry_points: u32,
}

impl WorkerOutput {
    /// Whether this run produced any artifact at all (findings, artifacts,
    /// or discovered entry points). A failed run with no artifact aborts
    /// the task; a failed run with partial output is absorbed.
    pub fn has_artifacts(&self) -> bool {
        !self.findings.is_empty() || !self.artifacts.is_null() || self.entry_points > 0
    }
}

/// Hard worker failure (cancellation is distinguished from error).
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The worker observed the cancellation flag.
    #[error("worker cancelled")]
    Cancelled,
    /// The worker failed outright, producing nothing.
    #[error("{0}")]
    Failed(String),
}

/// A phase-scoped executor running a bounded think/act/observe loop.
#[async_trait]
pub trait PhaseWorker: Send + Sync {
    /// Run the phase to completion or until a cancellation safe point.
    async fn run(&self, input: WorkerInput) -> Result<WorkerOutput, WorkerError>;
}

/// Factory building the worker for each phase.
pub trait WorkerFactory: Send + Sync {
    /// Create the worker for a phase.
    fn create(&self, phase: Phase) -> Arc<dyn PhaseWorker>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Execution-node arena
// ─────────────────────────────────────────────────────────────────────────────

/// Role of an execution node in the worker tree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeRole {
    /// Task-level coordinator.
    Root,
    /// Phase worker.
    Phase(Phase),
    /// Dynamically spawned specialist, labeled by its speciality.
    Specialist(String),
}

/// Per-node attribution counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeCounters {
    /// Loop iterations consumed.
    pub iterations: u64,
    /// Tool invocations issued.
    pub tool_calls: u64,
    /// Model tokens consumed.
    pub tokens_used: u64,
    /// Files examined.
    pub files_scanned: u64,
}

/// One node of the worker hierarchy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionNode {
    /// Opaque node id (`node_` + UUID v7).
    pub id: String,
    /// Owning task.
    pub task_id: String,
    /// Node role.
    pub role: NodeRole,
    /// Parent node id; `None` for the root.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Attribution counters.
    pub counters: NodeCounters,
}

/// Arena of execution nodes indexed by opaque id.
pub struct WorkerArena {
    nodes: DashMap<String, ExecutionNode>,
}

impl WorkerArena {
    /// Create an empty arena.
    pub fn new() -> Self {
        Self {
            nodes: DashMap::new(),
        }
    }

    /// Spawn a node, returning its id.
    pub fn spawn(&self, task_id: &str, role: NodeRole, parent_id: Option<&str>) -> String {
        let id = format!("node_{}", Uuid::now_v7());
        let _ = self.nodes.insert(
            id.clone(),
            ExecutionNode {
                id: id.clone(),
                task_id: task_id.to_string(),
                role,
                parent_id: parent_id.map(ToOwned::to_owned),
                counters: NodeCounters::default(),
            },
        );
        id
    }

    /// Add to a node's attribution counters.
    pub fn record(&self, node_id: &str, delta: NodeCounters) {
        if let Some(mut node) = self.nodes.get_mut(node_id) {
            node.counters.iterations += delta.iterations;
            node.counters.tool_calls += delta.tool_calls;
            node.counters.tokens_used += delta.tokens_used;
            node.counters.files_scanned += delta.files_scanned;
        }
    }

    /// Get a node by id.
    pub fn get(&self, node_id: &str) -> Option<ExecutionNode> {
        self.nodes.get(node_id).map(|n| n.value().clone())
    }

    /// All nodes of a task, root first, then by id.
    pub fn task_nodes(&self, task_id: &str) -> Vec<ExecutionNode> {
        let mut nodes: Vec<ExecutionNode> = self
            .nodes
            .iter()
            .filter(|entry| entry.task_id == task_id)
            .map(|entry| entry.value().clone())
            .collect();
        nodes.sort_by(|a, b| {
            (a.parent_id.is_some(), &a.id).cmp(&(b.parent_id.is_some(), &b.id))
        });
        nodes
    }

    /// Aggregate live counters across a task's nodes.
    pub fn aggregate(&self, task_id: &str) -> ProgressCounters {
        let mut totals = ProgressCounters::default();
        for entry in self.nodes.iter().filter(|entry| entry.task_id == task_id) {
            totals.iterations += entry.counters.iterations;
            totals.tool_calls += entry.counters.tool_calls;
            totals.tokens_used += entry.counters.tokens_used;
            totals.files_scanned += entry.counters.files_scanned;
        }
        totals
    }

    /// Serializable snapshot of a task's worker tree.
    pub fn snapshot(&self, task_id: &str) -> Value {
        serde_json::to_value(self.task_nodes(task_id)).unwrap_or(Value::Null)
    }

    /// Teardown: remove every node under a task.
    pub fn remove_task(&self, task_id: &str) -> usize {
        let ids: Vec<String> = self
            .nodes
            .iter()
            .filter(|entry| entry.task_id == task_id)
            .map(|entry| entry.id.clone())
            .collect();
        let removed = ids.len();
        for id in ids {
            let _ = self.nodes.remove(&id);
        }
        removed
    }

    /// Total nodes across all tasks.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the arena is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl Default for WorkerArena {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
