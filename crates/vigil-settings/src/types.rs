//! Settings type tree with compiled defaults.
//!
//! Every section has a `Default` impl; the loader deep-merges a JSON file
//! over these values, then applies `VIGIL_*` env overrides.

use serde::{Deserialize, Serialize};

/// Root settings object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VigilSettings {
    /// Settings schema version.
    pub version: String,
    /// Task scheduling limits.
    pub scheduler: SchedulerSettings,
    /// Account-level audit defaults; task config overrides these.
    pub audit: AuditDefaults,
    /// Live streaming knobs.
    pub stream: StreamSettings,
    /// Cancellation protocol knobs.
    pub cancel: CancelSettings,
    /// Workspace acquisition knobs.
    pub acquire: AcquireSettings,
    /// Event payload budgets.
    pub events: EventSettings,
}

impl Default for VigilSettings {
    fn default() -> Self {
        Self {
            version: "0.1.0".into(),
            scheduler: SchedulerSettings::default(),
            audit: AuditDefaults::default(),
            stream: StreamSettings::default(),
            cancel: CancelSettings::default(),
            acquire: AcquireSettings::default(),
            events: EventSettings::default(),
        }
    }
}

/// Task scheduling limits.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerSettings {
    /// Operator ceiling on concurrently running tasks.
    pub max_concurrent_tasks: usize,
    /// Per-phase ceiling on concurrent tool invocations.
    pub per_phase_tool_limit: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 4,
            per_phase_tool_limit: 4,
        }
    }
}

/// Account-level audit defaults, overridable per task.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuditDefaults {
    /// Default iteration budget.
    pub max_iterations: u32,
    /// Default wall-clock budget.
    pub timeout_secs: u64,
    /// Glob patterns always excluded, merged under task excludes.
    pub exclude: Vec<String>,
    /// Findings needed before the Analysis fallback routes to Verification.
    pub verification_threshold: u32,
}

impl Default for AuditDefaults {
    fn default() -> Self {
        Self {
            max_iterations: 8,
            timeout_secs: 3_600,
            exclude: vec![
                "vendor/**".into(),
                "node_modules/**".into(),
                "**/*.min.js".into(),
            ],
            verification_threshold: 3,
        }
    }
}

/// Live streaming knobs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamSettings {
    /// Capacity of the per-task live broadcast channel.
    pub channel_capacity: usize,
    /// Capacity of the per-task replay ring buffer.
    pub buffer_capacity: usize,
    /// Poll interval for the durable-storage fallback path (ms).
    pub poll_interval_ms: u64,
    /// Heartbeat cadence on the fallback path (ms).
    pub heartbeat_interval_ms: u64,
    /// Idle timeout ending a fallback subscription with no progress (ms).
    pub idle_timeout_ms: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            channel_capacity: 1_024,
            buffer_capacity: 256,
            poll_interval_ms: 1_000,
            heartbeat_interval_ms: 5_000,
            idle_timeout_ms: 30_000,
        }
    }
}

/// Cancellation protocol knobs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CancelSettings {
    /// Grace period before the forced-interrupt handle fires (ms).
    pub force_grace_ms: u64,
}

impl Default for CancelSettings {
    fn default() -> Self {
        Self {
            force_grace_ms: 2_000,
        }
    }
}

/// Workspace acquisition knobs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AcquireSettings {
    /// Timeout for each individual acquisition attempt (secs).
    pub attempt_timeout_secs: u64,
}

impl Default for AcquireSettings {
    fn default() -> Self {
        Self {
            attempt_timeout_secs: 60,
        }
    }
}

/// Event payload budgets.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventSettings {
    /// Byte budget for tool output embedded in `tool.end` payloads.
    pub tool_output_budget_bytes: usize,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            tool_output_budget_bytes: 16_384,
        }
    }
}
