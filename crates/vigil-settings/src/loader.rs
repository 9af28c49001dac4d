//! Settings loading: defaults ← file ← env.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::VigilSettings;

/// Default settings file location: `~/.vigil/settings.json`.
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
    Path::new(&home).join(".vigil").join("settings.json")
}

/// Deep-merge `overlay` into `base`. Objects merge recursively; every other
/// value type replaces wholesale.
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                let merged = match base_map.remove(&key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => overlay_value,
                };
                let _ = base_map.insert(key, merged);
            }
            Value::Object(base_map)
        }
        (_, overlay) => overlay,
    }
}

/// Load settings from the default path with env overrides.
///
/// A missing file is not an error: defaults + env apply.
pub fn load_settings() -> Result<VigilSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env overrides.
pub fn load_settings_from_path(path: &Path) -> Result<VigilSettings> {
    let defaults = serde_json::to_value(VigilSettings::default())?;

    let merged = if path.exists() {
        let raw = std::fs::read_to_string(path)?;
        let file_value: Value = serde_json::from_str(&raw)?;
        debug!(?path, "merging settings file over defaults");
        deep_merge(defaults, file_value)
    } else {
        defaults
    };

    let mut settings: VigilSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Apply `VIGIL_*` env var overrides (highest priority).
fn apply_env_overrides(settings: &mut VigilSettings) {
    if let Some(n) = env_parse::<usize>("VIGIL_MAX_CONCURRENT_TASKS") {
        settings.scheduler.max_concurrent_tasks = n;
    }
    if let Some(n) = env_parse::<usize>("VIGIL_PER_PHASE_TOOL_LIMIT") {
        settings.scheduler.per_phase_tool_limit = n;
    }
    if let Some(n) = env_parse::<u64>("VIGIL_FORCE_GRACE_MS") {
        settings.cancel.force_grace_ms = n;
    }
    if let Some(n) = env_parse::<u64>("VIGIL_ACQUIRE_TIMEOUT_SECS") {
        settings.acquire.attempt_timeout_secs = n;
    }
    if let Some(n) = env_parse::<u64>("VIGIL_STREAM_POLL_INTERVAL_MS") {
        settings.stream.poll_interval_ms = n;
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
