//! # vigil-settings
//!
//! Operator configuration with layered sources for the Vigil audit engine.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults** — [`VigilSettings::default()`]
//! 2. **Operator file** — `~/.vigil/settings.json` (deep-merged over defaults)
//! 3. **Environment variables** — `VIGIL_*` overrides (highest priority)
//!
//! The global singleton is reloadable so an operator can adjust limits
//! without restarting embedded deployments.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;

use std::path::Path;
use std::sync::{Arc, RwLock};

/// Global settings singleton.
///
/// `RwLock<Option<Arc<...>>>` instead of `OnceLock` so the cached value can
/// be swapped on reload. Reads are cheap (shared lock + `Arc::clone`).
static SETTINGS: RwLock<Option<Arc<VigilSettings>>> = RwLock::new(None);

/// Get the global settings instance.
///
/// First call loads from disk with env overrides; later calls return the
/// cached value. A load failure falls back to compiled defaults.
pub fn get_settings() -> Arc<VigilSettings> {
    {
        let guard = SETTINGS.read().expect("settings lock poisoned");
        if let Some(ref s) = *guard {
            return Arc::clone(s);
        }
    }

    let mut guard = SETTINGS.write().expect("settings lock poisoned");
    // Double-check after acquiring write lock (another thread may have initialized)
    if let Some(ref s) = *guard {
        return Arc::clone(s);
    }

    let settings = Arc::new(match load_settings() {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "failed to load settings, using defaults");
            VigilSettings::default()
        }
    });
    *guard = Some(Arc::clone(&settings));
    settings
}

/// Initialize the global settings with a specific value.
///
/// Replaces any previously cached settings. Useful for tests and embedders
/// that construct settings programmatically.
pub fn init_settings(settings: VigilSettings) {
    let mut guard = SETTINGS.write().expect("settings lock poisoned");
    *guard = Some(Arc::new(settings));
}

/// Reload settings from a specific file path, swapping the global cache.
pub fn reload_settings_from_path(path: &Path) {
    let new = Arc::new(match load_settings_from_path(path) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, ?path, "failed to reload settings, falling back to defaults");
            VigilSettings::default()
        }
    });
    let mut guard = SETTINGS.write().expect("settings lock poisoned");
    *guard = Some(new);
    tracing::info!(?path, "settings reloaded from disk");
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// Tests that mutate the global SETTINGS static must hold this lock
    /// to avoid racing with each other.
    static SETTINGS_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn reset() {
        let mut guard = SETTINGS.write().unwrap();
        *guard = None;
    }

    #[test]
    fn default_settings_are_valid() {
        let settings = VigilSettings::default();
        assert_eq!(settings.version, "0.1.0");
        assert_eq!(settings.scheduler.max_concurrent_tasks, 4);
        assert_eq!(settings.audit.max_iterations, 8);
        assert_eq!(settings.audit.verification_threshold, 3);
        assert_eq!(settings.stream.channel_capacity, 1_024);
        assert_eq!(settings.cancel.force_grace_ms, 2_000);
        assert_eq!(settings.events.tool_output_budget_bytes, 16_384);
        assert!(settings.audit.exclude.contains(&"vendor/**".to_string()));
    }

    #[test]
    fn init_settings_sets_custom_value() {
        let _lock = SETTINGS_MUTEX.lock().unwrap();
        reset();
        let mut custom = VigilSettings::default();
        custom.scheduler.max_concurrent_tasks = 99;
        init_settings(custom);
        assert_eq!(get_settings().scheduler.max_concurrent_tasks, 99);
        reset();
    }

    #[test]
    fn init_settings_replaces_previous() {
        let _lock = SETTINGS_MUTEX.lock().unwrap();
        reset();
        let mut first = VigilSettings::default();
        first.cancel.force_grace_ms = 1;
        init_settings(first);
        assert_eq!(get_settings().cancel.force_grace_ms, 1);

        let mut second = VigilSettings::default();
        second.cancel.force_grace_ms = 2;
        init_settings(second);
        assert_eq!(get_settings().cancel.force_grace_ms, 2);
        reset();
    }

    #[test]
    fn reload_swaps_cached_value() {
        let _lock = SETTINGS_MUTEX.lock().unwrap();
        reset();
        init_settings(VigilSettings::default());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"acquire": {"attemptTimeoutSecs": 5}}"#).unwrap();
        reload_settings_from_path(&path);
        assert_eq!(get_settings().acquire.attempt_timeout_secs, 5);
        reset();
    }
}
