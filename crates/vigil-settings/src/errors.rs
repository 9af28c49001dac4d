//! Settings error type.

/// Result alias for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;

/// Failures while loading or parsing settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// The settings file could not be read.
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    /// The settings file is not valid JSON.
    #[error("failed to parse settings file: {0}")]
    Parse(#[from] serde_json::Error),
}
