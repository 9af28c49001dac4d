//! UTF-8-safe string truncation utilities.
//!
//! Rust `&str[..n]` panics when `n` falls inside a multi-byte character.
//! These helpers find the nearest char boundary so truncation is always
//! safe. Tool output and error messages flow through here before entering
//! event payloads or task rows.

/// Byte budget for the safe error string stored on a failed task.
pub const ERROR_MESSAGE_BUDGET: usize = 512;

/// Truncate a string to at most `max_bytes` bytes at a char boundary.
#[inline]
pub fn truncate_str(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    // `floor_char_boundary` is nightly-only, so implement it ourselves.
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Truncate `s` and append a suffix (e.g. `"..."`) if the original exceeds
/// `max_bytes`. The result is at most `max_bytes` bytes long including the
/// suffix; a fitting string is returned as-is.
pub fn truncate_with_suffix(s: &str, max_bytes: usize, suffix: &str) -> String {
    if s.len() <= max_bytes {
        return s.to_owned();
    }
    let body_budget = max_bytes.saturating_sub(suffix.len());
    let prefix = truncate_str(s, body_budget);
    format!("{prefix}{suffix}")
}

/// Truncate tool output to a byte budget with an explicit marker.
///
/// Returns the (possibly shortened) output and the original byte length when
/// truncation happened. The marker names both sizes so truncation is never
/// silent.
pub fn truncate_output(output: &str, max_bytes: usize) -> (String, Option<usize>) {
    if output.len() <= max_bytes {
        return (output.to_owned(), None);
    }
    let original = output.len();
    let marker = format!("\n... [truncated {original} bytes to {max_bytes}]");
    let body = truncate_str(output, max_bytes.saturating_sub(marker.len()));
    (format!("{body}{marker}"), Some(original))
}

/// Produce the short, safe error string recorded on a failed task.
pub fn safe_error_message(detail: &str) -> String {
    truncate_with_suffix(detail, ERROR_MESSAGE_BUDGET, "...")
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
