//! Wait-hint extraction from failed calls.
//!
//! Preference order: the client's parsed `retry_after` field, the
//! `retry-after` response header, then regex patterns over the error text.
//! When nothing parses, fall back to a conservative 60 seconds.

use crate::endpoint::ApiError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;

/// Fallback when the server gave no usable hint.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(60);

static RETRY_AFTER_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)retry\s+after\s+(\d+(?:\.\d+)?)\s*s(?:econds?)?").unwrap(),
        Regex::new(r"(?i)wait\s+(\d+(?:\.\d+)?)\s*s(?:econds?)?").unwrap(),
        Regex::new(r"(?i)\b(\d+(?:\.\d+)?)s\b").unwrap(),
    ]
});

/// Extract the wait a failed call asks for.
pub fn wait_hint(error: &ApiError) -> Duration {
    if let Some(secs) = error.retry_after {
        if secs > 0.0 {
            return Duration::from_secs_f64(secs);
        }
    }
    if let Some(value) = error.header("retry-after") {
        if let Ok(secs) = value.trim().parse::<f64>() {
            if secs > 0.0 {
                return Duration::from_secs_f64(secs);
            }
        }
    }
    for pattern in RETRY_AFTER_PATTERNS.iter() {
        if let Some(caps) = pattern.captures(&error.message) {
            if let Some(secs) = caps.get(1).and_then(|m| m.as_str().parse::<f64>().ok()) {
                if secs > 0.0 {
                    return Duration::from_secs_f64(secs);
                }
            }
        }
    }
    DEFAULT_WAIT
}

/// Whether a failed call is a server rate limit the batch loop should
/// recover from (as opposed to an ordinary transient failure).
pub fn is_rate_limit(error: &ApiError) -> bool {
    if error.message.to_lowercase().contains("token rate limit") {
        return true;
    }
    error.retry_after.is_some() || error.header("retry-after").is_some()
}
