//! 错误处理模块：提供统一的错误类型和逐请求错误分类。
//!
//! # Error Handling Module
//!
//! This module provides the unified error types used across llm-dispatch.
//!
//! Two surfaces exist on purpose:
//! - [`Error`] — raised synchronously at submission or construction time
//!   (bad configuration, invalid batch arguments, unsupported schema).
//! - [`ErrorKind`] — a flat classification attached to per-request
//!   [`RequestResult`](crate::dispatcher::RequestResult) rows. A batch call
//!   never throws for per-item failures; they surface here instead.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for the library.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for submission- and construction-time failures.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error(
        "model '{model}' does not support structured output; compatible models: {}",
        .compatible.join(", ")
    )]
    SchemaUnsupported {
        model: String,
        compatible: Vec<String>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Create a simple configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a simple validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Flat classification of this error, matching the per-result surface.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Config,
            Error::Validation(_) => ErrorKind::Validation,
            Error::SchemaUnsupported { .. } => ErrorKind::SchemaUnsupported,
            Error::Io(_) => ErrorKind::Config,
            Error::Serialization(_) => ErrorKind::Validation,
        }
    }
}

/// Per-request error classification.
///
/// Serialized values match the wire-level error surface
/// (`"ValidationError"`, `"RateLimitError"`, ...), so result rows can be
/// written to a sink without translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "ValidationError")]
    Validation,
    #[serde(rename = "RateLimitError")]
    RateLimit,
    #[serde(rename = "SchemaUnsupportedError")]
    SchemaUnsupported,
    #[serde(rename = "TransientApiError")]
    TransientApi,
    #[serde(rename = "PermanentApiError")]
    PermanentApi,
    #[serde(rename = "RetryExhausted")]
    RetryExhausted,
    #[serde(rename = "ConfigError")]
    Config,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Validation => "ValidationError",
            ErrorKind::RateLimit => "RateLimitError",
            ErrorKind::SchemaUnsupported => "SchemaUnsupportedError",
            ErrorKind::TransientApi => "TransientApiError",
            ErrorKind::PermanentApi => "PermanentApiError",
            ErrorKind::RetryExhausted => "RetryExhausted",
            ErrorKind::Config => "ConfigError",
        };
        f.write_str(s)
    }
}
