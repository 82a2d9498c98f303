//! Request and result rows for batch submission.

use crate::error::ErrorKind;
use crate::stats::Stats;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use super::cancel::CancelToken;

/// One unit of work inside a batch: a rendered prompt plus its identity.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: String,
    pub prompt: String,
    pub schema: Option<Arc<Value>>,
}

/// Per-request outcome row, aligned to input order in the batch result.
#[derive(Debug, Clone, Serialize)]
pub struct RequestResult {
    pub id: String,
    pub success: bool,
    /// Raw response content; present whenever `success` is true.
    pub content: Option<String>,
    /// Parsed structured value when a schema was used and the content
    /// conformed; `None` means the caller got the raw string only.
    pub parsed: Option<Value>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
    pub tokens_used: u64,
    pub cost: f64,
    /// Last attempt's API round-trip, seconds.
    pub api_response_time: f64,
    /// Wall time from submission to finalization, seconds.
    pub processing_time: f64,
    pub attempts: u32,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

/// Options for [`submit_batch`](super::BatchDispatcher::submit_batch).
#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    /// JSON schema for structured output (gated on model capability).
    pub schema: Option<Value>,
    /// Caller-supplied ids, one per input; generated when absent.
    pub ids: Option<Vec<String>>,
    /// Extra template substitutions beyond `{text}`.
    pub extras: HashMap<String, String>,
    pub cancel: Option<CancelToken>,
}

impl BatchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_ids(mut self, ids: Vec<String>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extras.insert(key.into(), value.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Options for [`submit_single`](super::BatchDispatcher::submit_single).
#[derive(Debug, Clone, Default)]
pub struct SingleOptions {
    pub schema: Option<Value>,
    pub id: Option<String>,
    pub extras: HashMap<String, String>,
}

impl SingleOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extras.insert(key.into(), value.into());
        self
    }
}

/// What a batch call returns: ordered results plus the batch-scoped stats.
#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    pub batch_id: String,
    pub results: Vec<RequestResult>,
    pub stats: Stats,
}

impl BatchOutcome {
    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(|r| r.success)
    }
}

/// Combined report for observability plumbing.
#[derive(Debug, Clone, Serialize)]
pub struct CompleteStats {
    pub batch: Option<Stats>,
    pub global: Option<Stats>,
}

/// Substitute `{text}` and any extras keys into the prompt template.
///
/// Template well-formedness (the `{text}` placeholder being present) is
/// enforced by the input loader, not here.
pub fn render_template(template: &str, text: &str, extras: &HashMap<String, String>) -> String {
    let mut rendered = template.replace("{text}", text);
    for (key, value) in extras {
        rendered = rendered.replace(&format!("{{{key}}}"), value);
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_basic() {
        let extras = HashMap::new();
        assert_eq!(
            render_template("Classify: {text}", "hello", &extras),
            "Classify: hello"
        );
    }

    #[test]
    fn test_render_with_extras() {
        let mut extras = HashMap::new();
        extras.insert("lang".to_string(), "en".to_string());
        assert_eq!(
            render_template("[{lang}] {text}", "hi", &extras),
            "[en] hi"
        );
    }

    #[test]
    fn test_render_leaves_unknown_placeholders() {
        let extras = HashMap::new();
        assert_eq!(
            render_template("{text} {other}", "x", &extras),
            "x {other}"
        );
    }
}
