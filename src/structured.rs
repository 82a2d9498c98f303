//! Structured output helpers.
//!
//! Request side: wraps a caller-provided JSON schema into the provider
//! `response_format` payload. Response side: parses and validates the
//! returned content, degrading to the raw string on any failure. A parse
//! or validation miss never fails the request.

use crate::{Error, Result};
use serde_json::{json, Value};
use tracing::warn;

/// Build the provider-shaped `response_format` payload for a schema.
pub fn response_format(schema: &Value) -> Value {
    json!({
        "type": "json_schema",
        "json_schema": {
            "name": "response",
            "strict": true,
            "schema": schema,
        }
    })
}

/// Reject schemas that don't compile before any request goes out.
pub fn validate_schema(schema: &Value) -> Result<()> {
    jsonschema::JSONSchema::compile(schema)
        .map(|_| ())
        .map_err(|e| Error::validation(format!("invalid JSON schema: {e}")))
}

/// Parse structured content and validate it against the schema.
///
/// Returns `None` when the content is not JSON or does not conform; the
/// caller keeps the raw string and stays successful either way.
pub fn parse_structured(content: &str, schema: Option<&Value>) -> Option<Value> {
    let value: Value = match serde_json::from_str(content) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "structured output did not parse as JSON, keeping raw content");
            return None;
        }
    };
    if let Some(schema) = schema {
        if !jsonschema::is_valid(schema, &value) {
            warn!("structured output did not conform to schema, keeping raw content");
            return None;
        }
    }
    Some(value)
}

/// Generator for object schemas, for tests and demos.
#[derive(Debug, Clone, Default)]
pub struct SchemaGenerator {
    properties: Vec<(String, Value)>,
    required: Vec<String>,
    additional_properties: bool,
}

impl SchemaGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_property(mut self, name: impl Into<String>, schema: Value) -> Self {
        self.properties.push((name.into(), schema));
        self
    }

    pub fn require(mut self, name: impl Into<String>) -> Self {
        self.required.push(name.into());
        self
    }

    pub fn allow_additional_properties(mut self, allow: bool) -> Self {
        self.additional_properties = allow;
        self
    }

    pub fn build(self) -> Value {
        let mut map = serde_json::Map::new();
        map.insert("type".into(), json!("object"));

        let mut properties = serde_json::Map::new();
        for (name, schema) in self.properties {
            properties.insert(name, schema);
        }
        map.insert("properties".into(), properties.into());

        if !self.required.is_empty() {
            map.insert("required".into(), self.required.into());
        }
        if !self.additional_properties {
            map.insert("additionalProperties".into(), json!(false));
        }
        map.into()
    }
}

/// Derive a schema from a Rust type.
pub fn schema_for<T: schemars::JsonSchema>() -> Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(&schema).unwrap_or_else(|_| json!({}))
}
