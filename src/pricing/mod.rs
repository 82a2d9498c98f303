//! Model pricing table and capability gate.
//!
//! Prices are currency-per-1000-tokens, keyed by model name, loaded once at
//! startup from a JSON file (or the embedded default table). The same table
//! carries the `json_schema` capability flag consulted before any structured
//! output attempt, so adding a model never touches dispatcher code.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// Embedded default table, used when no external file is supplied.
const DEFAULT_TABLE: &str = include_str!("../../assets/model_prices.json");

/// Per-model pricing entry.
///
/// `cache` is the discounted price applied to the cached subset of prompt
/// tokens; it never exceeds `input`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricingEntry {
    pub input: f64,
    pub output: f64,
    pub cache: f64,
    /// Whether the model accepts a `json_schema` response format.
    #[serde(default)]
    pub json_schema: bool,
}

impl PricingEntry {
    /// Apply the cost law for one call.
    ///
    /// Cached tokens are reported inside `prompt_tokens` but are billed at
    /// the cache price, so the uncached share is `prompt - cached`.
    pub fn cost(&self, prompt_tokens: u64, cached_tokens: u64, completion_tokens: u64) -> CostBreakdown {
        let cached = cached_tokens.min(prompt_tokens);
        let uncached = prompt_tokens - cached;
        let input_cost = uncached as f64 / 1000.0 * self.input;
        let cached_cost = cached as f64 / 1000.0 * self.cache;
        let output_cost = completion_tokens as f64 / 1000.0 * self.output;
        CostBreakdown {
            input_cost,
            cached_cost,
            output_cost,
            total: input_cost + cached_cost + output_cost,
        }
    }

    /// What the cached tokens would have cost at the full input price,
    /// minus what they actually cost.
    pub fn cache_savings(&self, cached_tokens: u64) -> f64 {
        cached_tokens as f64 / 1000.0 * (self.input - self.cache)
    }
}

/// Cost of one call, split by token class.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CostBreakdown {
    pub input_cost: f64,
    pub cached_cost: f64,
    pub output_cost: f64,
    pub total: f64,
}

/// Static mapping `model -> PricingEntry`, loaded once at startup.
#[derive(Debug, Clone)]
pub struct PricingTable {
    models: HashMap<String, PricingEntry>,
}

impl PricingTable {
    /// Parse a table from a JSON string and validate every entry.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let models: HashMap<String, PricingEntry> = serde_json::from_str(json)?;
        let table = Self { models };
        table.validate()?;
        debug!(models = table.models.len(), "pricing table loaded");
        Ok(table)
    }

    /// Load a table from a JSON file.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_json_str(&content)
    }

    /// The embedded default table shipped with the crate.
    pub fn builtin() -> Result<Self> {
        Self::from_json_str(DEFAULT_TABLE)
    }

    fn validate(&self) -> Result<()> {
        for (model, entry) in &self.models {
            if entry.input < 0.0 || entry.output < 0.0 || entry.cache < 0.0 {
                return Err(Error::config(format!(
                    "pricing for '{model}' has a negative price"
                )));
            }
            if entry.cache > entry.input {
                return Err(Error::config(format!(
                    "pricing for '{model}' has cache price above input price"
                )));
            }
        }
        Ok(())
    }

    /// Look up the entry for a model.
    pub fn entry(&self, model: &str) -> Option<&PricingEntry> {
        self.models.get(model)
    }

    /// Capability gate: does this model accept a `json_schema` response format?
    ///
    /// Unknown models answer `false`; unknown-model itself is rejected
    /// earlier, at dispatcher construction.
    pub fn supports_json_schema(&self, model: &str) -> bool {
        self.models.get(model).map(|e| e.json_schema).unwrap_or(false)
    }

    /// Models that accept structured output, sorted for stable error messages.
    pub fn schema_capable_models(&self) -> Vec<String> {
        let mut models: Vec<String> = self
            .models
            .iter()
            .filter(|(_, e)| e.json_schema)
            .map(|(m, _)| m.clone())
            .collect();
        models.sort();
        models
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
