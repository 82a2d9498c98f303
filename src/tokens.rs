//! Pre-call token estimation.
//!
//! Estimates feed the rate limiter's proactive gate before the provider
//! reports ground truth; the limiter's calibration factor corrects the
//! systematic error of these heuristics over time.

use crate::endpoint::ChatMessage;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Per-message framing overhead applied on top of content tokens.
const MESSAGE_OVERHEAD: u64 = 3;

pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> u64;

    fn estimate_messages(&self, messages: &[ChatMessage]) -> u64 {
        let content: u64 = messages.iter().map(|m| self.estimate(&m.content)).sum();
        content + messages.len() as u64 * MESSAGE_OVERHEAD
    }
}

/// Character-ratio heuristic estimator.
#[derive(Debug, Clone)]
pub struct CharacterEstimator {
    chars_per_token: f64,
}

impl CharacterEstimator {
    pub fn new() -> Self {
        Self::with_ratio(4.0)
    }

    pub fn with_ratio(chars_per_token: f64) -> Self {
        Self { chars_per_token }
    }
}

impl Default for CharacterEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenEstimator for CharacterEstimator {
    fn estimate(&self, text: &str) -> u64 {
        (text.len() as f64 / self.chars_per_token).ceil() as u64
    }
}

static ESTIMATORS: once_cell::sync::Lazy<RwLock<HashMap<String, Arc<dyn TokenEstimator>>>> =
    once_cell::sync::Lazy::new(|| RwLock::new(HashMap::new()));

/// Resolve (and cache) an estimator for a model family.
pub fn estimator_for_model(model: &str) -> Arc<dyn TokenEstimator> {
    let key = model.to_lowercase();
    if let Ok(cache) = ESTIMATORS.read() {
        if let Some(est) = cache.get(&key) {
            return est.clone();
        }
    }
    // Claude-family tokenizers run denser than the 4-chars default.
    let estimator: Arc<dyn TokenEstimator> = if key.contains("claude") {
        Arc::new(CharacterEstimator::with_ratio(3.5))
    } else {
        Arc::new(CharacterEstimator::new())
    };
    if let Ok(mut cache) = ESTIMATORS.write() {
        cache.insert(key, estimator.clone());
    }
    estimator
}
