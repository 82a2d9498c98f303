//! Dispatcher configuration.

use std::time::Duration;
use tracing::warn;

/// Hard ceiling on configured concurrency.
pub const MAX_CONCURRENT_CEILING: usize = 50;

/// Configuration for a [`BatchDispatcher`](crate::dispatcher::BatchDispatcher).
///
/// Keep the surface small: everything has a sensible default except the
/// model name and credentials.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub model: String,
    pub temperature: f64,
    pub max_tokens: Option<u32>,
    /// In-flight call cap; clamped to [`MAX_CONCURRENT_CEILING`].
    pub max_concurrent: usize,
    pub max_tpm: u64,
    pub adaptive_calibration: bool,
    /// Maximum attempts per call (transient failures only).
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub api_key: Option<String>,
    pub environment: Option<String>,
    pub provider: Option<String>,
    pub correlation_id: Option<String>,
}

impl DispatcherConfig {
    pub fn new(model: impl Into<String>) -> Self {
        let max_concurrent = std::env::var("LLM_DISPATCH_MAX_CONCURRENT")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(10);
        Self {
            model: model.into(),
            temperature: 0.1,
            max_tokens: None,
            max_concurrent,
            max_tpm: 180_000,
            adaptive_calibration: true,
            max_retries: 2,
            retry_delay: Duration::from_millis(100),
            api_key: std::env::var("LLM_DISPATCH_API_KEY").ok(),
            environment: None,
            provider: None,
            correlation_id: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    pub fn with_max_tpm(mut self, max_tpm: u64) -> Self {
        self.max_tpm = max_tpm.max(1);
        self
    }

    pub fn with_adaptive_calibration(mut self, enable: bool) -> Self {
        self.adaptive_calibration = enable;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Effective concurrency after the hard ceiling.
    pub(crate) fn effective_concurrency(&self) -> usize {
        if self.max_concurrent > MAX_CONCURRENT_CEILING {
            warn!(
                requested = self.max_concurrent,
                ceiling = MAX_CONCURRENT_CEILING,
                "max_concurrent clamped to ceiling"
            );
            MAX_CONCURRENT_CEILING
        } else {
            self.max_concurrent.max(1)
        }
    }
}
