use crate::config::DispatcherConfig;
use crate::endpoint::{ApiError, ChatEndpoint, ChatMessage, ChatRequest, ChatResponse};
use crate::limiter::{is_rate_limit, wait_hint, AdaptiveRateLimiter, RateLimiterConfig, RateLimiterSnapshot};
use crate::pricing::{PricingEntry, PricingTable};
use crate::stats::{RequestRecord, Stats, StatsManager};
use crate::structured;
use crate::tokens::{estimator_for_model, TokenEstimator};
use crate::{Error, ErrorKind, Result};
use futures::StreamExt;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

use super::cancel::CancelToken;
use super::progress::ProgressTracker;
use super::request::{
    render_template, BatchOptions, BatchOutcome, CompleteStats, Request, RequestResult,
    SingleOptions,
};

/// Grace period between a pass finishing and rate-limited items being
/// resubmitted.
const RESUBMIT_GRACE: Duration = Duration::from_millis(100);

/// Completion-token reserve used for estimates when `max_tokens` is unset.
const DEFAULT_COMPLETION_RESERVE: u64 = 512;

/// Orchestrates concurrent chat-completion calls over a shared token
/// budget. One dispatcher instance owns its rate limiter and stats
/// manager; a crash loses in-flight state by design.
pub struct BatchDispatcher {
    config: DispatcherConfig,
    endpoint: Arc<dyn ChatEndpoint>,
    pricing: PricingTable,
    pricing_entry: PricingEntry,
    limiter: Arc<AdaptiveRateLimiter>,
    stats: Arc<StatsManager>,
    estimator: Arc<dyn TokenEstimator>,
    concurrency: usize,
}

impl std::fmt::Debug for BatchDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchDispatcher")
            .field("config", &self.config)
            .field("pricing_entry", &self.pricing_entry)
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

/// Per-item state carried across recovery passes.
struct WorkItem {
    index: usize,
    request: Request,
    attempts: u32,
    coordinated_wait: f64,
    rate_limited: bool,
    last_error: Option<ApiError>,
    submitted: Instant,
}

enum PassOutcome {
    Finalized(usize, RequestResult),
    RateLimited(WorkItem),
}

impl BatchDispatcher {
    /// Create a dispatcher. Fails fast on a model unknown to the pricing
    /// table or on missing credentials.
    pub fn new(
        endpoint: Arc<dyn ChatEndpoint>,
        pricing: PricingTable,
        config: DispatcherConfig,
    ) -> Result<Self> {
        let pricing_entry = *pricing.entry(&config.model).ok_or_else(|| {
            Error::config(format!(
                "model '{}' is not in the pricing table",
                config.model
            ))
        })?;
        match config.api_key.as_deref() {
            Some(key) if !key.trim().is_empty() => {}
            _ => return Err(Error::config("missing API credentials")),
        }

        let concurrency = config.effective_concurrency();
        let limiter = Arc::new(AdaptiveRateLimiter::new(
            RateLimiterConfig::new()
                .with_max_tpm(config.max_tpm)
                .with_adaptive_calibration(config.adaptive_calibration),
        ));
        let stats = Arc::new(StatsManager::new(concurrency));
        let estimator = estimator_for_model(&config.model);

        info!(
            model = config.model.as_str(),
            max_concurrent = concurrency,
            max_tpm = config.max_tpm,
            provider = config.provider.as_deref().unwrap_or(""),
            environment = config.environment.as_deref().unwrap_or(""),
            "dispatcher ready"
        );

        Ok(Self {
            config,
            endpoint,
            pricing,
            pricing_entry,
            limiter,
            stats,
            estimator,
            concurrency,
        })
    }

    /// Pricing entry resolved for the configured model.
    pub fn pricing_entry(&self) -> &PricingEntry {
        &self.pricing_entry
    }

    /// Process one input list; one result per input, in input order.
    pub async fn submit_batch(
        &self,
        inputs: Vec<String>,
        prompt_template: &str,
        options: BatchOptions,
    ) -> Result<BatchOutcome> {
        let BatchOptions {
            schema,
            ids,
            extras,
            cancel,
        } = options;

        if let Some(ids) = &ids {
            if ids.len() != inputs.len() {
                return Err(Error::validation(format!(
                    "ids length {} does not match inputs length {}",
                    ids.len(),
                    inputs.len()
                )));
            }
            let mut seen = std::collections::HashSet::with_capacity(ids.len());
            for id in ids {
                if !seen.insert(id.as_str()) {
                    return Err(Error::validation(format!(
                        "duplicate id '{id}' in batch"
                    )));
                }
            }
        }
        let schema = self.prepare_schema(schema)?;

        let batch_id = Uuid::new_v4().to_string();
        let total = inputs.len();
        self.stats.start_batch(&batch_id)?;
        info!(
            batch_id = batch_id.as_str(),
            inputs = total,
            model = self.config.model.as_str(),
            correlation_id = self.config.correlation_id.as_deref().unwrap_or(""),
            "batch submitted"
        );

        let submitted = Instant::now();
        let mut pending: Vec<WorkItem> = inputs
            .iter()
            .enumerate()
            .map(|(index, text)| WorkItem {
                index,
                request: Request {
                    id: ids
                        .as_ref()
                        .map(|ids| ids[index].clone())
                        .unwrap_or_else(|| Uuid::new_v4().to_string()),
                    prompt: render_template(prompt_template, text, &extras),
                    schema: schema.clone(),
                },
                attempts: 0,
                coordinated_wait: 0.0,
                rate_limited: false,
                last_error: None,
                submitted,
            })
            .collect();

        let mut results: Vec<Option<RequestResult>> = (0..total).map(|_| None).collect();
        let mut progress = ProgressTracker::new(total);

        loop {
            // One pass: first-completed collection, bounded in-flight work.
            let pause_installed = AtomicBool::new(false);
            let mut rate_limited: Vec<WorkItem> = Vec::new();
            {
                let mut stream = futures::stream::iter(
                    pending
                        .drain(..)
                        .map(|item| self.run_item(item, &pause_installed, cancel.as_ref())),
                )
                .buffer_unordered(self.concurrency);

                while let Some(outcome) = stream.next().await {
                    match outcome {
                        PassOutcome::Finalized(index, result) => {
                            progress.on_complete(result.success);
                            results[index] = Some(result);
                        }
                        PassOutcome::RateLimited(item) => rate_limited.push(item),
                    }
                }
            }

            if rate_limited.is_empty() {
                break;
            }
            if cancel.as_ref().map(|c| c.is_cancelled()).unwrap_or(false) {
                // Rate-limited leftovers drop without further retries, so
                // each is recorded exactly once.
                for item in rate_limited {
                    let message = item
                        .last_error
                        .as_ref()
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "rate limited".to_string());
                    let result =
                        self.finalize_failure(&item, item.attempts, 0.0, message, ErrorKind::RateLimit);
                    progress.on_complete(false);
                    results[item.index] = Some(result);
                }
                break;
            }

            warn!(
                batch_id = batch_id.as_str(),
                rate_limited = rate_limited.len(),
                "resubmitting rate-limited items after grace period"
            );
            rate_limited.sort_by_key(|item| item.index);
            tokio::time::sleep(RESUBMIT_GRACE).await;
            pending = rate_limited;
        }

        let stats = self.stats.end_batch(&batch_id)?;
        info!(
            batch_id = batch_id.as_str(),
            total = stats.total_requests,
            successful = stats.successful_requests,
            failed = stats.failed_requests,
            total_cost = format!("{:.6}", stats.total_cost).as_str(),
            "batch completed"
        );

        let results: Vec<RequestResult> = results.into_iter().flatten().collect();
        debug_assert_eq!(results.len(), total);
        Ok(BatchOutcome {
            batch_id,
            results,
            stats,
        })
    }

    /// One-off request: a one-element batch minus the batch bookkeeping.
    pub async fn submit_single(
        &self,
        text: &str,
        prompt_template: &str,
        options: SingleOptions,
    ) -> Result<RequestResult> {
        let schema = self.prepare_schema(options.schema)?;
        let mut item = WorkItem {
            index: 0,
            request: Request {
                id: options.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
                prompt: render_template(prompt_template, text, &options.extras),
                schema,
            },
            attempts: 0,
            coordinated_wait: 0.0,
            rate_limited: false,
            last_error: None,
            submitted: Instant::now(),
        };
        loop {
            let pause_installed = AtomicBool::new(false);
            match self.run_item(item, &pause_installed, None).await {
                PassOutcome::Finalized(_, result) => return Ok(result),
                PassOutcome::RateLimited(next) => {
                    item = next;
                    tokio::time::sleep(RESUBMIT_GRACE).await;
                }
            }
        }
    }

    /// Global stats since construction (or the last reset).
    pub fn get_global_stats(&self) -> Stats {
        self.stats.global()
    }

    /// Explicitly reset global stats.
    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    /// Combined batch/global report.
    pub fn get_complete_stats(
        &self,
        batch: Option<&Stats>,
        include_global: bool,
    ) -> CompleteStats {
        CompleteStats {
            batch: batch.cloned(),
            global: include_global.then(|| self.stats.global()),
        }
    }

    /// Point-in-time limiter view.
    pub async fn limiter_snapshot(&self) -> RateLimiterSnapshot {
        self.limiter.snapshot().await
    }

    /// Gate a structured-output request on the model capability table.
    fn prepare_schema(&self, schema: Option<Value>) -> Result<Option<Arc<Value>>> {
        let Some(schema) = schema else {
            return Ok(None);
        };
        if !self.pricing.supports_json_schema(&self.config.model) {
            return Err(Error::SchemaUnsupported {
                model: self.config.model.clone(),
                compatible: self.pricing.schema_capable_models(),
            });
        }
        structured::validate_schema(&schema)?;
        Ok(Some(Arc::new(schema)))
    }

    /// Drive one work item through the limiter and the endpoint, retrying
    /// transient failures in-call. Rate limits are handed back to the
    /// batch loop instead of being finalized.
    async fn run_item(
        &self,
        mut item: WorkItem,
        pause_installed: &AtomicBool,
        cancel: Option<&CancelToken>,
    ) -> PassOutcome {
        if cancel.map(|c| c.is_cancelled()).unwrap_or(false) {
            let result = self.finalize_failure(
                &item,
                item.attempts,
                0.0,
                "batch cancelled".to_string(),
                ErrorKind::PermanentApi,
            );
            return PassOutcome::Finalized(item.index, result);
        }

        let estimate = self.estimate(&item.request);
        let mut attempts_this_call: u32 = 0;

        loop {
            attempts_this_call += 1;
            self.limiter.acquire(estimate).await;

            self.stats.record_concurrent_start();
            let call_started = Instant::now();
            let response = self.endpoint.chat(self.build_request(&item.request)).await;
            let api_time = call_started.elapsed().as_secs_f64();
            self.stats.record_concurrent_end();

            match response {
                Ok(response) => {
                    self.limiter
                        .record_usage(estimate, response.usage.total_tokens)
                        .await;
                    self.limiter.record_successful_request().await;
                    let attempts = item.attempts + attempts_this_call;
                    let result = self.finalize_success(&item, response, attempts, api_time);
                    return PassOutcome::Finalized(item.index, result);
                }
                Err(error) if is_rate_limit(&error) => {
                    let wait = wait_hint(&error);
                    if !pause_installed.swap(true, Ordering::SeqCst) {
                        self.limiter
                            .record_api_rate_limit(
                                wait,
                                &format!("request {}", item.request.id),
                            )
                            .await;
                    }
                    item.attempts += attempts_this_call;
                    item.coordinated_wait += wait.as_secs_f64();
                    item.rate_limited = true;
                    item.last_error = Some(error);
                    return PassOutcome::RateLimited(item);
                }
                Err(error) if error.retryable => {
                    if attempts_this_call < self.config.max_retries {
                        tokio::time::sleep(self.config.retry_delay).await;
                        continue;
                    }
                    let attempts = item.attempts + attempts_this_call;
                    let result = self.finalize_failure(
                        &item,
                        attempts,
                        api_time,
                        error.to_string(),
                        ErrorKind::RetryExhausted,
                    );
                    return PassOutcome::Finalized(item.index, result);
                }
                Err(error) => {
                    let attempts = item.attempts + attempts_this_call;
                    let result = self.finalize_failure(
                        &item,
                        attempts,
                        api_time,
                        error.to_string(),
                        ErrorKind::PermanentApi,
                    );
                    return PassOutcome::Finalized(item.index, result);
                }
            }
        }
    }

    fn finalize_success(
        &self,
        item: &WorkItem,
        response: ChatResponse,
        attempts: u32,
        api_time: f64,
    ) -> RequestResult {
        let usage = response.usage;
        let cached = usage.cached_tokens.min(usage.prompt_tokens);
        let cost = self
            .pricing_entry
            .cost(usage.prompt_tokens, cached, usage.completion_tokens);
        let parsed = item
            .request
            .schema
            .as_deref()
            .and_then(|schema| structured::parse_structured(&response.content, Some(schema)));
        let processing_time = item.submitted.elapsed().as_secs_f64();

        self.stats.record_request(RequestRecord {
            success: true,
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            cached_tokens: cached,
            cost: cost.total,
            api_response_time: api_time,
            error_kind: None,
            retry_count: attempts.saturating_sub(1),
            api_rate_limit_detected: item.rate_limited,
            coordinated_wait: item.coordinated_wait,
            processing_time,
            model: self.config.model.clone(),
        });

        RequestResult {
            id: item.request.id.clone(),
            success: true,
            content: Some(response.content),
            parsed,
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            cached_tokens: cached,
            tokens_used: usage.prompt_tokens + usage.completion_tokens,
            cost: cost.total,
            api_response_time: api_time,
            processing_time,
            attempts,
            error: None,
            error_kind: None,
        }
    }

    fn finalize_failure(
        &self,
        item: &WorkItem,
        attempts: u32,
        api_time: f64,
        message: String,
        kind: ErrorKind,
    ) -> RequestResult {
        let processing_time = item.submitted.elapsed().as_secs_f64();
        self.stats.record_request(RequestRecord {
            success: false,
            input_tokens: 0,
            output_tokens: 0,
            cached_tokens: 0,
            cost: 0.0,
            api_response_time: api_time,
            error_kind: Some(kind),
            retry_count: attempts.saturating_sub(1),
            api_rate_limit_detected: item.rate_limited,
            coordinated_wait: item.coordinated_wait,
            processing_time,
            model: self.config.model.clone(),
        });

        RequestResult {
            id: item.request.id.clone(),
            success: false,
            content: None,
            parsed: None,
            input_tokens: 0,
            output_tokens: 0,
            cached_tokens: 0,
            tokens_used: 0,
            cost: 0.0,
            api_response_time: api_time,
            processing_time,
            attempts,
            error: Some(message),
            error_kind: Some(kind),
        }
    }

    fn estimate(&self, request: &Request) -> u64 {
        let completion_reserve = self
            .config
            .max_tokens
            .map(u64::from)
            .unwrap_or(DEFAULT_COMPLETION_RESERVE);
        self.estimator.estimate(&request.prompt) + completion_reserve
    }

    fn build_request(&self, request: &Request) -> ChatRequest {
        ChatRequest {
            model: self.config.model.clone(),
            messages: vec![ChatMessage::user(request.prompt.clone())],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            response_format: request
                .schema
                .as_deref()
                .map(structured::response_format),
        }
    }
}
