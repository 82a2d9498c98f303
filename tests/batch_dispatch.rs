//! End-to-end dispatcher scenarios over scripted endpoints.

use async_trait::async_trait;
use llm_dispatch::{
    cancel_pair, ApiError, BatchDispatcher, BatchOptions, ChatEndpoint, ChatRequest,
    ChatResponse, DispatcherConfig, Error, ErrorKind, PricingTable, SingleOptions, TokenUsage,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

type ChatResult = std::result::Result<ChatResponse, ApiError>;

/// Endpoint scripted by a closure over (request, per-input attempt number).
struct ScriptedEndpoint {
    attempts: Mutex<HashMap<String, u32>>,
    behavior: Box<dyn Fn(&ChatRequest, u32) -> ChatResult + Send + Sync>,
}

impl ScriptedEndpoint {
    fn new(behavior: impl Fn(&ChatRequest, u32) -> ChatResult + Send + Sync + 'static) -> Self {
        Self {
            attempts: Mutex::new(HashMap::new()),
            behavior: Box::new(behavior),
        }
    }
}

#[async_trait]
impl ChatEndpoint for ScriptedEndpoint {
    async fn chat(&self, request: ChatRequest) -> ChatResult {
        let key = request.messages[0].content.clone();
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let entry = attempts.entry(key).or_insert(0);
            *entry += 1;
            *entry
        };
        (self.behavior)(&request, attempt)
    }
}

fn test_pricing() -> PricingTable {
    PricingTable::from_json_str(
        r#"{
            "test-model": {"input": 0.001, "output": 0.002, "cache": 0.0005, "json_schema": true},
            "plain-model": {"input": 0.001, "output": 0.002, "cache": 0.0005, "json_schema": false}
        }"#,
    )
    .unwrap()
}

fn base_config(model: &str) -> DispatcherConfig {
    DispatcherConfig::new(model)
        .with_api_key("test-key")
        .with_max_tpm(10_000_000)
}

fn dispatcher(endpoint: impl ChatEndpoint + 'static, config: DispatcherConfig) -> BatchDispatcher {
    BatchDispatcher::new(Arc::new(endpoint), test_pricing(), config).unwrap()
}

fn echo_response(request: &ChatRequest) -> ChatResult {
    Ok(ChatResponse {
        content: format!("echo:{}", request.messages[0].content),
        usage: TokenUsage::new(50, 20, 10),
    })
}

fn inputs(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("item-{i}")).collect()
}

#[tokio::test]
async fn test_cost_accounting_with_cache_discount() {
    // 50 prompt / 20 completion / 10 cached per call at
    // {in: 0.001, out: 0.002, cache: 0.0005}:
    // (40 * 0.001 + 10 * 0.0005 + 20 * 0.002) / 1000 = 0.000085 per request.
    let endpoint = ScriptedEndpoint::new(|request, _| echo_response(request));
    let d = dispatcher(endpoint, base_config("test-model"));

    let outcome = d
        .submit_batch(inputs(3), "{text}", BatchOptions::new())
        .await
        .unwrap();

    assert_eq!(outcome.results.len(), 3);
    for result in &outcome.results {
        assert!(result.success);
        assert!((result.cost - 0.000085).abs() < 1e-9);
        assert_eq!(result.input_tokens, 50);
        assert_eq!(result.output_tokens, 20);
        assert_eq!(result.cached_tokens, 10);
        assert_eq!(result.tokens_used, 70);
        assert!(result.cached_tokens <= result.input_tokens);
    }
    assert!((outcome.stats.total_cost - 0.000255).abs() < 1e-9);
    assert!((outcome.stats.cache_hit_rate() - 10.0 / 60.0).abs() < 1e-9);
    assert!(
        (outcome.stats.cost_savings_from_cache(d.pricing_entry()) - 30.0 / 1000.0 * 0.0005).abs()
            < 1e-12
    );
}

#[tokio::test]
async fn test_generated_ids_are_unique_and_ordered() {
    let endpoint = ScriptedEndpoint::new(|request, _| echo_response(request));
    let d = dispatcher(endpoint, base_config("test-model"));

    let outcome = d
        .submit_batch(inputs(4), "{text}", BatchOptions::new())
        .await
        .unwrap();

    let mut ids: Vec<&str> = outcome.results.iter().map(|r| r.id.as_str()).collect();
    for (i, result) in outcome.results.iter().enumerate() {
        assert_eq!(result.content.as_deref(), Some(format!("echo:item-{i}").as_str()));
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 4);
}

#[tokio::test]
async fn test_provided_ids_are_carried_through() {
    let endpoint = ScriptedEndpoint::new(|request, _| echo_response(request));
    let d = dispatcher(endpoint, base_config("test-model"));

    let ids: Vec<String> = (0..3).map(|i| format!("row-{i}")).collect();
    let outcome = d
        .submit_batch(
            inputs(3),
            "{text}",
            BatchOptions::new().with_ids(ids.clone()),
        )
        .await
        .unwrap();
    for (i, result) in outcome.results.iter().enumerate() {
        assert_eq!(result.id, ids[i]);
    }
}

#[tokio::test]
async fn test_ids_length_mismatch_is_rejected() {
    let endpoint = ScriptedEndpoint::new(|_, _| unreachable!("must not be called"));
    let d = dispatcher(endpoint, base_config("test-model"));

    let err = d
        .submit_batch(
            inputs(3),
            "{text}",
            BatchOptions::new().with_ids(vec!["only-one".to_string()]),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn test_duplicate_ids_are_rejected() {
    let endpoint = ScriptedEndpoint::new(|_, _| unreachable!("must not be called"));
    let d = dispatcher(endpoint, base_config("test-model"));

    let ids = vec!["a".to_string(), "b".to_string(), "a".to_string()];
    let err = d
        .submit_batch(inputs(3), "{text}", BatchOptions::new().with_ids(ids))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

/// Endpoint that records the maximum number of concurrent in-flight calls.
struct ConcurrencyProbe {
    live: AtomicUsize,
    max_live: Arc<AtomicUsize>,
}

#[async_trait]
impl ChatEndpoint for ConcurrencyProbe {
    async fn chat(&self, request: ChatRequest) -> ChatResult {
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(live, Ordering::SeqCst);
        // Uneven delays scramble completion order relative to submission.
        let index: u64 = request.messages[0]
            .content
            .trim_start_matches("item-")
            .parse()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100 - index * 7)).await;
        self.live.fetch_sub(1, Ordering::SeqCst);
        echo_response(&request)
    }
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_cap_and_input_order() {
    let max_live = Arc::new(AtomicUsize::new(0));
    let endpoint = ConcurrencyProbe {
        live: AtomicUsize::new(0),
        max_live: max_live.clone(),
    };
    let d = dispatcher(endpoint, base_config("test-model").with_max_concurrent(2));

    let outcome = d
        .submit_batch(inputs(10), "{text}", BatchOptions::new())
        .await
        .unwrap();

    assert!(max_live.load(Ordering::SeqCst) <= 2);
    assert_eq!(outcome.stats.peak_concurrency, 2);
    assert_eq!(outcome.results.len(), 10);
    for (i, result) in outcome.results.iter().enumerate() {
        assert_eq!(result.content.as_deref(), Some(format!("echo:item-{i}").as_str()));
    }
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_recovery_with_coordinated_pause() {
    // Input #3 reports a rate limit with retry_after=2 on its first
    // attempt, then succeeds.
    let endpoint = ScriptedEndpoint::new(|request, attempt| {
        if request.messages[0].content == "item-2" && attempt == 1 {
            Err(ApiError::rate_limited(
                "token rate limit exceeded",
                Some(2.0),
            ))
        } else {
            echo_response(request)
        }
    });
    let d = dispatcher(endpoint, base_config("test-model"));

    let started = Instant::now();
    let outcome = d
        .submit_batch(inputs(5), "{text}", BatchOptions::new())
        .await
        .unwrap();

    // a single global pause of at least the hinted 2 seconds
    assert!(started.elapsed() >= Duration::from_secs(2));

    assert_eq!(outcome.results.len(), 5);
    assert!(outcome.results.iter().all(|r| r.success));
    assert_eq!(outcome.stats.successful_requests, 5);
    assert_eq!(outcome.stats.failed_requests, 0);
    assert_eq!(outcome.stats.api_rate_limits_detected, 1);
    assert_eq!(outcome.stats.total_retries, 1);

    let snapshot = d.limiter_snapshot().await;
    assert_eq!(snapshot.api_rate_limits_detected, 1);
    assert!(!snapshot.paused);

    let retried = &outcome.results[2];
    assert_eq!(retried.attempts, 2);
}

#[tokio::test]
async fn test_retry_exhaustion_under_default_budget() {
    // Two transient failures exhaust the default budget of 2 attempts.
    let endpoint = ScriptedEndpoint::new(|request, attempt| {
        if attempt <= 2 {
            Err(ApiError::transient("connection reset"))
        } else {
            echo_response(request)
        }
    });
    let d = dispatcher(endpoint, base_config("test-model"));

    let result = d
        .submit_single("item-0", "{text}", SingleOptions::new())
        .await
        .unwrap();
    assert!(!result.success);
    assert_eq!(result.error_kind, Some(ErrorKind::RetryExhausted));
    assert_eq!(result.attempts, 2);

    let stats = d.get_global_stats();
    assert_eq!(stats.failed_requests, 1);
    assert_eq!(stats.errors_by_kind[&ErrorKind::RetryExhausted], 1);
}

#[tokio::test]
async fn test_retry_succeeds_with_larger_budget() {
    let endpoint = ScriptedEndpoint::new(|request, attempt| {
        if attempt <= 2 {
            Err(ApiError::transient("connection reset"))
        } else {
            echo_response(request)
        }
    });
    let d = dispatcher(endpoint, base_config("test-model").with_max_retries(3));

    let result = d
        .submit_single("item-0", "{text}", SingleOptions::new())
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.attempts, 3);
    assert_eq!(d.get_global_stats().total_retries, 2);
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = calls.clone();
    let endpoint = ScriptedEndpoint::new(move |_, _| {
        counted.fetch_add(1, Ordering::SeqCst);
        Err(ApiError::permanent("invalid request").with_status(400))
    });
    let d = dispatcher(endpoint, base_config("test-model"));

    let outcome = d
        .submit_batch(inputs(1), "{text}", BatchOptions::new())
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let result = &outcome.results[0];
    assert!(!result.success);
    assert_eq!(result.error_kind, Some(ErrorKind::PermanentApi));
    assert_eq!(result.attempts, 1);
}

fn sentiment_schema() -> serde_json::Value {
    llm_dispatch::structured::SchemaGenerator::new()
        .add_property("sentiment", json!({"type": "string"}))
        .add_property("score", json!({"type": "number"}))
        .require("sentiment")
        .require("score")
        .build()
}

#[tokio::test]
async fn test_schema_on_incapable_model_fails_synchronously() {
    let endpoint = ScriptedEndpoint::new(|_, _| unreachable!("must not be called"));
    let d = dispatcher(endpoint, base_config("plain-model"));

    let err = d
        .submit_batch(
            inputs(2),
            "{text}",
            BatchOptions::new().with_schema(sentiment_schema()),
        )
        .await
        .unwrap_err();
    match err {
        Error::SchemaUnsupported { model, compatible } => {
            assert_eq!(model, "plain-model");
            assert!(compatible.contains(&"test-model".to_string()));
        }
        other => panic!("expected SchemaUnsupported, got {other:?}"),
    }
}

#[tokio::test]
async fn test_structured_roundtrip() {
    let endpoint = ScriptedEndpoint::new(|_, _| {
        Ok(ChatResponse {
            content: r#"{"sentiment": "positive", "score": 0.9}"#.to_string(),
            usage: TokenUsage::new(50, 20, 0),
        })
    });
    let d = dispatcher(endpoint, base_config("test-model"));

    let outcome = d
        .submit_batch(
            inputs(3),
            "{text}",
            BatchOptions::new().with_schema(sentiment_schema()),
        )
        .await
        .unwrap();
    for result in &outcome.results {
        assert!(result.success);
        let parsed = result.parsed.as_ref().unwrap();
        assert_eq!(parsed["sentiment"], "positive");
        assert_eq!(parsed["score"], 0.9);
    }
}

#[tokio::test]
async fn test_parse_failure_degrades_to_raw_content() {
    let endpoint = ScriptedEndpoint::new(|_, _| {
        Ok(ChatResponse {
            content: "definitely not json".to_string(),
            usage: TokenUsage::new(50, 20, 0),
        })
    });
    let d = dispatcher(endpoint, base_config("test-model"));

    let result = d
        .submit_single(
            "item-0",
            "{text}",
            SingleOptions::new().with_schema(sentiment_schema()),
        )
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.content.as_deref(), Some("definitely not json"));
    assert!(result.parsed.is_none());
}

#[tokio::test]
async fn test_template_extras_substitution() {
    let endpoint = ScriptedEndpoint::new(|request, _| echo_response(request));
    let d = dispatcher(endpoint, base_config("test-model"));

    let result = d
        .submit_single(
            "bonjour",
            "Translate from {lang}: {text}",
            SingleOptions::new().with_extra("lang", "French"),
        )
        .await
        .unwrap();
    assert_eq!(
        result.content.as_deref(),
        Some("echo:Translate from French: bonjour")
    );
}

#[tokio::test]
async fn test_unknown_model_fails_at_construction() {
    let endpoint = ScriptedEndpoint::new(|_, _| unreachable!("must not be called"));
    let err = BatchDispatcher::new(
        Arc::new(endpoint),
        test_pricing(),
        base_config("no-such-model"),
    )
    .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[tokio::test]
async fn test_missing_credentials_fail_at_construction() {
    let endpoint = ScriptedEndpoint::new(|_, _| unreachable!("must not be called"));
    let mut config = base_config("test-model");
    config.api_key = None;
    let err = BatchDispatcher::new(Arc::new(endpoint), test_pricing(), config).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[tokio::test]
async fn test_pre_cancelled_batch_finalizes_without_calls() {
    let endpoint = ScriptedEndpoint::new(|_, _| unreachable!("must not be called"));
    let d = dispatcher(endpoint, base_config("test-model"));

    let (handle, token) = cancel_pair();
    handle.cancel();
    let outcome = d
        .submit_batch(inputs(3), "{text}", BatchOptions::new().with_cancel(token))
        .await
        .unwrap();
    assert_eq!(outcome.results.len(), 3);
    assert!(outcome.results.iter().all(|r| !r.success));
    assert_eq!(outcome.stats.failed_requests, 3);
    assert_eq!(
        outcome.stats.total_requests,
        outcome.stats.successful_requests + outcome.stats.failed_requests
    );
}

/// Endpoint that cancels the batch from inside its first call and keeps
/// reporting rate limits, so the leftover lands in the dropped set.
struct CancellingEndpoint {
    handle: llm_dispatch::CancelHandle,
}

#[async_trait]
impl ChatEndpoint for CancellingEndpoint {
    async fn chat(&self, _request: ChatRequest) -> ChatResult {
        self.handle.cancel();
        Err(ApiError::rate_limited("token rate limit exceeded", Some(1.0)))
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancel_drops_rate_limited_items_without_retry() {
    let (handle, token) = cancel_pair();
    let endpoint = CancellingEndpoint { handle };
    let d = dispatcher(endpoint, base_config("test-model"));

    let outcome = d
        .submit_batch(inputs(1), "{text}", BatchOptions::new().with_cancel(token))
        .await
        .unwrap();
    let result = &outcome.results[0];
    assert!(!result.success);
    assert_eq!(result.error_kind, Some(ErrorKind::RateLimit));
    assert_eq!(result.attempts, 1);
    assert_eq!(outcome.stats.failed_requests, 1);
    assert_eq!(outcome.stats.errors_by_kind[&ErrorKind::RateLimit], 1);
}
