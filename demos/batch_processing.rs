//! Batch dispatch against a scripted endpoint.
//!
//! Run with: cargo run --example batch_processing

use async_trait::async_trait;
use llm_dispatch::{
    ApiError, BatchDispatcher, BatchOptions, ChatEndpoint, ChatRequest, ChatResponse,
    DispatcherConfig, PricingTable, TokenUsage,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Fake endpoint: answers after a short delay, rate-limits once midway.
struct DemoEndpoint {
    calls: AtomicUsize,
}

#[async_trait]
impl ChatEndpoint for DemoEndpoint {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ApiError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(Duration::from_millis(30)).await;
        if call == 4 {
            return Err(ApiError::rate_limited(
                "token rate limit exceeded, retry after 1 seconds",
                Some(1.0),
            ));
        }
        Ok(ChatResponse {
            content: format!("summary of: {}", request.messages[0].content),
            usage: TokenUsage::new(120, 40, 30),
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let dispatcher = BatchDispatcher::new(
        Arc::new(DemoEndpoint {
            calls: AtomicUsize::new(0),
        }),
        PricingTable::builtin()?,
        DispatcherConfig::new("gpt-4o-mini")
            .with_api_key("demo-key")
            .with_max_concurrent(4)
            .with_max_tokens(256),
    )?;

    let inputs: Vec<String> = (1..=8)
        .map(|i| format!("document {i}: the quick brown fox jumps over the lazy dog"))
        .collect();

    let outcome = dispatcher
        .submit_batch(inputs, "Summarize in one line: {text}", BatchOptions::new())
        .await?;

    println!("batch {} finished", outcome.batch_id);
    for result in &outcome.results {
        println!(
            "  [{}] success={} attempts={} tokens={} cost=${:.6}",
            result.id, result.success, result.attempts, result.tokens_used, result.cost
        );
    }
    let stats = &outcome.stats;
    println!(
        "totals: {}/{} ok, {} tokens, ${:.6}, cache hit rate {:.1}%, peak concurrency {}",
        stats.successful_requests,
        stats.total_requests,
        stats.total_tokens(),
        stats.total_cost,
        stats.cache_hit_rate() * 100.0,
        stats.peak_concurrency
    );
    println!(
        "limiter: {:?}",
        dispatcher.limiter_snapshot().await
    );
    Ok(())
}
