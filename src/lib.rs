//! # llm-dispatch
//!
//! Client-side batch dispatcher for chat-completion APIs.
//!
//! Given a list of input texts and a prompt template, the dispatcher fans
//! calls out to a [`ChatEndpoint`] while staying under a tokens-per-minute
//! ceiling, bounding in-flight concurrency, coordinating a global pause
//! when the server reports a rate limit, and producing per-request and
//! per-batch accounting (tokens, cache-discounted cost, timings, retries).
//!
//! The endpoint itself, input sourcing, and output persistence are
//! external collaborators; this crate owns the scheduling, calibration,
//! and bookkeeping in between.

pub mod config;
pub mod dispatcher;
pub mod endpoint;
pub mod limiter;
pub mod pricing;
pub mod stats;
pub mod structured;
pub mod tokens;

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorKind};

// Re-export main types for convenience
pub use config::DispatcherConfig;
pub use dispatcher::{
    cancel_pair, BatchDispatcher, BatchOptions, BatchOutcome, CancelHandle, CancelToken,
    RequestResult, SingleOptions,
};
pub use endpoint::{
    ApiError, ChatEndpoint, ChatMessage, ChatRequest, ChatResponse, MessageRole, TokenUsage,
};
pub use limiter::{AdaptiveRateLimiter, CalibrationConfig, RateLimiterConfig, RateLimiterSnapshot};
pub use pricing::{CostBreakdown, PricingEntry, PricingTable};
pub use stats::{RequestRecord, Stats, StatsManager};
