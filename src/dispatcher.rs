//! Batch dispatcher.
//!
//! Developer-facing surface for submitting inputs against the endpoint.
//! Implementation details are split into submodules under `src/dispatcher/`.

pub mod cancel;
mod core;
mod progress;
pub mod request;

pub use cancel::{cancel_pair, CancelHandle, CancelToken};
pub use self::core::BatchDispatcher;
pub use request::{
    render_template, BatchOptions, BatchOutcome, CompleteStats, Request, RequestResult,
    SingleOptions,
};
