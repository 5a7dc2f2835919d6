//! The completion-backend boundary of the orchestration core.
//!
//! The core never speaks an LLM vendor protocol. It consumes a single call,
//! [`CompletionBackend::complete`], and treats a timeout or an open circuit
//! exactly like any other agent failure.
//!
//! # Main types
//!
//! - [`CompletionBackend`]: The pluggable `complete(prompt, tools) → text` service.
//! - [`HttpBackend`]: Speaks the JSON completion contract over HTTP.
//! - [`ResilientBackend`]: Retry with exponential backoff plus a circuit breaker.

pub mod backend;
pub mod backends;
pub mod config;
pub mod resilient;

pub use backend::{Completion, CompletionBackend, CompletionRequest};
pub use backends::http::HttpBackend;
pub use config::BackendConfig;
pub use resilient::{compute_backoff, CircuitBreakerConfig, ResilientBackend, RetryPolicy};
