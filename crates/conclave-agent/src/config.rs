use crate::backends::http::HttpBackend;
use crate::resilient::{CircuitBreakerConfig, ResilientBackend, RetryPolicy};
use serde::Deserialize;
use std::sync::Arc;

/// Configuration of the completion backend connection.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Endpoint accepting completion requests.
    pub url: String,
    /// Bearer token, if the endpoint requires one.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Retry behaviour for transient errors.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Circuit breaker thresholds.
    #[serde(default)]
    pub circuit: CircuitBreakerConfig,
}

impl BackendConfig {
    /// Build the resilient HTTP backend described by this config.
    pub fn build(&self) -> ResilientBackend {
        let http = Arc::new(HttpBackend::new(self.url.clone(), self.api_key.clone()));
        ResilientBackend::new(http, self.retry.clone()).with_circuit(self.circuit.clone())
    }
}
