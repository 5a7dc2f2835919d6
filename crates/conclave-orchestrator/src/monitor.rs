use crate::types::AgentMetrics;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// How a single dispatch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchKind {
    Success,
    Failure,
    Timeout,
    Cancelled,
}

/// Tracks per-agent dispatch metrics for the pool.
#[derive(Default)]
pub struct AgentMonitor {
    metrics: Arc<RwLock<HashMap<String, AgentMetrics>>>,
}

impl AgentMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the end of one dispatch.
    pub async fn record_dispatch(
        &self,
        agent_id: &str,
        kind: DispatchKind,
        duration_ms: u64,
        tool_calls: u64,
    ) {
        let mut metrics = self.metrics.write().await;
        let entry = metrics.entry(agent_id.to_string()).or_default();
        entry.dispatches += 1;
        entry.duration_ms += duration_ms;
        entry.tool_calls += tool_calls;
        match kind {
            DispatchKind::Success => entry.successes += 1,
            DispatchKind::Failure => entry.failures += 1,
            DispatchKind::Timeout => {
                entry.failures += 1;
                entry.timeouts += 1;
            }
            DispatchKind::Cancelled => entry.cancellations += 1,
        }
    }

    pub async fn get(&self, agent_id: &str) -> AgentMetrics {
        self.metrics
            .read()
            .await
            .get(agent_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Get a snapshot of all agent metrics.
    pub async fn snapshot(&self) -> HashMap<String, AgentMetrics> {
        self.metrics.read().await.clone()
    }

    /// Get aggregate metrics across all agents.
    pub async fn aggregate(&self) -> AgentMetrics {
        let metrics = self.metrics.read().await;
        let mut total = AgentMetrics::default();
        for m in metrics.values() {
            total.dispatches += m.dispatches;
            total.successes += m.successes;
            total.failures += m.failures;
            total.timeouts += m.timeouts;
            total.cancellations += m.cancellations;
            total.tool_calls += m.tool_calls;
            total.duration_ms += m.duration_ms;
        }
        total
    }

    /// Serialize the current metrics as JSON.
    pub async fn to_json(&self) -> serde_json::Value {
        let agents = self.snapshot().await;
        let aggregate = self.aggregate().await;
        serde_json::json!({
            "agents": agents,
            "aggregate": aggregate,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_agent_has_zero_metrics() {
        let monitor = AgentMonitor::new();
        assert_eq!(monitor.get("ghost").await, AgentMetrics::default());
    }

    #[tokio::test]
    async fn test_record_dispatch_kinds() {
        let monitor = AgentMonitor::new();
        monitor
            .record_dispatch("alpha", DispatchKind::Success, 100, 2)
            .await;
        monitor
            .record_dispatch("alpha", DispatchKind::Timeout, 50, 0)
            .await;
        monitor
            .record_dispatch("alpha", DispatchKind::Cancelled, 5, 0)
            .await;

        let m = monitor.get("alpha").await;
        assert_eq!(m.dispatches, 3);
        assert_eq!(m.successes, 1);
        assert_eq!(m.failures, 1);
        assert_eq!(m.timeouts, 1);
        assert_eq!(m.cancellations, 1);
        assert_eq!(m.tool_calls, 2);
        assert_eq!(m.duration_ms, 155);
    }

    #[tokio::test]
    async fn test_aggregate_and_json() {
        let monitor = AgentMonitor::new();
        monitor
            .record_dispatch("alpha", DispatchKind::Success, 10, 0)
            .await;
        monitor
            .record_dispatch("beta", DispatchKind::Failure, 20, 1)
            .await;

        let total = monitor.aggregate().await;
        assert_eq!(total.dispatches, 2);
        assert_eq!(total.duration_ms, 30);

        let json = monitor.to_json().await;
        assert_eq!(json["aggregate"]["failures"], 1);
        assert_eq!(json["agents"]["beta"]["tool_calls"], 1);
    }
}
