use crate::monitor::{AgentMonitor, DispatchKind};
use crate::registry::AgentRegistry;
use crate::types::{AgentSpec, AgentState, AgentStatus, AgentSummary};
use chrono::Utc;
use conclave_agent::{CompletionBackend, CompletionRequest};
use conclave_core::{
    execute_call, ConclaveError, ConclaveResult, Message, Tool, ToolRegistry, ToolResult,
};
use futures_util::stream::{FuturesUnordered, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// `[pool]` section of the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Global cap on simultaneously running dispatches.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Deadline applied when a dispatch does not carry its own.
    #[serde(default = "default_dispatch_timeout_secs")]
    pub dispatch_timeout_secs: u64,
}

fn default_max_concurrent() -> usize {
    5
}

fn default_dispatch_timeout_secs() -> u64 {
    120
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            dispatch_timeout_secs: default_dispatch_timeout_secs(),
        }
    }
}

/// A live agent: its persona and resolved tool handles.
struct Worker {
    system_prompt: Option<String>,
    tools: Vec<Arc<dyn Tool>>,
    model_config: serde_json::Value,
    in_flight: Arc<AtomicUsize>,
}

/// One unit of work for one agent.
#[derive(Clone)]
pub struct DispatchRequest {
    pub agent_id: String,
    pub message: String,
    /// Prior conversation, oldest first, sent before `message`.
    pub context: Vec<Message>,
    pub session_id: Option<Uuid>,
    /// Overrides the agent's own tool set for this dispatch.
    pub tools: Option<Vec<Arc<dyn Tool>>>,
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl DispatchRequest {
    pub fn new(agent_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            message: message.into(),
            context: Vec::new(),
            session_id: None,
            tools: None,
            timeout: None,
            cancel: None,
        }
    }

    pub fn with_session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_context(mut self, context: Vec<Message>) -> Self {
        self.context = context;
        self
    }

    pub fn with_tools(mut self, tools: Vec<Arc<dyn Tool>>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Output of a successful dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchResult {
    pub agent_id: String,
    pub text: String,
    pub tool_results: Vec<ToolResult>,
    pub duration_ms: u64,
}

impl DispatchResult {
    /// The agent's text followed by the output of every tool it called.
    pub fn output(&self) -> String {
        let mut out = self.text.clone();
        for result in &self.tool_results {
            if !out.is_empty() {
                out.push('\n');
            }
            let marker = if result.is_error { "error" } else { "ok" };
            out.push_str(&format!("[tool {} {marker}] {}", result.call_id, result.content));
        }
        out
    }
}

/// Result of one task inside a [`BatchResult`].
#[derive(Debug)]
pub struct TaskOutcome {
    /// Position of the task in the submitted batch.
    pub index: usize,
    pub agent_id: String,
    pub result: ConclaveResult<DispatchResult>,
}

/// Per-task results of [`AgentPool::run_parallel`], in submission order.
#[derive(Debug, Default)]
pub struct BatchResult {
    pub outcomes: Vec<TaskOutcome>,
}

impl BatchResult {
    pub fn succeeded(&self) -> impl Iterator<Item = &DispatchResult> {
        self.outcomes.iter().filter_map(|o| o.result.as_ref().ok())
    }

    pub fn failed(&self) -> impl Iterator<Item = (&str, &ConclaveError)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|e| (o.agent_id.as_str(), e)))
    }

    pub fn success_count(&self) -> usize {
        self.succeeded().count()
    }

    pub fn any_cancelled(&self) -> bool {
        self.failed()
            .any(|(_, e)| matches!(e, ConclaveError::Cancelled(_)))
    }
}

/// Keeps an agent marked busy for as long as one of its dispatches is alive.
///
/// Dropping an unreleased guard (the dispatch future was dropped) reverts the
/// agent as a cancellation.
struct BusyGuard {
    registry: Arc<AgentRegistry>,
    in_flight: Arc<AtomicUsize>,
    agent_id: String,
    armed: bool,
}

impl BusyGuard {
    fn enter(
        registry: Arc<AgentRegistry>,
        in_flight: Arc<AtomicUsize>,
        agent_id: &str,
        session_id: Option<Uuid>,
    ) -> Self {
        in_flight.fetch_add(1, Ordering::SeqCst);
        registry.update_runtime(agent_id, |agent| {
            if agent.status != AgentStatus::Disabled {
                agent.status = AgentStatus::Busy;
            }
            if session_id.is_some() {
                agent.current_session_id = session_id;
            }
        });
        Self {
            registry,
            in_flight,
            agent_id: agent_id.to_string(),
            armed: true,
        }
    }

    fn release(&mut self, kind: DispatchKind) {
        if !self.armed {
            return;
        }
        self.armed = false;
        let remaining = self.in_flight.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        self.registry.update_runtime(&self.agent_id, |agent| {
            match kind {
                DispatchKind::Success => {
                    agent.consecutive_failures = 0;
                    agent.last_active_at = Some(Utc::now());
                }
                DispatchKind::Failure | DispatchKind::Timeout => {
                    agent.consecutive_failures += 1;
                    agent.last_active_at = Some(Utc::now());
                }
                DispatchKind::Cancelled => {}
            }
            if agent.status == AgentStatus::Disabled || remaining > 0 {
                return;
            }
            agent.current_session_id = None;
            agent.status = match kind {
                DispatchKind::Failure | DispatchKind::Timeout => AgentStatus::Error,
                DispatchKind::Success | DispatchKind::Cancelled => AgentStatus::Idle,
            };
        });
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.release(DispatchKind::Cancelled);
        debug!(agent = %self.agent_id, "Dispatch dropped before completion");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let registry = self.registry.clone();
            let agent_id = self.agent_id.clone();
            handle.spawn(async move {
                if let Err(e) = registry.persist(&agent_id).await {
                    warn!(agent = %agent_id, error = %e, "Failed to persist agent state");
                }
            });
        }
    }
}

/// Owns the live agents and the global concurrency limit.
pub struct AgentPool {
    registry: Arc<AgentRegistry>,
    backend: Arc<dyn CompletionBackend>,
    tools: Arc<ToolRegistry>,
    monitor: Arc<AgentMonitor>,
    workers: RwLock<HashMap<String, Arc<Worker>>>,
    semaphore: Arc<Semaphore>,
    config: PoolConfig,
    initial_pheromone: f64,
}

impl AgentPool {
    pub fn new(
        registry: Arc<AgentRegistry>,
        backend: Arc<dyn CompletionBackend>,
        tools: Arc<ToolRegistry>,
        config: PoolConfig,
    ) -> Self {
        let permits = config.max_concurrent.max(1);
        Self {
            registry,
            backend,
            tools,
            monitor: Arc::new(AgentMonitor::new()),
            workers: RwLock::new(HashMap::new()),
            semaphore: Arc::new(Semaphore::new(permits)),
            config,
            initial_pheromone: 0.5,
        }
    }

    /// Reputation given to agents registered for the first time.
    pub fn with_initial_pheromone(mut self, score: f64) -> Self {
        self.initial_pheromone = score;
        self
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn monitor(&self) -> &Arc<AgentMonitor> {
        &self.monitor
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn max_concurrent(&self) -> usize {
        self.config.max_concurrent.max(1)
    }

    /// Dispatches currently holding a concurrency slot.
    pub fn active_count(&self) -> usize {
        self.max_concurrent() - self.semaphore.available_permits()
    }

    /// Register (or refresh) an agent and start a worker for it.
    ///
    /// A spec marked `disabled` is registered without a worker.
    pub async fn spawn(&self, spec: &AgentSpec) -> ConclaveResult<AgentState> {
        let tools = self.tools.resolve(&spec.tools)?;
        let state = self.registry.register(spec, self.initial_pheromone).await?;
        if state.status == AgentStatus::Disabled {
            self.workers.write().remove(&spec.id);
            info!(agent = %spec.id, "Agent registered as disabled");
            return Ok(state);
        }

        let mut workers = self.workers.write();
        let in_flight = workers
            .get(&spec.id)
            .map(|w| w.in_flight.clone())
            .unwrap_or_default();
        workers.insert(
            spec.id.clone(),
            Arc::new(Worker {
                system_prompt: spec.system_prompt.clone(),
                tools,
                model_config: spec.model.clone(),
                in_flight,
            }),
        );
        info!(agent = %spec.id, domains = ?state.specialty_domains, "Agent spawned");
        Ok(state)
    }

    /// Stop an agent's worker and mark it disabled. Its record is kept.
    pub async fn terminate(&self, agent_id: &str) -> ConclaveResult<()> {
        let removed = self.workers.write().remove(agent_id).is_some();
        let updated = self
            .registry
            .update_runtime(agent_id, |agent| {
                agent.status = AgentStatus::Disabled;
            })
            .is_some();
        if !removed && !updated {
            return Err(ConclaveError::NotFound(format!("agent {agent_id}")));
        }
        self.registry.persist(agent_id).await?;
        info!(agent = %agent_id, "Agent terminated");
        Ok(())
    }

    /// Whether the agent has a live worker and is not disabled.
    pub fn is_available(&self, agent_id: &str) -> bool {
        self.workers.read().contains_key(agent_id)
            && self
                .registry
                .get(agent_id)
                .is_some_and(|a| a.status != AgentStatus::Disabled)
    }

    /// All known agents with live status and metrics.
    pub async fn list(&self) -> Vec<AgentSummary> {
        let metrics = self.monitor.snapshot().await;
        let workers = self.workers.read();
        self.registry
            .snapshot()
            .into_iter()
            .map(|agent| {
                let worker = workers.get(&agent.id);
                AgentSummary {
                    spawned: worker.is_some(),
                    in_flight: worker.map_or(0, |w| w.in_flight.load(Ordering::SeqCst)),
                    metrics: metrics.get(&agent.id).cloned().unwrap_or_default(),
                    id: agent.id,
                    display_name: agent.display_name,
                    specialty_domains: agent.specialty_domains,
                    status: agent.status,
                    pheromone_score: agent.pheromone_score,
                    consecutive_failures: agent.consecutive_failures,
                    current_session_id: agent.current_session_id,
                    last_active_at: agent.last_active_at,
                }
            })
            .collect()
    }

    fn worker(&self, agent_id: &str) -> ConclaveResult<Arc<Worker>> {
        let worker = self
            .workers
            .read()
            .get(agent_id)
            .cloned()
            .ok_or_else(|| ConclaveError::NotFound(format!("agent {agent_id}")))?;
        match self.registry.get(agent_id) {
            Some(agent) if agent.status == AgentStatus::Disabled => Err(ConclaveError::Agent(
                format!("Agent {agent_id} is disabled"),
            )),
            Some(_) => Ok(worker),
            None => Err(ConclaveError::NotFound(format!("agent {agent_id}"))),
        }
    }

    /// Send one message to one agent and wait for its reply.
    ///
    /// Waits for a concurrency slot first. Cancellation is honoured both while
    /// queued and while running; the agent's status is reverted either way.
    pub async fn dispatch(&self, request: DispatchRequest) -> ConclaveResult<DispatchResult> {
        let worker = self.worker(&request.agent_id)?;
        let agent_id = request.agent_id.clone();
        let cancel = request.cancel.clone().unwrap_or_default();

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(ConclaveError::Cancelled(format!(
                    "dispatch to {agent_id} cancelled while queued"
                )));
            }
            permit = self.semaphore.clone().acquire_owned() => permit
                .map_err(|_| ConclaveError::Agent("agent pool is closed".into()))?,
        };

        let mut guard = BusyGuard::enter(
            self.registry.clone(),
            worker.in_flight.clone(),
            &agent_id,
            request.session_id,
        );
        self.persist_quietly(&agent_id).await;

        let timeout = request
            .timeout
            .unwrap_or(Duration::from_secs(self.config.dispatch_timeout_secs));
        let tools = request.tools.clone().unwrap_or_else(|| worker.tools.clone());
        let completion_request = self.build_request(&worker, &request, &tools, timeout);

        debug!(agent = %agent_id, session = ?request.session_id, "Dispatching");
        let started = Instant::now();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ConclaveError::Cancelled(format!(
                "dispatch to {agent_id} cancelled"
            ))),
            outcome = tokio::time::timeout(timeout, self.complete_with_tools(completion_request, &tools)) => {
                match outcome {
                    Ok(result) => result,
                    Err(_) => Err(ConclaveError::Timeout(format!(
                        "agent {agent_id} did not answer within {}s",
                        timeout.as_secs_f64()
                    ))),
                }
            }
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let kind = match &result {
            Ok(_) => DispatchKind::Success,
            Err(ConclaveError::Timeout(_)) => DispatchKind::Timeout,
            Err(ConclaveError::Cancelled(_)) => DispatchKind::Cancelled,
            Err(_) => DispatchKind::Failure,
        };
        guard.release(kind);
        drop(permit);
        self.persist_quietly(&agent_id).await;

        let tool_calls = result.as_ref().map_or(0, |(_, r)| r.len() as u64);
        self.monitor
            .record_dispatch(&agent_id, kind, duration_ms, tool_calls)
            .await;

        match result {
            Ok((text, tool_results)) => {
                info!(agent = %agent_id, duration_ms, tool_calls, "Dispatch completed");
                Ok(DispatchResult {
                    agent_id,
                    text,
                    tool_results,
                    duration_ms,
                })
            }
            Err(e) => {
                warn!(agent = %agent_id, duration_ms, error = %e, "Dispatch failed");
                Err(e)
            }
        }
    }

    fn build_request(
        &self,
        worker: &Worker,
        request: &DispatchRequest,
        tools: &[Arc<dyn Tool>],
        timeout: Duration,
    ) -> CompletionRequest {
        let mut messages = request.context.clone();
        let mut message = Message::user(request.message.clone());
        if let Some(session_id) = request.session_id {
            message = message.in_session(session_id);
        }
        messages.push(message);
        CompletionRequest {
            agent_id: Some(request.agent_id.clone()),
            system_prompt: worker.system_prompt.clone(),
            messages,
            tools: tools.iter().map(|t| t.descriptor().clone()).collect(),
            model_config: worker.model_config.clone(),
            timeout,
        }
    }

    async fn complete_with_tools(
        &self,
        request: CompletionRequest,
        tools: &[Arc<dyn Tool>],
    ) -> ConclaveResult<(String, Vec<ToolResult>)> {
        let completion = self.backend.complete(request).await?;
        let mut results = Vec::with_capacity(completion.tool_calls.len());
        for call in &completion.tool_calls {
            debug!(tool = %call.name, call_id = %call.id, "Executing tool call");
            results.push(execute_call(tools, call).await);
        }
        Ok((completion.text, results))
    }

    async fn persist_quietly(&self, agent_id: &str) {
        if let Err(e) = self.registry.persist(agent_id).await {
            warn!(agent = %agent_id, error = %e, "Failed to persist agent state");
        }
    }

    /// Run a batch of dispatches concurrently, bounded by the pool limit.
    ///
    /// One task failing does not affect the others.
    pub async fn run_parallel(&self, tasks: Vec<DispatchRequest>) -> BatchResult {
        self.run_parallel_with(tasks, |_| {}).await
    }

    /// Like [`AgentPool::run_parallel`], calling `on_complete` as each task
    /// finishes, in completion order.
    pub async fn run_parallel_with<F>(
        &self,
        tasks: Vec<DispatchRequest>,
        mut on_complete: F,
    ) -> BatchResult
    where
        F: FnMut(&TaskOutcome),
    {
        let total = tasks.len();
        let mut pending: FuturesUnordered<_> = tasks
            .into_iter()
            .enumerate()
            .map(|(index, request)| async move {
                let agent_id = request.agent_id.clone();
                let result = self.dispatch(request).await;
                TaskOutcome {
                    index,
                    agent_id,
                    result,
                }
            })
            .collect();

        let mut outcomes = Vec::with_capacity(total);
        while let Some(outcome) = pending.next().await {
            on_complete(&outcome);
            outcomes.push(outcome);
        }
        outcomes.sort_by_key(|o| o.index);
        BatchResult { outcomes }
    }
}
