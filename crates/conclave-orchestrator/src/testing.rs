//! Deterministic completion backend for tests and offline demos.

use crate::pool::{AgentPool, PoolConfig};
use crate::registry::{AgentRegistry, MemoryAgentStore};
use crate::router::{Router, RouterConfig};
use crate::types::AgentSpec;
use async_trait::async_trait;
use conclave_agent::{Completion, CompletionBackend, CompletionRequest};
use conclave_core::{ConclaveError, ConclaveResult, ToolRegistry};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

type Responder = Arc<dyn Fn(&str, &CompletionRequest) -> Option<Completion> + Send + Sync>;

/// A call observed by [`ScriptedBackend`].
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub agent_id: String,
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub tools: Vec<String>,
}

/// Backend whose answers are scripted per agent.
///
/// Resolution order for each call: delay, forced failure, queued completion,
/// responder, fixed reply, then an echo of the form `"{agent}: {prompt}"`.
#[derive(Default)]
pub struct ScriptedBackend {
    queued: Mutex<HashMap<String, VecDeque<Completion>>>,
    replies: Mutex<HashMap<String, String>>,
    fail_counts: Mutex<HashMap<String, u32>>,
    always_fail: Mutex<HashSet<String>>,
    delays: Mutex<HashMap<String, Duration>>,
    responder: Mutex<Option<Responder>>,
    calls: Mutex<Vec<RecordedCall>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always answer `text` for this agent.
    pub fn reply(&self, agent_id: &str, text: impl Into<String>) {
        self.replies.lock().insert(agent_id.to_string(), text.into());
    }

    /// Queue answers consumed in order before falling back to other rules.
    pub fn script<I, S>(&self, agent_id: &str, texts: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut queued = self.queued.lock();
        let queue = queued.entry(agent_id.to_string()).or_default();
        queue.extend(texts.into_iter().map(Completion::text));
    }

    /// Queue a full completion, e.g. one carrying tool calls.
    pub fn push_completion(&self, agent_id: &str, completion: Completion) {
        self.queued
            .lock()
            .entry(agent_id.to_string())
            .or_default()
            .push_back(completion);
    }

    /// Fail the next `count` calls for this agent.
    pub fn fail_next(&self, agent_id: &str, count: u32) {
        self.fail_counts.lock().insert(agent_id.to_string(), count);
    }

    pub fn fail_always(&self, agent_id: &str) {
        self.always_fail.lock().insert(agent_id.to_string());
    }

    pub fn recover(&self, agent_id: &str) {
        self.always_fail.lock().remove(agent_id);
        self.fail_counts.lock().remove(agent_id);
    }

    pub fn set_delay(&self, agent_id: &str, delay: Duration) {
        self.delays.lock().insert(agent_id.to_string(), delay);
    }

    /// Compute answers from the agent id and request. `None` falls through.
    pub fn respond_with<F>(&self, responder: F)
    where
        F: Fn(&str, &CompletionRequest) -> Option<Completion> + Send + Sync + 'static,
    {
        *self.responder.lock() = Some(Arc::new(responder));
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self, agent_id: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.agent_id == agent_id)
            .count()
    }

    /// Highest number of calls that were in progress at the same time.
    pub fn max_observed_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn should_fail(&self, agent_id: &str) -> bool {
        if self.always_fail.lock().contains(agent_id) {
            return true;
        }
        let mut counts = self.fail_counts.lock();
        match counts.get_mut(agent_id) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl CompletionBackend for ScriptedBackend {
    async fn complete(&self, request: CompletionRequest) -> ConclaveResult<Completion> {
        let agent_id = request.agent_id.clone().unwrap_or_default();
        self.calls.lock().push(RecordedCall {
            agent_id: agent_id.clone(),
            prompt: request.last_content().to_string(),
            system_prompt: request.system_prompt.clone(),
            tools: request.tools.iter().map(|t| t.name.clone()).collect(),
        });

        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        let _active = ActiveGuard(&self.active);

        let delay = self.delays.lock().get(&agent_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.should_fail(&agent_id) {
            return Err(ConclaveError::Backend(format!(
                "scripted failure for {agent_id}"
            )));
        }

        let queued = self
            .queued
            .lock()
            .get_mut(&agent_id)
            .and_then(VecDeque::pop_front);
        if let Some(completion) = queued {
            return Ok(completion);
        }

        let responder = self.responder.lock().clone();
        if let Some(responder) = responder {
            if let Some(completion) = responder(&agent_id, &request) {
                return Ok(completion);
            }
        }

        if let Some(text) = self.replies.lock().get(&agent_id).cloned() {
            return Ok(Completion::text(text));
        }

        Ok(Completion::text(format!(
            "{agent_id}: {}",
            request.last_content()
        )))
    }
}

/// A pool and router over in-memory stores with every spec spawned.
pub async fn fixture(
    backend: Arc<ScriptedBackend>,
    specs: &[AgentSpec],
    max_concurrent: usize,
) -> ConclaveResult<(Arc<AgentPool>, Arc<Router>)> {
    let registry = Arc::new(AgentRegistry::load(Arc::new(MemoryAgentStore::new())).await?);
    let pool = Arc::new(AgentPool::new(
        registry.clone(),
        backend,
        Arc::new(ToolRegistry::new()),
        PoolConfig {
            max_concurrent,
            dispatch_timeout_secs: 5,
        },
    ));
    for spec in specs {
        pool.spawn(spec).await?;
    }
    let router = Arc::new(Router::new(registry, pool.clone(), RouterConfig::default())?);
    Ok((pool, router))
}
